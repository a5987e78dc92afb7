//! Correlation matrix reordered by hierarchical clustering.

use serde_json::{json, Value};
use tracing::debug;

use super::correlation::{kendall, pearson, spearman};
use super::ExecutionContext;
use crate::error::AnalysisError;
use crate::options::{ClusterDetection, ClusterOptions, CorrelationMethod, Linkage};
use crate::registry::{MethodId, RoleName};
use crate::result::{json_number, AnalysisResult};
use crate::stats::distributions::Alternative;

/// Most variables a matrix may hold.
pub const MAX_VARIABLES: usize = 50;

/// One agglomeration step: clusters `left` and `right` merged at
/// `distance` into a cluster of `size` leaves. Leaves are `0..n`, the
/// cluster formed at step `i` is `n + i`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub distance: f64,
    pub size: usize,
}

/// Agglomerative clustering of a symmetric distance matrix.
pub fn linkage(distances: &[Vec<f64>], method: Linkage) -> Vec<Merge> {
    let n = distances.len();
    let mut d: Vec<Vec<f64>> = distances.to_vec();
    let mut active: Vec<bool> = vec![true; n];
    let mut ids: Vec<usize> = (0..n).collect();
    let mut sizes: Vec<usize> = vec![1; n];
    let mut merges = Vec::with_capacity(n.saturating_sub(1));

    for step in 0..n.saturating_sub(1) {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            for j in (i + 1)..n {
                if !active[j] {
                    continue;
                }
                if best.map(|(_, _, b)| d[i][j] < b).unwrap_or(true) {
                    best = Some((i, j, d[i][j]));
                }
            }
        }
        let Some((i, j, dist)) = best else {
            break;
        };
        let (ni, nj) = (sizes[i] as f64, sizes[j] as f64);
        for k in 0..n {
            if !active[k] || k == i || k == j {
                continue;
            }
            let nk = sizes[k] as f64;
            let (dik, djk) = (d[i][k], d[j][k]);
            let updated = match method {
                Linkage::Single => dik.min(djk),
                Linkage::Complete => dik.max(djk),
                Linkage::Average => (ni * dik + nj * djk) / (ni + nj),
                Linkage::Weighted => (dik + djk) / 2.0,
                Linkage::Ward => (((ni + nk) * dik * dik + (nj + nk) * djk * djk - nk * dist * dist)
                    / (ni + nj + nk))
                    .max(0.0)
                    .sqrt(),
            };
            d[i][k] = updated;
            d[k][i] = updated;
        }
        let (a, b) = (ids[i].min(ids[j]), ids[i].max(ids[j]));
        sizes[i] += sizes[j];
        merges.push(Merge {
            left: a,
            right: b,
            distance: dist,
            size: sizes[i],
        });
        ids[i] = n + step;
        active[j] = false;
    }
    merges
}

/// Leaves in dendrogram order, left child first.
pub fn leaf_order(merges: &[Merge], n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let mut order = Vec::with_capacity(n);
    let mut stack = vec![if merges.is_empty() { 0 } else { n + merges.len() - 1 }];
    while let Some(node) = stack.pop() {
        if node < n {
            order.push(node);
        } else {
            let m = merges[node - n];
            stack.push(m.right);
            stack.push(m.left);
        }
    }
    order
}

/// Dendrogram segments in the `icoord`/`dcoord` layout, one entry per merge.
pub fn dendrogram(merges: &[Merge], order: &[usize]) -> (Vec<[f64; 4]>, Vec<[f64; 4]>) {
    let n = order.len();
    let mut x = vec![0.0; n + merges.len()];
    let mut h = vec![0.0; n + merges.len()];
    for (position, &leaf) in order.iter().enumerate() {
        x[leaf] = 5.0 + 10.0 * position as f64;
    }
    let mut icoord = Vec::with_capacity(merges.len());
    let mut dcoord = Vec::with_capacity(merges.len());
    for (step, m) in merges.iter().enumerate() {
        let (l, r) = if x[m.left] <= x[m.right] {
            (m.left, m.right)
        } else {
            (m.right, m.left)
        };
        icoord.push([x[l], x[l], x[r], x[r]]);
        dcoord.push([h[l], m.distance, m.distance, h[r]]);
        x[n + step] = (x[l] + x[r]) / 2.0;
        h[n + step] = m.distance;
    }
    (icoord, dcoord)
}

fn find(parent: &mut [usize], i: usize) -> usize {
    let mut root = i;
    while parent[root] != root {
        root = parent[root];
    }
    let mut node = i;
    while parent[node] != root {
        let next = parent[node];
        parent[node] = root;
        node = next;
    }
    root
}

/// Flat cluster labels after applying the first `steps` merges. Labels
/// start at 1 and follow `order`.
pub fn cut(merges: &[Merge], n: usize, steps: usize, order: &[usize]) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..n + merges.len()).collect();
    for (step, m) in merges.iter().take(steps).enumerate() {
        parent[m.left] = n + step;
        parent[m.right] = n + step;
    }
    let roots: Vec<usize> = (0..n).map(|i| find(&mut parent, i)).collect();
    let mut labels = vec![0; n];
    let mut seen: Vec<usize> = Vec::new();
    for &leaf in order {
        let root = roots[leaf];
        let label = match seen.iter().position(|r| *r == root) {
            Some(p) => p + 1,
            None => {
                seen.push(root);
                seen.len()
            }
        };
        labels[leaf] = label;
    }
    labels
}

/// Mean silhouette width of a labelling.
pub fn silhouette(distances: &[Vec<f64>], labels: &[usize]) -> f64 {
    let n = labels.len();
    let k = labels.iter().copied().max().unwrap_or(0);
    if n == 0 || k < 2 {
        return 0.0;
    }
    let total: f64 = (0..n)
        .map(|i| {
            let mut sums = vec![0.0; k + 1];
            let mut counts = vec![0usize; k + 1];
            for j in (0..n).filter(|&j| j != i) {
                sums[labels[j]] += distances[i][j];
                counts[labels[j]] += 1;
            }
            let own = labels[i];
            if counts[own] == 0 {
                return 0.0;
            }
            let a = sums[own] / counts[own] as f64;
            let b = (1..=k)
                .filter(|&c| c != own && counts[c] > 0)
                .map(|c| sums[c] / counts[c] as f64)
                .fold(f64::INFINITY, f64::min);
            let denom = a.max(b);
            if denom > 0.0 && b.is_finite() {
                (b - a) / denom
            } else {
                0.0
            }
        })
        .sum();
    total / n as f64
}

/// Number of clusters chosen by the largest gap between merge distances.
pub fn elbow(merges: &[Merge], n: usize, max_clusters: usize) -> usize {
    let upper = max_clusters.min(n.saturating_sub(1));
    (2..=upper)
        .map(|k| {
            let gap = merges[n - k].distance - merges[n - k - 1].distance;
            (k, gap)
        })
        .fold(None, |best: Option<(usize, f64)>, (k, gap)| match best {
            Some((_, g)) if g >= gap => best,
            _ => Some((k, gap)),
        })
        .map(|(k, _)| k)
        .unwrap_or(1)
}

fn correlation_matrix(
    columns: &[Vec<f64>],
    names: &[String],
    method: CorrelationMethod,
) -> Result<Vec<Vec<f64>>, AnalysisError> {
    let p = columns.len();
    let mut r = vec![vec![1.0; p]; p];
    for i in 0..p {
        for j in (i + 1)..p {
            let c = match method {
                CorrelationMethod::Pearson => pearson(&columns[i], &columns[j], Alternative::TwoSided),
                CorrelationMethod::Spearman => spearman(&columns[i], &columns[j], Alternative::TwoSided),
                CorrelationMethod::Kendall => kendall(&columns[i], &columns[j], Alternative::TwoSided),
            }?;
            if !c.coefficient.is_finite() {
                return Err(AnalysisError::ZeroVariance(format!(
                    "correlation of '{}' and '{}' is undefined",
                    names[i], names[j]
                )));
            }
            r[i][j] = c.coefficient;
            r[j][i] = c.coefficient;
        }
    }
    Ok(r)
}

fn mean_abs_off_diagonal(r: &[Vec<f64>], members: &[usize]) -> Option<f64> {
    let mut total = 0.0;
    let mut count = 0;
    for (a, &i) in members.iter().enumerate() {
        for &j in &members[a + 1..] {
            total += r[i][j].abs();
            count += 1;
        }
    }
    (count > 0).then(|| total / count as f64)
}

/// Execute the clustered correlation matrix.
pub fn execute(ctx: &ExecutionContext<'_>, options: &ClusterOptions) -> Result<AnalysisResult, AnalysisError> {
    ctx.roles.require(RoleName::Variables)?;
    let names = ctx.roles.variables.clone();
    let p = names.len();
    if p < 2 {
        return Err(AnalysisError::InvalidOption(
            "clustered correlation needs at least 2 variables".to_string(),
        ));
    }
    if p > MAX_VARIABLES {
        return Err(AnalysisError::InvalidOption(format!(
            "clustered correlation accepts at most {} variables, got {}",
            MAX_VARIABLES, p
        )));
    }
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let rows = ctx.dataset.complete_rows(&refs)?;
    let columns: Vec<Vec<f64>> = refs
        .iter()
        .map(|name| {
            let values = ctx.dataset.numeric(name)?;
            Ok(rows.iter().filter_map(|&r| values[r]).collect())
        })
        .collect::<Result<_, AnalysisError>>()?;

    let r = correlation_matrix(&columns, &names, options.correlation_method)?;
    let distances: Vec<Vec<f64>> = r
        .iter()
        .enumerate()
        .map(|(i, row)| {
            row.iter()
                .enumerate()
                .map(|(j, v)| if i == j { 0.0 } else { 1.0 - v.abs() })
                .collect()
        })
        .collect();
    let merges = linkage(&distances, options.linkage);
    let order = leaf_order(&merges, p);

    let mut warnings = Vec::new();
    let steps = if let Some(k) = options.n_clusters {
        if k > p {
            warnings.push(format!(
                "Requested {} clusters but only {} variables; using {}",
                k, p, p
            ));
        }
        p - k.min(p)
    } else if let Some(threshold) = options.distance_threshold {
        merges.iter().take_while(|m| m.distance <= threshold).count()
    } else {
        let k = match options.detection {
            ClusterDetection::Elbow => elbow(&merges, p, options.max_clusters),
            ClusterDetection::Silhouette => {
                let upper = options.max_clusters.min(p.saturating_sub(1));
                (2..=upper)
                    .map(|k| (k, silhouette(&distances, &cut(&merges, p, p - k, &order))))
                    .fold(None, |best: Option<(usize, f64)>, (k, s)| match best {
                        Some((_, b)) if b >= s => best,
                        _ => Some((k, s)),
                    })
                    .map(|(k, _)| k)
                    .unwrap_or(1)
            }
        };
        p - k
    };
    let labels = cut(&merges, p, steps, &order);
    let n_clusters = labels.iter().copied().max().unwrap_or(0);
    debug!(variables = p, n_clusters, "clustered correlation");

    let ordered: Vec<String> = order.iter().map(|&i| names[i].clone()).collect();
    let reordered: Vec<Vec<Value>> = order
        .iter()
        .map(|&i| order.iter().map(|&j| json_number(r[i][j])).collect())
        .collect();
    let clusters: Vec<Value> = (1..=n_clusters)
        .map(|c| {
            let members: Vec<usize> = order.iter().copied().filter(|&i| labels[i] == c).collect();
            let matrix: Vec<Vec<Value>> = members
                .iter()
                .map(|&i| members.iter().map(|&j| json_number(r[i][j])).collect())
                .collect();
            json!({
                "cluster": c,
                "variables": members.iter().map(|&i| names[i].clone()).collect::<Vec<_>>(),
                "mean_abs_correlation": mean_abs_off_diagonal(&r, &members).map(json_number).unwrap_or_default(),
                "matrix": matrix,
            })
        })
        .collect();
    let (icoord, dcoord) = dendrogram(&merges, &order);
    let linkage_rows: Vec<Value> = merges
        .iter()
        .map(|m| json!([m.left, m.right, json_number(m.distance), m.size]))
        .collect();
    let all: Vec<usize> = (0..p).collect();
    let overall = mean_abs_off_diagonal(&r, &all).unwrap_or(0.0);

    let mut result = AnalysisResult::new(
        MethodId::ClusteredCorrelation,
        MethodId::ClusteredCorrelation.display_name(),
    )
    .with_effect_size("mean_abs_correlation", overall, None)
    .with_extra("correlation_method", json!(options.correlation_method))
    .with_extra("linkage_method", json!(options.linkage))
    .with_extra("variables", json!(ordered))
    .with_extra("matrix", json!(reordered))
    .with_extra("n_clusters", n_clusters)
    .with_extra(
        "assignments",
        Value::Object(
            names
                .iter()
                .zip(&labels)
                .map(|(name, label)| (name.clone(), json!(label)))
                .collect(),
        ),
    )
    .with_extra("clusters", Value::Array(clusters))
    .with_extra("linkage", Value::Array(linkage_rows))
    .with_extra(
        "dendrogram",
        json!({"icoord": icoord, "dcoord": dcoord, "leaves": order, "labels": ordered}),
    )
    .with_extra("n_obs", rows.len());
    result.plot_data = order
        .iter()
        .flat_map(|&i| {
            order.iter().map(move |&j| (i, j))
        })
        .map(|(i, j)| json!({"x": names[j], "y": names[i], "r": json_number(r[i][j])}))
        .collect();
    result.groups = ordered;
    if rows.len() < 10 {
        warnings.push(format!(
            "Only {} complete observation(s); correlations are unstable",
            rows.len()
        ));
    }
    for w in warnings {
        result.warn(w);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, Dataset};
    use crate::options::AnalysisDefaults;
    use crate::registry::ColumnRoles;

    fn distances() -> Vec<Vec<f64>> {
        // {0, 1} close, {2, 3} close, the pairs far apart
        vec![
            vec![0.0, 0.1, 0.8, 0.9],
            vec![0.1, 0.0, 0.7, 0.85],
            vec![0.8, 0.7, 0.0, 0.2],
            vec![0.9, 0.85, 0.2, 0.0],
        ]
    }

    #[test]
    fn test_average_linkage() {
        let merges = linkage(&distances(), Linkage::Average);
        assert_eq!(merges.len(), 3);
        assert_eq!((merges[0].left, merges[0].right), (0, 1));
        assert_eq!((merges[1].left, merges[1].right), (2, 3));
        assert_eq!((merges[2].left, merges[2].right), (4, 5));
        // mean of the four cross distances
        assert!((merges[2].distance - 0.8125).abs() < 1e-12);
        assert_eq!(merges[2].size, 4);
    }

    #[test]
    fn test_single_and_complete_linkage() {
        let single = linkage(&distances(), Linkage::Single);
        assert!((single[2].distance - 0.7).abs() < 1e-12);
        let complete = linkage(&distances(), Linkage::Complete);
        assert!((complete[2].distance - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_leaves_and_coordinates() {
        let merges = linkage(&distances(), Linkage::Average);
        let order = leaf_order(&merges, 4);
        assert_eq!(order, vec![0, 1, 2, 3]);
        let (icoord, dcoord) = dendrogram(&merges, &order);
        assert_eq!(icoord[0], [5.0, 5.0, 15.0, 15.0]);
        assert_eq!(icoord[2], [10.0, 10.0, 30.0, 30.0]);
        assert_eq!(dcoord[2][0], 0.1);
        assert_eq!(dcoord[2][3], 0.2);
    }

    #[test]
    fn test_cut_and_detection() {
        let d = distances();
        let merges = linkage(&d, Linkage::Average);
        let order = leaf_order(&merges, 4);
        assert_eq!(cut(&merges, 4, 2, &order), vec![1, 1, 2, 2]);
        assert_eq!(cut(&merges, 4, 0, &order), vec![1, 2, 3, 4]);
        assert_eq!(elbow(&merges, 4, 10), 2);
        let s2 = silhouette(&d, &cut(&merges, 4, 2, &order));
        let s3 = silhouette(&d, &cut(&merges, 4, 1, &order));
        assert!(s2 > s3);
    }

    #[test]
    fn test_execute_groups_related_variables() {
        let base = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let other = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0, 5.0, 3.0, 5.0, 8.0];
        let ds = Dataset::new("vars")
            .with_column("a", Column::numeric(base))
            .unwrap()
            .with_column("b", Column::numeric(base.iter().map(|v| v * 2.0 + 0.1 * (v % 3.0))))
            .unwrap()
            .with_column("c", Column::numeric(other))
            .unwrap()
            .with_column("d", Column::numeric(other.iter().map(|v| -v + 0.2 * (v % 2.0))))
            .unwrap();
        let roles = ColumnRoles {
            variables: vec!["a".into(), "c".into(), "b".into(), "d".into()],
            ..ColumnRoles::default()
        };
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let options = ClusterOptions {
            n_clusters: Some(2),
            ..ClusterOptions::default()
        };
        let result = execute(&ctx, &options).unwrap();
        assert_eq!(result.extra["n_clusters"], 2);
        let assignments = &result.extra["assignments"];
        assert_eq!(assignments["a"], assignments["b"]);
        assert_eq!(assignments["c"], assignments["d"]);
        assert_ne!(assignments["a"], assignments["c"]);
        assert_eq!(result.plot_data.len(), 16);
    }

    #[test]
    fn test_too_many_variables() {
        let roles = ColumnRoles {
            variables: (0..51).map(|i| format!("v{}", i)).collect(),
            ..ColumnRoles::default()
        };
        let ds = Dataset::new("empty");
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let err = execute(&ctx, &ClusterOptions::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidOption(_)));
    }
}
