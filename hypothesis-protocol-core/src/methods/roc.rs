//! ROC curve, AUC with a bootstrap interval, and the Youden threshold.

use serde_json::json;
use tracing::debug;

use super::ExecutionContext;
use crate::error::AnalysisError;
use crate::options::{CommonOptions, RocOptions};
use crate::registry::{MethodId, RoleName};
use crate::result::{json_number, AnalysisResult};
use crate::stats::descriptive::std_dev;
use crate::stats::distributions::{z_p_value, Alternative};
use crate::stats::resample::{bootstrap_indices, percentile_interval, seeded_rng};

/// Most points kept in the plotted curve.
pub const MAX_CURVE_POINTS: usize = 500;

/// One operating point of the curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RocPoint {
    pub fpr: f64,
    pub tpr: f64,
    /// Scores `>= threshold` are called positive; `None` for the origin.
    pub threshold: Option<f64>,
}

/// Full ROC curve from scores and positive-class flags, starting at (0, 0).
pub fn roc_curve(scores: &[f64], positive: &[bool]) -> Vec<RocPoint> {
    let n_pos = positive.iter().filter(|p| **p).count() as f64;
    let n_neg = positive.len() as f64 - n_pos;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut points = vec![RocPoint {
        fpr: 0.0,
        tpr: 0.0,
        threshold: None,
    }];
    let (mut tp, mut fp) = (0.0, 0.0);
    for (k, &i) in order.iter().enumerate() {
        if positive[i] {
            tp += 1.0;
        } else {
            fp += 1.0;
        }
        let last_of_tie = order
            .get(k + 1)
            .map(|&next| scores[next] != scores[i])
            .unwrap_or(true);
        if last_of_tie {
            points.push(RocPoint {
                fpr: fp / n_neg,
                tpr: tp / n_pos,
                threshold: Some(scores[i]),
            });
        }
    }
    points
}

/// Trapezoidal area under the curve.
pub fn auc(points: &[RocPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| (w[1].fpr - w[0].fpr) * (w[1].tpr + w[0].tpr) / 2.0)
        .sum()
}

/// Keep at most [`MAX_CURVE_POINTS`] points with a fixed stride, always
/// including the final point.
pub fn downsample(points: &[RocPoint]) -> Vec<RocPoint> {
    if points.len() <= MAX_CURVE_POINTS {
        return points.to_vec();
    }
    let stride = (points.len() - 1).div_ceil(MAX_CURVE_POINTS - 1);
    let mut kept: Vec<RocPoint> = points.iter().step_by(stride).copied().collect();
    if let Some(last) = points.last() {
        if kept.last() != Some(last) {
            kept.push(*last);
        }
    }
    kept
}

/// Point maximising `tpr - fpr`.
pub fn youden(points: &[RocPoint]) -> Option<RocPoint> {
    points
        .iter()
        .filter(|p| p.threshold.is_some())
        .copied()
        .fold(None, |best: Option<RocPoint>, p| match best {
            Some(b) if b.tpr - b.fpr >= p.tpr - p.fpr => Some(b),
            _ => Some(p),
        })
}

/// Execute ROC analysis.
pub fn execute(ctx: &ExecutionContext<'_>, options: &RocOptions) -> Result<AnalysisResult, AnalysisError> {
    let alpha = options.alpha(ctx.defaults);
    let level = options.confidence_level(ctx.defaults);
    let score_name = ctx.roles.require(RoleName::Target)?;
    let class_name = ctx.roles.require(RoleName::Group)?;
    let rows = ctx.dataset.complete_rows(&[score_name, class_name])?;
    let scores_col = ctx.dataset.column(score_name)?;
    let classes_col = ctx.dataset.column(class_name)?;

    let labels = ctx.dataset.distinct_labels(class_name)?;
    if labels.len() != 2 {
        return Err(if labels.len() < 2 {
            AnalysisError::InsufficientGroups {
                found: labels.len(),
                required: 2,
            }
        } else {
            AnalysisError::InvalidOption(format!(
                "ROC analysis needs exactly two outcome classes, found {}",
                labels.len()
            ))
        });
    }
    let positive_label = match &options.positive_class {
        Some(label) if labels.contains(label) => label.clone(),
        Some(label) => {
            return Err(AnalysisError::InvalidOption(format!(
                "positive_class '{}' is not one of {:?}",
                label, labels
            )))
        }
        None => labels[1].clone(),
    };
    let negative_label = labels
        .iter()
        .find(|l| **l != positive_label)
        .cloned()
        .unwrap_or_default();

    let (scores, positive): (Vec<f64>, Vec<bool>) = rows
        .iter()
        .filter_map(|&r| Some((scores_col.number(r)?, classes_col.label(r)? == positive_label)))
        .unzip();
    let n_pos = positive.iter().filter(|p| **p).count();
    let n_neg = positive.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(AnalysisError::InsufficientGroups { found: 1, required: 2 });
    }

    let curve = roc_curve(&scores, &positive);
    let area = auc(&curve);
    let best = youden(&curve);

    let resamples = options.bootstrap_resamples(ctx.defaults);
    let mut rng = seeded_rng(options.seed(ctx.defaults));
    let boot: Vec<f64> = (0..resamples)
        .filter_map(|_| {
            let idx = bootstrap_indices(scores.len(), &mut rng);
            let s: Vec<f64> = idx.iter().map(|&i| scores[i]).collect();
            let p: Vec<bool> = idx.iter().map(|&i| positive[i]).collect();
            let both = p.iter().any(|x| *x) && p.iter().any(|x| !*x);
            both.then(|| auc(&roc_curve(&s, &p)))
        })
        .collect();
    let discarded = resamples - boot.len();
    debug!(resamples, discarded, "ROC bootstrap");
    let sd = std_dev(&boot);
    let p_value = if sd > 0.0 {
        z_p_value((area - 0.5) / sd, Alternative::TwoSided)
    } else if area == 0.5 {
        1.0
    } else {
        0.0
    };
    let ci = percentile_interval(boot, level);

    let mut result = AnalysisResult::new(MethodId::RocAnalysis, MethodId::RocAnalysis.display_name())
        .with_test(area, p_value, alpha)
        .with_effect_size("auc", area, ci.map(|(l, h)| (Some(l), Some(h))))
        .with_extra("positive_class", positive_label.as_str())
        .with_extra("n_positive", n_pos)
        .with_extra("n_negative", n_neg)
        .with_extra("bootstrap_resamples", resamples)
        .with_extra("bootstrap_discarded", discarded)
        .with_extra("auc_se", json_number(sd));
    if let Some(point) = best {
        result = result
            .with_extra("youden_threshold", point.threshold.map(json_number).unwrap_or_default())
            .with_extra("youden_index", json_number(point.tpr - point.fpr))
            .with_extra("sensitivity", json_number(point.tpr))
            .with_extra("specificity", json_number(1.0 - point.fpr));
    }
    result.groups = vec![negative_label, positive_label];
    result.plot_data = downsample(&curve)
        .into_iter()
        .map(|p| {
            json!({
                "fpr": p.fpr,
                "tpr": p.tpr,
                "threshold": p.threshold.map(json_number).unwrap_or_default(),
            })
        })
        .collect();
    if discarded > 0 {
        result.warn(format!(
            "{} bootstrap resample(s) lost a class and were discarded",
            discarded
        ));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, Dataset};
    use crate::options::AnalysisDefaults;
    use crate::registry::ColumnRoles;

    #[test]
    fn test_perfect_separation() {
        let curve = roc_curve(&[0.1, 0.2, 0.8, 0.9], &[false, false, true, true]);
        assert_eq!(auc(&curve), 1.0);
        let best = youden(&curve).unwrap();
        assert_eq!(best.threshold, Some(0.8));
        assert_eq!(best.tpr - best.fpr, 1.0);
    }

    #[test]
    fn test_auc_with_ties() {
        // One tie across classes contributes half a pair: (3 + 0.5) / 4
        let curve = roc_curve(&[0.1, 0.5, 0.5, 0.9], &[false, false, true, true]);
        assert!((auc(&curve) - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_downsample_keeps_last_point() {
        let points: Vec<RocPoint> = (0..=1200)
            .map(|i| RocPoint {
                fpr: i as f64 / 1200.0,
                tpr: i as f64 / 1200.0,
                threshold: Some(i as f64),
            })
            .collect();
        let kept = downsample(&points);
        assert!(kept.len() <= MAX_CURVE_POINTS);
        assert_eq!(kept.first(), points.first());
        assert_eq!(kept.last(), points.last());
    }

    #[test]
    fn test_execute() {
        let scores = [0.1, 0.3, 0.35, 0.4, 0.6, 0.5, 0.7, 0.8, 0.9, 0.95];
        let classes = ["no", "no", "no", "no", "no", "yes", "yes", "yes", "yes", "yes"];
        let ds = Dataset::new("roc")
            .with_column("score", Column::numeric(scores))
            .unwrap()
            .with_column("outcome", Column::categorical(classes))
            .unwrap();
        let roles = ColumnRoles::grouped("score", "outcome");
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let result = execute(&ctx, &RocOptions::default()).unwrap();
        assert!((result.stat_value.unwrap() - 0.96).abs() < 1e-12);
        assert_eq!(result.extra["positive_class"], "yes");
        assert_eq!(result.groups, vec!["no", "yes"]);
        let (lo, hi) = (result.effect_size_ci_low.unwrap(), result.effect_size_ci_high.unwrap());
        assert!(lo <= hi && hi <= 1.0);
        let again = execute(&ctx, &RocOptions::default()).unwrap();
        assert_eq!(result, again);
    }
}
