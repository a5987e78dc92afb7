//! Two-group comparisons: Student, Welch and paired t-tests, Mann-Whitney U
//! and Wilcoxon signed-rank.

use serde_json::json;
use tracing::debug;

use super::{at_most, usable_groups, ExecutionContext};
use crate::assumptions::{check_normality, AssumptionReport, GroupNormality};
use crate::error::AnalysisError;
use crate::options::{CommonOptions, CompareOptions};
use crate::registry::{MethodId, RoleName};
use crate::result::{json_number, AnalysisResult};
use crate::stats::descriptive::{mean, median, rank, sorted, std_dev, tie_term, variance};
use crate::stats::distributions::{
    clamp_p, normal_cdf, normal_sf, t_interval, t_p_value, z_critical, Alternative,
};
use crate::stats::resample::{bootstrap_sample, bootstrap_two_sample, percentile_interval, seeded_rng};

/// Largest group size for the exact Mann-Whitney distribution.
pub const MANN_WHITNEY_EXACT_MAX: usize = 10;
/// Largest number of non-zero differences for the exact Wilcoxon distribution.
pub const WILCOXON_EXACT_MAX: usize = 50;

/// Outcome of a t-test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TTest {
    pub t: f64,
    pub df: f64,
    pub p_value: f64,
    /// Mean difference (`a - b`, or mean of paired differences).
    pub diff: f64,
    pub se: f64,
}

/// Outcome of a rank test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankTest {
    pub statistic: f64,
    pub p_value: f64,
    /// Normal-approximation z, absent for the exact distribution.
    pub z: Option<f64>,
    pub exact: bool,
    /// Rank-biserial correlation, positive when `a` tends to exceed `b`.
    pub rank_biserial: f64,
}

/// Independent-samples t-test, pooled (`equal_var`) or Welch.
///
/// # Errors
///
/// Fails when either sample has fewer than two observations or both have
/// zero variance.
pub fn independent_t(
    a: &[f64],
    b: &[f64],
    equal_var: bool,
    alternative: Alternative,
) -> Result<TTest, AnalysisError> {
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    if a.len() < 2 || b.len() < 2 {
        return Err(AnalysisError::InsufficientData(
            "each group needs at least two observations".to_string(),
        ));
    }
    let (v1, v2) = (variance(a), variance(b));
    let (se, df) = if equal_var {
        let pooled = ((n1 - 1.0) * v1 + (n2 - 1.0) * v2) / (n1 + n2 - 2.0);
        ((pooled * (1.0 / n1 + 1.0 / n2)).sqrt(), n1 + n2 - 2.0)
    } else {
        let (q1, q2) = (v1 / n1, v2 / n2);
        let df = (q1 + q2).powi(2) / (q1 * q1 / (n1 - 1.0) + q2 * q2 / (n2 - 1.0));
        ((q1 + q2).sqrt(), df)
    };
    if se == 0.0 || !se.is_finite() {
        return Err(AnalysisError::ZeroVariance(
            "both groups are constant".to_string(),
        ));
    }
    let diff = mean(a) - mean(b);
    let t = diff / se;
    Ok(TTest {
        t,
        df,
        p_value: t_p_value(t, df, alternative)?,
        diff,
        se,
    })
}

/// Paired t-test on `a[i] - b[i]`.
pub fn paired_t(a: &[f64], b: &[f64], alternative: Alternative) -> Result<TTest, AnalysisError> {
    let d = differences(a, b)?;
    if d.len() < 2 {
        return Err(AnalysisError::InsufficientData(
            "paired test needs at least two pairs".to_string(),
        ));
    }
    let n = d.len() as f64;
    let se = std_dev(&d) / n.sqrt();
    if se == 0.0 || !se.is_finite() {
        return Err(AnalysisError::ZeroVariance(
            "paired differences are constant".to_string(),
        ));
    }
    let diff = mean(&d);
    let t = diff / se;
    Ok(TTest {
        t,
        df: n - 1.0,
        p_value: t_p_value(t, n - 1.0, alternative)?,
        diff,
        se,
    })
}

fn differences(a: &[f64], b: &[f64]) -> Result<Vec<f64>, AnalysisError> {
    if a.len() != b.len() {
        return Err(AnalysisError::UnequalPairedGroups(format!(
            "{} vs {} observations",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter().zip(b).map(|(x, y)| x - y).collect())
}

/// Null distribution counts of U (pairs with `a > b`) for sizes `m`, `n`.
fn mann_whitney_counts(m: usize, n: usize) -> Vec<f64> {
    let mut table: Vec<Vec<Vec<f64>>> = vec![vec![Vec::new(); n + 1]; m + 1];
    for i in 0..=m {
        for j in 0..=n {
            if i == 0 || j == 0 {
                table[i][j] = vec![1.0];
                continue;
            }
            let mut counts = vec![0.0; i * j + 1];
            // The largest observation either comes from `a`, beating all j
            // values of `b`, or from `b`, beating none.
            for (u, c) in table[i - 1][j].iter().enumerate() {
                counts[u + j] += c;
            }
            for (u, c) in table[i][j - 1].iter().enumerate() {
                counts[u] += c;
            }
            table[i][j] = counts;
        }
    }
    std::mem::take(&mut table[m][n])
}

/// `(P(X <= x), P(X >= x))` for an integer statistic with the given counts.
fn exact_tails(counts: &[f64], x: usize) -> (f64, f64) {
    let total: f64 = counts.iter().sum();
    let lower: f64 = counts.iter().take(x + 1).sum();
    let upper: f64 = counts.iter().skip(x).sum();
    (lower / total, upper / total)
}

fn exact_p(counts: &[f64], x: usize, alternative: Alternative) -> f64 {
    let (lower, upper) = exact_tails(counts, x);
    clamp_p(match alternative {
        Alternative::TwoSided => 2.0 * lower.min(upper),
        Alternative::Greater => upper,
        Alternative::Less => lower,
    })
}

/// Mann-Whitney U test.
///
/// The statistic is U of the first sample. Exact when both samples have at
/// most [`MANN_WHITNEY_EXACT_MAX`] values and there are no ties; otherwise a
/// tie- and continuity-corrected normal approximation.
pub fn mann_whitney(
    a: &[f64],
    b: &[f64],
    alternative: Alternative,
) -> Result<RankTest, AnalysisError> {
    let (n1, n2) = (a.len(), b.len());
    if n1 == 0 || n2 == 0 {
        return Err(AnalysisError::InsufficientData(
            "Mann-Whitney needs two non-empty samples".to_string(),
        ));
    }
    let pooled: Vec<f64> = a.iter().chain(b).copied().collect();
    let ranks = rank(&pooled);
    let r1: f64 = ranks[..n1].iter().sum();
    let (f1, f2) = (n1 as f64, n2 as f64);
    let u1 = r1 - f1 * (f1 + 1.0) / 2.0;
    let u2 = f1 * f2 - u1;
    let rank_biserial = 2.0 * u1 / (f1 * f2) - 1.0;
    let ties = tie_term(&pooled);

    if n1 <= MANN_WHITNEY_EXACT_MAX && n2 <= MANN_WHITNEY_EXACT_MAX && ties == 0.0 {
        let counts = mann_whitney_counts(n1, n2);
        return Ok(RankTest {
            statistic: u1,
            p_value: exact_p(&counts, u1.round() as usize, alternative),
            z: None,
            exact: true,
            rank_biserial,
        });
    }

    let n = f1 + f2;
    let mu = f1 * f2 / 2.0;
    let sigma = (f1 * f2 / 12.0 * ((n + 1.0) - ties / (n * (n - 1.0)))).sqrt();
    if sigma == 0.0 || !sigma.is_finite() {
        return Err(AnalysisError::ZeroVariance(
            "all observations are tied".to_string(),
        ));
    }
    let (u, z, p) = match alternative {
        Alternative::TwoSided => {
            let u = u1.max(u2);
            let z = (u - mu - 0.5) / sigma;
            (u, z, 2.0 * normal_sf(z))
        }
        Alternative::Greater => {
            let z = (u1 - mu - 0.5) / sigma;
            (u1, z, normal_sf(z))
        }
        Alternative::Less => {
            let z = (u2 - mu - 0.5) / sigma;
            (u2, z, normal_sf(z))
        }
    };
    debug!(u, z, "Mann-Whitney normal approximation");
    Ok(RankTest {
        statistic: u1,
        p_value: clamp_p(p),
        z: Some(z),
        exact: false,
        rank_biserial,
    })
}

/// Null distribution counts of the signed-rank sum for `n` untied ranks.
fn signed_rank_counts(n: usize) -> Vec<f64> {
    let max = n * (n + 1) / 2;
    let mut counts = vec![0.0; max + 1];
    counts[0] = 1.0;
    for r in 1..=n {
        for s in (r..=max).rev() {
            counts[s] += counts[s - r];
        }
    }
    counts
}

/// Wilcoxon signed-rank test on `a[i] - b[i]`.
///
/// Zero differences are dropped. For a two-sided alternative the statistic
/// is `min(R+, R-)`, otherwise `R+`.
pub fn wilcoxon(a: &[f64], b: &[f64], alternative: Alternative) -> Result<RankTest, AnalysisError> {
    let d: Vec<f64> = differences(a, b)?
        .into_iter()
        .filter(|x| *x != 0.0)
        .collect();
    if d.is_empty() {
        return Err(AnalysisError::InsufficientData(
            "all paired differences are zero".to_string(),
        ));
    }
    let n = d.len();
    let abs: Vec<f64> = d.iter().map(|x| x.abs()).collect();
    let ranks = rank(&abs);
    let r_plus: f64 = d
        .iter()
        .zip(&ranks)
        .filter(|(x, _)| **x > 0.0)
        .map(|(_, r)| r)
        .sum();
    let fnn = n as f64;
    let total = fnn * (fnn + 1.0) / 2.0;
    let r_minus = total - r_plus;
    let rank_biserial = (r_plus - r_minus) / total;
    let statistic = match alternative {
        Alternative::TwoSided => r_plus.min(r_minus),
        _ => r_plus,
    };
    let ties = tie_term(&abs);

    if n <= WILCOXON_EXACT_MAX && ties == 0.0 {
        let counts = signed_rank_counts(n);
        return Ok(RankTest {
            statistic,
            p_value: exact_p(&counts, r_plus.round() as usize, alternative),
            z: None,
            exact: true,
            rank_biserial,
        });
    }

    let mu = total / 2.0;
    let sigma = (fnn * (fnn + 1.0) * (2.0 * fnn + 1.0) / 24.0 - ties / 48.0).sqrt();
    if sigma == 0.0 || !sigma.is_finite() {
        return Err(AnalysisError::ZeroVariance(
            "all paired differences are tied".to_string(),
        ));
    }
    let z = (r_plus - mu) / sigma;
    let p = match alternative {
        Alternative::TwoSided => 2.0 * normal_sf(z.abs()),
        Alternative::Greater => normal_sf(z),
        Alternative::Less => normal_cdf(z),
    };
    Ok(RankTest {
        statistic,
        p_value: clamp_p(p),
        z: Some(z),
        exact: false,
        rank_biserial,
    })
}

/// Hodges-Lehmann shift `a - b` with a distribution-free interval.
pub fn hodges_lehmann(a: &[f64], b: &[f64], confidence_level: f64) -> (f64, Option<f64>, Option<f64>) {
    let diffs: Vec<f64> = a.iter().flat_map(|x| b.iter().map(move |y| x - y)).collect();
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    let spread = (n1 * n2 * (n1 + n2 + 1.0) / 12.0).sqrt();
    walsh_interval(diffs, spread, confidence_level)
}

/// Hodges-Lehmann pseudo-median of paired differences with its interval.
pub fn hodges_lehmann_paired(d: &[f64], confidence_level: f64) -> (f64, Option<f64>, Option<f64>) {
    let walsh: Vec<f64> = (0..d.len())
        .flat_map(|i| (i..d.len()).map(move |j| (d[i] + d[j]) / 2.0))
        .collect();
    let n = d.len() as f64;
    let spread = (n * (n + 1.0) * (2.0 * n + 1.0) / 24.0).sqrt();
    walsh_interval(walsh, spread, confidence_level)
}

fn walsh_interval(values: Vec<f64>, spread: f64, confidence_level: f64) -> (f64, Option<f64>, Option<f64>) {
    let v = sorted(&values);
    let estimate = median(&v);
    let n = v.len();
    let k = (n as f64 / 2.0 - z_critical(confidence_level) * spread).floor();
    if n == 0 || k < 0.0 {
        return (estimate, None, None);
    }
    let k = k as usize;
    if k >= n {
        return (estimate, None, None);
    }
    (estimate, Some(v[k]), Some(v[n - 1 - k]))
}

/// Cohen's d with an approximate normal interval.
fn cohens_d(a: &[f64], b: &[f64], pooled: bool, confidence_level: f64) -> (f64, f64, f64) {
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    let (v1, v2) = (variance(a), variance(b));
    let denom = if pooled {
        (((n1 - 1.0) * v1 + (n2 - 1.0) * v2) / (n1 + n2 - 2.0)).sqrt()
    } else {
        ((v1 + v2) / 2.0).sqrt()
    };
    let d = (mean(a) - mean(b)) / denom;
    let se = ((n1 + n2) / (n1 * n2) + d * d / (2.0 * (n1 + n2))).sqrt();
    let z = z_critical(confidence_level);
    (d, d - z * se, d + z * se)
}

/// Interval for a rank-biserial correlation via the Fisher transform.
fn rank_biserial_ci(r: f64, se: f64, confidence_level: f64) -> (f64, f64) {
    let z = z_critical(confidence_level);
    let centre = r.clamp(-0.999_999, 0.999_999).atanh();
    ((centre - z * se).tanh(), (centre + z * se).tanh())
}

/// Pair two samples for a within-subject test: two explicit columns (wide)
/// or the two levels of a grouping column (long).
fn paired_samples(
    method: MethodId,
    ctx: &ExecutionContext<'_>,
    warnings: &mut Vec<String>,
) -> Result<Vec<(String, Vec<f64>)>, AnalysisError> {
    let target = ctx.roles.require(RoleName::Target)?;
    if let Some(second) = ctx.roles.second.as_deref() {
        let (a, b) = ctx.dataset.numeric_pairs(target, second)?;
        return Ok(vec![(target.to_string(), a), (second.to_string(), b)]);
    }
    let group = ctx.roles.require(RoleName::Group)?;
    let paired = ctx
        .dataset
        .paired_numeric(target, group, ctx.roles.subject.as_deref())?;
    if paired.dropped_subjects > 0 {
        warnings.push(format!(
            "{} subject(s) without both measurements were dropped",
            paired.dropped_subjects
        ));
    }
    let groups: Vec<(String, Vec<f64>)> = paired.labels.into_iter().zip(paired.samples).collect();
    if groups.len() != 2 {
        return Err(if groups.len() < 2 {
            AnalysisError::InsufficientGroups {
                found: groups.len(),
                required: 2,
            }
        } else {
            AnalysisError::InvalidOption(format!(
                "{} compares exactly 2 groups, found {}",
                method,
                groups.len()
            ))
        });
    }
    Ok(groups)
}

fn independent_samples(
    method: MethodId,
    ctx: &ExecutionContext<'_>,
    warnings: &mut Vec<String>,
) -> Result<Vec<(String, Vec<f64>)>, AnalysisError> {
    let target = ctx.roles.require(RoleName::Target)?;
    let group = ctx.roles.require(RoleName::Group)?;
    let grouped = ctx.dataset.grouped_numeric(target, group)?;
    let groups = usable_groups(grouped.groups, 2, warnings)?;
    at_most(method, &groups, 2)?;
    Ok(groups)
}

fn difference_interval(
    result: AnalysisResult,
    estimate: f64,
    bounds: (Option<f64>, Option<f64>),
    method: &str,
) -> AnalysisResult {
    result
        .with_extra("difference", json_number(estimate))
        .with_extra("ci_low", bounds.0.map(json_number).unwrap_or_default())
        .with_extra("ci_high", bounds.1.map(json_number).unwrap_or_default())
        .with_extra("ci_method", method)
}

/// Execute a two-group method.
pub fn execute(
    method: MethodId,
    ctx: &ExecutionContext<'_>,
    options: &CompareOptions,
) -> Result<AnalysisResult, AnalysisError> {
    let alpha = options.alpha(ctx.defaults);
    let level = options.confidence_level(ctx.defaults);
    let alternative = options.alternative;
    let resamples = options.bootstrap_resamples(ctx.defaults);
    let seed = options.seed(ctx.defaults);
    let mut warnings = Vec::new();

    let paired = matches!(method, MethodId::TTestPaired | MethodId::Wilcoxon);
    let groups = if paired {
        paired_samples(method, ctx, &mut warnings)?
    } else {
        independent_samples(method, ctx, &mut warnings)?
    };
    let (a, b) = (&groups[0].1, &groups[1].1);

    let assumptions = if paired {
        let d = differences(a, b)?;
        AssumptionReport {
            normality: vec![GroupNormality {
                group: "difference".to_string(),
                check: check_normality(&d),
            }],
            homogeneity: None,
        }
    } else {
        AssumptionReport::for_groups(&groups, options.homogeneity_test)
    };

    let mut result = match method {
        MethodId::TTestInd | MethodId::TTestWelch => {
            let equal_var = options
                .equal_var
                .unwrap_or(method == MethodId::TTestInd);
            let (id, name) = if equal_var {
                (MethodId::TTestInd, MethodId::TTestInd.display_name())
            } else {
                (MethodId::TTestWelch, MethodId::TTestWelch.display_name())
            };
            let test = independent_t(a, b, equal_var, alternative)?;
            let (d, lo, hi) = cohens_d(a, b, equal_var, level);
            let bounds = if options.use_bootstrap {
                let boot = bootstrap_two_sample(a, b, resamples, seed, |x, y| mean(x) - mean(y));
                percentile_interval(boot, level).map(|(l, h)| (Some(l), Some(h)))
            } else {
                Some(t_interval(test.diff, test.se, test.df, level, alternative)?)
            };
            let ci_method = if options.use_bootstrap { "bootstrap" } else { "parametric" };
            let result = AnalysisResult::new(id, name)
                .with_test(test.t, test.p_value, alpha)
                .with_effect_size("cohens_d", d, Some((Some(lo), Some(hi))))
                .with_extra("df", json_number(test.df))
                .with_extra("se", json_number(test.se));
            difference_interval(result, test.diff, bounds.unwrap_or((None, None)), ci_method)
        }
        MethodId::TTestPaired => {
            let test = paired_t(a, b, alternative)?;
            let d = differences(a, b)?;
            let n = d.len() as f64;
            let dz = mean(&d) / std_dev(&d);
            let se = (1.0 / n + dz * dz / (2.0 * n)).sqrt();
            let z = z_critical(level);
            let bounds = if options.use_bootstrap {
                let mut rng = seeded_rng(seed);
                let boot = (0..resamples)
                    .map(|_| mean(&bootstrap_sample(&d, &mut rng)))
                    .collect();
                percentile_interval(boot, level).map(|(l, h)| (Some(l), Some(h)))
            } else {
                Some(t_interval(test.diff, test.se, test.df, level, alternative)?)
            };
            let ci_method = if options.use_bootstrap { "bootstrap" } else { "parametric" };
            let result = AnalysisResult::new(method, method.display_name())
                .with_test(test.t, test.p_value, alpha)
                .with_effect_size("cohens_dz", dz, Some((Some(dz - z * se), Some(dz + z * se))))
                .with_extra("df", json_number(test.df))
                .with_extra("n_pairs", d.len());
            difference_interval(result, test.diff, bounds.unwrap_or((None, None)), ci_method)
        }
        MethodId::MannWhitney => {
            let test = mann_whitney(a, b, alternative)?;
            let (n1, n2) = (a.len() as f64, b.len() as f64);
            let se = ((n1 + n2 + 1.0) / (3.0 * n1 * n2)).sqrt();
            let (lo, hi) = rank_biserial_ci(test.rank_biserial, se, level);
            let (estimate, bounds) = if options.use_bootstrap {
                let boot = bootstrap_two_sample(a, b, resamples, seed, |x, y| median(x) - median(y));
                (
                    median(a) - median(b),
                    percentile_interval(boot, level)
                        .map(|(l, h)| (Some(l), Some(h)))
                        .unwrap_or((None, None)),
                )
            } else {
                let (hl, l, h) = hodges_lehmann(a, b, level);
                (hl, (l, h))
            };
            let ci_method = if options.use_bootstrap { "bootstrap" } else { "hodges_lehmann" };
            let result = AnalysisResult::new(method, method.display_name())
                .with_test(test.statistic, test.p_value, alpha)
                .with_effect_size("rank_biserial", test.rank_biserial, Some((Some(lo), Some(hi))))
                .with_extra("exact", test.exact)
                .with_extra("z", test.z.map(json_number).unwrap_or_default());
            difference_interval(result, estimate, bounds, ci_method)
        }
        MethodId::Wilcoxon => {
            let test = wilcoxon(a, b, alternative)?;
            let d: Vec<f64> = differences(a, b)?;
            let nonzero = d.iter().filter(|x| **x != 0.0).count();
            if nonzero < d.len() {
                warnings.push(format!(
                    "{} zero difference(s) excluded from ranking",
                    d.len() - nonzero
                ));
            }
            let nz = nonzero as f64;
            let se = ((2.0 * nz + 1.0) / (3.0 * nz * (nz + 1.0))).sqrt() * 2.0;
            let (lo, hi) = rank_biserial_ci(test.rank_biserial, se, level);
            let (estimate, bounds) = if options.use_bootstrap {
                let mut rng = seeded_rng(seed);
                let boot = (0..resamples)
                    .map(|_| median(&bootstrap_sample(&d, &mut rng)))
                    .collect();
                (
                    median(&d),
                    percentile_interval(boot, level)
                        .map(|(l, h)| (Some(l), Some(h)))
                        .unwrap_or((None, None)),
                )
            } else {
                let (hl, l, h) = hodges_lehmann_paired(&d, level);
                (hl, (l, h))
            };
            let ci_method = if options.use_bootstrap { "bootstrap" } else { "hodges_lehmann" };
            let result = AnalysisResult::new(method, method.display_name())
                .with_test(test.statistic, test.p_value, alpha)
                .with_effect_size("rank_biserial", test.rank_biserial, Some((Some(lo), Some(hi))))
                .with_extra("exact", test.exact)
                .with_extra("z", test.z.map(json_number).unwrap_or_default());
            difference_interval(result, estimate, bounds, ci_method)
        }
        other => {
            return Err(AnalysisError::InvalidOption(format!(
                "{} is not a two-group comparison",
                other
            )))
        }
    };

    if !assumptions.all_normal() && matches!(result.method_id, MethodId::TTestInd | MethodId::TTestWelch | MethodId::TTestPaired) {
        warnings.push("Normality was not confirmed; consider a rank-based test".to_string());
    }
    result = result
        .with_groups(&groups, level)
        .with_extra("alternative", alternative.as_str())
        .with_extra("n", json!(groups.iter().map(|(_, s)| s.len()).collect::<Vec<_>>()));
    result.assumptions = Some(assumptions);
    result.warnings.extend(warnings);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, Dataset};
    use crate::options::AnalysisDefaults;
    use crate::registry::ColumnRoles;

    const A: [f64; 8] = [5.1, 4.9, 5.6, 5.8, 6.0, 5.4, 5.2, 5.9];
    const B: [f64; 8] = [6.2, 6.6, 6.1, 6.8, 7.0, 6.4, 6.9, 6.3];

    #[test]
    fn test_student_t_matches_reference() {
        // scipy.stats.ttest_ind([1,2,3,4,5], [3,4,5,6,7]) -> t = -2.0, p = 0.0805
        let t = independent_t(&[1.0, 2.0, 3.0, 4.0, 5.0], &[3.0, 4.0, 5.0, 6.0, 7.0], true, Alternative::TwoSided)
            .unwrap();
        assert!((t.t + 2.0).abs() < 1e-12);
        assert_eq!(t.df, 8.0);
        assert!((t.p_value - 0.0805).abs() < 1e-3);
    }

    #[test]
    fn test_welch_df() {
        let t = independent_t(&[1.0, 2.0, 3.0, 4.0], &[2.0, 4.0, 6.0, 8.0, 10.0, 12.0], false, Alternative::TwoSided)
            .unwrap();
        assert!(t.df > 5.0 && t.df < 8.0);
        let one_sided = independent_t(&[1.0, 2.0, 3.0, 4.0], &[2.0, 4.0, 6.0, 8.0, 10.0, 12.0], false, Alternative::Less)
            .unwrap();
        assert!((one_sided.p_value - t.p_value / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_variance() {
        let err = independent_t(&[1.0, 1.0], &[1.0, 1.0], true, Alternative::TwoSided).unwrap_err();
        assert!(matches!(err, AnalysisError::ZeroVariance(_)));
    }

    #[test]
    fn test_paired_unequal_lengths() {
        let err = paired_t(&[1.0, 2.0, 3.0], &[1.0, 2.0], Alternative::TwoSided).unwrap_err();
        assert!(matches!(err, AnalysisError::UnequalPairedGroups(_)));
    }

    #[test]
    fn test_paired_t() {
        let t = paired_t(&[2.0, 4.0, 6.0, 8.0], &[1.0, 2.0, 4.0, 5.0], Alternative::TwoSided).unwrap();
        // differences 1, 2, 2, 3: mean 2, sd 0.8165, t = 4.899
        assert!((t.t - 4.898979).abs() < 1e-5);
        assert_eq!(t.df, 3.0);
    }

    #[test]
    fn test_mann_whitney_exact() {
        // Complete separation of 3 vs 3: U = 0, exact two-sided p = 2/20.
        let test = mann_whitney(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0], Alternative::TwoSided).unwrap();
        assert!(test.exact);
        assert_eq!(test.statistic, 0.0);
        assert!((test.p_value - 0.1).abs() < 1e-12);
        assert_eq!(test.rank_biserial, -1.0);
    }

    #[test]
    fn test_mann_whitney_counts_sum() {
        let counts = mann_whitney_counts(4, 5);
        assert_eq!(counts.len(), 21);
        // C(9, 4) orderings
        assert_eq!(counts.iter().sum::<f64>(), 126.0);
        assert_eq!(counts[0], 1.0);
        assert_eq!(counts[20], 1.0);
    }

    #[test]
    fn test_mann_whitney_ties_use_normal_approximation() {
        let test = mann_whitney(&[1.0, 2.0, 2.0, 3.0], &[2.0, 4.0, 5.0, 5.0], Alternative::TwoSided).unwrap();
        assert!(!test.exact);
        assert!(test.z.is_some());
        assert!(test.p_value > 0.0 && test.p_value <= 1.0);
    }

    #[test]
    fn test_wilcoxon_exact() {
        // Five positive differences: R+ = 15, exact two-sided p = 2/32.
        let test = wilcoxon(&[2.0, 4.0, 6.0, 8.0, 10.0], &[1.0, 2.0, 3.0, 4.0, 5.0], Alternative::TwoSided)
            .unwrap();
        assert!(test.exact);
        assert_eq!(test.statistic, 0.0);
        assert!((test.p_value - 0.0625).abs() < 1e-12);
        assert_eq!(test.rank_biserial, 1.0);
    }

    #[test]
    fn test_signed_rank_counts() {
        let counts = signed_rank_counts(4);
        assert_eq!(counts.iter().sum::<f64>(), 16.0);
        assert_eq!(counts.len(), 11);
    }

    #[test]
    fn test_hodges_lehmann() {
        let (estimate, lo, hi) = hodges_lehmann(&B, &A, 0.95);
        assert!(estimate > 0.5 && estimate < 1.5);
        assert!(lo.unwrap() <= estimate && estimate <= hi.unwrap());
    }

    fn dataset() -> Dataset {
        let values: Vec<f64> = A.iter().chain(B.iter()).copied().collect();
        let arms: Vec<&str> = std::iter::repeat("a").take(8).chain(std::iter::repeat("b").take(8)).collect();
        Dataset::new("ds")
            .with_column("y", Column::numeric(values))
            .unwrap()
            .with_column("arm", Column::categorical(arms))
            .unwrap()
    }

    #[test]
    fn test_execute_student() {
        let ds = dataset();
        let roles = ColumnRoles::grouped("y", "arm");
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let result = execute(MethodId::TTestInd, &ctx, &CompareOptions::default()).unwrap();
        assert_eq!(result.method_id, MethodId::TTestInd);
        assert!(result.significant);
        assert!(result.effect_size.unwrap() < 0.0);
        assert_eq!(result.groups, vec!["a", "b"]);
        assert!(result.extra["ci_low"].as_f64().unwrap() < result.extra["ci_high"].as_f64().unwrap());
        assert_eq!(result.assumptions.as_ref().unwrap().normality.len(), 2);
    }

    #[test]
    fn test_execute_equal_var_override_switches_to_welch() {
        let ds = dataset();
        let roles = ColumnRoles::grouped("y", "arm");
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let options = CompareOptions {
            equal_var: Some(false),
            ..CompareOptions::default()
        };
        let result = execute(MethodId::TTestInd, &ctx, &options).unwrap();
        assert_eq!(result.method_id, MethodId::TTestWelch);
    }

    #[test]
    fn test_execute_bootstrap_is_deterministic() {
        let ds = dataset();
        let roles = ColumnRoles::grouped("y", "arm");
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let options = CompareOptions {
            use_bootstrap: true,
            bootstrap_resamples: Some(500),
            ..CompareOptions::default()
        };
        let first = execute(MethodId::MannWhitney, &ctx, &options).unwrap();
        let second = execute(MethodId::MannWhitney, &ctx, &options).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.extra["ci_method"], "bootstrap");
    }

    #[test]
    fn test_execute_paired_wide() {
        let ds = Dataset::new("wide")
            .with_column("pre", Column::numeric(A))
            .unwrap()
            .with_column("post", Column::numeric(B))
            .unwrap();
        let roles = ColumnRoles::pair("post", "pre");
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let result = execute(MethodId::Wilcoxon, &ctx, &CompareOptions::default()).unwrap();
        assert_eq!(result.groups, vec!["post", "pre"]);
        assert!(result.p_value.unwrap() < 0.05);
    }
}
