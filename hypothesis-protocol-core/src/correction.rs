//! Multiple-comparison correction and pairwise post-hoc testing.
//!
//! Adjusted p-values follow the usual step-down/step-up definitions and are
//! clipped to `[0, 1]`. Every adjusted value is at least its raw p-value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AnalysisError;
use crate::methods::compare::{independent_t, mann_whitney, paired_t, wilcoxon};
use crate::options::PostHocMethod;
use crate::result::PostHocComparison;
use crate::stats::descriptive::{mean, median, variance};
use crate::stats::distributions::{t_p_value, Alternative};
use crate::stats::tukey::{qtukey, tukey_p_value};

/// p-value adjustment procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMethod {
    Bonferroni,
    Sidak,
    Holm,
    HolmSidak,
    SimesHochberg,
    Hommel,
    /// Benjamini-Hochberg false discovery rate.
    FdrBh,
    /// Benjamini-Yekutieli false discovery rate.
    FdrBy,
    /// Two-stage Benjamini-Hochberg.
    FdrTsbh,
    /// Two-stage Benjamini-Krieger-Yekutieli.
    FdrTsbky,
}

impl CorrectionMethod {
    pub const ALL: [CorrectionMethod; 10] = [
        CorrectionMethod::Bonferroni,
        CorrectionMethod::Sidak,
        CorrectionMethod::Holm,
        CorrectionMethod::HolmSidak,
        CorrectionMethod::SimesHochberg,
        CorrectionMethod::Hommel,
        CorrectionMethod::FdrBh,
        CorrectionMethod::FdrBy,
        CorrectionMethod::FdrTsbh,
        CorrectionMethod::FdrTsbky,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionMethod::Bonferroni => "bonferroni",
            CorrectionMethod::Sidak => "sidak",
            CorrectionMethod::Holm => "holm",
            CorrectionMethod::HolmSidak => "holm_sidak",
            CorrectionMethod::SimesHochberg => "simes_hochberg",
            CorrectionMethod::Hommel => "hommel",
            CorrectionMethod::FdrBh => "fdr_bh",
            CorrectionMethod::FdrBy => "fdr_by",
            CorrectionMethod::FdrTsbh => "fdr_tsbh",
            CorrectionMethod::FdrTsbky => "fdr_tsbky",
        }
    }
}

impl fmt::Display for CorrectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorrectionMethod {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let method = match normalized.as_str() {
            "bonferroni" | "b" => CorrectionMethod::Bonferroni,
            "sidak" | "s" => CorrectionMethod::Sidak,
            "holm" | "h" => CorrectionMethod::Holm,
            "holm_sidak" | "hs" => CorrectionMethod::HolmSidak,
            "simes_hochberg" | "hochberg" | "sh" => CorrectionMethod::SimesHochberg,
            "hommel" | "ho" => CorrectionMethod::Hommel,
            "fdr_bh" | "bh" | "benjamini_hochberg" | "fdr_i" => CorrectionMethod::FdrBh,
            "fdr_by" | "by" | "benjamini_yekutieli" | "fdr_n" => CorrectionMethod::FdrBy,
            "fdr_tsbh" | "fdr_2sbh" => CorrectionMethod::FdrTsbh,
            "fdr_tsbky" | "fdr_2sbky" | "fdr_twostage" => CorrectionMethod::FdrTsbky,
            _ => {
                return Err(AnalysisError::InvalidOption(format!(
                    "unknown correction method '{}'",
                    s
                )))
            }
        };
        Ok(method)
    }
}

/// Ascending order of `p` as indices.
fn ascending(p: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..p.len()).collect();
    order.sort_by(|&a, &b| p[a].partial_cmp(&p[b]).unwrap_or(std::cmp::Ordering::Equal));
    order
}

fn cumulative_max(values: &mut [f64]) {
    for i in 1..values.len() {
        values[i] = values[i].max(values[i - 1]);
    }
}

fn reverse_cumulative_min(values: &mut [f64]) {
    for i in (0..values.len().saturating_sub(1)).rev() {
        values[i] = values[i].min(values[i + 1]);
    }
}

/// Benjamini-Hochberg style step-up on sorted p-values.
fn step_up(sorted: &[f64], scale: f64) -> Vec<f64> {
    let m = sorted.len() as f64;
    let mut adjusted: Vec<f64> = sorted
        .iter()
        .enumerate()
        .map(|(i, p)| p * m * scale / (i + 1) as f64)
        .collect();
    reverse_cumulative_min(&mut adjusted);
    adjusted
}

fn hommel(sorted: &[f64]) -> Vec<f64> {
    let n = sorted.len();
    let mut a = sorted.to_vec();
    for m in (2..=n).rev() {
        let tail = &sorted[n - m..];
        let cim = tail
            .iter()
            .enumerate()
            .map(|(i, p)| m as f64 * p / (i + 1) as f64)
            .fold(f64::INFINITY, f64::min);
        for value in &mut a[n - m..] {
            *value = value.max(cim);
        }
        for (value, p) in a[..n - m].iter_mut().zip(&sorted[..n - m]) {
            *value = value.max((m as f64 * p).min(cim));
        }
    }
    a
}

fn two_stage(sorted: &[f64], alpha: f64, krieger: bool) -> Vec<f64> {
    let m = sorted.len();
    let (factor, alpha_prime) = if krieger {
        (1.0 + alpha, alpha / (1.0 + alpha))
    } else {
        (1.0, alpha)
    };
    let stage_one = step_up(sorted, 1.0);
    let rejected = stage_one.iter().filter(|p| **p <= alpha_prime).count();
    if rejected == 0 || rejected == m {
        return stage_one.into_iter().map(|p| p * factor).collect();
    }
    let null_share = (m - rejected) as f64 / m as f64;
    stage_one
        .into_iter()
        .map(|p| p * null_share * factor)
        .collect()
}

/// Adjust finite p-values with `method`.
///
/// # Errors
///
/// Returns [`AnalysisError::Computation`] if any input or output is not a
/// finite probability.
pub fn adjust(p: &[f64], method: CorrectionMethod, alpha: f64) -> Result<Vec<f64>, AnalysisError> {
    if let Some(bad) = p.iter().find(|x| !x.is_finite() || **x < 0.0 || **x > 1.0) {
        return Err(AnalysisError::Computation(format!(
            "cannot correct invalid p-value {}",
            bad
        )));
    }
    let m = p.len();
    if m == 0 {
        return Ok(Vec::new());
    }
    let order = ascending(p);
    let sorted: Vec<f64> = order.iter().map(|&i| p[i]).collect();
    let fm = m as f64;

    let adjusted_sorted = match method {
        CorrectionMethod::Bonferroni => sorted.iter().map(|x| x * fm).collect(),
        CorrectionMethod::Sidak => sorted.iter().map(|x| -(fm * (-x).ln_1p()).exp_m1()).collect(),
        CorrectionMethod::Holm => {
            let mut v: Vec<f64> = sorted
                .iter()
                .enumerate()
                .map(|(i, x)| (x * (m - i) as f64).min(1.0))
                .collect();
            cumulative_max(&mut v);
            v
        }
        CorrectionMethod::HolmSidak => {
            let mut v: Vec<f64> = sorted
                .iter()
                .enumerate()
                .map(|(i, x)| -(((m - i) as f64) * (-x).ln_1p()).exp_m1())
                .collect();
            cumulative_max(&mut v);
            v
        }
        CorrectionMethod::SimesHochberg => {
            let mut v: Vec<f64> = sorted
                .iter()
                .enumerate()
                .map(|(i, x)| x * (m - i) as f64)
                .collect();
            reverse_cumulative_min(&mut v);
            v
        }
        CorrectionMethod::Hommel => hommel(&sorted),
        CorrectionMethod::FdrBh => step_up(&sorted, 1.0),
        CorrectionMethod::FdrBy => {
            let harmonic: f64 = (1..=m).map(|k| 1.0 / k as f64).sum();
            step_up(&sorted, harmonic)
        }
        CorrectionMethod::FdrTsbh => two_stage(&sorted, alpha, false),
        CorrectionMethod::FdrTsbky => two_stage(&sorted, alpha, true),
    };

    let mut adjusted = vec![0.0; m];
    for (rank, &index) in order.iter().enumerate() {
        let value = adjusted_sorted[rank];
        if !value.is_finite() {
            return Err(AnalysisError::Computation(format!(
                "{} produced a non-finite adjusted p-value",
                method
            )));
        }
        adjusted[index] = value.clamp(0.0, 1.0).max(p[index]);
    }
    Ok(adjusted)
}

/// Corrected p-values for a family of tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    /// Procedure actually applied.
    pub method: CorrectionMethod,
    /// Adjusted values, `None` where the raw p-value was missing.
    pub adjusted: Vec<Option<f64>>,
    pub significant: Vec<bool>,
    pub warnings: Vec<String>,
}

/// Correct `p` with the procedure named `requested`, falling back to
/// Benjamini-Hochberg (with a warning) when the name is unknown or the
/// procedure fails. Missing or non-finite p-values are left out of the
/// family and stay `None`.
pub fn correct(p: &[Option<f64>], requested: &str, alpha: f64) -> Correction {
    let mut warnings = Vec::new();
    let present: Vec<(usize, f64)> = p
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.filter(|x| x.is_finite()).map(|x| (i, x.clamp(0.0, 1.0))))
        .collect();
    let values: Vec<f64> = present.iter().map(|(_, v)| *v).collect();

    let method = match requested.parse::<CorrectionMethod>() {
        Ok(method) => method,
        Err(e) => {
            warn!(requested, "unknown correction method, using fdr_bh");
            warnings.push(format!("{}; fell back to Benjamini-Hochberg (fdr_bh)", e));
            CorrectionMethod::FdrBh
        }
    };
    let (method, adjusted_values) = match adjust(&values, method, alpha) {
        Ok(adjusted) => (method, adjusted),
        Err(e) => {
            warn!(%method, error = %e, "correction failed, using fdr_bh");
            warnings.push(format!(
                "{} correction could not be computed ({}); fell back to Benjamini-Hochberg (fdr_bh)",
                method, e
            ));
            let fallback = adjust(&values, CorrectionMethod::FdrBh, alpha).unwrap_or_else(|_| values.clone());
            (CorrectionMethod::FdrBh, fallback)
        }
    };

    let mut adjusted = vec![None; p.len()];
    for ((index, _), value) in present.iter().zip(adjusted_values) {
        adjusted[*index] = Some(value);
    }
    let significant = adjusted
        .iter()
        .map(|v| v.map(|x| x < alpha).unwrap_or(false))
        .collect();
    Correction {
        method,
        adjusted,
        significant,
        warnings,
    }
}

/// Result of a pairwise post-hoc procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct PostHoc {
    pub method: PostHocMethod,
    /// `None` for Tukey's HSD, which adjusts through the studentized range.
    pub correction: Option<CorrectionMethod>,
    pub comparisons: Vec<PostHocComparison>,
    pub warnings: Vec<String>,
}

fn pairs(k: usize) -> Vec<(usize, usize)> {
    (0..k)
        .flat_map(|i| (i + 1..k).map(move |j| (i, j)))
        .collect()
}

fn tukey_hsd(
    groups: &[(String, Vec<f64>)],
    alpha: f64,
    confidence_level: f64,
) -> Result<Vec<PostHocComparison>, AnalysisError> {
    let k = groups.len();
    let total: usize = groups.iter().map(|(_, s)| s.len()).sum();
    if total <= k {
        return Err(AnalysisError::InsufficientData(
            "Tukey HSD needs more observations than groups".to_string(),
        ));
    }
    let df = (total - k) as f64;
    let sse: f64 = groups
        .iter()
        .map(|(_, s)| (s.len() as f64 - 1.0) * variance(s))
        .sum();
    let mse = sse / df;
    if mse <= 0.0 || !mse.is_finite() {
        return Err(AnalysisError::ZeroVariance(
            "no within-group variance for Tukey HSD".to_string(),
        ));
    }
    let q_crit = qtukey(confidence_level, k, df);
    pairs(k)
        .into_iter()
        .map(|(i, j)| {
            let (a, b) = (&groups[i].1, &groups[j].1);
            let harmonic = 1.0 / a.len() as f64 + 1.0 / b.len() as f64;
            let diff = mean(a) - mean(b);
            let se = (mse / 2.0 * harmonic).sqrt();
            let q = diff.abs() / se;
            let raw_p = t_p_value(diff / (mse * harmonic).sqrt(), df, Alternative::TwoSided)?;
            let p_value = tukey_p_value(q, k, df).max(raw_p);
            Ok(PostHocComparison {
                group_a: groups[i].0.clone(),
                group_b: groups[j].0.clone(),
                diff: Some(diff),
                raw_p: Some(raw_p),
                p_value: Some(p_value),
                significant: p_value < alpha,
                ci_low: Some(diff - q_crit * se),
                ci_high: Some(diff + q_crit * se),
            })
        })
        .collect()
}

/// Raw p-value and location difference for one pair.
fn pair_test(method: PostHocMethod, a: &[f64], b: &[f64]) -> Result<(f64, f64), AnalysisError> {
    let two = Alternative::TwoSided;
    match method {
        PostHocMethod::Tukey | PostHocMethod::TTest => {
            let t = independent_t(a, b, true, two)?;
            Ok((t.diff, t.p_value))
        }
        PostHocMethod::Welch => {
            let t = independent_t(a, b, false, two)?;
            Ok((t.diff, t.p_value))
        }
        PostHocMethod::MannWhitney => {
            let test = mann_whitney(a, b, two)?;
            Ok((median(a) - median(b), test.p_value))
        }
        PostHocMethod::PairedT => {
            let t = paired_t(a, b, two)?;
            Ok((t.diff, t.p_value))
        }
        PostHocMethod::Wilcoxon => {
            let test = wilcoxon(a, b, two)?;
            let d: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).collect();
            Ok((median(&d), test.p_value))
        }
    }
}

/// All pairwise comparisons between `groups` with `method`, corrected with
/// the procedure named `correction` (ignored for Tukey's HSD).
///
/// A pair whose test cannot be computed is kept with null p-values and a
/// warning.
pub fn pairwise_post_hoc(
    groups: &[(String, Vec<f64>)],
    method: PostHocMethod,
    correction: &str,
    alpha: f64,
    confidence_level: f64,
) -> Result<PostHoc, AnalysisError> {
    if groups.len() < 2 {
        return Err(AnalysisError::InsufficientGroups {
            found: groups.len(),
            required: 2,
        });
    }
    if method == PostHocMethod::Tukey {
        return Ok(PostHoc {
            method,
            correction: None,
            comparisons: tukey_hsd(groups, alpha, confidence_level)?,
            warnings: Vec::new(),
        });
    }

    let mut warnings = Vec::new();
    let mut rows = Vec::new();
    let mut raw = Vec::new();
    for (i, j) in pairs(groups.len()) {
        let (label_a, a) = &groups[i];
        let (label_b, b) = &groups[j];
        let (diff, p) = match pair_test(method, a, b) {
            Ok((diff, p)) => (Some(diff), Some(p)),
            Err(e) => {
                warnings.push(format!("{} vs {}: {}", label_a, label_b, e));
                (None, None)
            }
        };
        raw.push(p);
        rows.push(PostHocComparison {
            group_a: label_a.clone(),
            group_b: label_b.clone(),
            diff,
            raw_p: p,
            p_value: None,
            significant: false,
            ci_low: None,
            ci_high: None,
        });
    }

    let corrected = correct(&raw, correction, alpha);
    for ((row, adjusted), significant) in rows
        .iter_mut()
        .zip(&corrected.adjusted)
        .zip(&corrected.significant)
    {
        row.p_value = *adjusted;
        row.significant = *significant;
    }
    warnings.extend(corrected.warnings);
    Ok(PostHoc {
        method,
        correction: Some(corrected.method),
        comparisons: rows,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: [f64; 5] = [0.01, 0.04, 0.03, 0.005, 0.2];

    fn close(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-9, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn test_bonferroni_and_holm() {
        close(
            &adjust(&P, CorrectionMethod::Bonferroni, 0.05).unwrap(),
            &[0.05, 0.2, 0.15, 0.025, 1.0],
        );
        // sorted 0.005, 0.01, 0.03, 0.04, 0.2 -> 0.025, 0.04, 0.09, 0.09, 0.2
        close(
            &adjust(&P, CorrectionMethod::Holm, 0.05).unwrap(),
            &[0.04, 0.09, 0.09, 0.025, 0.2],
        );
    }

    #[test]
    fn test_benjamini_hochberg() {
        // statsmodels multipletests(P, method="fdr_bh")
        close(
            &adjust(&P, CorrectionMethod::FdrBh, 0.05).unwrap(),
            &[0.025, 0.05, 0.05, 0.025, 0.2],
        );
    }

    #[test]
    fn test_hochberg_and_hommel() {
        close(
            &adjust(&P, CorrectionMethod::SimesHochberg, 0.05).unwrap(),
            &[0.04, 0.08, 0.08, 0.025, 0.2],
        );
        let hommel = adjust(&P, CorrectionMethod::Hommel, 0.05).unwrap();
        let hochberg = adjust(&P, CorrectionMethod::SimesHochberg, 0.05).unwrap();
        for (h, s) in hommel.iter().zip(&hochberg) {
            assert!(h <= s);
        }
    }

    #[test]
    fn test_every_method_respects_bounds() {
        for method in CorrectionMethod::ALL {
            let adjusted = adjust(&P, method, 0.05).unwrap();
            for (raw, adj) in P.iter().zip(&adjusted) {
                assert!(adj >= raw, "{} lowered {} to {}", method, raw, adj);
                assert!(*adj <= 1.0);
            }
        }
    }

    #[test]
    fn test_fdr_batch_of_ten() {
        let p: Vec<Option<f64>> = [0.0001, 0.0005, 0.6, 0.7, 0.8, 0.9, 0.55, 0.65, 0.75, 0.95]
            .iter()
            .map(|x| Some(*x))
            .collect();
        let corrected = correct(&p, "fdr_bh", 0.05);
        let significant: Vec<usize> = corrected
            .significant
            .iter()
            .enumerate()
            .filter(|(_, s)| **s)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(significant, vec![0, 1]);
    }

    #[test]
    fn test_unknown_method_falls_back() {
        let corrected = correct(&[Some(0.01), Some(0.02)], "magic", 0.05);
        assert_eq!(corrected.method, CorrectionMethod::FdrBh);
        assert_eq!(corrected.warnings.len(), 1);
        assert!(corrected.warnings[0].contains("magic"));
    }

    #[test]
    fn test_missing_values_are_skipped() {
        let corrected = correct(&[Some(0.01), None, Some(f64::NAN), Some(0.02)], "bonferroni", 0.05);
        assert_eq!(corrected.adjusted, vec![Some(0.02), None, None, Some(0.04)]);
        assert_eq!(corrected.significant, vec![true, false, false, true]);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Holm-Sidak".parse::<CorrectionMethod>().unwrap(), CorrectionMethod::HolmSidak);
        assert_eq!("bh".parse::<CorrectionMethod>().unwrap(), CorrectionMethod::FdrBh);
        assert_eq!("hochberg".parse::<CorrectionMethod>().unwrap(), CorrectionMethod::SimesHochberg);
    }

    fn three_groups() -> Vec<(String, Vec<f64>)> {
        let base = [-1.2, -0.5, 0.0, 0.4, 1.1, -0.8, 0.7, 0.2];
        [10.0, 20.0, 30.0]
            .iter()
            .zip(["A", "B", "C"])
            .map(|(m, l)| (l.to_string(), base.iter().map(|x| m + x).collect()))
            .collect()
    }

    #[test]
    fn test_tukey_three_groups() {
        let post_hoc = pairwise_post_hoc(&three_groups(), PostHocMethod::Tukey, "holm", 0.05, 0.95).unwrap();
        assert_eq!(post_hoc.correction, None);
        let labels: Vec<(String, String)> = post_hoc
            .comparisons
            .iter()
            .map(|c| (c.group_a.clone(), c.group_b.clone()))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("A".to_string(), "B".to_string()),
                ("A".to_string(), "C".to_string()),
                ("B".to_string(), "C".to_string())
            ]
        );
        for c in &post_hoc.comparisons {
            assert!(c.significant);
            assert!(c.p_value.unwrap() >= c.raw_p.unwrap());
            assert!(c.ci_low.unwrap() < c.diff.unwrap() && c.diff.unwrap() < c.ci_high.unwrap());
        }
    }

    #[test]
    fn test_pairwise_rank_sum_with_holm() {
        let post_hoc =
            pairwise_post_hoc(&three_groups(), PostHocMethod::MannWhitney, "holm", 0.05, 0.95).unwrap();
        assert_eq!(post_hoc.correction, Some(CorrectionMethod::Holm));
        assert_eq!(post_hoc.comparisons.len(), 3);
        for c in &post_hoc.comparisons {
            assert!(c.p_value.unwrap() >= c.raw_p.unwrap());
        }
    }
}
