//! Normality and variance-homogeneity checks.
//!
//! Checks never fail on small samples. A sample outside the valid range of
//! a test yields an indeterminate check (`passed: None`), which callers treat
//! as "assumption not confirmed".

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AnalysisError;
use crate::stats::descriptive::{mean, median, sorted, variance};
use crate::stats::distributions::{chi2_sf, f_sf, normal_quantile, normal_sf};
use crate::stats::resample::subsample;

/// Significance level used to decide whether an assumption holds.
pub const ASSUMPTION_ALPHA: f64 = 0.05;
/// Smallest sample Shapiro-Wilk accepts.
pub const SHAPIRO_MIN_N: usize = 3;
/// Largest sample tested directly; bigger samples are subsampled.
pub const SHAPIRO_MAX_N: usize = 5000;
/// Seed for the subsample drawn from oversized samples.
pub const SUBSAMPLE_SEED: u64 = 42;

/// Outcome of a single assumption test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssumptionCheck {
    pub test_name: String,
    pub statistic: Option<f64>,
    pub p_value: Option<f64>,
    /// `None` when the test could not be run on this sample.
    pub passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AssumptionCheck {
    fn evaluated(test_name: &str, statistic: f64, p_value: f64) -> Self {
        Self {
            test_name: test_name.to_string(),
            statistic: Some(statistic),
            p_value: Some(p_value),
            passed: Some(p_value > ASSUMPTION_ALPHA),
            note: None,
        }
    }

    fn indeterminate(test_name: &str, note: impl Into<String>) -> Self {
        Self {
            test_name: test_name.to_string(),
            statistic: None,
            p_value: None,
            passed: None,
            note: Some(note.into()),
        }
    }

    /// True only when the test ran and passed.
    pub fn confirmed(&self) -> bool {
        self.passed == Some(true)
    }
}

/// Normality check for one named group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupNormality {
    pub group: String,
    #[serde(flatten)]
    pub check: AssumptionCheck,
}

/// Assumption checks for a grouped comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssumptionReport {
    pub normality: Vec<GroupNormality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homogeneity: Option<AssumptionCheck>,
}

impl AssumptionReport {
    /// Normality per group plus one homogeneity test across all groups.
    pub fn for_groups(groups: &[(String, Vec<f64>)], homogeneity: HomogeneityTest) -> Self {
        let normality = groups
            .iter()
            .map(|(label, sample)| GroupNormality {
                group: label.clone(),
                check: check_normality(sample),
            })
            .collect();
        let samples: Vec<&[f64]> = groups.iter().map(|(_, s)| s.as_slice()).collect();
        Self {
            normality,
            homogeneity: Some(check_homogeneity(&samples, homogeneity)),
        }
    }

    /// Every group was tested and passed.
    pub fn all_normal(&self) -> bool {
        !self.normality.is_empty() && self.normality.iter().all(|g| g.check.confirmed())
    }

    /// Homogeneity was tested and passed.
    pub fn homogeneous(&self) -> bool {
        self.homogeneity
            .as_ref()
            .map(AssumptionCheck::confirmed)
            .unwrap_or(false)
    }
}

/// Test used for homogeneity of variance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomogeneityTest {
    /// Levene's test centred on the median (Brown-Forsythe).
    #[default]
    Levene,
    /// Levene's test centred on the mean.
    LeveneMean,
    Bartlett,
}

/// Shapiro-Wilk normality check.
///
/// Samples above [`SHAPIRO_MAX_N`] are reduced to a fixed-seed subsample.
pub fn check_normality(sample: &[f64]) -> AssumptionCheck {
    const NAME: &str = "Shapiro-Wilk";
    if sample.len() < SHAPIRO_MIN_N {
        return AssumptionCheck::indeterminate(
            NAME,
            format!("n = {} is below {}", sample.len(), SHAPIRO_MIN_N),
        );
    }

    let reduced;
    let (data, note) = if sample.len() > SHAPIRO_MAX_N {
        reduced = subsample(sample, SHAPIRO_MAX_N, SUBSAMPLE_SEED);
        (
            reduced.as_slice(),
            Some(format!(
                "tested a fixed-seed subsample of {} from n = {}",
                SHAPIRO_MAX_N,
                sample.len()
            )),
        )
    } else {
        (sample, None)
    };

    match shapiro_wilk(data) {
        Ok((w, p)) => {
            let mut check = AssumptionCheck::evaluated(NAME, w, p);
            check.note = note;
            check
        }
        Err(e) => {
            debug!(error = %e, "normality check indeterminate");
            AssumptionCheck::indeterminate(NAME, e.to_string())
        }
    }
}

/// Homogeneity of variance across samples.
///
/// Requires at least two samples with at least two observations each.
pub fn check_homogeneity(samples: &[&[f64]], test: HomogeneityTest) -> AssumptionCheck {
    let name = match test {
        HomogeneityTest::Levene => "Levene (median)",
        HomogeneityTest::LeveneMean => "Levene (mean)",
        HomogeneityTest::Bartlett => "Bartlett",
    };
    if samples.len() < 2 {
        return AssumptionCheck::indeterminate(name, "fewer than two groups");
    }
    if samples.iter().any(|s| s.len() < 2) {
        return AssumptionCheck::indeterminate(name, "a group has fewer than two observations");
    }
    let result = match test {
        HomogeneityTest::Levene => levene(samples, median),
        HomogeneityTest::LeveneMean => levene(samples, mean),
        HomogeneityTest::Bartlett => bartlett(samples),
    };
    match result {
        Ok((stat, p)) => AssumptionCheck::evaluated(name, stat, p),
        Err(e) => AssumptionCheck::indeterminate(name, e.to_string()),
    }
}

const SW_C1: [f64; 6] = [0.0, 0.221157, -0.147981, -2.071190, 4.434685, -2.706056];
const SW_C2: [f64; 6] = [0.0, 0.042981, -0.293762, -1.752461, 5.682633, -3.582633];
const SW_C3: [f64; 4] = [0.5440, -0.39978, 0.025054, -6.714e-4];
const SW_C4: [f64; 4] = [1.3822, -0.77857, 0.062767, -0.0020322];
const SW_C5: [f64; 4] = [-1.5861, -0.31082, -0.083751, 0.0038915];
const SW_C6: [f64; 3] = [-0.4803, -0.082676, 0.0030302];
const SW_G: [f64; 2] = [-2.273, 0.459];

fn poly(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Shapiro-Wilk W and p-value (Royston 1995).
pub fn shapiro_wilk(sample: &[f64]) -> Result<(f64, f64), AnalysisError> {
    let n = sample.len();
    if !(SHAPIRO_MIN_N..=SHAPIRO_MAX_N).contains(&n) {
        return Err(AnalysisError::InsufficientData(format!(
            "Shapiro-Wilk needs {} to {} observations, got {}",
            SHAPIRO_MIN_N, SHAPIRO_MAX_N, n
        )));
    }
    let x = sorted(sample);
    if x[n - 1] - x[0] < 1e-19 {
        return Err(AnalysisError::ZeroVariance(
            "all observations are identical".to_string(),
        ));
    }

    let an = n as f64;
    let nn2 = n / 2;
    let mut a = vec![0.0; nn2];
    if n == 3 {
        a[0] = std::f64::consts::FRAC_1_SQRT_2;
    } else {
        let an25 = an + 0.25;
        let m: Vec<f64> = (1..=nn2)
            .map(|i| normal_quantile((i as f64 - 0.375) / an25))
            .collect();
        let summ2 = 2.0 * m.iter().map(|v| v * v).sum::<f64>();
        let ssumm2 = summ2.sqrt();
        let rsn = 1.0 / an.sqrt();
        let a1 = poly(&SW_C1, rsn) - m[0] / ssumm2;

        let (start, fac) = if n > 5 {
            let a2 = -m[1] / ssumm2 + poly(&SW_C2, rsn);
            let fac = ((summ2 - 2.0 * m[0] * m[0] - 2.0 * m[1] * m[1])
                / (1.0 - 2.0 * a1 * a1 - 2.0 * a2 * a2))
                .sqrt();
            a[1] = a2;
            (2, fac)
        } else {
            let fac = ((summ2 - 2.0 * m[0] * m[0]) / (1.0 - 2.0 * a1 * a1)).sqrt();
            (1, fac)
        };
        a[0] = a1;
        for i in start..nn2 {
            a[i] = -m[i] / fac;
        }
    }

    let mu = mean(&x);
    let ssq: f64 = x.iter().map(|v| (v - mu).powi(2)).sum();
    let numerator: f64 = a
        .iter()
        .enumerate()
        .map(|(i, ai)| ai * (x[n - 1 - i] - x[i]))
        .sum();
    let w = (numerator * numerator / ssq).min(1.0);

    if n == 3 {
        let pi6 = 6.0 / std::f64::consts::PI;
        let stqr = std::f64::consts::FRAC_PI_3;
        let p = (pi6 * (w.sqrt().asin() - stqr)).max(0.0);
        return Ok((w, p.min(1.0)));
    }

    let w1 = (1.0 - w).ln();
    let p = if n <= 11 {
        let gamma = poly(&SW_G, an);
        if w1 >= gamma {
            1e-99
        } else {
            let y = -(gamma - w1).ln();
            let m = poly(&SW_C3, an);
            let s = poly(&SW_C4, an).exp();
            normal_sf((y - m) / s)
        }
    } else {
        let xx = an.ln();
        let m = poly(&SW_C5, xx);
        let s = poly(&SW_C6, xx).exp();
        normal_sf((w1 - m) / s)
    };

    Ok((w, p.clamp(0.0, 1.0)))
}

fn levene(samples: &[&[f64]], center: fn(&[f64]) -> f64) -> Result<(f64, f64), AnalysisError> {
    let k = samples.len();
    let deviations: Vec<Vec<f64>> = samples
        .iter()
        .map(|s| {
            let c = center(s);
            s.iter().map(|v| (v - c).abs()).collect()
        })
        .collect();
    let n_total: usize = deviations.iter().map(Vec::len).sum();
    let grand = deviations.iter().flatten().sum::<f64>() / n_total as f64;
    let means: Vec<f64> = deviations.iter().map(|d| mean(d)).collect();

    let between: f64 = deviations
        .iter()
        .zip(&means)
        .map(|(d, m)| d.len() as f64 * (m - grand).powi(2))
        .sum();
    let within: f64 = deviations
        .iter()
        .zip(&means)
        .map(|(d, m)| d.iter().map(|v| (v - m).powi(2)).sum::<f64>())
        .sum();
    if within <= 0.0 {
        return Err(AnalysisError::ZeroVariance(
            "absolute deviations are constant within every group".to_string(),
        ));
    }

    let df1 = (k - 1) as f64;
    let df2 = (n_total - k) as f64;
    let w = (df2 / df1) * between / within;
    Ok((w, f_sf(w, df1, df2)?))
}

fn bartlett(samples: &[&[f64]]) -> Result<(f64, f64), AnalysisError> {
    let k = samples.len() as f64;
    let variances: Vec<f64> = samples.iter().map(|s| variance(s)).collect();
    if variances.iter().any(|v| *v <= 0.0 || !v.is_finite()) {
        return Err(AnalysisError::ZeroVariance(
            "a group has zero variance".to_string(),
        ));
    }
    let n_total: f64 = samples.iter().map(|s| s.len() as f64).sum();
    let pooled = samples
        .iter()
        .zip(&variances)
        .map(|(s, v)| (s.len() as f64 - 1.0) * v)
        .sum::<f64>()
        / (n_total - k);
    let numerator = (n_total - k) * pooled.ln()
        - samples
            .iter()
            .zip(&variances)
            .map(|(s, v)| (s.len() as f64 - 1.0) * v.ln())
            .sum::<f64>();
    let correction = 1.0
        + (samples
            .iter()
            .map(|s| 1.0 / (s.len() as f64 - 1.0))
            .sum::<f64>()
            - 1.0 / (n_total - k))
            / (3.0 * (k - 1.0));
    let t = numerator / correction;
    Ok((t, chi2_sf(t, k - 1.0)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal_scores(n: usize, mu: f64, sd: f64) -> Vec<f64> {
        (1..=n)
            .map(|i| mu + sd * normal_quantile((i as f64 - 0.5) / n as f64))
            .collect()
    }

    #[test]
    fn test_shapiro_three_equally_spaced() {
        let (w, p) = shapiro_wilk(&[1.0, 2.0, 3.0]).unwrap();
        assert!((w - 1.0).abs() < 1e-9);
        assert!((p - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_shapiro_normal_sample_passes() {
        let check = check_normality(&normal_scores(40, 10.0, 2.0));
        assert_eq!(check.passed, Some(true));
        assert!(check.statistic.unwrap() > 0.95);
    }

    #[test]
    fn test_shapiro_skewed_sample_fails() {
        let skewed: Vec<f64> = (1..=30).map(|i| (i as f64).powi(4)).collect();
        let check = check_normality(&skewed);
        assert_eq!(check.passed, Some(false));
        assert!(check.p_value.unwrap() < 0.05);
    }

    #[test]
    fn test_small_sample_is_indeterminate() {
        let check = check_normality(&[1.0, 2.0]);
        assert_eq!(check.passed, None);
        assert!(check.p_value.is_none());
        assert!(!check.confirmed());
    }

    #[test]
    fn test_constant_sample_is_indeterminate() {
        let check = check_normality(&[3.0; 10]);
        assert_eq!(check.passed, None);
    }

    #[test]
    fn test_large_sample_is_subsampled_deterministically() {
        let big = normal_scores(6000, 0.0, 1.0);
        let a = check_normality(&big);
        let b = check_normality(&big);
        assert_eq!(a, b);
        assert!(a.note.unwrap().contains("subsample"));
        assert!(a.passed.is_some());
    }

    #[test]
    fn test_levene_detects_heterogeneity() {
        let a = normal_scores(30, 0.0, 1.0);
        let b = normal_scores(30, 0.0, 1.0);
        let c = normal_scores(30, 0.0, 10.0);
        let same = check_homogeneity(&[&a, &b], HomogeneityTest::Levene);
        assert_eq!(same.passed, Some(true));
        let diff = check_homogeneity(&[&a, &c], HomogeneityTest::Levene);
        assert_eq!(diff.passed, Some(false));
        let diff = check_homogeneity(&[&a, &c], HomogeneityTest::Bartlett);
        assert_eq!(diff.passed, Some(false));
    }

    #[test]
    fn test_homogeneity_indeterminate_cases() {
        let a = [1.0, 2.0, 3.0];
        let check = check_homogeneity(&[&a], HomogeneityTest::Levene);
        assert_eq!(check.passed, None);
        let check = check_homogeneity(&[&a, &[1.0]], HomogeneityTest::Levene);
        assert_eq!(check.passed, None);
    }

    #[test]
    fn test_report_conservative_flags() {
        let groups = vec![
            ("a".to_string(), normal_scores(20, 0.0, 1.0)),
            ("b".to_string(), vec![1.0]),
        ];
        let report = AssumptionReport::for_groups(&groups, HomogeneityTest::Levene);
        assert!(!report.all_normal());
        assert!(!report.homogeneous());
        assert_eq!(report.normality[1].check.passed, None);
        assert_eq!(report.homogeneity.as_ref().unwrap().passed, None);
    }
}
