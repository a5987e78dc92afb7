//! Pearson, Spearman and Kendall correlation.

use serde_json::json;

use super::ExecutionContext;
use crate::assumptions::{check_normality, AssumptionReport, GroupNormality};
use crate::error::AnalysisError;
use crate::options::{CommonOptions, CorrelationOptions};
use crate::registry::{MethodId, RoleName};
use crate::result::{json_number, AnalysisResult};
use crate::stats::descriptive::{pearson_r, rank, tie_counts};
use crate::stats::distributions::{normal_quantile, t_p_value, z_critical, z_p_value, Alternative};

/// A correlation coefficient with its test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    pub coefficient: f64,
    /// t (Pearson, Spearman) or z (Kendall).
    pub statistic: f64,
    pub p_value: f64,
}

fn check_pairs(x: &[f64], y: &[f64]) -> Result<(), AnalysisError> {
    if x.len() != y.len() {
        return Err(AnalysisError::Computation(format!(
            "correlation inputs differ in length ({} vs {})",
            x.len(),
            y.len()
        )));
    }
    if x.len() < 3 {
        return Err(AnalysisError::InsufficientData(format!(
            "correlation needs at least 3 complete pairs, found {}",
            x.len()
        )));
    }
    Ok(())
}

fn t_test_of_r(r: f64, n: usize, alternative: Alternative) -> Result<Correlation, AnalysisError> {
    let df = n as f64 - 2.0;
    let t = if r.abs() >= 1.0 {
        r.signum() * f64::INFINITY
    } else {
        r * (df / (1.0 - r * r)).sqrt()
    };
    let p_value = if t.is_infinite() {
        match alternative {
            Alternative::TwoSided => 0.0,
            Alternative::Greater => if r > 0.0 { 0.0 } else { 1.0 },
            Alternative::Less => if r < 0.0 { 0.0 } else { 1.0 },
        }
    } else {
        t_p_value(t, df, alternative)?
    };
    Ok(Correlation {
        coefficient: r,
        statistic: t,
        p_value,
    })
}

/// Pearson's r with a t-test.
pub fn pearson(x: &[f64], y: &[f64], alternative: Alternative) -> Result<Correlation, AnalysisError> {
    check_pairs(x, y)?;
    let r = pearson_r(x, y);
    if r.is_nan() {
        return Err(AnalysisError::ZeroVariance(
            "a correlated variable is constant".to_string(),
        ));
    }
    t_test_of_r(r, x.len(), alternative)
}

/// Spearman's rho (Pearson on average ranks) with the t approximation.
pub fn spearman(x: &[f64], y: &[f64], alternative: Alternative) -> Result<Correlation, AnalysisError> {
    check_pairs(x, y)?;
    pearson(&rank(x), &rank(y), alternative)
}

/// Kendall's tau-b with the tie-corrected normal approximation.
pub fn kendall(x: &[f64], y: &[f64], alternative: Alternative) -> Result<Correlation, AnalysisError> {
    check_pairs(x, y)?;
    let n = x.len();
    let (mut concordant, mut discordant) = (0.0, 0.0);
    let (mut tied_x, mut tied_y) = (0.0, 0.0);
    for i in 0..n {
        for j in i + 1..n {
            let dx = x[i] - x[j];
            let dy = y[i] - y[j];
            if dx == 0.0 && dy == 0.0 {
                tied_x += 1.0;
                tied_y += 1.0;
            } else if dx == 0.0 {
                tied_x += 1.0;
            } else if dy == 0.0 {
                tied_y += 1.0;
            } else if dx * dy > 0.0 {
                concordant += 1.0;
            } else {
                discordant += 1.0;
            }
        }
    }
    let fnn = n as f64;
    let n0 = fnn * (fnn - 1.0) / 2.0;
    let denom = ((n0 - tied_x) * (n0 - tied_y)).sqrt();
    if denom == 0.0 {
        return Err(AnalysisError::ZeroVariance(
            "a correlated variable is constant".to_string(),
        ));
    }
    let tau = ((concordant - discordant) / denom).clamp(-1.0, 1.0);

    let sums = |v: &[f64]| {
        tie_counts(v).into_iter().fold((0.0, 0.0, 0.0), |acc, t| {
            let t = t as f64;
            (
                acc.0 + t * (t - 1.0) * (2.0 * t + 5.0),
                acc.1 + t * (t - 1.0),
                acc.2 + t * (t - 1.0) * (t - 2.0),
            )
        })
    };
    let (xt0, xt1, xt2) = sums(x);
    let (yt0, yt1, yt2) = sums(y);
    let var = (fnn * (fnn - 1.0) * (2.0 * fnn + 5.0) - xt0 - yt0) / 18.0
        + xt1 * yt1 / (2.0 * fnn * (fnn - 1.0))
        + xt2 * yt2 / (9.0 * fnn * (fnn - 1.0) * (fnn - 2.0));
    let z = (concordant - discordant) / var.sqrt();
    Ok(Correlation {
        coefficient: tau,
        statistic: z,
        p_value: z_p_value(z, alternative),
    })
}

/// Fisher-z interval for a correlation coefficient.
///
/// `variance_factor` scales the `1 / (n - 3)` variance (1 for Pearson).
/// One-sided alternatives pin the open bound to ±1.
pub fn fisher_interval(
    r: f64,
    n: usize,
    variance_factor: f64,
    confidence_level: f64,
    alternative: Alternative,
) -> (Option<f64>, Option<f64>) {
    if n <= 3 {
        return (None, None);
    }
    let z = r.clamp(-0.999_999_999, 0.999_999_999).atanh();
    let se = (variance_factor / (n as f64 - 3.0)).sqrt();
    match alternative {
        Alternative::TwoSided => {
            let crit = z_critical(confidence_level);
            (Some((z - crit * se).tanh()), Some((z + crit * se).tanh()))
        }
        Alternative::Greater => {
            let crit = normal_quantile(confidence_level);
            (Some((z - crit * se).tanh()), Some(1.0))
        }
        Alternative::Less => {
            let crit = normal_quantile(confidence_level);
            (Some(-1.0), Some((z + crit * se).tanh()))
        }
    }
}

/// Execute a bivariate correlation.
pub fn execute(
    method: MethodId,
    ctx: &ExecutionContext<'_>,
    options: &CorrelationOptions,
) -> Result<AnalysisResult, AnalysisError> {
    let alpha = options.alpha(ctx.defaults);
    let level = options.confidence_level(ctx.defaults);
    let x_name = ctx.roles.require(RoleName::Target)?;
    let y_name = ctx.roles.require(RoleName::Second)?;
    let (x, y) = ctx.dataset.numeric_pairs(x_name, y_name)?;
    let n = x.len();

    let (test, effect_name, variance_factor) = match method {
        MethodId::Pearson => (pearson(&x, &y, options.alternative)?, "r", 1.0),
        MethodId::Spearman => (spearman(&x, &y, options.alternative)?, "rho", 1.06),
        MethodId::Kendall => {
            // Fieller's variance 0.437 / (n - 4), expressed against n - 3.
            let factor = 0.437 * (n as f64 - 3.0) / (n as f64 - 4.0).max(1.0);
            (kendall(&x, &y, options.alternative)?, "tau", factor)
        }
        other => {
            return Err(AnalysisError::InvalidOption(format!(
                "{} is not a correlation method",
                other
            )))
        }
    };
    let ci = fisher_interval(test.coefficient, n, variance_factor, level, options.alternative);

    let mut result = AnalysisResult::new(method, method.display_name())
        .with_test(test.coefficient, test.p_value, alpha)
        .with_effect_size(effect_name, test.coefficient, Some(ci))
        .with_extra("n", n)
        .with_extra("test_statistic", json_number(test.statistic))
        .with_extra("alternative", options.alternative.as_str())
        .with_extra("r_squared", json_number(test.coefficient * test.coefficient));
    result.groups = vec![x_name.to_string(), y_name.to_string()];
    result.plot_data = x
        .iter()
        .zip(&y)
        .map(|(a, b)| json!({ "x": a, "y": b }))
        .collect();
    result.assumptions = Some(AssumptionReport {
        normality: vec![
            GroupNormality {
                group: x_name.to_string(),
                check: check_normality(&x),
            },
            GroupNormality {
                group: y_name.to_string(),
                check: check_normality(&y),
            },
        ],
        homogeneity: None,
    });
    if n < 10 {
        result.warn(format!("Only {} complete pairs; the estimate is unstable", n));
    }
    Ok(result)
}
