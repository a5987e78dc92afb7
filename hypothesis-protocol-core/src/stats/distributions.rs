//! Tail probabilities and critical values built on `statrs`.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, StudentsT};
use statrs::function::erf::{erfc, erfc_inv};

use crate::error::AnalysisError;

/// Direction of the alternative hypothesis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Alternative {
    #[default]
    #[serde(alias = "two_sided")]
    TwoSided,
    Less,
    Greater,
}

impl Alternative {
    pub fn as_str(&self) -> &'static str {
        match self {
            Alternative::TwoSided => "two-sided",
            Alternative::Less => "less",
            Alternative::Greater => "greater",
        }
    }
}

/// Clamp a probability into `[0, 1]`, mapping NaN to 1.
pub fn clamp_p(p: f64) -> f64 {
    if p.is_nan() {
        1.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Standard normal survival function.
pub fn normal_sf(x: f64) -> f64 {
    0.5 * erfc(x / std::f64::consts::SQRT_2)
}

/// Standard normal quantile.
pub fn normal_quantile(p: f64) -> f64 {
    -std::f64::consts::SQRT_2 * erfc_inv(2.0 * p)
}

/// Two-sided critical z for a confidence level, e.g. 1.96 for 0.95.
pub fn z_critical(confidence_level: f64) -> f64 {
    normal_quantile(1.0 - (1.0 - confidence_level) / 2.0)
}

/// p-value of a z statistic under `alternative`.
pub fn z_p_value(z: f64, alternative: Alternative) -> f64 {
    let p = match alternative {
        Alternative::TwoSided => 2.0 * normal_sf(z.abs()),
        Alternative::Greater => normal_sf(z),
        Alternative::Less => normal_cdf(z),
    };
    clamp_p(p)
}

fn students_t(df: f64) -> Result<StudentsT, AnalysisError> {
    StudentsT::new(0.0, 1.0, df).map_err(|e| {
        AnalysisError::Computation(format!("invalid t distribution (df = {}): {}", df, e))
    })
}

/// p-value of a t statistic with `df` degrees of freedom under `alternative`.
pub fn t_p_value(t: f64, df: f64, alternative: Alternative) -> Result<f64, AnalysisError> {
    let dist = students_t(df)?;
    let p = match alternative {
        Alternative::TwoSided => 2.0 * dist.sf(t.abs()),
        Alternative::Greater => dist.sf(t),
        Alternative::Less => dist.cdf(t),
    };
    Ok(clamp_p(p))
}

/// Quantile of Student's t.
pub fn t_quantile(p: f64, df: f64) -> Result<f64, AnalysisError> {
    Ok(students_t(df)?.inverse_cdf(p))
}

/// Two-sided critical t for a confidence level.
pub fn t_critical(confidence_level: f64, df: f64) -> Result<f64, AnalysisError> {
    t_quantile(1.0 - (1.0 - confidence_level) / 2.0, df)
}

/// Confidence bounds for an estimate with a t-distributed pivot.
///
/// One-sided alternatives leave the open side unbounded (`None`).
pub fn t_interval(
    estimate: f64,
    se: f64,
    df: f64,
    confidence_level: f64,
    alternative: Alternative,
) -> Result<(Option<f64>, Option<f64>), AnalysisError> {
    Ok(match alternative {
        Alternative::TwoSided => {
            let crit = t_critical(confidence_level, df)?;
            (Some(estimate - crit * se), Some(estimate + crit * se))
        }
        Alternative::Greater => {
            let crit = t_quantile(confidence_level, df)?;
            (Some(estimate - crit * se), None)
        }
        Alternative::Less => {
            let crit = t_quantile(confidence_level, df)?;
            (None, Some(estimate + crit * se))
        }
    })
}

/// Upper tail of the chi-square distribution.
pub fn chi2_sf(x: f64, df: f64) -> Result<f64, AnalysisError> {
    if x <= 0.0 {
        return Ok(1.0);
    }
    let dist = ChiSquared::new(df).map_err(|e| {
        AnalysisError::Computation(format!("invalid chi-square distribution (df = {}): {}", df, e))
    })?;
    Ok(clamp_p(dist.sf(x)))
}

/// Upper tail of the F distribution.
pub fn f_sf(f: f64, df1: f64, df2: f64) -> Result<f64, AnalysisError> {
    if f <= 0.0 {
        return Ok(1.0);
    }
    let dist = FisherSnedecor::new(df1, df2).map_err(|e| {
        AnalysisError::Computation(format!(
            "invalid F distribution (df = {}, {}): {}",
            df1, df2, e
        ))
    })?;
    Ok(clamp_p(dist.sf(f)))
}
