//! Linear (OLS) and logistic (IRLS) regression.

use nalgebra::DMatrix;
use serde_json::{json, Value};
use tracing::debug;

use super::roc::{auc, downsample, roc_curve};
use super::ExecutionContext;
use crate::dataset::{Column, Dataset};
use crate::error::AnalysisError;
use crate::options::{CommonOptions, RegressionOptions};
use crate::registry::{MethodId, RoleName};
use crate::result::{json_number, AnalysisResult};
use crate::stats::descriptive::{mean, sum_sq_dev};
use crate::stats::distributions::{chi2_sf, f_sf, t_critical, t_p_value, z_critical, z_p_value, Alternative};
use crate::stats::linalg::{from_rows, mul_vec, spd_inverse, weighted_gram, weighted_xty};

/// Predictor matrix with named columns.
#[derive(Debug, Clone)]
pub struct Design {
    pub names: Vec<String>,
    pub x: DMatrix<f64>,
}

/// Build a predictor matrix over `rows`.
///
/// Numeric covariates enter as-is. Categorical covariates are one-hot
/// encoded against their first level, with columns named `col[T.level]`.
pub fn design_matrix(
    dataset: &Dataset,
    rows: &[usize],
    covariates: &[String],
    intercept: bool,
) -> Result<Design, AnalysisError> {
    let mut names = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();
    if intercept {
        names.push("Intercept".to_string());
        columns.push(vec![1.0; rows.len()]);
    }
    for name in covariates {
        match dataset.column(name)? {
            Column::Numeric(values) => {
                names.push(name.clone());
                columns.push(rows.iter().map(|&r| values[r].unwrap_or(f64::NAN)).collect());
            }
            column @ Column::Categorical(_) => {
                let labels = dataset.distinct_labels(name)?;
                let present: Vec<String> = rows.iter().filter_map(|&r| column.label(r)).collect();
                for level in labels.iter().skip(1).filter(|l| present.contains(l)) {
                    names.push(format!("{}[T.{}]", name, level));
                    columns.push(
                        present
                            .iter()
                            .map(|l| if l == level { 1.0 } else { 0.0 })
                            .collect(),
                    );
                }
            }
        }
    }
    let x_rows: Vec<Vec<f64>> = (0..rows.len())
        .map(|i| columns.iter().map(|c| c[i]).collect())
        .collect();
    Ok(Design {
        names,
        x: from_rows(&x_rows),
    })
}

/// One row of a coefficient table.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficient {
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    pub statistic: f64,
    pub p_value: f64,
    pub ci_low: f64,
    pub ci_high: f64,
}

impl Coefficient {
    pub fn to_json(&self) -> Value {
        json!({
            "term": self.term,
            "estimate": json_number(self.estimate),
            "std_error": json_number(self.std_error),
            "statistic": json_number(self.statistic),
            "p_value": json_number(self.p_value),
            "ci_low": json_number(self.ci_low),
            "ci_high": json_number(self.ci_high),
        })
    }
}

/// Ordinary least squares fit.
#[derive(Debug, Clone)]
pub struct OlsFit {
    pub coefficients: Vec<Coefficient>,
    pub fitted: Vec<f64>,
    pub r_squared: f64,
    pub adj_r_squared: f64,
    pub f_statistic: f64,
    pub f_p_value: f64,
    pub df_model: f64,
    pub df_resid: f64,
    pub sigma: f64,
    pub aic: f64,
    pub bic: f64,
}

/// Fit `y ~ X` by least squares. `X` must contain an intercept column.
pub fn ols(design: &Design, y: &[f64], confidence_level: f64) -> Result<OlsFit, AnalysisError> {
    let n = y.len();
    let p = design.x.ncols();
    if n <= p {
        return Err(AnalysisError::InsufficientData(format!(
            "{} observations for {} parameters",
            n, p
        )));
    }
    let sst = sum_sq_dev(y);
    if sst == 0.0 {
        return Err(AnalysisError::ZeroVariance("outcome is constant".to_string()));
    }
    let xtx_inv = spd_inverse(&weighted_gram(&design.x, None))?;
    let beta: Vec<f64> = (&xtx_inv * weighted_xty(&design.x, y, None)).as_slice().to_vec();
    let fitted = mul_vec(&design.x, &beta);
    let sse: f64 = y.iter().zip(&fitted).map(|(a, b)| (a - b).powi(2)).sum();

    let nf = n as f64;
    let df_resid = (n - p) as f64;
    let df_model = (p - 1) as f64;
    let sigma2 = sse / df_resid;
    let crit = t_critical(confidence_level, df_resid)?;
    let coefficients = design
        .names
        .iter()
        .zip(&beta)
        .zip(xtx_inv.diagonal().iter())
        .map(|((term, &estimate), v)| {
            let std_error = (v * sigma2).sqrt();
            let statistic = estimate / std_error;
            Ok(Coefficient {
                term: term.clone(),
                estimate,
                std_error,
                statistic,
                p_value: t_p_value(statistic, df_resid, Alternative::TwoSided)?,
                ci_low: estimate - crit * std_error,
                ci_high: estimate + crit * std_error,
            })
        })
        .collect::<Result<Vec<_>, AnalysisError>>()?;

    let r_squared = 1.0 - sse / sst;
    let adj_r_squared = 1.0 - (1.0 - r_squared) * (nf - 1.0) / df_resid;
    let (f_statistic, f_p_value) = if df_model > 0.0 && sse > 0.0 {
        let f = ((sst - sse) / df_model) / sigma2;
        (f, f_sf(f, df_model, df_resid)?)
    } else if df_model > 0.0 {
        (f64::INFINITY, 0.0)
    } else {
        (f64::NAN, 1.0)
    };
    let llf = -nf / 2.0 * ((2.0 * std::f64::consts::PI).ln() + (sse / nf).ln() + 1.0);
    Ok(OlsFit {
        coefficients,
        fitted,
        r_squared,
        adj_r_squared,
        f_statistic,
        f_p_value,
        df_model,
        df_resid,
        sigma: sigma2.sqrt(),
        aic: -2.0 * llf + 2.0 * p as f64,
        bic: -2.0 * llf + p as f64 * nf.ln(),
    })
}

/// Logistic fit by iteratively reweighted least squares.
#[derive(Debug, Clone)]
pub struct LogitFit {
    pub coefficients: Vec<Coefficient>,
    pub probabilities: Vec<f64>,
    pub log_likelihood: f64,
    pub null_log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
}

const PROB_FLOOR: f64 = 1e-10;

fn sigmoid(eta: f64) -> f64 {
    (1.0 / (1.0 + (-eta).exp())).clamp(PROB_FLOOR, 1.0 - PROB_FLOOR)
}

fn bernoulli_ll(y: &[f64], mu: &[f64]) -> f64 {
    y.iter()
        .zip(mu)
        .map(|(y, m)| y * m.ln() + (1.0 - y) * (1.0 - m).ln())
        .sum()
}

/// Fit `P(y = 1) = logistic(X b)`.
pub fn logistic(
    design: &Design,
    y: &[f64],
    confidence_level: f64,
    max_iter: usize,
    tol: f64,
) -> Result<LogitFit, AnalysisError> {
    let n = y.len();
    let p = design.x.ncols();
    if n <= p {
        return Err(AnalysisError::InsufficientData(format!(
            "{} observations for {} parameters",
            n, p
        )));
    }
    let mut beta = vec![0.0; p];
    let mut converged = false;
    let mut iterations = 0;
    while iterations < max_iter {
        iterations += 1;
        let eta = mul_vec(&design.x, &beta);
        let mu: Vec<f64> = eta.iter().map(|e| sigmoid(*e)).collect();
        let w: Vec<f64> = mu.iter().map(|m| m * (1.0 - m)).collect();
        let z: Vec<f64> = (0..n).map(|i| eta[i] + (y[i] - mu[i]) / w[i]).collect();
        let gram_inv = spd_inverse(&weighted_gram(&design.x, Some(&w)))?;
        let next: Vec<f64> = (gram_inv * weighted_xty(&design.x, &z, Some(&w)))
            .as_slice()
            .to_vec();
        let step = next
            .iter()
            .zip(&beta)
            .fold(0.0_f64, |m, (a, b)| m.max((a - b).abs()));
        beta = next;
        if step < tol {
            converged = true;
            break;
        }
    }
    let eta = mul_vec(&design.x, &beta);
    let mu: Vec<f64> = eta.iter().map(|e| sigmoid(*e)).collect();
    let w: Vec<f64> = mu.iter().map(|m| m * (1.0 - m)).collect();
    let cov = spd_inverse(&weighted_gram(&design.x, Some(&w)))?;

    let z = z_critical(confidence_level);
    let coefficients = design
        .names
        .iter()
        .zip(&beta)
        .zip(cov.diagonal().iter())
        .map(|((term, &estimate), v)| {
            let std_error = v.sqrt();
            let statistic = estimate / std_error;
            Coefficient {
                term: term.clone(),
                estimate,
                std_error,
                statistic,
                p_value: z_p_value(statistic, Alternative::TwoSided),
                ci_low: estimate - z * std_error,
                ci_high: estimate + z * std_error,
            }
        })
        .collect();

    let p_bar = mean(y).clamp(PROB_FLOOR, 1.0 - PROB_FLOOR);
    let null_log_likelihood = bernoulli_ll(y, &vec![p_bar; n]);
    Ok(LogitFit {
        coefficients,
        log_likelihood: bernoulli_ll(y, &mu),
        probabilities: mu,
        null_log_likelihood,
        iterations,
        converged,
    })
}

fn coefficient_table(coefficients: &[Coefficient]) -> Value {
    Value::Array(coefficients.iter().map(Coefficient::to_json).collect())
}

fn covariate_rows(
    ctx: &ExecutionContext<'_>,
    target: &str,
) -> Result<(Vec<String>, Vec<usize>), AnalysisError> {
    let covariates = ctx.roles.covariates.clone();
    if covariates.is_empty() {
        return Err(AnalysisError::InvalidOption(
            "regression needs at least one covariate".to_string(),
        ));
    }
    let mut columns: Vec<&str> = vec![target];
    columns.extend(covariates.iter().map(String::as_str));
    let rows = ctx.dataset.complete_rows(&columns)?;
    Ok((covariates, rows))
}

/// Execute linear or logistic regression.
pub fn execute(
    method: MethodId,
    ctx: &ExecutionContext<'_>,
    options: &RegressionOptions,
) -> Result<AnalysisResult, AnalysisError> {
    match method {
        MethodId::LinearRegression => linear(ctx, options),
        MethodId::LogisticRegression => logistic_model(ctx, options),
        other => Err(AnalysisError::InvalidOption(format!(
            "{} is not a regression method",
            other
        ))),
    }
}

fn linear(ctx: &ExecutionContext<'_>, options: &RegressionOptions) -> Result<AnalysisResult, AnalysisError> {
    let alpha = options.alpha(ctx.defaults);
    let level = options.confidence_level(ctx.defaults);
    let target = ctx.roles.require(RoleName::Target)?;
    let (covariates, rows) = covariate_rows(ctx, target)?;
    let column = ctx.dataset.column(target)?;
    let y: Vec<f64> = rows.iter().filter_map(|&r| column.number(r)).collect();
    let design = design_matrix(ctx.dataset, &rows, &covariates, true)?;
    if design.x.ncols() < 2 {
        return Err(AnalysisError::InsufficientData(
            "no usable predictor columns".to_string(),
        ));
    }
    let fit = ols(&design, &y, level)?;
    debug!(n = y.len(), r_squared = fit.r_squared, "OLS fit");

    let mut result = AnalysisResult::new(MethodId::LinearRegression, MethodId::LinearRegression.display_name())
        .with_test(fit.f_statistic, fit.f_p_value, alpha)
        .with_effect_size("r_squared", fit.r_squared, None)
        .with_extra("coefficients", coefficient_table(&fit.coefficients))
        .with_extra("r_squared", json_number(fit.r_squared))
        .with_extra("adj_r_squared", json_number(fit.adj_r_squared))
        .with_extra("df_model", json_number(fit.df_model))
        .with_extra("df_resid", json_number(fit.df_resid))
        .with_extra("residual_std_error", json_number(fit.sigma))
        .with_extra("aic", json_number(fit.aic))
        .with_extra("bic", json_number(fit.bic))
        .with_extra("n", y.len());
    result.groups = covariates;
    result.plot_data = y
        .iter()
        .zip(&fit.fitted)
        .map(|(a, p)| json!({"actual": a, "predicted": p, "residual": a - p}))
        .collect();
    Ok(result)
}

fn logistic_model(ctx: &ExecutionContext<'_>, options: &RegressionOptions) -> Result<AnalysisResult, AnalysisError> {
    let alpha = options.alpha(ctx.defaults);
    let level = options.confidence_level(ctx.defaults);
    let target = ctx.roles.require(RoleName::Target)?;
    let (covariates, rows) = covariate_rows(ctx, target)?;

    let labels = ctx.dataset.distinct_labels(target)?;
    if labels.len() != 2 {
        return Err(AnalysisError::InvalidOption(format!(
            "logistic regression needs a binary outcome, '{}' has {} levels",
            target,
            labels.len()
        )));
    }
    let positive = match &options.positive_class {
        Some(label) if labels.contains(label) => label.clone(),
        Some(label) => {
            return Err(AnalysisError::InvalidOption(format!(
                "positive_class '{}' is not one of {:?}",
                label, labels
            )))
        }
        None => labels[1].clone(),
    };
    let column = ctx.dataset.column(target)?;
    let y: Vec<f64> = rows
        .iter()
        .filter_map(|&r| column.label(r))
        .map(|l| if l == positive { 1.0 } else { 0.0 })
        .collect();
    let events = y.iter().filter(|v| **v == 1.0).count();
    if events == 0 || events == y.len() {
        return Err(AnalysisError::ZeroVariance(
            "outcome has a single class after cleaning".to_string(),
        ));
    }

    let design = design_matrix(ctx.dataset, &rows, &covariates, true)?;
    if design.x.ncols() < 2 {
        return Err(AnalysisError::InsufficientData(
            "no usable predictor columns".to_string(),
        ));
    }
    let fit = logistic(&design, &y, level, options.max_iter, options.tol)?;
    debug!(iterations = fit.iterations, converged = fit.converged, "IRLS fit");

    let n = y.len() as f64;
    let k = design.x.ncols() as f64;
    let lr = (2.0 * (fit.log_likelihood - fit.null_log_likelihood)).max(0.0);
    let lr_p = chi2_sf(lr, k - 1.0)?;
    let pseudo_r2 = 1.0 - fit.log_likelihood / fit.null_log_likelihood;
    let odds: Vec<Value> = fit
        .coefficients
        .iter()
        .filter(|c| c.term != "Intercept")
        .map(|c| {
            json!({
                "term": c.term,
                "odds_ratio": json_number(c.estimate.exp()),
                "ci_low": json_number(c.ci_low.exp()),
                "ci_high": json_number(c.ci_high.exp()),
                "p_value": json_number(c.p_value),
            })
        })
        .collect();
    let positive_flags: Vec<bool> = y.iter().map(|v| *v == 1.0).collect();
    let curve = roc_curve(&fit.probabilities, &positive_flags);

    let mut result = AnalysisResult::new(MethodId::LogisticRegression, MethodId::LogisticRegression.display_name())
        .with_test(lr, lr_p, alpha)
        .with_effect_size("pseudo_r_squared", pseudo_r2, None)
        .with_extra("coefficients", coefficient_table(&fit.coefficients))
        .with_extra("odds_ratios", Value::Array(odds))
        .with_extra("log_likelihood", json_number(fit.log_likelihood))
        .with_extra("null_log_likelihood", json_number(fit.null_log_likelihood))
        .with_extra("aic", json_number(-2.0 * fit.log_likelihood + 2.0 * k))
        .with_extra("bic", json_number(-2.0 * fit.log_likelihood + k * n.ln()))
        .with_extra("auc", json_number(auc(&curve)))
        .with_extra("positive_class", positive.as_str())
        .with_extra("iterations", fit.iterations)
        .with_extra("converged", fit.converged)
        .with_extra("n", y.len());
    result.groups = covariates;
    result.plot_data = downsample(&curve)
        .into_iter()
        .map(|p| json!({"fpr": p.fpr, "tpr": p.tpr}))
        .collect();

    if !fit.converged {
        result.warn(format!(
            "IRLS did not converge within {} iterations",
            options.max_iter
        ));
    }
    let extreme = fit
        .probabilities
        .iter()
        .filter(|p| **p <= 1e-8 || **p >= 1.0 - 1e-8)
        .count();
    let large = fit
        .coefficients
        .iter()
        .any(|c| c.term != "Intercept" && c.estimate.abs() > 15.0);
    if extreme > 0 || large {
        result.warn(
            "Possible complete or quasi-complete separation: some fitted probabilities are 0 or 1",
        );
    }
    Ok(result)
}
