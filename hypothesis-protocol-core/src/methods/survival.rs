//! Kaplan-Meier curves, the k-group log-rank test and Cox proportional
//! hazards.

use nalgebra::DMatrix;
use serde_json::{json, Value};
use tracing::debug;

use super::regression::design_matrix;
use super::ExecutionContext;
use crate::dataset::{format_label, Column};
use crate::error::AnalysisError;
use crate::options::{CommonOptions, SurvivalOptions};
use crate::registry::{MethodId, RoleName};
use crate::result::{json_number, AnalysisResult};
use crate::stats::distributions::{chi2_sf, z_critical, z_p_value, Alternative};
use crate::stats::linalg::{dot, mul_vec, spd_inverse};

/// One step of a Kaplan-Meier curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KmPoint {
    pub time: f64,
    pub at_risk: usize,
    pub events: usize,
    pub censored: usize,
    pub survival: f64,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
}

/// Product-limit estimate with Greenwood log(-log) bands.
#[derive(Debug, Clone, PartialEq)]
pub struct KmCurve {
    pub points: Vec<KmPoint>,
    pub median: Option<f64>,
}

fn distinct_times(times: &[f64]) -> Vec<f64> {
    let mut t = times.to_vec();
    t.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    t.dedup();
    t
}

/// Kaplan-Meier estimate. The curve starts at `(0, 1)`.
pub fn kaplan_meier(times: &[f64], events: &[bool], confidence_level: f64) -> KmCurve {
    let z = z_critical(confidence_level);
    let mut survival = 1.0;
    let mut greenwood = 0.0;
    let mut points = vec![KmPoint {
        time: 0.0,
        at_risk: times.len(),
        events: 0,
        censored: 0,
        survival: 1.0,
        ci_low: Some(1.0),
        ci_high: Some(1.0),
    }];
    let mut median = None;
    for t in distinct_times(times) {
        let at_risk = times.iter().filter(|&&x| x >= t).count();
        let d = times
            .iter()
            .zip(events)
            .filter(|(&x, &e)| x == t && e)
            .count();
        let c = times
            .iter()
            .zip(events)
            .filter(|(&x, &e)| x == t && !e)
            .count();
        if d > 0 {
            let (n, df) = (at_risk as f64, d as f64);
            survival *= 1.0 - df / n;
            greenwood += if at_risk > d { df / (n * (n - df)) } else { f64::INFINITY };
        }
        let (ci_low, ci_high) = if survival >= 1.0 {
            (Some(1.0), Some(1.0))
        } else if survival <= 0.0 || !greenwood.is_finite() {
            (None, None)
        } else {
            let log_s = survival.ln();
            let se = (greenwood / (log_s * log_s)).sqrt();
            let theta = (-log_s).ln();
            (
                Some((-(theta + z * se).exp()).exp()),
                Some((-(theta - z * se).exp()).exp()),
            )
        };
        if median.is_none() && survival <= 0.5 {
            median = Some(t);
        }
        points.push(KmPoint {
            time: t,
            at_risk,
            events: d,
            censored: c,
            survival,
            ci_low,
            ci_high,
        });
    }
    KmCurve { points, median }
}

/// Log-rank test across `k >= 2` groups.
///
/// Returns `(chi2, df, p)`.
pub fn log_rank(groups: &[(&[f64], &[bool])]) -> Result<(f64, f64, f64), AnalysisError> {
    let k = groups.len();
    if k < 2 {
        return Err(AnalysisError::InsufficientGroups { found: k, required: 2 });
    }
    let all_times: Vec<f64> = groups
        .iter()
        .flat_map(|(t, e)| t.iter().zip(e.iter()).filter(|(_, &ev)| ev).map(|(x, _)| *x))
        .collect();
    if all_times.is_empty() {
        return Err(AnalysisError::InsufficientData(
            "log-rank test needs at least one event".to_string(),
        ));
    }

    let mut observed_minus_expected = vec![0.0; k];
    let mut v = DMatrix::<f64>::zeros(k, k);
    for t in distinct_times(&all_times) {
        let at_risk: Vec<f64> = groups
            .iter()
            .map(|(times, _)| times.iter().filter(|&&x| x >= t).count() as f64)
            .collect();
        let deaths: Vec<f64> = groups
            .iter()
            .map(|(times, ev)| {
                times
                    .iter()
                    .zip(ev.iter())
                    .filter(|(&x, &e)| x == t && e)
                    .count() as f64
            })
            .collect();
        let n: f64 = at_risk.iter().sum();
        let d: f64 = deaths.iter().sum();
        for j in 0..k {
            observed_minus_expected[j] += deaths[j] - d * at_risk[j] / n;
        }
        if n > 1.0 {
            let factor = d * (n - d) / (n - 1.0);
            for i in 0..k {
                for j in 0..k {
                    let delta = if i == j { 1.0 } else { 0.0 };
                    v[(i, j)] += factor * at_risk[i] / n * (delta - at_risk[j] / n);
                }
            }
        }
    }

    let m = k - 1;
    let reduced = v.view((0, 0), (m, m)).clone_owned();
    let u = &observed_minus_expected[..m];
    let chi2 = dot(u, &mul_vec(&spd_inverse(&reduced)?, u)).max(0.0);
    let df = m as f64;
    Ok((chi2, df, chi2_sf(chi2, df)?))
}

/// A fitted Cox model.
#[derive(Debug, Clone)]
pub struct CoxFit {
    pub beta: Vec<f64>,
    pub std_errors: Vec<f64>,
    pub log_likelihood: f64,
    pub null_log_likelihood: f64,
    pub concordance: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Breslow partial log-likelihood with its gradient and information matrix.
fn partial_likelihood(
    x: &DMatrix<f64>,
    times: &[f64],
    events: &[bool],
    beta: &[f64],
) -> (f64, Vec<f64>, DMatrix<f64>) {
    let p = beta.len();
    let risk: Vec<f64> = mul_vec(x, beta).iter().map(|e| e.exp()).collect();
    let mut ll = 0.0;
    let mut grad = vec![0.0; p];
    let mut info = DMatrix::<f64>::zeros(p, p);
    let event_times: Vec<f64> = times
        .iter()
        .zip(events)
        .filter(|(_, &e)| e)
        .map(|(t, _)| *t)
        .collect();
    for t in distinct_times(&event_times) {
        let mut s0 = 0.0;
        let mut s1 = vec![0.0; p];
        let mut s2 = DMatrix::<f64>::zeros(p, p);
        for i in (0..times.len()).filter(|&i| times[i] >= t) {
            s0 += risk[i];
            for a in 0..p {
                s1[a] += risk[i] * x[(i, a)];
                for b in 0..p {
                    s2[(a, b)] += risk[i] * x[(i, a)] * x[(i, b)];
                }
            }
        }
        let dying: Vec<usize> = (0..times.len())
            .filter(|&i| times[i] == t && events[i])
            .collect();
        let d = dying.len() as f64;
        for &i in &dying {
            for a in 0..p {
                ll += x[(i, a)] * beta[a];
                grad[a] += x[(i, a)];
            }
        }
        ll -= d * s0.ln();
        for a in 0..p {
            grad[a] -= d * s1[a] / s0;
            for b in 0..p {
                info[(a, b)] += d * (s2[(a, b)] / s0 - s1[a] * s1[b] / (s0 * s0));
            }
        }
    }
    (ll, grad, info)
}

/// Harrell's concordance index for a risk score.
pub fn concordance_index(times: &[f64], events: &[bool], risk: &[f64]) -> f64 {
    let mut concordant = 0.0;
    let mut comparable = 0.0;
    for i in 0..times.len() {
        if !events[i] {
            continue;
        }
        for j in 0..times.len() {
            if times[i] < times[j] {
                comparable += 1.0;
                if risk[i] > risk[j] {
                    concordant += 1.0;
                } else if risk[i] == risk[j] {
                    concordant += 0.5;
                }
            }
        }
    }
    if comparable == 0.0 {
        0.5
    } else {
        concordant / comparable
    }
}

/// Fit a Cox model by Newton-Raphson with an L2 penalty of
/// `0.5 * penalizer * |beta|^2`.
pub fn cox_ph(
    x: &DMatrix<f64>,
    times: &[f64],
    events: &[bool],
    penalizer: f64,
    max_iter: usize,
) -> Result<CoxFit, AnalysisError> {
    let p = x.ncols();
    let penalized = |beta: &[f64]| {
        let (ll, grad, info) = partial_likelihood(x, times, events, beta);
        let pen_ll = ll - 0.5 * penalizer * dot(beta, beta);
        let pen_grad: Vec<f64> = grad.iter().zip(beta).map(|(g, b)| g - penalizer * b).collect();
        let pen_info = info + DMatrix::<f64>::identity(p, p) * penalizer;
        (pen_ll, pen_grad, pen_info)
    };

    let mut beta = vec![0.0; p];
    let (mut current, mut grad, mut info) = penalized(&beta);
    let mut converged = false;
    let mut iterations = 0;
    while iterations < max_iter {
        iterations += 1;
        let step = mul_vec(&spd_inverse(&info)?, &grad);
        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..20 {
            let candidate: Vec<f64> = beta.iter().zip(&step).map(|(b, s)| b + scale * s).collect();
            let eval = penalized(&candidate);
            if eval.0.is_finite() && eval.0 >= current - 1e-12 {
                accepted = Some((candidate, eval));
                break;
            }
            scale /= 2.0;
        }
        let Some((candidate, (ll, g, i))) = accepted else {
            break;
        };
        let change = candidate
            .iter()
            .zip(&beta)
            .fold(0.0_f64, |m, (a, b)| m.max((a - b).abs()));
        let gain = ll - current;
        beta = candidate;
        current = ll;
        grad = g;
        info = i;
        if change < 1e-9 || gain.abs() < 1e-12 {
            converged = true;
            break;
        }
    }

    let covariance = spd_inverse(&info)?;
    let std_errors = covariance.diagonal().iter().map(|v| v.sqrt()).collect();
    let (log_likelihood, _, _) = partial_likelihood(x, times, events, &beta);
    let (null_log_likelihood, _, _) = partial_likelihood(x, times, events, &vec![0.0; p]);
    let risk = mul_vec(x, &beta);
    Ok(CoxFit {
        concordance: concordance_index(times, events, &risk),
        beta,
        std_errors,
        log_likelihood,
        null_log_likelihood,
        iterations,
        converged,
    })
}

fn event_flags(
    column: &Column,
    rows: &[usize],
    event_value: Option<&str>,
    labels: &[String],
) -> Result<Vec<bool>, AnalysisError> {
    match (column, event_value) {
        (Column::Numeric(values), None) => Ok(rows
            .iter()
            .map(|&r| values[r].map(|v| v != 0.0).unwrap_or(false))
            .collect()),
        (Column::Numeric(values), Some(target)) => Ok(rows
            .iter()
            .map(|&r| values[r].map(|v| format_label(v) == target).unwrap_or(false))
            .collect()),
        (Column::Categorical(_), _) => {
            let observed = match event_value {
                Some(v) => v.to_string(),
                None if labels.len() == 2 => labels[1].clone(),
                None => {
                    return Err(AnalysisError::InvalidOption(format!(
                        "event column has {} levels; set event_value",
                        labels.len()
                    )))
                }
            };
            Ok(rows
                .iter()
                .map(|&r| column.label(r).as_deref() == Some(observed.as_str()))
                .collect())
        }
    }
}

struct SurvivalData {
    rows: Vec<usize>,
    times: Vec<f64>,
    events: Vec<bool>,
}

fn survival_data(
    ctx: &ExecutionContext<'_>,
    options: &SurvivalOptions,
    extra_columns: &[&str],
) -> Result<SurvivalData, AnalysisError> {
    let time_name = ctx.roles.require(RoleName::Target)?;
    let event_name = ctx.roles.require(RoleName::Event)?;
    let mut columns = vec![time_name, event_name];
    columns.extend_from_slice(extra_columns);
    let rows = ctx.dataset.complete_rows(&columns)?;
    let time_col = ctx.dataset.column(time_name)?;
    let times: Vec<f64> = rows.iter().filter_map(|&r| time_col.number(r)).collect();
    if times.iter().any(|t| *t < 0.0) {
        return Err(AnalysisError::InvalidOption(format!(
            "'{}' contains negative durations",
            time_name
        )));
    }
    let labels = ctx.dataset.distinct_labels(event_name)?;
    let events = event_flags(
        ctx.dataset.column(event_name)?,
        &rows,
        options.event_value.as_deref(),
        &labels,
    )?;
    if times.len() < 2 {
        return Err(AnalysisError::InsufficientData(format!(
            "{} complete observation(s)",
            times.len()
        )));
    }
    Ok(SurvivalData { rows, times, events })
}

/// Execute Kaplan-Meier with log-rank, or Cox regression.
pub fn execute(
    method: MethodId,
    ctx: &ExecutionContext<'_>,
    options: &SurvivalOptions,
) -> Result<AnalysisResult, AnalysisError> {
    match method {
        MethodId::KaplanMeier => km_execute(ctx, options),
        MethodId::CoxRegression => cox_execute(ctx, options),
        other => Err(AnalysisError::InvalidOption(format!(
            "{} is not a survival method",
            other
        ))),
    }
}

fn km_execute(ctx: &ExecutionContext<'_>, options: &SurvivalOptions) -> Result<AnalysisResult, AnalysisError> {
    let alpha = options.alpha(ctx.defaults);
    let level = options.confidence_level(ctx.defaults);
    let group_name = ctx.roles.group.as_deref();
    let data = survival_data(ctx, options, group_name.as_slice())?;

    let mut strata: Vec<(String, Vec<f64>, Vec<bool>)> = Vec::new();
    match group_name {
        Some(name) => {
            let column = ctx.dataset.column(name)?;
            for label in ctx.dataset.distinct_labels(name)? {
                let (t, e): (Vec<f64>, Vec<bool>) = data
                    .rows
                    .iter()
                    .enumerate()
                    .filter(|(_, &r)| column.label(r).as_deref() == Some(label.as_str()))
                    .map(|(i, _)| (data.times[i], data.events[i]))
                    .unzip();
                if !t.is_empty() {
                    strata.push((label, t, e));
                }
            }
        }
        None => strata.push(("All".to_string(), data.times.clone(), data.events.clone())),
    }

    let mut result = AnalysisResult::new(MethodId::KaplanMeier, MethodId::KaplanMeier.display_name());
    let mut summaries = serde_json::Map::new();
    let mut plot_data = Vec::new();
    for (label, t, e) in &strata {
        let curve = kaplan_meier(t, e, level);
        summaries.insert(
            label.clone(),
            json!({
                "n": t.len(),
                "events": e.iter().filter(|x| **x).count(),
                "median_survival": curve.median.map(json_number).unwrap_or_default(),
            }),
        );
        plot_data.extend(curve.points.iter().map(|p| {
            json!({
                "group": label,
                "time": p.time,
                "survival": p.survival,
                "ci_low": p.ci_low.map(json_number).unwrap_or_default(),
                "ci_high": p.ci_high.map(json_number).unwrap_or_default(),
                "at_risk": p.at_risk,
                "events": p.events,
                "censored": p.censored,
            })
        }));
    }

    if strata.len() >= 2 {
        let inputs: Vec<(&[f64], &[bool])> = strata
            .iter()
            .map(|(_, t, e)| (t.as_slice(), e.as_slice()))
            .collect();
        let (chi2, df, p) = log_rank(&inputs)?;
        result = result
            .with_test(chi2, p, alpha)
            .with_extra("df", json_number(df))
            .with_extra("test", if strata.len() == 2 { "log-rank" } else { "multivariate log-rank" });
    } else {
        result.warn("Log-rank test needs at least two groups; only the survival curve is reported");
    }

    result.groups = strata.iter().map(|(l, _, _)| l.clone()).collect();
    result.plot_data = plot_data;
    Ok(result
        .with_extra("curves", Value::Object(summaries))
        .with_extra("n", data.times.len())
        .with_extra("events", data.events.iter().filter(|e| **e).count()))
}

fn cox_execute(ctx: &ExecutionContext<'_>, options: &SurvivalOptions) -> Result<AnalysisResult, AnalysisError> {
    let alpha = options.alpha(ctx.defaults);
    let level = options.confidence_level(ctx.defaults);
    let mut covariates: Vec<String> = Vec::new();
    if let Some(group) = &ctx.roles.group {
        covariates.push(group.clone());
    }
    covariates.extend(ctx.roles.covariates.iter().cloned());
    if covariates.is_empty() {
        return Err(AnalysisError::InvalidOption(
            "Cox regression needs a group or at least one covariate".to_string(),
        ));
    }
    let extra_columns: Vec<&str> = covariates.iter().map(String::as_str).collect();
    let data = survival_data(ctx, options, &extra_columns)?;
    let n_events = data.events.iter().filter(|e| **e).count();
    if n_events == 0 {
        return Err(AnalysisError::InsufficientData(
            "Cox regression needs at least one event".to_string(),
        ));
    }
    let design = design_matrix(ctx.dataset, &data.rows, &covariates, false)?;
    if design.x.ncols() == 0 {
        return Err(AnalysisError::InsufficientData(
            "no usable predictor columns".to_string(),
        ));
    }
    let fit = cox_ph(&design.x, &data.times, &data.events, options.penalizer, options.max_iter)?;
    debug!(iterations = fit.iterations, converged = fit.converged, "Cox fit");

    let z = z_critical(level);
    let table: Vec<Value> = design
        .names
        .iter()
        .zip(fit.beta.iter().zip(&fit.std_errors))
        .map(|(term, (&b, &se))| {
            let stat = b / se;
            json!({
                "term": term,
                "coef": json_number(b),
                "std_error": json_number(se),
                "hazard_ratio": json_number(b.exp()),
                "ci_low": json_number((b - z * se).exp()),
                "ci_high": json_number((b + z * se).exp()),
                "z": json_number(stat),
                "p_value": json_number(z_p_value(stat, Alternative::TwoSided)),
            })
        })
        .collect();
    let lr = (2.0 * (fit.log_likelihood - fit.null_log_likelihood)).max(0.0);
    let df = design.x.ncols() as f64;
    let lr_p = chi2_sf(lr, df)?;

    let mut result = AnalysisResult::new(MethodId::CoxRegression, MethodId::CoxRegression.display_name())
        .with_test(lr, lr_p, alpha)
        .with_effect_size("concordance", fit.concordance, None)
        .with_extra("coefficients", Value::Array(table))
        .with_extra("log_likelihood", json_number(fit.log_likelihood))
        .with_extra("df", json_number(df))
        .with_extra("penalizer", json_number(options.penalizer))
        .with_extra("n", data.times.len())
        .with_extra("events", n_events)
        .with_extra("iterations", fit.iterations);
    result.groups = design.names.clone();
    if !fit.converged {
        result.warn(format!(
            "Cox model did not converge within {} iterations",
            options.max_iter
        ));
    }
    Ok(result)
}
