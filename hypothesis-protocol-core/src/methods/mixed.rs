//! Linear mixed-effects model for `outcome ~ time * group` with a random
//! intercept per subject and an optional random slope on time.
//!
//! The fit maximises the profiled REML criterion over the relative
//! random-effect covariance `Psi = L L'`, with the residual variance and
//! fixed effects profiled out in closed form. `L` is searched with
//! `argmin`'s Nelder-Mead solver.

use std::collections::BTreeMap;

use argmin::core::{CostFunction, Error as ArgminError, Executor, State, TerminationReason};
use argmin::solver::neldermead::NelderMead;
use nalgebra::{DMatrix, DVector};
use serde_json::{json, Value};
use tracing::debug;

use super::ExecutionContext;
use crate::dataset::{compare_labels, Column};
use crate::error::AnalysisError;
use crate::options::{CommonOptions, MixedOptions};
use crate::registry::{MethodId, RoleName};
use crate::result::{json_number, AnalysisResult, GroupStats};
use crate::stats::distributions::{z_critical, z_p_value, Alternative};
use crate::stats::linalg::{from_rows, spd_inverse_with_log_det};

/// Fewest complete observations the model accepts.
pub const MIN_OBSERVATIONS: usize = 10;

const SIMPLEX_STEP: f64 = 0.5;
const SD_TOLERANCE: f64 = 1e-8;

/// Per-subject slices of the model.
#[derive(Debug, Clone)]
pub struct SubjectBlock {
    pub x: DMatrix<f64>,
    pub z: DMatrix<f64>,
    pub y: DVector<f64>,
}

/// REML estimates.
#[derive(Debug, Clone)]
pub struct MixedFit {
    pub beta: Vec<f64>,
    pub std_errors: Vec<f64>,
    /// Random-effect covariance on the outcome scale.
    pub random_cov: DMatrix<f64>,
    pub residual_var: f64,
    pub reml_criterion: f64,
    pub iterations: usize,
    pub converged: bool,
}

struct Profile {
    beta: DVector<f64>,
    xtvx_inv: DMatrix<f64>,
    sigma2: f64,
    criterion: f64,
}

fn relative_cov(theta: &[f64], dim: usize) -> DMatrix<f64> {
    let mut l = DMatrix::<f64>::zeros(dim, dim);
    let mut k = 0;
    for i in 0..dim {
        for j in 0..=i {
            l[(i, j)] = theta[k];
            k += 1;
        }
    }
    &l * l.transpose()
}

fn profile(blocks: &[SubjectBlock], theta: &[f64], dim: usize) -> Result<Profile, AnalysisError> {
    let psi = relative_cov(theta, dim);
    let p = blocks.first().map_or(0, |b| b.x.ncols());
    let mut xtvx = DMatrix::<f64>::zeros(p, p);
    let mut xtvy = DVector::<f64>::zeros(p);
    let mut log_det_v = 0.0;
    let mut inverses = Vec::with_capacity(blocks.len());
    for block in blocks {
        let n = block.y.len();
        let v = DMatrix::<f64>::identity(n, n) + &block.z * &psi * block.z.transpose();
        let (v_inv, log_det) = spd_inverse_with_log_det(&v)?;
        log_det_v += log_det;
        let xt_vinv = block.x.transpose() * &v_inv;
        xtvx += &xt_vinv * &block.x;
        xtvy += &xt_vinv * &block.y;
        inverses.push(v_inv);
    }
    let (xtvx_inv, log_det_xtvx) = spd_inverse_with_log_det(&xtvx)?;
    let beta = &xtvx_inv * &xtvy;
    let q: f64 = blocks
        .iter()
        .zip(&inverses)
        .map(|(block, v_inv)| {
            let r = &block.y - &block.x * &beta;
            r.dot(&(v_inv * &r))
        })
        .sum();
    let n: usize = blocks.iter().map(|b| b.y.len()).sum();
    if n <= p {
        return Err(AnalysisError::InsufficientData(format!(
            "{} observations for {} fixed effects",
            n, p
        )));
    }
    let dof = (n - p) as f64;
    if q <= 0.0 {
        return Err(AnalysisError::ZeroVariance(
            "residual variance is zero".to_string(),
        ));
    }
    Ok(Profile {
        beta,
        xtvx_inv,
        sigma2: q / dof,
        criterion: 0.5 * (log_det_v + log_det_xtvx + dof * q.ln()),
    })
}

/// REML criterion as a function of the packed lower-triangular factor.
/// Covariances where the profile cannot be computed cost `+inf`.
struct RemlCriterion<'a> {
    blocks: &'a [SubjectBlock],
    dim: usize,
}

impl CostFunction for RemlCriterion<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok(profile(self.blocks, theta, self.dim)
            .map(|p| p.criterion)
            .ok()
            .filter(|c| c.is_finite())
            .unwrap_or(f64::INFINITY))
    }
}

fn optimiser_error(err: ArgminError) -> AnalysisError {
    AnalysisError::Computation(format!("REML optimisation failed: {}", err))
}

/// Fit the model by REML. `dim` is the number of random-effect columns
/// in each block's `z` (1 for an intercept, 2 with a slope).
pub fn fit_reml(blocks: &[SubjectBlock], dim: usize, max_iter: usize) -> Result<MixedFit, AnalysisError> {
    let mut theta0 = Vec::new();
    for i in 0..dim {
        for j in 0..=i {
            theta0.push(if i == j { 1.0 } else { 0.0 });
        }
    }
    let mut simplex = vec![theta0.clone()];
    for k in 0..theta0.len() {
        let mut vertex = theta0.clone();
        vertex[k] += SIMPLEX_STEP;
        simplex.push(vertex);
    }
    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(SD_TOLERANCE)
        .map_err(optimiser_error)?;
    let outcome = Executor::new(RemlCriterion { blocks, dim }, solver)
        .configure(|state| state.max_iters(max_iter as u64))
        .run()
        .map_err(optimiser_error)?;
    let state = outcome.state();
    if !state.get_best_cost().is_finite() {
        return Err(AnalysisError::Computation(
            "REML criterion is not finite at any tried covariance".to_string(),
        ));
    }
    let theta = state.get_best_param().cloned().ok_or_else(|| {
        AnalysisError::Computation("REML optimisation returned no estimate".to_string())
    })?;
    let converged = matches!(
        state.get_termination_reason(),
        Some(TerminationReason::SolverConverged)
    );
    let iterations = state.get_iter() as usize;

    let best = profile(blocks, &theta, dim)?;
    let std_errors = best
        .xtvx_inv
        .diagonal()
        .iter()
        .map(|v| (v * best.sigma2).sqrt())
        .collect();
    Ok(MixedFit {
        beta: best.beta.as_slice().to_vec(),
        std_errors,
        random_cov: relative_cov(&theta, dim) * best.sigma2,
        residual_var: best.sigma2,
        reml_criterion: best.criterion,
        iterations,
        converged,
    })
}

struct Observation {
    subject: String,
    group: String,
    time: String,
    time_value: f64,
    y: f64,
}

fn observations(ctx: &ExecutionContext<'_>) -> Result<(Vec<Observation>, bool), AnalysisError> {
    let target = ctx.roles.require(RoleName::Target)?;
    let time = ctx.roles.require(RoleName::Time)?;
    let group = ctx.roles.require(RoleName::Group)?;
    let subject = ctx.roles.require(RoleName::Subject)?;
    let rows = ctx.dataset.complete_rows(&[target, time, group, subject])?;
    let (y_col, t_col, g_col, s_col) = (
        ctx.dataset.column(target)?,
        ctx.dataset.column(time)?,
        ctx.dataset.column(group)?,
        ctx.dataset.column(subject)?,
    );
    let time_labels = ctx.dataset.distinct_labels(time)?;
    let numeric_time = matches!(t_col, Column::Numeric(_));
    let obs = rows
        .iter()
        .filter_map(|&r| {
            let label = t_col.label(r)?;
            let time_value = match t_col.number(r) {
                Some(v) => v,
                None => time_labels.iter().position(|l| *l == label)? as f64,
            };
            Some(Observation {
                subject: s_col.label(r)?,
                group: g_col.label(r)?,
                time: label,
                time_value,
                y: y_col.number(r)?,
            })
        })
        .collect();
    Ok((obs, numeric_time))
}

fn sorted_levels<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut levels: Vec<String> = values.map(str::to_string).collect();
    levels.sort_by(|a, b| compare_labels(a, b));
    levels.dedup();
    levels
}

/// Execute the mixed-effects model.
pub fn execute(ctx: &ExecutionContext<'_>, options: &MixedOptions) -> Result<AnalysisResult, AnalysisError> {
    let alpha = options.alpha(ctx.defaults);
    let level = options.confidence_level(ctx.defaults);
    let (obs, numeric_time) = observations(ctx)?;
    if obs.len() < MIN_OBSERVATIONS {
        return Err(AnalysisError::InsufficientData(format!(
            "mixed-effects model needs at least {} complete observations, found {}",
            MIN_OBSERVATIONS,
            obs.len()
        )));
    }
    let time_name = ctx.roles.require(RoleName::Time)?;
    let group_name = ctx.roles.require(RoleName::Group)?;
    let groups = sorted_levels(obs.iter().map(|o| o.group.as_str()));
    let times = sorted_levels(obs.iter().map(|o| o.time.as_str()));
    let subjects = sorted_levels(obs.iter().map(|o| o.subject.as_str()));
    if groups.len() < 2 {
        return Err(AnalysisError::InsufficientGroups {
            found: groups.len(),
            required: 2,
        });
    }
    if times.len() < 2 {
        return Err(AnalysisError::InsufficientData(
            "mixed-effects model needs at least two time points".to_string(),
        ));
    }
    if subjects.len() < 2 {
        return Err(AnalysisError::InsufficientData(
            "mixed-effects model needs at least two subjects".to_string(),
        ));
    }
    let time_as_factor = options.time_as_factor || !numeric_time;

    let mut names = vec!["Intercept".to_string()];
    let time_terms: Vec<String> = if time_as_factor {
        times[1..]
            .iter()
            .map(|t| format!("{}[T.{}]", time_name, t))
            .collect()
    } else {
        vec![time_name.to_string()]
    };
    let group_terms: Vec<String> = groups[1..]
        .iter()
        .map(|g| format!("{}[T.{}]", group_name, g))
        .collect();
    names.extend(time_terms.iter().cloned());
    names.extend(group_terms.iter().cloned());
    let mut interaction_index = Vec::new();
    for t in &time_terms {
        for g in &group_terms {
            interaction_index.push(names.len());
            names.push(format!("{}:{}", t, g));
        }
    }

    let row_of = |o: &Observation| -> Vec<f64> {
        let time_cols: Vec<f64> = if time_as_factor {
            times[1..].iter().map(|t| if *t == o.time { 1.0 } else { 0.0 }).collect()
        } else {
            vec![o.time_value]
        };
        let group_cols: Vec<f64> = groups[1..]
            .iter()
            .map(|g| if *g == o.group { 1.0 } else { 0.0 })
            .collect();
        let mut row = vec![1.0];
        row.extend(&time_cols);
        row.extend(&group_cols);
        for t in &time_cols {
            for g in &group_cols {
                row.push(t * g);
            }
        }
        row
    };

    let dim = if options.random_slope { 2 } else { 1 };
    let mut by_subject: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
    for o in &obs {
        by_subject.entry(o.subject.as_str()).or_default().push(o);
    }
    let blocks: Vec<SubjectBlock> = by_subject
        .values()
        .map(|rows| {
            let x: Vec<Vec<f64>> = rows.iter().map(|o| row_of(*o)).collect();
            let z: Vec<Vec<f64>> = rows
                .iter()
                .map(|o| {
                    if options.random_slope {
                        vec![1.0, o.time_value]
                    } else {
                        vec![1.0]
                    }
                })
                .collect();
            SubjectBlock {
                x: from_rows(&x),
                z: from_rows(&z),
                y: DVector::from_iterator(rows.len(), rows.iter().map(|o| o.y)),
            }
        })
        .collect();

    let fit = fit_reml(&blocks, dim, options.max_iter)?;
    debug!(
        n = obs.len(),
        subjects = blocks.len(),
        iterations = fit.iterations,
        "REML fit"
    );

    let z = z_critical(level);
    let coefficients: Vec<(String, f64, f64, f64, f64)> = names
        .iter()
        .zip(fit.beta.iter().zip(&fit.std_errors))
        .map(|(name, (&b, &se))| {
            let stat = b / se;
            (name.clone(), b, se, stat, z_p_value(stat, Alternative::TwoSided))
        })
        .collect();
    let table: Vec<Value> = coefficients
        .iter()
        .map(|(term, b, se, stat, p)| {
            json!({
                "term": term,
                "estimate": json_number(*b),
                "std_error": json_number(*se),
                "z": json_number(*stat),
                "p_value": json_number(*p),
                "ci_low": json_number(b - z * se),
                "ci_high": json_number(b + z * se),
            })
        })
        .collect();
    let headline = interaction_index
        .iter()
        .filter_map(|&i| coefficients.get(i))
        .filter(|c| c.4.is_finite())
        .min_by(|a, b| a.4.partial_cmp(&b.4).unwrap_or(std::cmp::Ordering::Equal));

    let mut random = json!({
        "subject_var": json_number(fit.random_cov[(0, 0)]),
        "residual_var": json_number(fit.residual_var),
    });
    if options.random_slope {
        random["slope_var"] = json_number(fit.random_cov[(1, 1)]);
        random["intercept_slope_cov"] = json_number(fit.random_cov[(0, 1)]);
    }

    let mut result = AnalysisResult::new(MethodId::MixedEffects, MethodId::MixedEffects.display_name());
    if let Some((term, _, _, stat, p)) = headline {
        result = result
            .with_test(*stat, *p, alpha)
            .with_extra("interaction_term", term.as_str());
    } else {
        result.warn("No interaction term could be estimated");
    }

    let mut plot_data = Vec::new();
    for g in &groups {
        for t in &times {
            let cell: Vec<f64> = obs
                .iter()
                .filter(|o| o.group == *g && o.time == *t)
                .map(|o| o.y)
                .collect();
            if cell.is_empty() {
                continue;
            }
            let stats = GroupStats::from_sample(&cell, level);
            plot_data.push(json!({
                "group": g,
                "time": t,
                "mean": stats.mean.map(json_number).unwrap_or_default(),
                "ci_low": stats.ci_low.map(json_number).unwrap_or_default(),
                "ci_high": stats.ci_high.map(json_number).unwrap_or_default(),
                "n": stats.count,
            }));
        }
    }
    result.plot_data = plot_data;
    result.groups = groups;

    if !fit.converged {
        result.warn(format!(
            "REML optimisation stopped after {} iterations without converging",
            fit.iterations
        ));
    }
    Ok(result
        .with_extra("coefficients", Value::Array(table))
        .with_extra("random_effects", random)
        .with_extra("reml_criterion", json_number(fit.reml_criterion))
        .with_extra("n_obs", obs.len())
        .with_extra("n_subjects", blocks.len())
        .with_extra("time_as_factor", time_as_factor)
        .with_extra("random_slope", options.random_slope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::options::AnalysisDefaults;
    use crate::registry::ColumnRoles;

    fn roles() -> ColumnRoles {
        ColumnRoles {
            target: Some("score".into()),
            time: Some("visit".into()),
            group: Some("arm".into()),
            subject: Some("id".into()),
            ..ColumnRoles::default()
        }
    }

    /// Eight subjects over three visits; arm "b" improves faster.
    fn longitudinal() -> Dataset {
        let mut ids = Vec::new();
        let mut arms = Vec::new();
        let mut visits = Vec::new();
        let mut scores = Vec::new();
        let offsets = [0.3, -0.4, 0.1, 0.5, -0.2, 0.0, -0.5, 0.2];
        let noise = [0.1, -0.2, 0.05, 0.15, -0.1, 0.0, 0.2, -0.05, 0.1];
        for s in 0..8 {
            let arm = if s < 4 { "a" } else { "b" };
            let slope = if s < 4 { 1.0 } else { 3.0 };
            for v in 0..3 {
                ids.push(format!("s{}", s));
                arms.push(arm.to_string());
                visits.push(v as f64);
                scores.push(10.0 + offsets[s] + slope * v as f64 + noise[(s + v) % 9]);
            }
        }
        Dataset::new("long")
            .with_column("id", Column::categorical(ids))
            .unwrap()
            .with_column("arm", Column::categorical(arms))
            .unwrap()
            .with_column("visit", Column::numeric(visits))
            .unwrap()
            .with_column("score", Column::numeric(scores))
            .unwrap()
    }

    #[test]
    fn test_interaction_detected() {
        let ds = longitudinal();
        let roles = roles();
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let result = execute(&ctx, &MixedOptions::default()).unwrap();
        assert!(result.p_value.unwrap() < 0.05);
        let term = result.extra["interaction_term"].as_str().unwrap();
        assert!(term.starts_with("visit[T."));
        assert!(term.ends_with(":arm[T.b]"));
        assert_eq!(result.extra["n_obs"], 24);
        assert_eq!(result.extra["n_subjects"], 8);
        // two arms by three visits
        assert_eq!(result.plot_data.len(), 6);
    }

    #[test]
    fn test_random_slope_numeric_time() {
        let ds = longitudinal();
        let roles = roles();
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let options = MixedOptions {
            random_slope: true,
            time_as_factor: false,
            ..MixedOptions::default()
        };
        let result = execute(&ctx, &options).unwrap();
        assert_eq!(result.extra["interaction_term"], "visit:arm[T.b]");
        let estimate = result.extra["coefficients"][3]["estimate"].as_f64().unwrap();
        assert!((estimate - 2.0).abs() < 0.5);
        assert!(result.extra["random_effects"]["slope_var"].as_f64().unwrap() >= 0.0);
    }

    #[test]
    fn test_reml_random_intercept() {
        let offsets = [0.0, 2.0, -1.0, 1.5, -2.0, 0.5];
        let noise = [0.1, -0.1, 0.05, -0.05, 0.0, 0.08, -0.08, 0.02];
        let blocks: Vec<SubjectBlock> = offsets
            .iter()
            .enumerate()
            .map(|(s, offset)| {
                let x = from_rows(&[vec![1.0, 0.0], vec![1.0, 1.0], vec![1.0, 2.0]]);
                let z = from_rows(&[vec![1.0], vec![1.0], vec![1.0]]);
                let y = DVector::from_iterator(
                    3,
                    (0..3).map(|t| 5.0 + offset + t as f64 + noise[(s + t) % noise.len()]),
                );
                SubjectBlock { x, z, y }
            })
            .collect();
        let fit = fit_reml(&blocks, 1, 500).unwrap();
        assert!(fit.converged);
        assert!((fit.beta[1] - 1.0).abs() < 0.2);
        // between-subject spread dwarfs the residual noise
        assert!(fit.random_cov[(0, 0)] > fit.residual_var);
        assert_eq!(fit.std_errors.len(), 2);
    }

    #[test]
    fn test_too_few_observations() {
        let ds = longitudinal().select_rows("small", &[0, 1, 2, 3, 4, 5, 12, 13, 14]);
        let roles = roles();
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let err = execute(&ctx, &MixedOptions::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData(_)));
    }
}
