//! k-group comparisons with automatic post-hoc follow-up.

use serde_json::json;
use tracing::{debug, warn};

use super::{usable_groups, ExecutionContext};
use crate::assumptions::{check_normality, AssumptionReport, GroupNormality};
use crate::correction::pairwise_post_hoc;
use crate::error::AnalysisError;
use crate::options::{CommonOptions, CompareOptions, OmnibusEffectSize, PostHocMethod};
use crate::registry::{MethodId, RoleName};
use crate::result::{json_number, AnalysisResult};
use crate::stats::descriptive::{mean, rank, sum_sq_dev, tie_term, variance};
use crate::stats::distributions::{chi2_sf, f_sf};

/// One-way ANOVA table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnovaTable {
    pub f: f64,
    pub p_value: f64,
    pub df_between: f64,
    pub df_within: f64,
    pub ss_between: f64,
    pub ss_within: f64,
}

impl AnovaTable {
    pub fn eta_squared(&self) -> f64 {
        self.ss_between / (self.ss_between + self.ss_within)
    }

    pub fn omega_squared(&self) -> f64 {
        let ms_within = self.ss_within / self.df_within;
        (self.ss_between - self.df_between * ms_within)
            / (self.ss_between + self.ss_within + ms_within)
    }
}

/// Classic one-way ANOVA.
pub fn one_way_anova(samples: &[&[f64]]) -> Result<AnovaTable, AnalysisError> {
    let k = samples.len();
    let n: usize = samples.iter().map(|s| s.len()).sum();
    if k < 2 || n <= k {
        return Err(AnalysisError::InsufficientData(
            "ANOVA needs at least two groups and more observations than groups".to_string(),
        ));
    }
    let all: Vec<f64> = samples.iter().flat_map(|s| s.iter().copied()).collect();
    let grand = mean(&all);
    let ss_between: f64 = samples
        .iter()
        .map(|s| s.len() as f64 * (mean(s) - grand).powi(2))
        .sum();
    let ss_within: f64 = samples.iter().map(|s| sum_sq_dev(s)).sum();
    let df_between = (k - 1) as f64;
    let df_within = (n - k) as f64;
    if ss_within == 0.0 {
        return Err(AnalysisError::ZeroVariance(
            "no variance within groups".to_string(),
        ));
    }
    let f = (ss_between / df_between) / (ss_within / df_within);
    Ok(AnovaTable {
        f,
        p_value: f_sf(f, df_between, df_within)?,
        df_between,
        df_within,
        ss_between,
        ss_within,
    })
}

/// Welch's heteroscedastic ANOVA: `(F, df1, df2, p)`.
pub fn welch_anova(samples: &[&[f64]]) -> Result<(f64, f64, f64, f64), AnalysisError> {
    let k = samples.len() as f64;
    if samples.iter().any(|s| s.len() < 2) {
        return Err(AnalysisError::InsufficientData(
            "Welch ANOVA needs two observations per group".to_string(),
        ));
    }
    let weights: Vec<f64> = samples
        .iter()
        .map(|s| s.len() as f64 / variance(s))
        .collect();
    if weights.iter().any(|w| !w.is_finite()) {
        return Err(AnalysisError::ZeroVariance(
            "a group has zero variance".to_string(),
        ));
    }
    let w_sum: f64 = weights.iter().sum();
    let means: Vec<f64> = samples.iter().map(|s| mean(s)).collect();
    let weighted_mean: f64 = weights.iter().zip(&means).map(|(w, m)| w * m).sum::<f64>() / w_sum;
    let a: f64 = weights
        .iter()
        .zip(&means)
        .map(|(w, m)| w * (m - weighted_mean).powi(2))
        .sum::<f64>()
        / (k - 1.0);
    let lambda: f64 = weights
        .iter()
        .zip(samples)
        .map(|(w, s)| (1.0 - w / w_sum).powi(2) / (s.len() as f64 - 1.0))
        .sum();
    let b = 1.0 + 2.0 * (k - 2.0) / (k * k - 1.0) * lambda;
    let f = a / b;
    let df2 = (k * k - 1.0) / (3.0 * lambda);
    Ok((f, k - 1.0, df2, f_sf(f, k - 1.0, df2)?))
}

/// Kruskal-Wallis H with tie correction: `(H, df, p)`.
pub fn kruskal_wallis(samples: &[&[f64]]) -> Result<(f64, f64, f64), AnalysisError> {
    let all: Vec<f64> = samples.iter().flat_map(|s| s.iter().copied()).collect();
    let n = all.len() as f64;
    if samples.len() < 2 || all.len() < 2 {
        return Err(AnalysisError::InsufficientData(
            "Kruskal-Wallis needs at least two groups".to_string(),
        ));
    }
    let ranks = rank(&all);
    let mut offset = 0;
    let mut h = 0.0;
    for s in samples {
        let r: f64 = ranks[offset..offset + s.len()].iter().sum();
        h += r * r / s.len() as f64;
        offset += s.len();
    }
    h = 12.0 / (n * (n + 1.0)) * h - 3.0 * (n + 1.0);
    let correction = 1.0 - tie_term(&all) / (n * n * n - n);
    if correction <= 0.0 {
        return Err(AnalysisError::ZeroVariance(
            "all observations are tied".to_string(),
        ));
    }
    h /= correction;
    let df = (samples.len() - 1) as f64;
    Ok((h, df, chi2_sf(h, df)?))
}

/// Repeated-measures ANOVA on `levels[j][i]` (subject `i`, level `j`):
/// `(F, df1, df2, p, partial eta squared)`.
pub fn repeated_measures_anova(levels: &[Vec<f64>]) -> Result<(f64, f64, f64, f64, f64), AnalysisError> {
    let k = levels.len();
    let n = levels.first().map(Vec::len).unwrap_or(0);
    if k < 2 || n < 2 {
        return Err(AnalysisError::InsufficientData(
            "repeated-measures ANOVA needs two levels and two complete subjects".to_string(),
        ));
    }
    let all: Vec<f64> = levels.iter().flatten().copied().collect();
    let grand = mean(&all);
    let ss_total = sum_sq_dev(&all);
    let ss_levels: f64 = levels
        .iter()
        .map(|l| n as f64 * (mean(l) - grand).powi(2))
        .sum();
    let ss_subjects: f64 = (0..n)
        .map(|i| {
            let m = levels.iter().map(|l| l[i]).sum::<f64>() / k as f64;
            k as f64 * (m - grand).powi(2)
        })
        .sum();
    let ss_error = ss_total - ss_levels - ss_subjects;
    let df1 = (k - 1) as f64;
    let df2 = ((n - 1) * (k - 1)) as f64;
    if ss_error <= 1e-12 * ss_total.max(1.0) {
        return Err(AnalysisError::ZeroVariance(
            "no residual variance after removing subject effects".to_string(),
        ));
    }
    let f = (ss_levels / df1) / (ss_error / df2);
    Ok((f, df1, df2, f_sf(f, df1, df2)?, ss_levels / (ss_levels + ss_error)))
}

/// Friedman test with tie correction: `(Q, df, p, Kendall's W)`.
pub fn friedman(levels: &[Vec<f64>]) -> Result<(f64, f64, f64, f64), AnalysisError> {
    let k = levels.len();
    let n = levels.first().map(Vec::len).unwrap_or(0);
    if k < 3 || n < 2 {
        return Err(AnalysisError::InsufficientData(
            "Friedman needs at least three levels and two subjects".to_string(),
        ));
    }
    let (fk, fn_) = (k as f64, n as f64);
    let mut rank_sums = vec![0.0; k];
    let mut ties = 0.0;
    for i in 0..n {
        let row: Vec<f64> = levels.iter().map(|l| l[i]).collect();
        for (sum, r) in rank_sums.iter_mut().zip(rank(&row)) {
            *sum += r;
        }
        ties += tie_term(&row);
    }
    let q = 12.0 / (fn_ * fk * (fk + 1.0)) * rank_sums.iter().map(|r| r * r).sum::<f64>()
        - 3.0 * fn_ * (fk + 1.0);
    let correction = 1.0 - ties / (fn_ * fk * (fk * fk - 1.0));
    if correction <= 0.0 {
        return Err(AnalysisError::ZeroVariance(
            "every subject has identical values across levels".to_string(),
        ));
    }
    let q = q / correction;
    let df = fk - 1.0;
    Ok((q, df, chi2_sf(q, df)?, q / (fn_ * (fk - 1.0))))
}

/// Execute an omnibus method.
pub fn execute(
    method: MethodId,
    ctx: &ExecutionContext<'_>,
    options: &CompareOptions,
) -> Result<AnalysisResult, AnalysisError> {
    let alpha = options.alpha(ctx.defaults);
    let level = options.confidence_level(ctx.defaults);
    let target = ctx.roles.require(RoleName::Target)?;
    let group = ctx.roles.require(RoleName::Group)?;
    let mut warnings = Vec::new();
    let repeated = matches!(method, MethodId::RmAnova | MethodId::Friedman);

    let groups: Vec<(String, Vec<f64>)> = if repeated {
        let paired = ctx
            .dataset
            .paired_numeric(target, group, ctx.roles.subject.as_deref())?;
        if paired.dropped_subjects > 0 {
            warnings.push(format!(
                "{} subject(s) without a value at every level were dropped",
                paired.dropped_subjects
            ));
        }
        let required = if method == MethodId::Friedman { 3 } else { 2 };
        if paired.labels.len() < required {
            return Err(AnalysisError::InsufficientGroups {
                found: paired.labels.len(),
                required,
            });
        }
        paired.labels.into_iter().zip(paired.samples).collect()
    } else {
        let grouped = ctx.dataset.grouped_numeric(target, group)?;
        usable_groups(grouped.groups, 2, &mut warnings)?
    };
    let samples: Vec<&[f64]> = groups.iter().map(|(_, s)| s.as_slice()).collect();

    let effect_name = |effect: OmnibusEffectSize| match effect {
        OmnibusEffectSize::EtaSquared => "eta_squared",
        OmnibusEffectSize::OmegaSquared => "omega_squared",
    };

    let mut result = match method {
        MethodId::Anova => {
            let table = one_way_anova(&samples)?;
            let effect = match options.effect_size {
                OmnibusEffectSize::EtaSquared => table.eta_squared(),
                OmnibusEffectSize::OmegaSquared => table.omega_squared(),
            };
            AnalysisResult::new(method, method.display_name())
                .with_test(table.f, table.p_value, alpha)
                .with_effect_size(effect_name(options.effect_size), effect, None)
                .with_extra("df_between", json_number(table.df_between))
                .with_extra("df_within", json_number(table.df_within))
                .with_extra("ss_between", json_number(table.ss_between))
                .with_extra("ss_within", json_number(table.ss_within))
        }
        MethodId::WelchAnova => {
            let (f, df1, df2, p) = welch_anova(&samples)?;
            let effect = one_way_anova(&samples)
                .map(|t| match options.effect_size {
                    OmnibusEffectSize::EtaSquared => t.eta_squared(),
                    OmnibusEffectSize::OmegaSquared => t.omega_squared(),
                })
                .unwrap_or(f64::NAN);
            AnalysisResult::new(method, method.display_name())
                .with_test(f, p, alpha)
                .with_effect_size(effect_name(options.effect_size), effect, None)
                .with_extra("df_between", json_number(df1))
                .with_extra("df_within", json_number(df2))
        }
        MethodId::Kruskal => {
            let (h, df, p) = kruskal_wallis(&samples)?;
            let n: usize = samples.iter().map(|s| s.len()).sum();
            let k = samples.len() as f64;
            let effect = (h - k + 1.0) / (n as f64 - k);
            AnalysisResult::new(method, method.display_name())
                .with_test(h, p, alpha)
                .with_effect_size("eta_squared_h", effect, None)
                .with_extra("df", json_number(df))
        }
        MethodId::RmAnova => {
            let levels: Vec<Vec<f64>> = groups.iter().map(|(_, s)| s.clone()).collect();
            let (f, df1, df2, p, partial) = repeated_measures_anova(&levels)?;
            AnalysisResult::new(method, method.display_name())
                .with_test(f, p, alpha)
                .with_effect_size("partial_eta_squared", partial, None)
                .with_extra("df_between", json_number(df1))
                .with_extra("df_within", json_number(df2))
                .with_extra("n_subjects", levels[0].len())
        }
        MethodId::Friedman => {
            let levels: Vec<Vec<f64>> = groups.iter().map(|(_, s)| s.clone()).collect();
            let (q, df, p, w) = friedman(&levels)?;
            AnalysisResult::new(method, method.display_name())
                .with_test(q, p, alpha)
                .with_effect_size("kendalls_w", w, None)
                .with_extra("df", json_number(df))
                .with_extra("n_subjects", levels[0].len())
        }
        other => {
            return Err(AnalysisError::InvalidOption(format!(
                "{} is not an omnibus comparison",
                other
            )))
        }
    };

    let assumptions = if repeated {
        AssumptionReport {
            normality: groups
                .iter()
                .map(|(label, s)| GroupNormality {
                    group: label.clone(),
                    check: check_normality(s),
                })
                .collect(),
            homogeneity: None,
        }
    } else {
        AssumptionReport::for_groups(&groups, options.homogeneity_test)
    };

    if result.significant {
        let default = PostHocMethod::default_for(method).unwrap_or(PostHocMethod::TTest);
        let post_hoc_method = match options.post_hoc {
            Some(requested) if requested.is_paired() != repeated => {
                warnings.push(format!(
                    "post-hoc '{}' does not match the design; using '{}'",
                    requested.as_str(),
                    default.as_str()
                ));
                default
            }
            Some(requested) => requested,
            None => default,
        };
        match pairwise_post_hoc(
            &groups,
            post_hoc_method,
            options.correction(ctx.defaults),
            alpha,
            level,
        ) {
            Ok(post_hoc) => {
                debug!(
                    method = post_hoc_method.as_str(),
                    comparisons = post_hoc.comparisons.len(),
                    "post-hoc comparisons"
                );
                result = result
                    .with_extra("post_hoc_method", post_hoc_method.as_str())
                    .with_extra(
                        "post_hoc_correction",
                        post_hoc
                            .correction
                            .map(|c| json!(c.as_str()))
                            .unwrap_or_default(),
                    );
                result.post_hoc = Some(post_hoc.comparisons);
                warnings.extend(post_hoc.warnings);
            }
            Err(e) => {
                warn!(error = %e, "post-hoc comparisons failed");
                warnings.push(format!("Post-hoc comparisons skipped: {}", e));
            }
        }
    }

    result = result.with_groups(&groups, level);
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

    #[test]
    fn test_one_way_anova_reference() {
        // SSB = 54, SSW = 6: F = 27 / 0.5 = 27, eta^2 = 54 / 60 = 0.9
        let table = one_way_anova(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0], &[7.0, 8.0, 9.0]]).unwrap();
        assert!((table.f - 27.0).abs() < 1e-9);
        assert_eq!(table.df_between, 2.0);
        assert_eq!(table.df_within, 6.0);
        assert!((table.eta_squared() - 0.9).abs() < 1e-9);
        assert!(table.omega_squared() < table.eta_squared());
    }

    #[test]
    fn test_kruskal_reference() {
        // Three fully separated groups of three: H = 7.2
        let (h, df, p) = kruskal_wallis(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0], &[7.0, 8.0, 9.0]]).unwrap();
        assert!((h - 7.2).abs() < 1e-9);
        assert_eq!(df, 2.0);
        assert!((p - (-3.6f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_welch_anova_runs() {
        let (f, df1, df2, p) =
            welch_anova(&[&[1.0, 2.0, 3.0, 4.0], &[2.0, 4.0, 6.0, 9.0], &[10.0, 11.0, 12.5, 13.0]]).unwrap();
        assert!(f > 0.0);
        assert_eq!(df1, 2.0);
        assert!(df2 > 2.0);
        assert!(p < 0.05);
    }

    #[test]
    fn test_friedman_reference() {
        // Every subject ranks the levels identically: Q = n (k - 1), W = 1.
        let levels = vec![vec![1.0, 2.0, 1.5, 3.0], vec![2.0, 3.0, 2.5, 4.0], vec![3.0, 4.0, 3.5, 5.0]];
        let (q, df, _, w) = friedman(&levels).unwrap();
        assert!((q - 8.0).abs() < 1e-9);
        assert_eq!(df, 2.0);
        assert!((w - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rm_anova_zero_residual() {
        let levels = vec![vec![1.0, 2.0, 3.0], vec![2.0, 3.0, 4.0]];
        assert!(matches!(
            repeated_measures_anova(&levels),
            Err(AnalysisError::ZeroVariance(_))
        ));
    }

    fn separated() -> Dataset {
        let base = [-1.5, -0.9, -0.4, 0.0, 0.3, 0.8, 1.2, -0.2, 0.5, 0.1];
        let mut values = Vec::new();
        let mut labels = Vec::new();
        for (m, l) in [(10.0, "A"), (20.0, "B"), (30.0, "C")] {
            for x in base {
                values.push(m + x);
                labels.push(l);
            }
        }
        Dataset::new("three")
            .with_column("y", Column::numeric(values))
            .unwrap()
            .with_column("g", Column::categorical(labels))
            .unwrap()
    }

    #[test]
    fn test_execute_anova_attaches_post_hoc() {
        let ds = separated();
        let roles = ColumnRoles::grouped("y", "g");
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let result = execute(MethodId::Anova, &ctx, &CompareOptions::default()).unwrap();
        assert!(result.significant);
        let post_hoc = result.post_hoc.as_ref().unwrap();
        assert_eq!(post_hoc.len(), 3);
        assert_eq!(result.extra["post_hoc_method"], "tukey");
        assert_eq!(result.effect_size_name.as_deref(), Some("eta_squared"));
    }

    #[test]
    fn test_execute_kruskal_uses_configured_correction() {
        let ds = separated();
        let roles = ColumnRoles::grouped("y", "g");
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let options = CompareOptions {
            correction: Some("bonferroni".to_string()),
            ..CompareOptions::default()
        };
        let result = execute(MethodId::Kruskal, &ctx, &options).unwrap();
        assert_eq!(result.extra["post_hoc_correction"], "bonferroni");
        assert_eq!(result.post_hoc.unwrap().len(), 3);
    }
}
