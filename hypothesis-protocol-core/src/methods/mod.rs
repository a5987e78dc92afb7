//! Method executors, one module per family.
//!
//! [`Method`] is the closed set of executable families. The engine maps a
//! [`MethodId`] to its variant and hands it the validated options; every
//! executor returns `Result<AnalysisResult, AnalysisError>`.

pub mod cluster;
pub mod compare;
pub mod contingency;
pub mod correlation;
pub mod descriptive;
pub mod mixed;
pub mod omnibus;
pub mod regression;
pub mod roc;
pub mod survival;

use crate::dataset::Dataset;
use crate::error::AnalysisError;
use crate::options::{AnalysisDefaults, MethodOptions};
use crate::registry::{ColumnRoles, MethodId};
use crate::result::AnalysisResult;

/// Inputs shared by every executor.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub dataset: &'a Dataset,
    pub roles: &'a ColumnRoles,
    pub defaults: &'a AnalysisDefaults,
}

/// Executable method family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Two-group tests: t-tests, Mann-Whitney, Wilcoxon.
    Compare(MethodId),
    /// k-group tests: ANOVA, Welch ANOVA, Kruskal-Wallis, RM-ANOVA, Friedman.
    Omnibus(MethodId),
    Correlation(MethodId),
    Contingency(MethodId),
    Regression(MethodId),
    Survival(MethodId),
    Roc,
    Mixed,
    Cluster,
    Descriptive,
}

impl Method {
    pub fn for_id(id: MethodId) -> Self {
        use MethodId::*;
        match id {
            TTestInd | TTestWelch | TTestPaired | MannWhitney | Wilcoxon => Method::Compare(id),
            Anova | WelchAnova | Kruskal | RmAnova | Friedman => Method::Omnibus(id),
            Pearson | Spearman | Kendall => Method::Correlation(id),
            ChiSquare | FisherExact => Method::Contingency(id),
            LinearRegression | LogisticRegression => Method::Regression(id),
            KaplanMeier | CoxRegression => Method::Survival(id),
            RocAnalysis => Method::Roc,
            MixedEffects => Method::Mixed,
            ClusteredCorrelation => Method::Cluster,
            MethodId::Descriptive => Method::Descriptive,
        }
    }

    /// Run the executor with options already validated for this family.
    ///
    /// # Errors
    ///
    /// Configuration errors when the options belong to another family or a
    /// column is unusable; computation errors when the data make the
    /// statistic undefined.
    pub fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        options: &MethodOptions,
    ) -> Result<AnalysisResult, AnalysisError> {
        match (self, options) {
            (Method::Compare(id), MethodOptions::Compare(o)) => compare::execute(*id, ctx, o),
            (Method::Omnibus(id), MethodOptions::Compare(o)) => omnibus::execute(*id, ctx, o),
            (Method::Correlation(id), MethodOptions::Correlation(o)) => {
                correlation::execute(*id, ctx, o)
            }
            (Method::Contingency(id), MethodOptions::Contingency(o)) => {
                contingency::execute(*id, ctx, o)
            }
            (Method::Regression(id), MethodOptions::Regression(o)) => {
                regression::execute(*id, ctx, o)
            }
            (Method::Survival(id), MethodOptions::Survival(o)) => survival::execute(*id, ctx, o),
            (Method::Roc, MethodOptions::Roc(o)) => roc::execute(ctx, o),
            (Method::Mixed, MethodOptions::Mixed(o)) => mixed::execute(ctx, o),
            (Method::Cluster, MethodOptions::Cluster(o)) => cluster::execute(ctx, o),
            (Method::Descriptive, MethodOptions::Descriptive(o)) => descriptive::execute(ctx, o),
            (method, options) => Err(AnalysisError::InvalidOption(format!(
                "options {:?} do not apply to {:?}",
                options, method
            ))),
        }
    }
}

/// Drop groups with fewer than two observations, warning for each.
///
/// # Errors
///
/// [`AnalysisError::InsufficientGroups`] when fewer than `required` groups
/// remain.
pub fn usable_groups(
    groups: Vec<(String, Vec<f64>)>,
    required: usize,
    warnings: &mut Vec<String>,
) -> Result<Vec<(String, Vec<f64>)>, AnalysisError> {
    let kept: Vec<(String, Vec<f64>)> = groups
        .into_iter()
        .filter(|(label, sample)| {
            if sample.len() < 2 {
                warnings.push(format!(
                    "Group '{}' dropped: only {} valid observation(s)",
                    label,
                    sample.len()
                ));
                false
            } else {
                true
            }
        })
        .collect();
    if kept.len() < required {
        return Err(AnalysisError::InsufficientGroups {
            found: kept.len(),
            required,
        });
    }
    Ok(kept)
}

/// Reject more groups than a method can compare.
pub(crate) fn at_most(
    method: MethodId,
    groups: &[(String, Vec<f64>)],
    max: usize,
) -> Result<(), AnalysisError> {
    if groups.len() > max {
        return Err(AnalysisError::InvalidOption(format!(
            "{} compares at most {} groups, found {}",
            method,
            max,
            groups.len()
        )));
    }
    Ok(())
}
