//! Automatic choice of a test from column types, design and assumptions.
//!
//! The decision tree is fixed:
//!
//! | columns                | design      | groups | assumptions           | method          |
//! |------------------------|-------------|--------|-----------------------|-----------------|
//! | numeric, numeric       | independent |        | both normal           | `pearson`       |
//! | numeric, numeric       | independent |        | otherwise             | `spearman`      |
//! | numeric, numeric       | paired      |        | normal differences    | `t_test_paired` |
//! | numeric, numeric       | paired      |        | otherwise             | `wilcoxon`      |
//! | numeric, categorical   | independent | 2      | normal + homogeneous  | `t_test_ind`    |
//! | numeric, categorical   | independent | 2      | normal only           | `t_test_welch`  |
//! | numeric, categorical   | independent | 2      | otherwise             | `mann_whitney`  |
//! | numeric, categorical   | independent | 3+     | normal + homogeneous  | `anova`         |
//! | numeric, categorical   | independent | 3+     | normal only           | `welch_anova`   |
//! | numeric, categorical   | independent | 3+     | otherwise             | `kruskal`       |
//! | numeric, categorical   | paired      | 2      | normal differences    | `t_test_paired` |
//! | numeric, categorical   | paired      | 2      | otherwise             | `wilcoxon`      |
//! | numeric, categorical   | paired      | 3+     | all levels normal     | `rm_anova`      |
//! | numeric, categorical   | paired      | 3+     | otherwise             | `friedman`      |
//! | categorical, categorical |           |        |                       | `chi_square`    |
//!
//! An indeterminate check counts as "not confirmed", which routes to the
//! rank-based or Welch branch.

use tracing::debug;

use crate::assumptions::{check_normality, AssumptionReport, GroupNormality, HomogeneityTest};
use crate::dataset::{ColumnType, Dataset};
use crate::error::AnalysisError;
use crate::methods::usable_groups;
use crate::registry::{ColumnRoles, MethodId};

/// Column references and design of a selection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRequest<'a> {
    /// Outcome, or the first of two variables.
    pub first: &'a str,
    /// Grouping column, or the second variable.
    pub second: &'a str,
    pub paired: bool,
    /// Subject identifier aligning repeated measurements.
    pub subject: Option<&'a str>,
}

impl<'a> SelectionRequest<'a> {
    pub fn new(first: &'a str, second: &'a str) -> Self {
        Self {
            first,
            second,
            paired: false,
            subject: None,
        }
    }

    pub fn paired(mut self, subject: Option<&'a str>) -> Self {
        self.paired = true;
        self.subject = subject;
        self
    }
}

/// The chosen method with the evidence behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub method: MethodId,
    /// Column roles to execute `method` with.
    pub roles: ColumnRoles,
    pub assumptions: Option<AssumptionReport>,
    pub warnings: Vec<String>,
}

impl Selection {
    fn new(method: MethodId, roles: ColumnRoles) -> Self {
        Self {
            method,
            roles,
            assumptions: None,
            warnings: Vec::new(),
        }
    }
}

fn normality_of(label: &str, sample: &[f64]) -> GroupNormality {
    GroupNormality {
        group: label.to_string(),
        check: check_normality(sample),
    }
}

/// Select a method for `request`.
///
/// # Errors
///
/// [`AnalysisError::InsufficientGroups`] when fewer than two usable groups
/// remain after dropping groups with fewer than two observations; column
/// lookup errors for missing columns.
pub fn select_method(dataset: &Dataset, request: &SelectionRequest<'_>) -> Result<Selection, AnalysisError> {
    let first_type = dataset.column_type(request.first)?;
    let second_type = dataset.column_type(request.second)?;
    let selection = match (first_type, second_type) {
        (ColumnType::Numeric, ColumnType::Numeric) if request.paired => select_wide_paired(dataset, request)?,
        (ColumnType::Numeric, ColumnType::Numeric) => select_correlation(dataset, request)?,
        (ColumnType::Categorical, ColumnType::Categorical) => Selection::new(
            MethodId::ChiSquare,
            ColumnRoles::grouped(request.first, request.second),
        ),
        (ColumnType::Numeric, ColumnType::Categorical) => {
            select_grouped(dataset, request.first, request.second, request)?
        }
        (ColumnType::Categorical, ColumnType::Numeric) => {
            select_grouped(dataset, request.second, request.first, request)?
        }
    };
    debug!(
        method = %selection.method,
        first = request.first,
        second = request.second,
        paired = request.paired,
        "selected method"
    );
    Ok(selection)
}

fn select_correlation(dataset: &Dataset, request: &SelectionRequest<'_>) -> Result<Selection, AnalysisError> {
    let (x, y) = dataset.numeric_pairs(request.first, request.second)?;
    let report = AssumptionReport {
        normality: vec![normality_of(request.first, &x), normality_of(request.second, &y)],
        homogeneity: None,
    };
    let method = if report.all_normal() {
        MethodId::Pearson
    } else {
        MethodId::Spearman
    };
    let mut selection = Selection::new(method, ColumnRoles::pair(request.first, request.second));
    selection.assumptions = Some(report);
    Ok(selection)
}

fn select_wide_paired(dataset: &Dataset, request: &SelectionRequest<'_>) -> Result<Selection, AnalysisError> {
    let (a, b) = dataset.numeric_pairs(request.first, request.second)?;
    if a.len() < 2 {
        return Err(AnalysisError::InsufficientData(format!(
            "{} complete pair(s)",
            a.len()
        )));
    }
    let d: Vec<f64> = a.iter().zip(&b).map(|(x, y)| x - y).collect();
    let report = AssumptionReport {
        normality: vec![normality_of("difference", &d)],
        homogeneity: None,
    };
    let method = if report.all_normal() {
        MethodId::TTestPaired
    } else {
        MethodId::Wilcoxon
    };
    let mut selection = Selection::new(method, ColumnRoles::pair(request.first, request.second));
    selection.assumptions = Some(report);
    Ok(selection)
}

fn select_grouped(
    dataset: &Dataset,
    target: &str,
    group: &str,
    request: &SelectionRequest<'_>,
) -> Result<Selection, AnalysisError> {
    let mut roles = ColumnRoles::grouped(target, group);
    let mut warnings = Vec::new();

    if request.paired {
        roles.subject = request.subject.map(str::to_string);
        let paired = dataset.paired_numeric(target, group, request.subject)?;
        if paired.labels.len() < 2 {
            return Err(AnalysisError::InsufficientGroups {
                found: paired.labels.len(),
                required: 2,
            });
        }
        if paired.dropped_subjects > 0 {
            warnings.push(format!(
                "{} subject(s) dropped for missing a level of '{}'",
                paired.dropped_subjects, group
            ));
        }
        let report = if paired.labels.len() == 2 {
            let d: Vec<f64> = paired.samples[0]
                .iter()
                .zip(&paired.samples[1])
                .map(|(x, y)| x - y)
                .collect();
            AssumptionReport {
                normality: vec![normality_of("difference", &d)],
                homogeneity: None,
            }
        } else {
            AssumptionReport {
                normality: paired
                    .labels
                    .iter()
                    .zip(&paired.samples)
                    .map(|(l, s)| normality_of(l, s))
                    .collect(),
                homogeneity: None,
            }
        };
        let method = match (paired.labels.len(), report.all_normal()) {
            (2, true) => MethodId::TTestPaired,
            (2, false) => MethodId::Wilcoxon,
            (_, true) => MethodId::RmAnova,
            (_, false) => MethodId::Friedman,
        };
        return Ok(Selection {
            method,
            roles,
            assumptions: Some(report),
            warnings,
        });
    }

    let grouped = dataset.grouped_numeric(target, group)?;
    let groups = usable_groups(grouped.groups, 2, &mut warnings)?;
    let report = AssumptionReport::for_groups(&groups, HomogeneityTest::Levene);
    let method = match (groups.len(), report.all_normal(), report.homogeneous()) {
        (2, true, true) => MethodId::TTestInd,
        (2, true, false) => MethodId::TTestWelch,
        (2, false, _) => MethodId::MannWhitney,
        (_, true, true) => MethodId::Anova,
        (_, true, false) => MethodId::WelchAnova,
        (_, false, _) => MethodId::Kruskal,
    };
    Ok(Selection {
        method,
        roles,
        assumptions: Some(report),
        warnings,
    })
}
