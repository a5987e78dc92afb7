//! Static catalog of the statistical methods the engine can execute.
//!
//! The registry is built once at startup and only read afterwards, so a
//! single `Arc<MethodRegistry>` can be shared by every worker.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dataset::{ColumnType, Dataset};
use crate::error::AnalysisError;

/// Identifier of a registered method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodId {
    TTestInd,
    TTestWelch,
    TTestPaired,
    MannWhitney,
    Wilcoxon,
    Anova,
    WelchAnova,
    Kruskal,
    RmAnova,
    Friedman,
    Pearson,
    Spearman,
    Kendall,
    ChiSquare,
    FisherExact,
    LinearRegression,
    LogisticRegression,
    KaplanMeier,
    CoxRegression,
    RocAnalysis,
    MixedEffects,
    ClusteredCorrelation,
    Descriptive,
}

impl MethodId {
    pub const ALL: [MethodId; 23] = [
        MethodId::TTestInd,
        MethodId::TTestWelch,
        MethodId::TTestPaired,
        MethodId::MannWhitney,
        MethodId::Wilcoxon,
        MethodId::Anova,
        MethodId::WelchAnova,
        MethodId::Kruskal,
        MethodId::RmAnova,
        MethodId::Friedman,
        MethodId::Pearson,
        MethodId::Spearman,
        MethodId::Kendall,
        MethodId::ChiSquare,
        MethodId::FisherExact,
        MethodId::LinearRegression,
        MethodId::LogisticRegression,
        MethodId::KaplanMeier,
        MethodId::CoxRegression,
        MethodId::RocAnalysis,
        MethodId::MixedEffects,
        MethodId::ClusteredCorrelation,
        MethodId::Descriptive,
    ];

    /// The wire id, e.g. `t_test_ind`.
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodId::TTestInd => "t_test_ind",
            MethodId::TTestWelch => "t_test_welch",
            MethodId::TTestPaired => "t_test_paired",
            MethodId::MannWhitney => "mann_whitney",
            MethodId::Wilcoxon => "wilcoxon",
            MethodId::Anova => "anova",
            MethodId::WelchAnova => "welch_anova",
            MethodId::Kruskal => "kruskal",
            MethodId::RmAnova => "rm_anova",
            MethodId::Friedman => "friedman",
            MethodId::Pearson => "pearson",
            MethodId::Spearman => "spearman",
            MethodId::Kendall => "kendall",
            MethodId::ChiSquare => "chi_square",
            MethodId::FisherExact => "fisher_exact",
            MethodId::LinearRegression => "linear_regression",
            MethodId::LogisticRegression => "logistic_regression",
            MethodId::KaplanMeier => "kaplan_meier",
            MethodId::CoxRegression => "cox_regression",
            MethodId::RocAnalysis => "roc_analysis",
            MethodId::MixedEffects => "mixed_effects",
            MethodId::ClusteredCorrelation => "clustered_correlation",
            MethodId::Descriptive => "descriptive",
        }
    }

    /// Human-readable method name.
    pub fn display_name(&self) -> &'static str {
        match self {
            MethodId::TTestInd => "Student's t-test",
            MethodId::TTestWelch => "Welch's t-test",
            MethodId::TTestPaired => "Paired t-test",
            MethodId::MannWhitney => "Mann-Whitney U test",
            MethodId::Wilcoxon => "Wilcoxon signed-rank test",
            MethodId::Anova => "One-way ANOVA",
            MethodId::WelchAnova => "Welch's ANOVA",
            MethodId::Kruskal => "Kruskal-Wallis H test",
            MethodId::RmAnova => "Repeated-measures ANOVA",
            MethodId::Friedman => "Friedman test",
            MethodId::Pearson => "Pearson correlation",
            MethodId::Spearman => "Spearman rank correlation",
            MethodId::Kendall => "Kendall's tau",
            MethodId::ChiSquare => "Chi-square test of independence",
            MethodId::FisherExact => "Fisher's exact test",
            MethodId::LinearRegression => "Linear regression",
            MethodId::LogisticRegression => "Logistic regression",
            MethodId::KaplanMeier => "Kaplan-Meier with log-rank test",
            MethodId::CoxRegression => "Cox proportional hazards",
            MethodId::RocAnalysis => "ROC analysis",
            MethodId::MixedEffects => "Linear mixed-effects model",
            MethodId::ClusteredCorrelation => "Clustered correlation matrix",
            MethodId::Descriptive => "Descriptive statistics",
        }
    }

    /// Whether the method compares a numeric outcome across groups.
    pub fn is_group_comparison(&self) -> bool {
        matches!(
            self,
            MethodId::TTestInd
                | MethodId::TTestWelch
                | MethodId::TTestPaired
                | MethodId::MannWhitney
                | MethodId::Wilcoxon
                | MethodId::Anova
                | MethodId::WelchAnova
                | MethodId::Kruskal
                | MethodId::RmAnova
                | MethodId::Friedman
        )
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MethodId {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MethodId::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| AnalysisError::UnknownMethod(s.to_string()))
    }
}

/// Broad family a method belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MethodFamily {
    Parametric,
    NonParametric,
    Correlation,
    Categorical,
    Survival,
    Diagnostic,
    Descriptive,
}

/// Column role a method reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleName {
    Target,
    Group,
    Second,
    Subject,
    Time,
    Event,
    Covariates,
    Variables,
}

impl RoleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleName::Target => "target",
            RoleName::Group => "group",
            RoleName::Second => "second",
            RoleName::Subject => "subject",
            RoleName::Time => "time",
            RoleName::Event => "event",
            RoleName::Covariates => "covariates",
            RoleName::Variables => "variables",
        }
    }
}

/// Column type a role accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedType {
    Numeric,
    Categorical,
    Any,
}

impl ExpectedType {
    fn accepts(&self, actual: ColumnType) -> bool {
        match self {
            ExpectedType::Any => true,
            ExpectedType::Numeric => actual == ColumnType::Numeric,
            ExpectedType::Categorical => actual == ColumnType::Categorical,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ExpectedType::Numeric => "numeric",
            ExpectedType::Categorical => "categorical",
            ExpectedType::Any => "any",
        }
    }
}

/// One input role of a method descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InputRole {
    pub name: RoleName,
    pub expected_dtype: ExpectedType,
    pub required: bool,
    pub multiple: bool,
}

const fn role(name: RoleName, expected_dtype: ExpectedType, required: bool) -> InputRole {
    InputRole {
        name,
        expected_dtype,
        required,
        multiple: false,
    }
}

const fn many(name: RoleName, expected_dtype: ExpectedType, required: bool) -> InputRole {
    InputRole {
        name,
        expected_dtype,
        required,
        multiple: true,
    }
}

/// Immutable description of a method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodDescriptor {
    pub id: MethodId,
    pub name: &'static str,
    pub family: MethodFamily,
    pub input_roles: Vec<InputRole>,
    pub min_groups: Option<usize>,
    pub max_groups: Option<usize>,
    pub enabled: bool,
}

/// Column references for one execution, keyed by role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnRoles {
    pub target: Option<String>,
    pub group: Option<String>,
    pub second: Option<String>,
    pub subject: Option<String>,
    pub time: Option<String>,
    pub event: Option<String>,
    pub covariates: Vec<String>,
    pub variables: Vec<String>,
}

impl ColumnRoles {
    /// Roles for a numeric target split by a grouping column.
    pub fn grouped(target: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            group: Some(group.into()),
            ..Self::default()
        }
    }

    /// Roles for two columns read side by side.
    pub fn pair(target: impl Into<String>, second: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            second: Some(second.into()),
            ..Self::default()
        }
    }

    fn columns_for(&self, name: RoleName) -> Vec<&str> {
        match name {
            RoleName::Target => self.target.as_deref().into_iter().collect(),
            RoleName::Group => self.group.as_deref().into_iter().collect(),
            RoleName::Second => self.second.as_deref().into_iter().collect(),
            RoleName::Subject => self.subject.as_deref().into_iter().collect(),
            RoleName::Time => self.time.as_deref().into_iter().collect(),
            RoleName::Event => self.event.as_deref().into_iter().collect(),
            RoleName::Covariates => self.covariates.iter().map(String::as_str).collect(),
            RoleName::Variables => self.variables.iter().map(String::as_str).collect(),
        }
    }

    /// The column bound to a single-valued role.
    pub fn require(&self, name: RoleName) -> Result<&str, AnalysisError> {
        self.columns_for(name)
            .first()
            .copied()
            .ok_or_else(|| AnalysisError::InvalidOption(format!("missing '{}' column", name.as_str())))
    }

    /// Every column referenced by any role.
    pub fn all_columns(&self) -> Vec<&str> {
        [
            RoleName::Target,
            RoleName::Group,
            RoleName::Second,
            RoleName::Subject,
            RoleName::Time,
            RoleName::Event,
            RoleName::Covariates,
            RoleName::Variables,
        ]
        .iter()
        .flat_map(|r| self.columns_for(*r))
        .collect()
    }
}

/// Read-only method catalog.
#[derive(Debug, Clone)]
pub struct MethodRegistry {
    descriptors: BTreeMap<MethodId, MethodDescriptor>,
}

impl MethodRegistry {
    /// The standard catalog with every method enabled.
    pub fn standard() -> Self {
        use ExpectedType::{Any, Numeric};
        use MethodFamily::*;
        use RoleName::*;

        let two_groups = || vec![role(Target, Numeric, true), role(Group, Any, true)];
        let paired = || {
            vec![
                role(Target, Numeric, true),
                role(Group, Any, false),
                role(Second, Numeric, false),
                role(Subject, Any, false),
            ]
        };
        let repeated = || {
            vec![
                role(Target, Numeric, true),
                role(Group, Any, true),
                role(Subject, Any, false),
            ]
        };
        let bivariate = || vec![role(Target, Numeric, true), role(Second, Numeric, true)];
        let table = || vec![role(Target, Any, true), role(Group, Any, true)];

        let entries = [
            (MethodId::TTestInd, Parametric, two_groups(), Some(2), Some(2)),
            (MethodId::TTestWelch, Parametric, two_groups(), Some(2), Some(2)),
            (MethodId::TTestPaired, Parametric, paired(), Some(2), Some(2)),
            (MethodId::MannWhitney, NonParametric, two_groups(), Some(2), Some(2)),
            (MethodId::Wilcoxon, NonParametric, paired(), Some(2), Some(2)),
            (MethodId::Anova, Parametric, two_groups(), Some(2), None),
            (MethodId::WelchAnova, Parametric, two_groups(), Some(2), None),
            (MethodId::Kruskal, NonParametric, two_groups(), Some(2), None),
            (MethodId::RmAnova, Parametric, repeated(), Some(2), None),
            (MethodId::Friedman, NonParametric, repeated(), Some(3), None),
            (MethodId::Pearson, Correlation, bivariate(), None, None),
            (MethodId::Spearman, Correlation, bivariate(), None, None),
            (MethodId::Kendall, Correlation, bivariate(), None, None),
            (MethodId::ChiSquare, Categorical, table(), Some(2), None),
            (MethodId::FisherExact, Categorical, table(), Some(2), Some(2)),
            (
                MethodId::LinearRegression,
                Parametric,
                vec![role(Target, Numeric, true), many(Covariates, Any, true)],
                None,
                None,
            ),
            (
                MethodId::LogisticRegression,
                Parametric,
                vec![role(Target, Any, true), many(Covariates, Any, true)],
                None,
                None,
            ),
            (
                MethodId::KaplanMeier,
                Survival,
                vec![
                    role(Target, Numeric, true),
                    role(Event, Any, true),
                    role(Group, Any, false),
                ],
                None,
                None,
            ),
            (
                MethodId::CoxRegression,
                Survival,
                vec![
                    role(Target, Numeric, true),
                    role(Event, Any, true),
                    role(Group, Any, false),
                    many(Covariates, Any, false),
                ],
                None,
                None,
            ),
            (
                MethodId::RocAnalysis,
                Diagnostic,
                vec![role(Target, Numeric, true), role(Group, Any, true)],
                Some(2),
                Some(2),
            ),
            (
                MethodId::MixedEffects,
                Parametric,
                vec![
                    role(Target, Numeric, true),
                    role(Time, Any, true),
                    role(Group, Any, true),
                    role(Subject, Any, true),
                ],
                Some(2),
                None,
            ),
            (
                MethodId::ClusteredCorrelation,
                Correlation,
                vec![many(Variables, Numeric, true)],
                None,
                None,
            ),
            (
                MethodId::Descriptive,
                Descriptive,
                vec![role(Target, Numeric, true), role(Group, Any, false)],
                None,
                None,
            ),
        ];

        let descriptors = entries
            .into_iter()
            .map(|(id, family, input_roles, min_groups, max_groups)| {
                (
                    id,
                    MethodDescriptor {
                        id,
                        name: id.display_name(),
                        family,
                        input_roles,
                        min_groups,
                        max_groups,
                        enabled: true,
                    },
                )
            })
            .collect();

        Self { descriptors }
    }

    /// The standard catalog with the listed methods disabled.
    pub fn with_disabled(disabled: &[MethodId]) -> Self {
        let mut registry = Self::standard();
        for id in disabled {
            if let Some(descriptor) = registry.descriptors.get_mut(id) {
                descriptor.enabled = false;
            }
        }
        registry
    }

    pub fn get(&self, id: MethodId) -> Option<&MethodDescriptor> {
        self.descriptors.get(&id)
    }

    /// Look a method up by its wire id.
    pub fn lookup(&self, id: &str) -> Result<&MethodDescriptor, AnalysisError> {
        let id = MethodId::from_str(id)?;
        self.get(id)
            .ok_or_else(|| AnalysisError::UnknownMethod(id.to_string()))
    }

    /// Look a method up and fail if it is disabled.
    pub fn require_enabled(&self, id: MethodId) -> Result<&MethodDescriptor, AnalysisError> {
        let descriptor = self
            .get(id)
            .ok_or_else(|| AnalysisError::UnknownMethod(id.to_string()))?;
        if !descriptor.enabled {
            return Err(AnalysisError::MethodDisabled(id));
        }
        Ok(descriptor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Check that `roles` satisfies the descriptor of `id` against `dataset`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a missing required role, a
    /// multi-column binding to a single-valued role, a missing column or a
    /// column of the wrong type.
    pub fn validate_roles(
        &self,
        id: MethodId,
        dataset: &Dataset,
        roles: &ColumnRoles,
    ) -> Result<(), AnalysisError> {
        let descriptor = self.require_enabled(id)?;
        for input in &descriptor.input_roles {
            let columns = roles.columns_for(input.name);
            if input.required && columns.is_empty() {
                return Err(AnalysisError::InvalidOption(format!(
                    "{} requires a '{}' column",
                    id,
                    input.name.as_str()
                )));
            }
            for column in columns {
                let actual = dataset.column_type(column)?;
                if !input.expected_dtype.accepts(actual) {
                    return Err(AnalysisError::IncompatibleColumn {
                        column: column.to_string(),
                        expected: input.expected_dtype.as_str().to_string(),
                        actual: actual.as_str().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Column;

    #[test]
    fn test_standard_registry_covers_every_method() {
        let registry = MethodRegistry::standard();
        assert_eq!(registry.len(), MethodId::ALL.len());
        for id in MethodId::ALL {
            let descriptor = registry.get(id).unwrap();
            assert_eq!(descriptor.id, id);
            assert!(descriptor.enabled);
        }
    }

    #[test]
    fn test_method_id_parse() {
        assert_eq!("t_test_ind".parse::<MethodId>().unwrap(), MethodId::TTestInd);
        assert_eq!(
            "clustered_correlation".parse::<MethodId>().unwrap(),
            MethodId::ClusteredCorrelation
        );
        assert!(matches!(
            "bogus".parse::<MethodId>(),
            Err(AnalysisError::UnknownMethod(_))
        ));
    }

    #[test]
    fn test_method_id_serde_matches_as_str() {
        for id in MethodId::ALL {
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.as_str()));
        }
    }

    #[test]
    fn test_disabled_method() {
        let registry = MethodRegistry::with_disabled(&[MethodId::CoxRegression]);
        assert!(!registry.get(MethodId::CoxRegression).unwrap().enabled);
        assert_eq!(
            registry.require_enabled(MethodId::CoxRegression).unwrap_err(),
            AnalysisError::MethodDisabled(MethodId::CoxRegression)
        );
        assert!(registry.require_enabled(MethodId::Anova).is_ok());
    }

    #[test]
    fn test_validate_roles() {
        let ds = Dataset::new("ds")
            .with_column("y", Column::numeric([1.0, 2.0]))
            .unwrap()
            .with_column("g", Column::categorical(["a", "b"]))
            .unwrap();
        let registry = MethodRegistry::standard();

        assert!(registry
            .validate_roles(MethodId::TTestInd, &ds, &ColumnRoles::grouped("y", "g"))
            .is_ok());

        let err = registry
            .validate_roles(MethodId::TTestInd, &ds, &ColumnRoles::grouped("g", "y"))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::IncompatibleColumn { .. }));

        let err = registry
            .validate_roles(MethodId::TTestInd, &ds, &ColumnRoles::grouped("y", "nope"))
            .unwrap_err();
        assert_eq!(err, AnalysisError::ColumnNotFound("nope".into()));

        let roles = ColumnRoles {
            target: Some("y".into()),
            ..ColumnRoles::default()
        };
        let err = registry
            .validate_roles(MethodId::Pearson, &ds, &roles)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidOption(_)));
    }
}
