//! Per-family option structs.
//!
//! Options arrive as a free-form JSON map (the non-role keys of a protocol
//! step) and are validated here, at the boundary, into a typed struct for
//! the family of the selected method. Unknown keys are rejected.
//!
//! Options that have a process-wide default (`alpha`, `confidence_level`,
//! `bootstrap_resamples`, `seed`, `correction`) are `Option`s that fall back
//! to [`AnalysisDefaults`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::assumptions::HomogeneityTest;
use crate::error::AnalysisError;
use crate::registry::MethodId;
use crate::stats::Alternative;

/// Process-wide defaults, normally read from the `[analysis]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisDefaults {
    pub alpha: f64,
    pub confidence_level: f64,
    pub bootstrap_resamples: usize,
    pub seed: u64,
    /// Correction applied to pairwise post-hoc tests.
    pub post_hoc_correction: String,
    /// Correction applied across the results of a batch step.
    pub batch_correction: String,
}

impl Default for AnalysisDefaults {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            confidence_level: 0.95,
            bootstrap_resamples: 5000,
            seed: 42,
            post_hoc_correction: "holm".to_string(),
            batch_correction: "fdr_bh".to_string(),
        }
    }
}

impl AnalysisDefaults {
    /// Check that the defaults are usable.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        check_probability("alpha", self.alpha)?;
        check_probability("confidence_level", self.confidence_level)?;
        if self.bootstrap_resamples == 0 {
            return Err(AnalysisError::InvalidOption(
                "bootstrap_resamples must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_probability(name: &str, value: f64) -> Result<(), AnalysisError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(AnalysisError::InvalidOption(format!(
            "{} must be strictly between 0 and 1, got {}",
            name, value
        )))
    }
}

/// Accessors shared by every option struct.
pub trait CommonOptions {
    fn alpha_override(&self) -> Option<f64>;
    fn confidence_override(&self) -> Option<f64>;

    fn alpha(&self, defaults: &AnalysisDefaults) -> f64 {
        self.alpha_override().unwrap_or(defaults.alpha)
    }

    fn confidence_level(&self, defaults: &AnalysisDefaults) -> f64 {
        self.confidence_override()
            .unwrap_or(defaults.confidence_level)
    }

    fn validate_common(&self) -> Result<(), AnalysisError> {
        if let Some(alpha) = self.alpha_override() {
            check_probability("alpha", alpha)?;
        }
        if let Some(level) = self.confidence_override() {
            check_probability("confidence_level", level)?;
        }
        Ok(())
    }
}

macro_rules! common_options {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CommonOptions for $ty {
                fn alpha_override(&self) -> Option<f64> {
                    self.alpha
                }

                fn confidence_override(&self) -> Option<f64> {
                    self.confidence_level
                }
            }
        )*
    };
}

/// Effect size reported by ANOVA-type tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmnibusEffectSize {
    #[default]
    EtaSquared,
    OmegaSquared,
}

/// Pairwise follow-up test run after a significant omnibus result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostHocMethod {
    /// Tukey's HSD on the pooled ANOVA error term.
    Tukey,
    /// Student t-tests with pooled pair variance.
    TTest,
    /// Welch t-tests.
    Welch,
    /// Mann-Whitney rank-sum tests.
    MannWhitney,
    /// Paired t-tests on aligned groups.
    PairedT,
    /// Wilcoxon signed-rank tests on aligned groups.
    Wilcoxon,
}

impl PostHocMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostHocMethod::Tukey => "tukey",
            PostHocMethod::TTest => "t_test",
            PostHocMethod::Welch => "welch",
            PostHocMethod::MannWhitney => "mann_whitney",
            PostHocMethod::PairedT => "paired_t",
            PostHocMethod::Wilcoxon => "wilcoxon",
        }
    }

    /// The default follow-up for an omnibus method.
    pub fn default_for(method: MethodId) -> Option<Self> {
        match method {
            MethodId::Anova => Some(PostHocMethod::Tukey),
            MethodId::WelchAnova => Some(PostHocMethod::Welch),
            MethodId::Kruskal => Some(PostHocMethod::MannWhitney),
            MethodId::RmAnova => Some(PostHocMethod::PairedT),
            MethodId::Friedman => Some(PostHocMethod::Wilcoxon),
            _ => None,
        }
    }

    /// Whether the follow-up compares aligned (paired) samples.
    pub fn is_paired(&self) -> bool {
        matches!(self, PostHocMethod::PairedT | PostHocMethod::Wilcoxon)
    }
}

/// Options for two-group and omnibus comparisons.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompareOptions {
    pub alternative: Alternative,
    pub alpha: Option<f64>,
    pub confidence_level: Option<f64>,
    /// Percentile bootstrap CI for the location difference.
    pub use_bootstrap: bool,
    pub bootstrap_resamples: Option<usize>,
    pub seed: Option<u64>,
    /// Force Student (`true`) or Welch (`false`) for a two-group t-test.
    pub equal_var: Option<bool>,
    pub homogeneity_test: HomogeneityTest,
    pub effect_size: OmnibusEffectSize,
    pub post_hoc: Option<PostHocMethod>,
    /// Correction for pairwise post-hoc p-values.
    pub correction: Option<String>,
}

impl CompareOptions {
    pub fn bootstrap_resamples(&self, defaults: &AnalysisDefaults) -> usize {
        self.bootstrap_resamples
            .unwrap_or(defaults.bootstrap_resamples)
    }

    pub fn seed(&self, defaults: &AnalysisDefaults) -> u64 {
        self.seed.unwrap_or(defaults.seed)
    }

    pub fn correction<'a>(&'a self, defaults: &'a AnalysisDefaults) -> &'a str {
        self.correction
            .as_deref()
            .unwrap_or(&defaults.post_hoc_correction)
    }
}

/// Options for bivariate correlation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorrelationOptions {
    pub alternative: Alternative,
    pub alpha: Option<f64>,
    pub confidence_level: Option<f64>,
}

/// Options for contingency-table tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContingencyOptions {
    pub alternative: Alternative,
    pub alpha: Option<f64>,
    pub confidence_level: Option<f64>,
    /// Yates continuity correction for tables with one degree of freedom.
    pub yates: bool,
}

impl Default for ContingencyOptions {
    fn default() -> Self {
        Self {
            alternative: Alternative::TwoSided,
            alpha: None,
            confidence_level: None,
            yates: true,
        }
    }
}

/// Options for linear and logistic regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegressionOptions {
    pub alpha: Option<f64>,
    pub confidence_level: Option<f64>,
    /// Outcome label treated as 1 in logistic regression.
    pub positive_class: Option<String>,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for RegressionOptions {
    fn default() -> Self {
        Self {
            alpha: None,
            confidence_level: None,
            positive_class: None,
            max_iter: 100,
            tol: 1e-8,
        }
    }
}

/// Options for Kaplan-Meier and Cox models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SurvivalOptions {
    pub alpha: Option<f64>,
    pub confidence_level: Option<f64>,
    /// L2 penalty on Cox coefficients.
    pub penalizer: f64,
    /// Event label counted as an observed event when the event column is
    /// categorical.
    pub event_value: Option<String>,
    pub max_iter: usize,
}

impl Default for SurvivalOptions {
    fn default() -> Self {
        Self {
            alpha: None,
            confidence_level: None,
            penalizer: 0.01,
            event_value: None,
            max_iter: 50,
        }
    }
}

/// Options for ROC analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RocOptions {
    pub alpha: Option<f64>,
    pub confidence_level: Option<f64>,
    /// Label of the positive class; defaults to the greater label.
    pub positive_class: Option<String>,
    pub bootstrap_resamples: Option<usize>,
    pub seed: Option<u64>,
}

/// Minimum bootstrap resamples for the AUC interval.
pub const ROC_MIN_RESAMPLES: usize = 1000;

impl RocOptions {
    pub fn bootstrap_resamples(&self, defaults: &AnalysisDefaults) -> usize {
        self.bootstrap_resamples
            .unwrap_or(defaults.bootstrap_resamples)
            .max(ROC_MIN_RESAMPLES)
    }

    pub fn seed(&self, defaults: &AnalysisDefaults) -> u64 {
        self.seed.unwrap_or(defaults.seed)
    }
}

/// Options for the linear mixed-effects model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MixedOptions {
    pub alpha: Option<f64>,
    pub confidence_level: Option<f64>,
    /// Add a per-subject random slope on (numeric) time.
    pub random_slope: bool,
    /// Treat time as a categorical factor instead of a numeric covariate.
    pub time_as_factor: bool,
    pub max_iter: usize,
}

impl Default for MixedOptions {
    fn default() -> Self {
        Self {
            alpha: None,
            confidence_level: None,
            random_slope: false,
            time_as_factor: true,
            max_iter: 1000,
        }
    }
}

/// Correlation coefficient used by the clustered matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMethod {
    #[default]
    Pearson,
    Spearman,
    Kendall,
}

/// Agglomeration rule for hierarchical clustering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    Single,
    Complete,
    #[default]
    Average,
    Weighted,
    Ward,
}

/// How the number of clusters is picked when none is given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterDetection {
    /// Largest jump between consecutive merge distances.
    #[default]
    Elbow,
    /// Best mean silhouette over candidate cluster counts.
    Silhouette,
}

/// Options for the clustered correlation matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterOptions {
    pub alpha: Option<f64>,
    pub confidence_level: Option<f64>,
    pub correlation_method: CorrelationMethod,
    pub linkage: Linkage,
    pub n_clusters: Option<usize>,
    pub distance_threshold: Option<f64>,
    pub detection: ClusterDetection,
    pub max_clusters: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            alpha: None,
            confidence_level: None,
            correlation_method: CorrelationMethod::Pearson,
            linkage: Linkage::Average,
            n_clusters: None,
            distance_threshold: None,
            detection: ClusterDetection::Elbow,
            max_clusters: 10,
        }
    }
}

/// Options for summary statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DescriptiveOptions {
    pub alpha: Option<f64>,
    pub confidence_level: Option<f64>,
}

common_options!(
    CompareOptions,
    CorrelationOptions,
    ContingencyOptions,
    RegressionOptions,
    SurvivalOptions,
    RocOptions,
    MixedOptions,
    ClusterOptions,
    DescriptiveOptions,
);

/// Validated options for one execution, tagged by family.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodOptions {
    Compare(CompareOptions),
    Correlation(CorrelationOptions),
    Contingency(ContingencyOptions),
    Regression(RegressionOptions),
    Survival(SurvivalOptions),
    Roc(RocOptions),
    Mixed(MixedOptions),
    Cluster(ClusterOptions),
    Descriptive(DescriptiveOptions),
}

fn decode<T: DeserializeOwned>(method: MethodId, raw: &Map<String, Value>) -> Result<T, AnalysisError> {
    serde_json::from_value(Value::Object(raw.clone()))
        .map_err(|e| AnalysisError::InvalidOption(format!("{}: {}", method, e)))
}

impl MethodOptions {
    /// Decode and validate `raw` into the option struct of `method`'s family.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::InvalidOption`] for unknown keys, values of
    /// the wrong shape and out-of-range probabilities.
    pub fn parse(method: MethodId, raw: &Map<String, Value>) -> Result<Self, AnalysisError> {
        use MethodId::*;
        let options = match method {
            TTestInd | TTestWelch | TTestPaired | MannWhitney | Wilcoxon | Anova | WelchAnova
            | Kruskal | RmAnova | Friedman => MethodOptions::Compare(decode(method, raw)?),
            Pearson | Spearman | Kendall => MethodOptions::Correlation(decode(method, raw)?),
            ChiSquare | FisherExact => MethodOptions::Contingency(decode(method, raw)?),
            LinearRegression | LogisticRegression => {
                MethodOptions::Regression(decode(method, raw)?)
            }
            KaplanMeier | CoxRegression => MethodOptions::Survival(decode(method, raw)?),
            RocAnalysis => MethodOptions::Roc(decode(method, raw)?),
            MixedEffects => MethodOptions::Mixed(decode(method, raw)?),
            ClusteredCorrelation => MethodOptions::Cluster(decode(method, raw)?),
            Descriptive => MethodOptions::Descriptive(decode(method, raw)?),
        };
        options.validate()?;
        Ok(options)
    }

    /// Default options for `method`.
    pub fn default_for(method: MethodId) -> Self {
        use MethodId::*;
        match method {
            TTestInd | TTestWelch | TTestPaired | MannWhitney | Wilcoxon | Anova | WelchAnova
            | Kruskal | RmAnova | Friedman => MethodOptions::Compare(CompareOptions::default()),
            Pearson | Spearman | Kendall => {
                MethodOptions::Correlation(CorrelationOptions::default())
            }
            ChiSquare | FisherExact => MethodOptions::Contingency(ContingencyOptions::default()),
            LinearRegression | LogisticRegression => {
                MethodOptions::Regression(RegressionOptions::default())
            }
            KaplanMeier | CoxRegression => MethodOptions::Survival(SurvivalOptions::default()),
            RocAnalysis => MethodOptions::Roc(RocOptions::default()),
            MixedEffects => MethodOptions::Mixed(MixedOptions::default()),
            ClusteredCorrelation => MethodOptions::Cluster(ClusterOptions::default()),
            Descriptive => MethodOptions::Descriptive(DescriptiveOptions::default()),
        }
    }

    fn common(&self) -> &dyn CommonOptions {
        match self {
            MethodOptions::Compare(o) => o,
            MethodOptions::Correlation(o) => o,
            MethodOptions::Contingency(o) => o,
            MethodOptions::Regression(o) => o,
            MethodOptions::Survival(o) => o,
            MethodOptions::Roc(o) => o,
            MethodOptions::Mixed(o) => o,
            MethodOptions::Cluster(o) => o,
            MethodOptions::Descriptive(o) => o,
        }
    }

    pub fn alpha(&self, defaults: &AnalysisDefaults) -> f64 {
        self.common().alpha(defaults)
    }

    pub fn confidence_level(&self, defaults: &AnalysisDefaults) -> f64 {
        self.common().confidence_level(defaults)
    }

    fn validate(&self) -> Result<(), AnalysisError> {
        self.common().validate_common()?;
        match self {
            MethodOptions::Compare(o) if o.bootstrap_resamples == Some(0) => Err(
                AnalysisError::InvalidOption("bootstrap_resamples must be positive".to_string()),
            ),
            MethodOptions::Survival(o) if o.penalizer.is_nan() || o.penalizer < 0.0 => Err(
                AnalysisError::InvalidOption("penalizer must be non-negative".to_string()),
            ),
            MethodOptions::Cluster(o) if o.n_clusters == Some(0) => Err(
                AnalysisError::InvalidOption("n_clusters must be positive".to_string()),
            ),
            MethodOptions::Cluster(o) if o.max_clusters < 2 => Err(
                AnalysisError::InvalidOption("max_clusters must be at least 2".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_parse_compare_options() {
        let options = MethodOptions::parse(
            MethodId::TTestInd,
            &map(json!({"alternative": "greater", "use_bootstrap": true, "confidence_level": 0.9})),
        )
        .unwrap();
        match options {
            MethodOptions::Compare(o) => {
                assert_eq!(o.alternative, Alternative::Greater);
                assert!(o.use_bootstrap);
                assert_eq!(o.confidence_level, Some(0.9));
            }
            other => panic!("unexpected options: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = MethodOptions::parse(MethodId::Pearson, &map(json!({"bogus": 1}))).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidOption(_)));
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_out_of_range_confidence_rejected() {
        let err = MethodOptions::parse(MethodId::Anova, &map(json!({"confidence_level": 1.5})))
            .unwrap_err();
        assert!(err.to_string().contains("confidence_level"));
    }

    #[test]
    fn test_defaults_fill_missing_values() {
        let defaults = AnalysisDefaults {
            alpha: 0.01,
            ..AnalysisDefaults::default()
        };
        let options = MethodOptions::default_for(MethodId::ChiSquare);
        assert_eq!(options.alpha(&defaults), 0.01);
        assert_eq!(options.confidence_level(&defaults), 0.95);
        match options {
            MethodOptions::Contingency(o) => assert!(o.yates),
            other => panic!("unexpected options: {:?}", other),
        }
    }

    #[test]
    fn test_roc_resamples_have_a_floor() {
        let defaults = AnalysisDefaults {
            bootstrap_resamples: 200,
            ..AnalysisDefaults::default()
        };
        assert_eq!(RocOptions::default().bootstrap_resamples(&defaults), ROC_MIN_RESAMPLES);
    }

    #[test]
    fn test_alternative_accepts_both_spellings() {
        for spelling in ["two-sided", "two_sided"] {
            let options =
                MethodOptions::parse(MethodId::Spearman, &map(json!({"alternative": spelling})))
                    .unwrap();
            assert_eq!(
                options,
                MethodOptions::Correlation(CorrelationOptions::default())
            );
        }
    }

    #[test]
    fn test_post_hoc_defaults() {
        assert_eq!(PostHocMethod::default_for(MethodId::Anova), Some(PostHocMethod::Tukey));
        assert_eq!(
            PostHocMethod::default_for(MethodId::Friedman),
            Some(PostHocMethod::Wilcoxon)
        );
        assert_eq!(PostHocMethod::default_for(MethodId::TTestInd), None);
    }
}
