//! Protocol and run record types.
//!
//! A protocol is `{name, steps: [{id, type, target, group?, ...}]}`. Every
//! step key that is not a column role or a step directive is a method option
//! and is validated later against the option struct of the chosen method.

use std::collections::BTreeMap;
use std::str::FromStr;

use hypothesis_protocol_core::{
    AnalysisError, AnalysisResult, ColumnRoles, CorrectionMethod, ErrorRecord, MethodId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An ordered list of analysis steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Protocol {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Compare,
    Correlation,
    Survival,
    Regression,
    DescriptiveCompare,
    BatchCompareByFactor,
    HypothesisTest,
    MixedEffects,
    ClusteredCorrelation,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Compare => "compare",
            StepKind::Correlation => "correlation",
            StepKind::Survival => "survival",
            StepKind::Regression => "regression",
            StepKind::DescriptiveCompare => "descriptive_compare",
            StepKind::BatchCompareByFactor => "batch_compare_by_factor",
            StepKind::HypothesisTest => "hypothesis_test",
            StepKind::MixedEffects => "mixed_effects",
            StepKind::ClusteredCorrelation => "clustered_correlation",
        }
    }
}

/// One protocol step. Unrecognized keys land in `config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

/// Keys of a step config that are not method options.
const DIRECTIVE_KEYS: &[&str] = &[
    "second",
    "subject",
    "time",
    "event",
    "covariates",
    "variables",
    "method",
    "split_by",
    "targets",
    "paired",
    "batch_correction",
];

/// A step's config split into roles, directives and method options.
#[derive(Debug, Clone, PartialEq)]
pub struct StepPlan {
    pub roles: ColumnRoles,
    /// Explicitly requested method; `None` means select automatically.
    pub method: Option<MethodId>,
    pub split_by: Option<String>,
    /// Outcome columns of a batch step; defaults to `[target]`.
    pub targets: Vec<String>,
    pub paired: bool,
    pub batch_correction: Option<String>,
    pub options: Map<String, Value>,
}

impl Step {
    /// Split the step config.
    ///
    /// # Errors
    ///
    /// [`AnalysisError::InvalidOption`] for a directive of the wrong shape and
    /// [`AnalysisError::UnknownMethod`] for an unrecognized `method`.
    pub fn plan(&self) -> Result<StepPlan, AnalysisError> {
        let config = &self.config;
        let roles = ColumnRoles {
            target: self.target.clone(),
            group: self.group.clone(),
            second: string_key(config, "second")?,
            subject: string_key(config, "subject")?,
            time: string_key(config, "time")?,
            event: string_key(config, "event")?,
            covariates: string_list_key(config, "covariates")?,
            variables: string_list_key(config, "variables")?,
        };
        let method = string_key(config, "method")?
            .map(|m| MethodId::from_str(&m))
            .transpose()?;
        let mut targets = string_list_key(config, "targets")?;
        if targets.is_empty() {
            targets.extend(self.target.clone());
        }
        let paired = match config.get("paired") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(AnalysisError::InvalidOption(format!(
                    "'paired' must be a boolean, got {}",
                    other
                )))
            }
        };
        let options = config
            .iter()
            .filter(|(k, _)| !DIRECTIVE_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(StepPlan {
            roles,
            method,
            split_by: string_key(config, "split_by")?,
            targets,
            paired,
            batch_correction: string_key(config, "batch_correction")?,
            options,
        })
    }
}

fn string_key(config: &Map<String, Value>, key: &str) -> Result<Option<String>, AnalysisError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(AnalysisError::InvalidOption(format!(
            "'{}' must be a string, got {}",
            key, other
        ))),
    }
}

/// A list of column names; a bare string counts as a list of one.
fn string_list_key(config: &Map<String, Value>, key: &str) -> Result<Vec<String>, AnalysisError> {
    let invalid = || AnalysisError::InvalidOption(format!("'{}' must be a list of column names", key));
    match config.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        Some(_) => Err(invalid()),
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(&self, next: StepState) -> bool {
        matches!(
            (self, next),
            (StepState::Pending, StepState::Running)
                | (StepState::Running, StepState::Completed)
                | (StepState::Running, StepState::Failed)
        )
    }
}

/// Aggregate status of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step completed.
    Completed,
    /// At least one step failed.
    Partial,
}

/// One slice x target entry of a batch step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    /// Label of the splitting column, `None` when the batch is not split.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    pub adjusted_p_value: Option<f64>,
    pub significant_adj: bool,
}

/// Results of a `batch_compare_by_factor` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_by: Option<String>,
    pub correction: CorrectionMethod,
    pub entries: Vec<BatchEntry>,
    pub warnings: Vec<String>,
}

/// What a step left in the run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepOutput {
    Failed(ErrorRecord),
    Batch(BatchResult),
    Analysis(Box<AnalysisResult>),
}

impl StepOutput {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutput::Failed(_))
    }

    pub fn analysis(&self) -> Option<&AnalysisResult> {
        match self {
            StepOutput::Analysis(result) => Some(result),
            _ => None,
        }
    }

    pub fn batch(&self) -> Option<&BatchResult> {
        match self {
            StepOutput::Batch(batch) => Some(batch),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            StepOutput::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Final state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub state: StepState,
}

/// Immutable record of one protocol run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRunRecord {
    pub protocol_name: String,
    pub dataset_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub results: BTreeMap<String, StepOutput>,
    pub steps: Vec<StepStatus>,
    pub log: Vec<String>,
    pub completed_steps: usize,
    pub failed_steps: usize,
    /// Seconds since the Unix epoch.
    pub started_at: u64,
    pub finished_at: u64,
}

impl ProtocolRunRecord {
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(value: Value) -> Step {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_protocol() {
        let protocol = Protocol::from_json_str(
            r#"{
                "name": "baseline",
                "steps": [
                    {"id": "s1", "type": "compare", "target": "weight", "group": "arm"},
                    {"id": "s2", "type": "clustered_correlation", "variables": ["a", "b", "c"]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(protocol.steps.len(), 2);
        assert_eq!(protocol.steps[0].kind, StepKind::Compare);
        assert_eq!(protocol.steps[0].group.as_deref(), Some("arm"));
        assert_eq!(protocol.steps[1].kind, StepKind::ClusteredCorrelation);
        assert!(protocol.steps[1].target.is_none());
    }

    #[test]
    fn test_unknown_step_type() {
        let result = Protocol::from_json_str(
            r#"{"name": "x", "steps": [{"id": "s1", "type": "astrology"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_plan_splits_roles_and_options() {
        let s = step(json!({
            "id": "s1",
            "type": "hypothesis_test",
            "target": "y",
            "group": "g",
            "method": "mann_whitney",
            "subject": "pid",
            "paired": false,
            "alternative": "greater",
            "use_bootstrap": true
        }));
        let plan = s.plan().unwrap();
        assert_eq!(plan.method, Some(MethodId::MannWhitney));
        assert_eq!(plan.roles.target.as_deref(), Some("y"));
        assert_eq!(plan.roles.subject.as_deref(), Some("pid"));
        assert_eq!(plan.targets, vec!["y"]);
        assert!(!plan.paired);
        assert_eq!(plan.options.len(), 2);
        assert_eq!(plan.options["alternative"], "greater");
    }

    #[test]
    fn test_plan_lists() {
        let s = step(json!({
            "id": "b",
            "type": "batch_compare_by_factor",
            "group": "arm",
            "targets": ["a", "b"],
            "split_by": "site",
            "covariates": "age"
        }));
        let plan = s.plan().unwrap();
        assert_eq!(plan.targets, vec!["a", "b"]);
        assert_eq!(plan.split_by.as_deref(), Some("site"));
        assert_eq!(plan.roles.covariates, vec!["age"]);
        assert!(plan.options.is_empty());
    }

    #[test]
    fn test_plan_rejects_bad_directives() {
        let s = step(json!({"id": "s", "type": "compare", "method": "astrology"}));
        assert!(matches!(s.plan(), Err(AnalysisError::UnknownMethod(_))));

        let s = step(json!({"id": "s", "type": "compare", "paired": "yes"}));
        assert!(matches!(s.plan(), Err(AnalysisError::InvalidOption(_))));

        let s = step(json!({"id": "s", "type": "regression", "covariates": [1, 2]}));
        assert!(matches!(s.plan(), Err(AnalysisError::InvalidOption(_))));
    }

    #[test]
    fn test_state_transitions() {
        assert!(StepState::Pending.can_advance_to(StepState::Running));
        assert!(StepState::Running.can_advance_to(StepState::Failed));
        assert!(!StepState::Pending.can_advance_to(StepState::Completed));
        assert!(!StepState::Completed.can_advance_to(StepState::Running));
        assert!(StepState::Failed.is_terminal());
        assert!(!StepState::Running.is_terminal());
    }

    #[test]
    fn test_step_output_untagged() {
        let failed: StepOutput = serde_json::from_value(json!({
            "error": "Column not found: x",
            "kind": "configuration"
        }))
        .unwrap();
        assert!(failed.is_failed());
        assert_eq!(failed.error().unwrap().error, "Column not found: x");
    }
}
