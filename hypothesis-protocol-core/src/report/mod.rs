//! Console summaries of protocol runs.

use thiserror::Error;

use crate::error::ErrorRecord;
use crate::result::AnalysisResult;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a single executed analysis ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Significant,
    NotSignificant,
    /// The method produced no p-value.
    Descriptive,
    Failed(String),
}

/// One line of a run summary.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSummary {
    /// Step name, suffixed with the target for batch steps.
    pub name: String,
    pub method: Option<String>,
    pub p_value: Option<f64>,
    pub effect_size: Option<f64>,
    pub effect_size_name: Option<String>,
    pub outcome: Outcome,
}

impl StepSummary {
    pub fn from_result(name: impl Into<String>, result: &AnalysisResult) -> Self {
        let outcome = match result.p_value {
            None => Outcome::Descriptive,
            Some(_) if result.significant => Outcome::Significant,
            Some(_) => Outcome::NotSignificant,
        };
        Self {
            name: name.into(),
            method: Some(result.method_id.to_string()),
            p_value: result.p_value,
            effect_size: result.effect_size,
            effect_size_name: result.effect_size_name.clone(),
            outcome,
        }
    }

    pub fn failed(name: impl Into<String>, error: &ErrorRecord) -> Self {
        Self {
            name: name.into(),
            method: error.method_id.map(|m| m.to_string()),
            p_value: None,
            effect_size: None,
            effect_size_name: None,
            outcome: Outcome::Failed(error.error.clone()),
        }
    }
}

pub trait Reporter: Send + Sync {
    fn report(&self, title: &str, steps: &[StepSummary]) -> Result<(), ReportError>;
}

mod terminal;
pub use terminal::TerminalReporter;
