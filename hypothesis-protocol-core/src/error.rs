use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::MethodId;

/// Errors raised while selecting or executing a statistical method.
///
/// Every variant is either a configuration problem (the request can never
/// succeed as written) or a computation problem (the data made the
/// requested statistic undefined). See [`AnalysisError::kind`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    /// The method id is not part of the registry.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// The method exists but was disabled at startup.
    #[error("Method is disabled: {0}")]
    MethodDisabled(MethodId),

    /// A referenced column does not exist in the dataset.
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// A column exists but has the wrong type for its role.
    #[error("Column '{column}' is {actual}, expected {expected}")]
    IncompatibleColumn {
        column: String,
        expected: String,
        actual: String,
    },

    /// Too few groups survived cleaning.
    #[error("Not enough valid groups: {found} found, at least {required} required")]
    InsufficientGroups { found: usize, required: usize },

    /// An option is unknown, malformed or out of range.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// Too few observations for the statistic.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// A sample or column has no variance.
    #[error("Zero variance: {0}")]
    ZeroVariance(String),

    /// The model matrix could not be inverted.
    #[error("Singular design matrix: {0}")]
    SingularMatrix(String),

    /// Paired groups have different numbers of observations.
    #[error("Paired groups must have equal length: {0}")]
    UnequalPairedGroups(String),

    /// Any other numerical failure.
    #[error("Computation failed: {0}")]
    Computation(String),
}

/// Coarse classification of an [`AnalysisError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request is malformed: unknown method, missing column, bad option.
    Configuration,
    /// The data made the statistic undefined: singular fit, zero variance.
    Computation,
}

impl AnalysisError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::UnknownMethod(_)
            | AnalysisError::MethodDisabled(_)
            | AnalysisError::ColumnNotFound(_)
            | AnalysisError::IncompatibleColumn { .. }
            | AnalysisError::InsufficientGroups { .. }
            | AnalysisError::InvalidOption(_) => ErrorKind::Configuration,
            AnalysisError::InsufficientData(_)
            | AnalysisError::ZeroVariance(_)
            | AnalysisError::SingularMatrix(_)
            | AnalysisError::UnequalPairedGroups(_)
            | AnalysisError::Computation(_) => ErrorKind::Computation,
        }
    }

    /// Build the serializable record for this error.
    pub fn to_record(&self, method_id: Option<MethodId>) -> ErrorRecord {
        ErrorRecord {
            error: self.to_string(),
            kind: self.kind(),
            method_id,
        }
    }
}

/// In-band error entry stored in place of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Human-readable description.
    pub error: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_id: Option<MethodId>,
}

impl ErrorRecord {
    /// Create a record from a bare message, classified as a computation error.
    pub fn message(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: ErrorKind::Computation,
            method_id: None,
        }
    }
}

impl From<&AnalysisError> for ErrorRecord {
    fn from(err: &AnalysisError) -> Self {
        err.to_record(None)
    }
}

impl From<AnalysisError> for ErrorRecord {
    fn from(err: AnalysisError) -> Self {
        err.to_record(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            AnalysisError::ColumnNotFound("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            AnalysisError::InsufficientGroups {
                found: 1,
                required: 2
            }
            .kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            AnalysisError::SingularMatrix("x".into()).kind(),
            ErrorKind::Computation
        );
        assert_eq!(
            AnalysisError::ZeroVariance("x".into()).kind(),
            ErrorKind::Computation
        );
    }

    #[test]
    fn test_error_display() {
        let err = AnalysisError::InsufficientGroups {
            found: 1,
            required: 2,
        };
        assert_eq!(
            err.to_string(),
            "Not enough valid groups: 1 found, at least 2 required"
        );

        let err = AnalysisError::IncompatibleColumn {
            column: "age".into(),
            expected: "numeric".into(),
            actual: "categorical".into(),
        };
        assert_eq!(
            err.to_string(),
            "Column 'age' is categorical, expected numeric"
        );
    }

    #[test]
    fn test_record_serialization() {
        let record = AnalysisError::ColumnNotFound("missing".into())
            .to_record(Some(MethodId::TTestInd));
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"kind\":\"configuration\""));
        assert!(json.contains("\"method_id\":\"t_test_ind\""));

        let record = ErrorRecord::message("boom");
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("method_id"));
    }
}
