//! Entry point tying registry, selector and executors together.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::dataset::Dataset;
use crate::error::{AnalysisError, ErrorRecord};
use crate::methods::{ExecutionContext, Method};
use crate::options::{AnalysisDefaults, MethodOptions};
use crate::registry::{ColumnRoles, MethodId, MethodRegistry};
use crate::result::AnalysisResult;
use crate::selector::{self, Selection, SelectionRequest};

/// Shared, read-only analysis engine.
///
/// Cloning is cheap: the registry sits behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<MethodRegistry>,
    defaults: AnalysisDefaults,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Arc::new(MethodRegistry::standard()), AnalysisDefaults::default())
    }
}

impl Engine {
    pub fn new(registry: Arc<MethodRegistry>, defaults: AnalysisDefaults) -> Self {
        Self { registry, defaults }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    pub fn defaults(&self) -> &AnalysisDefaults {
        &self.defaults
    }

    /// Pick a method for two columns.
    pub fn select_method(
        &self,
        dataset: &Dataset,
        request: &SelectionRequest<'_>,
    ) -> Result<Selection, AnalysisError> {
        let selection = selector::select_method(dataset, request)?;
        self.registry.require_enabled(selection.method)?;
        Ok(selection)
    }

    /// Execute `method` with raw, not yet validated options.
    ///
    /// # Errors
    ///
    /// Configuration errors for a disabled method, bad roles or bad options;
    /// computation errors from the executor.
    pub fn execute(
        &self,
        method: MethodId,
        dataset: &Dataset,
        roles: &ColumnRoles,
        options: &Map<String, Value>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let options = MethodOptions::parse(method, options)?;
        self.execute_with(method, dataset, roles, &options)
    }

    /// Execute `method` with options already decoded.
    pub fn execute_with(
        &self,
        method: MethodId,
        dataset: &Dataset,
        roles: &ColumnRoles,
        options: &MethodOptions,
    ) -> Result<AnalysisResult, AnalysisError> {
        self.registry.validate_roles(method, dataset, roles)?;
        let ctx = ExecutionContext {
            dataset,
            roles,
            defaults: &self.defaults,
        };
        let started = Instant::now();
        let result = Method::for_id(method).execute(&ctx, options);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(r) => debug!(method = %method, elapsed_ms, p_value = ?r.p_value, "executed"),
            Err(e) => warn!(method = %method, elapsed_ms, error = %e, "execution failed"),
        }
        result.map(AnalysisResult::sanitized)
    }

    /// [`Engine::execute`] with the error turned into its in-band record.
    pub fn execute_record(
        &self,
        method: MethodId,
        dataset: &Dataset,
        roles: &ColumnRoles,
        options: &Map<String, Value>,
    ) -> Result<AnalysisResult, ErrorRecord> {
        self.execute(method, dataset, roles, options)
            .map_err(|e| e.to_record(Some(method)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Column;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn two_groups() -> Dataset {
        Dataset::new("two")
            .with_column("y", Column::numeric([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]))
            .unwrap()
            .with_column("g", Column::categorical(["a", "a", "a", "a", "b", "b", "b", "b"]))
            .unwrap()
    }

    fn options(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_execute_sanitizes() {
        let engine = Engine::default();
        let result = engine
            .execute(
                MethodId::TTestInd,
                &two_groups(),
                &ColumnRoles::grouped("y", "g"),
                &Map::new(),
            )
            .unwrap();
        assert_eq!(result.method_id, MethodId::TTestInd);
        let p = result.p_value.unwrap();
        assert!((0.0..=1.0).contains(&p));
        assert!(result.significant);
    }

    #[test]
    fn test_unknown_option_is_configuration_error() {
        let engine = Engine::default();
        let record = engine
            .execute_record(
                MethodId::TTestInd,
                &two_groups(),
                &ColumnRoles::grouped("y", "g"),
                &options(json!({"bogus": 1})),
            )
            .unwrap_err();
        assert_eq!(record.kind, ErrorKind::Configuration);
        assert_eq!(record.method_id, Some(MethodId::TTestInd));
    }

    #[test]
    fn test_missing_column() {
        let engine = Engine::default();
        let err = engine
            .execute(
                MethodId::MannWhitney,
                &two_groups(),
                &ColumnRoles::grouped("nope", "g"),
                &Map::new(),
            )
            .unwrap_err();
        assert_eq!(err, AnalysisError::ColumnNotFound("nope".into()));
    }

    #[test]
    fn test_disabled_method() {
        let engine = Engine::new(
            Arc::new(MethodRegistry::with_disabled(&[MethodId::TTestInd])),
            AnalysisDefaults::default(),
        );
        let err = engine
            .execute(
                MethodId::TTestInd,
                &two_groups(),
                &ColumnRoles::grouped("y", "g"),
                &Map::new(),
            )
            .unwrap_err();
        assert_eq!(err, AnalysisError::MethodDisabled(MethodId::TTestInd));
    }

    #[test]
    fn test_repeated_execution_is_identical() {
        let engine = Engine::default();
        let opts = options(json!({"use_bootstrap": true, "bootstrap_resamples": 500}));
        let run = || {
            engine
                .execute(
                    MethodId::MannWhitney,
                    &two_groups(),
                    &ColumnRoles::grouped("y", "g"),
                    &opts,
                )
                .unwrap()
        };
        let first = serde_json::to_string(&run()).unwrap();
        let second = serde_json::to_string(&run()).unwrap();
        assert_eq!(first, second);
    }
}
