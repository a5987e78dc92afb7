//! Sequential protocol execution.
//!
//! Steps run one after another on the calling thread. A failing step is
//! recorded in-band and never stops the run; the run ends `partial` when any
//! step failed and `completed` otherwise.

use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use hypothesis_protocol_core::{
    correct, AnalysisError, AnalysisResult, ColumnRoles, ColumnType, Dataset, Engine,
    ErrorRecord, MethodId, SelectionRequest,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{
    BatchEntry, BatchResult, Protocol, ProtocolRunRecord, RunStatus, Step, StepKind, StepOutput,
    StepPlan, StepState, StepStatus,
};

/// Runs protocols against datasets with a shared [`Engine`].
#[derive(Debug, Clone)]
pub struct ProtocolRunner {
    engine: Engine,
}

impl ProtocolRunner {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Execute every step of `protocol` in order.
    ///
    /// Never fails: step errors become [`StepOutput::Failed`] entries.
    pub fn run(&self, dataset: &Dataset, protocol: &Protocol) -> ProtocolRunRecord {
        let run_id = Uuid::new_v4().to_string();
        let started_at = unix_seconds();
        info!(
            run_id = %run_id,
            protocol = %protocol.name,
            dataset = dataset.id(),
            steps = protocol.steps.len(),
            "starting protocol run"
        );

        let mut states: Vec<StepStatus> = protocol
            .steps
            .iter()
            .map(|s| StepStatus {
                id: s.id.clone(),
                kind: s.kind,
                state: StepState::Pending,
            })
            .collect();
        let mut results = BTreeMap::new();
        let mut log = Vec::with_capacity(protocol.steps.len() * 2 + 1);

        for (index, step) in protocol.steps.iter().enumerate() {
            advance(&mut states[index], StepState::Running);
            log.push(format!("step '{}' ({}) started", step.id, step.kind.as_str()));
            let started = Instant::now();

            let output = match self.run_step(dataset, step) {
                Ok(output) => output,
                Err(error) => StepOutput::Failed(error),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &output {
                StepOutput::Failed(error) => {
                    advance(&mut states[index], StepState::Failed);
                    warn!(step_id = %step.id, elapsed_ms, error = %error.error, "step failed");
                    log.push(format!("step '{}' failed: {}", step.id, error.error));
                }
                other => {
                    advance(&mut states[index], StepState::Completed);
                    info!(step_id = %step.id, elapsed_ms, "step completed");
                    log.push(format!("step '{}' completed: {}", step.id, describe(other)));
                }
            }
            if results.insert(step.id.clone(), output).is_some() {
                log.push(format!(
                    "step id '{}' is duplicated; only the last result is kept",
                    step.id
                ));
            }
        }

        let failed_steps = states
            .iter()
            .filter(|s| s.state == StepState::Failed)
            .count();
        let completed_steps = states.len() - failed_steps;
        let status = if failed_steps == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };
        log.push(format!(
            "protocol '{}' finished: {} completed, {} failed",
            protocol.name, completed_steps, failed_steps
        ));
        info!(run_id = %run_id, completed_steps, failed_steps, "protocol run finished");

        ProtocolRunRecord {
            protocol_name: protocol.name.clone(),
            dataset_id: dataset.id().to_string(),
            run_id,
            status,
            results,
            steps: states,
            log,
            completed_steps,
            failed_steps,
            started_at,
            finished_at: unix_seconds(),
        }
    }

    /// Execute a single step.
    ///
    /// # Errors
    ///
    /// The in-band record of the first configuration or computation error.
    pub fn run_step(&self, dataset: &Dataset, step: &Step) -> Result<StepOutput, ErrorRecord> {
        let plan = step.plan()?;
        debug!(step_id = %step.id, kind = step.kind.as_str(), method = ?plan.method, "running step");
        let result = match step.kind {
            StepKind::Compare | StepKind::Correlation | StepKind::HypothesisTest => {
                self.compare(dataset, &plan.roles, &plan)?
            }
            StepKind::Survival => {
                let method = plan.method.unwrap_or(if plan.roles.covariates.is_empty() {
                    MethodId::KaplanMeier
                } else {
                    MethodId::CoxRegression
                });
                self.execute(method, dataset, &plan.roles, &plan.options)?
            }
            StepKind::Regression => {
                let method = match plan.method {
                    Some(method) => method,
                    None => regression_method(dataset, &plan.roles)?,
                };
                self.execute(method, dataset, &plan.roles, &plan.options)?
            }
            StepKind::DescriptiveCompare => {
                let method = plan.method.unwrap_or(MethodId::Descriptive);
                self.execute(method, dataset, &plan.roles, &plan.options)?
            }
            StepKind::MixedEffects => {
                self.execute(MethodId::MixedEffects, dataset, &plan.roles, &plan.options)?
            }
            StepKind::ClusteredCorrelation => self.execute(
                MethodId::ClusteredCorrelation,
                dataset,
                &plan.roles,
                &plan.options,
            )?,
            StepKind::BatchCompareByFactor => {
                return self.batch(dataset, &plan).map(StepOutput::Batch);
            }
        };
        Ok(StepOutput::Analysis(Box::new(result)))
    }

    fn execute(
        &self,
        method: MethodId,
        dataset: &Dataset,
        roles: &ColumnRoles,
        options: &Map<String, Value>,
    ) -> Result<AnalysisResult, ErrorRecord> {
        self.engine.execute_record(method, dataset, roles, options)
    }

    /// The generic comparison path: explicit method, or automatic selection
    /// from the target and its counterpart column.
    fn compare(
        &self,
        dataset: &Dataset,
        roles: &ColumnRoles,
        plan: &StepPlan,
    ) -> Result<AnalysisResult, ErrorRecord> {
        if let Some(method) = plan.method {
            return self.execute(method, dataset, roles, &plan.options);
        }

        let target = roles
            .target
            .as_deref()
            .ok_or_else(|| AnalysisError::InvalidOption("step requires a 'target' column".into()))?;
        let other = roles
            .group
            .as_deref()
            .or(roles.second.as_deref())
            .ok_or_else(|| {
                AnalysisError::InvalidOption(
                    "step requires a 'group' or 'second' column to select a test".into(),
                )
            })?;
        let mut request = SelectionRequest::new(target, other);
        if plan.paired {
            request = request.paired(roles.subject.as_deref());
        }
        let selection = self.engine.select_method(dataset, &request)?;
        let mut result =
            self.execute(selection.method, dataset, &selection.roles, &plan.options)?;

        if result.assumptions.is_none() {
            result.assumptions = selection.assumptions;
        }
        let mut warnings = selection.warnings;
        warnings.append(&mut result.warnings);
        result.warnings = warnings;
        result.extra.insert("auto_selected".to_string(), Value::Bool(true));
        Ok(result)
    }

    /// Re-run the comparison path per slice and target, then correct the
    /// family of p-values.
    fn batch(&self, dataset: &Dataset, plan: &StepPlan) -> Result<BatchResult, ErrorRecord> {
        if plan.targets.is_empty() {
            return Err(AnalysisError::InvalidOption(
                "batch step requires 'target' or 'targets'".into(),
            )
            .into());
        }
        let slices: Vec<(Option<String>, Dataset)> = match plan.split_by.as_deref() {
            Some(column) => dataset
                .split_by(column)?
                .into_iter()
                .map(|(label, part)| (Some(label), part))
                .collect(),
            None => vec![(None, dataset.clone())],
        };

        let mut entries = Vec::with_capacity(slices.len() * plan.targets.len());
        for (slice, part) in &slices {
            for target in &plan.targets {
                let roles = ColumnRoles {
                    target: Some(target.clone()),
                    ..plan.roles.clone()
                };
                let (result, error) = match self.compare(part, &roles, plan) {
                    Ok(result) => (Some(result), None),
                    Err(error) => (None, Some(error)),
                };
                entries.push(BatchEntry {
                    slice: slice.clone(),
                    target: target.clone(),
                    result,
                    error,
                    adjusted_p_value: None,
                    significant_adj: false,
                });
            }
        }

        if entries.iter().all(|e| e.error.is_some()) {
            let total = entries.len();
            return Err(match entries.into_iter().find_map(|e| e.error) {
                Some(mut first) => {
                    first.error = format!("all {} batch analyses failed: {}", total, first.error);
                    first
                }
                None => AnalysisError::InsufficientData("batch step produced no slices".into()).into(),
            });
        }

        let defaults = self.engine.defaults();
        let requested = plan
            .batch_correction
            .as_deref()
            .unwrap_or(&defaults.batch_correction);
        let raw: Vec<Option<f64>> = entries
            .iter()
            .map(|e| e.result.as_ref().and_then(|r| r.p_value))
            .collect();
        let correction = correct(&raw, requested, defaults.alpha);
        for ((entry, adjusted), significant) in entries
            .iter_mut()
            .zip(&correction.adjusted)
            .zip(&correction.significant)
        {
            entry.adjusted_p_value = *adjusted;
            entry.significant_adj = *significant;
        }

        let failed = entries.iter().filter(|e| e.error.is_some()).count();
        let mut warnings = correction.warnings;
        if failed > 0 {
            warnings.push(format!("{} of {} batch analyses failed", failed, entries.len()));
        }
        Ok(BatchResult {
            split_by: plan.split_by.clone(),
            correction: correction.method,
            entries,
            warnings,
        })
    }
}

/// Logistic for a categorical or two-valued target, linear otherwise.
fn regression_method(dataset: &Dataset, roles: &ColumnRoles) -> Result<MethodId, AnalysisError> {
    let target = roles
        .target
        .as_deref()
        .ok_or_else(|| AnalysisError::InvalidOption("regression requires a 'target' column".into()))?;
    let binary = dataset.column_type(target)? == ColumnType::Categorical
        || dataset.distinct_labels(target)?.len() == 2;
    Ok(if binary {
        MethodId::LogisticRegression
    } else {
        MethodId::LinearRegression
    })
}

fn advance(status: &mut StepStatus, next: StepState) {
    debug_assert!(status.state.can_advance_to(next));
    status.state = next;
}

fn describe(output: &StepOutput) -> String {
    match output {
        StepOutput::Analysis(result) => match result.p_value {
            Some(p) => format!("{} p={:.4}", result.method_id, p),
            None => result.method_id.to_string(),
        },
        StepOutput::Batch(batch) => format!(
            "{} analyses, {} significant after {}",
            batch.entries.len(),
            batch.entries.iter().filter(|e| e.significant_adj).count(),
            batch.correction
        ),
        StepOutput::Failed(error) => error.error.clone(),
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypothesis_protocol_core::Column;
    use serde_json::json;

    fn dataset() -> Dataset {
        Dataset::new("trial")
            .with_column(
                "y",
                Column::numeric([1.0, 2.0, 3.0, 4.0, 5.0, 9.0, 10.0, 11.0, 12.0, 13.0]),
            )
            .unwrap()
            .with_column(
                "x",
                Column::numeric([2.0, 1.0, 4.0, 3.0, 6.0, 8.0, 11.0, 9.0, 13.0, 12.0]),
            )
            .unwrap()
            .with_column(
                "arm",
                Column::categorical(["a", "a", "a", "a", "a", "b", "b", "b", "b", "b"]),
            )
            .unwrap()
            .with_column(
                "site",
                Column::categorical(["n", "s", "n", "s", "n", "s", "n", "s", "n", "s"]),
            )
            .unwrap()
    }

    fn protocol(steps: Value) -> Protocol {
        serde_json::from_value(json!({"name": "p", "steps": steps})).unwrap()
    }

    #[test]
    fn test_run_completed() {
        let runner = ProtocolRunner::new(Engine::default());
        let record = runner.run(
            &dataset(),
            &protocol(json!([
                {"id": "cmp", "type": "compare", "target": "y", "group": "arm"},
                {"id": "cor", "type": "correlation", "target": "y", "second": "x"},
                {"id": "desc", "type": "descriptive_compare", "target": "y", "group": "arm"}
            ])),
        );
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.completed_steps, 3);
        assert_eq!(record.failed_steps, 0);
        assert_eq!(record.dataset_id, "trial");
        assert!(record.steps.iter().all(|s| s.state == StepState::Completed));

        let cmp = record.results["cmp"].analysis().unwrap();
        assert!(cmp.significant);
        assert_eq!(cmp.extra["auto_selected"], true);
        let cor = record.results["cor"].analysis().unwrap();
        assert!(matches!(cor.method_id, MethodId::Pearson | MethodId::Spearman));
        assert!(record.results["desc"].analysis().unwrap().p_value.is_none());
        assert_eq!(record.log.len(), 7);
        assert!(record.log[6].contains("3 completed, 0 failed"));
    }

    #[test]
    fn test_failed_step_is_isolated() {
        let runner = ProtocolRunner::new(Engine::default());
        let record = runner.run(
            &dataset(),
            &protocol(json!([
                {"id": "bad", "type": "compare", "target": "missing", "group": "arm"},
                {"id": "good", "type": "compare", "target": "y", "group": "arm"}
            ])),
        );
        assert_eq!(record.status, RunStatus::Partial);
        assert_eq!(record.failed_steps, 1);
        let error = record.results["bad"].error().unwrap();
        assert!(error.error.contains("missing"));
        assert!(record.results["good"].analysis().is_some());
        assert!(record.log.iter().any(|l| l.contains("'bad' failed")));
    }

    #[test]
    fn test_explicit_method_with_options() {
        let runner = ProtocolRunner::new(Engine::default());
        let step: Step = serde_json::from_value(json!({
            "id": "t",
            "type": "hypothesis_test",
            "target": "y",
            "group": "arm",
            "method": "mann_whitney",
            "alternative": "less"
        }))
        .unwrap();
        let output = runner.run_step(&dataset(), &step).unwrap();
        let result = output.analysis().unwrap();
        assert_eq!(result.method_id, MethodId::MannWhitney);
        assert!(!result.extra.contains_key("auto_selected"));
        assert!(result.p_value.unwrap() < 0.05);
    }

    #[test]
    fn test_unknown_option_fails_step() {
        let runner = ProtocolRunner::new(Engine::default());
        let step: Step = serde_json::from_value(json!({
            "id": "t",
            "type": "compare",
            "target": "y",
            "group": "arm",
            "colour": "blue"
        }))
        .unwrap();
        let error = runner.run_step(&dataset(), &step).unwrap_err();
        assert!(error.error.contains("colour"));
    }

    #[test]
    fn test_batch_split_and_targets() {
        let runner = ProtocolRunner::new(Engine::default());
        let step: Step = serde_json::from_value(json!({
            "id": "batch",
            "type": "batch_compare_by_factor",
            "group": "arm",
            "targets": ["y", "x"],
            "split_by": "site"
        }))
        .unwrap();
        let output = runner.run_step(&dataset(), &step).unwrap();
        let batch = output.batch().unwrap();
        assert_eq!(batch.entries.len(), 4);
        assert_eq!(batch.entries[0].slice.as_deref(), Some("n"));
        assert_eq!(batch.entries[0].target, "y");
        for entry in &batch.entries {
            if let (Some(result), Some(adjusted)) = (&entry.result, entry.adjusted_p_value) {
                assert!(adjusted >= result.p_value.unwrap());
            }
        }
    }

    #[test]
    fn test_batch_with_every_analysis_failing_fails_step() {
        let runner = ProtocolRunner::new(Engine::default());
        let record = runner.run(
            &dataset(),
            &protocol(json!([
                {"id": "b", "type": "batch_compare_by_factor", "target": "missing_col", "group": "arm"},
                {"id": "cmp", "type": "compare", "target": "y", "group": "arm"}
            ])),
        );
        assert_eq!(record.status, RunStatus::Partial);
        assert_eq!(record.failed_steps, 1);
        assert_eq!(record.completed_steps, 1);
        let error = record.results["b"].error().unwrap();
        assert!(error.error.contains("all 1 batch analyses failed"));
        assert!(error.error.contains("missing_col"));
        assert!(record.log.iter().any(|l| l.contains("'b' failed")));
    }

    #[test]
    fn test_batch_with_some_failures_completes() {
        let runner = ProtocolRunner::new(Engine::default());
        let step: Step = serde_json::from_value(json!({
            "id": "batch",
            "type": "batch_compare_by_factor",
            "group": "arm",
            "targets": ["y", "missing_col"]
        }))
        .unwrap();
        let output = runner.run_step(&dataset(), &step).unwrap();
        let batch = output.batch().unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert!(batch.entries[0].result.is_some());
        assert!(batch.entries[1].error.is_some());
        assert!(batch.warnings.iter().any(|w| w.contains("1 of 2 batch analyses failed")));
    }

    #[test]
    fn test_regression_method_choice() {
        let ds = dataset();
        let linear = ColumnRoles {
            target: Some("y".into()),
            ..ColumnRoles::default()
        };
        assert_eq!(regression_method(&ds, &linear).unwrap(), MethodId::LinearRegression);
        let logistic = ColumnRoles {
            target: Some("arm".into()),
            ..ColumnRoles::default()
        };
        assert_eq!(
            regression_method(&ds, &logistic).unwrap(),
            MethodId::LogisticRegression
        );
    }
}
