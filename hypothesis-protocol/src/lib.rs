//! hypothesis-protocol: ordered statistical analysis protocols
//!
//! This library runs protocols (ordered lists of analysis steps) against a
//! tabular dataset, isolating per-step failures, and persists each run as an
//! immutable JSON record.

pub mod cli;
pub mod config;
pub mod pool;
pub mod protocol;
pub mod runner;
pub mod service;
pub mod store;

// Re-export core types for convenience
pub use hypothesis_protocol_core::{
    AnalysisError, AnalysisResult, ColumnRoles, Dataset, Engine, ErrorRecord, MethodId,
    MethodRegistry, Outcome, Reporter, StepSummary, TerminalReporter,
};

// Re-export main types from this crate
pub use cli::Cli;
pub use config::Config;
pub use pool::{PoolError, WorkerPool};
pub use protocol::{
    BatchEntry, BatchResult, Protocol, ProtocolRunRecord, RunStatus, Step, StepKind, StepOutput,
    StepState,
};
pub use runner::ProtocolRunner;
pub use service::{ProtocolService, ServiceError};
pub use store::{JsonRunStore, RunStore, StoreError};

/// One summary line per step, batch entries expanded.
pub fn summarize(record: &ProtocolRunRecord) -> Vec<StepSummary> {
    let mut lines = Vec::new();
    for status in &record.steps {
        match record.results.get(&status.id) {
            Some(StepOutput::Analysis(result)) => {
                lines.push(StepSummary::from_result(&status.id, result));
            }
            Some(StepOutput::Failed(error)) => {
                lines.push(StepSummary::failed(&status.id, error));
            }
            Some(StepOutput::Batch(batch)) => {
                for entry in &batch.entries {
                    let name = match &entry.slice {
                        Some(slice) => format!("{}[{}]/{}", status.id, slice, entry.target),
                        None => format!("{}/{}", status.id, entry.target),
                    };
                    match (&entry.result, &entry.error) {
                        (Some(result), _) => {
                            let mut line = StepSummary::from_result(name, result);
                            line.p_value = entry.adjusted_p_value.or(line.p_value);
                            if line.p_value.is_some() {
                                line.outcome = if entry.significant_adj {
                                    Outcome::Significant
                                } else {
                                    Outcome::NotSignificant
                                };
                            }
                            lines.push(line);
                        }
                        (None, Some(error)) => lines.push(StepSummary::failed(name, error)),
                        (None, None) => {}
                    }
                }
            }
            None => {}
        }
    }
    lines
}
