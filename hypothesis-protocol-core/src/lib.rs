//! Core analysis engine for hypothesis-protocol.
//!
//! This crate picks a statistical test from column types and assumption
//! checks, executes any registered method against a [`Dataset`], and
//! corrects p-values across families of tests. It has no I/O of its own;
//! the `hypothesis-protocol` crate drives it from protocol files.

pub mod assumptions;
pub mod correction;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod methods;
pub mod options;
pub mod registry;
pub mod report;
pub mod result;
pub mod selector;
pub mod stats;

// Re-export main types for convenience
pub use assumptions::{AssumptionCheck, AssumptionReport, HomogeneityTest};
pub use correction::{adjust, correct, pairwise_post_hoc, Correction, CorrectionMethod};
pub use dataset::{Column, ColumnType, Dataset, DatasetError};
pub use engine::Engine;
pub use error::{AnalysisError, ErrorKind, ErrorRecord};
pub use options::{AnalysisDefaults, MethodOptions};
pub use registry::{ColumnRoles, MethodDescriptor, MethodFamily, MethodId, MethodRegistry};
pub use report::{Outcome, ReportError, Reporter, StepSummary, TerminalReporter};
pub use result::{AnalysisResult, GroupStats, PostHocComparison};
pub use selector::{select_method, Selection, SelectionRequest};
pub use stats::Alternative;
