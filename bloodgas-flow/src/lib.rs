//! Orchestration core for blood gas report analysis.
//!
//! An uploaded report photo or PDF goes through local text extraction, a
//! quality gate that can escalate to an AI vision provider, clinical
//! interpretation with embedded issue parsing, and a concurrent fan-out of
//! per-issue action plans. A [`WorkflowMachine`] tracks the session and
//! [`WorkflowPersistence`] keeps recoverable snapshots of unfinished work.

pub mod config;
pub mod error;
pub mod extraction;
pub mod fanout;
pub mod issues;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod providers;
pub mod recovery;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod workflow;

// Re-export commonly used types
pub use config::{PersistenceConfig, PipelineConfig};
pub use error::{ErrorCode, FlowError, PipelineFailure, Result};
pub use extraction::{LocalExtractor, QualityValidator, TextExtractor};
pub use fanout::ActionPlanFanOut;
pub use issues::{ParsedIssues, parse_issues};
pub use model::{
    ActionPlanOutcome, ActionPlanResult, AnalysisResult, Document, DocumentKind, ExtractionMethod,
    FileDescriptor, InterpretationResult, Issue, PlanStatus,
};
pub use pipeline::{AnalysisPipeline, AnalysisRequest};
pub use progress::{NoopProgressSink, PipelinePhase, ProgressSink, TracingProgressSink};
pub use recovery::{AutoSaver, WorkflowPersistence};
pub use storage::{
    FileSnapshotStorage, InMemorySnapshotStorage, PersistedSnapshot, PostgresSnapshotStorage,
    SnapshotStorage,
};
pub use workflow::{
    CanonicalProgress, ProcessingStatus, WorkflowMachine, WorkflowState, WorkflowStep,
};
