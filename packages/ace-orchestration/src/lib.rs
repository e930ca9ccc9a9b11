/*
 * ACE Orchestration - transcript refinement over HOLOFS
 *
 * Drives call transcripts through a fixed, ordered pipeline of refinement
 * stages, committing each stage's output as a new version in the artifact
 * store.
 *
 * Architecture:
 * - Processing queue (priority bands, backoff, dead letters)
 * - Session state machine (one live session per artifact)
 * - Recursive refinement loop (priming → comprehension → clarity →
 *   elicitation, with bounded recursion)
 * - Pipeline stages (pluggable)
 * - Checkpoint/resume after retryable failures
 * - Health read model (dashboard snapshot, optional Prometheus gauges)
 */

// Public modules
pub mod checkpoint;
pub mod clarifier;
pub mod config;
pub mod error;
pub mod health;
pub mod history;
pub mod modules;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod refinement;
pub mod session;
pub mod stages;
pub mod transcript;
pub mod worker;

// Re-exports
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use clarifier::{ClarificationRequest, Clarifier, NoClarifier, StoreClarifier};
pub use config::{AceConfig, ConfigError, ModulesConfig, QueueSettings, RefinementConfig, ScoreWeights};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use health::{DashboardSnapshot, HealthAggregator, HealthReport, SessionView};
pub use history::{SessionHistory, SessionRecord};
pub use modules::{ModuleInfo, ModuleRegistry};
pub use orchestrator::{AceOrchestrator, RunOutcome};
pub use pipeline::{NoopObserver, ProgressObserver, StageContext, StageHandler, StageOutput};
pub use queue::{DeadLetter, ProcessingQueue, QueueEntry, QueueStats, RequeueOutcome};
pub use refinement::{clarity_score, weighted_score, RefinementEngine, StageRun};
pub use session::{
    Session, SessionStatus, StageId, StageOutcome, StageReport, SubMeasureScores,
};
pub use stages::{
    default_handlers, FormattingStage, IntegrationStage, RepairStage, SummaryStage,
    ValidationStage,
};
pub use transcript::{Marker, MarkerKind, Transcript};
pub use worker::{drain, WorkerPool, WorkerStats};

#[cfg(feature = "metrics")]
pub use health::HealthGauges;
