use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use holofs_store::ArtifactId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Pipeline stage, in canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Formatting,
    ContextualRepair,
    Summary,
    PipelineIntegration,
    Validation,
}

impl StageId {
    pub const ALL: [StageId; 5] = [
        StageId::Formatting,
        StageId::ContextualRepair,
        StageId::Summary,
        StageId::PipelineIntegration,
        StageId::Validation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Formatting => "formatting",
            StageId::ContextualRepair => "contextual_repair",
            StageId::Summary => "summary",
            StageId::PipelineIntegration => "pipeline_integration",
            StageId::Validation => "validation",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "formatting" => Ok(StageId::Formatting),
            "contextual_repair" => Ok(StageId::ContextualRepair),
            "summary" => Ok(StageId::Summary),
            "pipeline_integration" => Ok(StageId::PipelineIntegration),
            "validation" => Ok(StageId::Validation),
            _ => Err(OrchestratorError::parse(format!("Invalid stage ID: {}", s))),
        }
    }

    /// Display name of the module implementing this stage
    pub fn module_name(&self) -> &'static str {
        match self {
            StageId::Formatting => "Natural Formatting",
            StageId::ContextualRepair => "Contextual Repair",
            StageId::Summary => "Summary Generation",
            StageId::PipelineIntegration => "Pipeline Integration",
            StageId::Validation => "Data Validation",
        }
    }

    /// Sort and dedupe into canonical order; empty means the full pipeline
    pub fn canonical(stages: &[StageId]) -> Vec<StageId> {
        if stages.is_empty() {
            return StageId::ALL.to_vec();
        }
        StageId::ALL
            .iter()
            .copied()
            .filter(|stage| stages.contains(stage))
            .collect()
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// Waiting in the queue for a retry after a transform error
    Paused,
    Completed,
    CompletedWithWarnings,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::CompletedWithWarnings => "completed_with_warnings",
            SessionStatus::Failed => "failed",
            SessionStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::CompletedWithWarnings
                | SessionStatus::Failed
                | SessionStatus::Aborted
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one stage invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Ok,
    /// Committed with clarity below threshold after the recursion budget
    Degraded,
    MalformedInput,
    TransformError,
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Ok => "ok",
            StageOutcome::Degraded => "degraded",
            StageOutcome::MalformedInput => "malformed_input",
            StageOutcome::TransformError => "transform_error",
        }
    }

    /// Ok and Degraded commit output
    pub fn commits(&self) -> bool {
        matches!(self, StageOutcome::Ok | StageOutcome::Degraded)
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The five refinement sub-measures, each 0..=100
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubMeasureScores {
    pub priming: u8,
    pub comprehension: u8,
    pub context_clarity: u8,
    pub elicitation_depth: u8,
    pub recursion: u8,
}

/// Everything recorded about one stage attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: StageId,
    pub outcome: StageOutcome,
    pub scores: SubMeasureScores,
    pub final_score: u8,
    pub recursion_count: u32,
    pub markers_initial: usize,
    pub markers_remaining: usize,
    pub elicitation_timeouts: u32,
    /// Committed version, for Ok and Degraded
    pub version: Option<u64>,
    pub detail: Option<String>,
    pub duration_ms: u64,
}

impl StageReport {
    /// Blank report for an attempt that has not scored anything yet
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            outcome: StageOutcome::Ok,
            scores: SubMeasureScores::default(),
            final_score: 0,
            recursion_count: 0,
            markers_initial: 0,
            markers_remaining: 0,
            elicitation_timeouts: 0,
            version: None,
            detail: None,
            duration_ms: 0,
        }
    }

    /// Priming rejected the input
    pub fn malformed(stage: StageId, detail: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::MalformedInput,
            detail: Some(detail.into()),
            ..Self::new(stage)
        }
    }
}

/// Runtime record of one artifact's run through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub artifact_id: ArtifactId,
    pub entry_id: Uuid,
    pub plan: Vec<StageId>,
    pub current_stage: Option<StageId>,
    pub stage_scores: BTreeMap<StageId, u8>,
    pub recursion_depth: u32,
    pub status: SessionStatus,
    pub reports: Vec<StageReport>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// New running session for a claimed queue entry
    pub fn start(entry_id: Uuid, artifact_id: ArtifactId, plan: Vec<StageId>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            artifact_id,
            entry_id,
            current_stage: plan.first().copied(),
            stage_scores: plan.iter().map(|stage| (*stage, 0)).collect(),
            plan,
            recursion_depth: 0,
            status: SessionStatus::Running,
            reports: Vec::new(),
            retry_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stages committed so far, in order
    pub fn completed_stages(&self) -> Vec<StageId> {
        self.reports
            .iter()
            .filter(|report| report.outcome.commits())
            .map(|report| report.stage)
            .collect()
    }

    pub fn has_degraded_stage(&self) -> bool {
        self.reports
            .iter()
            .any(|report| report.outcome == StageOutcome::Degraded)
    }

    /// Versions this session committed
    pub fn committed_versions(&self) -> Vec<u64> {
        self.reports.iter().filter_map(|report| report.version).collect()
    }

    fn invalid(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.status.as_str().to_string(),
            to: to.to_string(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Enter `stage`; never moves backwards along the plan
    pub fn begin_stage(&mut self, stage: StageId) -> Result<()> {
        if self.status != SessionStatus::Running {
            return Err(self.invalid("begin_stage"));
        }
        if !self.plan.contains(&stage) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: format!("{:?}", self.current_stage),
                to: format!("{} (not in plan)", stage),
            });
        }
        if let Some(current) = self.current_stage {
            if stage < current {
                return Err(OrchestratorError::InvalidStateTransition {
                    from: current.to_string(),
                    to: stage.to_string(),
                });
            }
        }
        self.current_stage = Some(stage);
        self.stage_scores.insert(stage, 0);
        self.touch();
        Ok(())
    }

    /// Raise the progress score of the current attempt
    pub fn raise_score(&mut self, stage: StageId, value: u8) {
        let score = self.stage_scores.entry(stage).or_insert(0);
        *score = (*score).max(value.min(100));
        self.touch();
    }

    /// Elicitation jump back to comprehension: new attempt score for `stage`
    pub fn recursion_jump(&mut self, stage: StageId, depth: u32, restart_score: u8) {
        self.stage_scores.insert(stage, restart_score.min(100));
        self.recursion_depth = self.recursion_depth.max(depth);
        self.touch();
    }

    /// Record a committed stage and advance along the plan
    pub fn complete_stage(&mut self, report: StageReport) -> Result<()> {
        if self.status != SessionStatus::Running {
            return Err(self.invalid("complete_stage"));
        }
        let stage = report.stage;
        self.stage_scores.insert(stage, 100);
        self.reports.push(report);
        if let Some(next) = self.plan.iter().copied().find(|s| *s > stage) {
            self.current_stage = Some(next);
        }
        self.touch();
        Ok(())
    }

    /// Record a stage attempt that did not commit
    pub fn record_attempt(&mut self, report: StageReport) {
        self.reports.push(report);
        self.touch();
    }

    /// Transition: RUNNING → PAUSED (waiting for retry)
    pub fn pause(&mut self, error: String) -> Result<()> {
        match self.status {
            SessionStatus::Running => {
                self.status = SessionStatus::Paused;
                self.retry_count += 1;
                self.error = Some(error);
                self.touch();
                Ok(())
            }
            _ => Err(self.invalid("paused")),
        }
    }

    /// Transition: PAUSED → RUNNING
    pub fn resume(&mut self) -> Result<()> {
        match self.status {
            SessionStatus::Paused => {
                self.status = SessionStatus::Running;
                self.touch();
                Ok(())
            }
            _ => Err(self.invalid("running")),
        }
    }

    /// Transition: RUNNING → COMPLETED | COMPLETED_WITH_WARNINGS
    pub fn finish(&mut self) -> Result<SessionStatus> {
        match self.status {
            SessionStatus::Running => {
                self.status = if self.has_degraded_stage() {
                    SessionStatus::CompletedWithWarnings
                } else {
                    SessionStatus::Completed
                };
                self.touch();
                Ok(self.status)
            }
            _ => Err(self.invalid("completed")),
        }
    }

    /// Transition: RUNNING | PAUSED → FAILED
    pub fn fail(&mut self, error: String) -> Result<()> {
        match self.status {
            SessionStatus::Running | SessionStatus::Paused => {
                self.status = SessionStatus::Failed;
                self.error = Some(error);
                self.touch();
                Ok(())
            }
            _ => Err(self.invalid("failed")),
        }
    }

    /// Transition: RUNNING | PAUSED → ABORTED
    pub fn abort(&mut self, reason: String) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("aborted"));
        }
        self.status = SessionStatus::Aborted;
        self.error = Some(reason);
        self.touch();
        Ok(())
    }
}
