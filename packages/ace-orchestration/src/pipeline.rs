use crate::error::{OrchestratorError, Result};
use crate::session::StageId;
use async_trait::async_trait;
use holofs_store::ArtifactId;
use uuid::Uuid;

/// Stage context passed to handlers
#[derive(Debug, Clone)]
pub struct StageContext {
    pub session_id: Uuid,
    pub artifact_id: ArtifactId,
    pub stage: StageId,
    /// Store version the stage input was read from
    pub input_version: u64,
    /// 1-based attempt counter across queue retries
    pub attempt: u32,
}

/// Stage output
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub body: String,
    /// Share of the transform's target achieved, 0..=100
    pub coverage: u8,
    pub notes: Vec<String>,
}

impl StageOutput {
    /// Output whose coverage is its marker coverage
    pub fn from_body(body: String) -> Self {
        let coverage = crate::transcript::marker_coverage(&body);
        Self {
            body,
            coverage,
            notes: Vec::new(),
        }
    }
}

/// Stage handler trait (pluggable stages)
///
/// Handlers are pure text transforms over the transcript body. They must be
/// idempotent: the refinement loop re-runs `transform` on its own output after
/// every elicitation round.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage identifier
    fn stage_id(&self) -> StageId;

    /// Well-formedness check run during priming
    fn check_input(&self, body: &str) -> Result<()> {
        if body.trim().is_empty() {
            return Err(OrchestratorError::MalformedInput(format!(
                "{}: empty transcript",
                self.stage_id()
            )));
        }
        Ok(())
    }

    /// Apply the stage's core transform
    ///
    /// # Errors
    ///
    /// `TransformError` is retried through the queue; `MalformedInput` fails
    /// the session.
    async fn transform(&self, body: &str, ctx: &StageContext) -> Result<StageOutput>;
}

/// Receives per-step progress from the refinement loop
pub trait ProgressObserver: Send + Sync {
    /// Sub-measure step reached; `score` is 20 per completed step
    fn on_progress(&self, stage: StageId, score: u8);

    /// Elicitation jump back to comprehension
    fn on_recursion(&self, stage: StageId, depth: u32, restart_score: u8);
}

/// Discards progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _stage: StageId, _score: u8) {}

    fn on_recursion(&self, _stage: StageId, _depth: u32, _restart_score: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use holofs_store::VirtualPath;

    struct UpperStage;

    #[async_trait]
    impl StageHandler for UpperStage {
        fn stage_id(&self) -> StageId {
            StageId::Formatting
        }

        async fn transform(&self, body: &str, _ctx: &StageContext) -> Result<StageOutput> {
            Ok(StageOutput::from_body(body.to_uppercase()))
        }
    }

    fn ctx() -> StageContext {
        StageContext {
            session_id: Uuid::new_v4(),
            artifact_id: ArtifactId::for_path(&VirtualPath::parse("/t/a.txt").unwrap()),
            stage: StageId::Formatting,
            input_version: 1,
            attempt: 1,
        }
    }

    #[test]
    fn test_default_check_input_rejects_blank() {
        assert!(matches!(
            UpperStage.check_input(" \n\t"),
            Err(OrchestratorError::MalformedInput(_))
        ));
        assert!(UpperStage.check_input("Alice: hi").is_ok());
    }

    #[tokio::test]
    async fn test_handler_transform() {
        let out = UpperStage.transform("alice: hi [?]", &ctx()).await.unwrap();
        assert_eq!(out.body, "ALICE: HI [?]");
        assert_eq!(out.coverage, 67);
    }
}
