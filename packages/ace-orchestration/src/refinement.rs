//! Refinement loop shared by every stage
//!
//! ```text
//! priming ─▶ comprehension ─▶ context-clarity ─┬─▶ recursion ─▶ outcome
//!               ▲                               │
//!               └──── elicitation-depth ◀───────┘  (clarity < threshold
//!                                                   and rounds < max)
//! ```
//!
//! The cycle is a bounded loop with an explicit round counter. Cancellation is
//! checked between steps and raced against the clarifier call, never during a
//! transform.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clarifier::{ClarificationRequest, Clarifier, NoClarifier};
use crate::config::{RefinementConfig, ScoreWeights};
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{ProgressObserver, StageContext, StageHandler, StageOutput};
use crate::session::{StageOutcome, StageReport, SubMeasureScores};
use crate::transcript::{apply_answers, count_markers, find_markers};

/// Session score after each completed sub-measure step
pub const PRIMED: u8 = 20;
pub const COMPREHENDED: u8 = 40;
pub const CLARITY_CHECKED: u8 = 60;
pub const ELICITED: u8 = 80;

/// Result of one stage attempt; `body` is set when the outcome commits
#[derive(Debug, Clone)]
pub struct StageRun {
    pub body: Option<String>,
    pub report: StageReport,
}

/// `100 - min(100, 10 * markers)`
pub fn clarity_score(markers: usize) -> u8 {
    100 - (markers.saturating_mul(10)).min(100) as u8
}

/// Rounded weighted average of the five sub-measures
pub fn weighted_score(scores: &SubMeasureScores, weights: &ScoreWeights) -> u8 {
    let total = weights.total();
    if total == 0 {
        return 0;
    }
    let sum = scores.priming as u32 * weights.priming
        + scores.comprehension as u32 * weights.comprehension
        + scores.context_clarity as u32 * weights.context_clarity
        + scores.elicitation_depth as u32 * weights.elicitation_depth
        + scores.recursion as u32 * weights.recursion;
    ((sum as f64) / (total as f64)).round() as u8
}

fn percent(part: usize, whole: usize) -> u8 {
    if whole == 0 {
        return 0;
    }
    ((part.min(whole) as f64 * 100.0) / whole as f64).round() as u8
}

pub struct RefinementEngine {
    config: RefinementConfig,
    clarifier: Arc<dyn Clarifier>,
}

impl RefinementEngine {
    pub fn new(config: RefinementConfig, clarifier: Arc<dyn Clarifier>) -> Self {
        Self { config, clarifier }
    }

    pub fn without_clarifier(config: RefinementConfig) -> Self {
        Self::new(config, Arc::new(NoClarifier))
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    pub fn clarifier(&self) -> &Arc<dyn Clarifier> {
        &self.clarifier
    }

    /// Run one stage attempt over `input`
    ///
    /// Outcomes (Ok, Degraded, MalformedInput, TransformError) are reported in
    /// the returned `StageRun`.
    ///
    /// # Errors
    ///
    /// `Cancelled` when the token fires between steps; store or other
    /// infrastructure errors raised by a handler.
    pub async fn run(
        &self,
        handler: &dyn StageHandler,
        input: &str,
        ctx: &StageContext,
        cancel: &CancellationToken,
        observer: &dyn ProgressObserver,
    ) -> Result<StageRun> {
        let started = Instant::now();
        let stage = ctx.stage;
        let threshold = self.config.clarity_threshold;
        let max_rounds = self.config.max_recursion;
        let check_cancel = || -> Result<()> {
            if cancel.is_cancelled() {
                Err(OrchestratorError::Cancelled(ctx.session_id))
            } else {
                Ok(())
            }
        };

        let mut report = StageReport::new(stage);

        // 1. Priming
        check_cancel()?;
        if let Err(e) = handler.check_input(input) {
            return match e {
                OrchestratorError::MalformedInput(detail) => {
                    warn!(session_id = %ctx.session_id, stage = %stage, %detail, "Priming rejected input");
                    report.outcome = StageOutcome::MalformedInput;
                    report.detail = Some(detail);
                    report.duration_ms = started.elapsed().as_millis() as u64;
                    Ok(StageRun { body: None, report })
                }
                other => Err(other),
            };
        }
        report.scores.priming = 100;
        observer.on_progress(stage, PRIMED);

        let mut working = input.to_string();
        let mut first_check: Option<usize> = None;
        let mut resolved_by_elicitation = 0usize;
        let mut notes: Vec<String> = Vec::new();

        let (output, markers) = loop {
            // 2. Comprehension
            check_cancel()?;
            let output = match handler.transform(&working, ctx).await {
                Ok(output) => output,
                Err(OrchestratorError::TransformError { message, .. }) => {
                    warn!(session_id = %ctx.session_id, stage = %stage, %message, "Transform failed");
                    report.outcome = StageOutcome::TransformError;
                    report.detail = Some(message);
                    report.duration_ms = started.elapsed().as_millis() as u64;
                    return Ok(StageRun { body: None, report });
                }
                Err(OrchestratorError::MalformedInput(detail)) => {
                    report.outcome = StageOutcome::MalformedInput;
                    report.detail = Some(detail);
                    report.duration_ms = started.elapsed().as_millis() as u64;
                    return Ok(StageRun { body: None, report });
                }
                Err(other) => return Err(other),
            };
            if output.body.trim().is_empty() {
                report.outcome = StageOutcome::MalformedInput;
                report.detail = Some(format!("{} produced an empty transcript", stage));
                report.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(StageRun { body: None, report });
            }
            observer.on_progress(stage, COMPREHENDED);

            // 3. Context clarity
            check_cancel()?;
            let markers = count_markers(&output.body);
            first_check.get_or_insert(markers);
            let clarity = clarity_score(markers);
            observer.on_progress(stage, CLARITY_CHECKED);
            debug!(
                session_id = %ctx.session_id,
                stage = %stage,
                round = report.recursion_count,
                markers,
                clarity,
                "Clarity checked"
            );

            // 4. Elicitation depth
            if clarity >= threshold || report.recursion_count >= max_rounds {
                break (output, markers);
            }
            let request = ClarificationRequest {
                session_id: ctx.session_id,
                artifact_id: ctx.artifact_id.clone(),
                stage,
                round: report.recursion_count + 1,
                markers: find_markers(&output.body),
            };
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::Cancelled(ctx.session_id));
                }
                answered = tokio::time::timeout(
                    self.config.elicitation_timeout(),
                    self.clarifier.request_context(&request),
                ) => answered,
            };
            let answer = match response {
                Ok(answer) => answer?,
                Err(_) => {
                    let timeout = OrchestratorError::ElicitationTimeout {
                        stage: stage.to_string(),
                        timeout_ms: self.config.elicitation_timeout_ms,
                    };
                    warn!(session_id = %ctx.session_id, stage = %stage, error = %timeout, "Elicitation abandoned");
                    report.elicitation_timeouts += 1;
                    notes.push(timeout.to_string());
                    break (output, markers);
                }
            };

            let answers: Vec<String> = answer.lines().map(str::to_string).collect();
            let (next, resolved) = apply_answers(&output.body, &answers);
            resolved_by_elicitation += resolved;
            report.recursion_count += 1;
            observer.on_progress(stage, ELICITED);
            observer.on_recursion(stage, report.recursion_count, PRIMED);
            debug!(
                session_id = %ctx.session_id,
                stage = %stage,
                round = report.recursion_count,
                resolved,
                "Elicitation round applied"
            );
            working = next;
        };

        // 5. Recursion
        let StageOutput {
            body,
            coverage,
            notes: handler_notes,
        } = output;
        let clarity = clarity_score(markers);
        let met = clarity >= threshold;
        let initial = first_check.unwrap_or(markers);

        report.markers_initial = initial;
        report.markers_remaining = markers;
        report.scores.comprehension = coverage.min(100);
        report.scores.context_clarity = clarity;
        report.scores.elicitation_depth = if report.recursion_count == 0 && met {
            100
        } else {
            percent(resolved_by_elicitation, initial)
        };
        report.scores.recursion = if met {
            100
        } else if max_rounds == 0 {
            0
        } else {
            percent(max_rounds.saturating_sub(report.recursion_count) as usize, max_rounds as usize)
        };
        report.final_score = weighted_score(&report.scores, &self.config.weights);
        report.outcome = if met {
            StageOutcome::Ok
        } else {
            StageOutcome::Degraded
        };
        observer.on_progress(stage, ELICITED);

        notes.extend(handler_notes);
        if !notes.is_empty() {
            report.detail = Some(notes.join("; "));
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            session_id = %ctx.session_id,
            stage = %stage,
            outcome = %report.outcome,
            final_score = report.final_score,
            rounds = report.recursion_count,
            markers_remaining = markers,
            "Stage refined"
        );
        Ok(StageRun {
            body: Some(body),
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StageId;
    use crate::pipeline::NoopObserver;
    use async_trait::async_trait;
    use holofs_store::{ArtifactId, VirtualPath};
    use parking_lot::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    struct Identity;

    #[async_trait]
    impl StageHandler for Identity {
        fn stage_id(&self) -> StageId {
            StageId::Formatting
        }

        async fn transform(&self, body: &str, _ctx: &StageContext) -> Result<StageOutput> {
            Ok(StageOutput::from_body(body.to_string()))
        }
    }

    struct Failing;

    #[async_trait]
    impl StageHandler for Failing {
        fn stage_id(&self) -> StageId {
            StageId::Formatting
        }

        async fn transform(&self, _body: &str, _ctx: &StageContext) -> Result<StageOutput> {
            Err(OrchestratorError::transform(StageId::Formatting, "backend offline"))
        }
    }

    /// Resolves only the first marker each round
    struct OneAtATime;

    #[async_trait]
    impl Clarifier for OneAtATime {
        async fn request_context(&self, _request: &ClarificationRequest) -> Result<String> {
            Ok("resolved".to_string())
        }
    }

    struct Slow;

    #[async_trait]
    impl Clarifier for Slow {
        async fn request_context(&self, _request: &ClarificationRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(String::new())
        }
    }

    #[derive(Default)]
    struct Recorder {
        scores: Mutex<Vec<u8>>,
        jumps: Mutex<Vec<u32>>,
    }

    impl ProgressObserver for Recorder {
        fn on_progress(&self, _stage: StageId, score: u8) {
            self.scores.lock().push(score);
        }

        fn on_recursion(&self, _stage: StageId, depth: u32, restart_score: u8) {
            self.jumps.lock().push(depth);
            self.scores.lock().push(restart_score);
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

    fn engine(clarifier: Arc<dyn Clarifier>) -> RefinementEngine {
        RefinementEngine::new(RefinementConfig::default(), clarifier)
    }

    fn markers(n: usize) -> String {
        let mut text = String::from("Alice: we talked about");
        for _ in 0..n {
            text.push_str(" [inaudible] and");
        }
        text.push_str(" more.");
        text
    }

    #[test]
    fn test_clarity_score() {
        assert_eq!(clarity_score(0), 100);
        assert_eq!(clarity_score(2), 80);
        assert_eq!(clarity_score(10), 0);
        assert_eq!(clarity_score(25), 0);
    }

    #[test]
    fn test_weighted_score() {
        let all = SubMeasureScores {
            priming: 100,
            comprehension: 100,
            context_clarity: 100,
            elicitation_depth: 100,
            recursion: 100,
        };
        assert_eq!(weighted_score(&all, &ScoreWeights::default()), 100);

        let half = SubMeasureScores {
            comprehension: 50,
            ..all
        };
        // 100 - 35*50/100
        assert_eq!(weighted_score(&half, &ScoreWeights::default()), 83);
    }

    #[tokio::test]
    async fn test_two_markers_no_recursion() {
        let run = engine(Arc::new(NoClarifier))
            .run(&Identity, &markers(2), &ctx(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(run.report.outcome, StageOutcome::Ok);
        assert_eq!(run.report.scores.context_clarity, 80);
        assert_eq!(run.report.recursion_count, 0);
        assert_eq!(run.report.scores.elicitation_depth, 100);
        assert_eq!(run.report.scores.recursion, 100);
        assert!(run.body.is_some());
    }

    #[tokio::test]
    async fn test_budget_exhausted_is_degraded() {
        let recorder = Recorder::default();
        let run = engine(Arc::new(OneAtATime))
            .run(&Identity, &markers(7), &ctx(), &CancellationToken::new(), &recorder)
            .await
            .unwrap();

        assert_eq!(run.report.outcome, StageOutcome::Degraded);
        assert_eq!(run.report.recursion_count, 3);
        assert_eq!(run.report.markers_initial, 7);
        assert_eq!(run.report.markers_remaining, 4);
        assert_eq!(run.report.scores.context_clarity, 60);
        assert_eq!(run.report.scores.elicitation_depth, 43);
        assert_eq!(run.report.scores.recursion, 0);
        assert!(run.body.unwrap().contains("resolved"));
        assert_eq!(*recorder.jumps.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_elicitation_can_reach_threshold() {
        // 4 markers (clarity 60) -> one answer -> 3 markers (clarity 70)
        let run = engine(Arc::new(OneAtATime))
            .run(&Identity, &markers(4), &ctx(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(run.report.outcome, StageOutcome::Ok);
        assert_eq!(run.report.recursion_count, 1);
        assert_eq!(run.report.scores.elicitation_depth, 25);
        assert_eq!(run.report.scores.recursion, 100);
    }

    #[tokio::test]
    async fn test_progress_monotone_within_attempt() {
        let recorder = Recorder::default();
        engine(Arc::new(NoClarifier))
            .run(&Identity, &markers(1), &ctx(), &CancellationToken::new(), &recorder)
            .await
            .unwrap();
        assert_eq!(
            *recorder.scores.lock(),
            vec![PRIMED, COMPREHENDED, CLARITY_CHECKED, ELICITED]
        );
    }

    #[tokio::test]
    async fn test_empty_input_is_malformed() {
        let run = engine(Arc::new(NoClarifier))
            .run(&Identity, "  \n", &ctx(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(run.report.outcome, StageOutcome::MalformedInput);
        assert_eq!(run.report.scores.priming, 0);
        assert!(run.body.is_none());
    }

    #[tokio::test]
    async fn test_transform_error_reported() {
        let run = engine(Arc::new(NoClarifier))
            .run(&Failing, "Alice: hi", &ctx(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(run.report.outcome, StageOutcome::TransformError);
        assert_eq!(run.report.detail.as_deref(), Some("backend offline"));
    }

    #[tokio::test]
    async fn test_elicitation_timeout_degrades() {
        let mut config = RefinementConfig::default();
        config.elicitation_timeout_ms = 20;
        let run = RefinementEngine::new(config, Arc::new(Slow))
            .run(&Identity, &markers(5), &ctx(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(run.report.outcome, StageOutcome::Degraded);
        assert_eq!(run.report.elicitation_timeouts, 1);
        assert_eq!(run.report.recursion_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_elicitation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = engine(Arc::new(Slow))
            .run(&Identity, &markers(5), &ctx(), &cancel, &NoopObserver)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_zero_budget_degrades_immediately() {
        let mut config = RefinementConfig::default();
        config.max_recursion = 0;
        let run = RefinementEngine::new(config, Arc::new(OneAtATime))
            .run(&Identity, &markers(5), &ctx(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(run.report.outcome, StageOutcome::Degraded);
        assert_eq!(run.report.recursion_count, 0);
        assert_eq!(run.report.scores.recursion, 0);
        assert_eq!(run.report.scores.elicitation_depth, 0);
    }
}
