use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::clarifier::{Clarifier, StoreClarifier};
use crate::config::AceConfig;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::health::{DashboardSnapshot, HealthAggregator, SessionView};
use crate::history::{SessionHistory, SessionRecord};
use crate::modules::ModuleRegistry;
use crate::pipeline::{ProgressObserver, StageContext, StageHandler};
use crate::queue::{DeadLetter, ProcessingQueue, QueueEntry, RequeueOutcome};
use crate::refinement::RefinementEngine;
use crate::session::{Session, SessionStatus, StageId, StageOutcome, StageReport};
use crate::stages::default_handlers;
use crate::transcript::Transcript;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use holofs_store::{
    ArtifactId, ArtifactStore, ContentHash, EntryKind, Provenance, StorageError, VirtualPath,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Live session plus its cancellation handle
struct SessionSlot {
    session: Arc<Mutex<Session>>,
    cancel: CancellationToken,
}

/// Where a session stands after a worker returns it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub session_id: Uuid,
    pub status: SessionStatus,
}

/// How the stage loop ended
enum Disposition {
    Finished,
    /// A stage committed and more remain; the entry goes back in line
    Yielded,
    Paused,
    Failed(String),
    Aborted(String),
}

/// Feeds refinement progress into the session and the module registry
struct SessionProgress<'a> {
    session: &'a Mutex<Session>,
    modules: &'a ModuleRegistry,
}

impl ProgressObserver for SessionProgress<'_> {
    fn on_progress(&self, stage: StageId, score: u8) {
        self.session.lock().raise_score(stage, score);
        self.modules.record_progress(stage, score);
    }

    fn on_recursion(&self, stage: StageId, depth: u32, restart_score: u8) {
        self.session.lock().recursion_jump(stage, depth, restart_score);
        self.modules.record_progress(stage, restart_score);
    }
}

/// Pipeline orchestrator (session manager)
///
/// Owns one `Session` per artifact run. A per-artifact lock, taken when the
/// session starts and released on its terminal transition, keeps at most one
/// session per artifact alive; a paused session keeps its lock while it waits
/// in the queue.
pub struct AceOrchestrator {
    config: Arc<AceConfig>,
    store: Arc<dyn ArtifactStore>,
    queue: Arc<ProcessingQueue>,
    modules: Arc<ModuleRegistry>,
    engine: RefinementEngine,
    stage_handlers: HashMap<StageId, Arc<dyn StageHandler>>,
    checkpoint_mgr: CheckpointManager,
    history: SessionHistory,
    sessions: DashMap<Uuid, SessionSlot>,
    artifact_locks: DashMap<ArtifactId, Uuid>,
}

impl AceOrchestrator {
    /// Orchestrator with the five built-in stages and a store-backed clarifier
    pub fn new(config: Arc<AceConfig>, store: Arc<dyn ArtifactStore>) -> Self {
        let clarifier: Arc<dyn Clarifier> = Arc::new(StoreClarifier::new(
            Arc::clone(&store),
            config.refinement.context_root.clone(),
        ));

        let mut orchestrator = Self {
            engine: RefinementEngine::new(config.refinement.clone(), clarifier),
            queue: Arc::new(ProcessingQueue::new(config.queue.clone())),
            modules: Arc::new(ModuleRegistry::from_config(&config.modules)),
            stage_handlers: HashMap::new(),
            checkpoint_mgr: CheckpointManager::new_in_memory(),
            history: SessionHistory::new(),
            sessions: DashMap::new(),
            artifact_locks: DashMap::new(),
            config,
            store,
        };
        for handler in default_handlers() {
            orchestrator.register_handler(handler);
        }
        orchestrator
    }

    /// Replace the clarifier consulted during elicitation
    pub fn with_clarifier(mut self, clarifier: Arc<dyn Clarifier>) -> Self {
        self.engine = RefinementEngine::new(self.config.refinement.clone(), clarifier);
        self
    }

    /// Register a stage handler (replaces the built-in one for that stage)
    pub fn register_handler(&mut self, handler: Arc<dyn StageHandler>) {
        self.stage_handlers.insert(handler.stage_id(), handler);
    }

    pub fn config(&self) -> &AceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<ProcessingQueue> {
        &self.queue
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Intake
    // ═══════════════════════════════════════════════════════════════════════

    /// Enqueue a file that exists natively or through a mount
    ///
    /// Directories and missing paths are rejected with `NotFound`.
    pub async fn submit(&self, path: &str, stages: &[StageId], priority: i32) -> Result<Uuid> {
        let path = VirtualPath::parse(path)?;
        if !self.is_file(&path).await {
            return Err(StorageError::not_found(path.as_str()).into());
        }
        self.queue
            .enqueue(ArtifactId::for_path(&path), stages, priority)
    }

    async fn is_file(&self, path: &VirtualPath) -> bool {
        if self.store.head(path.as_str()).await.is_ok() {
            return true;
        }
        let Some(parent) = path.parent() else {
            return false;
        };
        match self.store.list_entries(parent.as_str()).await {
            Ok(entries) => entries
                .iter()
                .any(|entry| entry.path == *path && entry.kind == EntryKind::File),
            Err(_) => false,
        }
    }

    /// Claim the next entry whose artifact is free (or held by its own session)
    pub async fn next_entry(&self, wait: Duration) -> Option<QueueEntry> {
        let eligible = |entry: &QueueEntry| match self.artifact_locks.get(&entry.artifact_id) {
            None => true,
            Some(owner) => Some(*owner) == entry.session_id,
        };
        self.queue.dequeue_where(&eligible, wait).await
    }

    /// Dequeue one entry and run its next stage; `None` if nothing became eligible in `wait`
    pub async fn process_next(&self, worker_id: &str, wait: Duration) -> Result<Option<RunOutcome>> {
        match self.next_entry(wait).await {
            Some(entry) => self.run_entry(entry, worker_id).await.map(Some),
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Session execution
    // ═══════════════════════════════════════════════════════════════════════

    /// Run the next stage of a claimed entry's session
    ///
    /// The entry goes back to the tail of its band after each committed stage
    /// that leaves more to do; it is only completed once the session reaches
    /// a terminal status.
    pub async fn run_entry(&self, entry: QueueEntry, worker_id: &str) -> Result<RunOutcome> {
        let (session_id, session, cancel) = match self.start_or_resume(&entry, worker_id) {
            Ok(started) => started,
            Err(e @ OrchestratorError::ArtifactBusy { .. }) => {
                // Lost the race for the artifact; the entry waits for the lock
                if let Err(unclaim) = self.queue.unclaim(entry.entry_id) {
                    warn!(entry_id = %entry.entry_id, error = %unclaim, "Unclaim failed");
                }
                return Err(e);
            }
            Err(e) => {
                warn!(entry_id = %entry.entry_id, error = %e, "Dropping entry without a runnable session");
                let _ = self.queue.complete(entry.entry_id);
                return Err(e);
            }
        };

        let disposition = match self.drive(session_id, &session, &cancel, &entry).await {
            Ok(disposition) => disposition,
            Err(OrchestratorError::Cancelled(_)) => {
                Disposition::Aborted("cancelled during stage".to_string())
            }
            Err(e) if e.category() == ErrorCategory::Permanent => Disposition::Failed(e.to_string()),
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    category = e.category().as_str(),
                    error = %e,
                    "Stage hit a retryable error"
                );
                self.pause_for_retry(session_id, &session, &entry, e.to_string())
            }
        };

        let status = match disposition {
            Disposition::Paused => SessionStatus::Paused,
            Disposition::Yielded => match self.queue.yield_entry(entry.entry_id) {
                Ok(()) => SessionStatus::Running,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Could not return entry to the queue");
                    session.lock().fail(format!("requeue between stages failed: {}", e))?;
                    self.finalize(session_id, &entry, false).await?;
                    SessionStatus::Failed
                }
            },
            Disposition::Finished => {
                let status = session.lock().finish()?;
                self.finalize(session_id, &entry, true).await?;
                status
            }
            Disposition::Failed(reason) => {
                error!(session_id = %session_id, artifact = %entry.artifact_id, %reason, "Session failed");
                session.lock().fail(reason)?;
                self.finalize(session_id, &entry, true).await?;
                SessionStatus::Failed
            }
            Disposition::Aborted(reason) => {
                warn!(session_id = %session_id, artifact = %entry.artifact_id, %reason, "Session aborted");
                session.lock().abort(reason)?;
                self.finalize(session_id, &entry, true).await?;
                SessionStatus::Aborted
            }
        };

        Ok(RunOutcome { session_id, status })
    }

    /// Continue the entry's session or start a new one under the artifact lock
    fn start_or_resume(
        &self,
        entry: &QueueEntry,
        worker_id: &str,
    ) -> Result<(Uuid, Arc<Mutex<Session>>, CancellationToken)> {
        if let Some(session_id) = entry.session_id {
            let slot = self
                .sessions
                .get(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;
            let session = Arc::clone(&slot.session);
            let cancel = slot.cancel.clone();
            drop(slot);

            let status = session.lock().status;
            match status {
                SessionStatus::Paused => {
                    session.lock().resume()?;
                    info!(
                        session_id = %session_id,
                        artifact = %entry.artifact_id,
                        worker = worker_id,
                        retry = entry.retry_count,
                        "Session resumed"
                    );
                }
                SessionStatus::Running => {
                    debug!(session_id = %session_id, worker = worker_id, "Session continued");
                }
                other => {
                    return Err(OrchestratorError::InvalidStateTransition {
                        from: other.as_str().to_string(),
                        to: SessionStatus::Running.as_str().to_string(),
                    });
                }
            }
            return Ok((session_id, session, cancel));
        }

        let plan = self.modules.plan(&entry.requested_stages);
        let session = Session::start(entry.entry_id, entry.artifact_id.clone(), plan);
        let session_id = session.session_id;

        match self.artifact_locks.entry(entry.artifact_id.clone()) {
            Entry::Occupied(owner) => {
                return Err(OrchestratorError::ArtifactBusy {
                    artifact_id: entry.artifact_id.to_string(),
                    owner: *owner.get(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(session_id);
            }
        }

        let session = Arc::new(Mutex::new(session));
        let cancel = CancellationToken::new();
        self.sessions.insert(
            session_id,
            SessionSlot {
                session: Arc::clone(&session),
                cancel: cancel.clone(),
            },
        );
        self.queue.attach_session(entry.entry_id, session_id)?;

        info!(
            session_id = %session_id,
            artifact = %entry.artifact_id,
            entry_id = %entry.entry_id,
            worker = worker_id,
            plan = ?session.lock().plan,
            "Session started"
        );
        Ok((session_id, session, cancel))
    }

    /// Run the first planned stage without a checkpoint
    ///
    /// Returns `Yielded` after a commit that leaves stages pending and
    /// `Finished` once none remain.
    async fn drive(
        &self,
        session_id: Uuid,
        session: &Mutex<Session>,
        cancel: &CancellationToken,
        entry: &QueueEntry,
    ) -> Result<Disposition> {
        let path = entry.artifact_id.as_str();
        let plan = session.lock().plan.clone();
        let completed = self.checkpoint_mgr.completed_stages(session_id).await?;

        let input_version = match self.checkpoint_mgr.latest(session_id).await? {
            Some(checkpoint) => checkpoint.version,
            None => self.store.materialize(path).await?.sequence,
        };

        let pending: Vec<StageId> = plan
            .into_iter()
            .filter(|stage| !completed.contains(stage))
            .collect();

        if let Some(&stage) = pending.first() {
            if cancel.is_cancelled() {
                return Ok(Disposition::Aborted(format!("cancelled before {}", stage)));
            }

            let handler = self
                .stage_handlers
                .get(&stage)
                .cloned()
                .ok_or_else(|| OrchestratorError::NoHandler(stage.to_string()))?;

            let attempt = {
                let mut s = session.lock();
                s.begin_stage(stage)?;
                s.retry_count + 1
            };

            let bytes = self.store.get(path, Some(input_version)).await?;
            let text = match std::str::from_utf8(&bytes) {
                Ok(text) => text,
                Err(e) => {
                    // Undecodable input fails priming like any other malformed input
                    let detail = format!("input version {} is not valid UTF-8 ({})", input_version, e);
                    warn!(session_id = %session_id, stage = %stage, %detail, "Priming rejected input");
                    session.lock().record_attempt(StageReport::malformed(stage, detail.clone()));
                    return Ok(Disposition::Failed(format!("{}: {}", stage, detail)));
                }
            };
            let mut doc = Transcript::parse(text);
            let ctx = StageContext {
                session_id,
                artifact_id: entry.artifact_id.clone(),
                stage,
                input_version,
                attempt,
            };
            let observer = SessionProgress {
                session,
                modules: &self.modules,
            };

            let run = self
                .engine
                .run(handler.as_ref(), &doc.body, &ctx, cancel, &observer)
                .await?;
            let mut report = run.report;

            match (report.outcome, run.body) {
                (StageOutcome::TransformError, _) => {
                    let reason = format!(
                        "{}: {}",
                        stage,
                        report.detail.clone().unwrap_or_default()
                    );
                    session.lock().record_attempt(report);
                    return Ok(self.pause_for_retry(session_id, session, entry, reason));
                }
                (StageOutcome::MalformedInput, _) | (_, None) => {
                    let reason = format!(
                        "{}: {}",
                        stage,
                        report.detail.clone().unwrap_or_else(|| "malformed input".to_string())
                    );
                    session.lock().record_attempt(report);
                    return Ok(Disposition::Failed(reason));
                }
                (outcome, Some(body)) => {
                    // Never commit work for a session that was cancelled mid-stage
                    if cancel.is_cancelled() {
                        return Ok(Disposition::Aborted(format!(
                            "cancelled during {}, output discarded",
                            stage
                        )));
                    }

                    doc.body = body;
                    doc.stamp(stage, report.final_score, outcome);
                    let content = doc.render();
                    let version = self
                        .store
                        .commit(
                            path,
                            content.as_bytes(),
                            Provenance::stage(session_id.to_string(), stage.as_str()),
                            Some(input_version),
                        )
                        .await?;

                    self.checkpoint_mgr
                        .save_checkpoint(Checkpoint::new(
                            session_id,
                            stage,
                            version.sequence,
                            ContentHash::compute(content.as_bytes()),
                            report.final_score,
                            outcome,
                        ))
                        .await?;

                    info!(
                        session_id = %session_id,
                        artifact = %entry.artifact_id,
                        stage = %stage,
                        outcome = %outcome,
                        version = version.sequence,
                        final_score = report.final_score,
                        "Stage committed"
                    );

                    report.version = Some(version.sequence);
                    session.lock().complete_stage(report)?;
                    self.modules.record_progress(stage, 100);

                    if pending.len() > 1 {
                        return Ok(Disposition::Yielded);
                    }
                }
            }
        }

        Ok(Disposition::Finished)
    }

    /// Pause the session and requeue its entry with backoff
    fn pause_for_retry(
        &self,
        session_id: Uuid,
        session: &Mutex<Session>,
        entry: &QueueEntry,
        reason: String,
    ) -> Disposition {
        if let Err(e) = session.lock().pause(reason.clone()) {
            return Disposition::Failed(format!("{} ({})", reason, e));
        }
        match self.queue.requeue_with_backoff(entry.entry_id) {
            Ok(RequeueOutcome::Scheduled { delay, retry_count }) => {
                info!(
                    session_id = %session_id,
                    artifact = %entry.artifact_id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Session paused for retry"
                );
                Disposition::Paused
            }
            Ok(RequeueOutcome::DeadLettered) => {
                Disposition::Failed(format!("{}; retries exhausted", reason))
            }
            Err(e) => Disposition::Failed(format!("{}; requeue failed: {}", reason, e)),
        }
    }

    /// Move a terminal session to history and release everything it held
    async fn finalize(&self, session_id: Uuid, entry: &QueueEntry, claimed: bool) -> Result<()> {
        let Some((_, slot)) = self.sessions.remove(&session_id) else {
            return Err(OrchestratorError::SessionNotFound(session_id));
        };
        let record = SessionRecord::from_session(&slot.session.lock());

        info!(
            session_id = %session_id,
            artifact = %record.artifact_id,
            status = %record.status,
            versions = ?record.versions_committed,
            "Session finished"
        );
        self.history.insert(record)?;

        self.artifact_locks
            .remove_if(&entry.artifact_id, |_, owner| *owner == session_id);
        if claimed {
            // Dead-lettered entries are no longer claimed
            let _ = self.queue.complete(entry.entry_id);
        }
        self.engine.clarifier().session_finished(session_id);
        self.checkpoint_mgr
            .delete_session_checkpoints(session_id)
            .await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control and queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Cancel a running or paused session
    ///
    /// A session whose entry is waiting in the queue, paused or between
    /// stages, loses the entry and aborts immediately. One a worker holds
    /// aborts at its next step boundary, discarding the in-flight stage.
    pub async fn cancel(&self, session_id: Uuid) -> Result<()> {
        let (session, token) = {
            let slot = self
                .sessions
                .get(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;
            (Arc::clone(&slot.session), slot.cancel.clone())
        };
        token.cancel();

        let (status, entry_id) = {
            let s = session.lock();
            (s.status, s.entry_id)
        };
        match status {
            SessionStatus::Running | SessionStatus::Paused => {
                let Ok(entry) = self.queue.remove(entry_id) else {
                    // A worker holds the entry; it sees the token
                    info!(session_id = %session_id, "Cancellation requested");
                    return Ok(());
                };
                let reason = match status {
                    SessionStatus::Paused => "cancelled while paused",
                    _ => "cancelled between stages",
                };
                session.lock().abort(reason.to_string())?;
                warn!(session_id = %session_id, artifact = %entry.artifact_id, "Queued session aborted");
                self.finalize(session_id, &entry, false).await
            }
            other => Err(OrchestratorError::InvalidStateTransition {
                from: other.as_str().to_string(),
                to: SessionStatus::Aborted.as_str().to_string(),
            }),
        }
    }

    /// Snapshot of a live session
    pub fn session(&self, session_id: Uuid) -> Option<Session> {
        self.sessions
            .get(&session_id)
            .map(|slot| slot.session.lock().clone())
    }

    pub fn active_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|slot| slot.session.lock().clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Session currently holding an artifact
    pub fn lock_owner(&self, artifact_id: &ArtifactId) -> Option<Uuid> {
        self.artifact_locks.get(artifact_id).map(|owner| *owner)
    }

    /// Entries that exhausted their retries
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters()
    }

    /// No queued work and no live sessions
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle() && self.sessions.is_empty()
    }

    /// Read-only dashboard view
    pub async fn dashboard(&self) -> DashboardSnapshot {
        let sessions = self.active_sessions();
        let mounts = self.store.probe_mounts().await;
        let modules = self.modules.snapshot();

        DashboardSnapshot {
            health: HealthAggregator::compute(&sessions, &mounts, &modules),
            sessions: sessions.iter().map(SessionView::from).collect(),
            modules,
            queue: self.queue.stats(),
        }
    }
}
