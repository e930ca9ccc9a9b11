//! Processing queue
//!
//! Priority bands drain strictly highest-first, FIFO within a band. Dequeue
//! moves an entry into the claimed set under the queue mutex, so a given entry
//! is handed to exactly one caller. Requeued entries wait in a delayed list
//! and rejoin the tail of their band once their delay has elapsed.

use chrono::{DateTime, Utc};
use holofs_store::ArtifactId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::error::{OrchestratorError, Result};
use crate::session::StageId;

/// One unit of queued work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry_id: Uuid,
    pub artifact_id: ArtifactId,
    pub requested_stages: Vec<StageId>,
    pub enqueued_at: DateTime<Utc>,
    pub priority: i32,
    pub retry_count: u32,
    /// Set once a session owns this entry; a requeued entry resumes it
    pub session_id: Option<Uuid>,
}

/// Entry that exhausted its retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry: QueueEntry,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

/// Dequeue eligibility predicate
pub type EntryFilter<'a> = dyn Fn(&QueueEntry) -> bool + Sync + 'a;

/// What `requeue` did with the entry
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    Scheduled { delay: Duration, retry_count: u32 },
    DeadLettered,
}

#[derive(Default)]
struct QueueState {
    bands: BTreeMap<i32, VecDeque<QueueEntry>>,
    claimed: HashMap<Uuid, QueueEntry>,
    delayed: Vec<(Instant, QueueEntry)>,
    dead_letters: Vec<DeadLetter>,
}

impl QueueState {
    fn promote_mature(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let mut ready: Vec<(Instant, QueueEntry)> = Vec::new();
        let mut waiting = Vec::with_capacity(self.delayed.len());
        for item in self.delayed.drain(..) {
            if item.0 <= now {
                ready.push(item);
            } else {
                waiting.push(item);
            }
        }
        self.delayed = waiting;
        ready.sort_by_key(|(at, _)| *at);
        for (_, entry) in ready {
            debug!(entry_id = %entry.entry_id, priority = entry.priority, "Delayed entry rejoined its band");
            self.bands.entry(entry.priority).or_default().push_back(entry);
        }
    }

    fn pending(&self) -> impl Iterator<Item = &QueueEntry> {
        self.bands
            .values()
            .flat_map(|band| band.iter())
            .chain(self.delayed.iter().map(|(_, entry)| entry))
    }

    fn take_first(&mut self, eligible: &EntryFilter<'_>) -> Option<QueueEntry> {
        let mut found: Option<(i32, usize)> = None;
        for (priority, band) in self.bands.iter().rev() {
            if let Some(idx) = band.iter().position(|entry| eligible(entry)) {
                found = Some((*priority, idx));
                break;
            }
        }
        let (priority, idx) = found?;
        let band = self.bands.get_mut(&priority)?;
        let entry = band.remove(idx);
        if band.is_empty() {
            self.bands.remove(&priority);
        }
        entry
    }

    fn remove_pending(&mut self, entry_id: Uuid) -> Option<QueueEntry> {
        for band in self.bands.values_mut() {
            if let Some(idx) = band.iter().position(|entry| entry.entry_id == entry_id) {
                return band.remove(idx);
            }
        }
        let idx = self
            .delayed
            .iter()
            .position(|(_, entry)| entry.entry_id == entry_id)?;
        Some(self.delayed.remove(idx).1)
    }
}

/// Queue depth counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub claimed: usize,
    pub dead_letters: usize,
}

/// Priority queue of artifact work items
pub struct ProcessingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    settings: QueueSettings,
}

impl ProcessingQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Add work for an artifact
    ///
    /// # Errors
    ///
    /// `DuplicateEnqueue` if an unclaimed entry for the same artifact already
    /// waits at an equal or higher priority; nothing changes in that case.
    /// Entries carrying a session between stages are not fresh requests and
    /// never count as duplicates.
    pub fn enqueue(
        &self,
        artifact_id: ArtifactId,
        stages: &[StageId],
        priority: i32,
    ) -> Result<Uuid> {
        let mut state = self.state.lock();

        if let Some(existing) = state
            .pending()
            .filter(|entry| entry.session_id.is_none())
            .find(|entry| entry.artifact_id == artifact_id && entry.priority >= priority)
        {
            warn!(
                artifact = %artifact_id,
                existing = %existing.entry_id,
                priority,
                "Rejected duplicate enqueue"
            );
            return Err(OrchestratorError::DuplicateEnqueue {
                artifact_id: artifact_id.to_string(),
                existing: existing.entry_id,
                priority: existing.priority,
            });
        }

        let entry = QueueEntry {
            entry_id: Uuid::new_v4(),
            artifact_id,
            requested_stages: StageId::canonical(stages),
            enqueued_at: Utc::now(),
            priority,
            retry_count: 0,
            session_id: None,
        };
        let entry_id = entry.entry_id;
        info!(entry_id = %entry_id, artifact = %entry.artifact_id, priority, "Enqueued");
        state.bands.entry(priority).or_default().push_back(entry);
        drop(state);

        self.notify.notify_one();
        Ok(entry_id)
    }

    /// Non-blocking dequeue of the highest-priority, oldest entry
    pub fn try_dequeue(&self) -> Option<QueueEntry> {
        self.try_dequeue_where(&|_| true)
    }

    /// Non-blocking dequeue of the first entry `eligible` accepts
    pub fn try_dequeue_where(&self, eligible: &EntryFilter<'_>) -> Option<QueueEntry> {
        let mut state = self.state.lock();
        state.promote_mature(Instant::now());
        let entry = state.take_first(eligible)?;
        state.claimed.insert(entry.entry_id, entry.clone());
        debug!(entry_id = %entry.entry_id, artifact = %entry.artifact_id, "Claimed");
        Some(entry)
    }

    /// Blocking dequeue; `None` once `wait` elapses with nothing eligible
    ///
    /// Sleeps on the enqueue notification, waking at least every
    /// `wake_interval` to promote delayed entries.
    pub async fn dequeue_where(
        &self,
        eligible: &EntryFilter<'_>,
        wait: Duration,
    ) -> Option<QueueEntry> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(entry) = self.try_dequeue_where(eligible) {
                return Some(entry);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let nap = self.settings.wake_interval().min(deadline - now);
            let _ = tokio::time::timeout(nap, self.notify.notified()).await;
        }
    }

    pub async fn dequeue(&self, wait: Duration) -> Option<QueueEntry> {
        self.dequeue_where(&|_| true, wait).await
    }

    /// Record the owning session on a claimed entry
    pub fn attach_session(&self, entry_id: Uuid, session_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .claimed
            .get_mut(&entry_id)
            .ok_or(OrchestratorError::EntryNotClaimed(entry_id))?;
        entry.session_id = Some(session_id);
        Ok(())
    }

    /// Acknowledge a claimed entry as done
    pub fn complete(&self, entry_id: Uuid) -> Result<QueueEntry> {
        let entry = self
            .state
            .lock()
            .claimed
            .remove(&entry_id)
            .ok_or(OrchestratorError::EntryNotClaimed(entry_id))?;
        debug!(entry_id = %entry_id, "Completed");
        Ok(entry)
    }

    /// Return a claimed entry to the head of its band, retry count unchanged
    pub fn unclaim(&self, entry_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .claimed
            .remove(&entry_id)
            .ok_or(OrchestratorError::EntryNotClaimed(entry_id))?;
        state.bands.entry(entry.priority).or_default().push_front(entry);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Send a claimed entry to the tail of its band so other work can run
    /// before its next stage; the retry count is unchanged
    pub fn yield_entry(&self, entry_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .claimed
            .remove(&entry_id)
            .ok_or(OrchestratorError::EntryNotClaimed(entry_id))?;
        debug!(entry_id = %entry_id, artifact = %entry.artifact_id, "Yielded between stages");
        state.bands.entry(entry.priority).or_default().push_back(entry);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Backoff before retry number `retry_count + 1`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(16));
        self.settings.retry_base_delay().saturating_mul(factor)
    }

    /// Re-insert a claimed entry at the tail of its band after `delay`
    ///
    /// Increments the retry counter; past `max_retries` the entry moves to the
    /// dead-letter list instead.
    pub fn requeue(&self, entry_id: Uuid, delay: Duration) -> Result<RequeueOutcome> {
        let mut state = self.state.lock();
        let mut entry = state
            .claimed
            .remove(&entry_id)
            .ok_or(OrchestratorError::EntryNotClaimed(entry_id))?;
        entry.retry_count += 1;

        if entry.retry_count > self.settings.max_retries {
            warn!(
                entry_id = %entry_id,
                artifact = %entry.artifact_id,
                retries = entry.retry_count - 1,
                "Retries exhausted, dead-lettering"
            );
            let reason = format!("exceeded {} retries", self.settings.max_retries);
            state.dead_letters.push(DeadLetter {
                entry,
                reason,
                dead_at: Utc::now(),
            });
            return Ok(RequeueOutcome::DeadLettered);
        }

        let retry_count = entry.retry_count;
        info!(
            entry_id = %entry_id,
            artifact = %entry.artifact_id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Requeued"
        );
        state.delayed.push((Instant::now() + delay, entry));
        Ok(RequeueOutcome::Scheduled { delay, retry_count })
    }

    /// `requeue` with exponential backoff from the entry's retry count
    pub fn requeue_with_backoff(&self, entry_id: Uuid) -> Result<RequeueOutcome> {
        let retry_count = self
            .state
            .lock()
            .claimed
            .get(&entry_id)
            .map(|entry| entry.retry_count)
            .ok_or(OrchestratorError::EntryNotClaimed(entry_id))?;
        self.requeue(entry_id, self.backoff(retry_count))
    }

    /// Drop a ready or delayed entry; claimed entries are not touched
    pub fn remove(&self, entry_id: Uuid) -> Result<QueueEntry> {
        let removed = self
            .state
            .lock()
            .remove_pending(entry_id)
            .ok_or(OrchestratorError::EntryNotFound(entry_id))?;
        info!(entry_id = %entry_id, "Removed from queue");
        Ok(removed)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            ready: state.bands.values().map(|band| band.len()).sum(),
            delayed: state.delayed.len(),
            claimed: state.claimed.len(),
            dead_letters: state.dead_letters.len(),
        }
    }

    /// Nothing waiting, delayed or claimed
    pub fn is_idle(&self) -> bool {
        let stats = self.stats();
        stats.ready == 0 && stats.delayed == 0 && stats.claimed == 0
    }
}

impl Default for ProcessingQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}
