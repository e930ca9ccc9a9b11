//! Immutable records of finished sessions
//!
//! A session moves here on its terminal transition. Records are keyed by
//! session id, never modified, and can be exported as a bincode snapshot.

use chrono::{DateTime, Utc};
use holofs_store::ArtifactId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::session::{Session, SessionStatus, StageId, StageReport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub artifact_id: ArtifactId,
    pub entry_id: Uuid,
    pub plan: Vec<StageId>,
    pub status: SessionStatus,
    pub stage_scores: BTreeMap<StageId, u8>,
    pub reports: Vec<StageReport>,
    pub recursion_depth: u32,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
    /// Store versions this session committed, ascending
    pub versions_committed: Vec<u64>,
}

impl SessionRecord {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.session_id,
            artifact_id: session.artifact_id.clone(),
            entry_id: session.entry_id,
            plan: session.plan.clone(),
            status: session.status,
            stage_scores: session.stage_scores.clone(),
            reports: session.reports.clone(),
            recursion_depth: session.recursion_depth,
            retry_count: session.retry_count,
            started_at: session.created_at,
            finished_at: Utc::now(),
            error: session.error.clone(),
            versions_committed: session.committed_versions(),
        }
    }
}

#[derive(Default)]
pub struct SessionHistory {
    records: RwLock<BTreeMap<Uuid, SessionRecord>>,
}

impl SessionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record; a session id is recorded at most once
    pub fn insert(&self, record: SessionRecord) -> Result<()> {
        if !record.status.is_terminal() {
            return Err(OrchestratorError::InvalidStateTransition {
                from: record.status.as_str().to_string(),
                to: "history".to_string(),
            });
        }
        let mut records = self.records.write();
        if records.contains_key(&record.session_id) {
            warn!(session_id = %record.session_id, "Session already recorded");
            return Err(OrchestratorError::InvalidStateTransition {
                from: "history".to_string(),
                to: "history".to_string(),
            });
        }
        debug!(session_id = %record.session_id, status = %record.status, "Session recorded");
        records.insert(record.session_id, record);
        Ok(())
    }

    pub fn get(&self, session_id: Uuid) -> Option<SessionRecord> {
        self.records.read().get(&session_id).cloned()
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Records for one artifact, oldest first
    pub fn for_artifact(&self, artifact_id: &ArtifactId) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .records
            .read()
            .values()
            .filter(|r| &r.artifact_id == artifact_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn export_bincode(&self) -> Result<Vec<u8>> {
        let records: Vec<SessionRecord> = self.list();
        Ok(bincode::serialize(&records)?)
    }

    /// Load records from an export; ids already present are kept as they are
    pub fn import_bincode(&self, bytes: &[u8]) -> Result<usize> {
        let imported: Vec<SessionRecord> = bincode::deserialize(bytes)?;
        let mut records = self.records.write();
        let mut added = 0;
        for record in imported {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                records.entry(record.session_id)
            {
                slot.insert(record);
                added += 1;
            }
        }
        Ok(added)
    }
}
