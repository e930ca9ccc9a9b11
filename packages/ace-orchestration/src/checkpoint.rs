use crate::error::Result;
use crate::session::{StageId, StageOutcome};
use holofs_store::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Committed stage of a session, the resume point after a retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub session_id: Uuid,
    pub stage: StageId,
    /// Store version the stage committed
    pub version: u64,
    pub content_hash: ContentHash,
    pub final_score: u8,
    pub outcome: StageOutcome,
}

impl Checkpoint {
    pub fn new(
        session_id: Uuid,
        stage: StageId,
        version: u64,
        content_hash: ContentHash,
        final_score: u8,
        outcome: StageOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            stage,
            version,
            content_hash,
            final_score,
            outcome,
        }
    }
}

/// Checkpoint manager (in-memory)
pub struct CheckpointManager {
    checkpoints: Arc<parking_lot::Mutex<Vec<Checkpoint>>>,
}

impl CheckpointManager {
    pub fn new_in_memory() -> Self {
        Self {
            checkpoints: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    /// Save checkpoint
    pub async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock();

        // Remove existing checkpoint for same session+stage
        checkpoints.retain(|cp| {
            !(cp.session_id == checkpoint.session_id && cp.stage == checkpoint.stage)
        });

        checkpoints.push(checkpoint);
        Ok(())
    }

    /// Most recently committed stage of a session
    pub async fn latest(&self, session_id: Uuid) -> Result<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.lock();

        Ok(checkpoints
            .iter()
            .filter(|cp| cp.session_id == session_id)
            .max_by_key(|cp| cp.stage)
            .cloned())
    }

    /// Get completed stages for a session
    pub async fn completed_stages(&self, session_id: Uuid) -> Result<BTreeSet<StageId>> {
        let checkpoints = self.checkpoints.lock();

        Ok(checkpoints
            .iter()
            .filter(|cp| cp.session_id == session_id)
            .map(|cp| cp.stage)
            .collect())
    }

    /// Delete checkpoints for a session (cleanup after a terminal transition)
    pub async fn delete_session_checkpoints(&self, session_id: Uuid) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock();
        checkpoints.retain(|cp| cp.session_id != session_id);
        Ok(())
    }
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(session_id: Uuid, stage: StageId, version: u64) -> Checkpoint {
        Checkpoint::new(
            session_id,
            stage,
            version,
            ContentHash::compute(format!("v{}", version).as_bytes()),
            90,
            StageOutcome::Ok,
        )
    }

    #[tokio::test]
    async fn test_save_and_latest() {
        let mgr = CheckpointManager::new_in_memory();
        let session_id = Uuid::new_v4();

        mgr.save_checkpoint(checkpoint(session_id, StageId::Formatting, 2))
            .await
            .unwrap();
        mgr.save_checkpoint(checkpoint(session_id, StageId::ContextualRepair, 3))
            .await
            .unwrap();

        let latest = mgr.latest(session_id).await.unwrap().unwrap();
        assert_eq!(latest.stage, StageId::ContextualRepair);
        assert_eq!(latest.version, 3);
    }

    #[tokio::test]
    async fn test_save_checkpoint_replaces_existing() {
        let mgr = CheckpointManager::new_in_memory();
        let session_id = Uuid::new_v4();

        mgr.save_checkpoint(checkpoint(session_id, StageId::Formatting, 2))
            .await
            .unwrap();
        mgr.save_checkpoint(checkpoint(session_id, StageId::Formatting, 5))
            .await
            .unwrap();

        let latest = mgr.latest(session_id).await.unwrap().unwrap();
        assert_eq!(latest.version, 5);
        assert_eq!(mgr.completed_stages(session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_stages_per_session() {
        let mgr = CheckpointManager::new_in_memory();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        mgr.save_checkpoint(checkpoint(a, StageId::Formatting, 2)).await.unwrap();
        mgr.save_checkpoint(checkpoint(a, StageId::Summary, 3)).await.unwrap();
        mgr.save_checkpoint(checkpoint(b, StageId::Formatting, 2)).await.unwrap();

        let completed = mgr.completed_stages(a).await.unwrap();
        assert_eq!(
            completed.into_iter().collect::<Vec<_>>(),
            vec![StageId::Formatting, StageId::Summary]
        );
    }

    #[tokio::test]
    async fn test_delete_session_checkpoints() {
        let mgr = CheckpointManager::new_in_memory();
        let session_id = Uuid::new_v4();

        mgr.save_checkpoint(checkpoint(session_id, StageId::Formatting, 2))
            .await
            .unwrap();
        mgr.delete_session_checkpoints(session_id).await.unwrap();

        assert!(mgr.completed_stages(session_id).await.unwrap().is_empty());
        assert!(mgr.latest(session_id).await.unwrap().is_none());
    }
}
