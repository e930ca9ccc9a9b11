//! External clarifiers consulted during elicitation

use async_trait::async_trait;
use dashmap::DashMap;
use holofs_store::{ArtifactId, ArtifactStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::session::StageId;
use crate::transcript::{Marker, MarkerKind};

/// One elicitation round's question
#[derive(Debug, Clone)]
pub struct ClarificationRequest {
    pub session_id: Uuid,
    pub artifact_id: ArtifactId,
    pub stage: StageId,
    /// 1-based elicitation round within the stage attempt
    pub round: u32,
    /// Unresolved markers of the working copy, in document order
    pub markers: Vec<Marker>,
}

/// Source of additional context for unresolved markers
///
/// The response holds one answer per line, aligned with `markers`; a blank
/// line leaves that marker unresolved. The caller bounds the call with the
/// elicitation timeout.
#[async_trait]
pub trait Clarifier: Send + Sync {
    async fn request_context(&self, request: &ClarificationRequest) -> Result<String>;

    /// Drop any per-session state once the session is terminal
    fn session_finished(&self, _session_id: Uuid) {}
}

/// Never has anything to add
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClarifier;

#[async_trait]
impl Clarifier for NoClarifier {
    async fn request_context(&self, _request: &ClarificationRequest) -> Result<String> {
        Ok(String::new())
    }
}

/// Answers looked up in the artifact store
///
/// `{context_root}/{kind}` (for example `/context/inaudible`) holds one answer
/// per line; blank lines are ignored. Answers are consumed in order over a
/// whole session: each fills the next unresolved marker of its kind and is
/// never handed out twice. The directory may be native or mounted.
pub struct StoreClarifier {
    store: Arc<dyn ArtifactStore>,
    context_root: String,
    consumed: DashMap<(Uuid, MarkerKind), usize>,
}

impl StoreClarifier {
    pub fn new(store: Arc<dyn ArtifactStore>, context_root: impl Into<String>) -> Self {
        Self {
            store,
            context_root: context_root.into().trim_end_matches('/').to_string(),
            consumed: DashMap::new(),
        }
    }

    async fn answers_for(&self, kind: MarkerKind) -> Result<Vec<String>> {
        let path = format!("{}/{}", self.context_root, kind.slug());
        match self.store.get_text(&path, None).await {
            Ok(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Clarifier for StoreClarifier {
    async fn request_context(&self, request: &ClarificationRequest) -> Result<String> {
        let mut files: HashMap<MarkerKind, Vec<String>> = HashMap::new();
        for marker in &request.markers {
            if !files.contains_key(&marker.kind) {
                let answers = self.answers_for(marker.kind).await?;
                files.insert(marker.kind, answers);
            }
        }

        let mut lines = Vec::with_capacity(request.markers.len());
        for marker in &request.markers {
            let mut next = self
                .consumed
                .entry((request.session_id, marker.kind))
                .or_insert(0);
            let answer = files
                .get(&marker.kind)
                .and_then(|answers| answers.get(*next))
                .cloned();
            if answer.is_some() {
                *next += 1;
            }
            lines.push(answer.unwrap_or_default());
        }

        debug!(
            session_id = %request.session_id,
            stage = %request.stage,
            round = request.round,
            answered = lines.iter().filter(|l| !l.is_empty()).count(),
            "Store clarifier answered"
        );
        Ok(lines.join("\n"))
    }

    fn session_finished(&self, session_id: Uuid) {
        self.consumed.retain(|(owner, _), _| *owner != session_id);
    }
}
