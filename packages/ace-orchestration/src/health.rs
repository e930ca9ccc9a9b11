//! Health read model
//!
//! Every figure is derived on demand from orchestrator, store and module
//! state. Nothing here mutates or caches.

use chrono::{DateTime, Utc};
use holofs_store::MountStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::modules::ModuleInfo;
use crate::queue::QueueStats;
use crate::session::{Session, SessionStatus, StageId};

/// The three headline percentages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub ace_integration: u8,
    pub holofs_status: u8,
    pub data_processing: u8,
}

/// Dashboard row for an active session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: Uuid,
    pub artifact_id: String,
    pub current_stage: Option<StageId>,
    pub status: SessionStatus,
    pub stage_scores: BTreeMap<StageId, u8>,
    pub recursion_depth: u32,
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id,
            artifact_id: session.artifact_id.to_string(),
            current_stage: session.current_stage,
            status: session.status,
            stage_scores: session.stage_scores.clone(),
            recursion_depth: session.recursion_depth,
            retry_count: session.retry_count,
            updated_at: session.updated_at,
        }
    }
}

/// Everything the dashboard polls for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub sessions: Vec<SessionView>,
    pub health: HealthReport,
    pub modules: Vec<ModuleInfo>,
    pub queue: QueueStats,
}

fn percent(part: usize, whole: usize) -> u8 {
    if whole == 0 {
        return 0;
    }
    ((part.min(whole) as f64 * 100.0) / whole as f64).round() as u8
}

pub struct HealthAggregator;

impl HealthAggregator {
    /// Stages completed over stages expected, across active sessions
    pub fn data_processing(sessions: &[Session]) -> u8 {
        let expected: usize = sessions.iter().map(|s| s.plan.len()).sum();
        let completed: usize = sessions.iter().map(|s| s.completed_stages().len()).sum();
        percent(completed, expected)
    }

    /// Reachable over registered mounts
    pub fn holofs_status(mounts: &[MountStatus]) -> u8 {
        let reachable = mounts.iter().filter(|m| m.reachable).count();
        percent(reachable, mounts.len())
    }

    /// Average last progress of the enabled modules
    pub fn ace_integration(modules: &[ModuleInfo]) -> u8 {
        let enabled: Vec<u8> = modules
            .iter()
            .filter(|m| m.enabled)
            .map(|m| m.progress)
            .collect();
        if enabled.is_empty() {
            return 0;
        }
        let sum: u32 = enabled.iter().map(|p| *p as u32).sum();
        ((sum as f64) / enabled.len() as f64).round() as u8
    }

    pub fn compute(
        sessions: &[Session],
        mounts: &[MountStatus],
        modules: &[ModuleInfo],
    ) -> HealthReport {
        HealthReport {
            ace_integration: Self::ace_integration(modules),
            holofs_status: Self::holofs_status(mounts),
            data_processing: Self::data_processing(sessions),
        }
    }
}

#[cfg(feature = "metrics")]
pub use gauges::HealthGauges;

#[cfg(feature = "metrics")]
mod gauges {
    use super::HealthReport;
    use prometheus::{register_int_gauge_with_registry, IntGauge, Opts, Registry};

    /// Health percentages exported as Prometheus gauges
    #[derive(Clone)]
    pub struct HealthGauges {
        pub ace_integration: IntGauge,
        pub holofs_status: IntGauge,
        pub data_processing: IntGauge,
    }

    impl HealthGauges {
        pub fn new(registry: &Registry) -> prometheus::Result<Self> {
            Ok(Self {
                ace_integration: register_int_gauge_with_registry!(
                    Opts::new("ace_integration_percent", "Average progress of enabled modules"),
                    registry
                )?,
                holofs_status: register_int_gauge_with_registry!(
                    Opts::new("holofs_status_percent", "Reachable mounted sources"),
                    registry
                )?,
                data_processing: register_int_gauge_with_registry!(
                    Opts::new(
                        "ace_data_processing_percent",
                        "Completed stages across active sessions"
                    ),
                    registry
                )?,
            })
        }

        pub fn observe(&self, report: &HealthReport) {
            self.ace_integration.set(report.ace_integration as i64);
            self.holofs_status.set(report.holofs_status as i64);
            self.data_processing.set(report.data_processing as i64);
        }
    }
}
