//! Process-wide module registry
//!
//! Built once from `ModulesConfig` and shared by `Arc`. Enabled flags change
//! only under the writer lock; progress updates are atomic stores under the
//! read lock.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;

use crate::config::ModulesConfig;
use crate::session::StageId;

struct ModuleState {
    stage: StageId,
    enabled: bool,
    last_progress: AtomicU8,
}

/// Dashboard view of one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    pub name: String,
    pub stage: StageId,
    pub enabled: bool,
    pub progress: u8,
}

pub struct ModuleRegistry {
    modules: RwLock<Vec<ModuleState>>,
}

impl ModuleRegistry {
    pub fn from_config(config: &ModulesConfig) -> Self {
        let modules = StageId::ALL
            .iter()
            .map(|stage| ModuleState {
                stage: *stage,
                enabled: config.is_enabled(*stage),
                last_progress: AtomicU8::new(0),
            })
            .collect();
        Self {
            modules: RwLock::new(modules),
        }
    }

    pub fn is_enabled(&self, stage: StageId) -> bool {
        self.modules
            .read()
            .iter()
            .any(|m| m.stage == stage && m.enabled)
    }

    /// Reconfigure a module; affects sessions started afterwards
    pub fn set_enabled(&self, stage: StageId, enabled: bool) {
        let mut modules = self.modules.write();
        if let Some(module) = modules.iter_mut().find(|m| m.stage == stage) {
            module.enabled = enabled;
            info!(module = stage.module_name(), enabled, "Module reconfigured");
        }
    }

    /// Latest progress any session reported for `stage`
    pub fn record_progress(&self, stage: StageId, progress: u8) {
        if let Some(module) = self.modules.read().iter().find(|m| m.stage == stage) {
            module
                .last_progress
                .store(progress.min(100), Ordering::Relaxed);
        }
    }

    /// Stages of `requested` that are currently enabled, in pipeline order
    pub fn plan(&self, requested: &[StageId]) -> Vec<StageId> {
        StageId::canonical(requested)
            .into_iter()
            .filter(|stage| self.is_enabled(*stage))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ModuleInfo> {
        self.modules
            .read()
            .iter()
            .map(|m| ModuleInfo {
                name: m.stage.module_name().to_string(),
                stage: m.stage,
                enabled: m.enabled,
                progress: m.last_progress.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::from_config(&ModulesConfig::default())
    }
}
