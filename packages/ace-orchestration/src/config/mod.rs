//! ACE configuration
//!
//! One YAML document (schema `version: 1`), loaded once at startup and shared
//! by `Arc`. Every section has defaults, so a file containing only
//! `version: 1` is valid.
//!
//! ```yaml
//! version: 1
//! refinement:
//!   clarity_threshold: 70
//!   max_recursion: 3
//!   elicitation_timeout_ms: 30000
//! queue:
//!   max_retries: 3
//! workers:
//!   count: 4
//! modules:
//!   summary: false
//! ```

pub mod error;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::session::StageId;

pub use error::{ConfigError, ConfigResult};

/// Supported schema versions
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AceConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,

    #[serde(default)]
    pub refinement: RefinementConfig,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub workers: WorkerSettings,

    #[serde(default)]
    pub modules: ModulesConfig,

    #[serde(default)]
    pub store: StoreSettings,
}

impl Default for AceConfig {
    fn default() -> Self {
        Self {
            version: 1,
            refinement: RefinementConfig::default(),
            queue: QueueSettings::default(),
            workers: WorkerSettings::default(),
            modules: ModulesConfig::default(),
            store: StoreSettings::default(),
        }
    }
}

impl AceConfig {
    /// Load and validate a YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        // Version gate runs before the typed parse
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;
        match raw.get("version").and_then(|v| v.as_u64()) {
            None => return Err(ConfigError::MissingVersion),
            Some(found) if !SUPPORTED_VERSIONS.contains(&(found as u32)) => {
                return Err(ConfigError::UnsupportedVersion {
                    found: found as u32,
                    supported: SUPPORTED_VERSIONS.to_vec(),
                })
            }
            Some(_) => {}
        }

        let config: AceConfig = serde_yaml::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.refinement.validate()?;
        self.queue.validate()?;
        self.workers.validate()?;
        self.store.validate()?;
        Ok(())
    }
}

/// Refinement loop parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RefinementConfig {
    /// Context-clarity score that ends elicitation (1..=100)
    pub clarity_threshold: u8,

    /// Elicitation rounds per stage attempt (0..=16)
    pub max_recursion: u32,

    /// Upper bound for one clarifier call
    pub elicitation_timeout_ms: u64,

    /// Store directory the store-backed clarifier reads answers from
    pub context_root: String,

    pub weights: ScoreWeights,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            clarity_threshold: 70,
            max_recursion: 3,
            elicitation_timeout_ms: 30_000,
            context_root: "/context".to_string(),
            weights: ScoreWeights::default(),
        }
    }
}

impl RefinementConfig {
    pub fn elicitation_timeout(&self) -> Duration {
        Duration::from_millis(self.elicitation_timeout_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.clarity_threshold == 0 || self.clarity_threshold > 100 {
            return Err(ConfigError::out_of_range(
                "refinement.clarity_threshold",
                self.clarity_threshold,
                1..=100,
                "Clarity scores are percentages; 0 would never trigger elicitation",
            ));
        }

        if self.max_recursion > 16 {
            return Err(ConfigError::out_of_range(
                "refinement.max_recursion",
                self.max_recursion,
                0..=16,
                "Each round may wait a full elicitation timeout",
            ));
        }

        if self.elicitation_timeout_ms == 0 || self.elicitation_timeout_ms > 600_000 {
            return Err(ConfigError::out_of_range(
                "refinement.elicitation_timeout_ms",
                self.elicitation_timeout_ms,
                1..=600_000,
                "Elicitation timeout must be positive and at most 10 minutes",
            ));
        }

        if !self.context_root.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "refinement.context_root".to_string(),
                reason: format!("must be an absolute store path, got '{}'", self.context_root),
            });
        }

        self.weights.validate()
    }
}

/// Sub-measure weights for the final stage score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScoreWeights {
    pub priming: u32,
    pub comprehension: u32,
    pub context_clarity: u32,
    pub elicitation_depth: u32,
    pub recursion: u32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            priming: 10,
            comprehension: 35,
            context_clarity: 30,
            elicitation_depth: 15,
            recursion: 10,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> u32 {
        self.priming + self.comprehension + self.context_clarity + self.elicitation_depth + self.recursion
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (field, value) in [
            ("priming", self.priming),
            ("comprehension", self.comprehension),
            ("context_clarity", self.context_clarity),
            ("elicitation_depth", self.elicitation_depth),
            ("recursion", self.recursion),
        ] {
            if value > 1000 {
                return Err(ConfigError::out_of_range(
                    format!("refinement.weights.{}", field),
                    value,
                    0..=1000,
                    "Weights are relative; keep them small",
                ));
            }
        }
        if self.total() == 0 {
            return Err(ConfigError::Invalid {
                field: "refinement.weights".to_string(),
                reason: "must not all be zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Processing queue retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueSettings {
    /// Requeues before an entry is dead-lettered
    pub max_retries: u32,

    /// Backoff base; the n-th retry waits `base * 2^n`
    pub retry_base_delay_ms: u64,

    /// Periodic wake for blocked dequeues
    pub wake_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 2_000,
            wake_interval_ms: 500,
        }
    }
}

impl QueueSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_retries > 32 {
            return Err(ConfigError::out_of_range(
                "queue.max_retries",
                self.max_retries,
                0..=32,
                "Backoff doubles per retry",
            ));
        }
        if self.wake_interval_ms == 0 || self.wake_interval_ms > 60_000 {
            return Err(ConfigError::out_of_range(
                "queue.wake_interval_ms",
                self.wake_interval_ms,
                1..=60_000,
                "Idle workers must wake up periodically",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerSettings {
    /// Worker pool size (1..=256)
    pub count: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { count: 4 }
    }
}

impl WorkerSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.count == 0 || self.count > 256 {
            return Err(ConfigError::out_of_range(
                "workers.count",
                self.count,
                1..=256,
                "At least one worker is required to drain the queue",
            ));
        }
        Ok(())
    }
}

/// Module switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModulesConfig {
    pub formatting: bool,
    pub contextual_repair: bool,
    pub summary: bool,
    pub pipeline_integration: bool,
    pub validation: bool,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            formatting: true,
            contextual_repair: true,
            summary: true,
            pipeline_integration: true,
            validation: true,
        }
    }
}

impl ModulesConfig {
    pub fn is_enabled(&self, stage: StageId) -> bool {
        match stage {
            StageId::Formatting => self.formatting,
            StageId::ContextualRepair => self.contextual_repair,
            StageId::Summary => self.summary,
            StageId::PipelineIntegration => self.pipeline_integration,
            StageId::Validation => self.validation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreSettings {
    /// Upper bound for mounted content
    pub max_artifact_bytes: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_artifact_bytes: 8 * 1024 * 1024,
        }
    }
}

impl StoreSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_artifact_bytes == 0 {
            return Err(ConfigError::out_of_range(
                "store.max_artifact_bytes",
                self.max_artifact_bytes,
                1..=usize::MAX,
                "Mounted artifacts could never be read",
            ));
        }
        Ok(())
    }

    pub fn store_config(&self) -> holofs_store::StoreConfig {
        holofs_store::StoreConfig {
            max_artifact_bytes: self.max_artifact_bytes,
        }
    }
}
