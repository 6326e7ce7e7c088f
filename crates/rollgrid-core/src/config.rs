//! rollgrid.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub scheduler: SchedulerConfig,
    pub quota: Quotas,
    pub actions: ActionPolicy,
    pub rollout: RolloutPolicy,
}

/// Timing of the periodic rollout scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fixed delay between two scheduler passes.
    pub interval_ms: u64,
    /// Minimum time between two evaluations of the same rollout.
    pub delay_between_checks_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            delay_between_checks_ms: 2_000,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configured limits enforced by the partitioner and action creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quotas {
    pub max_groups_per_rollout: u32,
    pub max_targets_per_group: u64,
    pub max_actions_per_target: u64,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            max_groups_per_rollout: 500,
            max_targets_per_group: 20_000,
            max_actions_per_target: 400,
        }
    }
}

/// How controller reports and new assignments are treated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionPolicy {
    /// Reject reports for closed actions instead of recording them as notes.
    pub reject_status_for_closed_actions: bool,
    /// Keep the messages of an illegal report in the action log.
    pub record_rejected_reports: bool,
    /// Allow more than one active action per target.
    pub multi_assignments: bool,
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self {
            reject_status_for_closed_actions: false,
            record_rejected_reports: true,
            multi_assignments: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutPolicy {
    /// Populated rollouts wait for an approval decision before READY.
    pub approval_required: bool,
    /// Page size used when resolving target filters.
    pub selection_page_size: usize,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            approval_required: false,
            selection_page_size: 5_000,
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make every rollout fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.quota.max_groups_per_rollout == 0 {
            return Err(ConfigError::Invalid(
                "quota.max_groups_per_rollout must be greater than zero".to_string(),
            ));
        }
        if self.quota.max_targets_per_group == 0 {
            return Err(ConfigError::Invalid(
                "quota.max_targets_per_group must be greater than zero".to_string(),
            ));
        }
        if self.quota.max_actions_per_target == 0 {
            return Err(ConfigError::Invalid(
                "quota.max_actions_per_target must be greater than zero".to_string(),
            ));
        }
        if self.rollout.selection_page_size == 0 {
            return Err(ConfigError::Invalid(
                "rollout.selection_page_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
