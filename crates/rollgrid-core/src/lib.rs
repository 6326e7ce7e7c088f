//! rollgrid-core — configuration shared by every rollgrid crate.
//!
//! The daemon reads a `rollgrid.toml`; every section is optional and falls
//! back to the defaults documented on each struct.

pub mod config;

pub use config::{
    ActionPolicy, ConfigError, GridConfig, Quotas, RolloutPolicy, SchedulerConfig,
};
