//! rollgrid-scheduler — the periodic rollout driver.
//!
//! Every pass lists the rollouts that may need work and hands each one to
//! [`RolloutManager::process`](rollgrid_rollout::RolloutManager::process).
//! A failing rollout is logged and counted; it never aborts the pass for
//! the others and is picked up again on the next pass.
//!
//! # Architecture
//!
//! ```text
//! RolloutScheduler
//!   ├── tokio loop (sleep(interval) / shutdown watch channel)
//!   └── run_once
//!       ├── StateStore::list_rollouts (non-terminal, not paused)
//!       └── RolloutManager::process (one unit of work per rollout)
//! ```

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{PassReport, RolloutScheduler};
