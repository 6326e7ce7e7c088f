//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during a scheduler pass.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] rollgrid_state::StateError),

    #[error("rollout error: {0}")]
    Rollout(#[from] rollgrid_rollout::RolloutError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
