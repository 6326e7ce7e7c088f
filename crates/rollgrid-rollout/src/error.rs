//! Rollout engine error types.

use rollgrid_state::{ActionId, ActionStatus, FilterError, StateError};
use thiserror::Error;

use crate::action::ReportedStatus;

/// Errors raised by rollout, group and action operations.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("quota exceeded: {requested} {kind} requested, limit is {limit}")]
    QuotaExceeded {
        kind: &'static str,
        requested: u64,
        limit: u64,
    },

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("action {action_id}: report '{reported}' is not allowed in status {from}")]
    InvalidTransition {
        action_id: ActionId,
        from: ActionStatus,
        reported: ReportedStatus,
    },

    #[error("action {action_id} is closed with status {status}")]
    ActionClosed {
        action_id: ActionId,
        status: ActionStatus,
    },

    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for RolloutError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict { .. } => RolloutError::Conflict(err.to_string()),
            StateError::Filter(filter) => RolloutError::Validation(format!("target filter: {filter}")),
            other => RolloutError::State(other),
        }
    }
}

impl From<FilterError> for RolloutError {
    fn from(err: FilterError) -> Self {
        RolloutError::Validation(format!("target filter: {err}"))
    }
}

impl RolloutError {
    /// A concurrent writer won; the operation can be retried on fresh state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RolloutError::Conflict(_))
    }

    /// Failures the scheduler picks up again on its next pass.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RolloutError::Conflict(_)
                | RolloutError::State(
                    StateError::Transaction(_) | StateError::Read(_) | StateError::Write(_)
                )
        )
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
