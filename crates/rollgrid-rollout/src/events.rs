//! Lifecycle events emitted after a unit of work commits.
//!
//! Delivery is fire-and-forget: a sink never blocks or fails the transition
//! that produced the event.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use rollgrid_state::{ActionId, ActionStatus, GroupId, RolloutId, TargetId};

/// Why a rollout was paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Operator,
    GroupError,
    GroupSuccess,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RolloutEvent {
    RolloutCreated {
        rollout: RolloutId,
        name: String,
    },
    RolloutReady {
        rollout: RolloutId,
        total_targets: u64,
    },
    RolloutApprovalRequested {
        rollout: RolloutId,
    },
    RolloutStarted {
        rollout: RolloutId,
    },
    GroupStarted {
        rollout: RolloutId,
        group: GroupId,
        index: u32,
        actions: u64,
    },
    GroupFinished {
        rollout: RolloutId,
        group: GroupId,
        index: u32,
    },
    GroupErrored {
        rollout: RolloutId,
        group: GroupId,
        index: u32,
    },
    RolloutPaused {
        rollout: RolloutId,
        reason: PauseReason,
    },
    RolloutResumed {
        rollout: RolloutId,
    },
    RolloutFinished {
        rollout: RolloutId,
    },
    RolloutStopped {
        rollout: RolloutId,
    },
    RolloutDeleted {
        rollout: RolloutId,
        hard: bool,
    },
    ActionStatusChanged {
        action: ActionId,
        target: TargetId,
        from: ActionStatus,
        to: ActionStatus,
    },
}

/// Receives lifecycle events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: RolloutEvent);
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: RolloutEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(event = %json, "rollout event"),
            Err(e) => debug!(error = %e, ?event, "rollout event not serializable"),
        }
    }
}

/// Fans events out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<RolloutEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: RolloutEvent) {
        // No subscribers is not an error.
        if self.sender.send(event).is_err() {
            debug!("rollout event dropped, no subscribers");
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: RolloutEvent) {}
}
