//! rollgrid rollouts — staged distribution-set deployment to target fleets.
//!
//! A rollout takes the targets matched by a filter, splits them into
//! ordered groups and deploys a distribution set group by group. Each group
//! has a success and an error threshold; crossing one moves the rollout on
//! to the next group or pauses it. Device reports drive the per-target
//! action state machine.
//!
//! # Components
//!
//! - **`strategy`**: Rollout requests and group definitions (count or explicit)
//! - **`partition`**: Splits the filtered targets into disjoint groups
//! - **`evaluator`**: Group counts and success/error thresholds
//! - **`action`**: Action status transitions driven by controller reports
//! - **`deployment`**: Action persistence, cancellation and manual assignment
//! - **`controller`**: Rollout state machine (create, start, pause, stop, delete, process)
//! - **`events`**: Lifecycle events published after each commit
//! - **`clock`**: Time source, swappable in tests

pub mod action;
pub mod clock;
pub mod controller;
pub mod deployment;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod partition;
pub mod strategy;

pub use action::ReportedStatus;
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{ApprovalDecision, ProcessOutcome, RolloutManager};
pub use deployment::{ActionRequest, DeploymentManager, StatusReport, SYSTEM_ACTOR};
pub use error::{RolloutError, RolloutResult};
pub use evaluator::{GroupCounts, Verdict};
pub use events::{BroadcastSink, EventSink, LogSink, NullSink, PauseReason, RolloutEvent};
pub use strategy::{GroupCreate, GroupDefinition, RolloutCreate};
