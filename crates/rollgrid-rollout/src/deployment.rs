//! Deployment manager. Every change of an action's status goes through here.
//!
//! Controller reports ([`DeploymentManager::add_status`]), operator action
//! operations (confirm, cancel, force cancel) and manual assignments are
//! applied in one unit of work together with the log entry and the target's
//! assigned/installed distribution set. The rollout manager reuses the
//! `pub(crate)` unit-of-work helpers so rollout-created actions follow the
//! same rules.

use std::sync::Arc;

use rollgrid_core::{ActionPolicy, GridConfig, Quotas};
use rollgrid_state::{
    Action, ActionId, ActionStatus, ActionStatusEntry, ActionType, Audit, DistributionSet,
    DistributionSetId, GroupId, RolloutId, StateStore, StateView, Target, UnitOfWork,
    UpdateStatus,
};
use tracing::{debug, info, warn};

use crate::action::{self, ReportedStatus};
use crate::clock::Clock;
use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventSink, RolloutEvent};

/// Actor recorded for changes made by the engine itself.
pub const SYSTEM_ACTOR: &str = "system";

/// A status report sent by a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: ReportedStatus,
    pub messages: Vec<String>,
}

impl StatusReport {
    pub fn new(status: ReportedStatus) -> Self {
        Self {
            status,
            messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }
}

/// Parameters of an action about to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub action_type: ActionType,
    pub forced_time: Option<u64>,
    pub rollout_id: Option<RolloutId>,
    pub group_id: Option<GroupId>,
    pub confirmation_required: bool,
}

impl ActionRequest {
    pub fn manual(action_type: ActionType, forced_time: Option<u64>) -> Self {
        Self {
            action_type,
            forced_time,
            rollout_id: None,
            group_id: None,
            confirmation_required: false,
        }
    }
}

enum ReportOutcome {
    Applied(Action),
    /// Closed action; the report was only logged.
    Annotated(Action),
    Rejected { from: ActionStatus },
}

/// Applies controller reports, operator action operations and manual
/// assignments.
#[derive(Clone)]
pub struct DeploymentManager {
    store: StateStore,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    policy: ActionPolicy,
    quotas: Quotas,
}

impl DeploymentManager {
    pub fn new(
        store: StateStore,
        config: &GridConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            policy: config.actions.clone(),
            quotas: config.quota.clone(),
        }
    }

    fn publish(&self, events: Vec<RolloutEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    /// Apply a controller report to an action.
    ///
    /// An illegal report leaves the status unchanged and fails with
    /// [`RolloutError::InvalidTransition`]; its messages are still logged
    /// when `record_rejected_reports` is set. Reports on closed actions are
    /// logged as notes, or rejected with [`RolloutError::ActionClosed`] when
    /// `reject_status_for_closed_actions` is set.
    pub fn add_status(&self, action_id: ActionId, report: StatusReport) -> RolloutResult<Action> {
        let now = self.clock.now_millis();
        let (outcome, events) = self.store.transaction(|uow| {
            let mut events = Vec::new();
            let outcome = self.apply_report(uow, action_id, &report, now, &mut events)?;
            Ok::<_, RolloutError>((outcome, events))
        })?;
        self.publish(events);
        match outcome {
            ReportOutcome::Applied(action) | ReportOutcome::Annotated(action) => Ok(action),
            ReportOutcome::Rejected { from } => Err(RolloutError::InvalidTransition {
                action_id,
                from,
                reported: report.status,
            }),
        }
    }

    fn apply_report(
        &self,
        uow: &UnitOfWork,
        action_id: ActionId,
        report: &StatusReport,
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<ReportOutcome> {
        let mut action = load_action(uow, action_id)?;

        if !action.active {
            if self.policy.reject_status_for_closed_actions {
                return Err(RolloutError::ActionClosed {
                    action_id,
                    status: action.status,
                });
            }
            log_status(uow, &action, action.status, &report.messages, now, true)?;
            debug!(action = action_id, status = %action.status, "report on closed action logged");
            return Ok(ReportOutcome::Annotated(action));
        }

        let from = action.status;
        let Some(to) = action::next_status(from, report.status) else {
            if self.policy.record_rejected_reports {
                log_status(uow, &action, from, &report.messages, now, true)?;
            }
            warn!(
                action = action_id,
                status = %from,
                reported = %report.status,
                "illegal status report rejected"
            );
            return Ok(ReportOutcome::Rejected { from });
        };

        if action::implies_retrieval(from, to) {
            log_status(uow, &action, ActionStatus::Running, &[], now, false)?;
        }
        self.transition(uow, &mut action, to, &report.messages, now, events)?;
        Ok(ReportOutcome::Applied(action))
    }

    /// Confirm an action waiting for confirmation.
    pub fn confirm_action(&self, action_id: ActionId) -> RolloutResult<Action> {
        self.operate(action_id, "confirmed", |action| {
            if action.status == ActionStatus::WaitForConfirmation {
                Ok(ActionStatus::Running)
            } else {
                Err(RolloutError::IllegalState(format!(
                    "action {} is not waiting for confirmation ({})",
                    action.id, action.status
                )))
            }
        })
    }

    /// Ask the controller to cancel; the action stays active until it
    /// acknowledges.
    pub fn cancel_action(&self, action_id: ActionId) -> RolloutResult<Action> {
        self.operate(action_id, "cancel requested", |action| match action.status {
            ActionStatus::Canceling => Err(RolloutError::IllegalState(format!(
                "action {} is already canceling",
                action.id
            ))),
            _ => Ok(ActionStatus::Canceling),
        })
    }

    /// Close the action as canceled without waiting for the controller.
    pub fn force_cancel_action(&self, action_id: ActionId) -> RolloutResult<Action> {
        self.operate(action_id, "force canceled", |_| Ok(ActionStatus::Canceled))
    }

    fn operate<F>(&self, action_id: ActionId, message: &str, decide: F) -> RolloutResult<Action>
    where
        F: FnOnce(&Action) -> RolloutResult<ActionStatus>,
    {
        let now = self.clock.now_millis();
        let (action, events) = self.store.transaction(|uow| {
            let mut action = load_action(uow, action_id)?;
            if !action.active {
                return Err(RolloutError::IllegalState(format!(
                    "action {action_id} is closed ({})",
                    action.status
                )));
            }
            let to = decide(&action)?;
            let mut events = Vec::new();
            self.transition(uow, &mut action, to, &[message.to_string()], now, &mut events)?;
            Ok((action, events))
        })?;
        self.publish(events);
        info!(action = action_id, status = %action.status, "{message}");
        Ok(action)
    }

    /// Assign a distribution set to a target outside of any rollout.
    pub fn assign(
        &self,
        controller_id: &str,
        ds_id: DistributionSetId,
        action_type: ActionType,
        forced_time: Option<u64>,
    ) -> RolloutResult<Action> {
        if action_type == ActionType::TimeForced && forced_time.is_none() {
            return Err(RolloutError::Validation(
                "time forced assignment needs a forced time".to_string(),
            ));
        }
        let now = self.clock.now_millis();
        let (action, events) = self.store.transaction(|uow| {
            let ds = uow
                .get_distribution_set(ds_id)?
                .ok_or_else(|| RolloutError::NotFound(format!("distribution set {ds_id}")))?;
            ensure_assignable(&ds)?;
            let mut target = uow
                .get_target(controller_id)?
                .filter(|t| !t.deleted)
                .ok_or_else(|| RolloutError::NotFound(format!("target {controller_id}")))?;
            let mut events = Vec::new();
            let request = ActionRequest::manual(action_type, forced_time);
            let action = self.create_action(uow, &mut target, ds_id, &request, now, &mut events)?;
            Ok::<_, RolloutError>((action, events))
        })?;
        self.publish(events);
        info!(action = action.id, target = controller_id, ds = ds_id, "distribution set assigned");
        Ok(action)
    }

    /// Create an action for `target`, superseding its older active actions
    /// unless multi-assignments are enabled.
    pub(crate) fn create_action(
        &self,
        uow: &UnitOfWork,
        target: &mut Target,
        ds_id: DistributionSetId,
        request: &ActionRequest,
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<Action> {
        let existing = uow.count_actions_for_target(&target.controller_id)?;
        if existing + 1 > self.quotas.max_actions_per_target {
            return Err(RolloutError::QuotaExceeded {
                kind: "actions per target",
                requested: existing + 1,
                limit: self.quotas.max_actions_per_target,
            });
        }

        if !self.policy.multi_assignments {
            let active = uow
                .actions_for_target(&target.controller_id)?
                .into_iter()
                .filter(|a| a.active);
            for mut old in active {
                self.soft_cancel(uow, &mut old, "superseded by a new assignment", now, events)?;
            }
            // Cancellation may have reverted the target's assignment.
            *target = uow
                .get_target(&target.controller_id)?
                .ok_or_else(|| RolloutError::NotFound(format!("target {}", target.controller_id)))?;
        }

        let status = if request.confirmation_required {
            ActionStatus::WaitForConfirmation
        } else {
            ActionStatus::Scheduled
        };
        let mut action = Action {
            id: 0,
            target_id: target.controller_id.clone(),
            distribution_set_id: ds_id,
            action_type: request.action_type,
            forced_time: request.forced_time,
            status,
            active: true,
            rollout_id: request.rollout_id,
            rollout_group_id: request.group_id,
            revision: 0,
            audit: Audit::new(SYSTEM_ACTOR, now),
        };
        uow.insert_action(&mut action)?;
        log_status(uow, &action, status, &[], now, false)?;

        target.assigned_ds = Some(ds_id);
        target.update_status = UpdateStatus::Pending;
        target.audit.touch(SYSTEM_ACTOR, now);
        uow.update_target(target)?;

        debug!(
            action = action.id,
            target = %action.target_id,
            ds = ds_id,
            rollout = ?request.rollout_id,
            "action created"
        );
        Ok(action)
    }

    /// Cancel an active action the gentle way: never-retrieved actions are
    /// closed at once, running ones move to `Canceling`.
    pub(crate) fn soft_cancel(
        &self,
        uow: &UnitOfWork,
        action: &mut Action,
        message: &str,
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<()> {
        if !action.active {
            return Ok(());
        }
        let to = if action.status.is_waiting() {
            ActionStatus::Canceled
        } else if action.status.is_running_family() {
            ActionStatus::Canceling
        } else {
            return Ok(());
        };
        self.transition(uow, action, to, &[message.to_string()], now, events)
    }

    /// The single place where an action's status changes.
    fn transition(
        &self,
        uow: &UnitOfWork,
        action: &mut Action,
        to: ActionStatus,
        messages: &[String],
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<()> {
        let from = action.status;
        action.status = to;
        if action::closes(to, action.action_type) {
            action.active = false;
        }
        action.audit.touch(SYSTEM_ACTOR, now);
        uow.update_action(action)?;
        log_status(uow, action, to, messages, now, false)?;
        update_target(uow, action, now)?;

        debug!(action = action.id, target = %action.target_id, %from, %to, "action status changed");
        events.push(RolloutEvent::ActionStatusChanged {
            action: action.id,
            target: action.target_id.clone(),
            from,
            to,
        });
        Ok(())
    }
}

/// Reject distribution sets that may not be assigned.
pub(crate) fn ensure_assignable(ds: &DistributionSet) -> RolloutResult<()> {
    if ds.deleted {
        return Err(RolloutError::Validation(format!(
            "distribution set {} is deleted",
            ds.id
        )));
    }
    if !ds.valid {
        return Err(RolloutError::Validation(format!(
            "distribution set {} is invalidated",
            ds.id
        )));
    }
    let missing = ds.missing_module_types();
    if !missing.is_empty() {
        return Err(RolloutError::Validation(format!(
            "distribution set {} is incomplete, missing module types: {}",
            ds.id,
            missing.join(", ")
        )));
    }
    Ok(())
}

fn load_action(uow: &UnitOfWork, action_id: ActionId) -> RolloutResult<Action> {
    uow.get_action(action_id)?
        .ok_or_else(|| RolloutError::NotFound(format!("action {action_id}")))
}

fn log_status(
    uow: &UnitOfWork,
    action: &Action,
    status: ActionStatus,
    messages: &[String],
    now: u64,
    informational: bool,
) -> RolloutResult<()> {
    uow.append_status(&ActionStatusEntry {
        action_id: action.id,
        status,
        messages: messages.to_vec(),
        occurred_at: now,
        informational,
    })?;
    Ok(())
}

/// Reflect the action's new status on its target.
fn update_target(uow: &UnitOfWork, action: &Action, now: u64) -> RolloutResult<()> {
    let Some(mut target) = uow.get_target(&action.target_id)? else {
        warn!(action = action.id, target = %action.target_id, "action target is gone");
        return Ok(());
    };
    let ds = action.distribution_set_id;
    match action.status {
        ActionStatus::Finished => {
            target.installed_ds = Some(ds);
            target.update_status = if target.assigned_ds == target.installed_ds {
                UpdateStatus::InSync
            } else {
                UpdateStatus::Pending
            };
        }
        ActionStatus::Error => target.update_status = UpdateStatus::Error,
        // A canceled assignment, or a closed download-only one, leaves the
        // installed set in place.
        ActionStatus::Canceled | ActionStatus::Downloaded
            if !action.active && target.assigned_ds == Some(ds) =>
        {
            target.assigned_ds = target.installed_ds;
            target.update_status = if target.installed_ds.is_some() {
                UpdateStatus::InSync
            } else {
                UpdateStatus::Registered
            };
        }
        _ => return Ok(()),
    }
    target.audit.touch(SYSTEM_ACTOR, now);
    uow.update_target(&mut target)?;
    Ok(())
}
