//! Rollout manager: drives the rollout state machine.
//!
//! Operator operations (start, pause, resume, approve, stop, delete, trigger
//! next group) check the current status and apply their transition in one
//! unit of work. [`RolloutManager::process`] is the scheduler's entry point:
//! it evaluates one rollout, gated by `last_check`, and commits every
//! transition together with the new `last_check`. A unit of work that finds
//! the rollout at a newer revision than the caller saw fails with a
//! conflict and changes nothing.

use std::sync::Arc;

use rollgrid_core::GridConfig;
use rollgrid_state::{
    Action, ActionStatus, Audit, DistributionSetId, GroupId, Rollout, RolloutGroup,
    RolloutGroupStatus, RolloutId, RolloutStatus, StateStore, StateView, SuccessAction,
    TargetFilter, UnitOfWork,
};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::deployment::{self, ActionRequest, DeploymentManager, SYSTEM_ACTOR};
use crate::error::{RolloutError, RolloutResult};
use crate::evaluator::{self, GroupCounts, Verdict};
use crate::events::{EventSink, PauseReason, RolloutEvent};
use crate::partition;
use crate::strategy::RolloutCreate;

/// Outcome of an approval review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

/// What one [`RolloutManager::process`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The handler for the rollout's status ran; carries the resulting status.
    Processed(RolloutStatus),
    /// Evaluated too recently.
    NotDue,
    /// Nothing to do in the current status.
    Skipped,
    /// The rollout never created actions and was removed.
    Purged,
}

/// Creates rollouts and drives them through their lifecycle.
#[derive(Clone)]
pub struct RolloutManager {
    store: StateStore,
    config: GridConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    deployments: DeploymentManager,
}

impl RolloutManager {
    pub fn new(
        store: StateStore,
        config: GridConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let deployments =
            DeploymentManager::new(store.clone(), &config, clock.clone(), events.clone());
        Self {
            store,
            config,
            clock,
            events,
            deployments,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Action operations sharing this manager's store, clock and events.
    pub fn deployments(&self) -> &DeploymentManager {
        &self.deployments
    }

    fn publish(&self, events: Vec<RolloutEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Validate, persist and partition a new rollout.
    ///
    /// Returns the rollout in `Ready` (or `WaitingForApproval`). When
    /// partitioning fails half way, the error is recorded on the rollout,
    /// which stays in `Creating` with its completed groups.
    pub fn create(&self, request: RolloutCreate) -> RolloutResult<Rollout> {
        let now = self.clock.now_millis();
        let plans = request.plan_groups(&self.config.quota)?;
        let base = TargetFilter::parse(&request.target_filter)?;

        let snapshot = self.store.snapshot()?;
        let ds = snapshot
            .get_distribution_set(request.distribution_set_id)?
            .ok_or_else(|| {
                RolloutError::NotFound(format!(
                    "distribution set {}",
                    request.distribution_set_id
                ))
            })?;
        deployment::ensure_assignable(&ds)?;
        let sizes = partition::dry_run(
            &snapshot,
            &base,
            &plans,
            now,
            self.config.rollout.selection_page_size,
        )?;
        for size in &sizes {
            partition::check_group_quota(*size, self.config.quota.max_targets_per_group)?;
        }
        drop(snapshot);

        let rollout = self.store.transaction(|uow| {
            let mut rollout = Rollout {
                id: 0,
                name: request.name.clone(),
                description: request.description.clone(),
                target_filter: request.target_filter.clone(),
                distribution_set_id: request.distribution_set_id,
                action_type: request.action_type,
                forced_time: request.forced_time,
                start_at: request.start_at,
                status: RolloutStatus::Creating,
                total_targets: 0,
                group_count: plans.len() as u32,
                rollout_groups_created: 0,
                last_check: 0,
                creation_error: None,
                approval_remark: None,
                approval_decided_by: None,
                deleted: false,
                revision: 0,
                audit: Audit::new(&request.created_by, now),
            };
            uow.insert_rollout(&mut rollout)?;

            let mut parent_id = None;
            for (index, plan) in plans.iter().enumerate() {
                let mut group = RolloutGroup {
                    id: 0,
                    rollout_id: rollout.id,
                    index: index as u32,
                    name: plan.name.clone(),
                    description: plan.description.clone(),
                    status: RolloutGroupStatus::Creating,
                    parent_id,
                    target_filter: plan.target_filter.clone(),
                    target_percentage: plan.target_percentage,
                    conditions: plan.conditions,
                    confirmation_required: plan.confirmation_required,
                    total_targets: 0,
                    revision: 0,
                    audit: Audit::new(&request.created_by, now),
                };
                uow.insert_group(&mut group)?;
                parent_id = Some(group.id);
            }
            Ok::<_, RolloutError>(rollout)
        })?;

        info!(
            rollout = rollout.id,
            name = %rollout.name,
            groups = rollout.group_count,
            ds = rollout.distribution_set_id,
            "rollout created"
        );
        self.events.publish(RolloutEvent::RolloutCreated {
            rollout: rollout.id,
            name: rollout.name.clone(),
        });
        self.populate(rollout)
    }

    /// Fill the remaining groups, one unit of work per group.
    fn populate(&self, mut rollout: Rollout) -> RolloutResult<Rollout> {
        while rollout.status == RolloutStatus::Creating
            && rollout.rollout_groups_created < rollout.group_count
        {
            let now = self.clock.now_millis();
            let result = self.store.transaction(|uow| {
                let mut current = load_expected(uow, &rollout)?;
                let mut events = Vec::new();
                self.populate_next_group(uow, &mut current, now, &mut events)?;
                Ok::<_, RolloutError>((current, events))
            });
            match result {
                Ok((next, events)) => {
                    self.publish(events);
                    rollout = next;
                }
                Err(err) if err.is_conflict() => return Err(err),
                Err(err) => {
                    self.record_creation_error(rollout.id, &err)?;
                    return Err(err);
                }
            }
        }
        Ok(rollout)
    }

    fn populate_next_group(
        &self,
        uow: &UnitOfWork,
        rollout: &mut Rollout,
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<()> {
        let index = rollout.rollout_groups_created;
        let mut group = uow
            .list_groups(rollout.id)?
            .into_iter()
            .find(|g| g.index == index)
            .ok_or_else(|| {
                RolloutError::NotFound(format!("group {index} of rollout {}", rollout.id))
            })?;

        let size = partition::populate_group(
            uow,
            rollout,
            &group,
            self.config.rollout.selection_page_size,
            self.config.quota.max_targets_per_group,
        )?;
        group.total_targets = size;
        group.status = RolloutGroupStatus::Ready;
        group.audit.touch(SYSTEM_ACTOR, now);
        uow.update_group(&mut group)?;

        rollout.rollout_groups_created += 1;
        rollout.total_targets += size;
        debug!(rollout = rollout.id, group = group.id, index, targets = size, "group populated");

        if rollout.rollout_groups_created == rollout.group_count {
            if self.config.rollout.approval_required {
                rollout.status = RolloutStatus::WaitingForApproval;
                events.push(RolloutEvent::RolloutApprovalRequested {
                    rollout: rollout.id,
                });
            } else {
                rollout.status = RolloutStatus::Ready;
                events.push(RolloutEvent::RolloutReady {
                    rollout: rollout.id,
                    total_targets: rollout.total_targets,
                });
            }
            info!(
                rollout = rollout.id,
                targets = rollout.total_targets,
                status = %rollout.status,
                "rollout partitioned"
            );
        }
        rollout.audit.touch(SYSTEM_ACTOR, now);
        uow.update_rollout(rollout)?;
        Ok(())
    }

    fn record_creation_error(&self, id: RolloutId, err: &RolloutError) -> RolloutResult<()> {
        self.store.transaction(|uow| {
            let mut rollout = load(uow, id)?;
            rollout.creation_error = Some(err.to_string());
            uow.update_rollout(&mut rollout)?;
            Ok::<_, RolloutError>(())
        })?;
        warn!(rollout = id, error = %err, "rollout creation failed");
        Ok(())
    }

    // ── Operator operations ────────────────────────────────────────

    /// Load the rollout, let `op` change it, and store it, all in one unit
    /// of work.
    fn modify<F>(&self, id: RolloutId, op: F) -> RolloutResult<Rollout>
    where
        F: FnOnce(&UnitOfWork, &mut Rollout, u64, &mut Vec<RolloutEvent>) -> RolloutResult<()>,
    {
        let now = self.clock.now_millis();
        let (rollout, events) = self.store.transaction(|uow| {
            let mut rollout = load(uow, id)?;
            let mut events = Vec::new();
            op(uow, &mut rollout, now, &mut events)?;
            rollout.audit.touch(SYSTEM_ACTOR, now);
            uow.update_rollout(&mut rollout)?;
            Ok::<_, RolloutError>((rollout, events))
        })?;
        self.publish(events);
        Ok(rollout)
    }

    /// Start a `Ready` rollout; the next scheduler pass launches the first group.
    pub fn start(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.modify(id, |_, rollout, _, _| {
            require(rollout, &[RolloutStatus::Ready], "start")?;
            rollout.status = RolloutStatus::Starting;
            rollout.last_check = 0;
            info!(rollout = id, "rollout starting");
            Ok(())
        })
    }

    pub fn pause(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.modify(id, |_, rollout, _, events| {
            require(rollout, &[RolloutStatus::Running], "pause")?;
            rollout.status = RolloutStatus::Paused;
            events.push(RolloutEvent::RolloutPaused {
                rollout: id,
                reason: PauseReason::Operator,
            });
            info!(rollout = id, "rollout paused");
            Ok(())
        })
    }

    pub fn resume(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.modify(id, |_, rollout, _, events| {
            require(rollout, &[RolloutStatus::Paused], "resume")?;
            rollout.status = RolloutStatus::Running;
            rollout.last_check = 0;
            events.push(RolloutEvent::RolloutResumed { rollout: id });
            info!(rollout = id, "rollout resumed");
            Ok(())
        })
    }

    pub fn approve(
        &self,
        id: RolloutId,
        decision: ApprovalDecision,
        remark: Option<String>,
        actor: &str,
    ) -> RolloutResult<Rollout> {
        self.modify(id, |_, rollout, _, events| {
            require(rollout, &[RolloutStatus::WaitingForApproval], "approve")?;
            rollout.approval_remark = remark;
            rollout.approval_decided_by = Some(actor.to_string());
            match decision {
                ApprovalDecision::Approved => {
                    rollout.status = RolloutStatus::Ready;
                    events.push(RolloutEvent::RolloutReady {
                        rollout: id,
                        total_targets: rollout.total_targets,
                    });
                }
                ApprovalDecision::Denied => rollout.status = RolloutStatus::ApprovalDenied,
            }
            info!(rollout = id, ?decision, actor, "rollout approval decided");
            Ok(())
        })
    }

    /// Stop the rollout. Open actions are canceled by the next scheduler pass.
    pub fn stop(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.modify(id, |_, rollout, _, _| {
            if !rollout.status.is_stoppable() {
                return Err(illegal(rollout, "stop"));
            }
            rollout.status = RolloutStatus::Stopping;
            rollout.last_check = 0;
            info!(rollout = id, "rollout stopping");
            Ok(())
        })
    }

    /// Mark the rollout for deletion; a scheduler pass does the work.
    pub fn delete(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.modify(id, |_, rollout, _, _| {
            match rollout.status {
                RolloutStatus::Deleting => return Ok(()),
                RolloutStatus::Deleted => return Err(illegal(rollout, "delete")),
                _ => {}
            }
            rollout.status = RolloutStatus::Deleting;
            rollout.last_check = 0;
            info!(rollout = id, "rollout deleting");
            Ok(())
        })
    }

    /// Finish the running group now and start the next scheduled one,
    /// regardless of the running group's success condition.
    pub fn trigger_next_group(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.modify(id, |uow, rollout, now, events| {
            require(rollout, &[RolloutStatus::Running], "trigger the next group of")?;
            let groups = uow.list_groups(id)?;
            let Some(mut next) = groups
                .iter()
                .find(|g| g.status == RolloutGroupStatus::Scheduled)
                .cloned()
            else {
                return Err(RolloutError::IllegalState(format!(
                    "rollout {id} has no scheduled group left"
                )));
            };
            for mut group in groups
                .into_iter()
                .filter(|g| g.status == RolloutGroupStatus::Running)
            {
                finish_group(uow, &mut group, now, events)?;
            }
            self.start_group(uow, rollout, &mut next, now, events)?;
            info!(rollout = id, group = next.id, index = next.index, "next group triggered");
            Ok(())
        })
    }

    /// Invalidate a distribution set and stop every rollout still using it.
    /// Returns the ids of the rollouts that were stopped.
    pub fn invalidate_distribution_set(
        &self,
        ds_id: DistributionSetId,
    ) -> RolloutResult<Vec<RolloutId>> {
        let now = self.clock.now_millis();
        let stopped = self.store.transaction(|uow| {
            let mut ds = uow
                .get_distribution_set(ds_id)?
                .ok_or_else(|| RolloutError::NotFound(format!("distribution set {ds_id}")))?;
            ds.valid = false;
            ds.audit.touch(SYSTEM_ACTOR, now);
            uow.update_distribution_set(&ds)?;

            let mut stopped = Vec::new();
            for mut rollout in uow.list_rollouts()? {
                if rollout.distribution_set_id != ds_id || !rollout.status.is_stoppable() {
                    continue;
                }
                rollout.status = RolloutStatus::Stopping;
                rollout.last_check = 0;
                rollout.audit.touch(SYSTEM_ACTOR, now);
                uow.update_rollout(&mut rollout)?;
                stopped.push(rollout.id);
            }
            Ok::<_, RolloutError>(stopped)
        })?;
        info!(ds = ds_id, rollouts = ?stopped, "distribution set invalidated");
        Ok(stopped)
    }

    /// Current action counts of a group.
    pub fn group_counts(&self, group_id: GroupId) -> RolloutResult<GroupCounts> {
        let snapshot = self.store.snapshot()?;
        let group = snapshot
            .get_group(group_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout group {group_id}")))?;
        Ok(GroupCounts::collect(&snapshot, &group)?)
    }

    // ── Scheduler entry point ──────────────────────────────────────

    pub fn process_by_id(&self, id: RolloutId) -> RolloutResult<ProcessOutcome> {
        let rollout = self
            .store
            .get_rollout(id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {id}")))?;
        self.process(&rollout)
    }

    /// Evaluate one rollout as seen by the caller.
    ///
    /// Fails with [`RolloutError::Conflict`] when the stored rollout moved
    /// past `rollout.revision`; nothing is written in that case.
    pub fn process(&self, rollout: &Rollout) -> RolloutResult<ProcessOutcome> {
        let now = self.clock.now_millis();
        match rollout.status {
            status if status.is_terminal() => return Ok(ProcessOutcome::Skipped),
            RolloutStatus::Paused | RolloutStatus::WaitingForApproval => {
                return Ok(ProcessOutcome::Skipped);
            }
            RolloutStatus::Creating if rollout.creation_error.is_some() => {
                return Ok(ProcessOutcome::Skipped);
            }
            _ => {}
        }
        if now.saturating_sub(rollout.last_check) < self.config.scheduler.delay_between_checks_ms {
            return Ok(ProcessOutcome::NotDue);
        }

        match rollout.status {
            // Resume a partition interrupted by a restart.
            RolloutStatus::Creating => {
                let populated = self.populate(rollout.clone())?;
                return Ok(ProcessOutcome::Processed(populated.status));
            }
            RolloutStatus::Ready if !rollout.start_at.is_some_and(|at| at <= now) => {
                return Ok(ProcessOutcome::Skipped);
            }
            _ => {}
        }

        let (outcome, events) = self.store.transaction(|uow| -> RolloutResult<_> {
            let mut current = load_expected(uow, rollout)?;
            let mut events = Vec::new();
            let mut last_check = now;
            match current.status {
                RolloutStatus::Ready => {
                    current.status = RolloutStatus::Starting;
                    last_check = 0;
                    info!(rollout = current.id, "scheduled start reached");
                }
                RolloutStatus::Starting => self.handle_starting(uow, &mut current, now, &mut events)?,
                RolloutStatus::Running => self.handle_running(uow, &mut current, now, &mut events)?,
                RolloutStatus::Stopping => self.handle_stopping(uow, &mut current, now, &mut events)?,
                RolloutStatus::Deleting => {
                    if self.handle_deleting(uow, &mut current, now, &mut events)? {
                        return Ok((ProcessOutcome::Purged, events));
                    }
                }
                other => {
                    return Err(RolloutError::IllegalState(format!(
                        "rollout {} cannot be processed in status {other}",
                        current.id
                    )));
                }
            }
            current.last_check = last_check;
            current.audit.touch(SYSTEM_ACTOR, now);
            uow.update_rollout(&mut current)?;
            Ok((ProcessOutcome::Processed(current.status), events))
        })?;
        self.publish(events);
        Ok(outcome)
    }

    fn handle_starting(
        &self,
        uow: &UnitOfWork,
        rollout: &mut Rollout,
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<()> {
        rollout.status = RolloutStatus::Running;
        events.push(RolloutEvent::RolloutStarted {
            rollout: rollout.id,
        });
        info!(rollout = rollout.id, groups = rollout.group_count, "rollout started");

        let mut groups = uow.list_groups(rollout.id)?.into_iter();
        if let Some(mut first) = groups.next() {
            self.start_group(uow, rollout, &mut first, now, events)?;
        }
        for mut group in groups {
            group.status = RolloutGroupStatus::Scheduled;
            group.audit.touch(SYSTEM_ACTOR, now);
            uow.update_group(&mut group)?;
        }
        self.handle_running(uow, rollout, now, events)
    }

    /// Evaluate the running group and move on as far as the results allow:
    /// several empty or already up-to-date groups can finish in one pass.
    fn handle_running(
        &self,
        uow: &UnitOfWork,
        rollout: &mut Rollout,
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<()> {
        loop {
            let groups = uow.list_groups(rollout.id)?;
            let has_scheduled = groups
                .iter()
                .any(|g| g.status == RolloutGroupStatus::Scheduled);
            let Some(mut group) = groups
                .iter()
                .find(|g| g.status == RolloutGroupStatus::Running)
                .cloned()
            else {
                if let Some(mut next) = groups
                    .into_iter()
                    .find(|g| g.status == RolloutGroupStatus::Scheduled)
                {
                    self.start_group(uow, rollout, &mut next, now, events)?;
                    continue;
                }
                rollout.status = RolloutStatus::Finished;
                events.push(RolloutEvent::RolloutFinished {
                    rollout: rollout.id,
                });
                info!(rollout = rollout.id, targets = rollout.total_targets, "rollout finished");
                return Ok(());
            };

            let counts = GroupCounts::collect(uow, &group)?;
            match evaluator::evaluate(&group.conditions, &counts) {
                Verdict::Pending => {
                    debug!(rollout = rollout.id, group = group.id, ?counts, "group still running");
                    return Ok(());
                }
                Verdict::Error => {
                    group.status = RolloutGroupStatus::Error;
                    group.audit.touch(SYSTEM_ACTOR, now);
                    uow.update_group(&mut group)?;
                    rollout.status = RolloutStatus::Paused;
                    events.push(RolloutEvent::GroupErrored {
                        rollout: rollout.id,
                        group: group.id,
                        index: group.index,
                    });
                    events.push(RolloutEvent::RolloutPaused {
                        rollout: rollout.id,
                        reason: PauseReason::GroupError,
                    });
                    warn!(
                        rollout = rollout.id,
                        group = group.id,
                        errors = counts.error,
                        total = counts.total,
                        "group error threshold reached, rollout paused"
                    );
                    return Ok(());
                }
                Verdict::Success => {
                    finish_group(uow, &mut group, now, events)?;
                    if group.conditions.success_action == SuccessAction::Pause && has_scheduled {
                        rollout.status = RolloutStatus::Paused;
                        events.push(RolloutEvent::RolloutPaused {
                            rollout: rollout.id,
                            reason: PauseReason::GroupSuccess,
                        });
                        info!(rollout = rollout.id, group = group.id, "rollout paused after group");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Create the group's actions and mark it running. Targets that already
    /// run the set are counted as in sync; vanished targets leave the group.
    fn start_group(
        &self,
        uow: &UnitOfWork,
        rollout: &Rollout,
        group: &mut RolloutGroup,
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<()> {
        let request = ActionRequest {
            action_type: rollout.action_type,
            forced_time: rollout.forced_time,
            rollout_id: Some(rollout.id),
            group_id: Some(group.id),
            confirmation_required: group.confirmation_required,
        };
        let (mut created, mut in_sync, mut missing) = (0u64, 0u64, 0u64);
        for mut member in uow.members_of_group(group.id)? {
            let Some(mut target) = uow.get_target(&member.target_id)?.filter(|t| !t.deleted) else {
                missing += 1;
                continue;
            };
            if target.is_up_to_date_with(rollout.distribution_set_id) {
                member.in_sync = true;
                uow.put_member(&member)?;
                in_sync += 1;
                continue;
            }
            self.deployments.create_action(
                uow,
                &mut target,
                rollout.distribution_set_id,
                &request,
                now,
                events,
            )?;
            created += 1;
        }

        group.total_targets = group.total_targets.saturating_sub(missing);
        group.status = RolloutGroupStatus::Running;
        group.audit.touch(SYSTEM_ACTOR, now);
        uow.update_group(group)?;
        events.push(RolloutEvent::GroupStarted {
            rollout: rollout.id,
            group: group.id,
            index: group.index,
            actions: created,
        });
        info!(
            rollout = rollout.id,
            group = group.id,
            index = group.index,
            actions = created,
            in_sync,
            missing,
            "group started"
        );
        Ok(())
    }

    /// Close open groups and cancel active actions. Returns the actions
    /// still active afterwards.
    fn wind_down(
        &self,
        uow: &UnitOfWork,
        rollout: &Rollout,
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<Vec<Action>> {
        for mut group in uow.list_groups(rollout.id)? {
            if matches!(
                group.status,
                RolloutGroupStatus::Finished | RolloutGroupStatus::Error
            ) {
                continue;
            }
            group.status = RolloutGroupStatus::Finished;
            group.audit.touch(SYSTEM_ACTOR, now);
            uow.update_group(&mut group)?;
        }

        let message = format!("rollout {} is {}", rollout.id, rollout.status);
        let mut still_active = Vec::new();
        for mut action in uow.actions_for_rollout(rollout.id)? {
            if !action.active {
                continue;
            }
            self.deployments
                .soft_cancel(uow, &mut action, &message, now, events)?;
            if action.active {
                still_active.push(action);
            }
        }
        Ok(still_active)
    }

    fn handle_stopping(
        &self,
        uow: &UnitOfWork,
        rollout: &mut Rollout,
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<()> {
        let active = self.wind_down(uow, rollout, now, events)?;
        if active.iter().all(|a| a.status == ActionStatus::Canceling) {
            rollout.status = RolloutStatus::Stopped;
            events.push(RolloutEvent::RolloutStopped {
                rollout: rollout.id,
            });
            info!(rollout = rollout.id, canceling = active.len(), "rollout stopped");
        }
        Ok(())
    }

    /// Returns `true` when the rollout was purged.
    fn handle_deleting(
        &self,
        uow: &UnitOfWork,
        rollout: &mut Rollout,
        now: u64,
        events: &mut Vec<RolloutEvent>,
    ) -> RolloutResult<bool> {
        if uow.actions_for_rollout(rollout.id)?.is_empty() {
            uow.purge_rollout(rollout.id)?;
            events.push(RolloutEvent::RolloutDeleted {
                rollout: rollout.id,
                hard: true,
            });
            info!(rollout = rollout.id, "rollout purged");
            return Ok(true);
        }
        let active = self.wind_down(uow, rollout, now, events)?;
        if active.is_empty() {
            rollout.status = RolloutStatus::Deleted;
            rollout.deleted = true;
            events.push(RolloutEvent::RolloutDeleted {
                rollout: rollout.id,
                hard: false,
            });
            info!(rollout = rollout.id, "rollout deleted");
        } else {
            debug!(rollout = rollout.id, active = active.len(), "waiting for canceled actions");
        }
        Ok(false)
    }
}

fn load(uow: &UnitOfWork, id: RolloutId) -> RolloutResult<Rollout> {
    uow.get_rollout(id)?
        .ok_or_else(|| RolloutError::NotFound(format!("rollout {id}")))
}

/// Load the rollout and make sure nobody changed it since `seen` was read.
fn load_expected(uow: &UnitOfWork, seen: &Rollout) -> RolloutResult<Rollout> {
    let current = load(uow, seen.id)?;
    if current.revision != seen.revision {
        return Err(RolloutError::Conflict(format!(
            "rollout {} expected revision {}, found {}",
            seen.id, seen.revision, current.revision
        )));
    }
    Ok(current)
}

fn finish_group(
    uow: &UnitOfWork,
    group: &mut RolloutGroup,
    now: u64,
    events: &mut Vec<RolloutEvent>,
) -> RolloutResult<()> {
    group.status = RolloutGroupStatus::Finished;
    group.audit.touch(SYSTEM_ACTOR, now);
    uow.update_group(group)?;
    events.push(RolloutEvent::GroupFinished {
        rollout: group.rollout_id,
        group: group.id,
        index: group.index,
    });
    info!(rollout = group.rollout_id, group = group.id, index = group.index, "group finished");
    Ok(())
}

fn illegal(rollout: &Rollout, op: &str) -> RolloutError {
    RolloutError::IllegalState(format!(
        "cannot {op} rollout {} in status {}",
        rollout.id, rollout.status
    ))
}

fn require(rollout: &Rollout, allowed: &[RolloutStatus], op: &str) -> RolloutResult<()> {
    if allowed.contains(&rollout.status) {
        Ok(())
    } else {
        Err(illegal(rollout, op))
    }
}
