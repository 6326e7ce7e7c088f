//! Group evaluation: aggregate a running group's actions and decide whether
//! it succeeded, failed or needs more time.

use serde::Serialize;

use rollgrid_state::{
    Action, ActionStatus, ErrorCondition, GroupConditions, RolloutGroup, StateResult, StateView,
    SuccessCondition,
};

/// Action counts of one rollout group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupCounts {
    pub scheduled: u64,
    pub running: u64,
    pub finished: u64,
    pub error: u64,
    pub canceled: u64,
    /// Members that already had the set installed; they count as finished.
    pub in_sync: u64,
    pub total: u64,
}

impl GroupCounts {
    pub fn collect<V: StateView>(view: &V, group: &RolloutGroup) -> StateResult<Self> {
        let mut counts = GroupCounts {
            total: group.total_targets,
            ..Default::default()
        };
        counts.in_sync = view
            .members_of_group(group.id)?
            .iter()
            .filter(|m| m.in_sync)
            .count() as u64;
        for action in view.actions_for_group(group.id)? {
            counts.record(&action);
        }
        Ok(counts)
    }

    fn record(&mut self, action: &Action) {
        if action.counts_as_finished() {
            self.finished += 1;
            return;
        }
        match action.status {
            ActionStatus::Error => self.error += 1,
            ActionStatus::Canceled => self.canceled += 1,
            ActionStatus::Scheduled | ActionStatus::WaitForConfirmation => self.scheduled += 1,
            _ => self.running += 1,
        }
    }

    pub fn done(&self) -> u64 {
        self.finished + self.in_sync
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Error,
    Success,
    Pending,
}

/// Apply a group's conditions to its counts. The error condition wins when
/// both are met.
pub fn evaluate(conditions: &GroupConditions, counts: &GroupCounts) -> Verdict {
    if let Some(ErrorCondition::Threshold(pct)) = conditions.error_condition
        && counts.total > 0
        && counts.error * 100 >= u64::from(pct) * counts.total
    {
        return Verdict::Error;
    }
    let SuccessCondition::Threshold(pct) = conditions.success_condition;
    if counts.total == 0 || counts.done() * 100 >= u64::from(pct) * counts.total {
        Verdict::Success
    } else {
        Verdict::Pending
    }
}
