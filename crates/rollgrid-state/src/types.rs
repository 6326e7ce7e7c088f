//! Domain types for the rollgrid state store.
//!
//! These types represent the persisted state of targets, distribution sets,
//! actions, rollouts and rollout groups. All types are serializable to/from
//! JSON for storage in redb tables. Timestamps are unix milliseconds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Controller id of a target.
pub type TargetId = String;

pub type DistributionSetId = u64;
pub type ActionId = u64;
pub type RolloutId = u64;
pub type GroupId = u64;

// ── Base records ───────────────────────────────────────────────────

/// Audit fields embedded in every persisted entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Audit {
    pub created_at: u64,
    pub created_by: String,
    pub last_modified_at: u64,
    pub last_modified_by: String,
}

impl Audit {
    pub fn new(actor: &str, now: u64) -> Self {
        Self {
            created_at: now,
            created_by: actor.to_string(),
            last_modified_at: now,
            last_modified_by: actor.to_string(),
        }
    }

    pub fn touch(&mut self, actor: &str, now: u64) {
        self.last_modified_at = now;
        self.last_modified_by = actor.to_string();
    }
}

/// Entities updated through optimistic revision checks.
pub trait Versioned {
    const ENTITY: &'static str;

    fn entity_id(&self) -> String;
    fn revision(&self) -> u64;
    fn set_revision(&mut self, revision: u64);
}

macro_rules! versioned {
    ($ty:ty, $name:literal, $id:ident) => {
        impl Versioned for $ty {
            const ENTITY: &'static str = $name;

            fn entity_id(&self) -> String {
                self.$id.to_string()
            }

            fn revision(&self) -> u64 {
                self.revision
            }

            fn set_revision(&mut self, revision: u64) {
                self.revision = revision;
            }
        }
    };
}

/// A window into an ordered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// One page of results plus whether more follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

// ── Target ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Unknown,
    Registered,
    Pending,
    InSync,
    Error,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Unknown => "unknown",
            UpdateStatus::Registered => "registered",
            UpdateStatus::Pending => "pending",
            UpdateStatus::InSync => "in_sync",
            UpdateStatus::Error => "error",
        }
    }
}

/// A managed device identified by its controller id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub controller_id: TargetId,
    pub name: String,
    pub description: String,
    pub update_status: UpdateStatus,
    pub assigned_ds: Option<DistributionSetId>,
    pub installed_ds: Option<DistributionSetId>,
    /// Attributes reported by the controller.
    pub attributes: BTreeMap<String, String>,
    pub deleted: bool,
    pub revision: u64,
    pub audit: Audit,
}

versioned!(Target, "target", controller_id);

impl Target {
    pub fn new(controller_id: &str, actor: &str, now: u64) -> Self {
        Self {
            controller_id: controller_id.to_string(),
            name: controller_id.to_string(),
            description: String::new(),
            update_status: UpdateStatus::Registered,
            assigned_ds: None,
            installed_ds: None,
            attributes: BTreeMap::new(),
            deleted: false,
            revision: 0,
            audit: Audit::new(actor, now),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    /// Both the assigned and the installed set already equal `ds`.
    pub fn is_up_to_date_with(&self, ds: DistributionSetId) -> bool {
        self.assigned_ds == Some(ds) && self.installed_ds == Some(ds)
    }
}

// ── Distribution set ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SoftwareModule {
    pub module_type: String,
    pub name: String,
    pub version: String,
}

/// Module-type slots a distribution set of this type has to (or may) fill.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DistributionSetType {
    pub key: String,
    pub mandatory_module_types: Vec<String>,
    pub optional_module_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionSet {
    pub id: DistributionSetId,
    pub name: String,
    pub version: String,
    pub ds_type: DistributionSetType,
    pub modules: Vec<SoftwareModule>,
    pub deleted: bool,
    /// Cleared when the set is invalidated.
    pub valid: bool,
    pub audit: Audit,
}

impl DistributionSet {
    /// Mandatory module types without a module in this set.
    pub fn missing_module_types(&self) -> Vec<&str> {
        self.ds_type
            .mandatory_module_types
            .iter()
            .filter(|slot| !self.modules.iter().any(|m| &m.module_type == *slot))
            .map(String::as_str)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_module_types().is_empty()
    }

    pub fn is_assignable(&self) -> bool {
        self.is_complete() && self.valid && !self.deleted
    }
}

// ── Action ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Forced,
    Soft,
    TimeForced,
    DownloadOnly,
}

/// Lifecycle status of an action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Scheduled,
    WaitForConfirmation,
    Running,
    Download,
    Downloaded,
    Warning,
    Canceling,
    Finished,
    Error,
    Canceled,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Finished | ActionStatus::Error | ActionStatus::Canceled
        )
    }

    /// Still waiting for the controller to pick the action up.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ActionStatus::Scheduled | ActionStatus::WaitForConfirmation
        )
    }

    pub fn is_running_family(&self) -> bool {
        matches!(
            self,
            ActionStatus::Running
                | ActionStatus::Download
                | ActionStatus::Downloaded
                | ActionStatus::Warning
        )
    }

    /// Progress rank: statuses of one action never move to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            ActionStatus::Scheduled | ActionStatus::WaitForConfirmation => 0,
            ActionStatus::Running
            | ActionStatus::Download
            | ActionStatus::Downloaded
            | ActionStatus::Warning => 1,
            ActionStatus::Canceling => 2,
            ActionStatus::Finished | ActionStatus::Error | ActionStatus::Canceled => 3,
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionStatus::Scheduled => "scheduled",
            ActionStatus::WaitForConfirmation => "wait_for_confirmation",
            ActionStatus::Running => "running",
            ActionStatus::Download => "download",
            ActionStatus::Downloaded => "downloaded",
            ActionStatus::Warning => "warning",
            ActionStatus::Canceling => "canceling",
            ActionStatus::Finished => "finished",
            ActionStatus::Error => "error",
            ActionStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Assignment of one distribution set to one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub target_id: TargetId,
    pub distribution_set_id: DistributionSetId,
    pub action_type: ActionType,
    /// Activation time for [`ActionType::TimeForced`] actions.
    pub forced_time: Option<u64>,
    pub status: ActionStatus,
    pub active: bool,
    pub rollout_id: Option<RolloutId>,
    pub rollout_group_id: Option<GroupId>,
    pub revision: u64,
    pub audit: Audit,
}

versioned!(Action, "action", id);

impl Action {
    /// A download-only action that reached `Downloaded` is closed as a success.
    pub fn counts_as_finished(&self) -> bool {
        self.status == ActionStatus::Finished
            || (self.action_type == ActionType::DownloadOnly
                && self.status == ActionStatus::Downloaded
                && !self.active)
    }
}

/// One entry of an action's append-only status log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStatusEntry {
    pub action_id: ActionId,
    pub status: ActionStatus,
    pub messages: Vec<String>,
    pub occurred_at: u64,
    /// Recorded for history only; the action status did not change.
    pub informational: bool,
}

// ── Rollout ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Creating,
    Ready,
    WaitingForApproval,
    ApprovalDenied,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Finished,
    Deleting,
    Deleted,
}

impl RolloutStatus {
    /// No further transition happens from these statuses.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutStatus::Finished
                | RolloutStatus::Stopped
                | RolloutStatus::Deleted
                | RolloutStatus::ApprovalDenied
        )
    }

    pub fn is_stoppable(&self) -> bool {
        matches!(
            self,
            RolloutStatus::Creating
                | RolloutStatus::Ready
                | RolloutStatus::WaitingForApproval
                | RolloutStatus::Starting
                | RolloutStatus::Running
                | RolloutStatus::Paused
        )
    }
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RolloutStatus::Creating => "creating",
            RolloutStatus::Ready => "ready",
            RolloutStatus::WaitingForApproval => "waiting_for_approval",
            RolloutStatus::ApprovalDenied => "approval_denied",
            RolloutStatus::Starting => "starting",
            RolloutStatus::Running => "running",
            RolloutStatus::Paused => "paused",
            RolloutStatus::Stopping => "stopping",
            RolloutStatus::Stopped => "stopped",
            RolloutStatus::Finished => "finished",
            RolloutStatus::Deleting => "deleting",
            RolloutStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A staged deployment of one distribution set to a filtered target population.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub name: String,
    pub description: String,
    pub target_filter: String,
    pub distribution_set_id: DistributionSetId,
    pub action_type: ActionType,
    pub forced_time: Option<u64>,
    /// Automatic start once a READY rollout reaches this time.
    pub start_at: Option<u64>,
    pub status: RolloutStatus,
    pub total_targets: u64,
    /// Number of planned groups.
    pub group_count: u32,
    /// Groups fully populated so far; the partition checkpoint.
    pub rollout_groups_created: u32,
    /// Last scheduler evaluation.
    pub last_check: u64,
    pub creation_error: Option<String>,
    pub approval_remark: Option<String>,
    pub approval_decided_by: Option<String>,
    pub deleted: bool,
    pub revision: u64,
    pub audit: Audit,
}

versioned!(Rollout, "rollout", id);

// ── Rollout group ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RolloutGroupStatus {
    Creating,
    Ready,
    Scheduled,
    Running,
    Finished,
    Error,
}

impl std::fmt::Display for RolloutGroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RolloutGroupStatus::Creating => "creating",
            RolloutGroupStatus::Ready => "ready",
            RolloutGroupStatus::Scheduled => "scheduled",
            RolloutGroupStatus::Running => "running",
            RolloutGroupStatus::Finished => "finished",
            RolloutGroupStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "percent", rename_all = "snake_case")]
pub enum SuccessCondition {
    Threshold(u8),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuccessAction {
    NextGroup,
    Pause,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "percent", rename_all = "snake_case")]
pub enum ErrorCondition {
    Threshold(u8),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    Pause,
}

/// When a running group is done, or has failed, and what happens next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConditions {
    pub success_condition: SuccessCondition,
    pub success_action: SuccessAction,
    pub error_condition: Option<ErrorCondition>,
    pub error_action: ErrorAction,
}

impl Default for GroupConditions {
    fn default() -> Self {
        Self {
            success_condition: SuccessCondition::Threshold(100),
            success_action: SuccessAction::NextGroup,
            error_condition: None,
            error_action: ErrorAction::Pause,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub id: GroupId,
    pub rollout_id: RolloutId,
    pub index: u32,
    pub name: String,
    pub description: String,
    pub status: RolloutGroupStatus,
    /// The preceding group, if any.
    pub parent_id: Option<GroupId>,
    /// Narrows the rollout filter for this group.
    pub target_filter: Option<String>,
    /// Share of the matching unclaimed targets placed in this group.
    pub target_percentage: f64,
    pub conditions: GroupConditions,
    pub confirmation_required: bool,
    pub total_targets: u64,
    pub revision: u64,
    pub audit: Audit,
}

versioned!(RolloutGroup, "rollout_group", id);

/// A target's place in a rollout, recorded when the rollout is partitioned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    pub rollout_id: RolloutId,
    pub group_id: GroupId,
    pub target_id: TargetId,
    /// The target already ran the rollout's set when the group started.
    pub in_sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(mandatory: &[&str], modules: &[&str]) -> DistributionSet {
        DistributionSet {
            id: 1,
            name: "os".to_string(),
            version: "1.0".to_string(),
            ds_type: DistributionSetType {
                key: "os_app".to_string(),
                mandatory_module_types: mandatory.iter().map(|s| s.to_string()).collect(),
                optional_module_types: vec!["app".to_string()],
            },
            modules: modules
                .iter()
                .map(|t| SoftwareModule {
                    module_type: t.to_string(),
                    name: format!("{t}-module"),
                    version: "1".to_string(),
                })
                .collect(),
            deleted: false,
            valid: true,
            audit: Audit::default(),
        }
    }

    #[test]
    fn completeness_requires_all_mandatory_slots() {
        let incomplete = ds(&["os", "firmware"], &["os", "app"]);
        assert!(!incomplete.is_complete());
        assert_eq!(incomplete.missing_module_types(), vec!["firmware"]);

        let complete = ds(&["os"], &["os"]);
        assert!(complete.is_complete());
        assert!(complete.is_assignable());
    }

    #[test]
    fn invalidated_set_is_not_assignable() {
        let mut set = ds(&["os"], &["os"]);
        set.valid = false;
        assert!(set.is_complete());
        assert!(!set.is_assignable());
    }

    #[test]
    fn ranks_follow_lifecycle() {
        assert!(ActionStatus::Scheduled.rank() < ActionStatus::Running.rank());
        assert_eq!(ActionStatus::Download.rank(), ActionStatus::Warning.rank());
        assert!(ActionStatus::Warning.rank() < ActionStatus::Canceling.rank());
        assert!(ActionStatus::Canceling.rank() < ActionStatus::Canceled.rank());
        assert!(ActionStatus::Error.is_terminal());
        assert!(!ActionStatus::Canceling.is_terminal());
    }

    #[test]
    fn up_to_date_needs_both_assigned_and_installed() {
        let mut target = Target::new("dev-1", "test", 0);
        target.assigned_ds = Some(3);
        assert!(!target.is_up_to_date_with(3));
        target.installed_ds = Some(3);
        assert!(target.is_up_to_date_with(3));
    }

    #[test]
    fn conditions_serialize_with_tag() {
        let json = serde_json::to_value(GroupConditions::default()).unwrap();
        assert_eq!(json["success_condition"]["type"], "threshold");
        assert_eq!(json["success_condition"]["percent"], 100);
        assert_eq!(json["success_action"], "next_group");
        assert!(json["error_condition"].is_null());
    }
}
