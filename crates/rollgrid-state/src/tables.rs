//! redb table definitions for the rollgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Numeric ids inside keys are rendered with [`id_key`].

use redb::TableDefinition;

/// Targets keyed by controller id.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

/// Distribution sets keyed by `{ds_id}`.
pub const DISTRIBUTION_SETS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("distribution_sets");

/// Actions keyed by `{action_id}`.
pub const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("actions");

/// Append-only action status log keyed by `{action_id}/{seq}`.
pub const ACTION_STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("action_status");

/// Index of actions per target keyed by `{target_key}/{action_id}`, see
/// [`target_key`].
pub const TARGET_ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("target_actions");

/// Index of actions per rollout group keyed by `{group_id}/{action_id}`.
pub const GROUP_ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_actions");

/// Rollouts keyed by `{rollout_id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Rollout groups keyed by `{group_id}`.
pub const ROLLOUT_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_groups");

/// Ordered group ids per rollout keyed by `{rollout_id}/{index}`.
pub const ROLLOUT_GROUP_INDEX: TableDefinition<&str, &[u8]> =
    TableDefinition::new("rollout_group_index");

/// Target claims per rollout keyed by `{rollout_id}/{controller_id}`.
/// One entry per target and rollout, which keeps groups disjoint.
pub const ROLLOUT_TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_targets");

/// Group membership keyed by `{group_id}/{controller_id}`.
pub const GROUP_TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_targets");

/// Id sequences keyed by sequence name.
pub const COUNTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("counters");

/// Render a numeric id so that lexical order equals numeric order.
pub fn id_key(id: u64) -> String {
    format!("{id:020}")
}

/// Parent key for a controller id in the per-target index. Controller ids
/// are opaque and may contain `/`, so the id is length-prefixed: `dev` and
/// `dev/x` never share a prefix.
pub fn target_key(controller_id: &str) -> String {
    format!("{:010}:{controller_id}", controller_id.len())
}

/// Build a `{parent}/{child}` composite key.
pub fn child_key(parent: &str, child: &str) -> String {
    format!("{parent}/{child}")
}

/// Prefix matching every child of `parent`.
pub fn children_prefix(parent: &str) -> String {
    format!("{parent}/")
}

/// Shape shared by every table: string keys, JSON values.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Every table, created when the store is opened.
pub const ALL_TABLES: [JsonTable; 12] = [
    TARGETS,
    DISTRIBUTION_SETS,
    ACTIONS,
    ACTION_STATUS,
    TARGET_ACTIONS,
    GROUP_ACTIONS,
    ROLLOUTS,
    ROLLOUT_GROUPS,
    ROLLOUT_GROUP_INDEX,
    ROLLOUT_TARGETS,
    GROUP_TARGETS,
    COUNTERS,
];
