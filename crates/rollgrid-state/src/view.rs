//! Typed read access shared by snapshots and units of work.

use std::collections::HashSet;

use redb::{ReadTransaction, ReadableTable};
use serde::de::DeserializeOwned;

use crate::error::{StateError, StateResult};
use crate::filter::TargetQuery;
use crate::tables::*;
use crate::types::*;

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

pub(crate) fn fetch_raw<R>(table: &R, key: &str) -> StateResult<Option<Vec<u8>>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_vec()))
}

/// Walk the entries whose key starts with `prefix`, in key order, until `f`
/// returns `false`.
pub(crate) fn visit_table<R>(
    table: &R,
    prefix: &str,
    f: &mut dyn FnMut(&str, &[u8]) -> StateResult<bool>,
) -> StateResult<()>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        if !f(key, value.value())? {
            break;
        }
    }
    Ok(())
}

/// Typed queries over the store.
///
/// Implementors provide raw key access; every query is a default method so
/// a [`Snapshot`] and a [`UnitOfWork`](crate::UnitOfWork) answer them the
/// same way.
pub trait StateView {
    #[doc(hidden)]
    fn fetch(&self, table: JsonTable, key: &str) -> StateResult<Option<Vec<u8>>>;

    #[doc(hidden)]
    fn visit(
        &self,
        table: JsonTable,
        prefix: &str,
        f: &mut dyn FnMut(&str, &[u8]) -> StateResult<bool>,
    ) -> StateResult<()>;

    #[doc(hidden)]
    fn fetch_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        self.fetch(table, key)?.map(|bytes| decode(&bytes)).transpose()
    }

    #[doc(hidden)]
    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let mut out = Vec::new();
        self.visit(table, prefix, &mut |_, bytes| {
            out.push(decode(bytes)?);
            Ok(true)
        })?;
        Ok(out)
    }

    #[doc(hidden)]
    fn scan_keys(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<String>> {
        let mut out = Vec::new();
        self.visit(table, prefix, &mut |key, _| {
            out.push(key.to_string());
            Ok(true)
        })?;
        Ok(out)
    }

    // ── Targets ────────────────────────────────────────────────────

    fn get_target(&self, controller_id: &str) -> StateResult<Option<Target>> {
        self.fetch_json(TARGETS, controller_id)
    }

    fn list_targets(&self) -> StateResult<Vec<Target>> {
        self.scan_json(TARGETS, "")
    }

    /// One page of the controller ids accepted by `query`, in id order.
    fn select_targets(&self, query: &TargetQuery<'_>, page: Page) -> StateResult<Slice<TargetId>> {
        let mut skipped = 0;
        let mut items = Vec::new();
        let mut has_more = false;
        self.visit(TARGETS, "", &mut |_, bytes| {
            let target: Target = decode(bytes)?;
            if !query.accepts(&target) {
                return Ok(true);
            }
            if skipped < page.offset {
                skipped += 1;
                return Ok(true);
            }
            if items.len() == page.limit {
                has_more = true;
                return Ok(false);
            }
            items.push(target.controller_id);
            Ok(true)
        })?;
        Ok(Slice { items, has_more })
    }

    fn count_targets(&self, query: &TargetQuery<'_>) -> StateResult<u64> {
        let mut count = 0;
        self.visit(TARGETS, "", &mut |_, bytes| {
            if query.accepts(&decode::<Target>(bytes)?) {
                count += 1;
            }
            Ok(true)
        })?;
        Ok(count)
    }

    // ── Distribution sets ──────────────────────────────────────────

    fn get_distribution_set(&self, id: DistributionSetId) -> StateResult<Option<DistributionSet>> {
        self.fetch_json(DISTRIBUTION_SETS, &id_key(id))
    }

    // ── Actions ────────────────────────────────────────────────────

    fn get_action(&self, id: ActionId) -> StateResult<Option<Action>> {
        self.fetch_json(ACTIONS, &id_key(id))
    }

    /// Load actions by the ids stored in an index table.
    #[doc(hidden)]
    fn actions_by_index(&self, index: JsonTable, parent: &str) -> StateResult<Vec<Action>> {
        let ids: Vec<ActionId> = self.scan_json(index, &children_prefix(parent))?;
        let mut actions = Vec::with_capacity(ids.len());
        for id in ids {
            let action = self
                .get_action(id)?
                .ok_or_else(|| StateError::NotFound(format!("action {id}")))?;
            actions.push(action);
        }
        Ok(actions)
    }

    fn actions_for_target(&self, controller_id: &str) -> StateResult<Vec<Action>> {
        self.actions_by_index(TARGET_ACTIONS, &target_key(controller_id))
    }

    fn actions_for_group(&self, group_id: GroupId) -> StateResult<Vec<Action>> {
        self.actions_by_index(GROUP_ACTIONS, &id_key(group_id))
    }

    fn actions_for_rollout(&self, rollout_id: RolloutId) -> StateResult<Vec<Action>> {
        let mut actions = Vec::new();
        for group in self.list_groups(rollout_id)? {
            actions.extend(self.actions_for_group(group.id)?);
        }
        Ok(actions)
    }

    fn count_actions_for_target(&self, controller_id: &str) -> StateResult<u64> {
        let mut count = 0;
        self.visit(TARGET_ACTIONS, &children_prefix(&target_key(controller_id)), &mut |_, _| {
            count += 1;
            Ok(true)
        })?;
        Ok(count)
    }

    /// The status log of an action, oldest first.
    fn action_history(&self, action_id: ActionId) -> StateResult<Vec<ActionStatusEntry>> {
        self.scan_json(ACTION_STATUS, &children_prefix(&id_key(action_id)))
    }

    // ── Rollouts ───────────────────────────────────────────────────

    fn get_rollout(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
        self.fetch_json(ROLLOUTS, &id_key(id))
    }

    fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        self.scan_json(ROLLOUTS, "")
    }

    fn get_group(&self, id: GroupId) -> StateResult<Option<RolloutGroup>> {
        self.fetch_json(ROLLOUT_GROUPS, &id_key(id))
    }

    /// Groups of a rollout ordered by index.
    fn list_groups(&self, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        let ids: Vec<GroupId> =
            self.scan_json(ROLLOUT_GROUP_INDEX, &children_prefix(&id_key(rollout_id)))?;
        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            let group = self
                .get_group(id)?
                .ok_or_else(|| StateError::NotFound(format!("rollout group {id}")))?;
            groups.push(group);
        }
        Ok(groups)
    }

    /// Targets already claimed by some group of the rollout.
    fn claimed_targets(&self, rollout_id: RolloutId) -> StateResult<HashSet<TargetId>> {
        let prefix = children_prefix(&id_key(rollout_id));
        let mut claimed = HashSet::new();
        self.visit(ROLLOUT_TARGETS, &prefix, &mut |key, _| {
            claimed.insert(key[prefix.len()..].to_string());
            Ok(true)
        })?;
        Ok(claimed)
    }

    fn members_of_group(&self, group_id: GroupId) -> StateResult<Vec<GroupMember>> {
        self.scan_json(GROUP_TARGETS, &children_prefix(&id_key(group_id)))
    }
}

/// A consistent read-only view of the store.
pub struct Snapshot {
    txn: ReadTransaction,
}

impl Snapshot {
    pub(crate) fn new(txn: ReadTransaction) -> Self {
        Self { txn }
    }
}

impl StateView for Snapshot {
    fn fetch(&self, table: JsonTable, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        fetch_raw(&table, key)
    }

    fn visit(
        &self,
        table: JsonTable,
        prefix: &str,
        f: &mut dyn FnMut(&str, &[u8]) -> StateResult<bool>,
    ) -> StateResult<()> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        visit_table(&table, prefix, f)
    }
}
