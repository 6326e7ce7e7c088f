//! Typed writes inside one redb write transaction.

use redb::WriteTransaction;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::view::{StateView, fetch_raw, visit_table};

/// Outcome of deleting a record that may still be referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// Still referenced; kept with `deleted = true`.
    SoftDeleted,
    NotFound,
}

/// All reads and writes of one atomic change.
///
/// Obtained from [`StateStore::transaction`](crate::StateStore::transaction);
/// nothing written here is visible to others until the closure returns `Ok`.
pub struct UnitOfWork {
    txn: WriteTransaction,
}

impl StateView for UnitOfWork {
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

impl UnitOfWork {
    pub(crate) fn new(txn: WriteTransaction) -> Self {
        Self { txn }
    }

    pub(crate) fn into_inner(self) -> WriteTransaction {
        self.txn
    }

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    fn remove_prefix(&self, table: JsonTable, prefix: &str) -> StateResult<usize> {
        let keys = self.scan_keys(table, prefix)?;
        for key in &keys {
            self.remove(table, key)?;
        }
        Ok(keys.len())
    }

    /// Compare the stored revision with the caller's copy, then write the
    /// record with the revision bumped.
    fn update_versioned<T>(&self, table: JsonTable, key: &str, entity: &mut T) -> StateResult<()>
    where
        T: Versioned + Serialize + DeserializeOwned,
    {
        let stored: T = self
            .fetch_json(table, key)?
            .ok_or_else(|| StateError::NotFound(format!("{} {}", T::ENTITY, entity.entity_id())))?;
        if stored.revision() != entity.revision() {
            return Err(StateError::Conflict {
                entity: T::ENTITY,
                id: entity.entity_id(),
                expected: entity.revision(),
                found: stored.revision(),
            });
        }
        entity.set_revision(entity.revision() + 1);
        self.put_json(table, key, entity)
    }

    /// Next value of a named id sequence, starting at 1.
    pub fn next_id(&self, sequence: &str) -> StateResult<u64> {
        let current: u64 = self.fetch_json(COUNTERS, sequence)?.unwrap_or(0);
        let next = current + 1;
        self.put_json(COUNTERS, sequence, &next)?;
        Ok(next)
    }

    // ── Targets ────────────────────────────────────────────────────

    /// Register a new target.
    pub fn insert_target(&self, target: &Target) -> StateResult<()> {
        if let Some(existing) = self.get_target(&target.controller_id)? {
            return Err(StateError::Conflict {
                entity: Target::ENTITY,
                id: target.controller_id.clone(),
                expected: target.revision,
                found: existing.revision,
            });
        }
        self.put_json(TARGETS, &target.controller_id, target)?;
        debug!(target = %target.controller_id, "target registered");
        Ok(())
    }

    pub fn update_target(&self, target: &mut Target) -> StateResult<()> {
        let key = target.controller_id.clone();
        self.update_versioned(TARGETS, &key, target)
    }

    /// Remove a target, or only mark it deleted when actions reference it.
    pub fn delete_target(&self, controller_id: &str) -> StateResult<Removal> {
        let Some(mut target) = self.get_target(controller_id)? else {
            return Ok(Removal::NotFound);
        };
        if self.count_actions_for_target(controller_id)? > 0 {
            target.deleted = true;
            self.update_target(&mut target)?;
            return Ok(Removal::SoftDeleted);
        }
        self.remove(TARGETS, controller_id)?;
        Ok(Removal::Removed)
    }

    // ── Distribution sets ──────────────────────────────────────────

    /// Store a new distribution set under a fresh id.
    pub fn insert_distribution_set(&self, ds: &mut DistributionSet) -> StateResult<()> {
        ds.id = self.next_id("distribution_set")?;
        self.put_json(DISTRIBUTION_SETS, &id_key(ds.id), ds)?;
        debug!(ds = ds.id, name = %ds.name, version = %ds.version, "distribution set stored");
        Ok(())
    }

    pub fn update_distribution_set(&self, ds: &DistributionSet) -> StateResult<()> {
        let key = id_key(ds.id);
        if self.fetch(DISTRIBUTION_SETS, &key)?.is_none() {
            return Err(StateError::NotFound(format!("distribution set {}", ds.id)));
        }
        self.put_json(DISTRIBUTION_SETS, &key, ds)
    }

    /// Remove a distribution set, or only mark it deleted when an action or
    /// rollout references it.
    pub fn delete_distribution_set(&self, id: DistributionSetId) -> StateResult<Removal> {
        let Some(mut ds) = self.get_distribution_set(id)? else {
            return Ok(Removal::NotFound);
        };
        let mut referenced = false;
        self.visit(ACTIONS, "", &mut |_, bytes| {
            let action: Action = crate::view::decode(bytes)?;
            referenced = action.distribution_set_id == id;
            Ok(!referenced)
        })?;
        if !referenced {
            referenced = self
                .list_rollouts()?
                .iter()
                .any(|r| r.distribution_set_id == id);
        }
        if referenced {
            ds.deleted = true;
            self.update_distribution_set(&ds)?;
            return Ok(Removal::SoftDeleted);
        }
        self.remove(DISTRIBUTION_SETS, &id_key(id))?;
        Ok(Removal::Removed)
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Store a new action under a fresh id and index it by target and group.
    pub fn insert_action(&self, action: &mut Action) -> StateResult<()> {
        action.id = self.next_id("action")?;
        action.revision = 0;
        let key = id_key(action.id);
        self.put_json(ACTIONS, &key, action)?;
        self.put_json(
            TARGET_ACTIONS,
            &child_key(&target_key(&action.target_id), &key),
            &action.id,
        )?;
        if let Some(group_id) = action.rollout_group_id {
            self.put_json(GROUP_ACTIONS, &child_key(&id_key(group_id), &key), &action.id)?;
        }
        Ok(())
    }

    pub fn update_action(&self, action: &mut Action) -> StateResult<()> {
        let key = id_key(action.id);
        self.update_versioned(ACTIONS, &key, action)
    }

    /// Append an entry to the action's status log.
    pub fn append_status(&self, entry: &ActionStatusEntry) -> StateResult<()> {
        let seq = self.next_id("action_status")?;
        let key = child_key(&id_key(entry.action_id), &id_key(seq));
        self.put_json(ACTION_STATUS, &key, entry)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    pub fn insert_rollout(&self, rollout: &mut Rollout) -> StateResult<()> {
        rollout.id = self.next_id("rollout")?;
        rollout.revision = 0;
        self.put_json(ROLLOUTS, &id_key(rollout.id), rollout)?;
        debug!(rollout = rollout.id, name = %rollout.name, "rollout stored");
        Ok(())
    }

    pub fn update_rollout(&self, rollout: &mut Rollout) -> StateResult<()> {
        let key = id_key(rollout.id);
        self.update_versioned(ROLLOUTS, &key, rollout)
    }

    /// Remove a rollout with its groups and target claims.
    pub fn purge_rollout(&self, rollout_id: RolloutId) -> StateResult<bool> {
        let rollout_key = id_key(rollout_id);
        for group in self.list_groups(rollout_id)? {
            let group_key = id_key(group.id);
            self.remove_prefix(GROUP_TARGETS, &children_prefix(&group_key))?;
            self.remove_prefix(GROUP_ACTIONS, &children_prefix(&group_key))?;
            self.remove(ROLLOUT_GROUPS, &group_key)?;
        }
        self.remove_prefix(ROLLOUT_GROUP_INDEX, &children_prefix(&rollout_key))?;
        let released = self.remove_prefix(ROLLOUT_TARGETS, &children_prefix(&rollout_key))?;
        let existed = self.remove(ROLLOUTS, &rollout_key)?;
        debug!(rollout = rollout_id, released, existed, "rollout purged");
        Ok(existed)
    }

    // ── Rollout groups ─────────────────────────────────────────────

    pub fn insert_group(&self, group: &mut RolloutGroup) -> StateResult<()> {
        group.id = self.next_id("rollout_group")?;
        group.revision = 0;
        let key = id_key(group.id);
        self.put_json(ROLLOUT_GROUPS, &key, group)?;
        let index_key = child_key(&id_key(group.rollout_id), &format!("{:05}", group.index));
        self.put_json(ROLLOUT_GROUP_INDEX, &index_key, &group.id)
    }

    pub fn update_group(&self, group: &mut RolloutGroup) -> StateResult<()> {
        let key = id_key(group.id);
        self.update_versioned(ROLLOUT_GROUPS, &key, group)
    }

    /// Claim a target for a group. Returns `false` when another group of the
    /// same rollout already owns it.
    pub fn claim_target(&self, member: &GroupMember) -> StateResult<bool> {
        let claim_key = child_key(&id_key(member.rollout_id), &member.target_id);
        if self.fetch(ROLLOUT_TARGETS, &claim_key)?.is_some() {
            return Ok(false);
        }
        self.put_json(ROLLOUT_TARGETS, &claim_key, &member.group_id)?;
        self.put_member(member)?;
        Ok(true)
    }

    /// Rewrite a group membership, e.g. to flag it in sync.
    pub fn put_member(&self, member: &GroupMember) -> StateResult<()> {
        let key = child_key(&id_key(member.group_id), &member.target_id);
        self.put_json(GROUP_TARGETS, &key, member)
    }
}
