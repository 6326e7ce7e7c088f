//! redb-backed state persistence for rollgrid.
//!
//! Owns the database handle, creates the tables, and hands out read
//! [`Snapshot`]s and write [`UnitOfWork`]s. The store supports both on-disk
//! and in-memory backends (the latter for testing).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::filter::TargetQuery;
use crate::tables::ALL_TABLES;
use crate::types::*;
use crate::unit::UnitOfWork;
use crate::view::{Snapshot, StateView};

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside one write transaction.
    ///
    /// Everything `f` wrote is committed when it returns `Ok` and discarded
    /// when it returns `Err`.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&UnitOfWork) -> Result<T, E>,
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let uow = UnitOfWork::new(txn);
        match f(&uow) {
            Ok(value) => {
                uow.into_inner()
                    .commit()
                    .map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort) = uow.into_inner().abort() {
                    warn!(error = %abort, "failed to abort transaction");
                }
                Err(err)
            }
        }
    }

    /// A consistent read-only view.
    pub fn snapshot(&self) -> StateResult<Snapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(Snapshot::new(txn))
    }

    // ── Read helpers ───────────────────────────────────────────────

    pub fn get_target(&self, controller_id: &str) -> StateResult<Option<Target>> {
        self.snapshot()?.get_target(controller_id)
    }

    pub fn select_targets(&self, query: &TargetQuery<'_>, page: Page) -> StateResult<Slice<TargetId>> {
        self.snapshot()?.select_targets(query, page)
    }

    pub fn get_distribution_set(&self, id: DistributionSetId) -> StateResult<Option<DistributionSet>> {
        self.snapshot()?.get_distribution_set(id)
    }

    pub fn get_action(&self, id: ActionId) -> StateResult<Option<Action>> {
        self.snapshot()?.get_action(id)
    }

    pub fn actions_for_target(&self, controller_id: &str) -> StateResult<Vec<Action>> {
        self.snapshot()?.actions_for_target(controller_id)
    }

    pub fn actions_for_group(&self, group_id: GroupId) -> StateResult<Vec<Action>> {
        self.snapshot()?.actions_for_group(group_id)
    }

    pub fn action_history(&self, action_id: ActionId) -> StateResult<Vec<ActionStatusEntry>> {
        self.snapshot()?.action_history(action_id)
    }

    pub fn get_rollout(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
        self.snapshot()?.get_rollout(id)
    }

    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        self.snapshot()?.list_rollouts()
    }

    pub fn list_groups(&self, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        self.snapshot()?.list_groups(rollout_id)
    }

    pub fn members_of_group(&self, group_id: GroupId) -> StateResult<Vec<GroupMember>> {
        self.snapshot()?.members_of_group(group_id)
    }

    pub fn claimed_targets(&self, rollout_id: RolloutId) -> StateResult<HashSet<TargetId>> {
        self.snapshot()?.claimed_targets(rollout_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TargetFilter;
    use crate::unit::Removal;

    fn register(store: &StateStore, ids: &[&str], now: u64) {
        store
            .transaction(|uow| {
                for id in ids {
                    uow.insert_target(&Target::new(id, "test", now))?;
                }
                Ok::<_, StateError>(())
            })
            .unwrap();
    }

    #[test]
    fn failed_closure_rolls_back() {
        let store = StateStore::open_in_memory().unwrap();
        let result: StateResult<()> = store.transaction(|uow| {
            uow.insert_target(&Target::new("a", "test", 1))?;
            Err(StateError::NotFound("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(store.get_target("a").unwrap().is_none());
    }

    #[test]
    fn id_sequences_are_independent_and_persistent() {
        let store = StateStore::open_in_memory().unwrap();
        let (a, b, c) = store
            .transaction(|uow| {
                Ok::<_, StateError>((
                    uow.next_id("rollout")?,
                    uow.next_id("rollout")?,
                    uow.next_id("action")?,
                ))
            })
            .unwrap();
        assert_eq!((a, b, c), (1, 2, 1));
        let d = store
            .transaction(|uow| uow.next_id("rollout"))
            .unwrap();
        assert_eq!(d, 3);
    }

    #[test]
    fn select_targets_pages_in_id_order() {
        let store = StateStore::open_in_memory().unwrap();
        register(&store, &["t3", "t1", "t5", "t2", "t4"], 10);
        let filter = TargetFilter::parse("id==t*").unwrap();
        let query = TargetQuery::new(&filter);

        let first = store.select_targets(&query, Page::first(2)).unwrap();
        assert_eq!(first.items, vec!["t1", "t2"]);
        assert!(first.has_more);

        let last = store
            .select_targets(&query, Page::first(2).next().next())
            .unwrap();
        assert_eq!(last.items, vec!["t5"]);
        assert!(!last.has_more);

        let exact = store.select_targets(&query, Page::first(5)).unwrap();
        assert_eq!(exact.items.len(), 5);
        assert!(!exact.has_more);
    }

    #[test]
    fn select_targets_honours_cutoff() {
        let store = StateStore::open_in_memory().unwrap();
        register(&store, &["early"], 10);
        register(&store, &["late"], 20);
        let filter = TargetFilter::parse("id==*").unwrap();
        let query = TargetQuery::new(&filter).created_until(15);
        let slice = store.select_targets(&query, Page::first(10)).unwrap();
        assert_eq!(slice.items, vec!["early"]);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            register(&store, &["dev-1"], 1);
        }
        let store = StateStore::open(&path).unwrap();
        let target = store.get_target("dev-1").unwrap().unwrap();
        assert_eq!(target.update_status, UpdateStatus::Registered);
    }

    #[test]
    fn distribution_set_in_use_is_soft_deleted() {
        let store = StateStore::open_in_memory().unwrap();
        let (used, unused) = store
            .transaction(|uow| {
                let make = |name: &str| -> StateResult<DistributionSetId> {
                    let mut ds = DistributionSet {
                        id: 0,
                        name: name.to_string(),
                        version: "1".to_string(),
                        ds_type: DistributionSetType::default(),
                        modules: Vec::new(),
                        deleted: false,
                        valid: true,
                        audit: Audit::default(),
                    };
                    uow.insert_distribution_set(&mut ds)?;
                    Ok(ds.id)
                };
                let used = make("used")?;
                let unused = make("unused")?;
                let mut action = Action {
                    id: 0,
                    target_id: "t".to_string(),
                    distribution_set_id: used,
                    action_type: ActionType::Forced,
                    forced_time: None,
                    status: ActionStatus::Finished,
                    active: false,
                    rollout_id: None,
                    rollout_group_id: None,
                    revision: 0,
                    audit: Audit::default(),
                };
                uow.insert_action(&mut action)?;
                Ok::<_, StateError>((used, unused))
            })
            .unwrap();

        let removals = store
            .transaction(|uow| {
                Ok::<_, StateError>((
                    uow.delete_distribution_set(used)?,
                    uow.delete_distribution_set(unused)?,
                ))
            })
            .unwrap();
        assert_eq!(removals, (Removal::SoftDeleted, Removal::Removed));
        assert!(store.get_distribution_set(used).unwrap().unwrap().deleted);
        assert!(store.get_distribution_set(unused).unwrap().is_none());
    }

    #[test]
    fn status_log_keeps_append_order() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .transaction(|uow| {
                for (status, msg) in [
                    (ActionStatus::Running, "retrieved"),
                    (ActionStatus::Download, "downloading"),
                    (ActionStatus::Finished, "done"),
                ] {
                    uow.append_status(&ActionStatusEntry {
                        action_id: 4,
                        status,
                        messages: vec![msg.to_string()],
                        occurred_at: 0,
                        informational: false,
                    })?;
                }
                Ok::<_, StateError>(())
            })
            .unwrap();
        let history = store.action_history(4).unwrap();
        let statuses: Vec<_> = history.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![ActionStatus::Running, ActionStatus::Download, ActionStatus::Finished]
        );
        assert!(store.action_history(5).unwrap().is_empty());
    }
}
