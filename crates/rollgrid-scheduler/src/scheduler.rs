//! Periodic driver that re-enters the rollout state machine on a fixed delay.

use std::time::Duration;

use rollgrid_rollout::{ProcessOutcome, RolloutManager};
use rollgrid_state::{Rollout, RolloutId, RolloutStatus};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerResult;

/// What one pass did, rollout by rollout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub processed: usize,
    pub not_due: usize,
    pub skipped: usize,
    /// Lost a race with another writer; retried on the next pass.
    pub conflicts: usize,
    pub failed: usize,
}

impl PassReport {
    fn is_idle(&self) -> bool {
        self.processed == 0 && self.conflicts == 0 && self.failed == 0
    }
}

/// Drives every active rollout forward.
pub struct RolloutScheduler {
    manager: RolloutManager,
    interval: Duration,
}

impl RolloutScheduler {
    /// Create a scheduler using the manager's configured pass interval.
    pub fn new(manager: RolloutManager) -> Self {
        let interval = manager.config().scheduler.interval();
        Self { manager, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn manager(&self) -> &RolloutManager {
        &self.manager
    }

    /// One pass over every rollout that may need work.
    pub fn run_once(&self) -> SchedulerResult<PassReport> {
        let rollouts = self.manager.store().list_rollouts()?;
        let mut report = PassReport::default();
        for rollout in rollouts.iter().filter(|r| needs_processing(r)) {
            match self.manager.process(rollout) {
                Ok(ProcessOutcome::Processed(status)) => {
                    report.processed += 1;
                    debug!(rollout = rollout.id, %status, "rollout processed");
                }
                Ok(ProcessOutcome::Purged) => {
                    report.processed += 1;
                    debug!(rollout = rollout.id, "rollout purged");
                }
                Ok(ProcessOutcome::NotDue) => report.not_due += 1,
                Ok(ProcessOutcome::Skipped) => report.skipped += 1,
                Err(e) if e.is_conflict() => {
                    report.conflicts += 1;
                    debug!(rollout = rollout.id, error = %e, "rollout changed concurrently");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(rollout = rollout.id, error = %e, "rollout processing failed");
                }
            }
        }
        Ok(report)
    }

    /// Process a single rollout right away, e.g. after an operator action.
    pub fn process_now(&self, id: RolloutId) -> SchedulerResult<ProcessOutcome> {
        Ok(self.manager.process_by_id(id)?)
    }

    /// Run passes until `shutdown` changes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "rollout scheduler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.run_once() {
                        Ok(report) if report.is_idle() => {}
                        Ok(report) => debug!(?report, "scheduler pass complete"),
                        Err(e) => error!(error = %e, "scheduler pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout scheduler shutting down");
                    break;
                }
            }
        }
    }
}

fn needs_processing(rollout: &Rollout) -> bool {
    !rollout.status.is_terminal()
        && !matches!(
            rollout.status,
            RolloutStatus::Paused | RolloutStatus::WaitingForApproval
        )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rollgrid_core::GridConfig;
    use rollgrid_rollout::{GroupDefinition, ManualClock, NullSink, RolloutCreate};
    use rollgrid_state::{
        ActionType, Audit, DistributionSet, DistributionSetId, DistributionSetType,
        SoftwareModule, StateError, StateStore, Target,
    };

    use super::*;

    const START: u64 = 1_700_000_000_000;

    fn setup(config: GridConfig, targets: &[&str]) -> (RolloutManager, Arc<ManualClock>, DistributionSetId) {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let ds = store
            .transaction(|uow| {
                for id in targets {
                    uow.insert_target(&Target::new(id, "test", START))?;
                }
                let mut ds = DistributionSet {
                    id: 0,
                    name: "os".to_string(),
                    version: "1.0".to_string(),
                    ds_type: DistributionSetType {
                        key: "os".to_string(),
                        mandatory_module_types: vec!["os".to_string()],
                        optional_module_types: Vec::new(),
                    },
                    modules: vec![SoftwareModule {
                        module_type: "os".to_string(),
                        name: "linux".to_string(),
                        version: "6.1".to_string(),
                    }],
                    deleted: false,
                    valid: true,
                    audit: Audit::default(),
                };
                uow.insert_distribution_set(&mut ds)?;
                Ok::<_, StateError>(ds.id)
            })
            .unwrap();
        let manager = RolloutManager::new(store, config, clock.clone(), Arc::new(NullSink));
        (manager, clock, ds)
    }

    fn started(manager: &RolloutManager, filter: &str, ds: DistributionSetId) -> RolloutId {
        let rollout = manager
            .create(
                RolloutCreate::new(filter, filter, ds)
                    .with_groups(GroupDefinition::Count { amount: 1 }),
            )
            .unwrap();
        manager.start(rollout.id).unwrap();
        rollout.id
    }

    #[test]
    fn pass_gates_on_last_check() {
        let (manager, clock, ds) = setup(GridConfig::default(), &["a-1", "a-2"]);
        let id = started(&manager, "id==a-*", ds);
        let scheduler = RolloutScheduler::new(manager);

        let first = scheduler.run_once().unwrap();
        assert_eq!(first.processed, 1);
        let second = scheduler.run_once().unwrap();
        assert_eq!(second.not_due, 1);
        assert_eq!(second.processed, 0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(scheduler.run_once().unwrap().processed, 1);
        let rollout = scheduler.manager().store().get_rollout(id).unwrap().unwrap();
        assert_eq!(rollout.status, RolloutStatus::Running);
    }

    #[test]
    fn failing_rollout_does_not_abort_the_pass() {
        let mut config = GridConfig::default();
        config.quota.max_actions_per_target = 1;
        let (manager, _clock, ds) = setup(config, &["a-1", "b-1"]);
        // a-1 already holds its only allowed action.
        manager
            .deployments()
            .assign("a-1", ds, ActionType::Forced, None)
            .unwrap();
        let broken = started(&manager, "id==a-*", ds);
        let healthy = started(&manager, "id==b-*", ds);
        let scheduler = RolloutScheduler::new(manager);

        let report = scheduler.run_once().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);

        let store = scheduler.manager().store();
        assert_eq!(
            store.get_rollout(broken).unwrap().unwrap().status,
            RolloutStatus::Starting
        );
        assert_eq!(
            store.get_rollout(healthy).unwrap().unwrap().status,
            RolloutStatus::Running
        );
    }

    #[test]
    fn paused_rollouts_are_not_visited() {
        let (manager, clock, ds) = setup(GridConfig::default(), &["a-1"]);
        let id = started(&manager, "id==a-*", ds);
        let scheduler = RolloutScheduler::new(manager);
        scheduler.run_once().unwrap();
        scheduler.manager().pause(id).unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(scheduler.run_once().unwrap(), PassReport::default());
        assert_eq!(scheduler.process_now(id).unwrap(), ProcessOutcome::Skipped);
    }

    #[tokio::test]
    async fn run_drives_rollouts_until_shutdown() {
        let mut config = GridConfig::default();
        config.scheduler.delay_between_checks_ms = 0;
        let (manager, _clock, ds) = setup(config, &["a-1"]);
        let id = started(&manager, "id==a-*", ds);
        let scheduler = Arc::new(RolloutScheduler::new(manager).with_interval(Duration::from_millis(5)));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let rollout = scheduler.manager().store().get_rollout(id).unwrap().unwrap();
        assert_eq!(rollout.status, RolloutStatus::Running);
    }
}
