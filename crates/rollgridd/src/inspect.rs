//! `rollgridd inspect`: dump rollouts and their groups as JSON.

use rollgrid_rollout::GroupCounts;
use rollgrid_state::{StateResult, StateStore, StateView};
use serde_json::{Value, json};

/// Every rollout with its groups and their current action counts, read
/// from one snapshot.
pub fn report(store: &StateStore) -> StateResult<Value> {
    let snapshot = store.snapshot()?;
    let mut rollouts = Vec::new();
    for rollout in snapshot.list_rollouts()? {
        let mut groups = Vec::new();
        for group in snapshot.list_groups(rollout.id)? {
            let counts = GroupCounts::collect(&snapshot, &group)?;
            groups.push(json!({ "group": group, "counts": counts }));
        }
        rollouts.push(json!({ "rollout": rollout, "groups": groups }));
    }
    Ok(json!({ "rollouts": rollouts }))
}
