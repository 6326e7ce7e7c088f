//! Group partitioning: turns group plans into disjoint target claims.
//!
//! Groups are filled in index order. Each group takes its percentage of the
//! targets that match the rollout filter (narrowed by the group filter) and
//! are not yet claimed by an earlier group; the last group takes whatever
//! is left. Only targets created before the rollout are considered, so
//! devices registering during creation don't shift the split.

use std::collections::HashSet;

use rollgrid_state::{
    GroupMember, Page, Rollout, RolloutGroup, StateView, TargetFilter, TargetId, TargetQuery,
    UnitOfWork,
};

use crate::error::{RolloutError, RolloutResult};
use crate::strategy::GroupPlan;

/// Number of targets a group with `percentage` takes from a pool.
pub fn group_share(pool: u64, percentage: f64) -> u64 {
    let exact = pool as f64 * percentage / 100.0;
    // Float noise must not round 30% of 10 up to 4.
    let share = (exact - 1e-9).ceil().max(0.0) as u64;
    share.min(pool)
}

struct Share<'a> {
    base: &'a TargetFilter,
    narrow: Option<&'a TargetFilter>,
    percentage: f64,
    is_last: bool,
    created_until: u64,
}

fn select<V: StateView>(
    view: &V,
    share: &Share<'_>,
    claimed: &HashSet<TargetId>,
    page_size: usize,
) -> RolloutResult<Vec<TargetId>> {
    // The last group absorbs every unclaimed target of the rollout filter.
    let narrow = if share.is_last { None } else { share.narrow };
    let query = TargetQuery::new(share.base)
        .narrowed_by(narrow)
        .excluding(claimed)
        .created_until(share.created_until);
    let pool = view.count_targets(&query)?;
    let take = if share.is_last {
        pool
    } else {
        group_share(pool, share.percentage)
    } as usize;

    let mut selected = Vec::with_capacity(take);
    let mut page = Page::first(page_size.max(1));
    while selected.len() < take {
        let slice = view.select_targets(&query, page)?;
        let remaining = take - selected.len();
        selected.extend(slice.items.into_iter().take(remaining));
        if !slice.has_more {
            break;
        }
        page = page.next();
    }
    Ok(selected)
}

fn parse_narrow(filter: Option<&str>) -> RolloutResult<Option<TargetFilter>> {
    Ok(filter.map(TargetFilter::parse).transpose()?)
}

pub(crate) fn check_group_quota(size: u64, limit: u64) -> RolloutResult<()> {
    if size > limit {
        return Err(RolloutError::QuotaExceeded {
            kind: "targets per group",
            requested: size,
            limit,
        });
    }
    Ok(())
}

/// Group sizes the plans would produce right now. Claims nothing.
pub(crate) fn dry_run<V: StateView>(
    view: &V,
    base: &TargetFilter,
    plans: &[GroupPlan],
    created_until: u64,
    page_size: usize,
) -> RolloutResult<Vec<u64>> {
    let mut claimed = HashSet::new();
    let mut sizes = Vec::with_capacity(plans.len());
    for (index, plan) in plans.iter().enumerate() {
        let narrow = parse_narrow(plan.target_filter.as_deref())?;
        let share = Share {
            base,
            narrow: narrow.as_ref(),
            percentage: plan.target_percentage,
            is_last: index + 1 == plans.len(),
            created_until,
        };
        let ids = select(view, &share, &claimed, page_size)?;
        sizes.push(ids.len() as u64);
        claimed.extend(ids);
    }
    Ok(sizes)
}

/// Claim the targets of one group. Returns the number claimed.
pub(crate) fn populate_group(
    uow: &UnitOfWork,
    rollout: &Rollout,
    group: &RolloutGroup,
    page_size: usize,
    max_targets: u64,
) -> RolloutResult<u64> {
    let base = TargetFilter::parse(&rollout.target_filter)?;
    let narrow = parse_narrow(group.target_filter.as_deref())?;
    let claimed = uow.claimed_targets(rollout.id)?;
    let share = Share {
        base: &base,
        narrow: narrow.as_ref(),
        percentage: group.target_percentage,
        is_last: group.index + 1 == rollout.group_count,
        created_until: rollout.audit.created_at,
    };
    let ids = select(uow, &share, &claimed, page_size)?;
    check_group_quota(ids.len() as u64, max_targets)?;

    let mut count = 0;
    for target_id in ids {
        let member = GroupMember {
            rollout_id: rollout.id,
            group_id: group.id,
            target_id,
            in_sync: false,
        };
        if uow.claim_target(&member)? {
            count += 1;
        }
    }
    Ok(count)
}
