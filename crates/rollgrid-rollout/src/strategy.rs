//! Rollout definitions and how a new rollout is split into groups.

use rollgrid_core::Quotas;
use rollgrid_state::{
    ActionType, DistributionSetId, ErrorCondition, GroupConditions, SuccessCondition, TargetFilter,
};

use crate::deployment::SYSTEM_ACTOR;
use crate::error::{RolloutError, RolloutResult};

/// How the rollout's targets are split into groups.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupDefinition {
    /// `amount` groups of roughly equal size, all using the rollout-level
    /// conditions.
    Count { amount: u32 },
    /// Groups defined one by one, in start order.
    Explicit(Vec<GroupCreate>),
}

/// One explicitly defined group.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GroupCreate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Share of the remaining matching targets (0 < p <= 100).
    pub target_percentage: f64,
    /// Further narrows the rollout filter for this group.
    #[serde(default)]
    pub target_filter: Option<String>,
    /// Falls back to the rollout-level conditions.
    #[serde(default)]
    pub conditions: Option<GroupConditions>,
    #[serde(default)]
    pub confirmation_required: bool,
}

impl GroupCreate {
    pub fn new(name: &str, target_percentage: f64) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            target_percentage,
            target_filter: None,
            conditions: None,
            confirmation_required: false,
        }
    }

    pub fn with_filter(mut self, filter: &str) -> Self {
        self.target_filter = Some(filter.to_string());
        self
    }

    pub fn with_conditions(mut self, conditions: GroupConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }
}

/// Everything needed to create a rollout.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RolloutCreate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub target_filter: String,
    pub distribution_set_id: DistributionSetId,
    pub action_type: ActionType,
    #[serde(default)]
    pub forced_time: Option<u64>,
    /// Start automatically once this time is reached.
    #[serde(default)]
    pub start_at: Option<u64>,
    pub groups: GroupDefinition,
    /// Default conditions for groups that don't define their own.
    #[serde(default)]
    pub conditions: GroupConditions,
    #[serde(default)]
    pub confirmation_required: bool,
    pub created_by: String,
}

impl RolloutCreate {
    pub fn new(name: &str, target_filter: &str, distribution_set_id: DistributionSetId) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            target_filter: target_filter.to_string(),
            distribution_set_id,
            action_type: ActionType::Forced,
            forced_time: None,
            start_at: None,
            groups: GroupDefinition::Count { amount: 1 },
            conditions: GroupConditions::default(),
            confirmation_required: false,
            created_by: SYSTEM_ACTOR.to_string(),
        }
    }

    pub fn with_groups(mut self, groups: GroupDefinition) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_conditions(mut self, conditions: GroupConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_action_type(mut self, action_type: ActionType, forced_time: Option<u64>) -> Self {
        self.action_type = action_type;
        self.forced_time = forced_time;
        self
    }

    pub fn starting_at(mut self, millis: u64) -> Self {
        self.start_at = Some(millis);
        self
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.confirmation_required = true;
        self
    }

    /// Validate the request and expand it into one plan per group.
    pub(crate) fn plan_groups(&self, quotas: &Quotas) -> RolloutResult<Vec<GroupPlan>> {
        if self.name.trim().is_empty() {
            return Err(RolloutError::Validation("rollout name is empty".to_string()));
        }
        if self.action_type == ActionType::TimeForced && self.forced_time.is_none() {
            return Err(RolloutError::Validation(
                "time forced rollout needs a forced time".to_string(),
            ));
        }
        TargetFilter::parse(&self.target_filter)?;
        validate_conditions(&self.conditions)?;

        let requested = match &self.groups {
            GroupDefinition::Count { amount } => *amount,
            GroupDefinition::Explicit(groups) => groups.len() as u32,
        };
        if requested == 0 {
            return Err(RolloutError::Validation(
                "a rollout needs at least one group".to_string(),
            ));
        }
        if requested > quotas.max_groups_per_rollout {
            return Err(RolloutError::QuotaExceeded {
                kind: "groups per rollout",
                requested: requested.into(),
                limit: quotas.max_groups_per_rollout.into(),
            });
        }

        match &self.groups {
            GroupDefinition::Count { amount } => Ok((0..*amount)
                .map(|i| GroupPlan {
                    name: format!("group-{}", i + 1),
                    description: String::new(),
                    // Each group takes an equal share of what is still unclaimed.
                    target_percentage: 100.0 / f64::from(amount - i),
                    target_filter: None,
                    conditions: self.conditions,
                    confirmation_required: self.confirmation_required,
                })
                .collect()),
            GroupDefinition::Explicit(groups) => groups
                .iter()
                .map(|group| self.plan_explicit(group))
                .collect(),
        }
    }

    fn plan_explicit(&self, group: &GroupCreate) -> RolloutResult<GroupPlan> {
        if group.name.trim().is_empty() {
            return Err(RolloutError::Validation("group name is empty".to_string()));
        }
        let pct = group.target_percentage;
        if !pct.is_finite() || pct <= 0.0 || pct > 100.0 {
            return Err(RolloutError::Validation(format!(
                "group {}: target percentage {pct} is outside (0, 100]",
                group.name
            )));
        }
        if let Some(filter) = &group.target_filter {
            TargetFilter::parse(filter)?;
        }
        let conditions = group.conditions.unwrap_or(self.conditions);
        validate_conditions(&conditions)?;
        Ok(GroupPlan {
            name: group.name.clone(),
            description: group.description.clone(),
            target_percentage: pct,
            target_filter: group.target_filter.clone(),
            conditions,
            confirmation_required: group.confirmation_required || self.confirmation_required,
        })
    }
}

/// A validated group definition, ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GroupPlan {
    pub name: String,
    pub description: String,
    pub target_percentage: f64,
    pub target_filter: Option<String>,
    pub conditions: GroupConditions,
    pub confirmation_required: bool,
}

fn validate_conditions(conditions: &GroupConditions) -> RolloutResult<()> {
    let SuccessCondition::Threshold(success) = conditions.success_condition;
    if success > 100 {
        return Err(RolloutError::Validation(format!(
            "success threshold {success} is above 100"
        )));
    }
    if let Some(ErrorCondition::Threshold(error)) = conditions.error_condition
        && !(1..=100).contains(&error)
    {
        return Err(RolloutError::Validation(format!(
            "error threshold {error} is outside 1..=100"
        )));
    }
    Ok(())
}
