//! Savings goal input model

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::entity::{validate_amount, EntityInput, EntityType};
use crate::error::{LedgerError, LedgerResult};

fn default_current_amount() -> String {
    "0".to_string()
}

/// A savings goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalInput {
    pub name: String,
    pub target_amount: String,
    #[serde(default = "default_current_amount")]
    pub current_amount: String,
    pub deadline: Option<NaiveDate>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

impl GoalInput {
    /// Create a goal starting from zero saved
    pub fn new(name: impl Into<String>, target_amount: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_amount: target_amount.into(),
            current_amount: default_current_amount(),
            deadline: None,
            icon: None,
            color: None,
        }
    }

    /// Set the amount already saved
    pub fn with_current(mut self, current_amount: impl Into<String>) -> Self {
        self.current_amount = current_amount.into();
        self
    }

    /// Set the deadline
    pub fn with_deadline(mut self, deadline: NaiveDate) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl EntityInput for GoalInput {
    const ENTITY: EntityType = EntityType::Goal;

    fn validate(&self) -> LedgerResult<()> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::Validation("Goal name must not be empty".into()));
        }
        validate_amount("target_amount", &self.target_amount)?;
        validate_amount("current_amount", &self.current_amount)
    }
}
