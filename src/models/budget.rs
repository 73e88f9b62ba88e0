//! Budget input model

use serde::{Deserialize, Serialize};

use super::entity::{validate_amount, EntityInput, EntityType};
use crate::error::{LedgerError, LedgerResult};

/// A monthly spending limit for a category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetInput {
    pub amount: String,
    pub category_id: Option<String>,
    pub month: u32,
    pub year: i32,
}

impl BudgetInput {
    /// Create a budget input for `month`/`year`
    pub fn new(amount: impl Into<String>, month: u32, year: i32) -> Self {
        Self {
            amount: amount.into(),
            category_id: None,
            month,
            year,
        }
    }

    /// Set the category
    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }
}

impl EntityInput for BudgetInput {
    const ENTITY: EntityType = EntityType::Budget;

    fn validate(&self) -> LedgerResult<()> {
        validate_amount("amount", &self.amount)?;
        if !(1..=12).contains(&self.month) {
            return Err(LedgerError::Validation(format!(
                "month must be between 1 and 12, got {}",
                self.month
            )));
        }
        Ok(())
    }

    fn category_id(&self) -> Option<&str> {
        self.category_id.as_deref()
    }
}
