//! Transaction input model

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::entity::{validate_amount, EntityInput, EntityType};
use crate::error::LedgerResult;

/// Direction of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Income,
    #[default]
    Expense,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Income => write!(f, "income"),
            Self::Expense => write!(f, "expense"),
        }
    }
}

/// Fields a caller supplies when creating or editing a transaction
///
/// `amount` stays a decimal string so the exact text the user typed is what
/// gets encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub amount: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub category_id: Option<String>,
}

impl TransactionInput {
    /// Create an input with no description or category
    pub fn new(amount: impl Into<String>, kind: TransactionKind, date: NaiveDate) -> Self {
        Self {
            amount: amount.into(),
            kind,
            description: None,
            date,
            category_id: None,
        }
    }

    /// Set the description; blank text is stored as null
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.description = (!description.trim().is_empty()).then_some(description);
        self
    }

    /// Set the category
    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }
}

impl EntityInput for TransactionInput {
    const ENTITY: EntityType = EntityType::Transaction;

    fn validate(&self) -> LedgerResult<()> {
        validate_amount("amount", &self.amount)
    }

    fn category_id(&self) -> Option<&str> {
        self.category_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn test_to_record_shape() {
        let input = TransactionInput::new("42.00", TransactionKind::Expense, date());
        let record = input.to_record().unwrap();

        assert_eq!(record["amount"], json!("42.00"));
        assert_eq!(record["type"], json!("expense"));
        assert_eq!(record["date"], json!("2024-05-01"));
        assert_eq!(record["description"], json!(null));
        assert_eq!(record["category_id"], json!(null));
    }

    #[test]
    fn test_blank_description_is_null() {
        let input = TransactionInput::new("1", TransactionKind::Income, date()).with_description("  ");
        assert_eq!(input.description, None);
    }

    #[test]
    fn test_validate() {
        assert!(TransactionInput::new("12.5", TransactionKind::Income, date())
            .validate()
            .is_ok());
        assert!(TransactionInput::new("twelve", TransactionKind::Income, date())
            .validate()
            .is_err());
    }
}
