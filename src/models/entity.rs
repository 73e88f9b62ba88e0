//! Entity types and their encryption-eligible fields

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LedgerError, LedgerResult};

/// A row as exchanged with the remote store
pub type Record = Map<String, Value>;

/// Primary key column
pub const ID_COLUMN: &str = "id";

/// Owner column used for row-level scoping
pub const OWNER_COLUMN: &str = "user_id";

/// Soft-delete flag column
pub const DELETED_COLUMN: &str = "is_deleted";

/// The record kinds that carry encrypted fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Transaction,
    Budget,
    Goal,
}

impl EntityType {
    /// Every entity type, in a fixed order
    pub const ALL: [EntityType; 3] = [Self::Transaction, Self::Budget, Self::Goal];

    /// Remote table backing this entity type
    pub fn table(self) -> &'static str {
        match self {
            Self::Transaction => "transactions",
            Self::Budget => "budgets",
            Self::Goal => "goals",
        }
    }

    /// Look up the entity type stored in `table`
    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.table() == table)
    }

    /// Fields encrypted before they leave the device, in fixed order
    pub fn encrypted_fields(self) -> &'static [&'static str] {
        match self {
            Self::Transaction => &["amount", "description"],
            Self::Budget => &["amount"],
            Self::Goal => &["name", "target_amount", "current_amount"],
        }
    }

    /// Whether `field` holds a number once decrypted
    pub fn is_numeric_field(self, field: &str) -> bool {
        matches!(field, "amount" | "target_amount" | "current_amount")
            && self.encrypted_fields().contains(&field)
    }

    /// Transactions are flagged deleted; budgets and goals are removed
    pub fn soft_deletes(self) -> bool {
        matches!(self, Self::Transaction)
    }

    /// Whether rows reference a category and carry its `{name, color}` join
    pub fn has_category(self) -> bool {
        matches!(self, Self::Transaction | Self::Budget)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction => write!(f, "Transaction"),
            Self::Budget => write!(f, "Budget"),
            Self::Goal => write!(f, "Goal"),
        }
    }
}

/// Get the `id` column of a record, if it is a string
pub fn record_id(record: &Record) -> Option<&str> {
    record.get(ID_COLUMN).and_then(Value::as_str)
}

/// Whether a record carries the soft-delete flag
pub fn is_soft_deleted(record: &Record) -> bool {
    record
        .get(DELETED_COLUMN)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// A typed write payload for one entity type
pub trait EntityInput: Serialize + Send + Sync + 'static {
    /// The entity type this input writes
    const ENTITY: EntityType;

    /// Check the input before anything is applied
    fn validate(&self) -> LedgerResult<()> {
        Ok(())
    }

    /// Category referenced by this input, for denormalized display data
    fn category_id(&self) -> Option<&str> {
        None
    }

    /// Render the input as a plaintext record
    fn to_record(&self) -> LedgerResult<Record> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(LedgerError::Validation(format!(
                "{} input must serialize to an object, got {}",
                Self::ENTITY,
                other
            ))),
        }
    }
}

/// Require a decimal amount string
pub(crate) fn validate_amount(field: &str, value: &str) -> LedgerResult<()> {
    match value.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(()),
        _ => Err(LedgerError::Validation(format!(
            "{} must be a decimal number, got '{}'",
            field, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tables_round_trip() {
        for entity in EntityType::ALL {
            assert_eq!(EntityType::from_table(entity.table()), Some(entity));
        }
        assert_eq!(EntityType::from_table("notifications"), None);
    }

    #[test]
    fn test_encrypted_fields() {
        assert_eq!(
            EntityType::Transaction.encrypted_fields(),
            &["amount", "description"]
        );
        assert_eq!(EntityType::Budget.encrypted_fields(), &["amount"]);
        assert_eq!(
            EntityType::Goal.encrypted_fields(),
            &["name", "target_amount", "current_amount"]
        );
    }

    #[test]
    fn test_numeric_fields() {
        assert!(EntityType::Transaction.is_numeric_field("amount"));
        assert!(!EntityType::Transaction.is_numeric_field("description"));
        assert!(EntityType::Goal.is_numeric_field("target_amount"));
        assert!(!EntityType::Goal.is_numeric_field("name"));
        assert!(!EntityType::Budget.is_numeric_field("current_amount"));
    }

    #[test]
    fn test_category_join() {
        assert!(EntityType::Transaction.has_category());
        assert!(EntityType::Budget.has_category());
        assert!(!EntityType::Goal.has_category());
    }

    #[test]
    fn test_record_helpers() {
        let record = json!({"id": "abc", "is_deleted": true});
        let record = record.as_object().unwrap();
        assert_eq!(record_id(record), Some("abc"));
        assert!(is_soft_deleted(record));
        assert!(!is_soft_deleted(&Record::new()));
    }

    #[test]
    fn test_validate_amount() {
        assert!(validate_amount("amount", "42.00").is_ok());
        assert!(validate_amount("amount", " -3 ").is_ok());
        assert!(validate_amount("amount", "abc").is_err());
        assert!(validate_amount("amount", "NaN").is_err());
    }
}
