//! Core data models for sealed-ledger
//!
//! Records travel as JSON objects so that encrypted envelopes, legacy
//! plaintext and decrypted numbers can all live in the same column. Typed
//! inputs describe what a caller may write for each entity type.

pub mod budget;
pub mod category;
pub mod entity;
pub mod goal;
pub mod ids;
pub mod transaction;

pub use budget::BudgetInput;
pub use category::Category;
pub use entity::{
    record_id, EntityInput, EntityType, Record, DELETED_COLUMN, ID_COLUMN, OWNER_COLUMN,
};
pub use goal::GoalInput;
pub use ids::OperationId;
pub use transaction::{TransactionInput, TransactionKind};
