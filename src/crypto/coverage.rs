//! Encryption coverage reporting
//!
//! Counts how many stored records already carry envelopes, per entity type.
//! A record counts as encrypted when any of its eligible fields holds an
//! envelope; legacy rows written before encryption show up as the gap.

use std::fmt;

use serde::Serialize;

use super::detector::is_envelope;
use crate::models::{EntityType, Record};

/// Encrypted vs total records for one entity type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoverageCount {
    pub total: usize,
    pub encrypted: usize,
}

impl CoverageCount {
    /// Count stored (not yet decrypted) records
    pub fn count(records: &[Record], entity: EntityType) -> Self {
        let encrypted = records
            .iter()
            .filter(|record| is_encrypted(record, entity))
            .count();
        Self {
            total: records.len(),
            encrypted,
        }
    }

    /// Percentage of records encrypted, rounded; 0 for an empty collection
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        (self.encrypted as f64 * 100.0 / self.total as f64).round() as u32
    }

    fn add(self, other: Self) -> Self {
        Self {
            total: self.total + other.total,
            encrypted: self.encrypted + other.encrypted,
        }
    }
}

/// Overall state of encryption across a user's data
///
/// Banded on the rounded overall percentage: 100, at least 50, above 0,
/// and 0. No data at all reads as 0%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageLevel {
    Full,
    Partial,
    Some,
    None,
}

impl fmt::Display for CoverageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "Fully Encrypted"),
            Self::Partial => write!(f, "Partially Encrypted"),
            Self::Some => write!(f, "Some Encrypted"),
            Self::None => write!(f, "Not Encrypted"),
        }
    }
}

/// Per-entity coverage report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EncryptionCoverage {
    pub transactions: CoverageCount,
    pub budgets: CoverageCount,
    pub goals: CoverageCount,
}

impl EncryptionCoverage {
    /// Coverage for a single entity type
    pub fn get(&self, entity: EntityType) -> CoverageCount {
        match entity {
            EntityType::Transaction => self.transactions,
            EntityType::Budget => self.budgets,
            EntityType::Goal => self.goals,
        }
    }

    /// Record the count for an entity type
    pub fn set(&mut self, entity: EntityType, count: CoverageCount) {
        match entity {
            EntityType::Transaction => self.transactions = count,
            EntityType::Budget => self.budgets = count,
            EntityType::Goal => self.goals = count,
        }
    }

    /// Totals across all entity types
    pub fn overall(&self) -> CoverageCount {
        self.transactions.add(self.budgets).add(self.goals)
    }

    pub fn level(&self) -> CoverageLevel {
        match self.overall().percent() {
            100.. => CoverageLevel::Full,
            50..=99 => CoverageLevel::Partial,
            1..=49 => CoverageLevel::Some,
            0 => CoverageLevel::None,
        }
    }
}

fn is_encrypted(record: &Record, entity: EntityType) -> bool {
    entity.encrypted_fields().iter().any(|field| {
        record
            .get(*field)
            .and_then(|v| v.as_str())
            .map(is_envelope)
            .unwrap_or(false)
    })
}
