//! Configuration module for sealed-ledger
//!
//! This module provides configuration management including:
//! - XDG-compliant path resolution
//! - Settings persistence (key derivation salt, KDF cost, log filter)

pub mod paths;
pub mod settings;

pub use paths::LedgerPaths;
pub use settings::Settings;
