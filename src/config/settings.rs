//! Settings for sealed-ledger
//!
//! Holds the key derivation constant, the per-field KDF cost, the default
//! log filter and the prefix used for provisional record ids.

use serde::{Deserialize, Serialize};

use super::paths::LedgerPaths;
use crate::crypto::envelope::MIN_KDF_ITERATIONS;
use crate::error::LedgerError;
use crate::storage::file_io::{read_json, write_json_atomic};

/// Settings for a sealed-ledger client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Schema version for migration support
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Application-wide constant appended to the user id before hashing.
    /// Changing it makes every previously written envelope unreadable.
    #[serde(default = "default_app_salt")]
    pub app_salt: String,

    /// PBKDF2 rounds used for every envelope (minimum 100 000)
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Default tracing filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Prefix for ids of records that exist only in the local cache
    #[serde(default = "default_temp_id_prefix")]
    pub temp_id_prefix: String,
}

fn default_schema_version() -> u32 {
    1
}

fn default_app_salt() -> String {
    "-sealed-ledger-encryption-salt-v1".to_string()
}

fn default_kdf_iterations() -> u32 {
    MIN_KDF_ITERATIONS
}

fn default_log_filter() -> String {
    "sealed_ledger=info".to_string()
}

fn default_temp_id_prefix() -> String {
    "temp-".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            app_salt: default_app_salt(),
            kdf_iterations: default_kdf_iterations(),
            log_filter: default_log_filter(),
            temp_id_prefix: default_temp_id_prefix(),
        }
    }
}

impl Settings {
    /// Load settings from disk, or defaults if there is no settings file yet
    ///
    /// Defaults are not written back; call `save` to persist them.
    pub fn load_or_create(paths: &LedgerPaths) -> Result<Self, LedgerError> {
        let settings: Settings = read_json(paths.settings_file())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self, paths: &LedgerPaths) -> Result<(), LedgerError> {
        self.validate()?;
        paths.ensure_directories()?;
        write_json_atomic(paths.settings_file(), self)
    }

    /// Reject settings that would weaken or break the envelope format
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.app_salt.is_empty() {
            return Err(LedgerError::Config("app_salt must not be empty".into()));
        }
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(LedgerError::Config(format!(
                "kdf_iterations must be at least {}, got {}",
                MIN_KDF_ITERATIONS, self.kdf_iterations
            )));
        }
        if self.temp_id_prefix.is_empty() {
            return Err(LedgerError::Config(
                "temp_id_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}
