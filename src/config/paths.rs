//! Filesystem locations
//!
//! The base directory is `$SEALED_LEDGER_DATA_DIR` when set, otherwise
//! `sealed-ledger` under the platform config directory. It holds
//! `config.json` and a `data/` directory for the local row store.

use std::path::{Path, PathBuf};

use crate::error::{LedgerError, LedgerResult};

/// Environment variable overriding the base directory
pub const DATA_DIR_ENV: &str = "SEALED_LEDGER_DATA_DIR";

const APP_DIR: &str = "sealed-ledger";

/// Resolved locations for settings and local data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPaths {
    root: PathBuf,
}

impl LedgerPaths {
    /// Resolve from the environment, falling back to the platform config dir
    pub fn new() -> LedgerResult<Self> {
        match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Ok(Self::with_base_dir(dir)),
            _ => {
                let dirs = directories::BaseDirs::new().ok_or_else(|| {
                    LedgerError::Config("Could not determine a config directory".into())
                })?;
                Ok(Self::with_base_dir(dirs.config_dir().join(APP_DIR)))
            }
        }
    }

    /// Use an explicit base directory
    pub fn with_base_dir(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Settings document
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Row store used by `FileStore`
    pub fn store_file(&self) -> PathBuf {
        self.data_dir().join("store.json")
    }

    /// Create the base and data directories if missing
    pub fn ensure_directories(&self) -> LedgerResult<()> {
        let data = self.data_dir();
        std::fs::create_dir_all(&data).map_err(|e| {
            LedgerError::Io(format!("Failed to create {}: {}", data.display(), e))
        })
    }
}
