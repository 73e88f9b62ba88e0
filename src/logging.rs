//! Tracing setup for applications embedding sealed-ledger
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the host. `init` is a convenience for hosts without their own setup.

use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::error::{LedgerError, LedgerResult};

/// Build the filter: `RUST_LOG` wins, otherwise `settings.log_filter`
pub fn filter(settings: &Settings) -> LedgerResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.log_filter).map_err(|e| {
            LedgerError::Config(format!("Invalid log filter '{}': {}", settings.log_filter, e))
        }),
    }
}

/// Install a global fmt subscriber
///
/// Fails if the filter is invalid or a subscriber is already installed.
pub fn init(settings: &Settings) -> LedgerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(settings)?)
        .try_init()
        .map_err(|e| LedgerError::Config(format!("Failed to install tracing subscriber: {}", e)))
}

#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
