//! sealed-ledger - client-side field encryption and optimistic sync
//!
//! Protects selected financial fields before they leave the device and
//! keeps a local cache of decrypted records consistent with a remote row
//! store, despite concurrent local edits, server-pushed change events and
//! a mix of encrypted and legacy plaintext values.
//!
//! # Architecture
//!
//! - `config`: path resolution and settings
//! - `error`: the crate error type
//! - `crypto`: key derivation, envelopes, plaintext detection, record codec
//! - `models`: entity types, records and typed inputs
//! - `storage`: the remote store boundary and its in-memory/file backends
//! - `sync`: collection cache, optimistic mutations, change subscriptions
//! - `client`: the session facade tying it together
//! - `logging`: optional tracing subscriber setup
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sealed_ledger::{config::{LedgerPaths, Settings}, storage::FileStore, LedgerClient};
//!
//! let paths = LedgerPaths::new()?;
//! let settings = Settings::load_or_create(&paths)?;
//! let client = LedgerClient::new(settings, Arc::new(FileStore::open_default(&paths)?))?;
//! client.login("user-123")?;
//! client.watch(EntityType::Transaction).await?;
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod models;
pub mod storage;
pub mod sync;

pub use client::LedgerClient;
pub use error::{LedgerError, LedgerResult};
pub use models::EntityType;
