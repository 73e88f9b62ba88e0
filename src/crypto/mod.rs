//! Field-level encryption for sealed-ledger
//!
//! Per-user keys are derived from the user id, each field is sealed in a
//! self-contained AES-256-GCM envelope keyed through PBKDF2, and stored
//! values are classified as envelope or legacy plaintext before any
//! decryption is attempted.

pub mod coverage;
pub mod detector;
pub mod entity_codec;
pub mod envelope;
pub mod key_manager;

pub use coverage::{CoverageCount, CoverageLevel, EncryptionCoverage};
pub use detector::is_envelope;
pub use entity_codec::EntityCodec;
pub use envelope::{EnvelopeCodec, HEADER_SIZE, MIN_KDF_ITERATIONS};
pub use key_manager::{KeyManager, UserKey};
