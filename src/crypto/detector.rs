//! Envelope detection
//!
//! Envelopes carry no type marker, so a stored value is classified by
//! shape alone: it must be valid base64 and decode to at least a salt and
//! a nonce. Plaintext that happens to look like long base64 is a false
//! positive; the caller's decrypt then fails and the raw value is kept.
//! Well-formed envelopes are never misclassified as plaintext.

use base64::{engine::general_purpose::STANDARD, Engine};

use super::envelope::HEADER_SIZE;

/// Whether `value` looks like an envelope
pub fn is_envelope(value: &str) -> bool {
    match STANDARD.decode(value) {
        Ok(decoded) => decoded.len() >= HEADER_SIZE,
        Err(_) => false,
    }
}
