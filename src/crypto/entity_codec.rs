//! Record-level encryption
//!
//! Applies the envelope codec to the encryption-eligible fields of a record.
//! Writes fail closed: any encryption error aborts the whole record. Reads
//! fail open: a field that cannot be decrypted keeps its stored value so
//! that legacy plaintext and foreign data still render.

use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::{Number, Value};
use tracing::warn;

use super::detector::is_envelope;
use super::envelope::EnvelopeCodec;
use super::key_manager::{KeyManager, UserKey};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{EntityType, Record};

/// Encrypts and decrypts whole records for a session
#[derive(Debug, Clone)]
pub struct EntityCodec {
    keys: Arc<KeyManager>,
    codec: Arc<EnvelopeCodec>,
}

impl EntityCodec {
    /// Create a record codec over a key manager and envelope codec
    pub fn new(keys: Arc<KeyManager>, codec: EnvelopeCodec) -> Self {
        Self {
            keys,
            codec: Arc::new(codec),
        }
    }

    /// The key manager this codec reads from
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Encrypt every present, non-null eligible field of `record`
    pub async fn encrypt_entity(&self, record: &Record, entity: EntityType) -> LedgerResult<Record> {
        let key = self.keys.current_key()?;
        let mut encrypted = record.clone();

        for field in entity.encrypted_fields() {
            let plaintext = match record.get(*field) {
                None | Some(Value::Null) => continue,
                Some(value) => stringify(value)?,
            };

            let codec = Arc::clone(&self.codec);
            let key = Arc::clone(&key);
            let envelope = tokio::task::spawn_blocking(move || codec.encrypt(&plaintext, &key))
                .await
                .map_err(|e| LedgerError::Encryption(format!("Encryption task failed: {}", e)))??;

            encrypted.insert(field.to_string(), Value::String(envelope));
        }

        Ok(encrypted)
    }

    /// Decrypt every eligible field of `record` that holds an envelope
    ///
    /// Only a missing key is an error. Fields that fail to decrypt are left
    /// as stored and logged.
    pub async fn decrypt_entity(&self, record: Record, entity: EntityType) -> LedgerResult<Record> {
        let key = self.keys.current_key()?;
        Ok(self.decrypt_with(record, entity, key).await)
    }

    /// Decrypt a list of records concurrently, preserving order
    pub async fn decrypt_entities(
        &self,
        records: Vec<Record>,
        entity: EntityType,
    ) -> LedgerResult<Vec<Record>> {
        let key = self.keys.current_key()?;
        let tasks = records.into_iter().map(|record| {
            let key = Arc::clone(&key);
            async move { Ok::<_, LedgerError>(self.decrypt_with(record, entity, key).await) }
        });
        try_join_all(tasks).await
    }

    async fn decrypt_with(&self, mut record: Record, entity: EntityType, key: Arc<UserKey>) -> Record {
        for field in entity.encrypted_fields() {
            let envelope = match record.get(*field) {
                Some(Value::String(s)) if is_envelope(s) => s.clone(),
                _ => continue,
            };

            let codec = Arc::clone(&self.codec);
            let key = Arc::clone(&key);
            let result = tokio::task::spawn_blocking(move || codec.decrypt(&envelope, &key))
                .await
                .unwrap_or_else(|e| Err(LedgerError::Decryption(format!("Decryption task failed: {}", e))));

            match result {
                Ok(plaintext) => {
                    let value = if entity.is_numeric_field(field) {
                        parse_number(&plaintext)
                    } else {
                        Value::String(plaintext)
                    };
                    record.insert(field.to_string(), value);
                }
                Err(e) => {
                    warn!(%entity, field = *field, "keeping stored value: {}", e);
                }
            }
        }
        record
    }
}

/// Canonical string form of a field value before encryption
fn stringify(value: &Value) -> LedgerResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => serde_json::to_string(other)
            .map_err(|e| LedgerError::Encryption(format!("Failed to serialize field: {}", e))),
    }
}

/// Parse a decrypted numeric field; anything unparseable reads as 0
fn parse_number(text: &str) -> Value {
    let text = text.trim();
    if let Ok(i) = text.parse::<i64>() {
        return Value::Number(Number::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::Number(Number::from(0)))
}
