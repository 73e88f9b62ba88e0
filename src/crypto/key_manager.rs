//! Session key management
//!
//! Derives the per-user 256-bit key from the stable user id and a fixed
//! application salt, and holds it for the lifetime of a session.
//!
//! Derivation is deterministic: the same user id yields the same key on
//! every device, so no key exchange is needed. The flip side is that the
//! key is only as secret as the user id and the application salt.

use std::fmt;
use std::sync::{Arc, RwLock};

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{LedgerError, LedgerResult};

/// Length of the user key in bytes
pub const KEY_LENGTH: usize = 32;

/// A derived per-user key
///
/// Key bytes are zeroized on drop. `Debug` never prints key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct UserKey {
    key: [u8; KEY_LENGTH],
}

impl UserKey {
    /// Derive the key for `user_id` under `app_salt`
    pub fn derive(user_id: &str, app_salt: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(app_salt.as_bytes());
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&hasher.finalize());
        Self { key }
    }

    /// Restore a key from its base64 text form
    pub fn from_base64(encoded: &str) -> LedgerResult<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|e| LedgerError::Validation(format!("Invalid key encoding: {}", e)))?,
        );
        if bytes.len() != KEY_LENGTH {
            return Err(LedgerError::Validation(format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Base64 text form of the key
    ///
    /// This is the storage form and the password fed to the per-envelope KDF.
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(&self.key))
    }
}

impl PartialEq for UserKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for UserKey {}

impl fmt::Debug for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserKey").finish_non_exhaustive()
    }
}

struct ActiveKey {
    user_id: String,
    key: Arc<UserKey>,
}

/// Holds the session key between login and logout
///
/// One instance per session; share it as `Arc<KeyManager>`. The key is
/// replaced wholesale on `initialize` and `clear`, never mutated in place.
pub struct KeyManager {
    app_salt: String,
    active: RwLock<Option<ActiveKey>>,
}

impl KeyManager {
    /// Create a manager with no key loaded
    pub fn new(app_salt: impl Into<String>) -> Self {
        Self {
            app_salt: app_salt.into(),
            active: RwLock::new(None),
        }
    }

    /// Derive and store the key for `user_id`
    ///
    /// Idempotent for repeated calls with the same id. A different id
    /// replaces the previous key.
    pub fn initialize(&self, user_id: &str) -> LedgerResult<Arc<UserKey>> {
        if user_id.trim().is_empty() {
            return Err(LedgerError::Validation("User id must not be empty".into()));
        }

        let mut active = self.active.write().map_err(|e| {
            LedgerError::Storage(format!("Failed to acquire key lock: {}", e))
        })?;

        if let Some(current) = active.as_ref() {
            if current.user_id == user_id {
                debug!("session key already initialized");
                return Ok(Arc::clone(&current.key));
            }
        }

        let key = Arc::new(UserKey::derive(user_id, &self.app_salt));
        *active = Some(ActiveKey {
            user_id: user_id.to_string(),
            key: Arc::clone(&key),
        });
        info!("session key initialized");
        Ok(key)
    }

    /// Get the current key
    pub fn current_key(&self) -> LedgerResult<Arc<UserKey>> {
        let active = self.active.read().map_err(|e| {
            LedgerError::Storage(format!("Failed to acquire key lock: {}", e))
        })?;
        active
            .as_ref()
            .map(|a| Arc::clone(&a.key))
            .ok_or(LedgerError::NotInitialized)
    }

    /// Whether a key is loaded
    pub fn is_ready(&self) -> bool {
        self.active.read().map(|a| a.is_some()).unwrap_or(false)
    }

    /// Drop the key on logout
    ///
    /// The bytes are zeroized once the last outstanding `Arc` is released.
    pub fn clear(&self) {
        if let Ok(mut active) = self.active.write() {
            if active.take().is_some() {
                info!("session key cleared");
            }
        }
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}
