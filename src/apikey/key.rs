//! API key format, generation and hashing.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Prefix of every live key.
pub const KEY_PREFIX: &str = "pk_live_";

/// Random characters following the prefix.
const SECRET_LEN: usize = 32;

/// Characters of the key kept in clear for display.
const DISPLAY_PREFIX_LEN: usize = KEY_PREFIX.len() + 4;

/// A freshly generated key. The full value is shown to the owner once;
/// only [`hash`](Self::hash) is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    value: String,
}

impl ApiKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let secret: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LEN)
            .map(char::from)
            .collect();

        Self {
            value: format!("{KEY_PREFIX}{secret}"),
        }
    }

    /// The full key.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// SHA-256 hex digest of the key, as stored.
    pub fn hash(&self) -> String {
        hash_key(&self.value)
    }

    /// Leading characters safe to display.
    pub fn display_prefix(&self) -> &str {
        &self.value[..DISPLAY_PREFIX_LEN]
    }
}

/// SHA-256 hex digest of a presented key.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Whether `key` has the shape of a live key.
pub fn is_well_formed(key: &str) -> bool {
    match key.strip_prefix(KEY_PREFIX) {
        Some(secret) => {
            secret.len() == SECRET_LEN && secret.bytes().all(|b| b.is_ascii_alphanumeric())
        }
        None => false,
    }
}
