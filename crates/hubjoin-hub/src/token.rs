//! Bootstrap token generation and validation.
//!
//! Bootstrap tokens are the bearer credentials carried in an agent's
//! bootstrap kubeconfig. The hub only ever stores their SHA-256 hash.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// A bootstrap token known to the hub.
#[derive(Debug, Clone)]
pub struct BootstrapToken {
    /// SHA-256 hash of the token (hex encoded).
    pub token_hash: String,

    /// When the token was registered.
    pub created_at: DateTime<Utc>,

    /// When the token stops being accepted, if ever.
    pub expires_at: Option<DateTime<Utc>>,
}

impl BootstrapToken {
    /// Register a token hash that never expires.
    pub fn new(token_hash: impl Into<String>) -> Self {
        Self {
            token_hash: token_hash.into(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Register a token hash accepted for `validity_hours`.
    pub fn expiring(token_hash: impl Into<String>, validity_hours: u64) -> Self {
        let mut token = Self::new(token_hash);
        token.expires_at = Some(token.created_at + Duration::hours(validity_hours as i64));
        token
    }

    /// Check if the token is still accepted at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Generate a new bootstrap token.
///
/// Returns a tuple of (plaintext_token, token_hash). The plaintext goes into
/// the agent's bootstrap kubeconfig; the hash is what the hub is started with.
pub fn generate_bootstrap_token() -> (String, String) {
    let mut token_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token_bytes);

    let plaintext = URL_SAFE_NO_PAD.encode(token_bytes);
    let token_hash = hash_token(&plaintext);

    (plaintext, token_hash)
}

/// Hash a token using SHA-256.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
