//! API-key rows for machine callers.
//!
//! Issuance and the HTTP surface around keys live outside this crate;
//! the row shape, secret hashing, and rate-limit ledger keys are defined
//! here because the persistence layer stores them. The secret itself is
//! never stored: only its salted hash and a short display prefix survive.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::usage::UsageResource;

/// Leading characters of the secret kept for display ("vk_12ab…").
const DISPLAY_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub owner_id: String,
    pub secret_hash: String,
    pub prefix: String,
    pub resources: Vec<UsageResource>,
    pub active: bool,
    #[serde(default)]
    pub expires_at_ms: Option<u64>,
    #[serde(default)]
    pub last_used_at_ms: Option<u64>,
}

impl ApiKeyRecord {
    pub fn is_usable(&self, now_ms: u64) -> bool {
        self.active && self.expires_at_ms.map(|at| now_ms < at).unwrap_or(true)
    }

    pub fn permits(&self, resource: UsageResource) -> bool {
        self.resources.contains(&resource)
    }
}

/// Salted SHA-256 of an API-key secret, hex encoded.
pub fn hash_secret(secret: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

pub fn verify_secret(secret: &str, salt: &str, stored_hash: &str) -> bool {
    hash_secret(secret, salt) == stored_hash
}

/// The display fragment retained alongside the hash.
pub fn display_prefix(secret: &str) -> String {
    secret.chars().take(DISPLAY_PREFIX_LEN).collect()
}

/// Ledger key for per-key rate-limit counters: one row per key, endpoint
/// bucket, and window start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateWindowKey {
    pub key_id: String,
    pub endpoint_bucket: String,
    pub window_start_ms: u64,
}

impl RateWindowKey {
    /// Align a timestamp down to its window.
    pub fn new(key_id: &str, endpoint_bucket: &str, now_ms: u64, window_ms: u64) -> Self {
        let window_ms = window_ms.max(1);
        Self {
            key_id: key_id.to_string(),
            endpoint_bucket: endpoint_bucket.to_string(),
            window_start_ms: now_ms - (now_ms % window_ms),
        }
    }
}
