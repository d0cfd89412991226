//! Identity data model and the store interface the gateway resolves keys
//! against.
//!
//! The authoritative key registry belongs to the hosting platform.  The
//! gateway only needs two calls from it (look a key up by fingerprint and
//! record that it was used) plus a listing for regenerating
//! `authorized_keys`.  Both backends ([`memory`] and [`api`]) implement
//! [`IdentityStore`].

pub mod api;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::IdentityStoreConfig;

pub use api::ApiIdentityStore;
pub use memory::MemoryIdentityStore;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An authenticated platform user.  Bound once per connection and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Opaque user identifier assigned by the platform.
    pub id: String,
    /// Account name; doubles as the user's repository namespace.
    pub login: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.login, self.id)
    }
}

/// A registered SSH public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedKey {
    /// `SHA256:<base64>` fingerprint of the key blob.  Globally unique.
    pub fingerprint: String,
    /// Algorithm name, e.g. `ssh-ed25519`.
    pub key_type: String,
    /// Base64 public key blob as it appears in `authorized_keys`.
    pub key_blob: String,
    pub owner: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// The subset of a key record returned by a fingerprint lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub owner: Identity,
    pub key_type: String,
    pub key_blob: String,
}

impl From<&AuthorizedKey> for StoredKey {
    fn from(key: &AuthorizedKey) -> Self {
        Self {
            owner: key.owner.clone(),
            key_type: key.key_type.clone(),
            key_blob: key.key_blob.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store interface
// ---------------------------------------------------------------------------

/// Lookup interface onto the platform's key registry.
///
/// Implementations must be cheap to share across connections; the gateway
/// wraps every call in its own timeout, so implementations need not.
#[async_trait::async_trait]
pub trait IdentityStore: Send + Sync {
    /// Return the key registered under `fingerprint`, if any.
    async fn find_key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<StoredKey>>;

    /// Record that the key was used to authenticate at `at`.
    async fn touch_key_usage(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<()>;

    /// Every registered key, used to regenerate `authorized_keys`.
    async fn list_keys(&self) -> Result<Vec<AuthorizedKey>>;
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Compute the SHA-256 fingerprint of a base64 public key blob, returned as
/// `SHA256:<base64-no-pad>` (the format printed by `ssh-keygen -l`).
pub fn fingerprint_of_blob(key_blob: &str) -> Result<String> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(key_blob.trim().as_bytes())
        .map_err(|e| anyhow::anyhow!("key blob is not valid base64: {e}"))?;
    let hash = Sha256::digest(&raw);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Ok(format!("SHA256:{encoded}"))
}

/// Algorithm name encoded inside a base64 public key blob, e.g. `ssh-rsa`.
///
/// For RSA this is not what the client negotiates for signatures
/// (`rsa-sha2-256`, `rsa-sha2-512`); the blob is what `authorized_keys`
/// and the store record.
pub fn key_type_of_blob(key_blob: &str) -> Result<String> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(key_blob.trim().as_bytes())
        .map_err(|e| anyhow::anyhow!("key blob is not valid base64: {e}"))?;
    let key = ssh_key::PublicKey::from_bytes(&raw).context("key blob is not an SSH public key")?;
    Ok(key.algorithm().as_str().to_string())
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Build the configured identity store.
pub fn build_identity_store(config: &IdentityStoreConfig) -> Result<Arc<dyn IdentityStore>> {
    Ok(match config {
        IdentityStoreConfig::File { path } => Arc::new(MemoryIdentityStore::load(path)?),
        IdentityStoreConfig::Api(api) => Arc::new(ApiIdentityStore::new(api)?),
    })
}
