//! In-memory key registry, optionally loaded from a YAML file.
//!
//! Used for single-host deployments and tests.  Reads take a shared lock;
//! registration and usage updates take the write lock briefly.  Revocation
//! happens in the registry file, which is re-read on restart.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use anyhow::{bail, ensure, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    fingerprint_of_blob, key_type_of_blob, AuthorizedKey, Identity, IdentityStore, StoredKey,
};
use crate::authorized_keys::parse_key_line;

/// On-disk registry format.
///
/// ```yaml
/// users:
///   - id: "42"
///     login: alice
///     keys:
///       - "ssh-ed25519 AAAAC3Nza... alice@laptop"
/// ```
#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    users: Vec<RegistryUser>,
}

#[derive(Debug, Deserialize)]
struct RegistryUser {
    id: String,
    login: String,
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    keys: RwLock<HashMap<String, AuthorizedKey>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a registry from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read key registry: {}", path.display()))?;
        let store = Self::from_yaml(&contents)
            .with_context(|| format!("invalid key registry: {}", path.display()))?;
        info!(path = %path.display(), keys = store.len(), "loaded key registry");
        Ok(store)
    }

    fn from_yaml(contents: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(contents)?;
        let store = Self::new();
        for user in file.users {
            let owner = Identity {
                id: user.id,
                login: user.login,
            };
            for line in &user.keys {
                let key = parse_public_key_line(line, owner.clone())?;
                store.insert(key)?;
            }
        }
        Ok(store)
    }

    /// Register a key.  Fails if the fingerprint is already registered to
    /// anyone, including the same owner.
    pub fn insert(&self, key: AuthorizedKey) -> Result<()> {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = keys.get(&key.fingerprint) {
            bail!(
                "fingerprint {} is already registered to {}",
                key.fingerprint,
                existing.owner
            );
        }
        debug!(fingerprint = %key.fingerprint, owner = %key.owner, "key registered");
        keys.insert(key.fingerprint.clone(), key);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn get(&self, fingerprint: &str) -> Option<AuthorizedKey> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.get(fingerprint).cloned()
    }

    fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Parse a registry key line into a key record owned by `owner`.  Lines
/// copied from an `authorized_keys` file may keep their options; they are
/// ignored.
fn parse_public_key_line(line: &str, owner: Identity) -> Result<AuthorizedKey> {
    let parsed =
        parse_key_line(line).with_context(|| format!("not a public key line: {line:?}"))?;
    if !parsed.options.is_empty() {
        debug!(options = ?parsed.options, "ignoring key options in registry line");
    }
    let blob_type = key_type_of_blob(&parsed.key_blob)?;
    ensure!(
        blob_type == parsed.key_type,
        "key line says {} but the key is {blob_type}",
        parsed.key_type
    );
    Ok(AuthorizedKey {
        fingerprint: fingerprint_of_blob(&parsed.key_blob)?,
        key_type: parsed.key_type,
        key_blob: parsed.key_blob,
        owner,
        comment: parsed.comment,
        last_used_at: None,
    })
}

#[async_trait::async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<StoredKey>> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        Ok(keys.get(fingerprint).map(StoredKey::from))
    }

    async fn touch_key_usage(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<()> {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = keys.get_mut(fingerprint) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<AuthorizedKey>> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<AuthorizedKey> = keys.values().cloned().collect();
        all.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(all)
    }
}
