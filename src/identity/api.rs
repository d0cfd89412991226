//! Identity store backed by the hosting platform's REST API.
//!
//! Endpoints (relative to the configured base URL):
//!
//! | call                       | request                                  |
//! |----------------------------|------------------------------------------|
//! | find by fingerprint        | `GET  /ssh-keys/{fingerprint}` (404 = none) |
//! | record usage               | `POST /ssh-keys/{fingerprint}/usage`     |
//! | list all keys              | `GET  /ssh-keys`                         |

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{AuthorizedKey, Identity, IdentityStore, StoredKey};
use crate::config::{api_endpoint, ApiEndpointConfig};

#[derive(Debug, Deserialize)]
struct KeyRecord {
    owner_id: String,
    owner_login: String,
    key_type: String,
    key_blob: String,
}

#[derive(Debug, Deserialize)]
struct KeyListEntry {
    fingerprint: String,
    #[serde(flatten)]
    record: KeyRecord,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct UsageBody {
    used_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApiIdentityStore {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl ApiIdentityStore {
    pub fn new(config: &ApiEndpointConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env).unwrap_or_default();
        if token.is_empty() {
            warn!(env = %config.token_env, "identity API token is not set");
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("gitgate/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url()?,
            token,
        })
    }

    /// `/ssh-keys/{fingerprint}[/suffix]`.  Fingerprints contain `/` from
    /// the base64 alphabet.
    fn key_url(&self, fingerprint: &str, suffix: Option<&str>) -> Result<Url> {
        let mut segments = vec!["ssh-keys", fingerprint];
        segments.extend(suffix);
        api_endpoint(&self.base_url, &segments)
    }
}

#[async_trait::async_trait]
impl IdentityStore for ApiIdentityStore {
    #[instrument(skip(self))]
    async fn find_key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<StoredKey>> {
        let resp = self
            .client
            .get(self.key_url(fingerprint, None)?)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("identity API request failed")?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!("fingerprint not registered");
            return Ok(None);
        }
        let resp = resp
            .error_for_status()
            .context("identity API returned an error status")?;
        let record: KeyRecord = resp
            .json()
            .await
            .context("failed to decode identity API response")?;

        Ok(Some(StoredKey {
            owner: Identity {
                id: record.owner_id,
                login: record.owner_login,
            },
            key_type: record.key_type,
            key_blob: record.key_blob,
        }))
    }

    #[instrument(skip(self))]
    async fn touch_key_usage(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<()> {
        self.client
            .post(self.key_url(fingerprint, Some("usage"))?)
            .bearer_auth(&self.token)
            .json(&UsageBody { used_at: at })
            .send()
            .await
            .context("identity API usage request failed")?
            .error_for_status()
            .context("identity API rejected usage update")?;
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<AuthorizedKey>> {
        let entries: Vec<KeyListEntry> = self
            .client
            .get(api_endpoint(&self.base_url, &["ssh-keys"])?)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("identity API list request failed")?
            .error_for_status()
            .context("identity API returned an error status")?
            .json()
            .await
            .context("failed to decode identity API key list")?;

        let mut keys: Vec<AuthorizedKey> = entries
            .into_iter()
            .map(|entry| AuthorizedKey {
                fingerprint: entry.fingerprint,
                key_type: entry.record.key_type,
                key_blob: entry.record.key_blob,
                owner: Identity {
                    id: entry.record.owner_id,
                    login: entry.record.owner_login,
                },
                comment: entry.comment,
                last_used_at: entry.last_used_at,
            })
            .collect();
        keys.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(keys)
    }
}
