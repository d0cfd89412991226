use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::{api_endpoint, ApiEndpointConfig, PermissionsConfig};
use crate::identity::Identity;

/// Access level of an identity on one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    Admin = 3,
}

/// Parse the permission strings used by forge APIs (`pull`/`push` are the
/// GitHub-style aliases).
pub fn parse_permission(s: &str) -> Permission {
    match s {
        "admin" | "owner" => Permission::Admin,
        "write" | "push" | "collaborator" => Permission::Write,
        "read" | "pull" => Permission::Read,
        _ => Permission::None,
    }
}

/// Source of permission decisions.  The gateway never interprets roles; it
/// only compares the returned level against what a verb needs.
#[async_trait::async_trait]
pub trait PermissionSource: Send + Sync {
    /// Permission of `identity` on `namespace/name`.  The repository need
    /// not exist (creation checks the namespace this way).
    async fn permission(&self, identity: &Identity, namespace: &str, name: &str)
        -> Result<Permission>;
}

/// Build the configured permission source.
pub fn build_permission_source(config: &PermissionsConfig) -> Result<Box<dyn PermissionSource>> {
    Ok(match config {
        PermissionsConfig::Static {
            admins,
            collaborators,
        } => Box::new(StaticPermissions::new(admins.clone(), collaborators.clone())),
        PermissionsConfig::Api(api) => Box::new(ApiPermissions::new(api)?),
    })
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// Namespace owners have admin on everything under their namespace,
/// configured admins on everything, and collaborators whatever they were
/// granted.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    admins: Vec<String>,
    collaborators: HashMap<String, HashMap<String, Permission>>,
}

impl StaticPermissions {
    pub fn new(
        admins: Vec<String>,
        collaborators: HashMap<String, HashMap<String, Permission>>,
    ) -> Self {
        Self {
            admins,
            collaborators,
        }
    }

    fn decide(&self, identity: &Identity, namespace: &str, name: &str) -> Permission {
        if identity.login == namespace || self.admins.iter().any(|a| a == &identity.login) {
            return Permission::Admin;
        }
        self.collaborators
            .get(&format!("{namespace}/{name}"))
            .and_then(|grants| grants.get(&identity.login))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl PermissionSource for StaticPermissions {
    async fn permission(
        &self,
        identity: &Identity,
        namespace: &str,
        name: &str,
    ) -> Result<Permission> {
        Ok(self.decide(identity, namespace, name))
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// Asks the platform: `GET /repos/{namespace}/{name}/permission/{user_id}`
/// answering `{"permission": "admin" | "write" | "read" | "none"}`.
#[derive(Debug, Clone)]
pub struct ApiPermissions {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

#[derive(Debug, Deserialize)]
struct PermissionBody {
    permission: String,
}

impl ApiPermissions {
    pub fn new(config: &ApiEndpointConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gitgate/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url()?,
            token: std::env::var(&config.token_env).unwrap_or_default(),
        })
    }

    fn permission_url(&self, identity: &Identity, namespace: &str, name: &str) -> Result<Url> {
        api_endpoint(
            &self.base_url,
            &["repos", namespace, name, "permission", &identity.id],
        )
    }
}

#[async_trait::async_trait]
impl PermissionSource for ApiPermissions {
    #[instrument(skip(self), fields(user = %identity.login))]
    async fn permission(
        &self,
        identity: &Identity,
        namespace: &str,
        name: &str,
    ) -> Result<Permission> {
        let url = self.permission_url(identity, namespace, name)?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("permission API request failed")?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!("no permission record");
            return Ok(Permission::None);
        }
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "permission API returned non-success status");
            anyhow::bail!("permission API returned {}", resp.status());
        }

        let body: PermissionBody = resp
            .json()
            .await
            .context("failed to decode permission API response")?;
        let perm = parse_permission(&body.permission);
        debug!(permission = ?perm, "resolved repo permission");
        Ok(perm)
    }
}
