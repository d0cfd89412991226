use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use serde::Deserialize;

use crate::auth::permission::Permission;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ssh: SshConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub identity_store: IdentityStoreConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    pub repos: RepoConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub authorized_keys: AuthorizedKeysConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

// ---------------------------------------------------------------------------
// SSH listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    pub listen: String,
    /// OpenSSH-format private host key.  An ephemeral Ed25519 key is
    /// generated when unset or unreadable.
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,
    /// The only SSH login name accepted (e.g. `git`).
    #[serde(default = "default_service_login")]
    pub service_login: String,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,
    /// Delay (milliseconds) applied to every rejected auth attempt.
    #[serde(default = "default_auth_rejection_ms")]
    pub auth_rejection_ms: u64,
    /// Seconds a new connection has to finish the handshake and
    /// authenticate before it is dropped.
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    /// Close a connection that has had no channels and no traffic for this
    /// many seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Upper bound on live exec channels per connection.
    #[serde(default = "default_max_channels")]
    pub max_channels_per_connection: usize,
    /// Time given to in-flight channels before they are killed on close.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Interval between SSH keepalive messages (0 disables).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

fn default_service_login() -> String {
    "git".to_string()
}

fn default_max_auth_attempts() -> usize {
    6
}

fn default_auth_rejection_ms() -> u64 {
    500
}

fn default_auth_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_channels() -> usize {
    1024
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    30
}

impl SshConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Key resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Deadline (milliseconds) for a fingerprint lookup during the handshake.
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    /// Deadline (milliseconds) for the background last-used update.
    #[serde(default = "default_touch_timeout_ms")]
    pub touch_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: default_lookup_timeout_ms(),
            touch_timeout_ms: default_touch_timeout_ms(),
        }
    }
}

fn default_lookup_timeout_ms() -> u64 {
    250
}

fn default_touch_timeout_ms() -> u64 {
    2_000
}

// ---------------------------------------------------------------------------
// Identity store backend
// ---------------------------------------------------------------------------

/// Where authorized keys are looked up.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum IdentityStoreConfig {
    /// YAML key registry loaded into memory at startup.
    File { path: PathBuf },
    /// REST API owned by the hosting platform.
    Api(ApiEndpointConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEndpointConfig {
    /// Base URL of the platform API (e.g. `https://forge.internal/api/v1`).
    pub url: String,
    /// Name of the environment variable that holds the API bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,
}

impl ApiEndpointConfig {
    /// The parsed base URL.  Endpoint paths are appended to it.
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.url).with_context(|| format!("invalid API url {:?}", self.url))?;
        anyhow::ensure!(!url.cannot_be_a_base(), "API url {:?} cannot take a path", self.url);
        Ok(url)
    }
}

/// `base` extended by `segments`, each percent-encoded as a single path
/// segment so values containing `/` or `?` stay inside their segment.
pub fn api_endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    // The url crate drops dot segments instead of encoding them.
    if let Some(bad) = segments.iter().find(|s| matches!(**s, "" | "." | "..")) {
        anyhow::bail!("refusing API path segment {bad:?}");
    }
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| anyhow!("API url {base} cannot take a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn default_token_env() -> String {
    "GITGATE_API_TOKEN".to_string()
}

fn default_api_timeout_ms() -> u64 {
    2_000
}

// ---------------------------------------------------------------------------
// Permission source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum PermissionsConfig {
    /// Namespace owners get admin, plus configured admins and grants.
    Static {
        /// Logins with admin rights on every repository.
        #[serde(default)]
        admins: Vec<String>,
        /// `"namespace/name"` → login → permission.
        #[serde(default)]
        collaborators: HashMap<String, HashMap<String, Permission>>,
    },
    Api(ApiEndpointConfig),
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self::Static {
            admins: Vec::new(),
            collaborators: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Repository storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    /// Root directory holding `<namespace>/<name>.git` bare repositories.
    pub root: PathBuf,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Kill a command after this many seconds without any I/O.
    #[serde(default = "default_dispatch_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Absolute cap on a single command's run time (0 = unlimited).
    #[serde(default)]
    pub max_duration_secs: u64,
    #[serde(default)]
    pub programs: GitPrograms,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_dispatch_idle_timeout(),
            max_duration_secs: 0,
            programs: GitPrograms::default(),
        }
    }
}

impl DispatchConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }
}

fn default_dispatch_idle_timeout() -> u64 {
    300
}

/// Argument vectors for the wrapped Git programs.  The repository path is
/// appended as the final argument.
#[derive(Debug, Clone, Deserialize)]
pub struct GitPrograms {
    #[serde(default = "default_upload_pack")]
    pub upload_pack: Vec<String>,
    #[serde(default = "default_receive_pack")]
    pub receive_pack: Vec<String>,
    #[serde(default = "default_upload_archive")]
    pub upload_archive: Vec<String>,
    #[serde(default = "default_init")]
    pub init: Vec<String>,
}

impl Default for GitPrograms {
    fn default() -> Self {
        Self {
            upload_pack: default_upload_pack(),
            receive_pack: default_receive_pack(),
            upload_archive: default_upload_archive(),
            init: default_init(),
        }
    }
}

fn default_upload_pack() -> Vec<String> {
    vec!["git-upload-pack".to_string()]
}

fn default_receive_pack() -> Vec<String> {
    vec!["git-receive-pack".to_string()]
}

fn default_upload_archive() -> Vec<String> {
    vec!["git-upload-archive".to_string()]
}

fn default_init() -> Vec<String> {
    ["git", "init", "--bare", "--quiet"]
        .into_iter()
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// authorized_keys emission
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizedKeysConfig {
    /// Command line that every forced command starts with.
    #[serde(default = "default_dispatcher_command")]
    pub dispatcher_command: String,
    /// Default destination for `gitgate authorized-keys`.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

impl Default for AuthorizedKeysConfig {
    fn default() -> Self {
        Self {
            dispatcher_command: default_dispatcher_command(),
            output_path: None,
        }
    }
}

fn default_dispatcher_command() -> String {
    "/usr/local/bin/gitgate dispatch".to_string()
}

// ---------------------------------------------------------------------------
// Admin HTTP listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    /// Socket address for `/metrics` and `/healthz`.  Disabled when unset.
    #[serde(default)]
    pub listen: Option<String>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config file: {}", path.display()))
}

fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.ssh.service_login.is_empty(),
        "ssh.service_login must not be empty"
    );
    anyhow::ensure!(
        config.ssh.max_channels_per_connection > 0,
        "ssh.max_channels_per_connection must be at least 1"
    );
    anyhow::ensure!(config.ssh.auth_timeout_secs > 0, "ssh.auth_timeout_secs must be > 0");
    anyhow::ensure!(config.auth.lookup_timeout_ms > 0, "auth.lookup_timeout_ms must be > 0");
    anyhow::ensure!(
        config.dispatch.idle_timeout_secs > 0,
        "dispatch.idle_timeout_secs must be > 0"
    );
    let programs = &config.dispatch.programs;
    for (name, argv) in [
        ("upload_pack", &programs.upload_pack),
        ("receive_pack", &programs.receive_pack),
        ("upload_archive", &programs.upload_archive),
        ("init", &programs.init),
    ] {
        anyhow::ensure!(!argv.is_empty(), "dispatch.programs.{name} must not be empty");
    }
    anyhow::ensure!(
        !config.authorized_keys.dispatcher_command.trim().is_empty(),
        "authorized_keys.dispatcher_command must not be empty"
    );
    Ok(())
}
