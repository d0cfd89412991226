mod auth;
mod authorized_keys;
mod config;
mod dispatch;
mod git;
mod health;
mod identity;
mod metrics;
mod ssh;
mod supervisor;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::KeyResolver;
use crate::authorized_keys::{Emitter, LOGIN_BINDING, USER_BINDING};
use crate::config::Config;
use crate::dispatch::{ChannelContext, Dispatcher, ExecLimits, StdioSink};
use crate::git::RepoStore;
use crate::identity::{build_identity_store, AuthorizedKey, Identity, IdentityStore};
use crate::metrics::MetricsRegistry;
use crate::supervisor::Shutdown;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", about = "SSH access gateway for Git hosting")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = "GITGATE_CONFIG",
        default_value = "/etc/gitgate/config.yaml"
    )]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SSH gateway.
    Serve,
    /// Forced-command entry point: run `SSH_ORIGINAL_COMMAND` for the
    /// identity given as `USER=<id> LOGIN=<login>` bindings.
    Dispatch {
        #[arg(value_name = "KEY=VALUE")]
        bindings: Vec<String>,
    },
    /// Regenerate the authorized_keys file from the identity store.
    AuthorizedKeys {
        /// Destination file; `-` writes to stdout.  Defaults to
        /// `authorized_keys.output_path`.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// OpenSSH `AuthorizedKeysCommand` helper (`%u %f %t %k`).  Prints the
    /// restricted key line when the key resolves, nothing otherwise.
    LookupKey {
        login: String,
        fingerprint: String,
        key_type: String,
        key_blob: String,
    },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every SSH connection.
pub struct AppState {
    pub config: Arc<Config>,
    pub resolver: KeyResolver,
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: Shutdown,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

/// JSON logs.  The forced-command and lookup helpers log to stderr and only
/// at `error` by default: their stdout is a protocol stream and their stderr
/// reaches the Git client or sshd's log.
fn init_tracing(command: &Command) {
    let (default_level, to_stderr) = match command {
        Command::Serve => ("info", false),
        Command::AuthorizedKeys { .. } => ("info", true),
        Command::Dispatch { .. } | Command::LookupKey { .. } => ("error", true),
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    if to_stderr {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

fn build_dispatcher(config: &Config) -> Result<Dispatcher> {
    let permissions = Arc::from(auth::build_permission_source(&config.permissions)?);
    let limits = ExecLimits {
        idle_timeout: config.dispatch.idle_timeout(),
        max_duration: config.dispatch.max_duration(),
    };
    Ok(Dispatcher::new(
        RepoStore::new(&config.repos.root),
        permissions,
        config.dispatch.programs.clone(),
        limits,
    ))
}

fn build_resolver(config: &Config, store: Arc<dyn IdentityStore>) -> KeyResolver {
    KeyResolver::new(
        store,
        config.ssh.service_login.clone(),
        Duration::from_millis(config.auth.lookup_timeout_ms),
        Duration::from_millis(config.auth.touch_timeout_ms),
    )
}

/// Identity from forced-command bindings.  Both `USER` and `LOGIN` are
/// required; nothing is taken from the environment.
fn identity_from_bindings(bindings: &[String]) -> Result<Identity> {
    let mut id = None;
    let mut login = None;
    for binding in bindings {
        let Some((key, value)) = binding.split_once('=') else {
            bail!("malformed binding {binding:?}; expected KEY=VALUE");
        };
        if value.is_empty() {
            bail!("binding {key} has an empty value");
        }
        match key {
            USER_BINDING => id = Some(value.to_string()),
            LOGIN_BINDING => login = Some(value.to_string()),
            other => tracing::debug!(binding = %other, "ignoring unknown binding"),
        }
    }
    match (id, login) {
        (Some(id), Some(login)) => Ok(Identity { id, login }),
        _ => bail!("both {USER_BINDING}= and {LOGIN_BINDING}= bindings are required"),
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn run_serve(config: Config) -> Result<()> {
    let config = Arc::new(config);

    tokio::fs::create_dir_all(&config.repos.root)
        .await
        .with_context(|| {
            format!(
                "failed to create repository root: {}",
                config.repos.root.display()
            )
        })?;

    let metrics = MetricsRegistry::new();
    let store = build_identity_store(&config.identity_store)?;
    let resolver = build_resolver(&config, Arc::clone(&store)).with_metrics(metrics.clone());
    let dispatcher = Arc::new(build_dispatcher(&config)?.with_metrics(metrics.clone()));
    let shutdown = Shutdown::new(config.ssh.shutdown_grace());

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        resolver,
        dispatcher,
        shutdown: shutdown.clone(),
        metrics: metrics.clone(),
    });

    // ---- Admin listener ----
    let admin_stop = CancellationToken::new();
    let admin_handle = config.admin.listen.clone().map(|listen| {
        let admin_state = health::AdminState {
            repo_root: config.repos.root.clone(),
            store: Arc::clone(&store),
            metrics: metrics.clone(),
        };
        let stop = admin_stop.clone();
        tokio::spawn(async move {
            if let Err(e) = health::run_admin_server(&listen, admin_state, stop).await {
                tracing::error!(error = %format!("{e:#}"), "admin HTTP server failed");
            }
        })
    });

    // ---- SSH until signalled ----
    let result = tokio::select! {
        res = ssh::start_ssh_server(Arc::clone(&state)) => res,
        () = shutdown_signal() => Ok(()),
    };

    tracing::info!("no longer accepting connections; draining channels");
    shutdown.drain().await;
    admin_stop.cancel();
    if let Some(handle) = admin_handle {
        let _ = handle.await;
    }

    tracing::info!("gitgate shut down cleanly");
    result
}

async fn run_dispatch(config: Config, bindings: &[String]) -> Result<ExitCode> {
    let identity = identity_from_bindings(bindings)?;
    let Ok(command_line) = std::env::var("SSH_ORIGINAL_COMMAND") else {
        eprintln!("ERROR: interactive shells are not supported; run a Git command instead");
        return Ok(exit_code(dispatch::error::EXIT_SYNTAX));
    };
    let dispatcher = build_dispatcher(&config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });
    let ctx = ChannelContext {
        git_protocol: std::env::var("GIT_PROTOCOL").ok(),
        cancel,
    };

    let mut sink = StdioSink::process();
    let code = dispatcher
        .dispatch(&identity, &command_line, tokio::io::stdin(), &mut sink, &ctx)
        .await;
    Ok(exit_code(code))
}

async fn run_authorized_keys(config: Config, output: Option<PathBuf>) -> Result<()> {
    let store = build_identity_store(&config.identity_store)?;
    let emitter = Emitter::new(config.authorized_keys.dispatcher_command.clone())
        .context("invalid authorized_keys.dispatcher_command")?;

    let keys = store.list_keys().await.context("failed to list keys")?;
    let (document, skipped) = emitter.render_all(&keys);
    for (fingerprint, reason) in &skipped {
        tracing::warn!(%fingerprint, %reason, "skipping key that cannot be rendered safely");
    }

    let output = output.or_else(|| config.authorized_keys.output_path.clone());
    match output {
        Some(path) if path.as_os_str() != "-" => {
            authorized_keys::write_authorized_keys(&path, &document)?;
            tracing::info!(
                path = %path.display(),
                keys = keys.len() - skipped.len(),
                skipped = skipped.len(),
                "authorized_keys written"
            );
        }
        _ => print!("{document}"),
    }
    Ok(())
}

async fn run_lookup_key(
    config: Config,
    login: &str,
    fingerprint: &str,
    key_type: &str,
    key_blob: &str,
) -> Result<()> {
    let store = build_identity_store(&config.identity_store)?;
    let resolver = build_resolver(&config, store);
    let emitter = Emitter::new(config.authorized_keys.dispatcher_command.clone())
        .context("invalid authorized_keys.dispatcher_command")?;

    // Rejections print nothing: sshd then refuses the key.
    let Ok(owner) = resolver.resolve(login, fingerprint, key_type, key_blob).await else {
        return Ok(());
    };
    let key = AuthorizedKey {
        fingerprint: fingerprint.to_string(),
        key_type: key_type.to_string(),
        key_blob: key_blob.to_string(),
        owner: owner.clone(),
        comment: None,
        last_used_at: None,
    };
    match emitter.render(&key, &owner) {
        Ok(spec) => println!("{spec}"),
        Err(e) => tracing::warn!(%fingerprint, error = %e, "resolved key cannot be rendered safely"),
    }
    // Give the background usage update a chance to land before exiting.
    tokio::time::sleep(Duration::from_millis(config.auth.touch_timeout_ms.min(500))).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    init_tracing(&cli.command);

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    tracing::info!(config_path = %cli.config, command = ?cli.command, "starting gitgate");

    match cli.command {
        Command::Serve => run_serve(config).await.map(|()| ExitCode::SUCCESS),
        Command::Dispatch { bindings } => run_dispatch(config, &bindings).await,
        Command::AuthorizedKeys { output } => run_authorized_keys(config, output)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::LookupKey {
            login,
            fingerprint,
            key_type,
            key_blob,
        } => run_lookup_key(config, &login, &fingerprint, &key_type, &key_blob)
            .await
            .map(|()| ExitCode::SUCCESS),
    }
}
