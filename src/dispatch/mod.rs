//! Command dispatch: parse an exec command line, authorize it against the
//! permission source, and either answer it directly or run the wrapped Git
//! program on the target repository.
//!
//! The same [`Dispatcher`] serves both the built-in SSH server (one call per
//! exec channel) and the `dispatch` forced-command entry point.

pub mod command;
pub mod error;
pub mod exec;
pub mod sink;

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use command::{parse_command, CommandRequest, RepoPath, RepoRef, Verb};
pub use error::DispatchError;
pub use exec::ExecLimits;
pub use sink::{OutputSink, StdioSink};

use crate::auth::PermissionSource;
use crate::config::GitPrograms;
use crate::git::{CreateRepoError, RepoStore};
use crate::identity::Identity;
use crate::metrics::{DispatchLabels, DispatchOutcome, MetricsRegistry};

/// Per-channel inputs that are not part of the command line.
#[derive(Debug, Clone, Default)]
pub struct ChannelContext {
    /// Value of the client's `GIT_PROTOCOL` env request, if any.
    pub git_protocol: Option<String>,
    /// Fires when the channel or connection is being torn down.
    pub cancel: CancellationToken,
}

pub struct Dispatcher {
    repos: RepoStore,
    permissions: Arc<dyn PermissionSource>,
    programs: GitPrograms,
    limits: ExecLimits,
    metrics: Option<MetricsRegistry>,
}

impl Dispatcher {
    pub fn new(
        repos: RepoStore,
        permissions: Arc<dyn PermissionSource>,
        programs: GitPrograms,
        limits: ExecLimits,
    ) -> Self {
        Self {
            repos,
            permissions,
            programs,
            limits,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn repos(&self) -> &RepoStore {
        &self.repos
    }

    /// Run one command to completion and return its exit code.  Errors are
    /// reported on the sink's stderr as `ERROR: <message>`.
    pub async fn dispatch<R, S>(
        &self,
        identity: &Identity,
        raw_command_line: &str,
        stdin: R,
        sink: &mut S,
        ctx: &ChannelContext,
    ) -> i32
    where
        R: AsyncRead + Unpin + Send + 'static,
        S: OutputSink + ?Sized,
    {
        let started = Instant::now();
        let parsed = parse_command(raw_command_line);
        let verb = parsed.as_ref().map(|r| r.verb.as_str()).unwrap_or("invalid");

        let result = match &parsed {
            Ok(request) => self.execute(identity, request, stdin, sink, ctx).await,
            Err(e) => Err(DispatchError::Syntax(e.to_string())),
        };

        let (code, outcome) = match result {
            Ok(code) => {
                let outcome = if code == error::EXIT_SUCCESS {
                    DispatchOutcome::Success
                } else {
                    DispatchOutcome::ExecutionFailure
                };
                (code, outcome)
            }
            Err(err) => {
                let code = err.exit_code();
                match &err {
                    DispatchError::Execution(_) | DispatchError::Timeout(_) => {
                        warn!(user = %identity, verb, error = %err, "dispatch failed")
                    }
                    _ => debug!(user = %identity, verb, error = %err, "dispatch refused"),
                }
                if !matches!(err, DispatchError::Cancelled) {
                    let _ = sink.stderr(format!("ERROR: {err}\n").as_bytes()).await;
                }
                (code, err.outcome())
            }
        };

        let elapsed = started.elapsed();
        if let Some(m) = &self.metrics {
            m.metrics
                .dispatch_total
                .get_or_create(&DispatchLabels {
                    verb: verb.to_string(),
                    outcome,
                })
                .inc();
            m.metrics
                .dispatch_duration_seconds
                .observe(elapsed.as_secs_f64());
        }
        info!(
            user = %identity,
            verb,
            repo = parsed.as_ref().ok().and_then(|r| r.argument.as_deref()).unwrap_or(""),
            exit_code = code,
            elapsed_ms = elapsed.as_millis() as u64,
            "dispatch finished"
        );
        code
    }

    async fn execute<R, S>(
        &self,
        identity: &Identity,
        request: &CommandRequest,
        stdin: R,
        sink: &mut S,
        ctx: &ChannelContext,
    ) -> Result<i32, DispatchError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        S: OutputSink + ?Sized,
    {
        match request.verb {
            Verb::WhoAmI => {
                write_out(sink, format!("{} {}\n", identity.login, identity.id)).await?;
                Ok(error::EXIT_SUCCESS)
            }
            Verb::RepoList => {
                if !command::is_valid_segment(&identity.login) {
                    return Err(DispatchError::Syntax(format!(
                        "account {:?} has no usable repository namespace",
                        identity.login
                    )));
                }
                let names = self
                    .repos
                    .list(&identity.login)
                    .await
                    .map_err(|e| DispatchError::execution(format!("failed to list repositories: {e:#}")))?;
                let mut listing = String::new();
                for name in names {
                    listing.push_str(&format!("{}/{}\n", identity.login, name));
                }
                write_out(sink, listing).await?;
                Ok(error::EXIT_SUCCESS)
            }
            verb => {
                let path = request
                    .repo
                    .as_ref()
                    .ok_or_else(|| DispatchError::Syntax(format!("{verb} requires a repository argument")))?;
                let repo = path.qualify(&identity.login)?;
                self.authorize(identity, verb, &repo).await?;

                if verb == Verb::RepoCreate {
                    return self.create(&repo, sink, ctx).await;
                }
                self.passthrough(identity, verb, &repo, stdin, sink, ctx).await
            }
        }
    }

    /// Permission is checked before existence so that a caller cannot discover
    /// repositories they have no access to.
    async fn authorize(
        &self,
        identity: &Identity,
        verb: Verb,
        repo: &RepoRef,
    ) -> Result<(), DispatchError> {
        let Some(required) = verb.required_permission() else {
            return Ok(());
        };
        let granted = self
            .permissions
            .permission(identity, &repo.namespace, &repo.name)
            .await
            .map_err(|e| DispatchError::execution(format!("permission check failed: {e:#}")))?;
        if granted < required {
            debug!(user = %identity, %repo, ?granted, ?required, "permission denied");
            return Err(DispatchError::PermissionDenied(repo.to_string()));
        }
        Ok(())
    }

    async fn create<S>(
        &self,
        repo: &RepoRef,
        sink: &mut S,
        ctx: &ChannelContext,
    ) -> Result<i32, DispatchError>
    where
        S: OutputSink + ?Sized,
    {
        let _lock = tokio::select! {
            guard = self.repos.lock(repo) => guard,
            _ = ctx.cancel.cancelled() => return Err(DispatchError::Cancelled),
        };
        match self
            .repos
            .create(repo, &self.programs.init, self.limits, &ctx.cancel)
            .await
        {
            Ok(path) => {
                info!(%repo, path = %path.display(), "repository created");
                if let Some(m) = &self.metrics {
                    m.metrics.repos_created.inc();
                }
                write_out(sink, format!("created {repo}\n")).await?;
                Ok(error::EXIT_SUCCESS)
            }
            Err(CreateRepoError::AlreadyExists) => Err(DispatchError::AlreadyExists(repo.to_string())),
            Err(CreateRepoError::Interrupted(e)) => Err(e),
            Err(CreateRepoError::Failed(e)) => Err(DispatchError::execution(format!(
                "failed to create {repo}: {e:#}"
            ))),
        }
    }

    async fn passthrough<R, S>(
        &self,
        identity: &Identity,
        verb: Verb,
        repo: &RepoRef,
        stdin: R,
        sink: &mut S,
        ctx: &ChannelContext,
    ) -> Result<i32, DispatchError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        S: OutputSink + ?Sized,
    {
        // Pushes hold the repository lock for their whole duration; reads
        // and archives never take it.
        let _lock = match verb {
            Verb::RepoWrite => tokio::select! {
                guard = self.repos.lock(repo) => Some(guard),
                _ = ctx.cancel.cancelled() => return Err(DispatchError::Cancelled),
            },
            _ => None,
        };

        if !self.repos.exists(repo).await {
            return Err(DispatchError::NotFound(repo.to_string()));
        }

        let argv = match verb {
            Verb::RepoRead => &self.programs.upload_pack,
            Verb::RepoArchive => &self.programs.upload_archive,
            Verb::RepoWrite => &self.programs.receive_pack,
            other => {
                return Err(DispatchError::execution(format!(
                    "{other} has no program mapping"
                )))
            }
        };
        let mut cmd = exec::program_command(argv, &self.repos.repo_path(repo))?;
        cmd.env("GITGATE_USER", &identity.id)
            .env("GITGATE_LOGIN", &identity.login)
            .env("GITGATE_REPO", repo.to_string());
        match ctx.git_protocol.as_deref() {
            Some(value) if is_safe_git_protocol(value) => {
                cmd.env("GIT_PROTOCOL", value);
            }
            Some(value) => {
                warn!(user = %identity, value, "ignoring malformed GIT_PROTOCOL");
                cmd.env_remove("GIT_PROTOCOL");
            }
            None => {
                cmd.env_remove("GIT_PROTOCOL");
            }
        }

        exec::run_streaming(cmd, stdin, sink, self.limits, &ctx.cancel).await
    }
}

async fn write_out<S>(sink: &mut S, text: String) -> Result<(), DispatchError>
where
    S: OutputSink + ?Sized,
{
    sink.stdout(text.as_bytes())
        .await
        .map_err(|_| DispatchError::Cancelled)
}

/// `GIT_PROTOCOL` values look like `version=2` or `version=2:foo=bar`.
pub fn is_safe_git_protocol(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 256
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'=' | b':' | b'.' | b'_' | b'-'))
}
