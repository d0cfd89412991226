//! Connection and channel supervision.
//!
//! Every authenticated connection owns a [`ConnectionSupervisor`] that runs
//! its exec channels as independent tasks, bounds how many may be live at
//! once, and tears them down (grace period, then cancellation) when the
//! connection closes.  Channel tasks are also registered with the
//! server-wide [`Shutdown`] so that a process shutdown drains every
//! connection the same way.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncRead;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::dispatch::{ChannelContext, Dispatcher, OutputSink};
use crate::identity::Identity;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Authenticated,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opened,
    Dispatching,
    /// The command produced its first output.
    Streaming,
    Closed(i32),
}

/// Where a finished channel's exit code goes.  Over SSH this sends
/// exit-status, EOF and close.
#[async_trait::async_trait]
pub trait ChannelOutput: OutputSink + 'static {
    async fn finish(&mut self, exit_code: i32);
}

// ---------------------------------------------------------------------------
// Server-wide shutdown
// ---------------------------------------------------------------------------

/// Shared by all connections: tracks every channel task in the process and
/// holds the token that hard-cancels them.
#[derive(Clone)]
pub struct Shutdown {
    hard: CancellationToken,
    channels: TaskTracker,
    grace: Duration,
}

impl Shutdown {
    pub fn new(grace: Duration) -> Self {
        Self {
            hard: CancellationToken::new(),
            channels: TaskTracker::new(),
            grace,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.hard
    }

    /// Let in-flight channels finish for the grace period, then cancel the
    /// rest and wait until their children have been reaped.
    pub async fn drain(&self) {
        self.channels.close();
        let pending = self.channels.len();
        if pending > 0 {
            info!(pending, grace = ?self.grace, "waiting for in-flight channels");
        }
        if tokio::time::timeout(self.grace, self.channels.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.channels.len(),
                "grace period elapsed; cancelling channels"
            );
            self.hard.cancel();
            self.channels.wait().await;
        }
        self.hard.cancel();
    }
}

// ---------------------------------------------------------------------------
// Per-connection supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SupervisorLimits {
    pub max_channels: usize,
    /// Close the connection after this long with no channels and no traffic.
    pub idle_timeout: Duration,
    pub grace: Duration,
}

/// A reserved channel slot.  Dropping it frees the slot.
#[derive(Debug)]
pub struct ChannelPermit(OwnedSemaphorePermit);

/// A running channel.
pub struct ChannelTask<S> {
    pub state: watch::Receiver<ChannelState>,
    pub join: JoinHandle<(i32, S)>,
}

/// Cheap to clone; all clones supervise the same connection.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    dispatcher: Arc<Dispatcher>,
    limits: SupervisorLimits,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    global: TaskTracker,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
    identity: Arc<Mutex<Option<Arc<Identity>>>>,
    last_activity: Arc<Mutex<Instant>>,
    metrics: Option<MetricsRegistry>,
}

impl ConnectionSupervisor {
    pub fn new(dispatcher: Arc<Dispatcher>, limits: SupervisorLimits, shutdown: &Shutdown) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            dispatcher,
            limits,
            permits: Arc::new(Semaphore::new(limits.max_channels)),
            tracker: TaskTracker::new(),
            global: shutdown.channels.clone(),
            cancel: shutdown.hard.child_token(),
            state: Arc::new(state),
            identity: Arc::new(Mutex::new(None)),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait up to `limit` for the connection to leave the handshake states.
    /// `false` means the peer is still unauthenticated when time is up.
    pub async fn authenticated_within(&self, limit: Duration) -> bool {
        let mut state = self.state.subscribe();
        let settled = state.wait_for(|s| {
            !matches!(
                s,
                ConnectionState::Connecting | ConnectionState::Authenticating
            )
        });
        let settled = tokio::time::timeout(limit, settled).await.is_ok();
        settled
    }

    pub fn begin_auth(&self) {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connecting {
                *s = ConnectionState::Authenticating;
                true
            } else {
                false
            }
        });
    }

    /// Bind the connection's identity.  Happens once; later calls are ignored.
    pub fn authenticated(&self, identity: Identity) {
        let mut slot = self.identity.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        *slot = Some(Arc::new(identity));
        self.state.send_replace(ConnectionState::Authenticated);
        self.touch();
    }

    pub fn identity(&self) -> Option<Arc<Identity>> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record traffic on the connection.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn active_channels(&self) -> usize {
        self.limits.max_channels - self.permits.available_permits()
    }

    /// Reserve a channel slot.  `None` before authentication, while closing,
    /// or when the connection is at its channel limit.
    pub fn try_open(&self) -> Option<ChannelPermit> {
        if self.state() != ConnectionState::Authenticated {
            return None;
        }
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                self.touch();
                Some(ChannelPermit(permit))
            }
            Err(_) => {
                warn!(
                    limit = self.limits.max_channels,
                    "channel limit reached; refusing channel"
                );
                None
            }
        }
    }

    /// Run `command_line` on its own task.  The permit is held until the
    /// channel is finished.
    pub fn spawn<R, S>(
        &self,
        permit: ChannelPermit,
        command_line: String,
        stdin: R,
        sink: S,
        git_protocol: Option<String>,
    ) -> Option<ChannelTask<S>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        S: ChannelOutput,
    {
        let identity = self.identity()?;
        let (state_tx, state_rx) = watch::channel(ChannelState::Opened);
        let dispatcher = Arc::clone(&self.dispatcher);
        let ctx = ChannelContext {
            git_protocol,
            cancel: self.cancel.child_token(),
        };
        let this = self.clone();

        let task = async move {
            let _permit = permit;
            if let Some(m) = &this.metrics {
                m.metrics.active_channels.inc();
            }
            state_tx.send_replace(ChannelState::Dispatching);

            let mut tracked = StateTrackingSink {
                inner: sink,
                state: &state_tx,
                streaming: false,
            };
            let code = dispatcher
                .dispatch(&identity, &command_line, stdin, &mut tracked, &ctx)
                .await;
            let mut sink = tracked.inner;
            sink.finish(code).await;

            state_tx.send_replace(ChannelState::Closed(code));
            if let Some(m) = &this.metrics {
                m.metrics.active_channels.dec();
            }
            this.touch();
            debug!(exit_code = code, "channel closed");
            (code, sink)
        };

        let join = tokio::spawn(self.global.track_future(self.tracker.track_future(task)));
        Some(ChannelTask {
            state: state_rx,
            join,
        })
    }

    /// Resolves once the connection has had no channels and no traffic for
    /// the idle timeout, or when the connection is being closed.
    pub async fn idle(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let since = *self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
            let deadline = since + self.limits.idle_timeout;
            let now = Instant::now();
            if now >= deadline {
                if self.active_channels() == 0 {
                    return;
                }
                // Busy channels count as activity.
                self.touch();
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(deadline - now) => {}
            }
        }
    }

    /// Close the connection: refuse new channels, give live ones the grace
    /// period, then cancel them and wait for their processes to be reaped.
    pub async fn close(&self) {
        let previous = self.state.send_replace(ConnectionState::Closing);
        if previous == ConnectionState::Closed {
            self.state.send_replace(ConnectionState::Closed);
            return;
        }
        self.tracker.close();
        if tokio::time::timeout(self.limits.grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tracker.len(),
                "connection grace period elapsed; cancelling channels"
            );
        }
        self.cancel.cancel();
        self.tracker.wait().await;
        self.state.send_replace(ConnectionState::Closed);
    }
}

/// Moves the channel to `Streaming` on the first byte of output.
struct StateTrackingSink<'a, S> {
    inner: S,
    state: &'a watch::Sender<ChannelState>,
    streaming: bool,
}

impl<'a, S> StateTrackingSink<'a, S> {
    fn mark_streaming(&mut self) {
        if !self.streaming {
            self.streaming = true;
            self.state.send_replace(ChannelState::Streaming);
        }
    }
}

#[async_trait::async_trait]
impl<'a, S: OutputSink> OutputSink for StateTrackingSink<'a, S> {
    async fn stdout(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.mark_streaming();
        self.inner.stdout(data).await
    }

    async fn stderr(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.mark_streaming();
        self.inner.stderr(data).await
    }
}
