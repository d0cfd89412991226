//! SSH listener: the accept loop, per-connection deadlines and host key
//! handling.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server;
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info, warn};

use super::session::SshSession;
use crate::config::SshConfig;
use crate::AppState;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Severable transport
// ---------------------------------------------------------------------------

/// A transport whose reads and writes fail once `token` is cancelled.
///
/// russh only honours a disconnect request between key exchanges, so a peer
/// that stalls mid-handshake would otherwise keep its socket forever.
struct Severable<S> {
    inner: S,
    token: CancellationToken,
    severed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> Severable<S> {
    fn new(inner: S, token: CancellationToken) -> Self {
        Self {
            inner,
            severed: Box::pin(token.clone().cancelled_owned()),
            token,
        }
    }

    fn check(&mut self, cx: &mut TaskContext<'_>) -> io::Result<()> {
        if self.token.is_cancelled() || self.severed.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection did not authenticate in time",
            ));
        }
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Severable<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Severable<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Serve one accepted connection until it closes.  The peer has
/// `ssh.auth_timeout_secs` from connect to finish the handshake and
/// authenticate.
async fn run_connection(
    state: Arc<AppState>,
    config: Arc<server::Config>,
    stream: TcpStream,
    peer: Option<SocketAddr>,
) {
    let auth_timeout = state.config.ssh.auth_timeout();
    let handler = SshSession::new(Arc::clone(&state), peer);
    let supervisor = handler.supervisor().clone();
    let cut = CancellationToken::new();

    let deadline = tokio::spawn({
        let cut = cut.clone();
        async move {
            if !supervisor.authenticated_within(auth_timeout).await {
                warn!(peer = ?peer, timeout = ?auth_timeout, "dropping unauthenticated SSH connection");
                cut.cancel();
            }
        }
    });

    let result = match server::run_stream(config, Severable::new(stream, cut), handler).await {
        Ok(session) => session.await,
        Err(e) => Err(e),
    };
    deadline.abort();
    match result {
        Ok(()) => debug!(peer = ?peer, "SSH connection closed"),
        Err(e) => debug!(peer = ?peer, error = %format!("{e:#}"), "SSH connection ended"),
    }
}

/// Accept connections from `listener` forever, each on its own task.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    config: Arc<server::Config>,
) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "failed to accept SSH connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        info!(peer = %peer, "new SSH client connection");
        tokio::spawn(run_connection(
            Arc::clone(&state),
            Arc::clone(&config),
            stream,
            Some(peer),
        ));
    }
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

/// Load the configured host key, or generate an ephemeral Ed25519 key if none
/// is configured or it cannot be read.
pub fn load_or_generate_host_key(path: Option<&Path>) -> KeyPair {
    let Some(path) = path else {
        warn!("no ssh.host_key_path configured; generating ephemeral Ed25519 host key");
        return KeyPair::generate_ed25519();
    };
    match load_host_key_from_file(path) {
        Ok(kp) => {
            info!(path = %path.display(), "loaded SSH host key");
            kp
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %format!("{e:#}"),
                "failed to load SSH host key; generating ephemeral Ed25519 key",
            );
            KeyPair::generate_ed25519()
        }
    }
}

fn load_host_key_from_file(path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("failed to decode SSH host key {}", path.display()))
}

/// russh server settings derived from the `ssh` config section.
pub fn server_config(ssh: &SshConfig, host_key: KeyPair) -> server::Config {
    let keepalive = (ssh.keepalive_interval_secs > 0)
        .then(|| Duration::from_secs(ssh.keepalive_interval_secs));
    server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        preferred: russh::Preferred::DEFAULT,
        // Connection idleness is decided by the supervisor, which also knows
        // about long-running silent channels.
        inactivity_timeout: None,
        keepalive_interval: keepalive,
        auth_rejection_time: Duration::from_millis(ssh.auth_rejection_ms),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: ssh.max_auth_attempts,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Run the SSH listener until the caller drops this future.  Connections
/// already accepted keep running on their own tasks.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let ssh = &state.config.ssh;
    let listen_addr: SocketAddr = ssh
        .listen
        .parse()
        .with_context(|| format!("invalid SSH listen address: {:?}", ssh.listen))?;

    let host_key = load_or_generate_host_key(ssh.host_key_path.as_deref());
    let config = Arc::new(server_config(ssh, host_key));
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind SSH listener on {listen_addr}"))?;

    info!(address = %listen_addr, login = %ssh.service_login, "starting SSH server");
    serve(listener, Arc::clone(&state), config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_config() -> SshConfig {
        serde_yaml::from_str("listen: 127.0.0.1:0\nkeepalive_interval_secs: 0\n").unwrap()
    }

    #[test]
    fn missing_host_key_falls_back_to_ephemeral() {
        let missing = Path::new("/nonexistent/gitgate_host_key");
        assert!(load_host_key_from_file(missing).is_err());
        let _ephemeral = load_or_generate_host_key(Some(missing));
    }

    #[test]
    fn server_config_only_offers_publickey() {
        let config = server_config(&ssh_config(), KeyPair::generate_ed25519());
        assert_eq!(config.methods, MethodSet::PUBLICKEY);
        assert_eq!(config.max_auth_attempts, 6);
        assert_eq!(config.auth_rejection_time, Duration::from_millis(500));
        assert!(config.keepalive_interval.is_none());
        assert!(config.inactivity_timeout.is_none());
    }

    #[tokio::test]
    async fn severed_transport_fails_pending_reads() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (near, mut far) = tokio::io::duplex(64);
        let cut = CancellationToken::new();
        let mut stream = Severable::new(near, cut.clone());

        far.write_all(b"SSH-2.0-x\r\n").await.unwrap();
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();

        // Nothing more arrives; the pending read must still end.
        let reader = tokio::spawn(async move {
            let mut more = [0u8; 1];
            stream.read(&mut more).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cut.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("read stayed blocked after the cut")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
