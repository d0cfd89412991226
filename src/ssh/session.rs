//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound connection is served by one [`SshSession`].  Authentication
//! resolves the offered key to a platform identity exactly once; every exec
//! channel afterwards is handed to the connection's supervisor, which runs
//! the dispatcher on its own task.  The handler itself only routes channel
//! data, so a slow command never stalls the other channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use tracing::{debug, info, warn};

use super::channel::{stdin_pipe, ChannelSink, StdinSender};
use crate::identity::{fingerprint_of_blob, key_type_of_blob};
use crate::supervisor::{
    ChannelPermit, ChannelTask, ConnectionState, ConnectionSupervisor, SupervisorLimits,
};
use crate::AppState;

/// Exec payloads longer than this are refused without parsing.
const MAX_COMMAND_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-channel bookkeeping between open and close.
#[derive(Default)]
struct ChannelSlot {
    /// Held from open until exec, then moved into the channel task.
    permit: Option<ChannelPermit>,
    /// Client data is forwarded here once a command is running.
    stdin: Option<StdinSender>,
    /// `GIT_PROTOCOL` sent via env request before exec.
    git_protocol: Option<String>,
    /// The command's task once exec was accepted.
    task: Option<ChannelTask<ChannelSink>>,
}

/// An offered public key as the resolver sees it.
#[derive(Debug)]
struct OfferedKey {
    blob: String,
    fingerprint: String,
    /// Taken from the blob: RSA keys are offered under their signature
    /// algorithm (`rsa-sha2-*`) but registered as `ssh-rsa`.
    key_type: String,
}

fn describe_key(key: &PublicKey) -> Result<OfferedKey> {
    let blob = key.public_key_base64();
    Ok(OfferedKey {
        fingerprint: fingerprint_of_blob(&blob)?,
        key_type: key_type_of_blob(&blob)?,
        blob,
    })
}

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    supervisor: ConnectionSupervisor,
    channels: HashMap<ChannelId, ChannelSlot>,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        let ssh = &state.config.ssh;
        let limits = SupervisorLimits {
            max_channels: ssh.max_channels_per_connection,
            idle_timeout: ssh.idle_timeout(),
            grace: ssh.shutdown_grace(),
        };
        let supervisor =
            ConnectionSupervisor::new(Arc::clone(&state.dispatcher), limits, &state.shutdown)
                .with_metrics(state.metrics.clone());
        state.metrics.metrics.active_connections.inc();
        Self {
            state,
            peer_addr,
            supervisor,
            channels: HashMap::new(),
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.state.metrics.metrics.active_connections.dec();
        // Live channels get the grace period even though the client is gone.
        let supervisor = self.supervisor.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move { supervisor.close().await });
        }
        debug!(peer = ?self.peer_addr, "SSH session dropped");
    }
}

// ---------------------------------------------------------------------------
// Channel close helper
// ---------------------------------------------------------------------------

/// Report `message` on stderr and finish the channel in the order Git
/// expects: exit-status, EOF, close.
fn refuse(session: &mut Session, channel_id: ChannelId, message: &str, exit_status: u32) {
    session.extended_data(
        channel_id,
        1,
        CryptoVec::from_slice(format!("ERROR: {message}\n").as_bytes()),
    );
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Authenticate a client by public key.  Every rejection reason is
    /// logged by the resolver; the client only sees a failed attempt.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        self.supervisor.begin_auth();
        let reject = Auth::Reject {
            proceed_with_methods: None,
        };

        let offered = match describe_key(key) {
            Ok(offered) => offered,
            Err(e) => {
                warn!(peer = ?self.peer_addr, error = %format!("{e:#}"), "unusable public key offered");
                return Ok(reject);
            }
        };
        info!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %offered.fingerprint,
            key_type = %offered.key_type,
            "SSH public-key auth attempt"
        );

        match self
            .state
            .resolver
            .resolve(user, &offered.fingerprint, &offered.key_type, &offered.blob)
            .await
        {
            Ok(identity) => {
                info!(
                    peer = ?self.peer_addr,
                    fingerprint = %offered.fingerprint,
                    identity = %identity,
                    "SSH key resolved"
                );
                self.supervisor.authenticated(identity);
                Ok(Auth::Accept)
            }
            Err(_) => Ok(reject),
        }
    }

    /// Start watching for connection idleness once authenticated.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let supervisor = self.supervisor.clone();
        let handle = session.handle();
        let peer = self.peer_addr;
        tokio::spawn(async move {
            supervisor.idle().await;
            if matches!(
                supervisor.state(),
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                return;
            }
            info!(peer = ?peer, "closing idle SSH connection");
            let _ = handle
                .disconnect(
                    Disconnect::ByApplication,
                    "idle timeout".to_string(),
                    "en".to_string(),
                )
                .await;
        });
        Ok(())
    }

    /// Accept a session channel if the connection has a free slot.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(permit) = self.supervisor.try_open() else {
            warn!(
                peer = ?self.peer_addr,
                active = self.supervisor.active_channels(),
                "refusing channel"
            );
            return Ok(false);
        };
        self.channels.insert(
            channel.id(),
            ChannelSlot {
                permit: Some(permit),
                ..Default::default()
            },
        );
        Ok(true)
    }

    /// Git clients send `GIT_PROTOCOL=version=2` here before exec.  Other
    /// variables are ignored.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            if let Some(slot) = self.channels.get_mut(&channel) {
                debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
                slot.git_protocol = Some(variable_value.to_string());
            }
        }
        Ok(())
    }

    /// Interactive shells are never offered.
    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(peer = ?self.peer_addr, "refused interactive shell");
        let _ = session.channel_failure(channel);
        refuse(
            session,
            channel,
            "interactive shells are not supported; run a Git command instead",
            1,
        );
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer_addr, "refused PTY request");
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(peer = ?self.peer_addr, subsystem = %name, "refused subsystem");
        let _ = session.channel_failure(channel);
        Ok(())
    }

    /// Hand the command to the supervisor.  Output, exit status and channel
    /// close are sent from the channel task.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(slot) = self.channels.get_mut(&channel_id) else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        let Some(permit) = slot.permit.take() else {
            // One command per channel.
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        if data.len() > MAX_COMMAND_LEN {
            warn!(peer = ?self.peer_addr, len = data.len(), "exec request too large");
            let _ = session.channel_success(channel_id);
            refuse(session, channel_id, "command line too long", 1);
            return Ok(());
        }

        let command_line = String::from_utf8_lossy(data).into_owned();
        debug!(peer = ?self.peer_addr, command = %command_line, "SSH exec request");

        let (stdin_tx, stdin) = stdin_pipe();
        slot.stdin = Some(stdin_tx);
        let sink = ChannelSink::new(session.handle(), channel_id);
        let git_protocol = slot.git_protocol.take();

        let _ = session.channel_success(channel_id);
        match self
            .supervisor
            .spawn(permit, command_line, stdin, sink, git_protocol)
        {
            Some(task) => slot.task = Some(task),
            None => refuse(session, channel_id, "not authenticated", 1),
        }
        Ok(())
    }

    /// Forward client data to the running command's stdin.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.supervisor.touch();
        if let Some(slot) = self.channels.get_mut(&channel) {
            if let Some(stdin) = &slot.stdin {
                if stdin.send(Ok(Bytes::copy_from_slice(data))).is_err() {
                    // The command finished reading its input.
                    slot.stdin = None;
                }
            }
        }
        Ok(())
    }

    /// Client EOF closes the command's stdin.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(slot) = self.channels.get_mut(&channel) {
            slot.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let task = self.channels.remove(&channel).and_then(|slot| slot.task);
        if let Some(task) = task.filter(|task| !task.join.is_finished()) {
            // The command notices on its next write and is cancelled.
            debug!(
                peer = ?self.peer_addr,
                state = ?*task.state.borrow(),
                "client closed a channel with a running command"
            );
        }
        self.supervisor.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    use russh::{client, ChannelMsg};
    use russh_keys::key::KeyPair;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::auth::KeyResolver;
    use crate::config::Config;
    use crate::dispatch::testing::{fake_programs, grants, limits};
    use crate::dispatch::Dispatcher;
    use crate::git::RepoStore;
    use crate::identity::testing::{identity, key_for, RSA_PRIVATE_KEY};
    use crate::identity::MemoryIdentityStore;
    use crate::metrics::MetricsRegistry;
    use crate::ssh::server::{serve, server_config};
    use crate::supervisor::testing::raise_fd_limit;
    use crate::supervisor::Shutdown;

    /// A gateway listening on loopback with `alice` (ed25519) and `bob`
    /// (RSA) registered.
    struct Gateway {
        _root: tempfile::TempDir,
        addr: SocketAddr,
        state: Arc<AppState>,
        alice: Arc<KeyPair>,
        bob: Arc<KeyPair>,
    }

    fn public_blob(key: &KeyPair) -> String {
        key.clone_public_key().unwrap().public_key_base64()
    }

    async fn gateway_with_auth_timeout(auth_timeout_secs: u64) -> Gateway {
        let root = tempfile::tempdir().unwrap();
        let yaml = format!(
            "ssh:\n  listen: \"127.0.0.1:0\"\n  auth_rejection_ms: 0\n  keepalive_interval_secs: 0\n  auth_timeout_secs: {auth_timeout_secs}\nidentity_store:\n  backend: file\n  path: /nonexistent/keys.yaml\nrepos:\n  root: {}\n",
            root.path().display()
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();

        let alice = KeyPair::generate_ed25519();
        let bob = russh_keys::decode_secret_key(RSA_PRIVATE_KEY, None).unwrap();
        let store = MemoryIdentityStore::new();
        store
            .insert(key_for(identity("u-1", "alice"), &public_blob(&alice)))
            .unwrap();
        store
            .insert(key_for(identity("u-2", "bob"), &public_blob(&bob)))
            .unwrap();
        let resolver = KeyResolver::new(
            Arc::new(store),
            "git",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let dispatcher = Dispatcher::new(
            RepoStore::new(root.path()),
            Arc::new(grants()),
            fake_programs(),
            limits(),
        );
        let ssh = server_config(&config.ssh, KeyPair::generate_ed25519());
        let state = Arc::new(AppState {
            shutdown: Shutdown::new(config.ssh.shutdown_grace()),
            config: Arc::new(config),
            resolver,
            dispatcher: Arc::new(dispatcher),
            metrics: MetricsRegistry::new(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::clone(&state), Arc::new(ssh)));
        Gateway {
            _root: root,
            addr,
            state,
            alice: Arc::new(alice),
            bob: Arc::new(bob),
        }
    }

    async fn gateway() -> Gateway {
        gateway_with_auth_timeout(30).await
    }

    struct TrustingClient;

    #[async_trait::async_trait]
    impl client::Handler for TrustingClient {
        type Error = russh::Error;

        async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    type Client = client::Handle<TrustingClient>;

    impl Gateway {
        async fn connect(&self, user: &str, key: &Arc<KeyPair>) -> (Client, bool) {
            let config = Arc::new(client::Config::default());
            let mut handle = client::connect(config, self.addr, TrustingClient)
                .await
                .unwrap();
            let accepted = handle
                .authenticate_publickey(user, Arc::clone(key))
                .await
                .unwrap();
            (handle, accepted)
        }

        async fn login(&self, key: &Arc<KeyPair>) -> Client {
            let (handle, accepted) = self.connect("git", key).await;
            assert!(accepted, "key was not accepted");
            handle
        }

        fn repo_path(&self, relative: &str) -> std::path::PathBuf {
            self.state.dispatcher.repos().root().join(relative)
        }
    }

    /// Everything the server sent on one channel.
    #[derive(Debug, Default)]
    struct Transcript {
        /// Request replies in order: `true` for success.
        replies: Vec<bool>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit: Option<u32>,
    }

    impl Transcript {
        fn stdout_text(&self) -> String {
            String::from_utf8_lossy(&self.stdout).into_owned()
        }

        fn stderr_text(&self) -> String {
            String::from_utf8_lossy(&self.stderr).into_owned()
        }
    }

    async fn collect(channel: &mut russh::Channel<client::Msg>) -> Transcript {
        let mut out = Transcript::default();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), channel.wait())
                .await
                .expect("channel went quiet without closing");
            match msg {
                Some(ChannelMsg::Success) => out.replies.push(true),
                Some(ChannelMsg::Failure) => out.replies.push(false),
                Some(ChannelMsg::Data { data }) => out.stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    out.stderr.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => out.exit = Some(exit_status),
                Some(ChannelMsg::Close) | None => return out,
                Some(_) => {}
            }
        }
    }

    async fn exec(handle: &Client, line: &str) -> Transcript {
        let mut channel = handle.channel_open_session().await.unwrap();
        channel.exec(true, line).await.unwrap();
        collect(&mut channel).await
    }

    #[tokio::test]
    async fn ed25519_key_authenticates() {
        let gw = gateway().await;
        let handle = gw.login(&gw.alice).await;
        let out = exec(&handle, "whoami").await;
        assert_eq!(out.replies, vec![true]);
        assert_eq!(out.stdout_text(), "alice u-1\n");
        assert_eq!(out.exit, Some(0));
    }

    #[tokio::test]
    async fn rsa_key_authenticates_with_sha2_signatures() {
        let gw = gateway().await;
        // Offered as rsa-sha2-512, registered as ssh-rsa.
        assert_ne!(gw.bob.name(), "ssh-rsa");
        let handle = gw.login(&gw.bob).await;
        let out = exec(&handle, "whoami").await;
        assert_eq!(out.stdout_text(), "bob u-2\n");
        assert_eq!(out.exit, Some(0));
    }

    #[tokio::test]
    async fn unknown_key_and_wrong_login_are_rejected() {
        let gw = gateway().await;
        let stranger = Arc::new(KeyPair::generate_ed25519());
        assert!(!gw.connect("git", &stranger).await.1);
        assert!(!gw.connect("alice", &gw.alice).await.1);
    }

    #[tokio::test]
    async fn stdin_reaches_the_command_until_eof() {
        let gw = gateway().await;
        let handle = gw.login(&gw.alice).await;
        assert_eq!(exec(&handle, "repo create site").await.exit, Some(0));

        let mut channel = handle.channel_open_session().await.unwrap();
        channel
            .set_env(false, "GIT_PROTOCOL", "version=2")
            .await
            .unwrap();
        channel.exec(true, "git-upload-pack 'site'").await.unwrap();
        channel.data(&b"0009done\n"[..]).await.unwrap();
        channel.eof().await.unwrap();
        let out = collect(&mut channel).await;

        assert_eq!(out.replies, vec![true]);
        assert_eq!(out.exit, Some(0), "stderr: {}", out.stderr_text());
        let expected = format!(
            "upload-pack {} for alice proto=version=2\n0009done\n",
            gw.repo_path("alice/site.git").display()
        );
        assert_eq!(out.stdout_text(), expected);
    }

    #[tokio::test]
    async fn shell_is_refused_with_a_message() {
        let gw = gateway().await;
        let handle = gw.login(&gw.alice).await;
        let mut channel = handle.channel_open_session().await.unwrap();
        channel.request_shell(true).await.unwrap();
        let out = collect(&mut channel).await;
        assert_eq!(out.replies, vec![false]);
        assert!(out.stderr_text().contains("interactive shells"));
        assert_eq!(out.exit, Some(1));
    }

    #[tokio::test]
    async fn pty_is_refused_but_exec_still_works() {
        let gw = gateway().await;
        let handle = gw.login(&gw.alice).await;
        let mut channel = handle.channel_open_session().await.unwrap();
        channel
            .request_pty(true, "xterm", 80, 24, 0, 0, &[])
            .await
            .unwrap();
        channel.exec(true, "whoami").await.unwrap();
        let out = collect(&mut channel).await;
        assert_eq!(out.replies, vec![false, true]);
        assert_eq!(out.stdout_text(), "alice u-1\n");
        assert_eq!(out.exit, Some(0));
    }

    #[tokio::test]
    async fn one_command_per_channel() {
        let gw = gateway().await;
        let handle = gw.login(&gw.alice).await;
        assert_eq!(exec(&handle, "repo create site").await.exit, Some(0));

        let mut channel = handle.channel_open_session().await.unwrap();
        // upload-pack keeps running until stdin closes.
        channel.exec(true, "git-upload-pack site").await.unwrap();
        channel.exec(true, "whoami").await.unwrap();
        channel.eof().await.unwrap();
        let out = collect(&mut channel).await;
        assert_eq!(out.replies, vec![true, false]);
        assert!(!out.stdout_text().contains("u-1"));
        assert_eq!(out.exit, Some(0));
    }

    #[tokio::test]
    async fn oversized_command_is_refused() {
        let gw = gateway().await;
        let handle = gw.login(&gw.alice).await;
        let line = format!("whoami {}", "x".repeat(MAX_COMMAND_LEN));
        let out = exec(&handle, &line).await;
        assert!(out.stderr_text().contains("command line too long"));
        assert_eq!(out.exit, Some(1));
        assert!(out.stdout.is_empty());

        // The connection is still usable.
        assert_eq!(exec(&handle, "whoami").await.exit, Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_channels_on_one_connection() {
        raise_fd_limit();
        let gw = gateway().await;
        let handle = Arc::new(gw.login(&gw.alice).await);

        let mut tasks = Vec::new();
        for _ in 0..200 {
            let handle = Arc::clone(&handle);
            let name = format!("test-{}", uuid::Uuid::new_v4());
            tasks.push(tokio::spawn(async move {
                let out = exec(&handle, &format!("repo create {name}")).await;
                (name, out)
            }));
        }

        let mut created = HashSet::new();
        for task in tasks {
            let (name, out) = task.await.unwrap();
            assert_eq!(out.exit, Some(0), "{name}: {}", out.stderr_text());
            assert_eq!(out.stdout_text(), format!("created alice/{name}\n"));
            created.insert(name);
        }
        assert_eq!(created.len(), 200);

        let listing = exec(&handle, "repo list").await;
        assert_eq!(listing.stdout_text().lines().count(), 200);
    }

    #[tokio::test]
    async fn silent_peer_is_dropped_after_the_auth_deadline() {
        let gw = gateway_with_auth_timeout(1).await;
        let started = Instant::now();
        let mut stream = TcpStream::connect(gw.addr).await.unwrap();

        // Read the server banner and whatever follows, never answering.
        let mut buf = [0u8; 4096];
        let closed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "unauthenticated connection was kept open");
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn authenticated_connection_outlives_the_auth_deadline() {
        let gw = gateway_with_auth_timeout(1).await;
        let handle = gw.login(&gw.alice).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let out = exec(&handle, "whoami").await;
        assert_eq!(out.exit, Some(0));
    }
}
