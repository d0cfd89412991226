//! Streaming child-process execution with idle timeout and cancellation.
//!
//! stdout and stderr are forwarded chunk by chunk in the order they are read
//! (never buffered to completion), stdin is pumped from the channel in a
//! separate task, and any I/O in either direction resets the idle timer.
//! The child runs in its own process group so that a timeout or
//! cancellation kills everything it spawned, and it is always reaped before
//! this module returns.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::DispatchError;
use super::sink::OutputSink;

const CHUNK_SIZE: usize = 64 * 1024;

/// Time bounds applied to a single child process.
#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    /// Kill the child after this long without any I/O.
    pub idle_timeout: Duration,
    /// Kill the child after this long regardless of activity.
    pub max_duration: Option<Duration>,
}

/// Build a command from a configured argv prefix plus trailing arguments.
pub fn program_command(argv: &[String], trailing: &Path) -> Result<Command, DispatchError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| DispatchError::execution("no program configured"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).arg(trailing);
    Ok(cmd)
}

/// Aborts the stdin pump when execution finishes by any path.
struct PumpGuard(JoinHandle<()>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawn `cmd` and stream it to completion.  Returns the child's exit code.
pub async fn run_streaming<R, S>(
    mut cmd: Command,
    stdin: R,
    sink: &mut S,
    limits: ExecLimits,
    cancel: &CancellationToken,
) -> Result<i32, DispatchError>
where
    R: AsyncRead + Unpin + Send + 'static,
    S: OutputSink + ?Sized,
{
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| DispatchError::execution(format!("failed to start {program}: {e}")))?;
    debug!(%program, pid = ?child.id(), "child spawned");

    let (Some(child_stdin), Some(mut child_stdout), Some(mut child_stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        terminate(&mut child).await;
        return Err(DispatchError::execution("child stdio was not piped"));
    };

    let activity = Arc::new(Notify::new());
    let _pump = PumpGuard(tokio::spawn(pump_stdin(
        stdin,
        child_stdin,
        Arc::clone(&activity),
    )));

    let idle = tokio::time::sleep(limits.idle_timeout);
    tokio::pin!(idle);
    let hard_deadline = async {
        match limits.max_duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(hard_deadline);

    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut out_open = true;
    let mut err_open = true;

    let status: ExitStatus = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(%program, "cancelled; killing child");
                terminate(&mut child).await;
                return Err(DispatchError::Cancelled);
            }
            _ = &mut hard_deadline => {
                warn!(%program, "maximum duration exceeded; killing child");
                terminate(&mut child).await;
                return Err(DispatchError::Timeout(limits.max_duration.unwrap_or_default()));
            }
            _ = &mut idle => {
                warn!(%program, timeout = ?limits.idle_timeout, "no I/O within idle timeout; killing child");
                terminate(&mut child).await;
                return Err(DispatchError::Timeout(limits.idle_timeout));
            }
            _ = activity.notified() => {
                idle.as_mut().reset(Instant::now() + limits.idle_timeout);
            }
            read = child_stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => {
                    if sink.stdout(&out_buf[..n]).await.is_err() {
                        debug!(%program, "stdout sink closed; killing child");
                        terminate(&mut child).await;
                        return Err(DispatchError::Cancelled);
                    }
                    idle.as_mut().reset(Instant::now() + limits.idle_timeout);
                }
            },
            read = child_stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => {
                    if sink.stderr(&err_buf[..n]).await.is_err() {
                        debug!(%program, "stderr sink closed; killing child");
                        terminate(&mut child).await;
                        return Err(DispatchError::Cancelled);
                    }
                    idle.as_mut().reset(Instant::now() + limits.idle_timeout);
                }
            },
            waited = child.wait(), if !out_open && !err_open => match waited {
                Ok(status) => break status,
                Err(e) => {
                    terminate(&mut child).await;
                    return Err(DispatchError::execution(format!("failed to wait for {program}: {e}")));
                }
            },
        }
    };

    let code = exit_code(status);
    debug!(%program, code, "child exited");
    Ok(code)
}

/// Copy channel input into the child's stdin until either side closes.
/// Dropping `stdin` on return delivers EOF to the child.
async fn pump_stdin<R>(mut input: R, mut stdin: ChildStdin, activity: Arc<Notify>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match input.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stdin.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                activity.notify_one();
            }
        }
    }
}

/// Kill the child's whole process group and reap the child.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own group (`process_group(0)` at spawn), so a
        // negative pid reaches every descendant as well.
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill after group signal failed");
        let _ = child.wait().await;
    }
}

/// A child run to completion with no channel attached.
#[derive(Debug)]
pub struct Captured {
    pub code: i32,
    /// Leading stderr bytes, for error messages.
    pub stderr: Vec<u8>,
}

/// Keeps the first [`CAPTURE_LIMIT`] bytes of stderr; stdout is discarded.
#[derive(Default)]
struct StderrCapture {
    stderr: Vec<u8>,
}

const CAPTURE_LIMIT: usize = 8 * 1024;

#[async_trait::async_trait]
impl OutputSink for StderrCapture {
    async fn stdout(&mut self, _data: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    async fn stderr(&mut self, data: &[u8]) -> std::io::Result<()> {
        let room = CAPTURE_LIMIT.saturating_sub(self.stderr.len());
        self.stderr.extend_from_slice(&data[..data.len().min(room)]);
        Ok(())
    }
}

/// Run a helper program (such as the repository init) under the same time
/// limits and cancellation as a streamed command, with empty stdin.
pub async fn run_captured(
    cmd: Command,
    limits: ExecLimits,
    cancel: &CancellationToken,
) -> Result<Captured, DispatchError> {
    let mut sink = StderrCapture::default();
    let code = run_streaming(cmd, tokio::io::empty(), &mut sink, limits, cancel).await?;
    Ok(Captured {
        code,
        stderr: sink.stderr,
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::sink::testing::{CaptureSink, Stream};

    fn limits(idle_ms: u64) -> ExecLimits {
        ExecLimits {
            idle_timeout: Duration::from_millis(idle_ms),
            max_duration: None,
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn pid_alive(pid: u32) -> bool {
        // Signal 0 only checks for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[tokio::test]
    async fn streams_output_and_exit_code() {
        let mut sink = CaptureSink::default();
        let code = run_streaming(
            sh("printf hello; printf oops >&2; exit 7"),
            tokio::io::empty(),
            &mut sink,
            limits(5_000),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 7);
        assert_eq!(sink.stdout_text(), "hello");
        assert_eq!(sink.stderr_text(), "oops");
    }

    #[tokio::test]
    async fn stdin_reaches_the_child() {
        let mut sink = CaptureSink::default();
        let input: &'static [u8] = b"ping\npong\n";
        let code = run_streaming(
            sh("cat"),
            input,
            &mut sink,
            limits(5_000),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(sink.stdout_text(), "ping\npong\n");
    }

    #[tokio::test]
    async fn per_stream_order_is_preserved() {
        let mut sink = CaptureSink::default();
        run_streaming(
            sh("for i in 1 2 3 4 5; do echo out$i; echo err$i >&2; sleep 0.01; done"),
            tokio::io::empty(),
            &mut sink,
            limits(5_000),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(sink.stdout_text(), "out1\nout2\nout3\nout4\nout5\n");
        assert_eq!(sink.stderr_text(), "err1\nerr2\nerr3\nerr4\nerr5\n");
        assert!(sink.chunks.iter().any(|(s, _)| *s == Stream::Stderr));
    }

    #[tokio::test]
    async fn large_output_is_streamed_in_chunks() {
        let mut sink = CaptureSink::default();
        run_streaming(
            sh("head -c 1000000 /dev/zero"),
            tokio::io::empty(),
            &mut sink,
            limits(5_000),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(sink.stdout_bytes().len(), 1_000_000);
        assert!(sink.chunks.len() > 1);
        assert!(sink.chunks.iter().all(|(_, d)| d.len() <= CHUNK_SIZE));
    }

    #[tokio::test]
    async fn silent_child_times_out_and_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());

        let started = std::time::Instant::now();
        let mut sink = CaptureSink::default();
        let err = run_streaming(
            sh(&script),
            tokio::io::empty(),
            &mut sink,
            limits(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));
        assert_eq!(err.exit_code(), 124);
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!pid_alive(pid), "child {pid} survived the timeout");
    }

    #[tokio::test]
    async fn grandchildren_die_with_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        // The background sleep is a grandchild of the dispatcher.
        let script = format!("sleep 30 & echo $! > '{}'; wait", pid_file.display());

        let err = run_streaming(
            sh(&script),
            tokio::io::empty(),
            &mut CaptureSink::default(),
            limits(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // The grandchild is not ours to reap; give init a moment.
        for _ in 0..50 {
            if !pid_alive(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!pid_alive(pid), "grandchild {pid} survived");
    }

    #[tokio::test]
    async fn output_keeps_an_idle_child_alive() {
        let mut sink = CaptureSink::default();
        let code = run_streaming(
            sh("for i in 1 2 3 4 5 6; do echo tick; sleep 0.1; done"),
            tokio::io::empty(),
            &mut sink,
            limits(400),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(sink.stdout_text().lines().count(), 6);
    }

    #[tokio::test]
    async fn hard_deadline_applies_despite_activity() {
        let err = run_streaming(
            sh("while true; do echo tick; sleep 0.05; done"),
            tokio::io::empty(),
            &mut CaptureSink::default(),
            ExecLimits {
                idle_timeout: Duration::from_secs(10),
                max_duration: Some(Duration::from_millis(300)),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(d) if d == Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = run_streaming(
            sh("sleep 30"),
            tokio::io::empty(),
            &mut CaptureSink::default(),
            limits(60_000),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn spawn_failure_is_execution_error() {
        let err = run_streaming(
            Command::new("/nonexistent/gitgate-test-binary"),
            tokio::io::empty(),
            &mut CaptureSink::default(),
            limits(1_000),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Execution(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn captured_run_keeps_stderr_only() {
        let out = run_captured(
            sh("echo ignored; echo 'fatal: nope' >&2; exit 3"),
            limits(5_000),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stderr, b"fatal: nope\n");
    }

    #[tokio::test]
    async fn captured_run_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_captured(sh("sleep 30"), limits(60_000), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    #[test]
    fn program_command_appends_path() {
        let argv = vec!["git".to_string(), "upload-pack".to_string()];
        let cmd = program_command(&argv, Path::new("/srv/a.git")).unwrap();
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(cmd.as_std().get_program(), "git");
        assert_eq!(args, vec!["upload-pack", "/srv/a.git"]);
        assert!(program_command(&[], Path::new("/x")).is_err());
    }
}
