//! Bare Git repository lifecycle on the local filesystem.
//!
//! Creation is atomic: the repository is initialised in a hidden scratch
//! directory next to its final location and renamed into place only once
//! the init program succeeded, so a failed or interrupted creation never
//! leaves a partial `<name>.git` behind.  The init program runs under the
//! channel's time limits and cancellation like any other command.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::dispatch::command::is_valid_segment;
use crate::dispatch::exec::{program_command, run_captured, ExecLimits};
use crate::dispatch::DispatchError;

/// Prefix of in-progress creations; never listed, never resolvable.
pub const SCRATCH_PREFIX: &str = ".creating-";

#[derive(Debug, Error)]
pub enum CreateRepoError {
    #[error("repository already exists")]
    AlreadyExists,
    /// The init program timed out or the channel was cancelled.
    #[error(transparent)]
    Interrupted(DispatchError),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Check whether `path` looks like a bare Git repository: a directory with a
/// `HEAD` file.  A lightweight heuristic, not an integrity check.
pub async fn is_bare_repo(path: &Path) -> bool {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return false;
    }

    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !head_exists {
        debug!(path = %path.display(), "HEAD file not found; not a bare repo");
        return false;
    }

    let objects_ok = tokio::fs::metadata(path.join("objects"))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !objects_ok {
        warn!(path = %path.display(), "HEAD exists but objects/ is missing");
    }
    true
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Create `<ns_dir>/<name>.git` by running `init_argv <scratch-dir>` and
/// renaming the result into place.  Callers serialise creations of the same
/// repository; this function still refuses to replace an existing one.
#[instrument(skip(init_argv, limits, cancel), fields(ns_dir = %ns_dir.display()))]
pub async fn create_bare_repo_atomic(
    ns_dir: &Path,
    name: &str,
    init_argv: &[String],
    limits: ExecLimits,
    cancel: &CancellationToken,
) -> Result<PathBuf, CreateRepoError> {
    let target = ns_dir.join(format!("{name}.git"));
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return Err(CreateRepoError::AlreadyExists);
    }

    tokio::fs::create_dir_all(ns_dir)
        .await
        .with_context(|| format!("failed to create namespace directory {}", ns_dir.display()))?;

    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(ns_dir)
        .context("failed to create scratch directory")?;

    let program = init_argv.first().cloned().unwrap_or_default();
    let cmd = program_command(init_argv, scratch.path()).map_err(|e| anyhow!("{e}"))?;
    // `scratch` is dropped on every early return below, removing whatever
    // the init program left behind.
    let output = match run_captured(cmd, limits, cancel).await {
        Ok(output) => output,
        Err(DispatchError::Execution(message)) => return Err(anyhow!(message).into()),
        Err(e) => return Err(CreateRepoError::Interrupted(e)),
    };

    if output.code != 0 {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "{program} failed (exit {}): {}",
            output.code,
            stderr.trim()
        )
        .into());
    }
    if !is_bare_repo(scratch.path()).await {
        return Err(anyhow!("{program} did not produce a bare repository").into());
    }

    // Re-check under the caller's lock: rename(2) would happily replace an
    // empty directory.
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return Err(CreateRepoError::AlreadyExists);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        tokio::fs::set_permissions(scratch.path(), std::fs::Permissions::from_mode(0o755))
            .await
            .context("failed to set repository permissions")?;
    }

    tokio::fs::rename(scratch.path(), &target)
        .await
        .with_context(|| format!("failed to move repository into {}", target.display()))?;
    // The scratch handle's cleanup now finds nothing to remove.
    drop(scratch);

    debug!(path = %target.display(), "bare repo created");
    Ok(target)
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

/// Names (without `.git`) of the bare repositories in `ns_dir`, sorted.
/// A missing namespace directory is empty, not an error.
pub async fn list_repos(ns_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(ns_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", ns_dir.display()));
        }
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(name) = file_name.strip_suffix(".git") else {
            continue;
        };
        if !is_valid_segment(name) {
            continue;
        }
        if is_bare_repo(&entry.path()).await {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::*;
    use super::*;

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn nonexistent_path_is_not_a_repo() {
        assert!(!is_bare_repo(Path::new("/tmp/nonexistent_gitgate_test_repo")).await);
    }

    #[tokio::test]
    async fn create_then_list() {
        let root = tempfile::tempdir().unwrap();
        let ns = root.path().join("alice");

        let path = create(&ns, "site", &fake_init()).await.unwrap();
        assert_eq!(path, ns.join("site.git"));
        assert!(is_bare_repo(&path).await);
        create(&ns, "blog", &fake_init()).await.unwrap();

        assert_eq!(list_repos(&ns).await.unwrap(), vec!["blog", "site"]);
        assert_eq!(leftovers(&ns).len(), 2);
    }

    #[tokio::test]
    async fn existing_repo_is_not_replaced() {
        let root = tempfile::tempdir().unwrap();
        let ns = root.path().join("alice");
        let path = create(&ns, "site", &fake_init()).await.unwrap();
        std::fs::write(path.join("marker"), "keep").unwrap();

        let err = create(&ns, "site", &fake_init())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateRepoError::AlreadyExists));
        assert!(path.join("marker").exists());
    }

    #[tokio::test]
    async fn failed_init_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let ns = root.path().join("alice");

        let err = create(&ns, "site", &failing_init())
            .await
            .unwrap_err();
        match err {
            CreateRepoError::Failed(e) => assert!(e.to_string().contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!ns.join("site.git").exists());
        assert!(leftovers(&ns).is_empty(), "leftovers: {:?}", leftovers(&ns));
    }

    #[tokio::test]
    async fn init_that_produces_no_repo_fails() {
        let root = tempfile::tempdir().unwrap();
        let ns = root.path().join("alice");
        let argv: Vec<String> = vec!["true".into()];
        let err = create(&ns, "site", &argv).await.unwrap_err();
        assert!(matches!(err, CreateRepoError::Failed(_)));
        assert!(leftovers(&ns).is_empty());
    }

    fn hanging_init(pid_file: &Path) -> Vec<String> {
        vec![
            "sh".into(),
            "-c".into(),
            format!("mkdir \"$1/objects\"; echo $$ > '{}'; exec sleep 30", pid_file.display()),
            "sh".into(),
        ]
    }

    fn wait_for_pid(pid_file: &Path) -> i32 {
        std::fs::read_to_string(pid_file).unwrap().trim().parse().unwrap()
    }

    #[tokio::test]
    async fn cancelled_init_is_killed_and_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        let ns = root.path().join("alice");
        let pid_file = root.path().join("init.pid");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watched = pid_file.clone();
        tokio::spawn(async move {
            while !watched.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = create_bare_repo_atomic(
            &ns,
            "site",
            &hanging_init(&pid_file),
            init_limits(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            err,
            CreateRepoError::Interrupted(DispatchError::Cancelled)
        ));
        assert!(leftovers(&ns).is_empty(), "leftovers: {:?}", leftovers(&ns));

        let pid = wait_for_pid(&pid_file);
        assert!(unsafe { libc::kill(pid, 0) } != 0, "init {pid} still alive");
    }

    #[tokio::test]
    async fn silent_init_times_out() {
        let root = tempfile::tempdir().unwrap();
        let ns = root.path().join("alice");
        let pid_file = root.path().join("init.pid");

        let err = create_bare_repo_atomic(
            &ns,
            "site",
            &hanging_init(&pid_file),
            ExecLimits {
                idle_timeout: Duration::from_millis(300),
                max_duration: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            CreateRepoError::Interrupted(e) => assert_eq!(e.exit_code(), 124),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!ns.join("site.git").exists());
        assert!(leftovers(&ns).is_empty());
        let pid = wait_for_pid(&pid_file);
        assert!(unsafe { libc::kill(pid, 0) } != 0, "init {pid} still alive");
    }

    #[tokio::test]
    async fn list_skips_scratch_and_junk() {
        let root = tempfile::tempdir().unwrap();
        let ns = root.path().join("alice");
        create(&ns, "site", &fake_init()).await.unwrap();
        std::fs::create_dir_all(ns.join(".creating-abc/objects")).unwrap();
        std::fs::write(ns.join(".creating-abc/HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::create_dir_all(ns.join("notes")).unwrap();
        std::fs::create_dir_all(ns.join("empty.git")).unwrap();

        assert_eq!(list_repos(&ns).await.unwrap(), vec!["site"]);
    }

    #[tokio::test]
    async fn missing_namespace_lists_empty() {
        let root = tempfile::tempdir().unwrap();
        assert!(list_repos(&root.path().join("nobody")).await.unwrap().is_empty());
    }
}
