//! Repository storage: path resolution, bare repository management and
//! per-repository locking.
//!
//! Layout is `<root>/<namespace>/<name>.git`.  Namespace and name are
//! validated segments by the time they reach this module, so a resolved
//! path never escapes the root.

pub mod bare_repo;
pub mod locks;

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

pub use bare_repo::{create_bare_repo_atomic, is_bare_repo, list_repos, CreateRepoError};
pub use locks::{RepoLockGuard, RepoLocks};

use crate::dispatch::command::RepoRef;
use crate::dispatch::ExecLimits;

#[derive(Debug, Clone)]
pub struct RepoStore {
    root: PathBuf,
    locks: RepoLocks,
}

impl RepoStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: RepoLocks::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    pub fn repo_path(&self, repo: &RepoRef) -> PathBuf {
        self.namespace_dir(&repo.namespace)
            .join(format!("{}.git", repo.name))
    }

    pub async fn exists(&self, repo: &RepoRef) -> bool {
        is_bare_repo(&self.repo_path(repo)).await
    }

    pub async fn lock(&self, repo: &RepoRef) -> RepoLockGuard {
        self.locks.acquire(&repo.to_string()).await
    }

    pub async fn create(
        &self,
        repo: &RepoRef,
        init_argv: &[String],
        limits: ExecLimits,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, CreateRepoError> {
        create_bare_repo_atomic(
            &self.namespace_dir(&repo.namespace),
            &repo.name,
            init_argv,
            limits,
            cancel,
        )
        .await
    }

    pub async fn list(&self, namespace: &str) -> anyhow::Result<Vec<String>> {
        list_repos(&self.namespace_dir(namespace)).await
    }
}
