use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::RepositoryConfig;

use super::models::RepoOperation;

/// A local working copy of a configuration repository.
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    pub path: PathBuf,
    pub branch: String,
    pub repository: RepositoryConfig,
    pub operation: RepoOperation,
}

/// Result of the single commit/push performed per batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOutcome {
    /// Short (8 character) hash, `None` when there was nothing to commit.
    pub commit_hash: Option<String>,
    pub pushed: bool,
    pub files_changed: usize,
    pub push_error: Option<String>,
}

/// Versioned store receiving backup files.
///
/// Only the dispatcher (open/pull) and the finalizer (commit/push) call this;
/// workers only write plain files under `WorkingCopy::path`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Open the existing working copy or clone it.
    async fn open_or_clone(&self, repository: &RepositoryConfig) -> Result<WorkingCopy>;

    /// Bring the working copy up to date with its remote.
    async fn pull(&self, working_copy: &WorkingCopy) -> Result<()>;

    /// Stage `files`, commit them with `message` and push.
    ///
    /// A push failure is reported in the outcome, not as an error, since the
    /// local commit already exists.
    async fn commit_and_push(
        &self,
        working_copy: &WorkingCopy,
        message: &str,
        files: &[String],
    ) -> Result<CommitOutcome>;
}
