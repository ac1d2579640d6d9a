use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::{
    ArtifactStore, ConfigRetriever, InventoryWriter, JobProgress, JobRunWithHistory,
    MetadataResolver, ProgressTracker,
};
use crate::db;
use crate::logging::LogThrottle;

/// The collaborators a backup job talks to.
#[derive(Clone)]
pub struct BackupServices {
    pub resolver: Arc<dyn MetadataResolver>,
    pub retriever: Arc<dyn ConfigRetriever>,
    pub store: Arc<dyn ArtifactStore>,
    pub inventory: Arc<dyn InventoryWriter>,
}

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub progress: ProgressTracker,
    pub services: BackupServices,
    /// Rate limit for batch progress lines, shared by every running job.
    pub log_throttle: Arc<LogThrottle>,
    repository_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection, services: BackupServices) -> Self {
        let progress = ProgressTracker::new(config.backup.progress_retention());
        Self {
            config: Arc::new(config),
            db,
            progress,
            services,
            log_throttle: Arc::new(LogThrottle::new(Duration::from_secs(2))),
            repository_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Lock owning a repository's working copy. A job holds it from
    /// open/clone until its finalizer has committed.
    pub async fn repository_lock(&self, repository_id: i64) -> Arc<Mutex<()>> {
        self.repository_locks
            .lock()
            .await
            .entry(repository_id)
            .or_default()
            .clone()
    }

    /// Job record with history. While the job runs, `processed_devices`
    /// reflects the live counter rather than the last persisted value.
    pub async fn job(&self, job_id: &str) -> Result<Option<JobRunWithHistory>> {
        let Some(mut job) = db::jobs::get_with_history(&self.db, job_id.to_string()).await? else {
            return Ok(None);
        };

        if !job.record.status.is_terminal() {
            if let Some(progress) = self.progress.get(job_id).await {
                job.record.processed_devices = progress.processed;
            }
        }

        Ok(Some(job))
    }

    /// Live counter if present, otherwise the persisted counts.
    pub async fn progress(&self, job_id: &str) -> Result<Option<JobProgress>> {
        if let Some(progress) = self.progress.get(job_id).await {
            return Ok(Some(progress));
        }

        Ok(db::jobs::get(&self.db, job_id.to_string())
            .await?
            .map(|record| JobProgress {
                processed: record.processed_devices,
                total: record.total_devices,
            }))
    }
}
