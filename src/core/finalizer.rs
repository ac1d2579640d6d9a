//! Fan-in step of a backup batch.
//!
//! Runs once per job, after every worker has produced its result: one commit
//! and push for the whole batch, optional "last backup" stamping in the
//! inventory, then the terminal `completed` transition of the job record.

use std::sync::Arc;

use anyhow::Result;
use tokio_rusqlite::Connection;
use tracing::{error, info, warn};

use crate::db;

use super::artifact_store::{ArtifactStore, WorkingCopy};
use super::inventory::InventoryWriter;
use super::models::{
    BackupJob, DeviceBackupResult, FinalizeSummary, RepositoryStatus, RunTimestamp,
    TimestampUpdateStatus,
};
use super::progress::ProgressTracker;

const COMPLETE_ATTEMPTS: u32 = 2;

pub struct Finalizer {
    store: Arc<dyn ArtifactStore>,
    inventory: Arc<dyn InventoryWriter>,
    db: Connection,
    progress: ProgressTracker,
}

struct CommitStatus {
    committed: bool,
    commit_hash: Option<String>,
    pushed: bool,
    files_changed: usize,
    commit_error: Option<String>,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        inventory: Arc<dyn InventoryWriter>,
        db: Connection,
        progress: ProgressTracker,
    ) -> Self {
        Self {
            store,
            inventory,
            db,
            progress,
        }
    }

    /// Finish the batch. Consumes the finalizer, so a job is finalized once.
    pub async fn finalize(
        self,
        job: &BackupJob,
        working_copy: &WorkingCopy,
        repository: RepositoryStatus,
        run_timestamp: RunTimestamp,
        mut results: Vec<DeviceBackupResult>,
    ) -> Result<FinalizeSummary> {
        if results.len() != job.total_devices() {
            warn!(
                job_id = %job.job_id,
                expected = job.total_devices(),
                received = results.len(),
                "Result count does not match device count"
            );
        }

        results.sort_by_key(|r| r.index);
        let processed = results.len();
        let (backed_up, failed): (Vec<_>, Vec<_>) =
            results.into_iter().partition(DeviceBackupResult::is_backed_up);

        info!(
            job_id = %job.job_id,
            backed_up = backed_up.len(),
            failed = failed.len(),
            "All device backups returned"
        );

        let commit = self.commit(job, working_copy, &run_timestamp, &backed_up).await;

        let timestamp_update = if job.write_timestamp {
            self.propagate_timestamp(job, &run_timestamp, &backed_up).await
        } else {
            TimestampUpdateStatus::default()
        };

        let summary = FinalizeSummary {
            success: failed.is_empty(),
            backed_up_count: backed_up.len(),
            failed_count: failed.len(),
            committed: commit.committed,
            commit_hash: commit.commit_hash,
            pushed: commit.pushed,
            files_changed: commit.files_changed,
            commit_error: commit.commit_error,
            timestamp_update,
            repository,
            run_timestamp,
            backed_up_devices: backed_up,
            failed_devices: failed,
        };

        let recorded = self.record(job, &summary, processed).await;
        self.progress.finish(&job.job_id).await;
        recorded?;

        info!(
            job_id = %job.job_id,
            backed_up = summary.backed_up_count,
            failed = summary.failed_count,
            commit = ?summary.commit_hash,
            pushed = summary.pushed,
            "Backup job completed"
        );

        Ok(summary)
    }

    /// Write the terminal `completed` state, retrying once. If the summary
    /// still cannot be stored the job is moved from `running` to `failed`,
    /// so its record always ends in a terminal state.
    async fn record(&self, job: &BackupJob, summary: &FinalizeSummary, processed: usize) -> Result<()> {
        let mut attempt = 1;
        loop {
            match db::jobs::complete(&self.db, job.job_id.clone(), summary, processed).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    warn!(job_id = %job.job_id, "Job was not running, summary not recorded");
                    return Ok(());
                }
                Err(e) if attempt < COMPLETE_ATTEMPTS => {
                    warn!(job_id = %job.job_id, attempt, error = %format!("{e:#}"), "Recording job summary failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    let message = format!("Failed to record job summary: {e:#}");
                    error!(job_id = %job.job_id, error = %message, "Giving up on job summary");
                    if let Err(fail_err) =
                        db::jobs::fail_running(&self.db, job.job_id.clone(), message).await
                    {
                        error!(job_id = %job.job_id, error = %format!("{fail_err:#}"), "Failed to record job failure");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn commit(
        &self,
        job: &BackupJob,
        working_copy: &WorkingCopy,
        run_timestamp: &RunTimestamp,
        backed_up: &[DeviceBackupResult],
    ) -> CommitStatus {
        let files: Vec<String> = backed_up
            .iter()
            .flat_map(|r| r.artifacts.iter().map(|a| a.relative_path.clone()))
            .collect();

        if files.is_empty() {
            info!(job_id = %job.job_id, "No device backed up, nothing to commit");
            return CommitStatus {
                committed: false,
                commit_hash: None,
                pushed: false,
                files_changed: 0,
                commit_error: None,
            };
        }

        let message = format!("Backup config {run_timestamp}");
        match self.store.commit_and_push(working_copy, &message, &files).await {
            Ok(outcome) => {
                if let Some(error) = &outcome.push_error {
                    warn!(job_id = %job.job_id, error = %error, "Push failed, commit kept locally");
                } else if outcome.commit_hash.is_some() {
                    info!(
                        job_id = %job.job_id,
                        commit = ?outcome.commit_hash,
                        files = outcome.files_changed,
                        "Committed and pushed backups"
                    );
                }
                CommitStatus {
                    committed: outcome.commit_hash.is_some(),
                    commit_hash: outcome.commit_hash,
                    pushed: outcome.pushed,
                    files_changed: outcome.files_changed,
                    commit_error: outcome.push_error,
                }
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %format!("{e:#}"), "Commit failed");
                CommitStatus {
                    committed: false,
                    commit_hash: None,
                    pushed: false,
                    files_changed: 0,
                    commit_error: Some(format!("{e:#}")),
                }
            }
        }
    }

    /// Stamp each backed-up device, one at a time. Failures are collected,
    /// never fatal.
    async fn propagate_timestamp(
        &self,
        job: &BackupJob,
        run_timestamp: &RunTimestamp,
        backed_up: &[DeviceBackupResult],
    ) -> TimestampUpdateStatus {
        let mut status = TimestampUpdateStatus {
            enabled: true,
            custom_field_name: job.timestamp_field_name.clone(),
            ..Default::default()
        };

        let Some(field) = job.timestamp_field_name.as_deref() else {
            return status;
        };
        let date = run_timestamp.date_string();

        for result in backed_up {
            match self.inventory.set_field(&result.device_id, field, &date).await {
                Ok(()) => status.updated_count += 1,
                Err(e) => {
                    warn!(
                        job_id = %job.job_id,
                        device = %result.display_name(),
                        error = %format!("{e:#}"),
                        "Failed to update backup timestamp"
                    );
                    status.failed_count += 1;
                    status
                        .errors
                        .push(format!("{}: {e:#}", result.display_name()));
                }
            }
        }

        info!(
            job_id = %job.job_id,
            field,
            updated = status.updated_count,
            failed = status.failed_count,
            "Backup timestamps propagated"
        );

        status
    }
}
