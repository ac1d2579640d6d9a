//! Fan-out side of a backup batch.
//!
//! `prepare` validates the job and creates its record; `execute` resolves the
//! working copy, runs one worker per device (in order, or through a bounded
//! pool) and hands the complete result list to the [`Finalizer`].
//!
//! Jobs targeting the same repository are serialized: the working copy, its
//! index and the single commit per batch belong to one job at a time.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{AcquireError, Semaphore};
use tracing::{error, info, warn};

use crate::config::{AppConfig, CredentialKind, RepositoryConfig};
use crate::context::AppContext;
use crate::db;

use super::error::{DeviceErrorKind, DispatchError};
use super::finalizer::Finalizer;
use super::models::{
    BackupJob, DeviceBackupResult, DeviceBackupTask, FinalizeSummary, JobRunRecord, RepoOperation,
    RepositoryStatus, RunTimestamp, SessionCredential,
};
use super::worker::DeviceBackupWorker;

/// A job that passed validation and has a `pending` record.
struct PreparedJob {
    job: BackupJob,
    repository: RepositoryConfig,
    credential: SessionCredential,
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: AppContext,
}

impl Dispatcher {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Validate and record the job, then run it in the background.
    ///
    /// Returns the `pending` record as soon as the job is accepted.
    pub async fn submit(&self, job: BackupJob) -> Result<JobRunRecord, DispatchError> {
        let (record, prepared) = self.prepare(job).await?;

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let job_id = prepared.job.job_id.clone();
            if let Err(e) = dispatcher.execute(prepared).await {
                error!(job_id = %job_id, error = %e, "Backup job did not complete");
            }
        });

        Ok(record)
    }

    /// Run the job to completion and return its terminal record.
    pub async fn dispatch(&self, job: BackupJob) -> Result<JobRunRecord, DispatchError> {
        let (_, prepared) = self.prepare(job).await?;
        let job_id = prepared.job.job_id.clone();

        self.execute(prepared).await?;

        db::jobs::get(&self.ctx.db, job_id.clone())
            .await?
            .ok_or(DispatchError::NotFound { job_id })
    }

    async fn prepare(&self, job: BackupJob) -> Result<(JobRunRecord, PreparedJob), DispatchError> {
        let record = db::jobs::create(&self.ctx.db, &job).await?;

        match validate(&job, &self.ctx.config) {
            Ok((repository, credential)) => {
                info!(
                    job_id = %job.job_id,
                    devices = job.total_devices(),
                    parallelism = job.parallelism,
                    repository = %repository.name,
                    "Backup job accepted"
                );
                Ok((
                    record,
                    PreparedJob {
                        job,
                        repository,
                        credential,
                    },
                ))
            }
            Err(message) => {
                warn!(job_id = %job.job_id, reason = %message, "Backup job rejected");
                db::jobs::mark_failed(&self.ctx.db, job.job_id.clone(), message.clone()).await?;
                Err(DispatchError::Validation {
                    job_id: job.job_id,
                    message,
                })
            }
        }
    }

    async fn execute(&self, prepared: PreparedJob) -> Result<FinalizeSummary, DispatchError> {
        let PreparedJob {
            job,
            repository,
            credential,
        } = prepared;
        let services = &self.ctx.services;

        let lock = self.ctx.repository_lock(repository.id).await;
        let _working_copy_guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                info!(
                    job_id = %job.job_id,
                    repository = %repository.name,
                    "Repository in use by another job, waiting"
                );
                lock.lock_owned().await
            }
        };

        let working_copy = match services.store.open_or_clone(&repository).await {
            Ok(working_copy) => working_copy,
            Err(e) => {
                let message = format!("Failed to open repository {}: {e:#}", repository.name);
                error!(job_id = %job.job_id, error = %message, "Cannot start backup job");
                db::jobs::mark_failed(&self.ctx.db, job.job_id.clone(), message.clone()).await?;
                return Err(DispatchError::ArtifactStore {
                    job_id: job.job_id,
                    message,
                });
            }
        };

        let mut repository_status = RepositoryStatus {
            repository_id: repository.id,
            name: repository.name.clone(),
            url: repository.url.clone(),
            branch: working_copy.branch.clone(),
            path: working_copy.path.clone(),
            operation: working_copy.operation,
            pull_error: None,
        };

        if working_copy.operation == RepoOperation::Opened {
            match services.store.pull(&working_copy).await {
                Ok(()) => repository_status.operation = RepoOperation::Pulled,
                Err(e) => {
                    let message = format!("{e:#}");
                    warn!(
                        job_id = %job.job_id,
                        repository = %repository.name,
                        error = %message,
                        "Pull failed, continuing with local working copy"
                    );
                    repository_status.pull_error = Some(message);
                }
            }
        }

        info!(
            job_id = %job.job_id,
            repository = %repository.name,
            path = %working_copy.path.display(),
            operation = ?repository_status.operation,
            "Working copy ready"
        );

        match db::jobs::mark_running(&self.ctx.db, job.job_id.clone()).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job.job_id, "Job record was not pending when starting"),
            Err(e) => {
                let message = format!("Failed to start job: {e:#}");
                error!(job_id = %job.job_id, error = %message, "Cannot start backup job");
                if let Err(e) = db::jobs::mark_failed(&self.ctx.db, job.job_id.clone(), message).await {
                    error!(job_id = %job.job_id, error = %e, "Failed to record job failure");
                }
                return Err(DispatchError::Persistence(e));
            }
        }
        self.ctx.progress.start(&job.job_id, job.total_devices()).await;

        let run_timestamp = RunTimestamp::now();
        let tasks: Vec<DeviceBackupTask> = job
            .device_ids
            .iter()
            .enumerate()
            .map(|(i, device_id)| DeviceBackupTask {
                job_id: job.job_id.clone(),
                device_id: device_id.clone(),
                index: i + 1,
                total: job.total_devices(),
                repo_working_dir: working_copy.path.clone(),
                credential: credential.clone(),
                run_timestamp,
            })
            .collect();

        let worker = DeviceBackupWorker::new(
            services.resolver.clone(),
            services.retriever.clone(),
            self.ctx.progress.clone(),
            Arc::new(self.ctx.config.backup.clone()),
            self.ctx.log_throttle.clone(),
        );

        let results = if job.parallelism <= 1 {
            self.run_sequential(&worker, tasks).await
        } else {
            self.run_parallel(&worker, tasks, job.parallelism).await
        };

        let finalizer = Finalizer::new(
            services.store.clone(),
            services.inventory.clone(),
            self.ctx.db.clone(),
            self.ctx.progress.clone(),
        );

        finalizer
            .finalize(&job, &working_copy, repository_status, run_timestamp, results)
            .await
            .map_err(DispatchError::Persistence)
    }

    /// One device at a time, in input order. Each worker still runs in its
    /// own task so a panic becomes a failed result instead of ending the job.
    async fn run_sequential(
        &self,
        worker: &DeviceBackupWorker,
        tasks: Vec<DeviceBackupTask>,
    ) -> Vec<DeviceBackupResult> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            let worker = worker.clone();
            let placeholder = DeviceBackupResult::new(task.device_id.clone(), task.index);
            let job_id = task.job_id.clone();

            let result = match tokio::spawn(async move { worker.run(task).await }).await {
                Ok(result) => result,
                Err(e) => self.aborted(&job_id, placeholder, e.to_string()).await,
            };
            results.push(result);
        }
        results
    }

    /// Bounded pool. Handles are awaited in spawn order, which is the barrier:
    /// this returns only after every task has produced a result.
    async fn run_parallel(
        &self,
        worker: &DeviceBackupWorker,
        tasks: Vec<DeviceBackupTask>,
        parallelism: usize,
    ) -> Vec<DeviceBackupResult> {
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let worker = worker.clone();
            let semaphore = semaphore.clone();
            let placeholder = DeviceBackupResult::new(task.device_id.clone(), task.index);
            let job_id = task.job_id.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                Ok::<_, AcquireError>(worker.run(task).await)
            });
            handles.push((placeholder, job_id, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (placeholder, job_id, handle) in handles {
            let result = match handle.await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => self.aborted(&job_id, placeholder, e.to_string()).await,
                Err(e) => self.aborted(&job_id, placeholder, e.to_string()).await,
            };
            results.push(result);
        }
        results
    }

    async fn aborted(
        &self,
        job_id: &str,
        placeholder: DeviceBackupResult,
        reason: String,
    ) -> DeviceBackupResult {
        error!(job_id, device_id = %placeholder.device_id, reason = %reason, "Backup worker aborted");
        self.ctx.progress.increment(job_id).await;
        placeholder.failed(DeviceErrorKind::WorkerAborted(reason))
    }
}

/// Check a job against the configuration before anything is started.
pub fn validate(
    job: &BackupJob,
    config: &AppConfig,
) -> Result<(RepositoryConfig, SessionCredential), String> {
    if job.device_ids.is_empty() {
        return Err("No devices selected".to_string());
    }

    let mut seen = HashSet::with_capacity(job.device_ids.len());
    if let Some(duplicate) = job.device_ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(format!("Device {duplicate} is listed more than once"));
    }

    let max = config.backup.max_parallelism;
    if job.parallelism == 0 || job.parallelism > max {
        return Err(format!(
            "Parallel tasks must be between 1 and {max}, got {}",
            job.parallelism
        ));
    }

    if job.write_timestamp
        && job
            .timestamp_field_name
            .as_deref()
            .is_none_or(|f| f.trim().is_empty())
    {
        return Err("A custom field name is required to write backup timestamps".to_string());
    }

    let repository = config
        .repository(job.repository_id)
        .ok_or_else(|| format!("Repository {} not found", job.repository_id))?;

    let credential = config
        .credential(job.credential_id)
        .ok_or_else(|| format!("Credential {} not found", job.credential_id))?;

    if credential.kind != CredentialKind::Ssh {
        return Err(format!("Credential {} is not an SSH credential", credential.name));
    }

    let (Some(username), Some(password)) = (
        credential.username.clone().filter(|u| !u.is_empty()),
        credential.password.clone().filter(|p| !p.is_empty()),
    ) else {
        return Err(format!(
            "Credential {} needs both a username and a password",
            credential.name
        ));
    };

    Ok((repository.clone(), SessionCredential { username, password }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;

    fn config() -> AppConfig {
        AppConfig {
            repositories: vec![RepositoryConfig {
                id: 1,
                name: "configs".into(),
                url: "https://git.example.com/configs.git".into(),
                branch: None,
                username: None,
                token: None,
                path: None,
            }],
            credentials: vec![
                Credential {
                    id: 1,
                    name: "lab".into(),
                    kind: CredentialKind::Ssh,
                    username: Some("admin".into()),
                    password: Some("pw".into()),
                },
                Credential {
                    id: 2,
                    name: "api".into(),
                    kind: CredentialKind::Token,
                    username: None,
                    password: Some("tok".into()),
                },
                Credential {
                    id: 3,
                    name: "half".into(),
                    kind: CredentialKind::Ssh,
                    username: Some("admin".into()),
                    password: None,
                },
            ],
            ..AppConfig::default()
        }
    }

    fn job(devices: &[&str]) -> BackupJob {
        BackupJob {
            job_id: "job".into(),
            device_ids: devices.iter().map(|d| d.to_string()).collect(),
            repository_id: 1,
            credential_id: 1,
            parallelism: 1,
            write_timestamp: false,
            timestamp_field_name: None,
        }
    }

    #[test]
    fn accepts_valid_job() {
        let (repo, cred) = validate(&job(&["a", "b"]), &config()).unwrap();
        assert_eq!(repo.name, "configs");
        assert_eq!(cred.username, "admin");
    }

    #[test]
    fn rejects_empty_and_duplicate_devices() {
        assert!(validate(&job(&[]), &config()).unwrap_err().contains("No devices"));
        assert!(validate(&job(&["a", "b", "a"]), &config())
            .unwrap_err()
            .contains("more than once"));
    }

    #[test]
    fn rejects_out_of_range_parallelism() {
        let mut j = job(&["a"]);
        j.parallelism = 0;
        assert!(validate(&j, &config()).is_err());
        j.parallelism = 51;
        assert!(validate(&j, &config()).is_err());
        j.parallelism = 50;
        assert!(validate(&j, &config()).is_ok());
    }

    #[test]
    fn rejects_unknown_references() {
        let mut j = job(&["a"]);
        j.repository_id = 9;
        assert!(validate(&j, &config()).unwrap_err().contains("Repository 9"));

        let mut j = job(&["a"]);
        j.credential_id = 9;
        assert!(validate(&j, &config()).unwrap_err().contains("Credential 9"));
    }

    #[test]
    fn rejects_unusable_credentials() {
        let mut j = job(&["a"]);
        j.credential_id = 2;
        assert!(validate(&j, &config()).unwrap_err().contains("not an SSH"));
        j.credential_id = 3;
        assert!(validate(&j, &config()).unwrap_err().contains("username and a password"));
    }

    #[test]
    fn timestamp_requires_field_name() {
        let mut j = job(&["a"]);
        j.write_timestamp = true;
        assert!(validate(&j, &config()).is_err());
        j.timestamp_field_name = Some("last_backup".into());
        assert!(validate(&j, &config()).is_ok());
    }
}
