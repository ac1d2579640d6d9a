//! Per-device backup worker.
//!
//! A worker turns one `DeviceBackupTask` into exactly one
//! `DeviceBackupResult`. Every failure is captured on the result; `run`
//! never returns an error. Workers only create files named after their own
//! device, so any number of them can write into the same working copy
//! concurrently without locking.

use std::path::Path;
use std::sync::Arc;

use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::BackupSettings;
use crate::logging::LogThrottle;

use super::error::DeviceErrorKind;
use super::inventory::{DeviceMetadata, MetadataResolver};
use super::models::{ArtifactKind, ConfigArtifact, DeviceBackupResult, DeviceBackupTask};
use super::paths;
use super::platform;
use super::progress::ProgressTracker;
use super::retriever::{ConfigRetriever, RemoteTarget, partition_output};

#[derive(Clone)]
pub struct DeviceBackupWorker {
    resolver: Arc<dyn MetadataResolver>,
    retriever: Arc<dyn ConfigRetriever>,
    progress: ProgressTracker,
    settings: Arc<BackupSettings>,
    throttle: Arc<LogThrottle>,
}

impl DeviceBackupWorker {
    pub fn new(
        resolver: Arc<dyn MetadataResolver>,
        retriever: Arc<dyn ConfigRetriever>,
        progress: ProgressTracker,
        settings: Arc<BackupSettings>,
        throttle: Arc<LogThrottle>,
    ) -> Self {
        Self {
            resolver,
            retriever,
            progress,
            settings,
            throttle,
        }
    }

    /// Back up one device and count it as processed, whatever the outcome.
    pub async fn run(&self, task: DeviceBackupTask) -> DeviceBackupResult {
        let span = info_span!(
            "device_backup",
            job_id = %task.job_id,
            device_id = %task.device_id,
            index = task.index,
            total = task.total
        );

        async {
            let result = self.backup(&task).await;

            match &result.error {
                None => info!(
                    device = %result.display_name(),
                    artifacts = result.artifacts.len(),
                    "Device backed up"
                ),
                Some(error) => warn!(device = %result.display_name(), error = %error, "Device backup failed"),
            }

            let processed = self.progress.increment(&task.job_id).await;
            if processed == task.total || self.throttle.should_log() {
                info!(processed, total = task.total, "Batch progress");
            }

            result
        }
        .instrument(span)
        .await
    }

    async fn backup(&self, task: &DeviceBackupTask) -> DeviceBackupResult {
        let result = DeviceBackupResult::new(task.device_id.clone(), task.index);

        let metadata = match self.resolver.get(&task.device_id).await {
            Ok(metadata) => metadata,
            Err(e) => {
                return result.failed(DeviceErrorKind::MetadataFetchFailed(format!("{e:#}")));
            }
        };

        let mut result = DeviceBackupResult {
            device_name: Some(metadata.name.clone()),
            device_ip: metadata.primary_address.clone(),
            platform: Some(metadata.platform.clone()),
            ..result
        };

        let Some(address) = metadata.primary_address.clone() else {
            return result.failed(DeviceErrorKind::NoPrimaryAddress);
        };

        let (profile, known) = platform::resolve_profile(&metadata.platform);
        if !known {
            warn!(
                platform = %metadata.platform,
                profile,
                "Unknown platform, using default connection profile"
            );
        }

        let target = RemoteTarget {
            device_name: metadata.name.clone(),
            address,
            profile,
            credential: task.credential.clone(),
        };

        let (running, startup) = match self.retrieve(&target).await {
            Ok(configs) => configs,
            Err(error) => return result.failed(error),
        };

        if running.is_empty() {
            return result.failed(DeviceErrorKind::EmptyRunningConfig);
        }

        match self
            .write_artifacts(task, &metadata, &[(ArtifactKind::Running, running), (ArtifactKind::Startup, startup)])
            .await
        {
            Ok(artifacts) => {
                result.artifacts = artifacts;
                result.succeeded = true;
                result
            }
            Err(error) => result.failed(error),
        }
    }

    async fn retrieve(&self, target: &RemoteTarget) -> Result<(String, String), DeviceErrorKind> {
        let commands = self.settings.commands();
        let timeout = self.settings.session_timeout();

        debug!(address = %target.address, profile = target.profile, "Opening remote session");

        let output = match tokio::time::timeout(timeout, self.retriever.execute(target, &commands)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(DeviceErrorKind::RemoteRetrievalFailed(format!("{e:#}"))),
            Err(_) => {
                return Err(DeviceErrorKind::RemoteRetrievalFailed(format!(
                    "session timed out after {}s",
                    timeout.as_secs_f64()
                )));
            }
        };

        let (running, startup) = partition_output(
            &output,
            &self.settings.running_command,
            self.settings.startup_command.as_deref(),
        );

        debug!(
            running_bytes = running.len(),
            startup_bytes = startup.len(),
            "Configuration retrieved"
        );

        Ok((running, startup))
    }

    /// Write the non-empty configs. On failure, files already written for
    /// this device are removed again so nothing half-finished is left behind.
    async fn write_artifacts(
        &self,
        task: &DeviceBackupTask,
        metadata: &DeviceMetadata,
        configs: &[(ArtifactKind, String)],
    ) -> Result<Vec<ConfigArtifact>, DeviceErrorKind> {
        let attributes = metadata.template_attributes();
        let mut artifacts = Vec::with_capacity(configs.len());

        for (kind, content) in configs {
            if content.is_empty() {
                debug!(kind = %kind, "Empty configuration, nothing written");
                continue;
            }

            let template = match kind {
                ArtifactKind::Running => self.settings.running_path_template.as_deref(),
                ArtifactKind::Startup => self.settings.startup_path_template.as_deref(),
            };

            let written = match paths::artifact_path(
                template,
                &metadata.name,
                &attributes,
                &task.run_timestamp,
                *kind,
            ) {
                Ok(relative) => write_file(&task.repo_working_dir, &relative, content)
                    .await
                    .map(|()| relative)
                    .map_err(|e| format!("{e:#}")),
                Err(e) => Err(e.to_string()),
            };

            match written {
                Ok(relative_path) => {
                    debug!(kind = %kind, path = %relative_path, "Artifact written");
                    artifacts.push(ConfigArtifact {
                        kind: *kind,
                        relative_path,
                        byte_count: content.len() as u64,
                    });
                }
                Err(message) => {
                    remove_written(&task.repo_working_dir, &artifacts).await;
                    return Err(DeviceErrorKind::ArtifactWriteFailed(message));
                }
            }
        }

        Ok(artifacts)
    }
}

async fn write_file(root: &Path, relative: &str, content: &str) -> anyhow::Result<()> {
    use anyhow::Context;

    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

async fn remove_written(root: &Path, artifacts: &[ConfigArtifact]) {
    for artifact in artifacts {
        if let Err(e) = tokio::fs::remove_file(root.join(&artifact.relative_path)).await {
            debug!(path = %artifact.relative_path, error = %e, "Failed to remove partial artifact");
        }
    }
}
