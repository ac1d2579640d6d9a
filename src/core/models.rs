use std::fmt;
use std::path::PathBuf;

use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::DeviceErrorKind;

/// Format used for artifact file names and commit messages.
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Format written to the inventory "last backup" field.
pub const RUN_DATE_FORMAT: &str = "%Y-%m-%d";

/// A single timestamp computed at dispatch and shared by every task of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunTimestamp(NaiveDateTime);

impl RunTimestamp {
    pub fn now() -> Self {
        Self(Local::now().naive_local())
    }

    pub fn from_naive(value: NaiveDateTime) -> Self {
        Self(value)
    }

    pub fn parse(value: &str) -> Result<Self, chrono::ParseError> {
        NaiveDateTime::parse_from_str(value, RUN_TIMESTAMP_FORMAT).map(Self)
    }

    pub fn date(&self) -> NaiveDate {
        self.0.date()
    }

    /// The run date as written to inventory records (`YYYY-MM-DD`).
    pub fn date_string(&self) -> String {
        self.0.format(RUN_DATE_FORMAT).to_string()
    }
}

impl fmt::Display for RunTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(RUN_TIMESTAMP_FORMAT))
    }
}

impl Serialize for RunTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RunTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Payload accepted from API and CLI callers to start a backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    pub device_ids: Vec<String>,
    pub repository_id: i64,
    pub credential_id: i64,
    #[serde(default = "default_parallel_tasks")]
    pub parallel_tasks: usize,
    #[serde(default)]
    pub write_timestamp_to_custom_field: bool,
    #[serde(default)]
    pub timestamp_custom_field_name: Option<String>,
}

fn default_parallel_tasks() -> usize {
    1
}

/// An immutable description of one bulk backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub job_id: String,
    pub device_ids: Vec<String>,
    pub repository_id: i64,
    pub credential_id: i64,
    pub parallelism: usize,
    pub write_timestamp: bool,
    pub timestamp_field_name: Option<String>,
}

impl BackupJob {
    pub fn from_request(request: BackupRequest) -> Self {
        Self {
            job_id: uuid::Uuid::now_v7().to_string(),
            device_ids: request.device_ids,
            repository_id: request.repository_id,
            credential_id: request.credential_id,
            parallelism: request.parallel_tasks,
            write_timestamp: request.write_timestamp_to_custom_field,
            timestamp_field_name: request.timestamp_custom_field_name,
        }
    }

    pub fn total_devices(&self) -> usize {
        self.device_ids.len()
    }
}

/// Username/password pair used to open an interactive shell on a device.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Work item for a single device. Built once at dispatch and moved into its worker.
#[derive(Debug, Clone)]
pub struct DeviceBackupTask {
    pub job_id: String,
    pub device_id: String,
    /// 1-based position in the job's device list.
    pub index: usize,
    pub total: usize,
    pub repo_working_dir: PathBuf,
    pub credential: SessionCredential,
    pub run_timestamp: RunTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Running,
    Startup,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Startup => "startup",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configuration file written into the repository working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigArtifact {
    pub kind: ArtifactKind,
    /// Path relative to the working copy root, always `/`-separated.
    pub relative_path: String,
    pub byte_count: u64,
}

/// Outcome of one device's backup, produced exactly once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBackupResult {
    pub device_id: String,
    pub index: usize,
    pub device_name: Option<String>,
    pub device_ip: Option<String>,
    pub platform: Option<String>,
    pub artifacts: Vec<ConfigArtifact>,
    pub succeeded: bool,
    pub error: Option<DeviceErrorKind>,
}

impl DeviceBackupResult {
    pub fn new(device_id: impl Into<String>, index: usize) -> Self {
        Self {
            device_id: device_id.into(),
            index,
            device_name: None,
            device_ip: None,
            platform: None,
            artifacts: Vec::new(),
            succeeded: false,
            error: None,
        }
    }

    pub fn failed(mut self, error: DeviceErrorKind) -> Self {
        self.succeeded = false;
        self.artifacts.clear();
        self.error = Some(error);
        self
    }

    /// True when the device contributes files to the batch commit.
    pub fn is_backed_up(&self) -> bool {
        self.error.is_none() && self.artifacts.iter().any(|a| a.byte_count > 0)
    }

    pub fn display_name(&self) -> &str {
        self.device_name.as_deref().unwrap_or(&self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoOperation {
    Opened,
    Cloned,
    Recloned,
    Pulled,
}

/// What happened to the working copy while the job was being prepared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStatus {
    pub repository_id: i64,
    pub name: String,
    pub url: String,
    pub branch: String,
    pub path: PathBuf,
    pub operation: RepoOperation,
    pub pull_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimestampUpdateStatus {
    pub enabled: bool,
    pub custom_field_name: Option<String>,
    pub updated_count: usize,
    pub failed_count: usize,
    pub errors: Vec<String>,
}

/// Terminal report of a batch, written once by the finalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeSummary {
    /// True when no device failed.
    pub success: bool,
    pub backed_up_count: usize,
    pub failed_count: usize,
    pub committed: bool,
    pub commit_hash: Option<String>,
    pub pushed: bool,
    pub files_changed: usize,
    pub commit_error: Option<String>,
    pub timestamp_update: TimestampUpdateStatus,
    pub repository: RepositoryStatus,
    pub run_timestamp: RunTimestamp,
    pub backed_up_devices: Vec<DeviceBackupResult>,
    pub failed_devices: Vec<DeviceBackupResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted lifecycle of a backup job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunRecord {
    pub id: String,
    pub status: JobStatus,
    pub total_devices: usize,
    pub processed_devices: usize,
    pub result: Option<FinalizeSummary>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunEvent {
    pub status: JobStatus,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunWithHistory {
    #[serde(flatten)]
    pub record: JobRunRecord,
    pub history: Vec<JobRunEvent>,
}
