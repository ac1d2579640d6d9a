use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single device could not be backed up.
///
/// These never cross a worker boundary as errors; they are stored on the
/// device's result and reported in the job summary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum DeviceErrorKind {
    #[error("failed to fetch device metadata: {0}")]
    MetadataFetchFailed(String),

    #[error("device has no primary IP address")]
    NoPrimaryAddress,

    #[error("remote retrieval failed: {0}")]
    RemoteRetrievalFailed(String),

    #[error("device returned an empty running configuration")]
    EmptyRunningConfig,

    #[error("failed to write configuration artifact: {0}")]
    ArtifactWriteFailed(String),

    #[error("backup worker aborted: {0}")]
    WorkerAborted(String),
}

/// Errors that stop a job before or outside of the per-device phase.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Bad input; no worker was started.
    #[error("validation failed: {message}")]
    Validation { job_id: String, message: String },

    /// The working copy could not be opened or cloned.
    #[error("artifact store unavailable: {message}")]
    ArtifactStore { job_id: String, message: String },

    #[error("job {job_id} not found")]
    NotFound { job_id: String },

    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Validation { job_id, .. }
            | Self::ArtifactStore { job_id, .. }
            | Self::NotFound { job_id } => Some(job_id),
            Self::Persistence(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_serializes_with_kind_tag() {
        let err = DeviceErrorKind::RemoteRetrievalFailed("timed out".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "remote_retrieval_failed");
        assert_eq!(json["message"], "timed out");

        let json = serde_json::to_value(DeviceErrorKind::NoPrimaryAddress).unwrap();
        assert_eq!(json["kind"], "no_primary_address");
    }

    #[test]
    fn dispatch_error_exposes_job_id() {
        let err = DispatchError::Validation {
            job_id: "job-1".into(),
            message: "No devices specified".into(),
        };
        assert_eq!(err.job_id(), Some("job-1"));
        assert_eq!(err.to_string(), "validation failed: No devices specified");
    }
}
