pub mod artifact_store;
pub mod dispatcher;
pub mod error;
pub mod finalizer;
pub mod inventory;
pub mod models;
pub mod paths;
pub mod platform;
pub mod progress;
pub mod retriever;
pub mod worker;

pub use artifact_store::{ArtifactStore, CommitOutcome, WorkingCopy};
pub use dispatcher::Dispatcher;
pub use error::{DeviceErrorKind, DispatchError};
pub use finalizer::Finalizer;
pub use inventory::{DeviceMetadata, InventoryWriter, MetadataResolver};
pub use models::{
    ArtifactKind, BackupJob, BackupRequest, ConfigArtifact, DeviceBackupResult, DeviceBackupTask,
    FinalizeSummary, JobRunEvent, JobRunRecord, JobRunWithHistory, JobStatus, RepoOperation,
    RepositoryStatus, RunTimestamp, SessionCredential, TimestampUpdateStatus,
};
pub use progress::{JobProgress, ProgressTracker};
pub use retriever::{ConfigRetriever, RemoteTarget, RetrievalOutput};
pub use worker::DeviceBackupWorker;
