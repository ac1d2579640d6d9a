#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use netbk::adapters::simulated::{SimulatedInventory, SimulatedRetriever, SimulatedStore};
use netbk::config::{AppConfig, BackupSettings, Credential, CredentialKind, RepositoryConfig};
use netbk::context::{AppContext, BackupServices};
use netbk::core::{BackupJob, Dispatcher, JobRunWithHistory};
use netbk::db;
use tempfile::TempDir;

pub struct Harness {
    pub ctx: AppContext,
    pub inventory: Arc<SimulatedInventory>,
    pub retriever: Arc<SimulatedRetriever>,
    pub store: Arc<SimulatedStore>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new(
        inventory: SimulatedInventory,
        retriever: SimulatedRetriever,
        store: impl FnOnce(SimulatedStore) -> SimulatedStore,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Arc::new(inventory);
        let retriever = Arc::new(retriever);
        let store = Arc::new(store(SimulatedStore::new(dir.path().join("repos"))));

        let services = BackupServices {
            resolver: inventory.clone(),
            retriever: retriever.clone(),
            store: store.clone(),
            inventory: inventory.clone(),
        };

        let conn = db::init(&dir.path().join("netbk.db")).await.unwrap();
        let ctx = AppContext::new(config(&dir), conn, services);

        Self {
            ctx,
            inventory,
            retriever,
            store,
            dir,
        }
    }

    pub async fn simple() -> Self {
        Self::new(SimulatedInventory::new(), SimulatedRetriever::new(), |s| s).await
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.ctx.clone())
    }

    pub fn working_copy(&self) -> std::path::PathBuf {
        self.dir.path().join("repos").join("configs")
    }

    pub async fn job(&self, job_id: &str) -> JobRunWithHistory {
        self.ctx.job(job_id).await.unwrap().unwrap()
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_for(&self, job_id: &str) -> JobRunWithHistory {
        for _ in 0..200 {
            let job = self.job(job_id).await;
            if job.record.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {job_id} did not finish");
    }
}

pub fn config(dir: &TempDir) -> AppConfig {
    AppConfig {
        data_directory: dir.path().join("repos"),
        database_path: dir.path().join("netbk.db"),
        backup: BackupSettings {
            session_timeout_secs: 1,
            ..BackupSettings::default()
        },
        repositories: vec![RepositoryConfig {
            id: 1,
            name: "configs".into(),
            url: "sim://configs.git".into(),
            branch: None,
            username: None,
            token: None,
            path: None,
        }],
        credentials: vec![Credential {
            id: 1,
            name: "lab".into(),
            kind: CredentialKind::Ssh,
            username: Some("admin".into()),
            password: Some("secret".into()),
        }],
        ..AppConfig::default()
    }
}

pub fn job(devices: &[&str], parallelism: usize) -> BackupJob {
    BackupJob {
        job_id: uuid::Uuid::now_v7().to_string(),
        device_ids: devices.iter().map(|d| d.to_string()).collect(),
        repository_id: 1,
        credential_id: 1,
        parallelism,
        write_timestamp: false,
        timestamp_field_name: None,
    }
}

pub fn devices(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("sw-{i:02}")).collect()
}
