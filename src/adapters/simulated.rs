//! In-process collaborators for simulation mode and tests.
//!
//! Every simulated adapter accepts injected failures so a batch can be driven
//! through its partial-failure paths without real devices, an inventory
//! server or a git remote.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;

use crate::config::RepositoryConfig;
use crate::core::artifact_store::{ArtifactStore, CommitOutcome, WorkingCopy};
use crate::core::inventory::{DeviceMetadata, InventoryWriter, MetadataResolver};
use crate::core::models::RepoOperation;
use crate::core::retriever::{ConfigRetriever, RemoteTarget, RetrievalOutput};

/// Inventory that invents a device for every id it is asked about.
///
/// Device `<id>` is named `<id>` with address `192.0.2.<n>` and platform
/// `Cisco IOS` unless configured otherwise.
#[derive(Default)]
pub struct SimulatedInventory {
    devices: HashMap<String, DeviceMetadata>,
    fail_fetch: HashSet<String>,
    no_address: HashSet<String>,
    fail_update: HashSet<String>,
    updates: Mutex<Vec<(String, String, String)>>,
}

impl SimulatedInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device_id: &str, metadata: DeviceMetadata) -> Self {
        self.devices.insert(device_id.to_string(), metadata);
        self
    }

    pub fn failing_fetch(mut self, device_id: &str) -> Self {
        self.fail_fetch.insert(device_id.to_string());
        self
    }

    pub fn without_address(mut self, device_id: &str) -> Self {
        self.no_address.insert(device_id.to_string());
        self
    }

    pub fn failing_update(mut self, device_id: &str) -> Self {
        self.fail_update.insert(device_id.to_string());
        self
    }

    /// `(device_id, field, value)` for every successful field write.
    pub fn updates(&self) -> Vec<(String, String, String)> {
        self.updates
            .lock()
            .map(|u| u.clone())
            .unwrap_or_default()
    }

    fn synthesize(device_id: &str) -> DeviceMetadata {
        let octet = device_id
            .bytes()
            .fold(0u32, |acc, b| (acc * 31 + u32::from(b)) % 250)
            + 1;
        DeviceMetadata {
            name: device_id.to_string(),
            primary_address: Some(format!("192.0.2.{octet}")),
            platform: "Cisco IOS".to_string(),
            attributes: json!({
                "id": device_id,
                "name": device_id,
                "location": {"name": "SIM", "parent": {"name": "LAB"}},
                "platform": {"name": "Cisco IOS"},
            }),
        }
    }
}

#[async_trait]
impl MetadataResolver for SimulatedInventory {
    async fn get(&self, device_id: &str) -> Result<DeviceMetadata> {
        if self.fail_fetch.contains(device_id) {
            bail!("simulated inventory lookup failure for {device_id}");
        }

        let mut metadata = self
            .devices
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| Self::synthesize(device_id));

        if self.no_address.contains(device_id) {
            metadata.primary_address = None;
        }
        Ok(metadata)
    }
}

#[async_trait]
impl InventoryWriter for SimulatedInventory {
    async fn set_field(&self, device_id: &str, field_name: &str, value: &str) -> Result<()> {
        if self.fail_update.contains(device_id) {
            bail!("simulated inventory update failure for {device_id}");
        }
        if let Ok(mut updates) = self.updates.lock() {
            updates.push((device_id.to_string(), field_name.to_string(), value.to_string()));
        }
        Ok(())
    }
}

/// Device shell returning canned configuration text.
///
/// Failure injection is keyed by device name.
#[derive(Default)]
pub struct SimulatedRetriever {
    delay: Duration,
    fail: HashSet<String>,
    hang: HashSet<String>,
    no_startup: HashSet<String>,
    empty_running: HashSet<String>,
    unstructured: bool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl SimulatedRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, device_name: &str) -> Self {
        self.fail.insert(device_name.to_string());
        self
    }

    /// The session never answers; only the caller's timeout ends it.
    pub fn hanging(mut self, device_name: &str) -> Self {
        self.hang.insert(device_name.to_string());
        self
    }

    pub fn without_startup(mut self, device_name: &str) -> Self {
        self.no_startup.insert(device_name.to_string());
        self
    }

    pub fn with_empty_running(mut self, device_name: &str) -> Self {
        self.empty_running.insert(device_name.to_string());
        self
    }

    /// Return only the combined transcript, no per-command association.
    pub fn unstructured(mut self) -> Self {
        self.unstructured = true;
        self
    }

    /// Highest number of sessions that were open at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn render(&self, target: &RemoteTarget, commands: &[String]) -> RetrievalOutput {
        let name = &target.device_name;
        let mut output = RetrievalOutput::default();

        for (i, command) in commands.iter().enumerate() {
            let text = match i {
                0 if self.empty_running.contains(name) => String::new(),
                0 => format!(
                    "!\nhostname {name}\ninterface Loopback0\n ip address {} 255.255.255.255\n!\nend",
                    target.address
                ),
                _ if self.no_startup.contains(name) => String::new(),
                _ => format!("!\n! startup\nhostname {name}\n!\nend"),
            };

            output.combined.push_str(command);
            output.combined.push('\n');
            output.combined.push_str(&text);
            output.combined.push('\n');
            if !self.unstructured {
                output.by_command.insert(command.clone(), text);
            }
        }
        output
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigRetriever for SimulatedRetriever {
    async fn execute(&self, target: &RemoteTarget, commands: &[String]) -> Result<RetrievalOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak.fetch_max(now, Ordering::SeqCst);

        if self.hang.contains(&target.device_name) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.contains(&target.device_name) {
            bail!("simulated authentication failure on {}", target.address);
        }

        Ok(self.render(target, commands))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommit {
    pub message: String,
    pub files: Vec<String>,
    pub hash: String,
}

/// Artifact store keeping working copies as plain directories under `root`
/// and recording commits instead of running git.
pub struct SimulatedStore {
    root: PathBuf,
    fail_open: bool,
    fail_pull: bool,
    fail_push: bool,
    fail_commit: bool,
    commits: Mutex<Vec<RecordedCommit>>,
}

impl SimulatedStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            fail_open: false,
            fail_pull: false,
            fail_push: false,
            fail_commit: false,
            commits: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_pull(mut self) -> Self {
        self.fail_pull = true;
        self
    }

    pub fn failing_push(mut self) -> Self {
        self.fail_push = true;
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.commits
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactStore for SimulatedStore {
    async fn open_or_clone(&self, repository: &RepositoryConfig) -> Result<WorkingCopy> {
        if self.fail_open {
            bail!("simulated clone failure for {}", repository.url);
        }

        let path = self.root.join(&repository.name);
        let operation = if path.is_dir() {
            RepoOperation::Opened
        } else {
            tokio::fs::create_dir_all(&path).await?;
            RepoOperation::Cloned
        };

        Ok(WorkingCopy {
            path,
            branch: repository.branch_or("main"),
            repository: repository.clone(),
            operation,
        })
    }

    async fn pull(&self, working_copy: &WorkingCopy) -> Result<()> {
        if self.fail_pull {
            bail!("simulated pull failure for {}", working_copy.repository.url);
        }
        Ok(())
    }

    async fn commit_and_push(
        &self,
        working_copy: &WorkingCopy,
        message: &str,
        files: &[String],
    ) -> Result<CommitOutcome> {
        if self.fail_commit {
            bail!("simulated commit failure");
        }

        for file in files {
            if !working_copy.path.join(file).is_file() {
                bail!("pathspec '{file}' did not match any files");
            }
        }

        let mut commits = match self.commits.lock() {
            Ok(commits) => commits,
            Err(poisoned) => poisoned.into_inner(),
        };
        let hash = format!("{:08x}", 0x5eed_0000_u32 + commits.len() as u32);
        commits.push(RecordedCommit {
            message: message.to_string(),
            files: files.to_vec(),
            hash: hash.clone(),
        });

        Ok(CommitOutcome {
            commit_hash: Some(hash),
            pushed: !self.fail_push,
            files_changed: files.len(),
            push_error: self
                .fail_push
                .then(|| "simulated push rejected by remote".to_string()),
        })
    }
}
