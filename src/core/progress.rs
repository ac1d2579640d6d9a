//! In-memory progress counters for active backup jobs.
//!
//! Each job gets a counter of processed devices that workers bump once per
//! device, whatever the outcome. Observers (RPC, HTTP) read it concurrently.
//! Counters are NOT persisted; the finalizer writes the final count to the
//! database. After a job finishes its counter lingers for a retention window
//! and is then evicted by `sweep`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Snapshot of a job's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub processed: usize,
    pub total: usize,
}

#[derive(Debug)]
struct Counter {
    processed: usize,
    total: usize,
    /// Set once the job is finished; the counter is dropped after this instant.
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe keyed counter shared across the application via `AppContext`.
///
/// Increments take the write lock, so concurrent workers are linearizable.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, Counter>>>,
    retention: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl ProgressTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Register a job with its total device count, resetting any stale counter.
    pub async fn start(&self, job_id: &str, total: usize) {
        let mut map = self.inner.write().await;
        map.insert(
            job_id.to_string(),
            Counter {
                processed: 0,
                total,
                expires_at: None,
            },
        );
    }

    /// Count one more processed device. Returns the new value.
    pub async fn increment(&self, job_id: &str) -> usize {
        let mut map = self.inner.write().await;
        let counter = map.entry(job_id.to_string()).or_insert(Counter {
            processed: 0,
            total: 0,
            expires_at: None,
        });
        counter.processed += 1;
        counter.processed
    }

    /// Processed count for a job; zero if unknown or expired.
    pub async fn read(&self, job_id: &str) -> usize {
        self.get(job_id).await.map(|p| p.processed).unwrap_or(0)
    }

    pub async fn get(&self, job_id: &str) -> Option<JobProgress> {
        let map = self.inner.read().await;
        let now = Instant::now();
        map.get(job_id)
            .filter(|c| !c.is_expired(now))
            .map(|c| JobProgress {
                processed: c.processed,
                total: c.total,
            })
    }

    /// Mark a job as finished; its counter stays readable for the retention window.
    pub async fn finish(&self, job_id: &str) {
        let mut map = self.inner.write().await;
        if let Some(counter) = map.get_mut(job_id) {
            counter.expires_at = Some(Instant::now() + self.retention);
        }
    }

    /// Drop expired counters. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut map = self.inner.write().await;
        let now = Instant::now();
        let before = map.len();
        map.retain(|_, c| !c.is_expired(now));
        before - map.len()
    }

    /// Progress of all jobs that have not finished yet.
    pub async fn get_all(&self) -> HashMap<String, JobProgress> {
        let map = self.inner.read().await;
        map.iter()
            .filter(|(_, c)| c.expires_at.is_none())
            .map(|(id, c)| {
                (
                    id.clone(),
                    JobProgress {
                        processed: c.processed,
                        total: c.total,
                    },
                )
            })
            .collect()
    }

    /// Number of jobs still running.
    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.values().filter(|c| c.expires_at.is_none()).count()
    }

    /// Periodically evict expired counters until `cancel` fires.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = tracker.sweep().await;
                        if removed > 0 {
                            debug!(removed, "Evicted expired progress counters");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
