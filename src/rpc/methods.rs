//! RPC method handlers.
//!
//! Dispatches JSON-RPC method calls to the appropriate handler functions.
//! The same handler serves the TCP transport, the HTTP API and the WebSocket.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

use crate::context::AppContext;
use crate::core::{BackupJob, BackupRequest, Dispatcher, JobProgress, JobStatus};
use crate::db;

use super::protocol::{Request, Response};

/// Reply to `backup.start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStarted {
    pub job_id: String,
    pub status: JobStatus,
    pub total_devices: usize,
}

/// Handles RPC method dispatch and execution.
pub struct MethodHandler {
    ctx: AppContext,
    dispatcher: Dispatcher,
    start_time: Instant,
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            dispatcher: Dispatcher::new(ctx.clone()),
            ctx,
            start_time: Instant::now(),
        }
    }

    /// Handle an RPC request and return a response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "backup.start" => self.backup_start(id, params).await,
            "daemon.status" => self.daemon_status(id).await,
            "jobs.list" => self.jobs_list(id, params).await,
            "jobs.get" => self.jobs_get(id, params).await,
            "progress.active" => self.progress_active(id).await,
            "progress.get" => self.progress_get(id, params).await,
            _ => Response::method_not_found(id, &request.method),
        }
    }

    /// Accept a bulk backup. Returns as soon as the job is recorded; the
    /// batch itself runs in the background.
    async fn backup_start(&self, id: Value, params: Value) -> Response {
        let request: BackupRequest = match serde_json::from_value(params) {
            Ok(r) => r,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match self.dispatcher.submit(BackupJob::from_request(request)).await {
            Ok(record) => Response::success(
                id,
                BackupStarted {
                    job_id: record.id,
                    status: record.status,
                    total_devices: record.total_devices,
                },
            ),
            Err(e) => Response::dispatch_error(id, &e),
        }
    }

    /// Get daemon status/health information.
    async fn daemon_status(&self, id: Value) -> Response {
        let active_jobs = self.ctx.progress.active_count().await;
        let uptime_secs = self.start_time.elapsed().as_secs();

        #[derive(Serialize)]
        struct DaemonStatus {
            version: &'static str,
            uptime_secs: u64,
            active_jobs: usize,
            rpc_bind: String,
            http_bind: String,
            simulation: bool,
            repositories: usize,
        }

        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs,
                active_jobs,
                rpc_bind: self.ctx.config.rpc_bind.to_string(),
                http_bind: self.ctx.config.http_bind.to_string(),
                simulation: self.ctx.config.simulation,
                repositories: self.ctx.config.repositories.len(),
            },
        )
    }

    /// List jobs with optional filtering and pagination.
    async fn jobs_list(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            limit: Option<u32>,
            #[serde(default)]
            offset: Option<u32>,
            #[serde(default)]
            status: Option<String>,
        }

        let params: Params = match params {
            Value::Null => Params::default(),
            params => match serde_json::from_value(params) {
                Ok(p) => p,
                Err(e) => return Response::invalid_params(id, e.to_string()),
            },
        };

        let status = match params.status.as_deref().map(|s| (s, JobStatus::parse(s))) {
            None => None,
            Some((_, Some(status))) => Some(status),
            Some((raw, None)) => {
                return Response::invalid_params(id, format!("Unknown job status: {}", raw));
            }
        };

        let limit = params.limit.unwrap_or(50).min(500);
        let offset = params.offset.unwrap_or(0);

        match db::jobs::list(&self.ctx.db, limit, offset, status).await {
            Ok(jobs) => Response::success(id, jobs),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    /// Get a single job with its full status history.
    async fn jobs_get(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            id: String,
        }

        let params: Params = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match self.ctx.job(&params.id).await {
            Ok(Some(job)) => Response::success(id, job),
            Ok(None) => Response::job_not_found(id, &params.id),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    /// Get all running jobs with their current progress.
    async fn progress_active(&self, id: Value) -> Response {
        let progress = self.ctx.progress.get_all().await;

        #[derive(Serialize)]
        struct ActiveProgress {
            jobs: HashMap<String, JobProgress>,
            count: usize,
        }

        let count = progress.len();
        Response::success(
            id,
            ActiveProgress {
                jobs: progress,
                count,
            },
        )
    }

    /// Get progress for a single job.
    async fn progress_get(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            id: String,
        }

        let params: Params = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match self.ctx.progress(&params.id).await {
            Ok(Some(progress)) => Response::success(id, progress),
            Ok(None) => Response::job_not_found(id, &params.id),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }
}
