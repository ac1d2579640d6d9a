//! RPC client for connecting to the daemon.
//!
//! Used by the CLI subcommands. One TCP connection per call.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::core::{BackupRequest, JobProgress, JobRunRecord, JobRunWithHistory, JobStatus};

use super::methods::BackupStarted;
use super::protocol::{Request, Response, RpcError};

/// RPC client for communicating with the daemon.
pub struct RpcClient {
    addr: SocketAddr,
}

/// Error returned by RPC client operations.
#[derive(Debug)]
pub enum ClientError {
    /// Failed to connect to daemon
    Connect(std::io::Error),
    /// Failed to send/receive data
    Io(std::io::Error),
    /// Failed to serialize request
    Serialize(serde_json::Error),
    /// Failed to parse response
    Parse(serde_json::Error),
    /// Daemon closed the connection without answering
    NoResponse,
    /// Server returned an error
    Rpc(RpcError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "Failed to connect to daemon: {}", e),
            ClientError::Io(e) => write!(f, "Communication error: {}", e),
            ClientError::Serialize(e) => write!(f, "Failed to serialize request: {}", e),
            ClientError::Parse(e) => write!(f, "Failed to parse response: {}", e),
            ClientError::NoResponse => write!(f, "Daemon closed the connection"),
            ClientError::Rpc(e) => write!(f, "RPC error {}: {}", e.code, e.message),
        }
    }
}

impl std::error::Error for ClientError {}

impl RpcClient {
    /// Create a new client that will connect to the given address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Call an RPC method and return the result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(ClientError::Connect)?;

        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::Number(1.into())),
        };

        let mut request_json = serde_json::to_string(&request).map_err(ClientError::Serialize)?;
        request_json.push('\n');

        stream
            .write_all(request_json.as_bytes())
            .await
            .map_err(ClientError::Io)?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        let read = reader
            .read_line(&mut response_line)
            .await
            .map_err(ClientError::Io)?;
        if read == 0 {
            return Err(ClientError::NoResponse);
        }

        let response: Response =
            serde_json::from_str(&response_line).map_err(ClientError::Parse)?;

        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }

        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(ClientError::Parse)
    }

    pub async fn start_backup(&self, request: &BackupRequest) -> Result<BackupStarted, ClientError> {
        let params = serde_json::to_value(request).map_err(ClientError::Serialize)?;
        self.call("backup.start", Some(params)).await
    }

    pub async fn job(&self, job_id: &str) -> Result<JobRunWithHistory, ClientError> {
        self.call("jobs.get", Some(json!({ "id": job_id }))).await
    }

    pub async fn jobs(
        &self,
        limit: u32,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobRunRecord>, ClientError> {
        let params = json!({ "limit": limit, "status": status.map(|s| s.as_str()) });
        self.call("jobs.list", Some(params)).await
    }

    pub async fn progress(&self, job_id: &str) -> Result<JobProgress, ClientError> {
        self.call("progress.get", Some(json!({ "id": job_id }))).await
    }

    pub async fn status(&self) -> Result<Value, ClientError> {
        self.call("daemon.status", None).await
    }
}
