//! RPC server for client communication.
//!
//! Provides a JSON-RPC 2.0 interface over TCP for starting backups and
//! querying job records, live progress and daemon information.
//!
//! ## Architecture
//!
//! - `protocol`: JSON-RPC 2.0 request/response types
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: Method dispatcher and handlers
//! - `client`: Client for connecting to the daemon
//!
//! ## Methods
//!
//! - `backup.start`: accept a bulk backup, returns the job id immediately
//! - `jobs.get`, `jobs.list`: persisted job records and history
//! - `progress.get`, `progress.active`: live processed/total counters
//! - `daemon.status`

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::{BackupStarted, MethodHandler};
pub use protocol::{
    INVALID_PARAMS, JOB_NOT_FOUND, METHOD_NOT_FOUND, Request, Response, RpcError,
    STORE_UNAVAILABLE, VALIDATION_FAILED,
};
pub use transport::process_message;

/// RPC server that exposes daemon functionality to clients.
pub struct RpcServer {
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    /// Create a new RPC server bound to the given address.
    pub fn new(handler: Arc<MethodHandler>, bind_addr: SocketAddr) -> Self {
        let transport = Transport::new(bind_addr, handler);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            transport,
            shutdown_tx,
        }
    }

    /// Start the RPC server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.transport.listen(shutdown_rx).await
    }

    /// Serve on a listener the caller already bound (port 0 in tests).
    pub async fn start_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.transport.serve(listener, &mut shutdown_rx).await
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
