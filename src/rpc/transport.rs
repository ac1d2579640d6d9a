//! TCP transport layer for the RPC server.
//!
//! Handles TCP connections with newline-delimited JSON framing.
//! Each connection is handled in its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

/// Requests larger than this are rejected without being parsed.
const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Manages the TCP transport layer.
pub struct Transport {
    bind_addr: SocketAddr,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub fn new(bind_addr: SocketAddr, handler: Arc<MethodHandler>) -> Self {
        Self { bind_addr, handler }
    }

    /// Start listening for connections. Runs until shutdown signal is received.
    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener, &mut shutdown).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "RPC server listening");

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Client connected");
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection error");
                                }
                                debug!(peer = %peer_addr, "Client disconnected");
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Parse, validate and dispatch one framed message.
///
/// Returns `None` for notifications, which get no response.
pub async fn process_message(handler: &MethodHandler, message: &str) -> Option<Response> {
    if message.len() > MAX_MESSAGE_BYTES {
        warn!(bytes = message.len(), "Request too large");
        return Some(Response::invalid_request(serde_json::Value::Null));
    }

    let request = match serde_json::from_str::<Request>(message) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Parse error");
            return Some(Response::parse_error());
        }
    };

    if let Err(msg) = request.validate() {
        warn!(error = msg, "Invalid request");
        let id = request.id.clone().unwrap_or(serde_json::Value::Null);
        return Some(Response::invalid_request(id));
    }

    if request.is_notification() {
        debug!(method = %request.method, "Notification received");
        handler.handle(request).await;
        return None;
    }

    debug!(method = %request.method, "Request received");
    Some(handler.handle(request).await)
}

/// Handle a single client connection.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<MethodHandler>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            // EOF - client disconnected
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Some(response) = process_message(&handler, trimmed).await else {
            continue;
        };

        if let Some(error) = &response.error {
            debug!(peer = %peer_addr, code = error.code, "Request failed");
        }

        let mut response_json = serde_json::to_string(&response)?;
        response_json.push('\n');
        writer.write_all(response_json.as_bytes()).await?;
    }

    Ok(())
}
