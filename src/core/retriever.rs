use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use super::models::SessionCredential;

/// Connection parameters for one remote session.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub device_name: String,
    pub address: String,
    /// Connection profile key, see `core::platform`.
    pub profile: &'static str,
    pub credential: SessionCredential,
}

/// Raw output of a retrieval session.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutput {
    /// Output keyed by the exact command that produced it, when available.
    pub by_command: HashMap<String, String>,
    /// All output concatenated in command order.
    pub combined: String,
}

/// Opens a session on a device and runs read-only commands.
#[async_trait]
pub trait ConfigRetriever: Send + Sync {
    async fn execute(&self, target: &RemoteTarget, commands: &[String]) -> Result<RetrievalOutput>;
}

/// Split retrieval output into running and startup configuration text.
///
/// Uses the per-command association first. If neither config came back that
/// way, the combined output is split on the startup command's text: everything
/// before it is the running config, the chunk after it the startup config.
pub fn partition_output(
    output: &RetrievalOutput,
    running_command: &str,
    startup_command: Option<&str>,
) -> (String, String) {
    let lookup = |cmd: &str| {
        output
            .by_command
            .get(cmd)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    let mut running = lookup(running_command);
    let mut startup = startup_command.map(lookup).unwrap_or_default();

    if running.is_empty() && startup.is_empty() {
        match startup_command {
            Some(marker) if output.combined.contains(marker) => {
                let mut parts = output.combined.split(marker);
                running = parts.next().unwrap_or_default().trim().to_string();
                startup = parts.next().unwrap_or_default().trim().to_string();
            }
            _ => running = output.combined.trim().to_string(),
        }
    }

    (running, startup)
}
