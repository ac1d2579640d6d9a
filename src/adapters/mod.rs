use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::AppConfig;
use crate::context::BackupServices;

pub mod git;
pub mod nautobot;
pub mod simulated;
pub mod ssh;

/// Wire up the collaborators for the configured mode.
pub fn build_services(config: &AppConfig) -> Result<BackupServices> {
    if config.simulation {
        let inventory = Arc::new(simulated::SimulatedInventory::new());
        return Ok(BackupServices {
            resolver: inventory.clone(),
            retriever: Arc::new(
                simulated::SimulatedRetriever::new().with_delay(Duration::from_millis(200)),
            ),
            store: Arc::new(simulated::SimulatedStore::new(config.data_directory.clone())),
            inventory,
        });
    }

    let nautobot = Arc::new(nautobot::NautobotClient::new(&config.inventory)?);
    Ok(BackupServices {
        resolver: nautobot.clone(),
        retriever: Arc::new(ssh::SshCliRetriever::new(Duration::from_secs(
            config.backup.connect_timeout_secs,
        ))),
        store: Arc::new(git::GitCliStore::new(
            config.data_directory.clone(),
            config.git.clone(),
        )),
        inventory: nautobot,
    })
}
