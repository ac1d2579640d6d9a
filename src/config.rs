use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/netbk/config.toml";
const ENV_PREFIX: &str = "NETBK_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Parent directory of repository working copies.
    pub data_directory: PathBuf,
    pub database_path: PathBuf,
    pub rpc_bind: SocketAddr,
    pub http_bind: SocketAddr,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub backup: BackupSettings,
    pub inventory: InventoryConfig,
    pub git: GitConfig,
    pub repositories: Vec<RepositoryConfig>,
    pub credentials: Vec<Credential>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("/var/lib/netbk/repositories"),
            database_path: PathBuf::from("/var/lib/netbk/netbk.db"),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7878)),
            http_bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            simulation: false,
            verbose: false,
            json_logs: false,
            backup: BackupSettings::default(),
            inventory: InventoryConfig::default(),
            git: GitConfig::default(),
            repositories: Vec::new(),
            credentials: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the TOML file, then `NETBK_*`
    /// environment variables, then any explicitly given CLI overrides.
    pub fn new<T: Serialize>(config_path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    pub fn repository(&self, id: i64) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.id == id)
    }

    pub fn credential(&self, id: i64) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.id == id)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

/// Settings for the per-device retrieval and the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub running_command: String,
    /// `None` disables startup-config retrieval.
    pub startup_command: Option<String>,
    /// Hard limit for one remote session (connect and all commands).
    pub session_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub running_path_template: Option<String>,
    pub startup_path_template: Option<String>,
    /// How long a finished job's progress counter stays readable.
    pub progress_retention_secs: u64,
    pub max_parallelism: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            running_command: "show running-config".to_string(),
            startup_command: Some("show startup-config".to_string()),
            session_timeout_secs: 60,
            connect_timeout_secs: 30,
            running_path_template: None,
            startup_path_template: None,
            progress_retention_secs: 3600,
            max_parallelism: 50,
        }
    }
}

impl BackupSettings {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn progress_retention(&self) -> Duration {
        Duration::from_secs(self.progress_retention_secs)
    }

    /// Commands sent to every device, running config first.
    pub fn commands(&self) -> Vec<String> {
        let mut commands = vec![self.running_command.clone()];
        commands.extend(self.startup_command.clone());
        commands
    }
}

/// Nautobot connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub url: String,
    pub token: Option<String>,
    pub verify_tls: bool,
    pub timeout_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            token: None,
            verify_tls: true,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub author_name: String,
    pub author_email: String,
    pub default_branch: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: "netbk".to_string(),
            author_email: "netbk@localhost".to_string(),
            default_branch: "main".to_string(),
        }
    }
}

/// A configuration repository that jobs can back up into.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Working copy location; defaults to `<data_directory>/<name>`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl RepositoryConfig {
    pub fn branch_or(&self, default: &str) -> String {
        self.branch
            .clone()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| default.to_string())
    }
}

impl fmt::Debug for RepositoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("branch", &self.branch)
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "********"))
            .field("path", &self.path)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    /// Interactive shell login (username/password), usable for devices.
    #[default]
    Ssh,
    Token,
    Generic,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub kind: CredentialKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        simulation: Option<bool>,
    }

    #[test]
    fn loads_file_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
data_directory = "/srv/netbk"

[backup]
session_timeout_secs = 5
startup_command = "show configuration | display set"

[[repositories]]
id = 1
name = "configs"
url = "https://git.example.com/net/configs.git"

[[credentials]]
id = 7
name = "lab"
username = "admin"
password = "secret"
"#,
        )
        .unwrap();

        let config = AppConfig::new(
            Some(&path),
            Some(&Overrides {
                simulation: Some(true),
            }),
        )
        .unwrap();

        assert_eq!(config.data_directory, PathBuf::from("/srv/netbk"));
        assert!(config.simulation);
        assert_eq!(config.backup.session_timeout(), Duration::from_secs(5));
        assert_eq!(config.backup.running_command, "show running-config");
        assert_eq!(
            config.backup.commands(),
            vec![
                "show running-config".to_string(),
                "show configuration | display set".to_string()
            ]
        );
        assert_eq!(config.repository(1).unwrap().branch_or("main"), "main");
        assert_eq!(config.credential(7).unwrap().kind, CredentialKind::Ssh);
        assert!(config.credential(8).is_none());
    }

    #[test]
    fn default_toml_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, AppConfig::default().to_toml().unwrap()).unwrap();

        let config = AppConfig::new(Some(&path), None::<&Overrides>).unwrap();
        assert_eq!(config.rpc_bind, AppConfig::default().rpc_bind);
        assert_eq!(config.backup.max_parallelism, 50);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config =
            AppConfig::new(Some(Path::new("/nonexistent/netbk.toml")), None::<&Overrides>).unwrap();
        assert_eq!(config.backup.max_parallelism, 50);
        assert!(!config.simulation);
    }

    #[test]
    fn secrets_are_not_debug_printed() {
        let cred = Credential {
            id: 1,
            name: "lab".into(),
            kind: CredentialKind::Ssh,
            username: Some("admin".into()),
            password: Some("hunter2".into()),
        };
        assert!(!format!("{:?}", cred).contains("hunter2"));
    }
}
