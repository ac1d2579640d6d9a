use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::core::retriever::{ConfigRetriever, RemoteTarget, RetrievalOutput};

/// Runs each command as an SSH exec request through the system `ssh` client.
///
/// Password authentication goes through `sshpass -e`; the password is passed
/// in the child's environment, never on the command line.
pub struct SshCliRetriever {
    connect_timeout: Duration,
}

impl SshCliRetriever {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn command(&self, target: &RemoteTarget, remote_command: &str) -> Command {
        let mut cmd = Command::new("sshpass");
        cmd.arg("-e")
            .arg("ssh")
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .args(["-o", "PubkeyAuthentication=no"])
            .args(["-o", "PreferredAuthentications=password,keyboard-interactive"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-l")
            .arg(&target.credential.username)
            .arg(&target.address)
            .arg(remote_command)
            .env("SSHPASS", &target.credential.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ConfigRetriever for SshCliRetriever {
    async fn execute(&self, target: &RemoteTarget, commands: &[String]) -> Result<RetrievalOutput> {
        let mut output = RetrievalOutput::default();

        for remote_command in commands {
            debug!(
                device = %target.device_name,
                profile = target.profile,
                command = %remote_command,
                "Running remote command"
            );

            let result = self
                .command(target, remote_command)
                .output()
                .await
                .map_err(|e| anyhow!("Failed to spawn ssh: {}", e))?;

            if !result.status.success() {
                let stderr = String::from_utf8_lossy(&result.stderr);
                bail!(
                    "{} on {} exited with {}: {}",
                    remote_command,
                    target.address,
                    describe_exit(result.status.code()),
                    stderr.trim()
                );
            }

            let text = String::from_utf8(result.stdout)
                .with_context(|| format!("{remote_command} returned non UTF-8 output"))?
                .replace("\r\n", "\n");

            output.combined.push_str(remote_command);
            output.combined.push('\n');
            output.combined.push_str(&text);
            output.by_command.insert(remote_command.clone(), text);
        }

        Ok(output)
    }
}

/// sshpass reports authentication problems through its own exit codes.
fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(5) => "invalid password (sshpass 5)".to_string(),
        Some(6) => "host key unknown (sshpass 6)".to_string(),
        Some(255) => "connection error (ssh 255)".to_string(),
        Some(code) => format!("status {code}"),
        None => "signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::SessionCredential;

    fn target() -> RemoteTarget {
        RemoteTarget {
            device_name: "r1".into(),
            address: "192.0.2.1".into(),
            profile: "cisco_ios",
            credential: SessionCredential {
                username: "admin".into(),
                password: "hunter2".into(),
            },
        }
    }

    #[test]
    fn password_is_not_an_argument() {
        let retriever = SshCliRetriever::new(Duration::from_secs(10));
        let cmd = retriever.command(&target(), "show running-config");
        let std_cmd = cmd.as_std();

        let args: Vec<_> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(!args.iter().any(|a| a.contains("hunter2")));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("show running-config"));

        let env: Vec<_> = std_cmd.get_envs().collect();
        assert!(env.iter().any(|(k, _)| *k == "SSHPASS"));
    }

    #[test]
    fn exit_codes_are_described() {
        assert!(describe_exit(Some(5)).contains("password"));
        assert_eq!(describe_exit(Some(1)), "status 1");
    }
}
