use async_trait::async_trait;
use ipm_core::{Error, Result};
use tokio::process::Command;
use tracing::debug;

/// Outcome of one firewall command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs a single firewall command.
///
/// Implementations only execute; existence checks and rollback are done by
/// the [`Engine`](crate::Engine). An `Err` means the command could not be
/// run at all; a command that ran and failed is `Ok` with `success == false`.
#[async_trait]
pub trait FirewallExecutor: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<CommandOutput>;
}

/// Executor backed by the `iptables` binary
pub struct Iptables {
    binary: String,
}

impl Iptables {
    pub fn new() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }

    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    /// Check that the binary can be executed
    pub async fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

impl Default for Iptables {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FirewallExecutor for Iptables {
    async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        debug!("{} -w {}", self.binary, args.join(" "));

        // -w waits for the xtables lock instead of failing
        let output = Command::new(&self.binary)
            .arg("-w")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::command(format!("failed to run {}: {}", self.binary, e)))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Split a stored rule line into arguments, keeping double-quoted text together
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pending = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }

    if pending {
        args.push(current);
    }

    args
}
