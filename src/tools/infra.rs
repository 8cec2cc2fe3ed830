use super::Infrastructure;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Runs configured shell commands for service restarts, health checks and
/// traffic rerouting. A non-zero exit status is a failure; for the health
/// check it only means "not healthy yet".
#[derive(Debug, Clone)]
pub struct CommandInfrastructure {
    restart_command: String,
    health_command: String,
    reroute_command: String,
}

impl CommandInfrastructure {
    pub fn new(
        restart_command: impl Into<String>,
        health_command: impl Into<String>,
        reroute_command: impl Into<String>,
    ) -> Self {
        Self {
            restart_command: restart_command.into(),
            health_command: health_command.into(),
            reroute_command: reroute_command.into(),
        }
    }

    async fn run(&self, command_line: &str) -> Result<std::process::Output> {
        debug!(command = %command_line, "Running infrastructure command");
        Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .output()
            .await
            .with_context(|| format!("failed to start `{}`", command_line))
    }

    async fn run_checked(&self, command_line: &str) -> Result<()> {
        let output = self.run(command_line).await?;
        if !output.status.success() {
            bail!(
                "`{}` exited with {}: {}",
                command_line,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Infrastructure for CommandInfrastructure {
    async fn restart_services(&self) -> Result<()> {
        self.run_checked(&self.restart_command).await
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.run(&self.health_command).await?.status.success())
    }

    async fn reroute_traffic(&self) -> Result<()> {
        self.run_checked(&self.reroute_command).await
    }
}
