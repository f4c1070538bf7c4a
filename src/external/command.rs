//! Base command execution abstraction.
//!
//! Every external collaborator (sync primitive, workflow engine, ticket
//! backend, deletion hook) is configured as a shell template and executed
//! through this seam, enabling dependency injection for testing.

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

#[derive(Debug, Error, Clone)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },
    #[error("io error while running `{command}`: {message}")]
    Io { command: String, message: String },
}

/// Runs a configured command template with extra environment bindings.
///
/// Templates run through `sh -c`, so `$upstream_path`-style placeholders are
/// resolved by the shell from the bindings supplied per invocation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_template(
        &self,
        template: &str,
        envs: &[(String, String)],
    ) -> Result<CommandOutput, CommandError>;
}

/// Production implementation backed by `tokio::process`.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run_template(
        &self,
        template: &str,
        envs: &[(String, String)],
    ) -> Result<CommandOutput, CommandError> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(template);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CommandError::Spawn {
                    command: template.to_string(),
                    message: e.to_string(),
                }
            } else {
                CommandError::Io {
                    command: template.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Helper for building the env binding list without repeating `to_string`.
pub fn env_bindings(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
