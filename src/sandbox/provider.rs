//! Sandbox provider trait and types.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Lifecycle status of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Provisioning,
    Ready,
    Busy,
    Destroying,
    Destroyed,
}

impl SandboxStatus {
    /// Returns true once the sandbox can no longer run commands.
    pub fn is_gone(&self) -> bool {
        matches!(self, SandboxStatus::Destroying | SandboxStatus::Destroyed)
    }
}

/// An isolated environment owned by exactly one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::config::duration_secs")]
    pub ttl: Duration,
    /// Directory inside the sandbox where work happens.
    pub workdir: String,
}

/// What to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Image to boot, if the provider supports images.
    pub image: Option<String>,
    #[serde(with = "crate::config::duration_secs")]
    pub ttl: Duration,
    /// Free-form labels (the request id, the repository).
    pub labels: HashMap<String, String>,
}

/// A shell command to run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxCommand {
    /// Interpreted by `sh -c`.
    pub command: String,
    /// Working directory; the sandbox workdir when unset.
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
    /// Written to the command's stdin, which is then closed.
    pub stdin: Option<String>,
}

impl SandboxCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn in_dir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// A chunk of command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOutput {
    Stdout(String),
    Stderr(String),
}

impl SandboxOutput {
    pub fn text(&self) -> &str {
        match self {
            SandboxOutput::Stdout(text) | SandboxOutput::Stderr(text) => text,
        }
    }
}

/// Creates, runs commands in, and destroys sandboxes.
///
/// `create` and `destroy` may fail independently of `run`. Dropping a `run`
/// future must stop the command.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Returns the name of this provider.
    fn name(&self) -> &str;

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;

    async fn status(&self, handle: &SandboxHandle) -> Result<SandboxStatus>;

    /// Runs a command, streaming its output, and returns its exit code.
    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &SandboxCommand,
        output: mpsc::Sender<SandboxOutput>,
    ) -> Result<i32>;

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_builder_sets_fields() {
        let cmd = SandboxCommand::new("git status")
            .in_dir("/work/repo")
            .with_env("GIT_TERMINAL_PROMPT", "0")
            .with_stdin("body");

        assert_eq!(cmd.command, "git status");
        assert_eq!(cmd.workdir.as_deref(), Some("/work/repo"));
        assert_eq!(cmd.env, vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]);
        assert_eq!(cmd.stdin.as_deref(), Some("body"));
    }

    #[test]
    fn status_serializes_to_lowercase() {
        assert_eq!(
            serde_json::to_string(&SandboxStatus::Destroying).unwrap(),
            "\"destroying\""
        );
        assert!(SandboxStatus::Destroyed.is_gone());
        assert!(!SandboxStatus::Busy.is_gone());
    }
}
