//! Coding agent runners.
//!
//! A runner knows how to invoke one agent CLI inside a sandbox. It never
//! spawns anything itself: it builds the [`SandboxCommand`] the sandbox
//! session streams, so the same runner works with every provider.

mod claude;
mod gemini;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use claude::ClaudeRunner;
pub use gemini::GeminiRunner;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::sandbox::{shell_quote, SandboxCommand};

/// Supported agent CLIs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Claude,
    Gemini,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" => Ok(AgentKind::Claude),
            "gemini" | "gemini-cli" => Ok(AgentKind::Gemini),
            other => Err(Error::Config(format!("unknown agent type '{}'", other))),
        }
    }
}

/// One agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    /// The full prompt, protocol instructions included.
    pub prompt: String,
    /// Repository checkout inside the sandbox.
    pub repo_dir: String,
    pub model: Option<String>,
}

/// Builds the command line for one agent CLI.
pub trait AgentRunner: Send + Sync {
    /// Returns the name of this runner.
    fn name(&self) -> &str;

    /// Binary invoked inside the sandbox.
    fn program(&self) -> &str;

    /// Arguments passed to [`program`](Self::program), unquoted.
    fn build_args(&self, invocation: &AgentInvocation) -> Vec<String>;

    /// The shell command that runs the agent in the repository directory.
    fn command(&self, invocation: &AgentInvocation) -> SandboxCommand {
        let mut line = shell_quote(self.program());
        for arg in self.build_args(invocation) {
            line.push(' ');
            line.push_str(&shell_quote(&arg));
        }
        // The agent reads nothing from stdin; closing it stops CLIs that wait.
        line.push_str(" < /dev/null");
        SandboxCommand::new(line).in_dir(invocation.repo_dir.clone())
    }
}

/// Returns the runner configured by `config`.
pub fn runner_for(config: &AgentConfig) -> Arc<dyn AgentRunner> {
    match (config.runner, config.cli_path.as_deref()) {
        (AgentKind::Claude, Some(path)) => Arc::new(ClaudeRunner::with_cli_path(path)),
        (AgentKind::Claude, None) => Arc::new(ClaudeRunner::new()),
        (AgentKind::Gemini, Some(path)) => Arc::new(GeminiRunner::with_cli_path(path)),
        (AgentKind::Gemini, None) => Arc::new(GeminiRunner::new()),
    }
}
