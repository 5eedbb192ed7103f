//! Claude Code CLI runner.

use super::{AgentInvocation, AgentRunner};

/// Tools Claude may use on its own. Everything that mutates the checkout is
/// announced instead and applied by the supervisor after a permission check.
const READ_ONLY_TOOLS: &str = "Read,Glob,Grep,LS";
const MUTATING_TOOLS: &str = "Write,Edit,MultiEdit,Bash,NotebookEdit";

/// Runner for Claude Code CLI.
pub struct ClaudeRunner {
    /// Path to the claude CLI binary.
    cli_path: String,
}

impl Default for ClaudeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeRunner {
    /// Creates a new Claude runner using the default `claude` command.
    pub fn new() -> Self {
        Self {
            cli_path: "claude".to_string(),
        }
    }

    /// Creates a new Claude runner with a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }
}

impl AgentRunner for ClaudeRunner {
    fn name(&self) -> &str {
        "claude"
    }

    fn program(&self) -> &str {
        &self.cli_path
    }

    fn build_args(&self, invocation: &AgentInvocation) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
            "--allowedTools".to_string(),
            READ_ONLY_TOOLS.to_string(),
            "--disallowedTools".to_string(),
            MUTATING_TOOLS.to_string(),
        ];

        if let Some(model) = &invocation.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(invocation.prompt.clone());

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(model: Option<&str>) -> AgentInvocation {
        AgentInvocation {
            prompt: "Add input validation".to_string(),
            repo_dir: "/work/repo".to_string(),
            model: model.map(str::to_string),
        }
    }

    #[test]
    fn claude_runner_builds_basic_args() {
        let runner = ClaudeRunner::new();
        let args = runner.build_args(&invocation(None));

        assert!(args.contains(&"--print".to_string()));
        assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--model".to_string()));
        assert_eq!(
            &args[args.len() - 2..],
            &["-p".to_string(), "Add input validation".to_string()]
        );
    }

    #[test]
    fn claude_runner_includes_model_in_args() {
        let runner = ClaudeRunner::new();
        let args = runner.build_args(&invocation(Some("claude-sonnet-4")));

        let idx = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[idx + 1], "claude-sonnet-4");
    }

    #[test]
    fn claude_runner_withholds_mutating_tools() {
        let runner = ClaudeRunner::new();
        let args = runner.build_args(&invocation(None));

        let idx = args.iter().position(|a| a == "--disallowedTools").unwrap();
        assert!(args[idx + 1].contains("Write"));
        assert!(args[idx + 1].contains("Bash"));
        let idx = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert!(!args[idx + 1].contains("Edit"));
    }

    #[test]
    fn claude_runner_with_custom_path() {
        let runner = ClaudeRunner::with_cli_path("/usr/local/bin/claude");
        assert_eq!(runner.program(), "/usr/local/bin/claude");
        assert_eq!(runner.name(), "claude");
    }
}
