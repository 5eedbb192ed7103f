//! Gemini CLI runner.

use super::{AgentInvocation, AgentRunner};

/// Runner for the Gemini CLI.
pub struct GeminiRunner {
    cli_path: String,
}

impl Default for GeminiRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiRunner {
    pub fn new() -> Self {
        Self {
            cli_path: "gemini".to_string(),
        }
    }

    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }
}

impl AgentRunner for GeminiRunner {
    fn name(&self) -> &str {
        "gemini"
    }

    fn program(&self) -> &str {
        &self.cli_path
    }

    fn build_args(&self, invocation: &AgentInvocation) -> Vec<String> {
        // No --yolo: tool calls would need approval, so the agent falls back
        // to announcing actions in text.
        let mut args = vec!["--all-files".to_string()];

        if let Some(model) = &invocation.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("--prompt".to_string());
        args.push(invocation.prompt.clone());

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(model: Option<&str>) -> AgentInvocation {
        AgentInvocation {
            prompt: "Fix the login bug".to_string(),
            repo_dir: "/work/repo".to_string(),
            model: model.map(str::to_string),
        }
    }

    #[test]
    fn gemini_runner_builds_basic_args() {
        let runner = GeminiRunner::new();
        let args = runner.build_args(&invocation(None));

        assert!(!args.contains(&"--yolo".to_string()));
        let idx = args.iter().position(|a| a == "--prompt").unwrap();
        assert_eq!(args[idx + 1], "Fix the login bug");
    }

    #[test]
    fn gemini_runner_includes_model_in_args() {
        let runner = GeminiRunner::new();
        let args = runner.build_args(&invocation(Some("gemini-2.5-pro")));

        let idx = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[idx + 1], "gemini-2.5-pro");
    }

    #[test]
    fn gemini_runner_has_correct_name() {
        assert_eq!(GeminiRunner::default().name(), "gemini");
    }

    #[test]
    fn gemini_runner_with_custom_path() {
        let runner = GeminiRunner::with_cli_path("/custom/gemini");
        assert_eq!(runner.program(), "/custom/gemini");
    }
}
