//! Service configuration and validation.
//!
//! Configuration is read from an optional TOML or YAML file, overlaid with
//! environment variables, then validated before the service starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::error::{Error, Result};
use crate::permissions::{parse_decision_key, OperationKind, Origin};
use crate::runner::AgentKind;
use crate::secrets::SecretSource;

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing with a configuration error if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Top-level configuration for the supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub agent: AgentConfig,
    pub github: GitHubConfig,
    pub limits: LimitsConfig,
    pub permissions: PermissionsConfig,
    pub retry: RetryPolicy,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When set, `POST /api/code` requires a matching `X-API-Key` header.
    pub require_auth: bool,
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            require_auth: false,
            api_key: None,
        }
    }
}

/// Sandbox provisioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image requested from the provider. The local provider ignores it.
    pub image: Option<String>,
    /// Lifetime requested for each sandbox.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// How often `status` is polled while waiting for readiness.
    #[serde(with = "duration_ms")]
    pub ready_poll_interval: Duration,
    /// Upper bound on waiting for readiness.
    #[serde(with = "duration_secs")]
    pub provision_timeout: Duration,
    /// Upper bound on tearing a sandbox down. Cleanup runs after the terminal
    /// event, so this only bounds how long the request task lingers.
    #[serde(with = "duration_ms")]
    pub destroy_timeout: Duration,
    /// Parent directory for local sandboxes (system temp dir when unset).
    pub base_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: None,
            ttl: Duration::from_secs(900),
            ready_poll_interval: Duration::from_millis(250),
            provision_timeout: Duration::from_secs(120),
            destroy_timeout: Duration::from_secs(30),
            base_dir: None,
        }
    }
}

/// Which coding agent runs inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub runner: AgentKind,
    pub model: Option<String>,
    /// Overrides the binary name used inside the sandbox.
    pub cli_path: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            runner: AgentKind::Claude,
            model: None,
            cli_path: None,
        }
    }
}

/// Credentials and identity used for clone, push and pull requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub token: Option<SecretSource>,
    pub username: String,
    pub email: String,
    /// Branch pull requests are opened against.
    pub base_branch: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            username: "tiny-backspace".to_string(),
            email: "tiny-backspace@users.noreply.github.com".to_string(),
            base_branch: "main".to_string(),
        }
    }
}

/// Per-request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Wall-clock budget for a whole request.
    #[serde(with = "duration_secs")]
    pub request_deadline: Duration,
    pub max_prompt_chars: usize,
    /// How long an in-flight effect may finish after the client leaves.
    #[serde(with = "duration_ms")]
    pub effect_grace: Duration,
    /// Capacity of the per-request event channel.
    pub event_buffer: usize,
    /// Agent output lines kept for failure reports.
    pub output_tail_lines: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_deadline: Duration::from_secs(600),
            max_prompt_chars: 1000,
            effect_grace: Duration::from_secs(5),
            event_buffer: 64,
            output_tail_lines: 20,
        }
    }
}

/// Permission gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// JSON file backing Always decisions. In-memory when unset.
    pub store_path: Option<PathBuf>,
    /// JSON-lines audit file. In-memory only when unset.
    pub audit_path: Option<PathBuf>,
    /// Glob patterns (repo-relative) where writes and edits are low risk.
    pub edit_allow_list: Vec<String>,
    /// Decision keys seeded as Always-allow at startup. Bare operation keys
    /// cover the pipeline's own branch, commit, push and pull request; use an
    /// `agent:` prefix to preapprove agent-announced operations.
    pub preapproved: Vec<String>,
    /// Prompt on the terminal for consent (CLI only).
    pub interactive: bool,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            audit_path: None,
            edit_allow_list: vec!["**/*".to_string()],
            preapproved: vec![
                "git_branch_create".to_string(),
                "git_commit".to_string(),
                "git_push".to_string(),
                "pull_request_create".to_string(),
            ],
            interactive: false,
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from `path` (if any) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Parses a TOML or YAML file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("invalid YAML config: {}", e))),
            _ => Err(Error::Config(format!(
                "unsupported config format for {} (expected .toml, .yaml or .yml)",
                path.display()
            ))),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML config: {}", e)))
    }

    /// Overlays values from the environment, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("API_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("API_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| Error::Config(format!("API_PORT is not a valid port: {}", port)))?;
        }
        if let Some(flag) = lookup("REQUIRE_AUTH") {
            self.server.require_auth = parse_bool("REQUIRE_AUTH", &flag)?;
        }
        if let Some(key) = lookup("API_KEY").filter(|k| !k.is_empty()) {
            self.server.api_key = Some(key);
        }
        if let Some(agent) = lookup("AGENT_TYPE") {
            self.agent.runner = agent.parse()?;
        }
        if lookup("GITHUB_TOKEN").is_some_and(|t| !t.is_empty()) {
            self.github.token = Some(SecretSource::EnvVar("GITHUB_TOKEN".to_string()));
        }
        if let Some(username) = lookup("GITHUB_USERNAME").filter(|u| !u.is_empty()) {
            self.github.username = username;
        }
        if let Some(email) = lookup("GITHUB_EMAIL").filter(|e| !e.is_empty()) {
            self.github.email = email;
        }
        if let Some(secs) = lookup("MAX_SANDBOX_DURATION") {
            let secs: u64 = secs.parse().map_err(|_| {
                Error::Config(format!("MAX_SANDBOX_DURATION is not a number: {}", secs))
            })?;
            self.limits.request_deadline = Duration::from_secs(secs);
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Config(format!("{} is not a boolean: {}", name, other))),
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.require_auth && self.api_key.as_deref().unwrap_or("").is_empty() {
            result.add_error("require_auth is set but no api_key is configured");
        }

        if self.port == 0 {
            result.add_warning("port 0 binds an ephemeral port");
        }

        result
    }
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.ready_poll_interval.is_zero() {
            result.add_error("ready_poll_interval must be greater than zero");
        }

        if self.provision_timeout.is_zero() {
            result.add_error("provision_timeout must be greater than zero");
        }

        if self.destroy_timeout.is_zero() {
            result.add_error("destroy_timeout must be greater than zero");
        }

        if self.ready_poll_interval > self.provision_timeout {
            result.add_warning("ready_poll_interval is longer than provision_timeout");
        }

        result
    }
}

impl Validate for LimitsConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.request_deadline.is_zero() {
            result.add_error("request_deadline must be greater than zero");
        }

        if self.max_prompt_chars == 0 {
            result.add_error("max_prompt_chars must be at least 1");
        }

        if self.event_buffer == 0 {
            result.add_error("event_buffer must be at least 1");
        }

        if self.request_deadline > Duration::from_secs(7200) {
            result.add_warning("request_deadline over 2 hours may indicate a misconfiguration");
        }

        result
    }
}

impl Validate for PermissionsConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        for pattern in &self.edit_allow_list {
            if let Err(e) = glob::Pattern::new(pattern) {
                result.add_error(format!("invalid edit_allow_list pattern '{}': {}", pattern, e));
            }
        }

        for key in &self.preapproved {
            let (origin, kind) = parse_decision_key(key);
            let risky = matches!(
                kind,
                OperationKind::BashExec | OperationKind::GitPush | OperationKind::GitForcePush
            );
            if matches!(kind, OperationKind::Unknown(_)) {
                result.add_warning(format!("unknown operation '{}' in preapproved", key));
            } else if origin == Origin::Agent && risky {
                result.add_warning(format!(
                    "preapproving '{}' lets the agent run it without consent",
                    key
                ));
            }
        }

        result
    }
}

impl Validate for GitHubConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.token.is_none() {
            result.add_warning("no GitHub token configured; push and pull request creation will rely on sandbox credentials");
        }

        if self.base_branch.trim().is_empty() {
            result.add_error("base_branch cannot be empty");
        }

        result
    }
}

impl Validate for ServiceConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.server.validate());
        result.merge(self.sandbox.validate());
        result.merge(self.limits.validate());
        result.merge(self.permissions.validate());
        result.merge(self.github.validate());

        if self.retry.max_retries > 5 {
            result.add_warning("retry.max_retries > 5 may hold a request for a long time");
        }

        result
    }
}

/// Serde helper for durations written as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Serde helper for durations written as milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
