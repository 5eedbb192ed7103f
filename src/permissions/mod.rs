//! Risk-classified consent for state-mutating operations.
//!
//! Every write, edit, shell command and git operation passes through a
//! [`PermissionGate`] before its effect is applied. The gate consults a
//! persisted [`DecisionStore`], a per-request session cache and a
//! [`ConsentProvider`], fails closed when consent is unavailable, and appends
//! one [`AuditRecord`] per evaluation.

mod audit;
mod consent;
mod gate;
mod risk;
mod store;

use serde::{Deserialize, Serialize};

pub use audit::{AuditDecision, AuditLog, AuditRecord};
pub use consent::{
    ConsentChoice, ConsentProvider, ConsentRequest, ConsentUnavailable, NonInteractiveConsent,
    TerminalConsent,
};
pub use gate::PermissionGate;
pub(crate) use risk::is_contained;
pub use risk::{git_operation, has_shell_syntax, RiskClassifier};
pub use store::{
    forget, preapprove, sorted_decisions, DecisionStore, FileDecisionStore, MemoryDecisionStore,
    StoredDecision,
};

/// An intended operation, finer-grained than the tool that announced it.
///
/// The string key names the operation in events and audit records. Stored
/// decisions are keyed by origin as well, see [`decision_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum OperationKind {
    FileRead,
    ListDirectory,
    FileWrite,
    FileEdit,
    BashExec,
    GitRead,
    GitLocal,
    GitBranchCreate,
    GitCommit,
    GitPush,
    GitForcePush,
    PullRequestCreate,
    Unknown(String),
}

impl OperationKind {
    /// Stable key used for caching and audit.
    pub fn key(&self) -> String {
        let key = match self {
            OperationKind::FileRead => "file_read",
            OperationKind::ListDirectory => "list_directory",
            OperationKind::FileWrite => "file_write",
            OperationKind::FileEdit => "file_edit",
            OperationKind::BashExec => "bash_exec",
            OperationKind::GitRead => "git_read",
            OperationKind::GitLocal => "git_local",
            OperationKind::GitBranchCreate => "git_branch_create",
            OperationKind::GitCommit => "git_commit",
            OperationKind::GitPush => "git_push",
            OperationKind::GitForcePush => "git_force_push",
            OperationKind::PullRequestCreate => "pull_request_create",
            OperationKind::Unknown(name) => return format!("unknown:{}", name),
        };
        key.to_string()
    }

    /// Parses a key. Anything unrecognised becomes [`OperationKind::Unknown`].
    pub fn from_key(key: &str) -> Self {
        match key {
            "file_read" => OperationKind::FileRead,
            "list_directory" => OperationKind::ListDirectory,
            "file_write" => OperationKind::FileWrite,
            "file_edit" => OperationKind::FileEdit,
            "bash_exec" => OperationKind::BashExec,
            "git_read" => OperationKind::GitRead,
            "git_local" => OperationKind::GitLocal,
            "git_branch_create" => OperationKind::GitBranchCreate,
            "git_commit" => OperationKind::GitCommit,
            "git_push" => OperationKind::GitPush,
            "git_force_push" => OperationKind::GitForcePush,
            "pull_request_create" => OperationKind::PullRequestCreate,
            other => {
                OperationKind::Unknown(other.strip_prefix("unknown:").unwrap_or(other).to_string())
            }
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        kind.key()
    }
}

impl From<String> for OperationKind {
    fn from(key: String) -> Self {
        OperationKind::from_key(&key)
    }
}

/// How dangerous an operation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a decision holds. `Deny` is the only refusing scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Once,
    Session,
    Always,
    Deny,
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Persisted Always-allow or Always-deny.
    Cache,
    /// Allowed earlier in the same request.
    Session,
    /// Low risk, approved without asking.
    AutoLow,
    /// Answered by the consent provider.
    Consent,
    /// Consent was unavailable.
    FailClosed,
    /// The request was cancelled before or during the prompt.
    Cancelled,
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub origin: Origin,
    pub operation_kind: OperationKind,
    pub risk_tier: RiskTier,
    pub scope: Scope,
    pub source: DecisionSource,
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        self.scope != Scope::Deny
    }
}

/// Who asked for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Announced by the agent in its output.
    Agent,
    /// Issued by the supervisor's own pipeline (branch, commit, push, PR).
    Pipeline,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Agent => "agent",
            Origin::Pipeline => "pipeline",
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store and session cache key for `kind` requested by `origin`.
///
/// A pipeline push and an agent-announced push are separate decisions.
pub fn decision_key(origin: Origin, kind: &OperationKind) -> String {
    format!("{}:{}", origin, kind.key())
}

/// Parses a configured decision key. Keys without an `agent:` or
/// `pipeline:` prefix name pipeline operations.
pub fn parse_decision_key(key: &str) -> (Origin, OperationKind) {
    let key = key.trim();
    if let Some(rest) = key.strip_prefix("agent:") {
        (Origin::Agent, OperationKind::from_key(rest))
    } else if let Some(rest) = key.strip_prefix("pipeline:") {
        (Origin::Pipeline, OperationKind::from_key(rest))
    } else {
        (Origin::Pipeline, OperationKind::from_key(key))
    }
}

/// What happens when an operation is denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyPolicy {
    /// Skip the effect and keep going.
    Skip,
    /// Fail the request.
    Fatal,
}

impl DenyPolicy {
    /// Agent operations are skippable; pipeline operations have no fallback.
    pub fn for_origin(origin: Origin) -> Self {
        match origin {
            Origin::Agent => DenyPolicy::Skip,
            Origin::Pipeline => DenyPolicy::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, DenyPolicy::Fatal)
    }
}
