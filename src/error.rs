//! Error types for the tiny-backspace supervisor.
//!
//! Every fatal failure of a request is one of these variants. The orchestrator
//! maps each to a stable [`ErrorKind`] string and a [`FailureReason`] before it
//! crosses the wire, so clients never see internal process detail.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for request supervision.
#[derive(Error, Debug)]
pub enum Error {
    /// The sandbox could not be created or never became ready.
    #[error("failed to provision sandbox: {0}")]
    Provisioning(String),

    /// The repository could not be cloned into the sandbox.
    #[error("failed to clone repository: {0}")]
    Clone(String),

    /// The agent process crashed or exited with a nonzero code.
    #[error("agent exited with code {exit_code}")]
    AgentExecution {
        exit_code: i32,
        /// Last lines of agent output, already redacted.
        output_tail: Vec<String>,
    },

    /// The agent exited cleanly but left no changes in the working tree.
    #[error("agent finished without making any changes")]
    NoChanges,

    /// A permission-gated operation with no safe fallback was denied.
    #[error("operation '{operation}' was denied")]
    PermissionDenied { operation: String },

    /// A git or pull-request operation failed.
    #[error("git operation failed: {message}")]
    GitOperation { message: String, transient: bool },

    /// The request deadline elapsed.
    #[error("request exceeded its deadline of {} seconds", .0.as_secs())]
    Timeout(Duration),

    /// The client went away; remaining work was skipped.
    #[error("client disconnected")]
    ClientDisconnected,

    /// The sandbox provider failed outside of a more specific phase.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Inbound request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, wire-visible classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ProvisioningError,
    CloneError,
    AgentExecutionError,
    PermissionDeniedError,
    GitOperationError,
    TimeoutError,
    ClientDisconnected,
    SandboxError,
    ConfigurationError,
    InvalidRequest,
    InternalError,
}

impl ErrorKind {
    /// Returns the string sent as `error_type` on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProvisioningError => "ProvisioningError",
            ErrorKind::CloneError => "CloneError",
            ErrorKind::AgentExecutionError => "AgentExecutionError",
            ErrorKind::PermissionDeniedError => "PermissionDeniedError",
            ErrorKind::GitOperationError => "GitOperationError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::ClientDisconnected => "ClientDisconnected",
            ErrorKind::SandboxError => "SandboxError",
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request ended in a failed terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ProvisioningFailed,
    CloneFailed,
    AgentExitNonzero,
    NoChanges,
    PermissionDenied,
    GitFailed,
    DeadlineExceeded,
    ClientDisconnected,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ProvisioningFailed => "provisioning_failed",
            FailureReason::CloneFailed => "clone_failed",
            FailureReason::AgentExitNonzero => "agent_exit_nonzero",
            FailureReason::NoChanges => "no_changes",
            FailureReason::PermissionDenied => "permission_denied",
            FailureReason::GitFailed => "git_failed",
            FailureReason::DeadlineExceeded => "deadline_exceeded",
            FailureReason::ClientDisconnected => "client_disconnected",
            FailureReason::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Returns the wire-visible kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Provisioning(_) => ErrorKind::ProvisioningError,
            Error::Clone(_) => ErrorKind::CloneError,
            Error::AgentExecution { .. } | Error::NoChanges => ErrorKind::AgentExecutionError,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDeniedError,
            Error::GitOperation { .. } => ErrorKind::GitOperationError,
            Error::Timeout(_) => ErrorKind::TimeoutError,
            Error::ClientDisconnected => ErrorKind::ClientDisconnected,
            Error::Sandbox(_) => ErrorKind::SandboxError,
            Error::Config(_) => ErrorKind::ConfigurationError,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::Io(_) | Error::Json(_) => ErrorKind::InternalError,
        }
    }

    /// Returns the failure reason recorded in the terminal state.
    pub fn reason(&self) -> FailureReason {
        match self {
            Error::Provisioning(_) => FailureReason::ProvisioningFailed,
            Error::Clone(_) => FailureReason::CloneFailed,
            Error::AgentExecution { .. } => FailureReason::AgentExitNonzero,
            Error::NoChanges => FailureReason::NoChanges,
            Error::PermissionDenied { .. } => FailureReason::PermissionDenied,
            Error::GitOperation { .. } => FailureReason::GitFailed,
            Error::Timeout(_) => FailureReason::DeadlineExceeded,
            Error::ClientDisconnected => FailureReason::ClientDisconnected,
            Error::Sandbox(_)
            | Error::Config(_)
            | Error::InvalidRequest(_)
            | Error::Io(_)
            | Error::Json(_) => FailureReason::Internal,
        }
    }

    /// Returns true if a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::GitOperation { transient: true, .. })
    }

    /// Human-readable message safe to send to a client.
    ///
    /// Internal variants collapse to a generic message; the rest keep their
    /// already-redacted text.
    pub fn client_message(&self) -> String {
        match self {
            Error::Io(_) | Error::Json(_) => "internal error while processing the request".to_string(),
            Error::AgentExecution { exit_code, .. } => format!(
                "the coding agent exited with code {}; see output_tail for its last lines",
                exit_code
            ),
            Error::NoChanges => "no changes were made by the agent".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_failures_share_kind_but_not_reason() {
        let crashed = Error::AgentExecution {
            exit_code: 2,
            output_tail: vec![],
        };
        let idle = Error::NoChanges;

        assert_eq!(crashed.kind(), ErrorKind::AgentExecutionError);
        assert_eq!(idle.kind(), ErrorKind::AgentExecutionError);
        assert_ne!(crashed.reason(), idle.reason());
        assert_eq!(idle.reason().as_str(), "no_changes");
    }

    #[test]
    fn only_transient_git_errors_are_retryable() {
        let transient = Error::GitOperation {
            message: "Could not resolve host".to_string(),
            transient: true,
        };
        let permanent = Error::GitOperation {
            message: "rejected".to_string(),
            transient: false,
        };

        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
        assert!(!Error::Clone("x".to_string()).is_transient());
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "/var/secret/path exploded",
        ));

        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(!err.client_message().contains("/var/secret"));
    }

    #[test]
    fn timeout_kind_and_message() {
        let err = Error::Timeout(Duration::from_secs(600));
        assert_eq!(err.kind().as_str(), "TimeoutError");
        assert!(err.to_string().contains("600"));
    }
}
