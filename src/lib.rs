//! tiny-backspace - streaming supervisor for sandboxed coding agents
//!
//! A request names a GitHub repository and a prompt. The supervisor clones the
//! repository into a fresh sandbox, runs a coding agent against it, gates and
//! applies the changes the agent announces, then commits, pushes and opens a
//! pull request. Every step is streamed to the caller as it happens.

pub mod backoff;
pub mod config;
pub mod effects;
pub mod emitter;
pub mod error;
pub mod events;
pub mod git;
pub mod monitor;
pub mod orchestrator;
pub mod parser;
pub mod permissions;
pub mod pr;
pub mod prompt;
pub mod runner;
pub mod sandbox;
pub mod secrets;
pub mod server;
pub mod telemetry;
pub mod testing;

pub use backoff::{retry_transient, ExponentialBackoff, RetryPolicy};
pub use config::{ServiceConfig, Validate, ValidationResult};
pub use error::{Error, ErrorKind, FailureReason, Result};
pub use events::{EventPayload, EventSink, Stage, StreamEvent};
pub use git::{ChangeSet, FileChange, RepoRef};
pub use orchestrator::{
    spawn, CodeRequest, OrchestratorDeps, OrchestratorState, Request, RequestHandle,
    RequestOrchestrator, RequestOutcome,
};
pub use parser::{AgentEvent, AgentOutputParser, ToolKind, ToolUse};
pub use permissions::{
    ConsentChoice, ConsentProvider, DecisionStore, OperationKind, PermissionDecision,
    PermissionGate, RiskClassifier, RiskTier,
};
pub use pr::{GhCliHost, GitHost, PullRequest, PullRequestDraft};
pub use runner::{AgentKind, AgentRunner, ClaudeRunner, GeminiRunner};
pub use sandbox::{LocalSandboxProvider, SandboxProvider, SandboxSession};
pub use secrets::{Redactor, SecretSource};
