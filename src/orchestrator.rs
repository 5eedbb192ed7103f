//! Request orchestration.
//!
//! One [`RequestOrchestrator`] owns one request end to end: it provisions a
//! sandbox, clones the repository, runs the agent while gating and applying
//! its announced actions, commits, pushes, opens a pull request and always
//! tears the sandbox down. Its event stream ends with exactly one terminal
//! event.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::retry_transient;
use crate::config::{LimitsConfig, ServiceConfig};
use crate::effects::{apply_with_grace, EffectOutcome, SandboxToolExecutor, ToolExecutor};
use crate::error::{Error, FailureReason, Result};
use crate::events::{self, EventPayload, EventSink, Stage, StreamEvent, ToolReport};
use crate::git::{self, commit_message, commit_type, git_failure, ChangeSet, RepoRef};
use crate::monitor::{ActivityTracker, OutputTail};
use crate::parser::{AgentEvent, AgentOutputParser, ToolKind, ToolUse};
use crate::permissions::{
    preapprove, AuditLog, ConsentProvider, DecisionSource, DecisionStore, DenyPolicy,
    FileDecisionStore, MemoryDecisionStore, OperationKind, Origin, PermissionGate,
    RiskClassifier,
};
use crate::pr::{pr_body, pr_title, remote_url_expr, GhCliHost, GitHost, PullRequest, PullRequestDraft, TOKEN_ENV};
use crate::prompt::build_agent_prompt;
use crate::runner::{runner_for, AgentInvocation, AgentRunner};
use crate::sandbox::{
    shell_quote, CommandOutput, DestroyOutcome, LocalSandboxProvider, SandboxCommand,
    SandboxOutput, SandboxProvider, SandboxSession, SandboxSpec,
};
use crate::secrets::Redactor;

/// Largest command output echoed in a tool event.
const MAX_REPORTED_OUTPUT: usize = 8 * 1024;

/// Inbound body of `POST /api/code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRequest {
    pub repo_url: String,
    pub prompt: String,
}

impl CodeRequest {
    /// Checks the repository URL and prompt; returns the parsed repository
    /// and the trimmed prompt.
    pub fn validate(&self, max_prompt_chars: usize) -> Result<(RepoRef, String)> {
        let repo = RepoRef::parse(&self.repo_url)?;
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(Error::InvalidRequest("prompt must not be empty".to_string()));
        }
        let chars = prompt.chars().count();
        if chars > max_prompt_chars {
            return Err(Error::InvalidRequest(format!(
                "prompt is {} characters, the limit is {}",
                chars, max_prompt_chars
            )));
        }
        Ok((repo, prompt.to_string()))
    }
}

/// A validated request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: String,
    pub repo_url: String,
    pub repo: RepoRef,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    /// Wall-clock budget measured from the start of the run.
    pub deadline: Duration,
}

impl Request {
    pub fn new(body: &CodeRequest, limits: &LimitsConfig) -> Result<Self> {
        let (repo, prompt) = body.validate(limits.max_prompt_chars)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            repo_url: body.repo_url.trim().to_string(),
            repo,
            prompt,
            created_at: Utc::now(),
            deadline: limits.request_deadline,
        })
    }

    /// The work branch this request pushes.
    pub fn branch_name(&self) -> String {
        git::branch_name(&self.id, &self.prompt)
    }
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrchestratorState {
    Created,
    Provisioning,
    Cloning,
    AgentRunning,
    Committing,
    PrCreating,
    Completed,
    Failed(FailureReason),
    TimedOut,
}

impl OrchestratorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorState::Completed | OrchestratorState::Failed(_) | OrchestratorState::TimedOut
        )
    }

    /// Returns true if moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &OrchestratorState) -> bool {
        use OrchestratorState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed(_))
                | (_, TimedOut)
                | (Created, Provisioning)
                | (Provisioning, Cloning)
                | (Cloning, AgentRunning)
                | (AgentRunning, Committing)
                | (Committing, PrCreating)
                | (PrCreating, Completed)
        )
    }

    /// Stage reported in `progress` events on entering this state.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            OrchestratorState::Provisioning => Some(Stage::Provisioning),
            OrchestratorState::Cloning => Some(Stage::Cloning),
            OrchestratorState::AgentRunning => Some(Stage::AgentRunning),
            OrchestratorState::Committing => Some(Stage::Committing),
            OrchestratorState::PrCreating => Some(Stage::PrCreating),
            _ => None,
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Created => f.write_str("created"),
            OrchestratorState::Provisioning => f.write_str("provisioning"),
            OrchestratorState::Cloning => f.write_str("cloning"),
            OrchestratorState::AgentRunning => f.write_str("agent_running"),
            OrchestratorState::Committing => f.write_str("committing"),
            OrchestratorState::PrCreating => f.write_str("pr_creating"),
            OrchestratorState::Completed => f.write_str("completed"),
            OrchestratorState::Failed(reason) => write!(f, "failed({})", reason),
            OrchestratorState::TimedOut => f.write_str("timed_out"),
        }
    }
}

/// Collaborators shared by every request.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub config: Arc<ServiceConfig>,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub runner: Arc<dyn AgentRunner>,
    pub executor: Arc<dyn ToolExecutor>,
    pub git_host: Arc<dyn GitHost>,
    pub store: Arc<dyn DecisionStore>,
    pub consent: Arc<dyn ConsentProvider>,
    pub audit: Arc<AuditLog>,
    pub classifier: Arc<RiskClassifier>,
    /// Resolved GitHub token, if any.
    pub github_token: Option<String>,
}

impl OrchestratorDeps {
    /// Builds the production collaborators described by `config`.
    pub async fn from_config(
        config: ServiceConfig,
        consent: Arc<dyn ConsentProvider>,
    ) -> Result<Self> {
        let github_token = match &config.github.token {
            Some(source) => Some(
                source
                    .resolve()
                    .map_err(|e| Error::Config(format!("GitHub token: {}", e)))?,
            ),
            None => None,
        };

        let store: Arc<dyn DecisionStore> = match &config.permissions.store_path {
            Some(path) => Arc::new(FileDecisionStore::open(path.clone()).await?),
            None => Arc::new(MemoryDecisionStore::new()),
        };
        preapprove(store.as_ref(), &config.permissions.preapproved).await?;

        let audit = match &config.permissions.audit_path {
            Some(path) => AuditLog::with_file(path).await?,
            None => AuditLog::new(),
        };

        let classifier = RiskClassifier::new(&config.permissions.edit_allow_list)?;
        let base_dir = config
            .sandbox
            .base_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        Ok(Self {
            sandbox: Arc::new(LocalSandboxProvider::new(base_dir)),
            runner: runner_for(&config.agent),
            executor: Arc::new(SandboxToolExecutor::new()),
            git_host: Arc::new(GhCliHost::new(github_token.clone())),
            store,
            consent,
            audit: Arc::new(audit),
            classifier: Arc::new(classifier),
            github_token,
            config: Arc::new(config),
        })
    }

    /// Redactor covering every secret these collaborators know.
    pub fn redactor(&self) -> Redactor {
        let mut redactor = Redactor::new();
        if let Some(token) = &self.github_token {
            redactor.add("GITHUB_TOKEN", token.clone());
        }
        if let Some(key) = &self.config.server.api_key {
            redactor.add("API_KEY", key.clone());
        }
        redactor
    }
}

/// How a request ended.
#[derive(Debug)]
pub struct RequestOutcome {
    pub request_id: String,
    pub state: OrchestratorState,
    pub pr_url: Option<String>,
    pub events_emitted: u64,
    pub destroy: DestroyOutcome,
}

/// A running request.
pub struct RequestHandle {
    pub request_id: String,
    pub events: mpsc::Receiver<StreamEvent>,
    /// Cancelling this abandons the request (client disconnect).
    pub cancel: CancellationToken,
    pub task: JoinHandle<RequestOutcome>,
}

/// Starts `request` on its own task.
pub fn spawn(request: Request, deps: OrchestratorDeps) -> RequestHandle {
    let cancel = CancellationToken::new();
    let (sink, events) = events::channel(
        request.id.clone(),
        deps.config.limits.event_buffer,
        cancel.clone(),
        deps.redactor(),
    );
    let request_id = request.id.clone();
    let orchestrator = RequestOrchestrator::new(request, deps, sink, cancel.clone());
    let task = tokio::spawn(orchestrator.run());

    RequestHandle {
        request_id,
        events,
        cancel,
        task,
    }
}

struct Completion {
    pull_request: PullRequest,
    files_changed: usize,
}

/// State machine for one request.
pub struct RequestOrchestrator {
    request: Request,
    deps: OrchestratorDeps,
    session: SandboxSession,
    sink: EventSink,
    gate: PermissionGate,
    cancel: CancellationToken,
    state: OrchestratorState,
    tracker: ActivityTracker,
    tail: OutputTail,
    branch: String,
    workdir: String,
    repo_dir: String,
    base_sha: Option<String>,
}

impl RequestOrchestrator {
    pub fn new(
        request: Request,
        deps: OrchestratorDeps,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        let gate = PermissionGate::new(
            request.id.clone(),
            deps.store.clone(),
            deps.consent.clone(),
            deps.audit.clone(),
        );
        Self {
            session: SandboxSession::new(deps.sandbox.clone())
                .with_destroy_timeout(deps.config.sandbox.destroy_timeout),
            tail: OutputTail::new(deps.config.limits.output_tail_lines),
            branch: request.branch_name(),
            request,
            deps,
            sink,
            gate,
            cancel,
            state: OrchestratorState::Created,
            tracker: ActivityTracker::new(),
            workdir: String::new(),
            repo_dir: String::new(),
            base_sha: None,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Drives the request to a terminal state. Never fails: every error ends
    /// up in the terminal `error` event.
    pub async fn run(mut self) -> RequestOutcome {
        let deadline = self.request.deadline;
        tracing::info!(
            request_id = %self.request.id,
            repo = %self.request.repo,
            branch = %self.branch,
            deadline_secs = deadline.as_secs(),
            "request started"
        );

        let result = tokio::select! {
            result = self.drive() => result,
            _ = tokio::time::sleep(deadline) => Err(Error::Timeout(deadline)),
        };
        // Whatever failed first, a gone client is the reason.
        let result = match result {
            Err(err) if self.cancel.is_cancelled() && !matches!(err, Error::ClientDisconnected) => {
                tracing::debug!(request_id = %self.request.id, error = %err, "error after disconnect");
                Err(Error::ClientDisconnected)
            }
            other => other,
        };

        let _ = self
            .sink
            .progress(Stage::CleaningUp, "Destroying sandbox")
            .await;

        let mut pr_url = None;
        let terminal = match result {
            Ok(done) => {
                self.transition(OrchestratorState::Completed);
                pr_url = Some(done.pull_request.url.clone());
                EventPayload::Complete {
                    pr_url: done.pull_request.url,
                    files_changed: done.files_changed,
                    branch_name: self.branch.clone(),
                    elapsed_secs: self.tracker.elapsed().as_secs_f64(),
                }
            }
            Err(err) => {
                let next = match err {
                    Error::Timeout(_) => OrchestratorState::TimedOut,
                    _ => OrchestratorState::Failed(err.reason()),
                };
                self.transition(next);
                tracing::warn!(
                    request_id = %self.request.id,
                    error_type = err.kind().as_str(),
                    reason = err.reason().as_str(),
                    error = %self.sink.redactor().redact(&err.to_string()),
                    "request failed"
                );
                EventPayload::failure(&err)
            }
        };

        if let Err(e) = self.sink.emit(terminal).await {
            tracing::debug!(request_id = %self.request.id, error = %e, "terminal event not delivered");
        }

        // Dropping the sink closes the client's stream; teardown happens after.
        let events_emitted = self.sink.emitted();
        drop(self.sink);
        let destroy = self.session.destroy().await;

        tracing::info!(
            request_id = %self.request.id,
            state = %self.state,
            events = events_emitted,
            destroy = ?destroy,
            "request finished"
        );

        RequestOutcome {
            request_id: self.request.id.clone(),
            state: self.state,
            pr_url,
            events_emitted,
            destroy,
        }
    }

    async fn drive(&mut self) -> Result<Completion> {
        self.sink
            .emit(EventPayload::Start {
                message: format!("Starting work on {}", self.request.repo),
                repo_url: self.request.repo_url.clone(),
                branch_name: self.branch.clone(),
            })
            .await?;

        self.provision().await?;
        let has_gitignore = self.clone_repository().await?;
        self.run_agent(has_gitignore).await?;
        let changes = self.collect_changes().await?;
        self.commit_changes(&changes).await?;
        let pull_request = self.publish(&changes).await?;

        Ok(Completion {
            pull_request,
            files_changed: changes.len(),
        })
    }

    fn transition(&mut self, next: OrchestratorState) {
        if !self.state.can_transition_to(&next) {
            tracing::error!(
                request_id = %self.request.id,
                from = %self.state,
                to = %next,
                "illegal state transition"
            );
            return;
        }
        tracing::info!(
            request_id = %self.request.id,
            from = %self.state,
            to = %next,
            "state transition"
        );
        self.state = next;
    }

    async fn enter(&mut self, next: OrchestratorState, message: String) -> Result<()> {
        self.transition(next);
        match next.stage() {
            Some(stage) => self.sink.progress(stage, message).await,
            None => Ok(()),
        }
    }

    async fn provision(&mut self) -> Result<()> {
        self.enter(OrchestratorState::Provisioning, "Creating sandbox".to_string())
            .await?;

        let config = &self.deps.config.sandbox;
        let spec = SandboxSpec {
            image: config.image.clone(),
            ttl: config.ttl,
            labels: HashMap::from([
                ("request_id".to_string(), self.request.id.clone()),
                ("repository".to_string(), self.request.repo.full_name()),
            ]),
        };

        let handle = self
            .session
            .provision(
                &spec,
                config.ready_poll_interval,
                config.provision_timeout,
                &self.cancel,
            )
            .await?;

        let sandbox_id = handle.id.clone();
        self.workdir = handle.workdir.clone();
        self.repo_dir = format!("{}/repo", self.workdir);
        tracing::info!(
            request_id = %self.request.id,
            sandbox_id = %sandbox_id,
            provider = self.session.provider_name(),
            "sandbox ready"
        );
        Ok(())
    }

    /// Clones, configures identity and creates the work branch. Returns
    /// whether the repository has a `.gitignore`.
    async fn clone_repository(&mut self) -> Result<bool> {
        self.enter(
            OrchestratorState::Cloning,
            format!("Cloning {}", self.request.repo),
        )
        .await?;

        let authenticated = self.deps.github_token.is_some();
        let mut clone = SandboxCommand::new(format!(
            "git clone {} repo",
            remote_url_expr(&self.request.repo, authenticated)
        ))
        .in_dir(self.workdir.clone());
        if let Some(token) = &self.deps.github_token {
            clone = clone.with_env(TOKEN_ENV, token.clone());
        }

        let output = self.session.exec(&clone, &self.cancel).await?;
        if !output.success() {
            return Err(Error::Clone(
                self.sink.redactor().redact(output.output.trim()),
            ));
        }

        if authenticated {
            // The clone URL carried the token; keep it out of .git/config.
            self.git(&format!(
                "remote set-url origin {}",
                shell_quote(&self.request.repo.https_url())
            ))
            .await?;
        }

        let github = &self.deps.config.github;
        let (username, email) = (github.username.clone(), github.email.clone());
        self.git(&format!("config user.name {}", shell_quote(&username)))
            .await?;
        self.git(&format!("config user.email {}", shell_quote(&email)))
            .await?;

        self.pipeline_gate(
            OperationKind::GitBranchCreate,
            format!("Create branch {}", self.branch),
        )
        .await?;
        self.git(&format!("checkout -b {}", shell_quote(&self.branch)))
            .await?;

        let head = self
            .session
            .exec(&self.repo_command("git rev-parse HEAD"), &self.cancel)
            .await?;
        // An empty repository has no HEAD yet.
        self.base_sha = head
            .success()
            .then(|| head.output.trim().to_string())
            .filter(|sha| !sha.is_empty());

        let gitignore = self
            .session
            .exec(&self.repo_command("test -f .gitignore"), &self.cancel)
            .await?;
        Ok(gitignore.success())
    }

    async fn run_agent(&mut self, has_gitignore: bool) -> Result<()> {
        self.enter(
            OrchestratorState::AgentRunning,
            format!("Running {} agent", self.deps.runner.name()),
        )
        .await?;

        let invocation = AgentInvocation {
            prompt: build_agent_prompt(
                &self.request.prompt,
                &self.request.repo.full_name(),
                has_gitignore,
            ),
            repo_dir: self.repo_dir.clone(),
            model: self.deps.config.agent.model.clone(),
        };
        let command = self.deps.runner.command(&invocation);

        let capacity = self.deps.config.limits.event_buffer.max(1);
        let (tx, rx) = mpsc::channel::<SandboxOutput>(capacity);
        let mut agent = AgentLoop {
            sink: &mut self.sink,
            gate: &mut self.gate,
            tracker: &mut self.tracker,
            tail: &mut self.tail,
            session: &self.session,
            executor: self.deps.executor.as_ref(),
            classifier: self.deps.classifier.as_ref(),
            cancel: &self.cancel,
            repo_dir: &self.repo_dir,
            grace: self.deps.config.limits.effect_grace,
        };

        // The agent process stops on a child token. A disconnect stops it at
        // once, while the effect being applied still gets its grace period.
        let agent_cancel = self.cancel.child_token();
        let consume = async {
            let result = agent.consume(rx).await;
            if result.is_err() {
                agent_cancel.cancel();
            }
            result
        };
        let (exit_code, consumed) = tokio::join!(
            self.session.stream(&command, tx, &agent_cancel),
            consume
        );
        consumed?;
        let exit_code = exit_code?;

        tracing::info!(request_id = %self.request.id, exit_code, "agent finished");
        if exit_code != 0 {
            return Err(Error::AgentExecution {
                exit_code,
                output_tail: self.sink.redactor().redact_lines(&self.tail.lines()),
            });
        }
        Ok(())
    }

    /// Stages everything the agent changed. An empty change set fails the
    /// request while still in `AgentRunning`.
    async fn collect_changes(&mut self) -> Result<ChangeSet> {
        // Fold any commits the agent made back into the index.
        if let Some(base) = self.base_sha.clone() {
            self.git(&format!("reset --soft {}", shell_quote(&base)))
                .await?;
        }
        self.git("add -A").await?;
        let status = self.git("status --porcelain").await?;
        let numstat = self.git("diff --cached --numstat").await?;

        let changes = ChangeSet::parse(&status.output, &numstat.output);
        if changes.is_empty() {
            return Err(Error::NoChanges);
        }
        Ok(changes)
    }

    async fn commit_changes(&mut self, changes: &ChangeSet) -> Result<()> {
        self.enter(
            OrchestratorState::Committing,
            format!("Committing {} changed files", changes.len()),
        )
        .await?;

        self.sink
            .emit(EventPayload::ChangeSummary {
                files_changed: changes.len(),
                additions: changes.additions(),
                deletions: changes.deletions(),
                files: changes.files.clone(),
            })
            .await?;

        self.pipeline_gate(
            OperationKind::GitCommit,
            format!("Commit {} changed files", changes.len()),
        )
        .await?;

        let kind = commit_type(&self.request.prompt, changes);
        let message = commit_message(kind, &self.request.prompt, changes);
        let output = self
            .session
            .exec(
                &self.repo_command("git commit -q -F -").with_stdin(message),
                &self.cancel,
            )
            .await?;
        if !output.success() {
            return Err(git_failure("git commit", output.exit_code, &output.output));
        }

        tracing::info!(
            request_id = %self.request.id,
            files = changes.len(),
            additions = changes.additions(),
            deletions = changes.deletions(),
            commit_type = kind.as_str(),
            "changes committed"
        );
        Ok(())
    }

    async fn publish(&mut self, changes: &ChangeSet) -> Result<PullRequest> {
        self.pipeline_gate(
            OperationKind::GitPush,
            format!("Push branch {} to {}", self.branch, self.request.repo),
        )
        .await?;
        self.sink
            .progress(Stage::Pushing, format!("Pushing {}", self.branch))
            .await?;

        let policy = self.deps.config.retry;
        let mut retries = 0;
        {
            let host = self.deps.git_host.as_ref();
            let session = &self.session;
            let repo_dir = self.repo_dir.as_str();
            let repo = &self.request.repo;
            let branch = self.branch.as_str();
            let cancel = &self.cancel;
            retry_transient(
                &policy,
                cancel,
                |attempt, _| retries = attempt,
                move || host.push(session, repo_dir, repo, branch, cancel),
            )
            .await?;
        }
        if retries > 0 {
            self.sink
                .progress(
                    Stage::Pushing,
                    format!("Push succeeded after {} retries", retries),
                )
                .await?;
        }

        self.enter(
            OrchestratorState::PrCreating,
            "Opening pull request".to_string(),
        )
        .await?;
        self.pipeline_gate(
            OperationKind::PullRequestCreate,
            format!("Open a pull request on {}", self.request.repo),
        )
        .await?;

        let draft = PullRequestDraft {
            title: pr_title(&self.request.prompt, changes),
            body: pr_body(
                &self.request.prompt,
                changes,
                &self.tracker.summary(),
                &self.branch,
                &self.request.id,
            ),
            head_branch: self.branch.clone(),
            base_branch: self.deps.config.github.base_branch.clone(),
        };

        let pull_request = {
            let host = self.deps.git_host.as_ref();
            let session = &self.session;
            let repo_dir = self.repo_dir.as_str();
            let repo = &self.request.repo;
            let draft = &draft;
            let cancel = &self.cancel;
            retry_transient(
                &policy,
                cancel,
                |_, _| {},
                move || host.open_pull_request(session, repo_dir, repo, draft, cancel),
            )
            .await?
        };

        tracing::info!(
            request_id = %self.request.id,
            pr_url = %pull_request.url,
            "pull request opened"
        );
        self.sink
            .emit(EventPayload::PrCreated {
                pr_url: pull_request.url.clone(),
                number: pull_request.number,
                title: pull_request.title.clone(),
            })
            .await?;
        Ok(pull_request)
    }

    /// Gates an operation the pipeline itself performs. Denial is fatal.
    async fn pipeline_gate(&mut self, kind: OperationKind, description: String) -> Result<()> {
        let tier = self.deps.classifier.classify(&kind, "");
        let decision = self
            .gate
            .evaluate(Origin::Pipeline, &kind, tier, &description, &self.cancel)
            .await;

        if decision.is_allowed() {
            return Ok(());
        }
        if decision.source == DecisionSource::Cancelled {
            return Err(Error::ClientDisconnected);
        }

        self.sink
            .emit(EventPayload::PermissionDenied {
                operation: kind.key(),
                risk_tier: tier,
                target: description,
                fatal: DenyPolicy::for_origin(Origin::Pipeline).is_fatal(),
            })
            .await?;
        Err(Error::PermissionDenied {
            operation: kind.key(),
        })
    }

    fn repo_command(&self, command: &str) -> SandboxCommand {
        SandboxCommand::new(command).in_dir(self.repo_dir.clone())
    }

    /// Runs `git <args>` in the checkout; a nonzero exit is an error.
    async fn git(&self, args: &str) -> Result<CommandOutput> {
        let output = self
            .session
            .exec(&self.repo_command(&format!("git {}", args)), &self.cancel)
            .await?;
        if !output.success() {
            let subcommand = args.split_whitespace().next().unwrap_or_default();
            return Err(git_failure(
                &format!("git {}", subcommand),
                output.exit_code,
                &output.output,
            ));
        }
        Ok(output)
    }
}

/// Consumes agent output while the agent runs.
struct AgentLoop<'a> {
    sink: &'a mut EventSink,
    gate: &'a mut PermissionGate,
    tracker: &'a mut ActivityTracker,
    tail: &'a mut OutputTail,
    session: &'a SandboxSession,
    executor: &'a dyn ToolExecutor,
    classifier: &'a RiskClassifier,
    cancel: &'a CancellationToken,
    repo_dir: &'a str,
    grace: Duration,
}

impl AgentLoop<'_> {
    async fn consume(&mut self, mut output: mpsc::Receiver<SandboxOutput>) -> Result<()> {
        let mut parser = AgentOutputParser::new();

        while let Some(chunk) = output.recv().await {
            let lines = self.tail.push_chunk(chunk.text());
            self.tracker.record_output(lines);

            // stderr feeds the failure tail only.
            if let SandboxOutput::Stdout(text) = &chunk {
                for event in parser.push(text) {
                    self.handle(event).await?;
                }
            }
        }

        for event in parser.finish() {
            self.handle(event).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, event: AgentEvent) -> Result<()> {
        // Nothing the agent announced is acted on once the client is gone.
        if self.cancel.is_cancelled() {
            return Err(Error::ClientDisconnected);
        }
        match event {
            AgentEvent::Message { text } => {
                self.sink
                    .emit(EventPayload::AiMessage {
                        message: text,
                        thinking: false,
                    })
                    .await
            }
            AgentEvent::Thinking { text } => {
                self.sink
                    .emit(EventPayload::AiMessage {
                        message: text,
                        thinking: true,
                    })
                    .await
            }
            AgentEvent::Error { text } => {
                self.sink
                    .emit(EventPayload::AgentError { message: text })
                    .await
            }
            AgentEvent::ToolUse(tool) => self.handle_tool(tool).await,
        }
    }

    async fn handle_tool(&mut self, tool: ToolUse) -> Result<()> {
        if !tool.kind.is_mutating() {
            self.tracker.record_tool(&tool);
            return self
                .sink
                .emit(EventPayload::tool(tool.kind, report(&tool, None)))
                .await;
        }

        let operation = RiskClassifier::operation_for(&tool);
        let tier = self.classifier.classify(&operation, &tool.target);
        let decision = self
            .gate
            .evaluate(Origin::Agent, &operation, tier, &describe(&tool), self.cancel)
            .await;

        if !decision.is_allowed() {
            if decision.source == DecisionSource::Cancelled {
                return Err(Error::ClientDisconnected);
            }
            self.tracker.record_denied();
            return self
                .sink
                .emit(EventPayload::PermissionDenied {
                    operation: operation.key(),
                    risk_tier: tier,
                    target: tool.target.clone(),
                    fatal: DenyPolicy::for_origin(Origin::Agent).is_fatal(),
                })
                .await;
        }

        let outcome = match apply_with_grace(
            self.executor,
            self.session,
            self.repo_dir,
            &tool,
            self.cancel,
            self.grace,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(Error::ClientDisconnected) => return Err(Error::ClientDisconnected),
            Err(err) => {
                tracing::warn!(tool = %tool.kind, target = %tool.target, error = %err, "effect failed");
                EffectOutcome {
                    applied: false,
                    exit_code: None,
                    output: err.to_string(),
                }
            }
        };

        if outcome.applied || outcome.exit_code.is_some() {
            self.tracker.record_tool(&tool);
        }
        self.sink
            .emit(EventPayload::tool(tool.kind, report(&tool, Some(outcome))))
            .await
    }
}

fn describe(tool: &ToolUse) -> String {
    match tool.kind {
        ToolKind::Read => format!("Read {}", tool.target),
        ToolKind::Write => format!("Write file {}", tool.target),
        ToolKind::Edit => format!("Edit file {}", tool.target),
        ToolKind::Bash => format!("Run command: {}", tool.target),
        ToolKind::Git => format!("Run git {}", tool.target),
    }
}

fn report(tool: &ToolUse, outcome: Option<EffectOutcome>) -> ToolReport {
    let (applied, exit_code, output) = match outcome {
        Some(outcome) => (
            Some(outcome.applied),
            outcome.exit_code,
            Some(truncate_tail(&outcome.output, MAX_REPORTED_OUTPUT)),
        ),
        None => (None, None, None),
    };
    ToolReport {
        target: tool.target.clone(),
        detail: truncate_tail(&tool.detail, MAX_REPORTED_OUTPUT),
        language: tool.language.clone(),
        applied,
        exit_code,
        output,
    }
}

/// Keeps the last `max` bytes of `text`, on a character boundary.
fn truncate_tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated]\n{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(repo_url: &str, prompt: &str) -> CodeRequest {
        CodeRequest {
            repo_url: repo_url.to_string(),
            prompt: prompt.to_string(),
        }
    }

    #[test]
    fn validation_accepts_github_urls_and_trims_prompt() {
        let (repo, prompt) = body("https://github.com/octo/widgets", "  Add a README  ")
            .validate(1000)
            .unwrap();
        assert_eq!(repo.full_name(), "octo/widgets");
        assert_eq!(prompt, "Add a README");
    }

    #[test]
    fn validation_rejects_bad_input() {
        let cases = [
            body("https://example.com/octo/widgets", "Add a README"),
            body("https://github.com/octo/widgets", "   "),
            body("https://github.com/octo/widgets", &"x".repeat(1001)),
        ];
        for case in cases {
            assert!(matches!(case.validate(1000), Err(Error::InvalidRequest(_))));
        }
        assert!(body("https://github.com/octo/widgets", &"é".repeat(1000))
            .validate(1000)
            .is_ok());
    }

    #[test]
    fn request_gets_uuid_and_deadline() {
        let limits = LimitsConfig::default();
        let request = Request::new(&body("git@github.com:octo/widgets.git", "Fix bug"), &limits)
            .unwrap();

        assert_eq!(request.id.len(), 36);
        assert_eq!(request.deadline, limits.request_deadline);
        assert!(request.branch_name().starts_with("tb/"));
        assert!(request.branch_name().ends_with("-fix-bug"));
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use OrchestratorState::*;
        let path = [
            Created,
            Provisioning,
            Cloning,
            AgentRunning,
            Committing,
            PrCreating,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn failure_is_reachable_from_every_live_state() {
        use OrchestratorState::*;
        for state in [Created, Provisioning, Cloning, AgentRunning, Committing, PrCreating] {
            assert!(state.can_transition_to(&TimedOut));
            assert!(state.can_transition_to(&Failed(FailureReason::Internal)));
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use OrchestratorState::*;
        assert!(!Created.can_transition_to(&AgentRunning));
        assert!(!Committing.can_transition_to(&Cloning));
        assert!(!Completed.can_transition_to(&Failed(FailureReason::Internal)));
        assert!(!TimedOut.can_transition_to(&Provisioning));
        assert!(!Failed(FailureReason::NoChanges).can_transition_to(&TimedOut));
    }

    #[test]
    fn stages_follow_states() {
        assert_eq!(OrchestratorState::Cloning.stage(), Some(Stage::Cloning));
        assert_eq!(OrchestratorState::Completed.stage(), None);
        assert_eq!(
            OrchestratorState::Failed(FailureReason::GitFailed).to_string(),
            "failed(git_failed)"
        );
    }

    #[test]
    fn truncate_tail_keeps_the_end() {
        assert_eq!(truncate_tail("short", 10), "short");
        assert_eq!(truncate_tail("abcdefghij", 4), "[truncated]\nghij");
        assert_eq!(truncate_tail("ééé", 3), "[truncated]\né");
    }
}
