//! Scripted collaborators for tests.
//!
//! These stand in for the sandbox provider, the git host and the consent
//! prompt so a whole request can run in-process with observable side effects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::git::RepoRef;
use crate::permissions::{ConsentChoice, ConsentProvider, ConsentRequest, ConsentUnavailable};
use crate::pr::{GitHost, PullRequest, PullRequestDraft};
use crate::sandbox::{
    SandboxCommand, SandboxHandle, SandboxOutput, SandboxProvider, SandboxSession, SandboxSpec,
    SandboxStatus,
};

/// What a scripted command does.
#[derive(Debug, Clone, Default)]
pub struct CommandScript {
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit_code: i32,
    delay: Duration,
    chunk_delay: Duration,
    hang: bool,
    fail: bool,
}

impl CommandScript {
    /// Prints `chunks` on stdout and exits 0.
    pub fn output<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stdout: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Never finishes.
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    /// The provider itself errors.
    pub fn fail() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn stderr<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stderr = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// Waits before producing anything.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Waits before each stdout chunk.
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Prints its output, then never finishes.
    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// In-memory [`SandboxProvider`] whose commands follow [`CommandScript`]s.
///
/// The first rule whose pattern is a substring of the command wins; other
/// commands succeed silently.
pub struct ScriptedSandboxProvider {
    ready_after: Option<usize>,
    fail_create: bool,
    fail_destroy: bool,
    hang_destroy: bool,
    rules: Vec<(String, CommandScript)>,
    creates: AtomicUsize,
    status_calls: AtomicUsize,
    destroys: AtomicUsize,
    commands: Arc<Mutex<Vec<SandboxCommand>>>,
}

impl Default for ScriptedSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSandboxProvider {
    pub fn new() -> Self {
        Self {
            ready_after: Some(1),
            fail_create: false,
            fail_destroy: false,
            hang_destroy: false,
            rules: Vec::new(),
            creates: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reports Ready from the `n`th status call on.
    pub fn with_ready_after(mut self, n: usize) -> Self {
        self.ready_after = Some(n.max(1));
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.ready_after = None;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    /// `destroy` never returns.
    pub fn hanging_destroy(mut self) -> Self {
        self.hang_destroy = true;
        self
    }

    pub fn on(mut self, pattern: impl Into<String>, script: CommandScript) -> Self {
        self.rules.push((pattern.into(), script));
        self
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Shared log of every command run, in order.
    pub fn command_log(&self) -> Arc<Mutex<Vec<SandboxCommand>>> {
        self.commands.clone()
    }

    /// Command lines run so far.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|log| log.iter().map(|c| c.command.clone()).collect())
            .unwrap_or_default()
    }

    fn script_for(&self, command: &str) -> Option<&CommandScript> {
        self.rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, script)| script)
    }
}

#[async_trait]
impl SandboxProvider for ScriptedSandboxProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_create {
            return Err(Error::Provisioning("scripted create failure".to_string()));
        }
        let id = format!("scripted-{}", n);
        Ok(SandboxHandle {
            workdir: format!("/sandbox/{}", id),
            id,
            status: SandboxStatus::Provisioning,
            created_at: Utc::now(),
            ttl: spec.ttl,
        })
    }

    async fn status(&self, _handle: &SandboxHandle) -> Result<SandboxStatus> {
        let n = self.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.ready_after {
            Some(ready) if n >= ready => Ok(SandboxStatus::Ready),
            _ => Ok(SandboxStatus::Provisioning),
        }
    }

    async fn run(
        &self,
        _handle: &SandboxHandle,
        command: &SandboxCommand,
        output: mpsc::Sender<SandboxOutput>,
    ) -> Result<i32> {
        if let Ok(mut log) = self.commands.lock() {
            log.push(command.clone());
        }

        let Some(script) = self.script_for(&command.command) else {
            return Ok(0);
        };
        if script.fail {
            return Err(Error::Sandbox("scripted command failure".to_string()));
        }
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        for chunk in &script.stdout {
            if !script.chunk_delay.is_zero() {
                tokio::time::sleep(script.chunk_delay).await;
            }
            let _ = output.send(SandboxOutput::Stdout(chunk.clone())).await;
        }
        for chunk in &script.stderr {
            let _ = output.send(SandboxOutput::Stderr(chunk.clone())).await;
        }
        if script.hang {
            std::future::pending::<()>().await;
        }
        Ok(script.exit_code)
    }

    async fn destroy(&self, _handle: &SandboxHandle) -> Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if self.hang_destroy {
            std::future::pending::<()>().await;
        }
        if self.fail_destroy {
            return Err(Error::Sandbox("scripted destroy failure".to_string()));
        }
        Ok(())
    }
}

/// [`GitHost`] that records calls and fails on demand.
pub struct RecordingGitHost {
    pr_url: String,
    push_failures: Mutex<VecDeque<Error>>,
    pr_failures: Mutex<VecDeque<Error>>,
    pushes: Mutex<Vec<String>>,
    drafts: Mutex<Vec<PullRequestDraft>>,
}

impl Default for RecordingGitHost {
    fn default() -> Self {
        Self::new("https://github.com/octo/widgets/pull/1")
    }
}

impl RecordingGitHost {
    pub fn new(pr_url: impl Into<String>) -> Self {
        Self {
            pr_url: pr_url.into(),
            push_failures: Mutex::new(VecDeque::new()),
            pr_failures: Mutex::new(VecDeque::new()),
            pushes: Mutex::new(Vec::new()),
            drafts: Mutex::new(Vec::new()),
        }
    }

    /// The next `n` pushes fail with a transient error.
    pub fn with_transient_push_failures(self, n: usize) -> Self {
        self.queue_push_failures(n, true)
    }

    /// The next `n` pushes fail with a permanent error.
    pub fn with_permanent_push_failures(self, n: usize) -> Self {
        self.queue_push_failures(n, false)
    }

    fn queue_push_failures(self, n: usize, transient: bool) -> Self {
        if let Ok(mut failures) = self.push_failures.lock() {
            for _ in 0..n {
                failures.push_back(Error::GitOperation {
                    message: "scripted push failure".to_string(),
                    transient,
                });
            }
        }
        self
    }

    /// The next `n` pull request attempts fail with a transient error.
    pub fn with_transient_pr_failures(self, n: usize) -> Self {
        if let Ok(mut failures) = self.pr_failures.lock() {
            for _ in 0..n {
                failures.push_back(Error::GitOperation {
                    message: "scripted pull request failure".to_string(),
                    transient: true,
                });
            }
        }
        self
    }

    /// Branches push was called with, including failed attempts.
    pub fn pushes(&self) -> Vec<String> {
        self.pushes.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Drafts pull requests were requested with, including failed attempts.
    pub fn drafts(&self) -> Vec<PullRequestDraft> {
        self.drafts.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GitHost for RecordingGitHost {
    fn name(&self) -> &str {
        "recording"
    }

    async fn push(
        &self,
        _session: &SandboxSession,
        _repo_dir: &str,
        _repo: &RepoRef,
        branch: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        if let Ok(mut pushes) = self.pushes.lock() {
            pushes.push(branch.to_string());
        }
        match self.push_failures.lock().ok().and_then(|mut f| f.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn open_pull_request(
        &self,
        _session: &SandboxSession,
        _repo_dir: &str,
        _repo: &RepoRef,
        draft: &PullRequestDraft,
        _cancel: &CancellationToken,
    ) -> Result<PullRequest> {
        if let Ok(mut drafts) = self.drafts.lock() {
            drafts.push(draft.clone());
        }
        if let Some(err) = self.pr_failures.lock().ok().and_then(|mut f| f.pop_front()) {
            return Err(err);
        }
        Ok(PullRequest {
            number: self
                .pr_url
                .rsplit('/')
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            url: self.pr_url.clone(),
            title: draft.title.clone(),
            base_branch: draft.base_branch.clone(),
            head_branch: draft.head_branch.clone(),
        })
    }
}

/// [`ConsentProvider`] that answers from a script.
pub struct ScriptedConsent {
    answers: Mutex<VecDeque<ConsentChoice>>,
    hang: bool,
    prompts: AtomicUsize,
    requests: Mutex<Vec<ConsentRequest>>,
}

impl ScriptedConsent {
    /// Answers in order; once exhausted, consent is unavailable.
    pub fn new(answers: Vec<ConsentChoice>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            hang: false,
            prompts: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every prompt fails.
    pub fn unavailable() -> Self {
        Self::new(Vec::new())
    }

    /// Prompts never return.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new(Vec::new())
        }
    }

    /// Number of prompts shown.
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ConsentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ConsentProvider for ScriptedConsent {
    async fn request(
        &self,
        request: &ConsentRequest,
    ) -> std::result::Result<ConsentChoice, ConsentUnavailable> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.pop_front())
            .ok_or_else(|| ConsentUnavailable("no scripted answer".to_string()))
    }
}
