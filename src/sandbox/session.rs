//! One request's view of its sandbox.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::provider::{
    SandboxCommand, SandboxHandle, SandboxOutput, SandboxProvider, SandboxSpec, SandboxStatus,
};
use crate::error::{Error, Result};

const DEFAULT_DESTROY_TIMEOUT: Duration = Duration::from_secs(30);

/// Collected output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Stdout and stderr interleaved in arrival order.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Result of [`SandboxSession::destroy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    /// The provider failed; the failure was logged.
    Failed(String),
    /// Nothing was ever created.
    NoHandle,
    /// Destroy was already attempted.
    AlreadyAttempted,
}

/// Wraps a provider for a single sandbox.
///
/// Every wait races the request's cancellation token. Destroy is attempted
/// at most once.
pub struct SandboxSession {
    provider: Arc<dyn SandboxProvider>,
    handle: Option<SandboxHandle>,
    running: AtomicUsize,
    destroy_attempted: bool,
    destroy_timeout: Duration,
}

impl SandboxSession {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            provider,
            handle: None,
            running: AtomicUsize::new(0),
            destroy_attempted: false,
            destroy_timeout: DEFAULT_DESTROY_TIMEOUT,
        }
    }

    /// Bounds how long [`SandboxSession::destroy`] waits on the provider.
    pub fn with_destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = timeout;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn handle(&self) -> Option<&SandboxHandle> {
        self.handle.as_ref()
    }

    pub fn destroy_attempted(&self) -> bool {
        self.destroy_attempted
    }

    /// Current status, `Busy` while any command runs.
    pub fn status(&self) -> Option<SandboxStatus> {
        self.handle.as_ref().map(|h| {
            if h.status == SandboxStatus::Ready && self.running.load(Ordering::SeqCst) > 0 {
                SandboxStatus::Busy
            } else {
                h.status
            }
        })
    }

    /// Creates the sandbox and waits until it reports ready.
    ///
    /// The handle is kept as soon as `create` returns, so a readiness failure
    /// still leaves something for [`SandboxSession::destroy`] to clean up.
    pub async fn provision(
        &mut self,
        spec: &SandboxSpec,
        poll_interval: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<&SandboxHandle> {
        if self.handle.is_some() {
            return Err(Error::Sandbox("sandbox already provisioned".to_string()));
        }

        let created = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::ClientDisconnected),
            created = self.provider.create(spec) => created,
        };
        let mut handle = created.map_err(|e| match e {
            Error::Provisioning(msg) => Error::Provisioning(msg),
            other => Error::Provisioning(other.to_string()),
        })?;
        handle.status = SandboxStatus::Provisioning;

        tracing::info!(
            sandbox_id = %handle.id,
            provider = %self.provider.name(),
            "sandbox created, waiting for readiness"
        );
        self.handle = Some(handle);

        let ready = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::ClientDisconnected),
            ready = tokio::time::timeout(timeout, self.wait_ready(poll_interval)) => ready,
        };
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Provisioning(format!(
                    "sandbox not ready within {} seconds",
                    timeout.as_secs()
                )))
            }
        }

        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| Error::Sandbox("sandbox handle missing".to_string()))?;
        handle.status = SandboxStatus::Ready;
        tracing::info!(sandbox_id = %handle.id, "sandbox ready");
        Ok(handle)
    }

    async fn wait_ready(&self, poll_interval: Duration) -> Result<()> {
        let handle = self.require_handle()?;
        loop {
            match self.provider.status(handle).await {
                Ok(SandboxStatus::Ready) => return Ok(()),
                Ok(status) if status.is_gone() => {
                    return Err(Error::Provisioning(format!(
                        "sandbox {} went away while starting",
                        handle.id
                    )))
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::Provisioning(format!("status check failed: {}", e)));
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn require_handle(&self) -> Result<&SandboxHandle> {
        match &self.handle {
            Some(handle) if !handle.status.is_gone() => Ok(handle),
            Some(handle) => Err(Error::Sandbox(format!("sandbox {} is gone", handle.id))),
            None => Err(Error::Sandbox("no sandbox provisioned".to_string())),
        }
    }

    /// Runs a command, forwarding output chunks to `output`.
    ///
    /// Cancellation drops the provider's run future, which stops the command.
    pub async fn stream(
        &self,
        command: &SandboxCommand,
        output: mpsc::Sender<SandboxOutput>,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let handle = self.require_handle()?;
        self.running.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(sandbox_id = %handle.id, command = %command.command, "running command");

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::ClientDisconnected),
            result = self.provider.run(handle, command, output) => result,
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Runs a command to completion and collects its output.
    pub async fn exec(
        &self,
        command: &SandboxCommand,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let (tx, mut rx) = mpsc::channel::<SandboxOutput>(64);
        let collect = async {
            let mut output = String::new();
            while let Some(chunk) = rx.recv().await {
                output.push_str(chunk.text());
            }
            output
        };

        let (exit_code, output) = tokio::join!(self.stream(command, tx, cancel), collect);
        Ok(CommandOutput {
            exit_code: exit_code?,
            output,
        })
    }

    /// Destroys the sandbox if one exists. Never fails; called at most once
    /// with effect.
    pub async fn destroy(&mut self) -> DestroyOutcome {
        if self.destroy_attempted {
            return DestroyOutcome::AlreadyAttempted;
        }
        let Some(handle) = self.handle.as_mut() else {
            return DestroyOutcome::NoHandle;
        };

        self.destroy_attempted = true;
        handle.status = SandboxStatus::Destroying;
        let handle = handle.clone();

        let destroyed = tokio::time::timeout(self.destroy_timeout, self.provider.destroy(&handle));
        let outcome = match destroyed.await {
            Ok(Ok(())) => {
                tracing::info!(sandbox_id = %handle.id, "sandbox destroyed");
                DestroyOutcome::Destroyed
            }
            Ok(Err(e)) => {
                tracing::warn!(sandbox_id = %handle.id, error = %e, "failed to destroy sandbox");
                DestroyOutcome::Failed(e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %handle.id,
                    timeout_ms = self.destroy_timeout.as_millis() as u64,
                    "sandbox destroy timed out"
                );
                DestroyOutcome::Failed(format!(
                    "destroy did not finish within {} ms",
                    self.destroy_timeout.as_millis()
                ))
            }
        };

        if let Some(handle) = self.handle.as_mut() {
            handle.status = SandboxStatus::Destroyed;
        }
        outcome
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            if !self.destroy_attempted {
                tracing::error!(sandbox_id = %handle.id, "sandbox session dropped without destroy");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CommandScript, ScriptedSandboxProvider};

    fn spec() -> SandboxSpec {
        SandboxSpec {
            ttl: Duration::from_secs(60),
            ..SandboxSpec::default()
        }
    }

    #[tokio::test]
    async fn provision_waits_for_ready() {
        let provider = Arc::new(ScriptedSandboxProvider::new().with_ready_after(3));
        let mut session = SandboxSession::new(provider.clone());

        let handle = session
            .provision(
                &spec(),
                Duration::from_millis(1),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(handle.status, SandboxStatus::Ready);
        assert!(provider.status_calls() >= 3);
        assert_eq!(session.destroy().await, DestroyOutcome::Destroyed);
    }

    #[tokio::test]
    async fn create_failure_leaves_nothing_to_destroy() {
        let provider = Arc::new(ScriptedSandboxProvider::new().failing_create());
        let mut session = SandboxSession::new(provider.clone());

        let err = session
            .provision(
                &spec(),
                Duration::from_millis(1),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provisioning(_)));
        assert_eq!(session.destroy().await, DestroyOutcome::NoHandle);
        assert_eq!(provider.destroy_calls(), 0);
    }

    #[tokio::test]
    async fn readiness_timeout_keeps_handle_for_cleanup() {
        let provider = Arc::new(ScriptedSandboxProvider::new().never_ready());
        let mut session = SandboxSession::new(provider.clone());

        let err = session
            .provision(
                &spec(),
                Duration::from_millis(1),
                Duration::from_millis(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provisioning(_)));
        assert!(session.handle().is_some());
        assert_eq!(session.destroy().await, DestroyOutcome::Destroyed);
        assert_eq!(provider.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn destroy_is_attempted_at_most_once() {
        let provider = Arc::new(ScriptedSandboxProvider::new().failing_destroy());
        let mut session = SandboxSession::new(provider.clone());
        session
            .provision(
                &spec(),
                Duration::from_millis(1),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(session.destroy().await, DestroyOutcome::Failed(_)));
        assert_eq!(session.destroy().await, DestroyOutcome::AlreadyAttempted);
        assert_eq!(provider.destroy_calls(), 1);
        assert_eq!(session.status(), Some(SandboxStatus::Destroyed));
    }

    #[tokio::test]
    async fn hanging_destroy_is_bounded() {
        let provider = Arc::new(ScriptedSandboxProvider::new().hanging_destroy());
        let mut session = SandboxSession::new(provider.clone())
            .with_destroy_timeout(Duration::from_millis(20));
        session
            .provision(
                &spec(),
                Duration::from_millis(1),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), session.destroy())
            .await
            .expect("destroy should give up");

        assert!(matches!(outcome, DestroyOutcome::Failed(_)));
        assert_eq!(provider.destroy_calls(), 1);
        assert_eq!(session.destroy().await, DestroyOutcome::AlreadyAttempted);
    }

    #[tokio::test]
    async fn exec_collects_output_and_exit_code() {
        let provider = Arc::new(
            ScriptedSandboxProvider::new()
                .on("echo", CommandScript::output(["hello\n", "world\n"]).exit_code(3)),
        );
        let mut session = SandboxSession::new(provider);
        let cancel = CancellationToken::new();
        session
            .provision(&spec(), Duration::from_millis(1), Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        let out = session
            .exec(&SandboxCommand::new("echo hello"), &cancel)
            .await
            .unwrap();

        assert_eq!(out.exit_code, 3);
        assert_eq!(out.output, "hello\nworld\n");
        assert!(!out.success());
        session.destroy().await;
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_hanging_command() {
        let provider = Arc::new(ScriptedSandboxProvider::new().on("sleep", CommandScript::hang()));
        let mut session = SandboxSession::new(provider);
        let cancel = CancellationToken::new();
        session
            .provision(&spec(), Duration::from_millis(1), Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = session
            .exec(&SandboxCommand::new("sleep 1000"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClientDisconnected));
        assert_eq!(session.status(), Some(SandboxStatus::Ready));
        session.destroy().await;
    }

    #[tokio::test]
    async fn commands_fail_without_a_sandbox() {
        let session = SandboxSession::new(Arc::new(ScriptedSandboxProvider::new()));
        let err = session
            .exec(&SandboxCommand::new("ls"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sandbox(_)));
    }
}
