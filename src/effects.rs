//! Applying approved agent actions.
//!
//! The agent only announces writes, edits and commands. Once the permission
//! gate approves one, a [`ToolExecutor`] performs it inside the sandbox.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::parser::{ToolKind, ToolUse};
use crate::permissions::is_contained;
use crate::sandbox::{shell_quote, SandboxCommand, SandboxSession};

/// Result of applying one tool use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectOutcome {
    /// False when nothing was changed (rejected path, empty edit).
    pub applied: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl EffectOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            applied: false,
            exit_code: None,
            output: reason.into(),
        }
    }

    fn ran(exit_code: i32, output: String) -> Self {
        Self {
            applied: exit_code == 0,
            exit_code: Some(exit_code),
            output,
        }
    }
}

/// Performs approved mutating tool uses.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn apply(
        &self,
        session: &SandboxSession,
        repo_dir: &str,
        tool: &ToolUse,
        cancel: &CancellationToken,
    ) -> Result<EffectOutcome>;
}

/// Applies tool uses with shell commands in the request's sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxToolExecutor;

impl SandboxToolExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn write_file(
        &self,
        session: &SandboxSession,
        repo_dir: &str,
        path: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<EffectOutcome> {
        let quoted = shell_quote(path);
        let mut content = content.to_string();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        let command = SandboxCommand::new(format!(
            "mkdir -p \"$(dirname {})\" && cat > {}",
            quoted, quoted
        ))
        .in_dir(repo_dir)
        .with_stdin(content);

        let output = session.exec(&command, cancel).await?;
        Ok(EffectOutcome::ran(output.exit_code, output.output))
    }
}

#[async_trait]
impl ToolExecutor for SandboxToolExecutor {
    async fn apply(
        &self,
        session: &SandboxSession,
        repo_dir: &str,
        tool: &ToolUse,
        cancel: &CancellationToken,
    ) -> Result<EffectOutcome> {
        match tool.kind {
            ToolKind::Read => Ok(EffectOutcome::skipped("reads have no effect")),
            ToolKind::Write | ToolKind::Edit => {
                let path = tool.target.trim().trim_start_matches("./");
                if path.is_empty() || !is_contained(Path::new(path)) {
                    return Ok(EffectOutcome::skipped(format!(
                        "refusing to touch '{}' outside the repository",
                        tool.target
                    )));
                }

                let body = fenced_body(&tool.detail);
                if tool.kind == ToolKind::Write {
                    return self.write_file(session, repo_dir, path, &body, cancel).await;
                }

                if body.trim().is_empty() {
                    Ok(EffectOutcome::skipped("edit carried no content"))
                } else if looks_like_diff(&body) {
                    let mut patch = body;
                    if !patch.ends_with('\n') {
                        patch.push('\n');
                    }
                    let command =
                        SandboxCommand::new("git apply --recount --whitespace=nowarn -")
                            .in_dir(repo_dir)
                            .with_stdin(patch);
                    let output = session.exec(&command, cancel).await?;
                    Ok(EffectOutcome::ran(output.exit_code, output.output))
                } else {
                    // Not a patch: the block is the file's new content.
                    self.write_file(session, repo_dir, path, &body, cancel).await
                }
            }
            ToolKind::Bash => {
                let command = SandboxCommand::new(tool.target.clone()).in_dir(repo_dir);
                let output = session.exec(&command, cancel).await?;
                Ok(EffectOutcome::ran(output.exit_code, output.output))
            }
            ToolKind::Git => {
                let command =
                    SandboxCommand::new(format!("git {}", tool.target)).in_dir(repo_dir);
                let output = session.exec(&command, cancel).await?;
                Ok(EffectOutcome::ran(output.exit_code, output.output))
            }
        }
    }
}

/// Applies `tool`, letting an in-flight effect finish for up to `grace` after
/// `cancel` fires. Past the grace period the effect is abandoned.
pub async fn apply_with_grace(
    executor: &dyn ToolExecutor,
    session: &SandboxSession,
    repo_dir: &str,
    tool: &ToolUse,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<EffectOutcome> {
    // The effect gets its own token so cancelling the request does not stop it.
    let effect_token = CancellationToken::new();
    let effect = executor.apply(session, repo_dir, tool, &effect_token);
    tokio::pin!(effect);

    tokio::select! {
        result = &mut effect => result,
        _ = cancel.cancelled() => {
            match tokio::time::timeout(grace, &mut effect).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        tool = %tool.kind,
                        target = %tool.target,
                        grace_ms = grace.as_millis() as u64,
                        "abandoning effect after grace period"
                    );
                    effect_token.cancel();
                    Err(Error::ClientDisconnected)
                }
            }
        }
    }
}

/// Strips a surrounding code fence from a tool block's detail.
pub fn fenced_body(detail: &str) -> String {
    let trimmed = detail.trim_matches('\n');
    let Some(first_newline) = trimmed.find('\n') else {
        return if trimmed.trim_start().starts_with("```") {
            String::new()
        } else {
            trimmed.to_string()
        };
    };

    let (first, rest) = trimmed.split_at(first_newline);
    if !first.trim_start().starts_with("```") {
        return trimmed.to_string();
    }

    let rest = &rest[1..];
    let body = match rest.rfind('\n') {
        Some(idx) if rest[idx + 1..].trim() == "```" => &rest[..idx],
        None if rest.trim() == "```" => "",
        _ => rest,
    };
    body.to_string()
}

fn looks_like_diff(body: &str) -> bool {
    let first = body.lines().next().unwrap_or_default();
    first.starts_with("diff --git")
        || first.starts_with("--- ")
        || first.starts_with("@@")
        || body.contains("\n@@ ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::sandbox::{LocalSandboxProvider, SandboxSpec};
    use crate::testing::{CommandScript, ScriptedSandboxProvider};

    fn tool(kind: ToolKind, target: &str, detail: &str) -> ToolUse {
        ToolUse {
            kind,
            target: target.to_string(),
            detail: detail.to_string(),
            language: "plaintext".to_string(),
        }
    }

    #[test]
    fn fenced_body_strips_fences() {
        assert_eq!(fenced_body("```rust\nfn main() {}\n```"), "fn main() {}");
        assert_eq!(fenced_body("```\na\n\nb\n```\n"), "a\n\nb");
        assert_eq!(fenced_body("plain text"), "plain text");
        assert_eq!(fenced_body("```python\nprint('hi')"), "print('hi')");
        assert_eq!(fenced_body("```\n```"), "");
        assert_eq!(fenced_body(""), "");
    }

    #[test]
    fn recognises_diffs() {
        assert!(looks_like_diff("--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b"));
        assert!(looks_like_diff("diff --git a/x b/x"));
        assert!(!looks_like_diff("fn main() {}\n"));
    }

    async fn local_session(base: &Path) -> (SandboxSession, String) {
        let mut session = SandboxSession::new(Arc::new(LocalSandboxProvider::new(base)));
        let handle = session
            .provision(
                &SandboxSpec::default(),
                Duration::from_millis(1),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let repo_dir = format!("{}/repo", handle.workdir);
        std::fs::create_dir_all(&repo_dir).unwrap();
        (session, repo_dir)
    }

    #[tokio::test]
    async fn writes_files_in_nested_directories() {
        let base = tempfile::tempdir().unwrap();
        let (mut session, repo_dir) = local_session(base.path()).await;
        let cancel = CancellationToken::new();

        let outcome = SandboxToolExecutor::new()
            .apply(
                &session,
                &repo_dir,
                &tool(ToolKind::Write, "src/new/mod.rs", "```rust\npub fn hi() {}\n```"),
                &cancel,
            )
            .await
            .unwrap();

        assert!(outcome.applied);
        let written = std::fs::read_to_string(format!("{}/src/new/mod.rs", repo_dir)).unwrap();
        assert_eq!(written, "pub fn hi() {}\n");
        session.destroy().await;
    }

    #[tokio::test]
    async fn rejects_paths_outside_the_repository() {
        let base = tempfile::tempdir().unwrap();
        let (mut session, repo_dir) = local_session(base.path()).await;

        let outcome = SandboxToolExecutor::new()
            .apply(
                &session,
                &repo_dir,
                &tool(ToolKind::Write, "../escape.txt", "x"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.applied);
        assert!(!base.path().join("escape.txt").exists());
        session.destroy().await;
    }

    #[tokio::test]
    async fn non_diff_edit_replaces_content() {
        let base = tempfile::tempdir().unwrap();
        let (mut session, repo_dir) = local_session(base.path()).await;
        std::fs::write(format!("{}/notes.txt", repo_dir), "old\n").unwrap();

        let outcome = SandboxToolExecutor::new()
            .apply(
                &session,
                &repo_dir,
                &tool(ToolKind::Edit, "notes.txt", "```\nnew\n```"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.applied);
        assert_eq!(
            std::fs::read_to_string(format!("{}/notes.txt", repo_dir)).unwrap(),
            "new\n"
        );
        session.destroy().await;
    }

    #[tokio::test]
    async fn bash_reports_exit_code_and_output() {
        let base = tempfile::tempdir().unwrap();
        let (mut session, repo_dir) = local_session(base.path()).await;

        let outcome = SandboxToolExecutor::new()
            .apply(
                &session,
                &repo_dir,
                &tool(ToolKind::Bash, "echo checking; exit 3", ""),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.applied);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.output, "checking\n");
        session.destroy().await;
    }

    async fn scripted_session(provider: ScriptedSandboxProvider) -> SandboxSession {
        let mut session = SandboxSession::new(Arc::new(provider));
        session
            .provision(
                &SandboxSpec::default(),
                Duration::from_millis(1),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn effect_finishes_within_grace_after_cancel() {
        let provider = ScriptedSandboxProvider::new().on(
            "make",
            CommandScript::output(["built\n"]).delay(Duration::from_millis(50)),
        );
        let mut session = scripted_session(provider).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = apply_with_grace(
            &SandboxToolExecutor::new(),
            &session,
            "/w/repo",
            &tool(ToolKind::Bash, "make", ""),
            &cancel,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(outcome.output, "built\n");
        session.destroy().await;
    }

    #[tokio::test]
    async fn effect_is_abandoned_after_grace() {
        let provider = ScriptedSandboxProvider::new().on("sleep", CommandScript::hang());
        let mut session = scripted_session(provider).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = apply_with_grace(
            &SandboxToolExecutor::new(),
            &session,
            "/w/repo",
            &tool(ToolKind::Bash, "sleep 100", ""),
            &cancel,
            Duration::from_millis(20),
        )
        .await;

        assert!(matches!(result, Err(Error::ClientDisconnected)));
        session.destroy().await;
    }
}
