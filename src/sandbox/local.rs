//! Local process sandbox.
//!
//! Each sandbox is a fresh temporary directory and every command is a
//! `sh -c` child process rooted in it. This gives filesystem separation
//! between requests, not kernel isolation.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::provider::{
    SandboxCommand, SandboxHandle, SandboxOutput, SandboxProvider, SandboxSpec, SandboxStatus,
};
use crate::error::{Error, Result};

/// Runs sandboxes as directories on the local machine.
#[derive(Debug, Clone)]
pub struct LocalSandboxProvider {
    base_dir: PathBuf,
}

impl Default for LocalSandboxProvider {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl LocalSandboxProvider {
    /// Creates sandboxes under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_of(&self, handle: &SandboxHandle) -> PathBuf {
        PathBuf::from(&handle.workdir)
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let id = format!("tb-{}", uuid::Uuid::new_v4());
        let path = self.base_dir.join(&id);

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::Provisioning(format!("cannot create {}: {}", path.display(), e)))?;

        if spec.image.is_some() {
            tracing::debug!(sandbox_id = %id, "local provider ignores sandbox image");
        }

        Ok(SandboxHandle {
            id,
            status: SandboxStatus::Provisioning,
            created_at: Utc::now(),
            ttl: spec.ttl,
            workdir: path.to_string_lossy().to_string(),
        })
    }

    async fn status(&self, handle: &SandboxHandle) -> Result<SandboxStatus> {
        match tokio::fs::metadata(self.path_of(handle)).await {
            Ok(meta) if meta.is_dir() => Ok(SandboxStatus::Ready),
            Ok(_) => Err(Error::Sandbox(format!("{} is not a directory", handle.workdir))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SandboxStatus::Destroyed),
            Err(e) => Err(e.into()),
        }
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &SandboxCommand,
        output: mpsc::Sender<SandboxOutput>,
    ) -> Result<i32> {
        let workdir = command.workdir.as_deref().unwrap_or(&handle.workdir);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command.command)
            .current_dir(workdir)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn command: {}", e)))?;

        if let (Some(input), Some(mut stdin)) = (command.stdin.as_ref(), child.stdin.take()) {
            let input = input.clone();
            // Written concurrently so a chatty child cannot deadlock on a full pipe.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!(error = %e, "stdin closed early");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Sandbox("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Sandbox("stderr was not captured".to_string()))?;

        // Raw line reads: output that is not valid UTF-8 is decoded lossily
        // rather than ending the stream.
        let mut stdout_reader = BufReader::new(stdout);
        let mut stderr_reader = BufReader::new(stderr);
        let mut stdout_line = Vec::new();
        let mut stderr_line = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut receiver_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout_reader.read_until(b'\n', &mut stdout_line), if stdout_open => {
                    match read {
                        Ok(0) => stdout_open = false,
                        Ok(_) => {
                            let line = String::from_utf8_lossy(&stdout_line).into_owned();
                            stdout_line.clear();
                            if receiver_open && output.send(SandboxOutput::Stdout(line)).await.is_err() {
                                receiver_open = false;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "error reading stdout");
                            stdout_open = false;
                        }
                    }
                }
                read = stderr_reader.read_until(b'\n', &mut stderr_line), if stderr_open => {
                    match read {
                        Ok(0) => stderr_open = false,
                        Ok(_) => {
                            let line = String::from_utf8_lossy(&stderr_line).into_owned();
                            stderr_line.clear();
                            if receiver_open && output.send(SandboxOutput::Stderr(line)).await.is_err() {
                                receiver_open = false;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "error reading stderr");
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Sandbox(format!("failed to wait for command: {}", e)))?;

        // No code when killed by a signal.
        Ok(status.code().unwrap_or(-1))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        match tokio::fs::remove_dir_all(self.path_of(handle)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Sandbox(format!(
                "cannot remove {}: {}",
                handle.workdir, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn sandbox() -> (tempfile::TempDir, LocalSandboxProvider, SandboxHandle) {
        let base = tempfile::tempdir().unwrap();
        let provider = LocalSandboxProvider::new(base.path());
        let handle = provider
            .create(&SandboxSpec {
                ttl: Duration::from_secs(60),
                ..SandboxSpec::default()
            })
            .await
            .unwrap();
        (base, provider, handle)
    }

    async fn run(
        provider: &LocalSandboxProvider,
        handle: &SandboxHandle,
        cmd: SandboxCommand,
    ) -> (i32, Vec<SandboxOutput>) {
        let (tx, mut rx) = mpsc::channel(64);
        let code = provider.run(handle, &cmd, tx).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        (code, chunks)
    }

    #[tokio::test]
    async fn create_status_destroy_lifecycle() {
        let (_base, provider, handle) = sandbox().await;

        assert!(handle.id.starts_with("tb-"));
        assert_eq!(provider.status(&handle).await.unwrap(), SandboxStatus::Ready);

        provider.destroy(&handle).await.unwrap();
        assert_eq!(
            provider.status(&handle).await.unwrap(),
            SandboxStatus::Destroyed
        );
        // Destroying twice is harmless at the provider level.
        provider.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn run_streams_both_pipes_and_exit_code() {
        let (_base, provider, handle) = sandbox().await;

        let (code, chunks) = run(
            &provider,
            &handle,
            SandboxCommand::new("echo out; echo err 1>&2; exit 4"),
        )
        .await;

        assert_eq!(code, 4);
        assert!(chunks.contains(&SandboxOutput::Stdout("out\n".to_string())));
        assert!(chunks.contains(&SandboxOutput::Stderr("err\n".to_string())));
        provider.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn run_uses_workdir_env_and_stdin() {
        let (_base, provider, handle) = sandbox().await;
        let sub = format!("{}/repo", handle.workdir);
        std::fs::create_dir_all(&sub).unwrap();

        let (code, _) = run(
            &provider,
            &handle,
            SandboxCommand::new("cat > note.txt && echo \"$GREETING\" >> note.txt")
                .in_dir(sub.clone())
                .with_env("GREETING", "hi")
                .with_stdin("from stdin\n"),
        )
        .await;

        assert_eq!(code, 0);
        let written = std::fs::read_to_string(format!("{}/note.txt", sub)).unwrap();
        assert_eq!(written, "from stdin\nhi\n");
        provider.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_stream() {
        let (_base, provider, handle) = sandbox().await;

        let (code, chunks) = run(
            &provider,
            &handle,
            SandboxCommand::new("printf 'before\\n\\377\\nafter\\n'"),
        )
        .await;

        assert_eq!(code, 0);
        let stdout: String = chunks
            .iter()
            .filter_map(|c| match c {
                SandboxOutput::Stdout(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, "before\n\u{FFFD}\nafter\n");
        provider.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn last_line_without_newline_is_kept() {
        let (_base, provider, handle) = sandbox().await;

        let (_, chunks) = run(&provider, &handle, SandboxCommand::new("printf 'done'")).await;

        assert_eq!(chunks, vec![SandboxOutput::Stdout("done".to_string())]);
        provider.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_run_kills_the_child() {
        let (_base, provider, handle) = sandbox().await;
        let (tx, _rx) = mpsc::channel(8);
        let cmd = SandboxCommand::new("sleep 30");

        let result =
            tokio::time::timeout(Duration::from_millis(100), provider.run(&handle, &cmd, tx)).await;

        assert!(result.is_err(), "sleep should still be running when dropped");
        provider.destroy(&handle).await.unwrap();
    }
}
