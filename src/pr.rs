//! Pushing work branches and opening pull requests.
//!
//! [`GitHost`] is the seam; [`GhCliHost`] runs `git push` and `gh pr create`
//! inside the request's sandbox. PR titles and bodies are drafted here from
//! the analysed [`ChangeSet`] and the agent's recorded activity.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::git::{commit_type, describe_change, git_failure, summary_line, ChangeSet, FileCategory, RepoRef};
use crate::monitor::ActivitySummary;
use crate::sandbox::{shell_quote, SandboxCommand, SandboxSession};

static PR_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://github\.com/[^\s]+/pull/\d+").expect("valid pull request url regex")
});

/// Environment variable carrying the token into sandbox commands, so it never
/// appears in a command line.
pub const TOKEN_ENV: &str = "TB_GIT_TOKEN";

/// Information about a created pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// PR number.
    pub number: u64,
    /// PR URL.
    pub url: String,
    /// PR title.
    pub title: String,
    /// Target branch.
    pub base_branch: String,
    /// Source branch.
    pub head_branch: String,
}

/// A pull request ready to be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDraft {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
}

/// Finds the first pull request URL in `gh` output.
pub fn extract_pr_url(output: &str) -> Option<String> {
    PR_URL.find(output).map(|m| m.as_str().to_string())
}

fn pr_number(url: &str) -> u64 {
    url.rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// `<type>: <prompt>` with the prompt cut at 50 characters.
pub fn pr_title(prompt: &str, changes: &ChangeSet) -> String {
    summary_line(commit_type(prompt, changes), prompt)
}

const LISTED_READS: usize = 5;
const LISTED_COMMANDS: usize = 3;

/// Markdown body: summary, files by category, technical details, checklist.
pub fn pr_body(
    prompt: &str,
    changes: &ChangeSet,
    activity: &ActivitySummary,
    branch: &str,
    request_id: &str,
) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "## Summary\n\n**Task:** {}\n\n**Impact:** {} files changed | +{} lines | -{} lines",
        prompt.trim(),
        changes.len(),
        changes.additions(),
        changes.deletions()
    ));

    let mut files = String::from("## Files Changed\n");
    for (category, entries) in changes.by_category() {
        files.push_str(&format!("\n### {}\n", category.title()));
        for file in entries {
            files.push_str(&describe_change(file));
            files.push('\n');
        }
    }
    sections.push(files.trim_end().to_string());

    if !activity.files_read.is_empty() || !activity.commands_run.is_empty() {
        let mut details = String::from("## Technical Details\n");
        if !activity.files_read.is_empty() {
            details.push_str(&format!(
                "\n**Files Analyzed:** {}\n",
                activity.files_read.len()
            ));
            for file in activity.files_read.iter().take(LISTED_READS) {
                details.push_str(&format!("- `{}`\n", file));
            }
            if activity.files_read.len() > LISTED_READS {
                details.push_str(&format!(
                    "- ... and {} more\n",
                    activity.files_read.len() - LISTED_READS
                ));
            }
        }
        if !activity.commands_run.is_empty() {
            details.push_str("\n**Commands Executed:**\n");
            for command in activity.commands_run.iter().take(LISTED_COMMANDS) {
                details.push_str(&format!("```bash\n{}\n```\n", command));
            }
        }
        sections.push(details.trim_end().to_string());
    }

    sections.push(testing_checklist(changes));

    sections.push(format!(
        "---\n\n*Generated by tiny-backspace in a sandboxed environment.*\n\n**Branch:** `{}`\n**Request ID:** `{}`",
        branch, request_id
    ));

    sections.join("\n\n")
}

fn testing_checklist(changes: &ChangeSet) -> String {
    let mut items = vec![
        "Code compiles without errors",
        "No linting errors introduced",
    ];
    if changes.has_category(FileCategory::Code) {
        items.push("Unit tests pass");
        items.push("Manual testing completed");
    }
    if changes.has_category(FileCategory::Config) {
        items.push("Configuration changes validated");
    }
    if changes.has_category(FileCategory::Styles) {
        items.push("Visual changes reviewed");
    }
    if changes.has_category(FileCategory::Docs) {
        items.push("Documentation renders correctly");
    }

    let mut section = String::from("## Testing Checklist\n");
    for item in items {
        section.push_str(&format!("\n- [ ] {}", item));
    }
    section
}

/// Pushes branches and opens pull requests for a sandboxed checkout.
#[async_trait]
pub trait GitHost: Send + Sync {
    /// Returns the name of this host.
    fn name(&self) -> &str;

    /// Pushes `branch` from the checkout at `repo_dir`.
    async fn push(
        &self,
        session: &SandboxSession,
        repo_dir: &str,
        repo: &RepoRef,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Opens a pull request for an already pushed branch.
    async fn open_pull_request(
        &self,
        session: &SandboxSession,
        repo_dir: &str,
        repo: &RepoRef,
        draft: &PullRequestDraft,
        cancel: &CancellationToken,
    ) -> Result<PullRequest>;
}

/// Uses `git` and the `gh` CLI inside the sandbox.
pub struct GhCliHost {
    token: Option<String>,
}

impl GhCliHost {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    fn with_token(&self, command: SandboxCommand) -> SandboxCommand {
        match &self.token {
            Some(token) => command
                .with_env(TOKEN_ENV, token.clone())
                .with_env("GH_TOKEN", token.clone()),
            None => command,
        }
    }
}

/// Push/clone URL expression for a `sh -c` line. With a token the URL refers
/// to [`TOKEN_ENV`] and is expanded by the shell.
pub fn remote_url_expr(repo: &RepoRef, authenticated: bool) -> String {
    if authenticated {
        format!("\"{}\"", repo.authenticated_url(&format!("${{{}}}", TOKEN_ENV)))
    } else {
        shell_quote(&repo.https_url())
    }
}

#[async_trait]
impl GitHost for GhCliHost {
    fn name(&self) -> &str {
        "gh"
    }

    async fn push(
        &self,
        session: &SandboxSession,
        repo_dir: &str,
        repo: &RepoRef,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let branch = shell_quote(branch);
        let command = SandboxCommand::new(format!(
            "git push {} {}:refs/heads/{}",
            remote_url_expr(repo, self.token.is_some()),
            branch,
            branch
        ))
        .in_dir(repo_dir);

        let output = session.exec(&self.with_token(command), cancel).await?;
        if !output.success() {
            return Err(git_failure("git push", output.exit_code, &output.output));
        }
        Ok(())
    }

    async fn open_pull_request(
        &self,
        session: &SandboxSession,
        repo_dir: &str,
        repo: &RepoRef,
        draft: &PullRequestDraft,
        cancel: &CancellationToken,
    ) -> Result<PullRequest> {
        let command = SandboxCommand::new(format!(
            "gh pr create --repo {} --head {} --base {} --title {} --body-file -",
            shell_quote(&repo.full_name()),
            shell_quote(&draft.head_branch),
            shell_quote(&draft.base_branch),
            shell_quote(&draft.title)
        ))
        .in_dir(repo_dir)
        .with_stdin(draft.body.clone());

        let output = session.exec(&self.with_token(command), cancel).await?;
        if !output.success() {
            return Err(git_failure("gh pr create", output.exit_code, &output.output));
        }

        let url = extract_pr_url(&output.output).ok_or_else(|| Error::GitOperation {
            message: "gh pr create printed no pull request URL".to_string(),
            transient: false,
        })?;

        Ok(PullRequest {
            number: pr_number(&url),
            url,
            title: draft.title.clone(),
            base_branch: draft.base_branch.clone(),
            head_branch: draft.head_branch.clone(),
        })
    }
}
