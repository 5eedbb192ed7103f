//! Static risk classification.

use std::path::{Component, Path};

use glob::Pattern;

use super::{OperationKind, RiskTier};
use crate::error::{Error, Result};
use crate::parser::{ToolKind, ToolUse};

/// Maps operations to risk tiers.
///
/// Writes and edits are low risk only inside the configured allow-list.
#[derive(Debug, Clone, Default)]
pub struct RiskClassifier {
    allow_list: Vec<Pattern>,
}

impl RiskClassifier {
    /// Compiles the allow-list globs.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let allow_list = patterns
            .iter()
            .map(|p| {
                Pattern::new(p.as_ref()).map_err(|e| {
                    Error::Config(format!("invalid allow-list pattern '{}': {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { allow_list })
    }

    /// Classifies an operation against `target` (a repo-relative path for
    /// file operations, ignored otherwise).
    pub fn classify(&self, kind: &OperationKind, target: &str) -> RiskTier {
        match kind {
            OperationKind::FileRead | OperationKind::ListDirectory | OperationKind::GitRead => {
                RiskTier::Low
            }
            OperationKind::FileWrite | OperationKind::FileEdit => {
                if self.allows(target) {
                    RiskTier::Low
                } else {
                    RiskTier::Medium
                }
            }
            OperationKind::GitLocal | OperationKind::GitBranchCreate | OperationKind::GitCommit => {
                RiskTier::Medium
            }
            OperationKind::BashExec
            | OperationKind::GitPush
            | OperationKind::GitForcePush
            | OperationKind::PullRequestCreate
            | OperationKind::Unknown(_) => RiskTier::High,
        }
    }

    /// Returns true if `path` stays inside the repository and matches the allow-list.
    pub fn allows(&self, path: &str) -> bool {
        let path = path.trim().trim_start_matches("./");
        if path.is_empty() || !is_contained(Path::new(path)) {
            return false;
        }
        self.allow_list.iter().any(|p| p.matches(path))
    }

    /// The operation an agent tool use stands for.
    pub fn operation_for(tool: &ToolUse) -> OperationKind {
        match tool.kind {
            ToolKind::Read => OperationKind::FileRead,
            ToolKind::Write => OperationKind::FileWrite,
            ToolKind::Edit => OperationKind::FileEdit,
            ToolKind::Bash => OperationKind::BashExec,
            ToolKind::Git => git_operation(&tool.target),
        }
    }
}

/// True for relative paths without `..` components.
pub(crate) fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Characters that make `sh -c` do more than run a single git command.
const SHELL_SYNTAX: &[char] = &[';', '&', '|', '`', '$', '<', '>', '\n', '\r', '(', ')'];

/// True if `args` would be interpreted by the shell beyond word splitting.
pub fn has_shell_syntax(args: &str) -> bool {
    args.contains(SHELL_SYNTAX)
}

/// Classifies git arguments (without the leading `git`).
///
/// Arguments carrying shell syntax run arbitrary commands once handed to
/// `sh -c`, so they classify as [`OperationKind::BashExec`].
pub fn git_operation(args: &str) -> OperationKind {
    if has_shell_syntax(args) {
        return OperationKind::BashExec;
    }
    let mut words = args.split_whitespace();
    let Some(subcommand) = words.next() else {
        return OperationKind::Unknown("git".to_string());
    };
    let rest: Vec<&str> = words.collect();
    let has = |flags: &[&str]| rest.iter().any(|w| flags.contains(w));

    match subcommand {
        "push" => {
            let forced = has(&["--force", "-f"])
                || rest
                    .iter()
                    .any(|w| w.starts_with("--force-with-lease") || w.starts_with('+'));
            if forced {
                OperationKind::GitForcePush
            } else {
                OperationKind::GitPush
            }
        }
        "commit" => OperationKind::GitCommit,
        "checkout" if has(&["-b", "-B"]) => OperationKind::GitBranchCreate,
        "switch" if has(&["-c", "-C", "--create"]) => OperationKind::GitBranchCreate,
        "branch" => {
            if has(&["-d", "-D", "--delete", "-m", "-M"]) {
                OperationKind::GitLocal
            } else if rest.iter().all(|w| w.starts_with('-')) {
                OperationKind::GitRead
            } else {
                OperationKind::GitBranchCreate
            }
        }
        "remote" if rest.is_empty() || has(&["-v", "show"]) => OperationKind::GitRead,
        "status" | "log" | "diff" | "show" | "blame" | "rev-parse" | "ls-files" | "grep"
        | "shortlog" | "describe" => OperationKind::GitRead,
        "add" | "rm" | "mv" | "restore" | "reset" | "stash" | "merge" | "rebase" | "tag"
        | "cherry-pick" | "revert" | "fetch" | "pull" | "clean" | "apply" | "checkout"
        | "switch" | "remote" | "config" => OperationKind::GitLocal,
        other => OperationKind::Unknown(format!("git {}", other)),
    }
}
