//! Repository references, branch naming and change analysis.
//!
//! Everything here is pure: the orchestrator runs the git commands inside the
//! sandbox and hands their output to these parsers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static GITHUB_HTTPS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://github\.com/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?/?$")
        .expect("valid github https regex")
});

static GITHUB_SSH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^git@github\.com:([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?$")
        .expect("valid github ssh regex")
});

/// Output fragments that mark a network hiccup rather than a real refusal.
const TRANSIENT_MARKERS: &[&str] = &[
    "could not resolve host",
    "connection timed out",
    "connection reset",
    "operation timed out",
    "the remote end hung up unexpectedly",
    "early eof",
    "returned error: 502",
    "returned error: 503",
    "returned error: 504",
    "http 502",
    "http 503",
    "rate limit",
];

/// A GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Parses an https or ssh GitHub URL.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let caps = GITHUB_HTTPS
            .captures(url)
            .or_else(|| GITHUB_SSH.captures(url))
            .ok_or_else(|| {
                Error::InvalidRequest(format!("'{}' is not a GitHub repository URL", url))
            })?;

        Ok(Self {
            owner: caps[1].to_string(),
            name: caps[2].to_string(),
        })
    }

    /// `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn https_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.name)
    }

    /// Clone/push URL carrying `token` as basic-auth credentials.
    pub fn authenticated_url(&self, token: &str) -> String {
        format!(
            "https://x-access-token:{}@github.com/{}/{}.git",
            token, self.owner, self.name
        )
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Lowercase, hyphen-separated branch component.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut pending_hyphen = false;

    for c in text.to_lowercase().chars() {
        if c.is_alphanumeric() || c == '_' {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else if c.is_whitespace() || c == '-' {
            pending_hyphen = true;
        }
    }
    slug
}

/// Work branch for a request: `tb/<id8>-<slug of the first 30 prompt chars>`.
pub fn branch_name(request_id: &str, prompt: &str) -> String {
    let id: String = request_id.chars().filter(|c| *c != '-').take(8).collect();
    let head: String = prompt.chars().take(30).collect();
    let slug = slugify(&head);
    if slug.is_empty() {
        format!("tb/{}", id)
    } else {
        format!("tb/{}-{}", id, slug)
    }
}

/// Returns true when git output looks like a retryable network failure.
pub fn is_transient_git_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Builds a [`Error::GitOperation`] from a failed command.
pub fn git_failure(context: &str, exit_code: i32, output: &str) -> Error {
    let detail = output.trim();
    let message = if detail.is_empty() {
        format!("{} (exit code {})", context, exit_code)
    } else {
        format!("{} (exit code {}): {}", context, exit_code, detail)
    };
    Error::GitOperation {
        message,
        transient: is_transient_git_failure(output),
    }
}

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl FileAction {
    fn label(&self) -> &'static str {
        match self {
            FileAction::Added => "[Added]",
            FileAction::Modified => "[Modified]",
            FileAction::Deleted => "[Deleted]",
            FileAction::Renamed => "[Renamed]",
        }
    }
}

/// Coarse grouping used by commit messages and PR bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Code,
    Tests,
    Config,
    Docs,
    Styles,
    Data,
    Other,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Code => "code",
            FileCategory::Tests => "tests",
            FileCategory::Config => "config",
            FileCategory::Docs => "docs",
            FileCategory::Styles => "styles",
            FileCategory::Data => "data",
            FileCategory::Other => "other",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            FileCategory::Code => "Code",
            FileCategory::Tests => "Tests",
            FileCategory::Config => "Config",
            FileCategory::Docs => "Docs",
            FileCategory::Styles => "Styles",
            FileCategory::Data => "Data",
            FileCategory::Other => "Other",
        }
    }
}

/// Categorizes a repo-relative path.
pub fn categorize_file(path: &str) -> FileCategory {
    let lower = path.to_lowercase();
    let file_name = lower.rsplit('/').next().unwrap_or(&lower);

    let is_test = lower.starts_with("tests/")
        || lower.contains("/tests/")
        || lower.contains("/__tests__/")
        || file_name.starts_with("test_")
        || file_name.contains("_test.")
        || file_name.contains(".test.")
        || file_name.contains(".spec.")
        || file_name.contains("_spec.");
    if is_test {
        return FileCategory::Tests;
    }

    if file_name == ".gitignore" || file_name == ".env" || file_name == "dockerfile" {
        return FileCategory::Config;
    }

    let ext = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext,
        None => return FileCategory::Other,
    };

    match ext {
        "py" | "js" | "ts" | "tsx" | "jsx" | "java" | "cpp" | "c" | "h" | "go" | "rs" | "rb"
        | "php" | "kt" | "swift" | "cs" | "sh" => FileCategory::Code,
        "json" | "yaml" | "yml" | "toml" | "ini" | "cfg" | "lock" => FileCategory::Config,
        "md" | "rst" | "txt" | "adoc" => FileCategory::Docs,
        "css" | "scss" | "sass" | "less" => FileCategory::Styles,
        "csv" | "xml" | "sql" => FileCategory::Data,
        _ => FileCategory::Other,
    }
}

/// One changed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    pub additions: u32,
    pub deletions: u32,
    pub category: FileCategory,
}

/// Staged changes of a request's work branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub files: Vec<FileChange>,
}

impl ChangeSet {
    /// Builds a change set from `git status --porcelain` and
    /// `git diff --cached --numstat` output.
    pub fn parse(porcelain: &str, numstat: &str) -> Self {
        let stats = parse_numstat(numstat);

        let files = porcelain
            .lines()
            .filter_map(parse_porcelain_line)
            .map(|(action, path)| {
                let (additions, deletions) = stats.get(&path).copied().unwrap_or((0, 0));
                FileChange {
                    category: categorize_file(&path),
                    path,
                    action,
                    additions,
                    deletions,
                }
            })
            .collect();

        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn additions(&self) -> u32 {
        self.files.iter().map(|f| f.additions).sum()
    }

    pub fn deletions(&self) -> u32 {
        self.files.iter().map(|f| f.deletions).sum()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Files grouped by category, in category order.
    pub fn by_category(&self) -> BTreeMap<FileCategory, Vec<&FileChange>> {
        let mut groups: BTreeMap<FileCategory, Vec<&FileChange>> = BTreeMap::new();
        for file in &self.files {
            groups.entry(file.category).or_default().push(file);
        }
        groups
    }

    pub fn has_category(&self, category: FileCategory) -> bool {
        self.files.iter().any(|f| f.category == category)
    }
}

fn unquote(path: &str) -> String {
    path.trim()
        .strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path.trim())
        .to_string()
}

fn parse_porcelain_line(line: &str) -> Option<(FileAction, String)> {
    if line.len() < 4 {
        return None;
    }
    let (status, rest) = line.split_at(2);
    let rest = rest.get(1..)?;

    let action = match status.trim() {
        "??" | "A" | "AM" => FileAction::Added,
        s if s.starts_with('D') || s.ends_with('D') => FileAction::Deleted,
        s if s.starts_with('R') => FileAction::Renamed,
        _ => FileAction::Modified,
    };

    let path = match rest.split_once(" -> ") {
        Some((_, to)) => unquote(to),
        None => unquote(rest),
    };
    Some((action, path))
}

fn parse_numstat(numstat: &str) -> HashMap<String, (u32, u32)> {
    numstat
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            // Binary files report "-" for both counts.
            let additions = parts.next()?.parse().unwrap_or(0);
            let deletions = parts.next()?.parse().unwrap_or(0);
            let path = parts.next()?;
            let path = match path.split_once(" => ") {
                Some((_, to)) => to.trim_end_matches('}').to_string(),
                None => unquote(path),
            };
            Some((path, (additions, deletions)))
        })
        .collect()
}

/// Conventional-commit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitType {
    Feat,
    Fix,
    Test,
    Refactor,
    Docs,
    Style,
}

impl CommitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitType::Feat => "feat",
            CommitType::Fix => "fix",
            CommitType::Test => "test",
            CommitType::Refactor => "refactor",
            CommitType::Docs => "docs",
            CommitType::Style => "style",
        }
    }
}

impl fmt::Display for CommitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const KEYWORDS: &[(CommitType, &[&str])] = &[
    (CommitType::Fix, &["fix", "bug", "error", "issue"]),
    (CommitType::Test, &["test", "spec"]),
    (CommitType::Refactor, &["refactor", "restructure", "reorganize"]),
    (CommitType::Docs, &["document", "docs", "readme"]),
    (CommitType::Style, &["style", "format", "lint"]),
    (CommitType::Feat, &["add", "new", "create", "implement"]),
];

/// Infers the commit type from prompt keywords, then from what changed.
pub fn commit_type(prompt: &str, changes: &ChangeSet) -> CommitType {
    let lower = prompt.to_lowercase();
    if let Some((kind, _)) = KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
    {
        return *kind;
    }

    let groups = changes.by_category();
    if groups.contains_key(&FileCategory::Tests) {
        CommitType::Test
    } else if groups.len() == 1 && groups.contains_key(&FileCategory::Docs) {
        CommitType::Docs
    } else if groups.len() == 1 && groups.contains_key(&FileCategory::Styles) {
        CommitType::Style
    } else {
        CommitType::Feat
    }
}

/// `<type>: <first 50 chars of prompt>`, with an ellipsis when cut.
pub fn summary_line(kind: CommitType, prompt: &str) -> String {
    let prompt = prompt.trim();
    let head: String = prompt.chars().take(50).collect();
    if head.len() < prompt.len() {
        format!("{}: {}...", kind, head.trim_end())
    } else {
        format!("{}: {}", kind, head)
    }
}

const FILES_PER_CATEGORY: usize = 5;

/// Full commit message: summary line, task, grouped files and impact.
pub fn commit_message(kind: CommitType, prompt: &str, changes: &ChangeSet) -> String {
    let mut lines = vec![
        summary_line(kind, prompt),
        String::new(),
        format!("Task: {}", prompt.trim()),
        String::new(),
        "Changes made:".to_string(),
    ];

    for (category, files) in changes.by_category() {
        lines.push(format!("- {}:", category.title()));
        for file in files.iter().take(FILES_PER_CATEGORY) {
            lines.push(format!("  - {}", file.path));
        }
        if files.len() > FILES_PER_CATEGORY {
            lines.push(format!("  - ... and {} more", files.len() - FILES_PER_CATEGORY));
        }
    }

    lines.push(String::new());
    lines.push(format!(
        "Impact: {} files changed, +{}/-{} lines",
        changes.len(),
        changes.additions(),
        changes.deletions()
    ));
    lines.push(String::new());
    lines.push("Generated by tiny-backspace".to_string());

    lines.join("\n")
}

/// `[Added] `path` (+3/-0)` style entry for PR bodies.
pub fn describe_change(file: &FileChange) -> String {
    format!(
        "- {} `{}` (+{}/-{})",
        file.action.label(),
        file.path,
        file.additions,
        file.deletions
    )
}
