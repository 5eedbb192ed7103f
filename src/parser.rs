//! Incremental parser for agent output.
//!
//! The agent writes free-form text. Lines are reassembled from arbitrarily
//! split chunks and classified by prefix:
//!
//! - tool preambles (`Reading file: `, `Writing to file: `, `$ `, `git `, ...)
//!   open a tool block whose following lines are its `detail`
//! - `Error: ` / `ERROR: ` / `fatal: ` open an error block
//! - `Thinking: ` / `[thinking] ` open a thinking block
//! - a blank line terminates the open block
//! - anything else is free text, folded into the open block or starting a
//!   message block
//!
//! A fenced block (```` ``` ````) inside a block suspends termination until
//! the closing fence. Events are produced only once the text that completes
//! them has arrived, so the output does not depend on chunk boundaries.

use std::collections::VecDeque;
use std::path::Path;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

/// Kind of tool the agent announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolKind {
    Read,
    Write,
    Edit,
    Bash,
    Git,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Read => "Read",
            ToolKind::Write => "Write",
            ToolKind::Edit => "Edit",
            ToolKind::Bash => "Bash",
            ToolKind::Git => "Git",
        }
    }

    /// Returns true if the tool changes state and must pass the gate.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, ToolKind::Read)
    }

    fn targets_file(&self) -> bool {
        matches!(self, ToolKind::Read | ToolKind::Write | ToolKind::Edit)
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation announced by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUse {
    pub kind: ToolKind,
    /// File path, shell command, or git arguments.
    pub target: String,
    /// Lines following the preamble (file body, diff, command output).
    pub detail: String,
    /// Cosmetic language hint for rendering `detail`.
    pub language: String,
}

/// A typed event recovered from agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolUse(ToolUse),
    Message { text: String },
    Thinking { text: String },
    Error { text: String },
}

const TOOL_PREAMBLES: &[(&str, ToolKind)] = &[
    ("Reading file: ", ToolKind::Read),
    ("Read: ", ToolKind::Read),
    ("Listing directory: ", ToolKind::Read),
    ("Writing to file: ", ToolKind::Write),
    ("Writing file: ", ToolKind::Write),
    ("Creating file: ", ToolKind::Write),
    ("Editing file: ", ToolKind::Edit),
    ("Modifying: ", ToolKind::Edit),
    ("Executing command: ", ToolKind::Bash),
    ("$ ", ToolKind::Bash),
    ("Git operation: ", ToolKind::Git),
    ("git ", ToolKind::Git),
];

const ERROR_PREFIXES: &[&str] = &["Error: ", "ERROR: ", "fatal: "];
const THINKING_PREFIXES: &[&str] = &["Thinking: ", "[thinking] "];

#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Tool(ToolKind, &'a str),
    Error(&'a str),
    Thinking(&'a str),
    Blank,
    Text(&'a str),
}

fn classify(line: &str) -> Line<'_> {
    for (prefix, kind) in TOOL_PREAMBLES {
        if let Some(rest) = line.strip_prefix(prefix) {
            return Line::Tool(*kind, rest);
        }
    }
    if let Some(rest) = ERROR_PREFIXES.iter().find_map(|p| line.strip_prefix(p)) {
        return Line::Error(rest);
    }
    if let Some(rest) = THINKING_PREFIXES.iter().find_map(|p| line.strip_prefix(p)) {
        return Line::Thinking(rest);
    }
    if line.trim().is_empty() {
        return Line::Blank;
    }
    Line::Text(line)
}

fn fence_info(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix("```").map(str::trim)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Tool(ToolKind),
    Message,
    Thinking,
    Error,
}

#[derive(Debug)]
struct Block {
    kind: BlockKind,
    head: String,
    body: Vec<String>,
    in_fence: bool,
    fence_hint: Option<String>,
}

impl Block {
    fn new(kind: BlockKind, head: &str) -> Self {
        let head = match kind {
            BlockKind::Tool(ToolKind::Git) => {
                let head = head.trim();
                head.strip_prefix("git ").unwrap_or(head).trim().to_string()
            }
            BlockKind::Tool(_) => head.trim().to_string(),
            _ => head.to_string(),
        };
        Self {
            kind,
            head,
            body: Vec::new(),
            in_fence: false,
            fence_hint: None,
        }
    }

    fn push(&mut self, line: &str) {
        if let Some(info) = fence_info(line) {
            if self.in_fence {
                self.in_fence = false;
            } else {
                self.in_fence = true;
                if self.fence_hint.is_none() && !info.is_empty() {
                    self.fence_hint = Some(info.to_string());
                }
            }
        }
        self.body.push(line.to_string());
    }

    fn text(&self) -> String {
        let mut text = self.head.clone();
        for line in &self.body {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(line);
        }
        text
    }

    fn into_event(self) -> AgentEvent {
        match self.kind {
            BlockKind::Tool(kind) => AgentEvent::ToolUse(ToolUse {
                kind,
                language: detect_language(kind, &self.head, self.fence_hint.as_deref()),
                detail: self.body.join("\n"),
                target: self.head,
            }),
            BlockKind::Message => AgentEvent::Message { text: self.text() },
            BlockKind::Thinking => AgentEvent::Thinking { text: self.text() },
            BlockKind::Error => AgentEvent::Error { text: self.text() },
        }
    }
}

/// Incremental line-oriented parser for agent output.
#[derive(Debug, Default)]
pub struct AgentOutputParser {
    partial: String,
    block: Option<Block>,
}

impl AgentOutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the events it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        self.partial.push_str(chunk);

        while let Some(pos) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            self.process_line(&line, &mut events);
        }

        events
    }

    /// Flushes the pending partial line and any open block.
    pub fn finish(&mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();

        if !self.partial.is_empty() {
            let mut line = std::mem::take(&mut self.partial);
            if line.ends_with('\r') {
                line.pop();
            }
            self.process_line(&line, &mut events);
        }
        self.flush(&mut events);

        events
    }

    /// Returns true if text is buffered that has not produced an event yet.
    pub fn has_pending(&self) -> bool {
        !self.partial.is_empty() || self.block.is_some()
    }

    fn flush(&mut self, events: &mut Vec<AgentEvent>) {
        if let Some(block) = self.block.take() {
            events.push(block.into_event());
        }
    }

    fn open(&mut self, kind: BlockKind, head: &str, events: &mut Vec<AgentEvent>) {
        self.flush(events);
        self.block = Some(Block::new(kind, head));
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<AgentEvent>) {
        if let Some(block) = self.block.as_mut() {
            if block.in_fence {
                block.push(line);
                return;
            }
        }

        let in_tool = matches!(
            self.block.as_ref().map(|b| b.kind),
            Some(BlockKind::Tool(_))
        );

        match classify(line) {
            Line::Tool(kind, target) => self.open(BlockKind::Tool(kind), target, events),
            // Error and thinking markers inside a tool block are its output.
            Line::Error(_) | Line::Thinking(_) if in_tool => {
                if let Some(block) = self.block.as_mut() {
                    block.push(line);
                }
            }
            Line::Error(text) => self.open(BlockKind::Error, text, events),
            Line::Thinking(text) => self.open(BlockKind::Thinking, text, events),
            Line::Blank => self.flush(events),
            Line::Text(text) => match self.block.as_mut() {
                Some(block) => block.push(text),
                None => {
                    let mut block = Block::new(BlockKind::Message, "");
                    block.push(text);
                    self.block = Some(block);
                }
            },
        }
    }
}

/// Picks a rendering hint: file extension, then fence info string, then `plaintext`.
pub fn detect_language(kind: ToolKind, target: &str, fence_hint: Option<&str>) -> String {
    if kind.targets_file() {
        let ext = Path::new(target)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if let Some(lang) = ext.as_deref().and_then(language_for_extension) {
            return lang.to_string();
        }
    }

    match fence_hint.and_then(|hint| hint.split_whitespace().next()) {
        Some(hint) => hint.to_string(),
        None => "plaintext".to_string(),
    }
}

fn language_for_extension(ext: &str) -> Option<&'static str> {
    let lang = match ext {
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "jsx" => "jsx",
        "tsx" => "tsx",
        "java" => "java",
        "cpp" | "cc" | "hpp" => "cpp",
        "c" | "h" => "c",
        "go" => "go",
        "rs" => "rust",
        "rb" => "ruby",
        "php" => "php",
        "css" => "css",
        "html" => "html",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "sh" => "bash",
        "sql" => "sql",
        "diff" | "patch" => "diff",
        _ => return None,
    };
    Some(lang)
}

/// Adapts a stream of output chunks into a lazy stream of events.
pub fn parse_stream<S>(chunks: S) -> impl Stream<Item = AgentEvent>
where
    S: Stream<Item = String> + Unpin,
{
    struct State<S> {
        chunks: S,
        parser: AgentOutputParser,
        pending: VecDeque<AgentEvent>,
        finished: bool,
    }

    let state = State {
        chunks,
        parser: AgentOutputParser::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }
            match state.chunks.next().await {
                Some(chunk) => state.pending.extend(state.parser.push(&chunk)),
                None => {
                    state.finished = true;
                    state.pending.extend(state.parser.finish());
                }
            }
        }
    })
}
