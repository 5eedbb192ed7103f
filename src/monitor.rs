//! Activity tracking for a running agent.
//!
//! Records what the agent read, wrote and executed so the pull request body
//! can describe it, and keeps a bounded tail of raw output for failure
//! reports.

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::parser::{ToolKind, ToolUse};

/// Tracks agent activity over one request.
#[derive(Debug)]
pub struct ActivityTracker {
    files_read: BTreeSet<String>,
    files_written: BTreeSet<String>,
    commands_run: Vec<String>,
    denied: usize,
    output_lines: usize,
    start_time: Instant,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            files_read: BTreeSet::new(),
            files_written: BTreeSet::new(),
            commands_run: Vec::new(),
            denied: 0,
            output_lines: 0,
            start_time: Instant::now(),
        }
    }

    /// Records a tool use the agent announced.
    ///
    /// Mutating tools are only recorded once their effect was applied.
    pub fn record_tool(&mut self, tool: &ToolUse) {
        match tool.kind {
            ToolKind::Read => {
                self.files_read.insert(tool.target.clone());
            }
            ToolKind::Write | ToolKind::Edit => {
                self.files_written.insert(tool.target.clone());
            }
            ToolKind::Bash => self.commands_run.push(tool.target.clone()),
            ToolKind::Git => self.commands_run.push(format!("git {}", tool.target)),
        }
    }

    /// Records an operation the gate refused.
    pub fn record_denied(&mut self) {
        self.denied += 1;
    }

    /// Records raw output lines.
    pub fn record_output(&mut self, lines: usize) {
        self.output_lines += lines;
    }

    pub fn files_read(&self) -> &BTreeSet<String> {
        &self.files_read
    }

    pub fn files_written(&self) -> &BTreeSet<String> {
        &self.files_written
    }

    pub fn commands_run(&self) -> &[String] {
        &self.commands_run
    }

    /// Returns total elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Snapshot of everything recorded so far.
    pub fn summary(&self) -> ActivitySummary {
        ActivitySummary {
            files_read: self.files_read.iter().cloned().collect(),
            files_written: self.files_written.iter().cloned().collect(),
            commands_run: self.commands_run.clone(),
            denied_operations: self.denied,
            output_lines: self.output_lines,
            elapsed_secs: self.elapsed().as_secs_f64(),
        }
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of an [`ActivityTracker`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub files_read: Vec<String>,
    pub files_written: Vec<String>,
    pub commands_run: Vec<String>,
    pub denied_operations: usize,
    pub output_lines: usize,
    pub elapsed_secs: f64,
}

/// Bounded ring of the most recent output lines.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends every line of `chunk`, evicting the oldest past capacity.
    pub fn push_chunk(&mut self, chunk: &str) -> usize {
        let mut count = 0;
        for line in chunk.lines() {
            self.push(line.trim_end_matches('\r').to_string());
            count += 1;
        }
        count
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
