//! Append-only audit log of gate decisions.

use std::path::Path;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{DecisionSource, OperationKind, Origin, PermissionDecision, RiskTier, Scope};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Allow,
    Deny,
}

impl AuditDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditDecision::Allow => "allow",
            AuditDecision::Deny => "deny",
        }
    }
}

/// One gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub origin: Origin,
    pub operation_kind: OperationKind,
    pub risk_tier: RiskTier,
    pub decision: AuditDecision,
    pub scope: Scope,
    pub source: DecisionSource,
    pub description: String,
}

impl AuditRecord {
    pub fn new(request_id: &str, decision: &PermissionDecision, description: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            origin: decision.origin,
            operation_kind: decision.operation_kind.clone(),
            risk_tier: decision.risk_tier,
            decision: if decision.is_allowed() {
                AuditDecision::Allow
            } else {
                AuditDecision::Deny
            },
            scope: decision.scope,
            source: decision.source,
            description: description.to_string(),
        }
    }

    /// One-line rendering for terminal listings.
    pub fn summary(&self) -> String {
        format!(
            "{} {} {}:{} {} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.request_id,
            self.origin,
            self.operation_kind,
            self.risk_tier,
            self.decision.as_str(),
            self.description
        )
    }
}

/// Shared across requests. Records are kept in memory and, when a file is
/// configured, appended to it as JSON lines.
#[derive(Debug, Default)]
pub struct AuditLog {
    records: StdMutex<Vec<AuditRecord>>,
    file: Option<Mutex<File>>,
}

impl AuditLog {
    /// In-memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to a JSON-lines file as well, creating it if needed.
    ///
    /// Records already in the file are loaded first; lines that do not parse
    /// are skipped.
    pub async fn with_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let history = match tokio::fs::read_to_string(path).await {
            Ok(content) => parse_history(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), records = history.len(), "audit log opened");

        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            records: StdMutex::new(history),
            file: Some(Mutex::new(file)),
        })
    }

    /// Appends a record. File write failures are logged, never raised.
    pub async fn append(&self, record: AuditRecord) {
        if let Some(file) = &self.file {
            match serde_json::to_string(&record) {
                Ok(mut line) => {
                    line.push('\n');
                    let mut file = file.lock().await;
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        tracing::warn!(error = %e, "failed to write audit record");
                    } else if let Err(e) = file.flush().await {
                        tracing::warn!(error = %e, "failed to flush audit log");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize audit record"),
            }
        }

        self.lock().push(record);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuditRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.lock().clone()
    }

    pub fn for_request(&self, request_id: &str) -> Vec<AuditRecord> {
        self.lock()
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect()
    }

    /// The most recent `limit` records, newest last.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let records = self.lock();
        let start = records.len().saturating_sub(limit);
        records[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn parse_history(content: &str) -> Vec<AuditRecord> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(index, line)| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(line = index + 1, error = %e, "skipping malformed audit record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(scope: Scope) -> PermissionDecision {
        PermissionDecision {
            origin: Origin::Agent,
            operation_kind: OperationKind::BashExec,
            risk_tier: RiskTier::High,
            scope,
            source: DecisionSource::Consent,
        }
    }

    #[tokio::test]
    async fn records_are_kept_in_order() {
        let log = AuditLog::new();
        log.append(AuditRecord::new("r1", &decision(Scope::Once), "ls"))
            .await;
        log.append(AuditRecord::new("r2", &decision(Scope::Deny), "rm"))
            .await;
        log.append(AuditRecord::new("r1", &decision(Scope::Deny), "rm -rf"))
            .await;

        assert_eq!(log.len(), 3);
        assert_eq!(log.for_request("r1").len(), 2);
        assert_eq!(log.records()[1].decision, AuditDecision::Deny);

        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].description, "rm -rf");
    }

    #[tokio::test]
    async fn file_log_is_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let log = AuditLog::with_file(&path).await.unwrap();
        log.append(AuditRecord::new("r1", &decision(Scope::Once), "ls"))
            .await;
        log.append(AuditRecord::new("r1", &decision(Scope::Deny), "rm"))
            .await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: AuditRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.operation_kind, OperationKind::BashExec);
        assert_eq!(parsed.decision, AuditDecision::Deny);
        assert!(lines[0].contains("\"risk_tier\":\"high\""));
    }

    #[tokio::test]
    async fn reopened_file_log_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let log = AuditLog::with_file(&path).await.unwrap();
            log.append(AuditRecord::new("r1", &decision(Scope::Once), "ls"))
                .await;
            log.append(AuditRecord::new("r1", &decision(Scope::Deny), "rm"))
                .await;
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{truncated\n");
        std::fs::write(&path, content).unwrap();

        let log = AuditLog::with_file(&path).await.unwrap();
        assert_eq!(log.len(), 2);
        log.append(AuditRecord::new("r2", &decision(Scope::Once), "make"))
            .await;

        let recent = log.recent(2);
        assert_eq!(recent[0].description, "rm");
        assert_eq!(recent[1].request_id, "r2");
        assert!(recent[0].summary().contains("r1 agent:bash_exec high deny rm"));
    }
}
