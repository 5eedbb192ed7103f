//! Persisted Always-allow / Always-deny decisions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{decision_key, parse_decision_key};
use crate::error::Result;

/// A remembered answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredDecision {
    Allow,
    Deny,
}

/// Cross-request decision cache keyed by [`decision_key`](super::decision_key).
///
/// Reads take a snapshot and never wait on a writer.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<StoredDecision>;

    async fn put(&self, key: &str, decision: StoredDecision) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Drops every stored decision.
    async fn clear(&self) -> Result<()>;

    fn snapshot(&self) -> Arc<HashMap<String, StoredDecision>>;
}

/// Seeds Always-allow decisions for the given keys.
///
/// Bare operation keys preapprove the pipeline's own operation only; an
/// `agent:` prefix is needed to let the agent skip consent.
pub async fn preapprove(store: &dyn DecisionStore, keys: &[String]) -> Result<()> {
    for key in keys {
        let (origin, kind) = parse_decision_key(key);
        let key = decision_key(origin, &kind);
        if store.get(&key).is_none() {
            store.put(&key, StoredDecision::Allow).await?;
            tracing::debug!(operation = %key, "operation preapproved");
        }
    }
    Ok(())
}

/// Forgets the decision for `key`, normalized like [`preapprove`] keys.
///
/// Returns the normalized key and whether a decision was stored under it.
pub async fn forget(store: &dyn DecisionStore, key: &str) -> Result<(String, bool)> {
    let (origin, kind) = parse_decision_key(key);
    let key = decision_key(origin, &kind);
    if store.get(&key).is_none() {
        return Ok((key, false));
    }
    store.remove(&key).await?;
    tracing::info!(operation = %key, "stored decision forgotten");
    Ok((key, true))
}

/// Stored decisions sorted by key.
pub fn sorted_decisions(store: &dyn DecisionStore) -> Vec<(String, StoredDecision)> {
    let mut entries: Vec<_> = store
        .snapshot()
        .iter()
        .map(|(key, decision)| (key.clone(), *decision))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

/// In-memory store; decisions last for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryDecisionStore {
    entries: RwLock<Arc<HashMap<String, StoredDecision>>>,
    write: Mutex<()>,
}

impl MemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries(entries: HashMap<String, StoredDecision>) -> Self {
        Self {
            entries: RwLock::new(Arc::new(entries)),
            write: Mutex::new(()),
        }
    }

    fn current(&self) -> Arc<HashMap<String, StoredDecision>> {
        match self.entries.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn replace(&self, next: HashMap<String, StoredDecision>) {
        let next = Arc::new(next);
        match self.entries.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Copy-on-write update; the caller holds the write mutex.
    fn update<F>(&self, f: F) -> HashMap<String, StoredDecision>
    where
        F: FnOnce(&mut HashMap<String, StoredDecision>),
    {
        let mut next = (*self.current()).clone();
        f(&mut next);
        self.replace(next.clone());
        next
    }
}

#[async_trait]
impl DecisionStore for MemoryDecisionStore {
    fn get(&self, key: &str) -> Option<StoredDecision> {
        self.current().get(key).copied()
    }

    async fn put(&self, key: &str, decision: StoredDecision) -> Result<()> {
        let _guard = self.write.lock().await;
        self.update(|map| {
            map.insert(key.to_string(), decision);
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write.lock().await;
        self.update(|map| {
            map.remove(key);
        });
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.write.lock().await;
        self.update(HashMap::clear);
        Ok(())
    }

    fn snapshot(&self) -> Arc<HashMap<String, StoredDecision>> {
        self.current()
    }
}

/// Store persisted as a JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct FileDecisionStore {
    path: PathBuf,
    inner: MemoryDecisionStore,
}

impl FileDecisionStore {
    /// Opens the store, loading existing decisions if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(path = %path.display(), decisions = entries.len(), "decision store loaded");

        Ok(Self {
            path,
            inner: MemoryDecisionStore::with_entries(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &HashMap<String, StoredDecision>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DecisionStore for FileDecisionStore {
    fn get(&self, key: &str) -> Option<StoredDecision> {
        self.inner.get(key)
    }

    async fn put(&self, key: &str, decision: StoredDecision) -> Result<()> {
        let _guard = self.inner.write.lock().await;
        let next = self.inner.update(|map| {
            map.insert(key.to_string(), decision);
        });
        self.persist(&next).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.inner.write.lock().await;
        let next = self.inner.update(|map| {
            map.remove(key);
        });
        self.persist(&next).await
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.inner.write.lock().await;
        let next = self.inner.update(HashMap::clear);
        self.persist(&next).await
    }

    fn snapshot(&self) -> Arc<HashMap<String, StoredDecision>> {
        self.inner.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_put_get_remove() {
        let store = MemoryDecisionStore::new();
        assert_eq!(store.get("bash_exec"), None);

        store.put("bash_exec", StoredDecision::Deny).await.unwrap();
        assert_eq!(store.get("bash_exec"), Some(StoredDecision::Deny));

        store.remove("bash_exec").await.unwrap();
        assert_eq!(store.get("bash_exec"), None);
    }

    #[tokio::test]
    async fn snapshot_is_not_affected_by_later_writes() {
        let store = MemoryDecisionStore::new();
        store.put("git_push", StoredDecision::Allow).await.unwrap();

        let before = store.snapshot();
        store.put("git_commit", StoredDecision::Allow).await.unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn preapprove_normalizes_keys_and_keeps_existing_denials() {
        let store = MemoryDecisionStore::new();
        store
            .put("pipeline:git_push", StoredDecision::Deny)
            .await
            .unwrap();

        preapprove(
            &store,
            &[
                "git_commit".to_string(),
                "git_push".to_string(),
                "deploy".to_string(),
                "agent:file_edit".to_string(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(store.get("pipeline:git_commit"), Some(StoredDecision::Allow));
        assert_eq!(store.get("pipeline:git_push"), Some(StoredDecision::Deny));
        assert_eq!(store.get("pipeline:unknown:deploy"), Some(StoredDecision::Allow));
        assert_eq!(store.get("agent:file_edit"), Some(StoredDecision::Allow));
        assert_eq!(store.get("agent:git_commit"), None);
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("decisions.json");

        let store = FileDecisionStore::open(&path).await.unwrap();
        store.put("file_edit", StoredDecision::Allow).await.unwrap();
        store.put("bash_exec", StoredDecision::Deny).await.unwrap();
        drop(store);

        let reopened = FileDecisionStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("file_edit"), Some(StoredDecision::Allow));
        assert_eq!(reopened.get("bash_exec"), Some(StoredDecision::Deny));

        reopened.clear().await.unwrap();
        let cleared = FileDecisionStore::open(&path).await.unwrap();
        assert!(cleared.snapshot().is_empty());
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(FileDecisionStore::open(&path).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_puts_are_all_kept() {
        let store = Arc::new(MemoryDecisionStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .put(&format!("unknown:op{}", i), StoredDecision::Allow)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.snapshot().len(), 16);
    }

    #[tokio::test]
    async fn forget_normalizes_bare_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.json");
        let store = FileDecisionStore::open(&path).await.unwrap();
        store.put("pipeline:git_push", StoredDecision::Allow).await.unwrap();
        store.put("agent:bash_exec", StoredDecision::Deny).await.unwrap();

        assert_eq!(
            sorted_decisions(&store),
            vec![
                ("agent:bash_exec".to_string(), StoredDecision::Deny),
                ("pipeline:git_push".to_string(), StoredDecision::Allow),
            ]
        );

        let (key, removed) = forget(&store, "git_push").await.unwrap();
        assert_eq!(key, "pipeline:git_push");
        assert!(removed);
        let (_, removed) = forget(&store, "agent:git_push").await.unwrap();
        assert!(!removed);

        let reopened = FileDecisionStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("pipeline:git_push"), None);
        assert_eq!(reopened.get("agent:bash_exec"), Some(StoredDecision::Deny));
    }
}
