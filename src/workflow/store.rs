//! Workflow persistence
//!
//! The orchestrator owns no global state: records and vote logs live behind
//! an injected `WorkflowStore`.
//!
//! - `MemoryStore`: in-process maps, for tests and one-shot runs
//! - `FileStore`: one YAML file per instance plus one JSON-lines vote log
//!
//! Several processes may share a `FileStore` directory (each CLI invocation
//! is one). Writers exclude each other through `<id>.lock` files created with
//! `create_new`, so a load-modify-save cycle or a vote append is never
//! interleaved with another process's.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::redundancy::VoteRecord;
use super::state::WorkflowRecord;
use crate::{Error, Result};

/// Persistence for workflow records and their vote logs
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Prepare the backing storage
    async fn initialize(&self) -> Result<()>;

    /// Flush and release the backing storage
    async fn shutdown(&self) -> Result<()>;

    /// Insert or replace a record
    async fn save(&self, record: &WorkflowRecord) -> Result<()>;

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowRecord>>;

    /// Every stored record, newest first
    async fn list(&self) -> Result<Vec<WorkflowRecord>>;

    /// Append a vote, assigning the next sequence number for the instance.
    /// Returns the vote as stored.
    async fn append_vote(&self, instance_id: Uuid, vote: VoteRecord) -> Result<VoteRecord>;

    /// Consistent snapshot of an instance's vote log, in append order
    async fn votes(&self, instance_id: Uuid) -> Result<Vec<VoteRecord>>;

    /// Exclusive hold on one instance against other processes sharing the
    /// store. Stores private to one process need nothing beyond the
    /// orchestrator's own locks.
    async fn lock(&self, _id: Uuid) -> Result<StoreLock> {
        Ok(StoreLock::default())
    }
}

/// Cross-process hold on an instance; released on drop
#[derive(Debug, Default)]
pub struct StoreLock {
    path: Option<PathBuf>,
}

impl StoreLock {
    pub fn is_held(&self) -> bool {
        self.path.is_some()
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to release store lock");
            }
        }
    }
}

const LOCK_RETRY: Duration = Duration::from_millis(20);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// A lock file this old belongs to a process that died holding it
const LOCK_STALE: Duration = Duration::from_secs(120);

async fn acquire_lock_file(path: PathBuf) -> Result<StoreLock> {
    let started = Instant::now();
    loop {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                let lock = StoreLock { path: Some(path) };
                file.write_all(std::process::id().to_string().as_bytes())
                    .await?;
                return Ok(lock);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_is_stale(&path).await {
                    warn!(path = %path.display(), "Breaking stale store lock");
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => continue,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                if started.elapsed() >= LOCK_TIMEOUT {
                    return Err(Error::Store(format!(
                        "Timed out waiting for lock {}",
                        path.display()
                    )));
                }
                tokio::time::sleep(LOCK_RETRY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn lock_is_stale(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > LOCK_STALE)
        .unwrap_or(false)
}

fn newest_first(records: &mut [WorkflowRecord]) {
    records.sort_by(|a, b| b.instance.created_at.cmp(&a.instance.created_at));
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Uuid, WorkflowRecord>>,
    votes: Mutex<HashMap<Uuid, Vec<VoteRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, record: &WorkflowRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.instance.id, record.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkflowRecord>> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        newest_first(&mut records);
        Ok(records)
    }

    async fn append_vote(&self, instance_id: Uuid, mut vote: VoteRecord) -> Result<VoteRecord> {
        let mut votes = self.votes.lock().await;
        let log = votes.entry(instance_id).or_default();
        vote.sequence = log.len() as u64 + 1;
        log.push(vote.clone());
        Ok(vote)
    }

    async fn votes(&self, instance_id: Uuid) -> Result<Vec<VoteRecord>> {
        Ok(self
            .votes
            .lock()
            .await
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// File-backed store
///
/// ```text
/// <dir>/instances/<id>.yaml
/// <dir>/votes/<id>.jsonl
/// ```
pub struct FileStore {
    base_dir: PathBuf,
    /// Serializes this process's vote log access; the lock file covers others
    vote_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            vote_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn instances_dir(&self) -> PathBuf {
        self.base_dir.join("instances")
    }

    fn votes_dir(&self) -> PathBuf {
        self.base_dir.join("votes")
    }

    fn instance_path(&self, id: Uuid) -> PathBuf {
        self.instances_dir().join(format!("{}.yaml", id))
    }

    fn votes_path(&self, id: Uuid) -> PathBuf {
        self.votes_dir().join(format!("{}.jsonl", id))
    }

    async fn lock_votes(&self, id: Uuid) -> Result<StoreLock> {
        tokio::fs::create_dir_all(self.votes_dir()).await?;
        acquire_lock_file(self.votes_dir().join(format!("{}.lock", id))).await
    }

    async fn read_record(path: &Path) -> Result<WorkflowRecord> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_yaml::from_str(&content).map_err(|e| {
            Error::Store(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    async fn read_votes(&self, instance_id: Uuid) -> Result<Vec<VoteRecord>> {
        let path = self.votes_path(instance_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    Error::Store(format!("Corrupt vote log {}: {}", path.display(), e))
                })
            })
            .collect()
    }
}

#[async_trait]
impl WorkflowStore for FileStore {
    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.instances_dir()).await?;
        tokio::fs::create_dir_all(self.votes_dir()).await?;
        info!(path = %self.base_dir.display(), "Workflow store ready");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        // Wait out any in-flight vote append
        let _guard = self.vote_lock.lock().await;
        debug!(path = %self.base_dir.display(), "Workflow store closed");
        Ok(())
    }

    async fn save(&self, record: &WorkflowRecord) -> Result<()> {
        let path = self.instance_path(record.instance.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_yaml::to_string(record)?;
        // Write then rename so a reader never sees a partial file
        let tmp = path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(instance_id = %record.instance.id, path = %path.display(), "Saved workflow");
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowRecord>> {
        let path = self.instance_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_record(&path).await.map(Some)
    }

    async fn list(&self) -> Result<Vec<WorkflowRecord>> {
        let dir = self.instances_dir();
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "yaml").unwrap_or(false) {
                records.push(Self::read_record(&path).await?);
            }
        }

        newest_first(&mut records);
        Ok(records)
    }

    async fn append_vote(&self, instance_id: Uuid, mut vote: VoteRecord) -> Result<VoteRecord> {
        let _guard = self.vote_lock.lock().await;
        let _held = self.lock_votes(instance_id).await?;

        vote.sequence = self
            .read_votes(instance_id)
            .await?
            .last()
            .map(|v| v.sequence + 1)
            .unwrap_or(1);

        let mut line = serde_json::to_string(&vote)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.votes_path(instance_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(vote)
    }

    async fn votes(&self, instance_id: Uuid) -> Result<Vec<VoteRecord>> {
        let _guard = self.vote_lock.lock().await;
        let _held = self.lock_votes(instance_id).await?;
        self.read_votes(instance_id).await
    }

    async fn lock(&self, id: Uuid) -> Result<StoreLock> {
        tokio::fs::create_dir_all(self.instances_dir()).await?;
        let lock = acquire_lock_file(self.instances_dir().join(format!("{}.lock", id))).await?;
        debug!(instance_id = %id, "Acquired instance lock");
        Ok(lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::phase::Phase;
    use crate::workflow::redundancy::VoteDecision;
    use crate::workflow::template::default_template;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record() -> WorkflowRecord {
        WorkflowRecord::new(&default_template().unwrap(), "proj", "parent", Utc::now())
    }

    fn vote(agent: &str, decision: VoteDecision) -> VoteRecord {
        VoteRecord {
            sequence: 0,
            phase: Phase::Security,
            agent_id: agent.to_string(),
            agent_type: "security_engineer".to_string(),
            decision,
            cast_at: Utc::now(),
        }
    }

    async fn exercise(store: Arc<dyn WorkflowStore>) {
        store.initialize().await.unwrap();

        let first = record();
        let mut second = record();
        second.instance.created_at = first.instance.created_at + Duration::seconds(5);
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        let loaded = store.load(first.id()).await.unwrap().unwrap();
        assert_eq!(loaded, first);
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id(), second.id());

        let a = store
            .append_vote(first.id(), vote("sec-1", VoteDecision::Approve))
            .await
            .unwrap();
        let b = store
            .append_vote(first.id(), vote("sec-1", VoteDecision::Reject))
            .await
            .unwrap();
        assert_eq!((a.sequence, b.sequence), (1, 2));

        let votes = store.votes(first.id()).await.unwrap();
        assert_eq!(votes, vec![a, b]);
        assert!(store.votes(second.id()).await.unwrap().is_empty());

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = TempDir::new().unwrap();
        exercise(Arc::new(FileStore::new(dir.path()))).await;

        assert!(dir.path().join("instances").is_dir());
        assert!(dir.path().join("votes").is_dir());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let saved = record();
        {
            let store = FileStore::new(dir.path());
            store.initialize().await.unwrap();
            store.save(&saved).await.unwrap();
            store
                .append_vote(saved.id(), vote("sec-1", VoteDecision::Approve))
                .await
                .unwrap();
        }

        let store = FileStore::new(dir.path());
        assert_eq!(store.load(saved.id()).await.unwrap(), Some(saved.clone()));
        let next = store
            .append_vote(saved.id(), vote("sec-2", VoteDecision::Approve))
            .await
            .unwrap();
        assert_eq!(next.sequence, 2);
    }

    #[tokio::test]
    async fn test_file_stores_sharing_a_directory_serialize_votes() {
        let dir = TempDir::new().unwrap();
        // Separate instances share nothing in memory, like two CLI processes
        let stores: Vec<Arc<FileStore>> = (0..2)
            .map(|_| Arc::new(FileStore::new(dir.path())))
            .collect();
        stores[0].initialize().await.unwrap();
        let id = Uuid::new_v4();

        let appends = (0..20).map(|i| {
            let store = stores[i % 2].clone();
            tokio::spawn(async move {
                store
                    .append_vote(id, vote(&format!("agent-{}", i), VoteDecision::Approve))
                    .await
                    .unwrap()
            })
        });
        let results = futures::future::join_all(appends).await;

        let mut sequences: Vec<u64> = results.into_iter().map(|r| r.unwrap().sequence).collect();
        sequences.sort();
        assert_eq!(sequences, (1..=20).collect::<Vec<u64>>());
        assert_eq!(stores[1].votes(id).await.unwrap().len(), 20);
        assert!(!dir.path().join("votes").join(format!("{}.lock", id)).exists());
    }

    #[tokio::test]
    async fn test_file_store_lock_excludes_other_store() {
        let dir = TempDir::new().unwrap();
        let first = Arc::new(FileStore::new(dir.path()));
        let second = Arc::new(FileStore::new(dir.path()));
        let saved = record();
        first.initialize().await.unwrap();
        first.save(&saved).await.unwrap();
        let id = saved.id();

        let held = first.lock(id).await.unwrap();
        assert!(held.is_held());

        // The other store's read-modify-write waits for the hold to drop
        let writer = {
            let second = second.clone();
            tokio::spawn(async move {
                let _lock = second.lock(id).await.unwrap();
                let mut record = second.load(id).await.unwrap().unwrap();
                record.instance.project_id = "from-second".to_string();
                second.save(&record).await.unwrap();
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!writer.is_finished());

        let mut record = first.load(id).await.unwrap().unwrap();
        record.instance.parent_task_id = "from-first".to_string();
        first.save(&record).await.unwrap();
        drop(held);
        writer.await.unwrap();

        // Neither update is lost
        let merged = first.load(id).await.unwrap().unwrap();
        assert_eq!(merged.instance.parent_task_id, "from-first");
        assert_eq!(merged.instance.project_id, "from-second");
        assert!(!dir.path().join("instances").join(format!("{}.lock", id)).exists());
    }

    #[tokio::test]
    async fn test_memory_store_lock_is_a_no_op() {
        let store = MemoryStore::new();
        assert!(!store.lock(Uuid::new_v4()).await.unwrap().is_held());
    }

    #[tokio::test]
    async fn test_concurrent_votes_get_unique_sequences() {
        let store = Arc::new(MemoryStore::new());
        let id = Uuid::new_v4();

        let appends = (0..20).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .append_vote(id, vote(&format!("agent-{}", i), VoteDecision::Approve))
                    .await
                    .unwrap()
            })
        });
        let results = futures::future::join_all(appends).await;

        let mut sequences: Vec<u64> = results.into_iter().map(|r| r.unwrap().sequence).collect();
        sequences.sort();
        assert_eq!(sequences, (1..=20).collect::<Vec<u64>>());
    }
}
