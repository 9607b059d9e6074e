// =============================================================================
// State Store - key-value persistence with atomic batch writes
// =============================================================================
//
// The store is the single shared resource across engine instances. Writes go
// through `put_batch` so that a cycle's state, counters, pair records, and
// summary land atomically: either the whole batch is visible or none of it.
//
// The cross-process instance lock lives under a reserved key with a lease
// expiry, so a crashed holder frees the lock after the TTL instead of
// wedging every future start.
//
// FileStore uses the tmp + rename pattern for crash-safe writes.
// =============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Key layout
// ---------------------------------------------------------------------------

pub const KEY_PORTFOLIO: &str = "portfolio/state";
pub const KEY_COUNTERS: &str = "persistence/counters";
const KEY_LOCK: &str = "engine/lock";

pub fn pair_record_key(pair_id: &str) -> String {
    format!("pairs/{pair_id}")
}

pub fn cycle_summary_key(cycle_id: u64) -> String {
    format!("cycles/{cycle_id}/summary")
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Key-value store with atomic batch write and a leased instance lock.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError>;

    /// All entries become visible together or not at all.
    async fn put_batch(&self, entries: Vec<(String, String)>) -> Result<(), EngineError>;

    /// Returns true when the lock is now held by `owner`. Re-acquisition by
    /// the current holder refreshes the lease.
    async fn try_acquire_lock(&self, owner: &str, lease: Duration) -> Result<bool, EngineError>;

    /// Extend the lease; false when the lock is no longer ours.
    async fn renew_lock(&self, owner: &str, lease: Duration) -> Result<bool, EngineError>;

    /// Release only if held by `owner`; releasing a foreign lock is a no-op.
    async fn release_lock(&self, owner: &str) -> Result<(), EngineError>;
}

/// Acquire the instance lock or fail with a typed error (startup gate).
pub async fn acquire_instance_lock(
    store: &dyn StateStore,
    owner: &str,
    lease: Duration,
) -> Result<(), EngineError> {
    if store.try_acquire_lock(owner, lease).await? {
        Ok(())
    } else {
        Err(EngineError::LockUnavailable(
            "another engine instance holds the cycle lock".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// Shared lock arbitration over whatever map the backend just read.
fn lock_decision(
    existing: Option<LockRecord>,
    owner: &str,
    lease: Duration,
    now: DateTime<Utc>,
) -> (bool, Option<LockRecord>) {
    let expires_at = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
    match existing {
        Some(record) if record.owner != owner && record.expires_at > now => {
            debug!(holder = %record.owner, "instance lock held by another owner");
            (false, None)
        }
        Some(record) if record.owner != owner => {
            warn!(
                stale_holder = %record.owner,
                expired_at = %record.expires_at,
                "taking over expired instance lock"
            );
            (true, Some(LockRecord { owner: owner.to_string(), expires_at }))
        }
        _ => (true, Some(LockRecord { owner: owner.to_string(), expires_at })),
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory backend for tests and demo runs.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.map.lock().get(key).cloned())
    }

    async fn put_batch(&self, entries: Vec<(String, String)>) -> Result<(), EngineError> {
        let mut map = self.map.lock();
        for (key, value) in entries {
            map.insert(key, value);
        }
        Ok(())
    }

    async fn try_acquire_lock(&self, owner: &str, lease: Duration) -> Result<bool, EngineError> {
        let mut map = self.map.lock();
        let existing = map
            .get(KEY_LOCK)
            .and_then(|raw| serde_json::from_str::<LockRecord>(raw).ok());
        let (acquired, record) = lock_decision(existing, owner, lease, Utc::now());
        if let Some(record) = record {
            map.insert(
                KEY_LOCK.to_string(),
                serde_json::to_string(&record).map_err(|e| EngineError::Store(e.to_string()))?,
            );
        }
        Ok(acquired)
    }

    async fn renew_lock(&self, owner: &str, lease: Duration) -> Result<bool, EngineError> {
        self.try_acquire_lock(owner, lease).await
    }

    async fn release_lock(&self, owner: &str) -> Result<(), EngineError> {
        let mut map = self.map.lock();
        let held_by_us = map
            .get(KEY_LOCK)
            .and_then(|raw| serde_json::from_str::<LockRecord>(raw).ok())
            .map(|record| record.owner == owner)
            .unwrap_or(false);
        if held_by_us {
            map.remove(KEY_LOCK);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Single-file JSON backend. Every operation re-reads the file so that the
/// lock record is visible across processes; every write is tmp + rename.
pub struct FileStore {
    path: PathBuf,
    /// Serializes read-modify-write sequences within this process.
    write_guard: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    fn load_map(&self) -> Result<BTreeMap<String, String>, EngineError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| EngineError::Store(format!("corrupt state file {}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(EngineError::Store(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(map)
            .map_err(|e| EngineError::Store(e.to_string()))?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &content).map_err(|e| {
            EngineError::Store(format!("failed to write {}: {e}", tmp_path.display()))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            EngineError::Store(format!("failed to rename into {}: {e}", self.path.display()))
        })?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.load_map()?.get(key).cloned())
    }

    async fn put_batch(&self, entries: Vec<(String, String)>) -> Result<(), EngineError> {
        let _guard = self.write_guard.lock();
        let mut map = self.load_map()?;
        for (key, value) in entries {
            map.insert(key, value);
        }
        self.write_map(&map)
    }

    async fn try_acquire_lock(&self, owner: &str, lease: Duration) -> Result<bool, EngineError> {
        let _guard = self.write_guard.lock();
        let mut map = self.load_map()?;
        let existing = map
            .get(KEY_LOCK)
            .and_then(|raw| serde_json::from_str::<LockRecord>(raw).ok());
        let (acquired, record) = lock_decision(existing, owner, lease, Utc::now());
        if let Some(record) = record {
            map.insert(
                KEY_LOCK.to_string(),
                serde_json::to_string(&record).map_err(|e| EngineError::Store(e.to_string()))?,
            );
            self.write_map(&map)?;
            info!(owner, path = %self.path.display(), "instance lock written");
        }
        Ok(acquired)
    }

    async fn renew_lock(&self, owner: &str, lease: Duration) -> Result<bool, EngineError> {
        self.try_acquire_lock(owner, lease).await
    }

    async fn release_lock(&self, owner: &str) -> Result<(), EngineError> {
        let _guard = self.write_guard.lock();
        let mut map = self.load_map()?;
        let held_by_us = map
            .get(KEY_LOCK)
            .and_then(|raw| serde_json::from_str::<LockRecord>(raw).ok())
            .map(|record| record.owner == owner)
            .unwrap_or(false);
        if held_by_us {
            map.remove(KEY_LOCK);
            self.write_map(&map)?;
            info!(owner, "instance lock released");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_write_and_read_back() {
        let store = MemoryStore::new();
        store
            .put_batch(vec![
                (KEY_PORTFOLIO.to_string(), "{}".to_string()),
                (pair_record_key("abc"), "{\"id\":\"abc\"}".to_string()),
            ])
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
        assert_eq!(store.get(KEY_PORTFOLIO).await.unwrap().unwrap(), "{}");
        assert!(store.get(&pair_record_key("abc")).await.unwrap().is_some());
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_excludes_second_owner() {
        let store = MemoryStore::new();
        let lease = Duration::from_secs(60);

        acquire_instance_lock(&store, "a", lease).await.unwrap();
        assert!(matches!(
            acquire_instance_lock(&store, "b", lease).await,
            Err(EngineError::LockUnavailable(_))
        ));
        assert!(!store.try_acquire_lock("b", lease).await.unwrap());

        // Holder refreshes freely.
        assert!(store.renew_lock("a", lease).await.unwrap());

        store.release_lock("a").await.unwrap();
        assert!(store.try_acquire_lock("b", lease).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = MemoryStore::new();
        assert!(store
            .try_acquire_lock("a", Duration::from_secs(0))
            .await
            .unwrap());
        // Zero-length lease expires immediately.
        assert!(store
            .try_acquire_lock("b", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn release_of_foreign_lock_is_noop() {
        let store = MemoryStore::new();
        let lease = Duration::from_secs(60);
        assert!(store.try_acquire_lock("a", lease).await.unwrap());
        store.release_lock("b").await.unwrap();
        assert!(!store.try_acquire_lock("b", lease).await.unwrap());
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("meridian-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = FileStore::new(dir.join("state.json"));

        store
            .put_batch(vec![(KEY_COUNTERS.to_string(), "{\"p\":2}".to_string())])
            .await
            .unwrap();
        assert_eq!(
            store.get(KEY_COUNTERS).await.unwrap().unwrap(),
            "{\"p\":2}"
        );

        // A second handle over the same file sees the data.
        let store2 = FileStore::new(dir.join("state.json"));
        assert!(store2.get(KEY_COUNTERS).await.unwrap().is_some());

        std::fs::remove_dir_all(&dir).ok();
    }
}
