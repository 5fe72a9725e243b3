use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, params};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};

/// Narrow durable key-value interface shared by the agent runtime (instance
/// and queue persistence) and the rate limiter (counter persistence).
///
/// Keys are logically partitioned by owner (`agent:{identity}`,
/// `ratelimit:{source}:{identifier}`) so no two components ever contend for
/// the same key.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value, optionally expiring after `ttl_secs`.
    async fn put(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys under a prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SQLite-backed store. One connection behind a mutex; callers already
/// partition keys, so the coarse lock is not a contention point.
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Connection::open(path.as_ref())?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at_ms INTEGER
            )",
            [],
        )?;
        info!("KV store opened at {:?}", path.as_ref());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Remove every expired row. Expired entries are also filtered lazily on
    /// read, so this sweep only bounds disk growth.
    pub async fn purge_expired(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let purged = db.execute(
            "DELETE FROM kv_entries WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![now_ms()],
        )?;
        Ok(purged)
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT value, expires_at_ms FROM kv_entries WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<i64>>(1)?))
        })?;

        match rows.next() {
            Some(row) => {
                let (value, expires_at_ms) = row?;
                if let Some(deadline) = expires_at_ms {
                    if deadline <= now_ms() {
                        drop(rows);
                        drop(stmt);
                        db.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
                        return Ok(None);
                    }
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        let expires_at_ms = ttl_secs.map(|ttl| now_ms() + ttl as i64 * 1000);
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO kv_entries (key, value, expires_at_ms) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at_ms],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = db.prepare(
            "SELECT key FROM kv_entries
             WHERE key LIKE ?1 ESCAPE '\\'
               AND (expires_at_ms IS NULL OR expires_at_ms > ?2)
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![pattern, now_ms()], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

/// In-memory store used by unit tests and as a stand-in when durability is
/// not wanted. Honors TTLs the same way the SQLite store does.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<i64>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, Some(deadline))) if *deadline <= now_ms() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        let expires_at_ms = ttl_secs.map(|ttl| now_ms() + ttl as i64 * 1000);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_vec(), expires_at_ms));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let now = now_ms();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, (_, deadline))| {
                key.starts_with(prefix) && deadline.map_or(true, |d| d > now)
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Helper used across the runtime: fetch and JSON-decode a stored record.
pub async fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Storage(format!("corrupt record at {key}: {e}")))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// JSON-encode and store a record.
pub async fn put_json<T: serde::Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl_secs: Option<u64>,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Error::Storage(format!("encode failure at {key}: {e}")))?;
    store.put(key, &bytes, ttl_secs).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("kv.db")).unwrap();

        store.put("agent:a:instance", b"hello", None).await.unwrap();
        assert_eq!(
            store.get("agent:a:instance").await.unwrap(),
            Some(b"hello".to_vec())
        );

        store.delete("agent:a:instance").await.unwrap();
        assert_eq!(store.get("agent:a:instance").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_list_is_prefix_scoped_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("kv.db")).unwrap();

        store.put("agent:b:tasks", b"1", None).await.unwrap();
        store.put("agent:a:tasks", b"1", None).await.unwrap();
        store.put("ratelimit:github:x", b"1", None).await.unwrap();

        let keys = store.list("agent:").await.unwrap();
        assert_eq!(keys, vec!["agent:a:tasks", "agent:b:tasks"]);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_purgeable() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("kv.db")).unwrap();

        store.put("ratelimit:k", b"1", Some(0)).await.unwrap();
        assert_eq!(store.get("ratelimit:k").await.unwrap(), None);

        store.put("ratelimit:k2", b"1", Some(0)).await.unwrap();
        store.put("keep", b"1", None).await.unwrap();
        let purged = store.purge_expired().await.unwrap();
        assert!(purged >= 1);
        assert_eq!(store.get("keep").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn memory_store_honors_ttl() {
        let store = MemoryStore::new();
        store.put("k", b"v", Some(0)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.put("k", b"v", Some(3600)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let store = MemoryStore::new();
        put_json(&store, "agent:a:instance", &vec![1u32, 2, 3], None)
            .await
            .unwrap();
        let back: Option<Vec<u32>> = get_json(&store, "agent:a:instance").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }
}
