//! SQLite-backed session store

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::info;

use super::error::{StoreError, StoreResult};
use super::schema;
use super::{SessionMeta, SessionStore};
use crate::protocol::EventRecord;

/// Session store over one SQLite connection.
///
/// rusqlite is synchronous, so every operation runs on the blocking pool
/// behind a parking_lot mutex.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init(&conn)?;

        info!(path = %path.display(), "session store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    fn init(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )
            .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_after(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// Remove a session whose window has lapsed but which has not been purged yet,
/// so that a late write starts a fresh log instead of reviving the old one.
fn drop_if_expired(tx: &Transaction<'_>, session_id: &str, now: i64) -> StoreResult<()> {
    let expired: bool = tx
        .query_row(
            "SELECT expires_at <= ?2 FROM sessions WHERE id = ?1",
            params![session_id, now],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(false);

    if expired {
        tx.execute(
            "DELETE FROM session_events WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
    }
    Ok(())
}

fn upsert_session(tx: &Transaction<'_>, session_id: &str, ttl: Duration) -> StoreResult<()> {
    let now = now_millis();
    drop_if_expired(tx, session_id, now)?;

    let stamp = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO sessions (id, created_at, last_active, expires_at)
         VALUES (?1, ?2, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
             last_active = excluded.last_active,
             expires_at = excluded.expires_at",
        params![session_id, stamp, expiry_after(now, ttl)],
    )?;
    Ok(())
}

fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("timestamp {raw}: {e}")))
}

#[async_trait]
impl SessionStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn touch(&self, session_id: &str, ttl: Duration) -> StoreResult<()> {
        let session_id = session_id.to_owned();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            upsert_session(&tx, &session_id, ttl)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn meta(&self, session_id: &str) -> StoreResult<Option<SessionMeta>> {
        let session_id = session_id.to_owned();
        self.run(move |conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT created_at, last_active FROM sessions
                     WHERE id = ?1 AND expires_at > ?2",
                    params![session_id, now_millis()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            row.map(|(created_at, last_active)| {
                Ok(SessionMeta {
                    created_at: parse_time(&created_at)?,
                    last_active: parse_time(&last_active)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn append(&self, session_id: &str, record: &EventRecord, ttl: Duration) -> StoreResult<()> {
        let session_id = session_id.to_owned();
        let payload = serde_json::to_string(record)?;
        self.run(move |conn| {
            let tx = conn.transaction()?;
            upsert_session(&tx, &session_id, ttl)?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM session_events WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO session_events (session_id, seq, payload) VALUES (?1, ?2, ?3)",
                params![session_id, seq, payload],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load(&self, session_id: &str) -> StoreResult<Vec<EventRecord>> {
        let session_id = session_id.to_owned();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT e.seq, e.payload FROM session_events e
                 JOIN sessions s ON s.id = e.session_id
                 WHERE e.session_id = ?1 AND s.expires_at > ?2
                 ORDER BY e.seq",
            )?;
            let rows = stmt
                .query_map(params![session_id, now_millis()], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut records = Vec::with_capacity(rows.len());
            for (seq, payload) in rows {
                match serde_json::from_str::<EventRecord>(&payload) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!(
                        session_id = %session_id,
                        seq,
                        error = %e,
                        "Skipping unreadable session event"
                    ),
                }
            }
            Ok(records)
        })
        .await
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        let session_id = session_id.to_owned();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM session_events WHERE session_id = ?1",
                params![session_id],
            )?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        self.run(|conn| {
            let now = now_millis();
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM session_events WHERE session_id IN
                     (SELECT id FROM sessions WHERE expires_at <= ?1)",
                params![now],
            )?;
            let removed = tx.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    fn record(kind: &str, n: u64) -> EventRecord {
        EventRecord::new(kind, json!({ "n": n }))
    }

    #[test]
    fn test_open_in_memory() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.path(), Path::new(":memory:"));
    }

    #[test]
    fn test_open_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.db");
        let store = SqliteStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), path.as_path());

        // Reopening keeps a single schema version row.
        drop(store);
        let store = SqliteStore::open(&path).unwrap();
        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_append_and_load_preserves_order() {
        let store = SqliteStore::in_memory().unwrap();
        for n in 0..5 {
            store.append("s1", &record("assistant_text", n), HOUR).await.unwrap();
        }
        store.append("s2", &record("error", 99), HOUR).await.unwrap();

        let loaded = store.load("s1").await.unwrap();
        let ns: Vec<u64> = loaded.iter().map(|r| r.data["n"].as_u64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
        assert_eq!(store.load("s2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_meta_and_touch() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.meta("s1").await.unwrap().is_none());

        store.touch("s1", HOUR).await.unwrap();
        let first = store.meta("s1").await.unwrap().unwrap();

        store.touch("s1", HOUR).await.unwrap();
        let second = store.meta("s1").await.unwrap().unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.last_active >= first.last_active);
        assert!(store.load("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_session_is_invisible() {
        let store = SqliteStore::in_memory().unwrap();
        store.append("s1", &record("assistant_text", 1), Duration::ZERO).await.unwrap();

        assert!(store.meta("s1").await.unwrap().is_none());
        assert!(store.load("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_after_expiry_starts_fresh_log() {
        let store = SqliteStore::in_memory().unwrap();
        store.append("s1", &record("assistant_text", 1), Duration::ZERO).await.unwrap();
        store.append("s1", &record("assistant_text", 2), HOUR).await.unwrap();

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].data["n"], 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SqliteStore::in_memory().unwrap();
        store.append("s1", &record("assistant_text", 1), HOUR).await.unwrap();
        store.delete("s1").await.unwrap();

        assert!(store.meta("s1").await.unwrap().is_none());
        assert!(store.load("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = SqliteStore::in_memory().unwrap();
        store.append("old", &record("assistant_text", 1), Duration::ZERO).await.unwrap();
        store.append("live", &record("assistant_text", 2), HOUR).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert_eq!(store.load("live").await.unwrap().len(), 1);

        let orphans: i64 = store
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM session_events WHERE session_id = 'old'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }
}
