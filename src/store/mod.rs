//! Persistent session log
//!
//! One ordered list of [`EventRecord`]s per session plus a small meta
//! record, with a sliding expiry refreshed on every write.
//!
//! - [`SessionStore`]: the key-value backend seam
//! - [`SqliteStore`]: durable backend
//! - [`MemoryStore`]: in-process backend and degraded fallback
//! - [`SessionLog`]: what the orchestrator talks to; never fails outward

mod error;
mod log;
mod memory;
mod schema;
mod sqlite;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::protocol::EventRecord;
use crate::types::StoreLocation;

pub use error::{StoreError, StoreResult};
pub use log::SessionLog;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Session bookkeeping kept next to the event list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Key-value backend for session logs
///
/// Every write (`touch`, `append`) creates the session if needed and slides
/// its expiry to `now + ttl`. Reads never return expired sessions.
#[async_trait]
pub trait SessionStore: Send + Sync + fmt::Debug {
    /// Short backend name for logs and the status endpoint
    fn backend(&self) -> &'static str;

    /// Create the session record or refresh its expiry
    async fn touch(&self, session_id: &str, ttl: Duration) -> StoreResult<()>;

    /// Meta record of a live session
    async fn meta(&self, session_id: &str) -> StoreResult<Option<SessionMeta>>;

    /// Append one event to the end of the session's log
    async fn append(&self, session_id: &str, record: &EventRecord, ttl: Duration) -> StoreResult<()>;

    /// All events of a live session in append order
    async fn load(&self, session_id: &str) -> StoreResult<Vec<EventRecord>>;

    /// Drop the session's log and meta record
    async fn delete(&self, session_id: &str) -> StoreResult<()>;

    /// Drop every expired session, returning how many were removed
    async fn purge_expired(&self) -> StoreResult<usize>;
}

/// Open the configured backend, falling back to memory if it is unusable
pub fn open_store(location: &StoreLocation) -> (Arc<dyn SessionStore>, bool) {
    match location {
        StoreLocation::Memory => (Arc::new(MemoryStore::new()), false),
        StoreLocation::Sqlite(path) => match SqliteStore::open(path) {
            Ok(store) => (Arc::new(store), false),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Durable store unavailable, sessions will be kept in memory only"
                );
                (Arc::new(MemoryStore::new()), true)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_store_memory() {
        let (store, degraded) = open_store(&StoreLocation::Memory);
        assert_eq!(store.backend(), "memory");
        assert!(!degraded);
    }

    #[test]
    fn test_open_store_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let (store, degraded) =
            open_store(&StoreLocation::Sqlite(dir.path().join("sessions.db")));
        assert_eq!(store.backend(), "sqlite");
        assert!(!degraded);
    }

    #[test]
    fn test_open_store_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let (store, degraded) =
            open_store(&StoreLocation::Sqlite(blocker.join("sessions.db")));
        assert_eq!(store.backend(), "memory");
        assert!(degraded);
    }
}
