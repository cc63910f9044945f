//! Orchestrator-facing session log
//!
//! Wraps a [`SessionStore`] and absorbs its failures: a store outage marks
//! the log degraded and is logged, but never interrupts a session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{SessionMeta, SessionStore, StoreError};
use crate::protocol::EventRecord;

/// Session log handle shared by all orchestrators
#[derive(Debug, Clone)]
pub struct SessionLog {
    store: Arc<dyn SessionStore>,
    retention: Duration,
    degraded: Arc<AtomicBool>,
    fallback: bool,
}

impl SessionLog {
    /// Wrap a store with the given sliding retention window
    pub fn new(store: Arc<dyn SessionStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            degraded: Arc::new(AtomicBool::new(false)),
            fallback: false,
        }
    }

    /// Mark the log as a stand-in for a store that could not be opened
    pub fn degraded_from_start(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Whether history is at risk: running on a fallback store, or the last
    /// store operation failed
    pub fn is_degraded(&self) -> bool {
        self.fallback || self.degraded.load(Ordering::SeqCst)
    }

    /// Backend name
    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Retention window
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Create or refresh the session's meta record
    pub async fn open(&self, session_id: &str) {
        let result = self.store.touch(session_id, self.retention).await;
        self.observe("touch", session_id, result);
    }

    /// Meta record of a live session, `None` if unknown, expired or unreadable
    pub async fn meta(&self, session_id: &str) -> Option<SessionMeta> {
        let result = self.store.meta(session_id).await;
        self.observe("meta", session_id, result).flatten()
    }

    /// Append one record; returns false if the record could not be stored
    pub async fn append(&self, session_id: &str, record: &EventRecord) -> bool {
        let result = self.store.append(session_id, record, self.retention).await;
        self.observe("append", session_id, result).is_some()
    }

    /// Full history in append order; empty if unavailable
    pub async fn history(&self, session_id: &str) -> Vec<EventRecord> {
        let result = self.store.load(session_id).await;
        self.observe("load", session_id, result).unwrap_or_default()
    }

    /// Drop the session's durable log
    pub async fn discard(&self, session_id: &str) {
        let result = self.store.delete(session_id).await;
        self.observe("delete", session_id, result);
    }

    /// Purge expired sessions; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        let result = self.store.purge_expired().await;
        self.observe("purge", "*", result).unwrap_or(0)
    }

    fn observe<T>(
        &self,
        operation: &'static str,
        session_id: &str,
        result: Result<T, StoreError>,
    ) -> Option<T> {
        match result {
            Ok(value) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    tracing::info!(
                        backend = self.store.backend(),
                        operation,
                        "Durable store recovered"
                    );
                }
                Some(value)
            }
            Err(e) => {
                if self.degraded.swap(true, Ordering::SeqCst) {
                    tracing::debug!(
                        session_id = %session_id,
                        operation,
                        error = %e,
                        "Durable store still unavailable"
                    );
                } else {
                    tracing::warn!(
                        session_id = %session_id,
                        backend = self.store.backend(),
                        operation,
                        error = %e,
                        "Durable store unavailable, continuing in memory only"
                    );
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Store that fails every call while `down` is set
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn check(&self) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        fn backend(&self) -> &'static str {
            "flaky"
        }
        async fn touch(&self, session_id: &str, ttl: Duration) -> StoreResult<()> {
            self.check()?;
            self.inner.touch(session_id, ttl).await
        }
        async fn meta(&self, session_id: &str) -> StoreResult<Option<SessionMeta>> {
            self.check()?;
            self.inner.meta(session_id).await
        }
        async fn append(&self, session_id: &str, record: &EventRecord, ttl: Duration) -> StoreResult<()> {
            self.check()?;
            self.inner.append(session_id, record, ttl).await
        }
        async fn load(&self, session_id: &str) -> StoreResult<Vec<EventRecord>> {
            self.check()?;
            self.inner.load(session_id).await
        }
        async fn delete(&self, session_id: &str) -> StoreResult<()> {
            self.check()?;
            self.inner.delete(session_id).await
        }
        async fn purge_expired(&self) -> StoreResult<usize> {
            self.check()?;
            self.inner.purge_expired().await
        }
    }

    fn record() -> EventRecord {
        EventRecord::new("assistant_text", json!({"text": "hello"}))
    }

    #[tokio::test]
    async fn test_log_round_trip() {
        let log = SessionLog::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        log.open("s1").await;
        assert!(log.meta("s1").await.is_some());
        assert!(log.append("s1", &record()).await);
        assert_eq!(log.history("s1").await.len(), 1);

        log.discard("s1").await;
        assert!(log.history("s1").await.is_empty());
        assert!(log.meta("s1").await.is_none());
        assert!(!log.is_degraded());
    }

    #[tokio::test]
    async fn test_log_degrades_and_recovers() {
        let store = Arc::new(FlakyStore::default());
        let log = SessionLog::new(store.clone(), Duration::from_secs(60));

        store.down.store(true, Ordering::SeqCst);
        assert!(!log.append("s1", &record()).await);
        assert!(log.is_degraded());
        assert!(log.history("s1").await.is_empty());
        assert!(log.meta("s1").await.is_none());
        assert_eq!(log.purge_expired().await, 0);

        store.down.store(false, Ordering::SeqCst);
        assert!(log.append("s1", &record()).await);
        assert!(!log.is_degraded());
        assert_eq!(log.history("s1").await.len(), 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_degraded_from_start() {
        let log = SessionLog::new(Arc::new(MemoryStore::new()), Duration::from_secs(1))
            .degraded_from_start();
        assert!(log.is_degraded());
        log.open("s1").await;
        assert!(log.is_degraded());
        assert_eq!(log.backend(), "memory");
        assert_eq!(log.retention(), Duration::from_secs(1));
    }
}
