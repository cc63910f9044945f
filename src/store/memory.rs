//! In-process session store
//!
//! Used when no durable store is configured, and as the fallback when the
//! configured one cannot be opened. Nothing survives a restart.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;

use super::error::StoreResult;
use super::{SessionMeta, SessionStore};
use crate::protocol::EventRecord;

#[derive(Debug)]
struct Entry {
    meta: SessionMeta,
    events: Vec<EventRecord>,
    expires_at: Instant,
}

impl Entry {
    fn fresh(ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            meta: SessionMeta {
                created_at: now,
                last_active: now,
            },
            events: Vec::new(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    fn refresh(&mut self, ttl: Duration) {
        self.meta.last_active = Utc::now();
        self.expires_at = Instant::now() + ttl;
    }
}

/// DashMap-backed store with the same sliding expiry as the SQLite store
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: DashMap<String, Entry>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn write<F>(&self, session_id: &str, ttl: Duration, f: F)
    where
        F: FnOnce(&mut Entry),
    {
        let now = Instant::now();
        let mut entry = self
            .sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| Entry::fresh(ttl));
        if entry.is_expired(now) {
            *entry = Entry::fresh(ttl);
        }
        entry.refresh(ttl);
        f(&mut *entry);
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn touch(&self, session_id: &str, ttl: Duration) -> StoreResult<()> {
        self.write(session_id, ttl, |_| {});
        Ok(())
    }

    async fn meta(&self, session_id: &str) -> StoreResult<Option<SessionMeta>> {
        let now = Instant::now();
        Ok(self
            .sessions
            .get(session_id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.meta.clone()))
    }

    async fn append(&self, session_id: &str, record: &EventRecord, ttl: Duration) -> StoreResult<()> {
        self.write(session_id, ttl, |entry| entry.events.push(record.clone()));
        Ok(())
    }

    async fn load(&self, session_id: &str) -> StoreResult<Vec<EventRecord>> {
        let now = Instant::now();
        Ok(self
            .sessions
            .get(session_id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.events.clone())
            .unwrap_or_default())
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.sessions.len()))
    }
}
