//! Session registry
//!
//! Uses DashMap for concurrent access with entry API to avoid deadlocks.
//! Map operations never span an await; engine I/O happens on the
//! orchestrators, outside any map guard.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::orchestrator::{Orchestrator, SessionDeps, new_session_id};
use crate::protocol::ServerEvent;
use crate::store::SessionLog;

/// Resolve-and-bind attempts before a connection gives up
const BIND_ATTEMPTS: usize = 3;

/// Live orchestrators keyed by session identifier
pub type SessionMap = DashMap<String, Orchestrator>;

#[derive(Debug)]
struct RegistryShared {
    sessions: Arc<SessionMap>,
    deps: SessionDeps,
    reconnect_grace: Duration,
}

/// Process-wide directory of live sessions
///
/// Cheap to clone; clones share the same map.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

impl SessionRegistry {
    /// Create an empty registry
    ///
    /// # Arguments
    ///
    /// * `deps` - Collaborators handed to every orchestrator
    /// * `reconnect_grace` - How long a detached session stays registered
    pub fn new(deps: SessionDeps, reconnect_grace: Duration) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                sessions: Arc::new(DashMap::new()),
                deps,
                reconnect_grace,
            }),
        }
    }

    /// Resolve the orchestrator for a connecting client
    ///
    /// Returns the live orchestrator if there is one, restores a session
    /// still present in the durable log, and otherwise mints a new
    /// identifier. Callers read the resolved identifier from the result.
    pub async fn get_or_create(&self, requested: Option<&str>) -> Orchestrator {
        let log = &self.shared.deps.log;

        if let Some(id) = requested.map(str::trim).filter(|id| !id.is_empty()) {
            if let Some(existing) = self.get(id).filter(|o| !o.is_closed()) {
                tracing::debug!(session_id = %id, "Rejoining live session");
                return existing;
            }
            if log.meta(id).await.is_some() {
                log.open(id).await;
                tracing::info!(session_id = %id, "Restoring session from the log");
                return self.insert_or_existing(id.to_string());
            }
            tracing::info!(
                requested_session_id = %id,
                "Unknown or expired session, minting a new identifier"
            );
        }

        let id = new_session_id();
        log.open(&id).await;
        tracing::info!(session_id = %id, "New session");
        self.insert_or_existing(id)
    }

    /// Resolve a session and bind a connection's outbound queue to it
    ///
    /// An orchestrator evicted between resolving and binding refuses the
    /// attach; the session is then resolved again, which restores it from
    /// the log under the same identifier.
    pub async fn connect(
        &self,
        requested: Option<&str>,
        tx: mpsc::Sender<ServerEvent>,
    ) -> Option<(Orchestrator, u64)> {
        for attempt in 1..=BIND_ATTEMPTS {
            let orchestrator = self.get_or_create(requested).await;
            if let Some(binding) = orchestrator.attach(tx.clone()).await {
                return Some((orchestrator, binding));
            }
            tracing::debug!(
                session_id = %orchestrator.session_id(),
                attempt,
                "Session closed before the connection bound, resolving again"
            );
        }
        None
    }

    fn insert_or_existing(&self, session_id: String) -> Orchestrator {
        match self.shared.sessions.entry(session_id) {
            dashmap::Entry::Occupied(mut occupied) => {
                if !occupied.get().is_closed() {
                    return occupied.get().clone();
                }
                let orchestrator = self.spawn_orchestrator(occupied.key().clone());
                occupied.insert(orchestrator.clone());
                orchestrator
            }
            dashmap::Entry::Vacant(vacant) => {
                let orchestrator = self.spawn_orchestrator(vacant.key().clone());
                vacant.insert(orchestrator.clone());
                orchestrator
            }
        }
    }

    fn spawn_orchestrator(&self, session_id: String) -> Orchestrator {
        Orchestrator::with_registry(
            session_id,
            self.shared.deps.clone(),
            Arc::downgrade(&self.shared.sessions),
        )
    }

    /// Get a live session
    pub fn get(&self, session_id: &str) -> Option<Orchestrator> {
        self.shared.sessions.get(session_id).map(|r| r.value().clone())
    }

    /// Tear a session down and forget it; its durable log is kept
    pub async fn remove(&self, session_id: &str) -> bool {
        let Some((_, orchestrator)) = self.shared.sessions.remove(session_id) else {
            return false;
        };
        orchestrator.shutdown().await;
        true
    }

    /// Release a connection's binding
    ///
    /// Without a reconnect grace the session is removed right away;
    /// otherwise it is removed once the grace elapses, unless a connection
    /// attached in the meantime.
    pub async fn release(&self, orchestrator: &Orchestrator, binding: u64) {
        if !orchestrator.detach(binding) {
            // A newer connection owns the session now
            return;
        }
        let generation = orchestrator.binding_generation();
        let grace = self.shared.reconnect_grace;

        if grace.is_zero() {
            self.evict(orchestrator, generation).await;
            return;
        }

        tracing::debug!(
            session_id = %orchestrator.session_id(),
            grace_secs = grace.as_secs(),
            "Connection released, waiting for reconnect"
        );
        let registry = self.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.evict(&orchestrator, generation).await;
        });
    }

    /// Close and forget the session unless a connection bound since
    /// `generation`
    ///
    /// Closing first means a connection that resolved this orchestrator
    /// just before can no longer bind to it.
    async fn evict(&self, orchestrator: &Orchestrator, generation: u64) {
        if !orchestrator.close_if_unattached(generation) {
            return;
        }
        let session_id = orchestrator.session_id();
        self.shared
            .sessions
            .remove_if(&session_id, |_, live| live.same_as(orchestrator));
        tracing::info!(session_id = %session_id, "Session evicted");
        orchestrator.shutdown().await;
    }

    /// Check if a session is live
    pub fn has_session(&self, session_id: &str) -> bool {
        self.shared.sessions.contains_key(session_id)
    }

    /// Get the number of live sessions
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Get all live session IDs
    pub fn session_ids(&self) -> Vec<String> {
        self.shared
            .sessions
            .iter()
            .map(|r| r.key().clone())
            .collect()
    }

    /// Durable log shared by every session
    pub fn log(&self) -> &SessionLog {
        &self.shared.deps.log
    }

    /// Tear down every live session
    pub async fn shutdown_all(&self) {
        let ids = self.session_ids();
        tracing::info!(sessions = ids.len(), "Shutting down all sessions");
        for id in ids {
            self.remove(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::engine::scripted::ScriptedConnector;
    use crate::protocol::{StatusKind, UserMessage};
    use crate::session::AgentSessionState;
    use crate::store::MemoryStore;
    use crate::types::{DEFAULT_RETENTION, OrchestratorSettings};

    fn test_registry(grace: Duration) -> SessionRegistry {
        let deps = SessionDeps {
            log: SessionLog::new(Arc::new(MemoryStore::new()), DEFAULT_RETENTION),
            connector: Arc::new(ScriptedConnector::new()),
            engine: EngineOptions::default(),
            settings: OrchestratorSettings::default(),
        };
        SessionRegistry::new(deps, grace)
    }

    #[tokio::test]
    async fn test_registry_new() {
        let registry = test_registry(Duration::ZERO);
        assert_eq!(registry.session_count(), 0);
        assert!(registry.session_ids().is_empty());
    }

    #[tokio::test]
    async fn test_registry_mints_id() {
        let registry = test_registry(Duration::ZERO);
        let orchestrator = registry.get_or_create(None).await;
        let id = orchestrator.session_id();

        assert!(!id.is_empty());
        assert!(registry.has_session(&id));
        assert!(registry.log().meta(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_registry_reuses_live_session() {
        let registry = test_registry(Duration::ZERO);
        let first = registry.get_or_create(None).await;
        let id = first.session_id();

        let second = registry.get_or_create(Some(&id)).await;
        assert!(second.same_as(&first));
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_restores_from_log() {
        let registry = test_registry(Duration::ZERO);
        registry.log().open("persisted").await;

        let orchestrator = registry.get_or_create(Some("persisted")).await;
        assert_eq!(orchestrator.session_id(), "persisted");
        assert!(registry.has_session("persisted"));
    }

    #[tokio::test]
    async fn test_registry_unknown_id_mints_new() {
        let registry = test_registry(Duration::ZERO);
        let orchestrator = registry.get_or_create(Some("never-seen")).await;

        assert_ne!(orchestrator.session_id(), "never-seen");
        assert!(!registry.has_session("never-seen"));
    }

    #[tokio::test]
    async fn test_registry_release_without_grace_removes() {
        let registry = test_registry(Duration::ZERO);
        let orchestrator = registry.get_or_create(None).await;
        let id = orchestrator.session_id();

        let (tx, _rx) = mpsc::channel(8);
        let binding = orchestrator.attach(tx).await.unwrap();
        registry.release(&orchestrator, binding).await;

        assert!(!registry.has_session(&id));
        // The durable log outlives the in-memory entry
        assert!(registry.log().meta(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_registry_stale_release_is_ignored() {
        let registry = test_registry(Duration::ZERO);
        let orchestrator = registry.get_or_create(None).await;
        let id = orchestrator.session_id();

        let (old_tx, _old_rx) = mpsc::channel(8);
        let old = orchestrator.attach(old_tx).await.unwrap();
        let (new_tx, _new_rx) = mpsc::channel(8);
        orchestrator.attach(new_tx).await.unwrap();

        registry.release(&orchestrator, old).await;
        assert!(registry.has_session(&id));
        assert!(orchestrator.is_attached());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_reconnect_within_grace() {
        let registry = test_registry(Duration::from_secs(30));
        let orchestrator = registry.get_or_create(None).await;
        let id = orchestrator.session_id();

        let (tx, _rx) = mpsc::channel(8);
        let binding = orchestrator.attach(tx).await.unwrap();
        registry.release(&orchestrator, binding).await;
        assert!(registry.has_session(&id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let rejoined = registry.get_or_create(Some(&id)).await;
        let (tx, mut rx) = mpsc::channel(8);
        rejoined.attach(tx).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::status_for(StatusKind::Connected, id.clone()))
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.has_session(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_evicts_after_grace() {
        let registry = test_registry(Duration::from_secs(30));
        let orchestrator = registry.get_or_create(None).await;
        let id = orchestrator.session_id();

        let (tx, _rx) = mpsc::channel(8);
        let binding = orchestrator.attach(tx).await.unwrap();
        registry.release(&orchestrator, binding).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!registry.has_session(&id));
    }

    #[tokio::test]
    async fn test_registry_release_between_resolve_and_bind() {
        let registry = test_registry(Duration::ZERO);
        let first = registry.get_or_create(None).await;
        let id = first.session_id();
        let (tx_a, _rx_a) = mpsc::channel(8);
        let binding_a = first.attach(tx_a).await.unwrap();

        // A reconnect resolves the live orchestrator, then the old
        // connection's release evicts it before the new one binds
        let second = registry.get_or_create(Some(&id)).await;
        assert!(second.same_as(&first));
        registry.release(&first, binding_a).await;
        assert!(second.is_closed());

        let (tx_b, mut rx_b) = mpsc::channel(8);
        assert!(second.attach(tx_b.clone()).await.is_none());
        assert!(rx_b.try_recv().is_err());

        let (restored, _) = registry.connect(Some(&id), tx_b).await.unwrap();
        assert!(!restored.same_as(&first));
        assert_eq!(restored.session_id(), id);
        assert!(registry.has_session(&id));
        assert_eq!(
            rx_b.recv().await,
            Some(ServerEvent::status_for(StatusKind::Connected, id.clone()))
        );

        restored
            .handle_user_message(UserMessage::text("hello"))
            .await;
        assert_eq!(restored.state(), AgentSessionState::Thinking);
        assert_eq!(rx_b.recv().await, Some(ServerEvent::status(StatusKind::Thinking)));
    }

    #[tokio::test]
    async fn test_registry_eviction_skips_rebound_session() {
        let registry = test_registry(Duration::ZERO);
        let orchestrator = registry.get_or_create(None).await;
        let id = orchestrator.session_id();

        let (tx, _rx) = mpsc::channel(8);
        let binding = orchestrator.attach(tx).await.unwrap();
        let generation = orchestrator.binding_generation();
        assert!(orchestrator.detach(binding));

        // A connection bound after the release was decided
        let (tx, _rx) = mpsc::channel(8);
        let (rebound, _) = registry.connect(Some(&id), tx).await.unwrap();
        assert!(rebound.same_as(&orchestrator));

        registry.evict(&orchestrator, generation).await;
        assert!(!orchestrator.is_closed());
        assert!(registry.has_session(&id));
    }

    #[tokio::test]
    async fn test_registry_follows_clear_session() {
        let registry = test_registry(Duration::ZERO);
        let orchestrator = registry.get_or_create(None).await;
        let old_id = orchestrator.session_id();

        let new_id = orchestrator.handle_clear_session().await;
        assert!(!registry.has_session(&old_id));
        assert!(registry.get(&new_id).is_some_and(|o| o.same_as(&orchestrator)));
    }

    #[tokio::test]
    async fn test_registry_remove_and_shutdown_all() {
        let registry = test_registry(Duration::ZERO);
        let first = registry.get_or_create(None).await;
        registry.get_or_create(None).await;
        assert_eq!(registry.session_count(), 2);

        assert!(registry.remove(&first.session_id()).await);
        assert!(!registry.remove(&first.session_id()).await);
        assert_eq!(registry.session_count(), 1);

        registry.shutdown_all().await;
        assert_eq!(registry.session_count(), 0);
    }
}
