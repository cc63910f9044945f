//! Engine client lifecycle
//!
//! `disconnected -> connecting -> connected -> (error) -> disconnected`.
//! Each connect attempt gets a generation number; a completion carrying a
//! stale generation (the slot was torn down meanwhile) is refused.

use std::sync::Arc;

use super::AgentClient;

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Disconnected,
    Connecting(u64),
    Connected(Arc<dyn AgentClient>),
}

/// Slot holding at most one engine client
#[derive(Debug, Default)]
pub struct ClientLifecycle {
    slot: Slot,
    generation: u64,
}

impl ClientLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ClientState {
        match self.slot {
            Slot::Disconnected => ClientState::Disconnected,
            Slot::Connecting(_) => ClientState::Connecting,
            Slot::Connected(_) => ClientState::Connected,
        }
    }

    /// The connected client, if any
    pub fn current(&self) -> Option<Arc<dyn AgentClient>> {
        match &self.slot {
            Slot::Connected(client) => Some(Arc::clone(client)),
            _ => None,
        }
    }

    /// Enter `connecting`; returns the generation to complete with
    pub fn begin_connect(&mut self) -> u64 {
        self.generation += 1;
        self.slot = Slot::Connecting(self.generation);
        self.generation
    }

    /// Enter `connected` if `generation` is still the pending attempt
    pub fn complete(&mut self, generation: u64, client: Arc<dyn AgentClient>) -> bool {
        match self.slot {
            Slot::Connecting(pending) if pending == generation => {
                self.slot = Slot::Connected(client);
                true
            }
            _ => false,
        }
    }

    /// Back to `disconnected` after a failed attempt
    pub fn fail(&mut self, generation: u64) {
        if matches!(self.slot, Slot::Connecting(pending) if pending == generation) {
            self.slot = Slot::Disconnected;
        }
    }

    /// Tear down: returns the connected client so the caller can disconnect
    /// it outside any lock. A pending attempt is invalidated.
    pub fn take(&mut self) -> Option<Arc<dyn AgentClient>> {
        self.generation += 1;
        match std::mem::take(&mut self.slot) {
            Slot::Connected(client) => Some(client),
            _ => None,
        }
    }

    /// Tear down only if `client` is still the connected one
    pub fn take_if(&mut self, client: &Arc<dyn AgentClient>) -> Option<Arc<dyn AgentClient>> {
        match &self.slot {
            Slot::Connected(current) if Arc::ptr_eq(current, client) => self.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedConnector;
    use crate::engine::{AgentConnector, EngineOptions};

    async fn client() -> Arc<dyn AgentClient> {
        ScriptedConnector::new()
            .connect(&EngineOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_cycle() {
        let mut lifecycle = ClientLifecycle::new();
        assert_eq!(lifecycle.state(), ClientState::Disconnected);
        assert!(lifecycle.current().is_none());

        let generation = lifecycle.begin_connect();
        assert_eq!(lifecycle.state(), ClientState::Connecting);

        assert!(lifecycle.complete(generation, client().await));
        assert_eq!(lifecycle.state(), ClientState::Connected);
        assert!(lifecycle.current().is_some());

        assert!(lifecycle.take().is_some());
        assert_eq!(lifecycle.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_stale_completion_refused() {
        let mut lifecycle = ClientLifecycle::new();
        let generation = lifecycle.begin_connect();
        assert!(lifecycle.take().is_none());

        assert!(!lifecycle.complete(generation, client().await));
        assert_eq!(lifecycle.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_fail_only_matching_generation() {
        let mut lifecycle = ClientLifecycle::new();
        let first = lifecycle.begin_connect();
        let second = lifecycle.begin_connect();

        lifecycle.fail(first);
        assert_eq!(lifecycle.state(), ClientState::Connecting);
        lifecycle.fail(second);
        assert_eq!(lifecycle.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_if_ignores_replaced_client() {
        let mut lifecycle = ClientLifecycle::new();
        let old = client().await;
        let generation = lifecycle.begin_connect();
        lifecycle.complete(generation, Arc::clone(&old));
        lifecycle.take();

        let generation = lifecycle.begin_connect();
        lifecycle.complete(generation, client().await);

        assert!(lifecycle.take_if(&old).is_none());
        assert_eq!(lifecycle.state(), ClientState::Connected);
    }
}
