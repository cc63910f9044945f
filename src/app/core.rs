//! Gateway application state
//!
//! `GatewayApp` owns the resolved configuration, the durable session log
//! and the session registry built on top of it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::engine::{AgentConnector, ClaudeSdkConnector};
use crate::gateway::GatewayState;
use crate::session::{SessionDeps, SessionRegistry};
use crate::store::{SessionLog, open_store};
use crate::types::GatewayConfig;

/// Claude agent gateway
///
/// Shared by the HTTP routes and the maintenance tasks.
#[derive(Debug, Clone)]
pub struct GatewayApp {
    /// Resolved configuration
    config: GatewayConfig,
    /// Live sessions
    registry: SessionRegistry,
}

impl GatewayApp {
    /// Create the gateway with the `claude` CLI engine
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_connector(config, Arc::new(ClaudeSdkConnector::new()))
    }

    /// Create with a custom engine connector
    ///
    /// The configured store is opened here; if it is unusable the sessions
    /// are kept in memory and the log reports itself degraded.
    pub fn with_connector(config: GatewayConfig, connector: Arc<dyn AgentConnector>) -> Self {
        let (store, degraded) = open_store(&config.store);
        let mut log = SessionLog::new(store, config.retention);
        if degraded {
            log = log.degraded_from_start();
        }

        let deps = SessionDeps {
            log,
            connector,
            engine: config.engine.clone(),
            settings: config.orchestrator,
        };
        let registry = SessionRegistry::new(deps, config.reconnect_grace);

        Self { config, registry }
    }

    /// Get the resolved configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Get the session registry
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Get the durable session log
    pub fn log(&self) -> &SessionLog {
        self.registry.log()
    }

    /// Route state bound to `shutdown`
    pub fn gateway_state(&self, shutdown: CancellationToken) -> GatewayState {
        GatewayState {
            registry: self.registry.clone(),
            send_queue: self.config.send_queue,
            shutdown,
        }
    }

    /// Get name for logging
    pub fn name(&self) -> &'static str {
        "claude-agent-gateway"
    }

    /// Get version
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedConnector;
    use crate::types::StoreLocation;

    #[tokio::test]
    async fn test_app_with_memory_store() {
        let app = GatewayApp::with_connector(
            GatewayConfig::default(),
            Arc::new(ScriptedConnector::new()),
        );
        assert_eq!(app.name(), "claude-agent-gateway");
        assert_eq!(app.log().backend(), "memory");
        assert!(!app.log().is_degraded());
        assert_eq!(app.registry().session_count(), 0);
    }

    #[tokio::test]
    async fn test_app_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file
        let config = GatewayConfig {
            store: StoreLocation::Sqlite(dir.path().to_path_buf()),
            ..Default::default()
        };
        let app = GatewayApp::with_connector(config, Arc::new(ScriptedConnector::new()));
        assert_eq!(app.log().backend(), "memory");
        assert!(app.log().is_degraded());
    }

    #[tokio::test]
    async fn test_gateway_state() {
        let config = GatewayConfig {
            send_queue: 7,
            ..Default::default()
        };
        let app = GatewayApp::with_connector(config, Arc::new(ScriptedConnector::new()));
        let state = app.gateway_state(CancellationToken::new());
        assert_eq!(state.send_queue, 7);
        assert!(!state.shutdown.is_cancelled());
    }
}
