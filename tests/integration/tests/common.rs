//! Common test utilities and fixtures.

#![allow(dead_code)]

use std::sync::Arc;

use ds_core::{NodeSettings, PoolSettings, SecurityLevel};
use ds_session::testing::{
    MockCredentialStore, MockResolver, MockTransport, RecordingAvailability,
};
use ds_session::{ConnectionManager, NodeConfig};
use ds_spi::Services;
use tracing_subscriber::EnvFilter;

/// Test environment with scripted collaborators and a connection manager.
pub struct TestEnv {
    /// Scripted endpoints and call counters.
    pub transport: Arc<MockTransport>,
    /// Static host table.
    pub resolver: Arc<MockResolver>,
    /// Ticket store.
    pub credentials: Arc<MockCredentialStore>,
    /// Availability updates.
    pub availability: Arc<RecordingAvailability>,
    /// Pool under test.
    pub manager: ConnectionManager,
}

impl TestEnv {
    /// Creates an environment with no endpoints.
    pub fn new() -> Self {
        init_tracing();

        let transport = Arc::new(MockTransport::new());
        let resolver = Arc::new(MockResolver::new());
        let credentials = Arc::new(MockCredentialStore::new());
        let availability = Arc::new(RecordingAvailability::new());
        let services = Services::builder(transport.clone())
            .resolver(resolver.clone())
            .credentials(credentials.clone())
            .availability(availability.clone())
            .build();

        Self {
            transport,
            resolver,
            credentials,
            availability,
            manager: ConnectionManager::new(services, PoolSettings::default()),
        }
    }

    /// Registers a node over `servers` with no security requirement.
    pub fn node(&self, name: &str, servers: &[&str]) -> Arc<NodeConfig> {
        self.node_with(name, servers, SecurityLevel::NONE)
    }

    /// Registers a node over `servers` requiring `security`.
    pub fn node_with(
        &self,
        name: &str,
        servers: &[&str],
        security: SecurityLevel,
    ) -> Arc<NodeConfig> {
        let mut builder = NodeSettings::builder(name)
            .open_close_timeout_secs(2)
            .local_security(security);
        for server in servers {
            builder = builder.server(*server);
        }
        let settings = builder.build().expect("valid test settings");
        self.manager.registry().register(settings)
    }
}

/// Installs a test subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ds_session=debug")),
        )
        .with_test_writer()
        .try_init();
}
