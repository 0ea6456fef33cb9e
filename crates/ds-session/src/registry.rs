//! Node registry.
//!
//! Holds every configured node by name and materialises dynamic nodes the
//! first time a server URL is used as a node name.

use std::sync::Arc;

use dashmap::DashMap;
use ds_core::{NodeSettings, RaceSettings};
use ds_spi::Services;
use tracing::{debug, info};

use crate::error::{SessionError, SessionResult};
use crate::node::NodeConfig;

/// Registry of directory nodes.
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<NodeConfig>>,
    services: Services,
    race: RaceSettings,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(services: Services, race: RaceSettings) -> Self {
        Self {
            nodes: DashMap::new(),
            services,
            race,
        }
    }

    /// Registers a configured node, replacing any node of the same name.
    ///
    /// A replaced node is marked deleted so pooled connections to it are
    /// evicted by the next sweep.
    pub fn register(&self, settings: NodeSettings) -> Arc<NodeConfig> {
        let node = self.materialize(settings);
        if let Some(previous) = self
            .nodes
            .insert(node.name().to_string(), Arc::clone(&node))
        {
            previous.mark_deleted();
            info!(node = %node.name(), "node replaced");
        } else {
            info!(node = %node.name(), "node registered");
        }
        node
    }

    /// Looks up a node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<NodeConfig>> {
        self.nodes.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a node and marks it deleted.
    pub fn remove(&self, name: &str) -> Option<Arc<NodeConfig>> {
        let (_, node) = self.nodes.remove(name)?;
        node.mark_deleted();
        info!(node = %name, "node removed");
        Some(node)
    }

    /// Returns the node called `name`.
    ///
    /// Names containing `://` are server URLs; their node is created on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownNode`] for an unregistered plain name
    /// and [`SessionError::Config`] for an unusable URL.
    pub fn node_for(&self, name: &str) -> SessionResult<Arc<NodeConfig>> {
        if let Some(node) = self.get(name) {
            return Ok(node);
        }
        if !name.contains("://") {
            return Err(SessionError::UnknownNode(name.to_string()));
        }

        let entry = self.nodes.entry(name.to_string()).or_try_insert_with(|| {
            let settings = NodeSettings::from_url(name)?;
            debug!(node = %name, "materialising dynamic node");
            Ok::<_, SessionError>(self.materialize(settings))
        })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Flags every node for rediscovery and resets replica checks.
    pub fn network_transition(&self) {
        for entry in &self.nodes {
            entry.value().network_transition();
        }
    }

    /// Every registered node.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<NodeConfig>> {
        self.nodes.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Names of every registered node.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true when no node is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn materialize(&self, settings: NodeSettings) -> Arc<NodeConfig> {
        let node = NodeConfig::new(settings, self.services.clone(), self.race.clone());
        node.start_background();
        node
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn registry() -> NodeRegistry {
        let services = Services::builder(Arc::new(MockTransport::new())).build();
        NodeRegistry::new(services, RaceSettings::default())
    }

    fn settings(name: &str) -> NodeSettings {
        NodeSettings::builder(name)
            .server("10.0.0.1")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = registry();
        let node = registry.register(settings("/LDAPv3/a"));

        let found = registry.get("/LDAPv3/a").unwrap();
        assert!(Arc::ptr_eq(&node, &found));
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.node_for("/LDAPv3/missing"),
            Err(SessionError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn replacing_marks_previous_deleted() {
        let registry = registry();
        let first = registry.register(settings("/LDAPv3/a"));
        let second = registry.register(settings("/LDAPv3/a"));

        assert!(first.is_deleted());
        assert!(!second.is_deleted());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_marks_deleted() {
        let registry = registry();
        registry.register(settings("/LDAPv3/a"));
        let removed = registry.remove("/LDAPv3/a").unwrap();
        assert!(removed.is_deleted());
        assert!(registry.is_empty());
        assert!(registry.remove("/LDAPv3/a").is_none());
    }

    #[tokio::test]
    async fn url_names_create_dynamic_nodes_once() {
        let registry = registry();
        let a = registry.node_for("ldap://10.0.0.5").unwrap();
        let b = registry.node_for("ldap://10.0.0.5").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.is_local_socket());

        let local = registry.node_for("ldapi://%2Fvar%2Frun%2Fldapi").unwrap();
        assert!(local.is_local_socket());
        assert_eq!(local.replicas().len(), 1);

        assert!(matches!(
            registry.node_for("ftp://10.0.0.5"),
            Err(SessionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn network_transition_reaches_every_node() {
        let transport = Arc::new(MockTransport::new());
        transport.add("/tmp/ds.sock", crate::testing::EndpointBehavior::new());
        let registry = NodeRegistry::new(
            Services::builder(transport).build(),
            RaceSettings::default(),
        );
        let node = registry.node_for("ldapi://%2Ftmp%2Fds.sock").unwrap();

        let mut selected = node.find_suitable_replica(None, false, false).await.unwrap();
        selected.session.unbind().await.unwrap();
        assert!(!selected.replica.is_unchecked());

        registry.network_transition();
        assert!(selected.replica.is_unchecked());
        assert!(node.discovery_pending());
    }
}
