//! Topology and mapping boundary.
//!
//! Replica discovery, schema retrieval and record mapping are owned by
//! other subsystems. The core calls them while establishing a session on a
//! node whose discovery is still pending and feeds the replica list back
//! into its replica-set rebuild.

use async_trait::async_trait;
use ds_core::SecurityLevel;

use crate::error::SpiResult;
use crate::transport::DirectorySession;

/// Servers backing a node, split by capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaList {
    /// Servers that answer reads.
    pub read: Vec<String>,
    /// Servers that accept writes.
    pub write: Vec<String>,
}

impl ReplicaList {
    /// Returns true when neither list names a server.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }

    /// Returns whether `server` accepts writes.
    #[must_use]
    pub fn is_writable(&self, server: &str) -> bool {
        self.write.iter().any(|s| s.eq_ignore_ascii_case(server))
    }

    /// All servers, read list first, without duplicates.
    #[must_use]
    pub fn all(&self) -> Vec<String> {
        let mut servers: Vec<String> = Vec::with_capacity(self.read.len() + self.write.len());
        for server in self.read.iter().chain(self.write.iter()) {
            if !servers.iter().any(|s| s.eq_ignore_ascii_case(server)) {
                servers.push(server.clone());
            }
        }
        servers
    }
}

/// Topology, schema and mapping discovery.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Reads the replica list of `node` through `session`.
    ///
    /// `Ok(None)` means the directory publishes no replica information.
    async fn resolve_replica_list(
        &self,
        node: &str,
        session: &mut dyn DirectorySession,
    ) -> SpiResult<Option<ReplicaList>>;

    /// Loads the directory schema.
    async fn resolve_schema(&self, node: &str, session: &mut dyn DirectorySession)
        -> SpiResult<()>;

    /// Loads record and attribute mappings.
    async fn resolve_mappings(
        &self,
        node: &str,
        session: &mut dyn DirectorySession,
    ) -> SpiResult<()>;

    /// Reads the security policy the server advertises for its clients.
    async fn resolve_security_policy(
        &self,
        node: &str,
        session: &mut dyn DirectorySession,
    ) -> SpiResult<SecurityLevel>;
}

/// Topology for nodes whose configuration is entirely static.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticTopology;

#[async_trait]
impl TopologyProvider for StaticTopology {
    async fn resolve_replica_list(
        &self,
        _node: &str,
        _session: &mut dyn DirectorySession,
    ) -> SpiResult<Option<ReplicaList>> {
        Ok(None)
    }

    async fn resolve_schema(
        &self,
        _node: &str,
        _session: &mut dyn DirectorySession,
    ) -> SpiResult<()> {
        Ok(())
    }

    async fn resolve_mappings(
        &self,
        _node: &str,
        _session: &mut dyn DirectorySession,
    ) -> SpiResult<()> {
        Ok(())
    }

    async fn resolve_security_policy(
        &self,
        _node: &str,
        _session: &mut dyn DirectorySession,
    ) -> SpiResult<SecurityLevel> {
        Ok(SecurityLevel::NONE)
    }
}
