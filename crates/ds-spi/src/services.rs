//! Collaborator bundle handed to the session core.

use std::fmt;
use std::sync::Arc;

use crate::availability::{NodeAvailabilityCache, NullAvailabilityCache};
use crate::credential::{CredentialStore, NoCredentialStore};
use crate::reachability::ReachabilityProvider;
use crate::resolver::{HostResolver, SystemResolver};
use crate::topology::{StaticTopology, TopologyProvider};
use crate::transport::Transport;

/// One implementation of every collaborator.
///
/// Cloning is cheap; every field is shared.
#[derive(Clone)]
pub struct Services {
    /// Wire protocol.
    pub transport: Arc<dyn Transport>,
    /// Kerberos tickets.
    pub credentials: Arc<dyn CredentialStore>,
    /// Reachability notifications; `None` treats every target as reachable.
    pub reachability: Option<Arc<dyn ReachabilityProvider>>,
    /// Replica lists, schema, mappings and server policy.
    pub topology: Arc<dyn TopologyProvider>,
    /// Node health sink.
    pub availability: Arc<dyn NodeAvailabilityCache>,
    /// Name resolution.
    pub resolver: Arc<dyn HostResolver>,
}

impl Services {
    /// Starts a builder around `transport` with inert defaults elsewhere.
    #[must_use]
    pub fn builder(transport: Arc<dyn Transport>) -> ServicesBuilder {
        ServicesBuilder::new(transport)
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("reachability", &self.reachability.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Services`].
pub struct ServicesBuilder {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    reachability: Option<Arc<dyn ReachabilityProvider>>,
    topology: Arc<dyn TopologyProvider>,
    availability: Arc<dyn NodeAvailabilityCache>,
    resolver: Arc<dyn HostResolver>,
}

impl ServicesBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            credentials: Arc::new(NoCredentialStore),
            reachability: None,
            topology: Arc::new(StaticTopology),
            availability: Arc::new(NullAvailabilityCache),
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Sets the credential store.
    #[must_use]
    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the reachability provider.
    #[must_use]
    pub fn reachability(mut self, reachability: Arc<dyn ReachabilityProvider>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    /// Sets the topology provider.
    #[must_use]
    pub fn topology(mut self, topology: Arc<dyn TopologyProvider>) -> Self {
        self.topology = topology;
        self
    }

    /// Sets the availability cache.
    #[must_use]
    pub fn availability(mut self, availability: Arc<dyn NodeAvailabilityCache>) -> Self {
        self.availability = availability;
        self
    }

    /// Sets the host resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Builds the bundle.
    #[must_use]
    pub fn build(self) -> Services {
        Services {
            transport: self.transport,
            credentials: self.credentials,
            reachability: self.reachability,
            topology: self.topology,
            availability: self.availability,
            resolver: self.resolver,
        }
    }
}

impl fmt::Debug for ServicesBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicesBuilder").finish_non_exhaustive()
    }
}
