//! # ds-spi
//!
//! Boundary traits for the services the directory session core calls into.
//!
//! The core owns replica selection, authentication negotiation and pooling.
//! Everything it does not own is reached through these traits:
//!
//! - [`Transport`] / [`DirectorySession`] - the wire protocol
//! - [`CredentialStore`] - Kerberos ticket acquisition
//! - [`ReachabilityProvider`] - network up/down notifications
//! - [`TopologyProvider`] - replica lists, schema, mappings, server policy
//! - [`HostResolver`] - name resolution and local-interface detection
//! - [`NodeAvailabilityCache`] - fire-and-forget node health reporting
//!
//! [`Services`] bundles one implementation of each.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod availability;
pub mod credential;
pub mod error;
pub mod reachability;
pub mod resolver;
pub mod services;
pub mod topology;
pub mod transport;

pub use availability::{NodeAvailabilityCache, NullAvailabilityCache};
pub use credential::{CredentialStore, NoCredentialStore, TicketHandle};
pub use error::{SpiError, SpiResult};
pub use reachability::{ReachabilityEvent, ReachabilityProvider, ReachabilityTarget};
pub use resolver::{HostResolver, SystemResolver};
pub use services::{Services, ServicesBuilder};
pub use topology::{ReplicaList, StaticTopology, TopologyProvider};
pub use transport::{DirectorySession, Endpoint, EndpointAddr, RootDse, SaslCredentials, Transport};
