//! # ds-session
//!
//! Replica selection, authenticated sessions and connection pooling for
//! directory nodes.
//!
//! - [`ReplicaInfo`] - one resolved endpoint and what its last probe learned
//! - [`NodeConfig`] - a logical node: replica set, discovery, selection and
//!   authentication negotiation
//! - [`Connection`] - a lazily established session handed out under lock
//! - [`ConnectionManager`] - the shared pool, maintenance and health checks
//! - [`NodeRegistry`] - configured and dynamically created nodes
//!
//! Locking is two-tier. The pool mutex guards only the pool's collections;
//! each connection's own mutex is held from [`Connection::lock`] until
//! [`Connection::unlock`]. Network and credential-store calls never run
//! under the pool mutex.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod auth;
pub mod connection;
pub mod error;
pub mod manager;
pub mod node;
pub mod registry;
pub mod replica;
pub mod select;
pub mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use auth::{AuthMode, AuthState};
pub use connection::{Connection, SessionGuard};
pub use error::{SessionError, SessionResult};
pub use manager::{ConnectionManager, MaintenanceHandle};
pub use node::{Established, NodeConfig};
pub use registry::NodeRegistry;
pub use replica::ReplicaInfo;
pub use select::Selected;
pub use state::PoolState;
