//! # ds-core
//!
//! Foundational types shared by every crate of the directory session core.
//!
//! - [`SecurityLevel`] - the security bitmask used to gate replica acceptability
//! - [`SaslMechanism`] - the credential mechanisms the core negotiates
//! - [`NodeSettings`] / [`PoolSettings`] - per-node policy and pool tuning
//! - [`ConnectionStatus`] / [`StatusTransition`] - connection trust states
//! - [`Error`] - configuration and parsing errors

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod security;

pub use config::{NodeSettings, NodeSettingsBuilder, PoolSettings, RaceSettings, ServiceCredentials};
pub use error::{Error, Result};
pub use event::{ConnectionStatus, StatusTransition};
pub use security::{SaslMechanism, SecurityLevel};
