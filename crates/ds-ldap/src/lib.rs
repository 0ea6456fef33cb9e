//! # ds-ldap
//!
//! [`Transport`](ds_spi::Transport) implementation over `ldap3`.
//!
//! Each [`LdapSession`] wraps one `ldap3` handle whose connection driver runs
//! on its own task. Replica selection, pooling and authentication policy
//! live in `ds-session`; this crate only performs the wire steps.
//!
//! Kerberos binds require the `gssapi` feature. DIGEST-MD5 and CRAM-MD5 are
//! not provided by `ldap3` and are reported as unsupported mechanisms, which
//! makes negotiation fall through to the next candidate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod connection;
pub mod error;
pub mod search;

pub use config::{LdapTransportConfig, LdapTransportConfigBuilder};
pub use connection::{LdapSession, LdapTransport};
pub use error::{LdapError, LdapResult};
