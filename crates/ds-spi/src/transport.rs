//! Wire-protocol boundary.
//!
//! A [`Transport`] opens sessions to a single [`Endpoint`]. The core decides
//! *which* endpoint to open and *how* to authenticate; the transport only
//! performs the individual protocol steps.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ds_core::SaslMechanism;

use crate::credential::TicketHandle;
use crate::error::SpiResult;

// ============================================================================
// Endpoint
// ============================================================================

/// Where an endpoint lives on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointAddr {
    /// A TCP socket address.
    Tcp(SocketAddr),
    /// A local (Unix domain) socket path.
    LocalSocket(PathBuf),
}

/// One network endpoint of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Name the endpoint was resolved from.
    pub host: String,
    /// Resolved address.
    pub addr: EndpointAddr,
    /// Whether TLS is used from connection start.
    pub tls: bool,
}

impl Endpoint {
    /// Creates a TCP endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, addr: SocketAddr, tls: bool) -> Self {
        Self {
            host: host.into(),
            addr: EndpointAddr::Tcp(addr),
            tls,
        }
    }

    /// Creates a local-socket endpoint.
    #[must_use]
    pub fn local_socket(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            host: path.display().to_string(),
            addr: EndpointAddr::LocalSocket(path),
            tls: false,
        }
    }

    /// Returns the TCP address, if any.
    #[must_use]
    pub const fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.addr {
            EndpointAddr::Tcp(addr) => Some(*addr),
            EndpointAddr::LocalSocket(_) => None,
        }
    }

    /// Returns the socket path, if any.
    #[must_use]
    pub fn socket_path(&self) -> Option<&Path> {
        match &self.addr {
            EndpointAddr::Tcp(_) => None,
            EndpointAddr::LocalSocket(path) => Some(path),
        }
    }

    /// Returns true for local-socket endpoints.
    #[must_use]
    pub const fn is_local_socket(&self) -> bool {
        matches!(self.addr, EndpointAddr::LocalSocket(_))
    }

    /// Builds the LDAP URL used to open this endpoint.
    ///
    /// TLS endpoints keep the host name so certificates can be verified;
    /// clear endpoints use the resolved address.
    #[must_use]
    pub fn url(&self) -> String {
        match &self.addr {
            EndpointAddr::Tcp(addr) if self.tls => format!("ldaps://{}:{}", self.host, addr.port()),
            EndpointAddr::Tcp(addr) => format!("ldap://{addr}"),
            EndpointAddr::LocalSocket(path) => {
                format!("ldapi://{}", path.display().to_string().replace('/', "%2F"))
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            EndpointAddr::Tcp(addr) => write!(f, "{}({addr})", self.host),
            EndpointAddr::LocalSocket(path) => write!(f, "{}", path.display()),
        }
    }
}

// ============================================================================
// Root DSE
// ============================================================================

/// What a server advertises about itself at the root of its tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootDse {
    /// Advertised SASL mechanisms.
    pub sasl_mechanisms: Vec<String>,
    /// Naming contexts served.
    pub naming_contexts: Vec<String>,
    /// Fully qualified host name the server reports.
    pub dns_host_name: Option<String>,
    /// Kerberos service principal the server reports.
    pub service_principal: Option<String>,
}

impl RootDse {
    /// Returns whether `mechanism` is advertised.
    #[must_use]
    pub fn supports(&self, mechanism: SaslMechanism) -> bool {
        self.sasl_mechanisms
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mechanism.as_str()))
    }
}

// ============================================================================
// Transport and Session
// ============================================================================

/// User name and password presented to a challenge/response mechanism.
#[derive(Clone, Copy)]
pub struct SaslCredentials<'a> {
    /// Authentication identity.
    pub username: &'a str,
    /// Secret.
    pub password: &'a str,
}

impl fmt::Debug for SaslCredentials<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Opens sessions to endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to `endpoint` within `timeout`.
    ///
    /// The returned session is connected but not bound.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> SpiResult<Box<dyn DirectorySession>>;
}

/// A live protocol session to one endpoint.
#[async_trait]
pub trait DirectorySession: Send {
    /// Returns whether the session runs over TLS.
    fn is_tls(&self) -> bool;

    /// Reads the root DSE.
    async fn root_dse(&mut self, timeout: Duration) -> SpiResult<RootDse>;

    /// Performs a simple bind.
    async fn simple_bind(&mut self, dn: &str, password: &str, timeout: Duration) -> SpiResult<()>;

    /// Performs a challenge/response SASL bind.
    async fn sasl_bind(
        &mut self,
        mechanism: SaslMechanism,
        credentials: SaslCredentials<'_>,
        timeout: Duration,
    ) -> SpiResult<()>;

    /// Performs a GSSAPI bind with an acquired ticket.
    async fn gssapi_bind(
        &mut self,
        ticket: &TicketHandle,
        service_host: &str,
        timeout: Duration,
    ) -> SpiResult<()>;

    /// Closes the session.
    async fn unbind(&mut self) -> SpiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_endpoint_url_uses_address() {
        let endpoint = Endpoint::tcp("ldap.example.com", "10.0.0.1:389".parse().unwrap(), false);
        assert_eq!(endpoint.url(), "ldap://10.0.0.1:389");
        assert_eq!(endpoint.to_string(), "ldap.example.com(10.0.0.1:389)");
    }

    #[test]
    fn tls_endpoint_url_uses_host_name() {
        let endpoint = Endpoint::tcp("ldap.example.com", "10.0.0.1:636".parse().unwrap(), true);
        assert_eq!(endpoint.url(), "ldaps://ldap.example.com:636");
    }

    #[test]
    fn local_socket_url_is_percent_encoded() {
        let endpoint = Endpoint::local_socket("/var/run/ldapi");
        assert!(endpoint.is_local_socket());
        assert_eq!(endpoint.socket_addr(), None);
        assert_eq!(endpoint.url(), "ldapi://%2Fvar%2Frun%2Fldapi");
    }

    #[test]
    fn root_dse_mechanism_lookup_ignores_case() {
        let dse = RootDse {
            sasl_mechanisms: vec!["gssapi".to_string(), "CRAM-MD5".to_string()],
            ..RootDse::default()
        };
        assert!(dse.supports(SaslMechanism::Gssapi));
        assert!(dse.supports(SaslMechanism::CramMd5));
        assert!(!dse.supports(SaslMechanism::DigestMd5));
    }
}
