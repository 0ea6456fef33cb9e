//! `ldap3`-backed transport and session.
//!
//! ## Security
//!
//! TLS endpoints connect with `ldaps://` and verify certificates unless the
//! transport is configured otherwise. Clear endpoints may be upgraded with
//! StartTLS.

use std::time::Duration;

use async_trait::async_trait;
use ds_core::SaslMechanism;
use ds_spi::{
    DirectorySession, Endpoint, RootDse, SaslCredentials, SpiResult, TicketHandle, Transport,
};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings};
use tracing::{debug, warn};

use crate::config::LdapTransportConfig;
use crate::error::{check, LdapError};
use crate::search::read_root_dse;

/// Opens `ldap3` sessions.
#[derive(Debug, Clone, Default)]
pub struct LdapTransport {
    config: LdapTransportConfig,
}

impl LdapTransport {
    /// Creates a transport.
    #[must_use]
    pub const fn new(config: LdapTransportConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &LdapTransportConfig {
        &self.config
    }

    fn uses_starttls(&self, endpoint: &Endpoint) -> bool {
        self.config.starttls && !endpoint.tls && !endpoint.is_local_socket()
    }

    fn settings(&self, endpoint: &Endpoint, timeout: Duration) -> LdapConnSettings {
        LdapConnSettings::new()
            .set_conn_timeout(timeout)
            .set_starttls(self.uses_starttls(endpoint))
            .set_no_tls_verify(!self.config.validate_certificates)
    }
}

#[async_trait]
impl Transport for LdapTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> SpiResult<Box<dyn DirectorySession>> {
        let url = endpoint.url();
        let settings = self.settings(endpoint, timeout);
        let tls = endpoint.tls || self.uses_starttls(endpoint);

        let (conn, ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| LdapError::connection(format!("{endpoint}: {e}")))?;

        // Spawn connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        debug!(endpoint = %endpoint, tls, "opened LDAP session");
        Ok(Box::new(LdapSession { ldap, tls }))
    }
}

/// One connected `ldap3` handle.
pub struct LdapSession {
    ldap: Ldap,
    tls: bool,
}

impl std::fmt::Debug for LdapSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSession")
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DirectorySession for LdapSession {
    fn is_tls(&self) -> bool {
        self.tls
    }

    async fn root_dse(&mut self, timeout: Duration) -> SpiResult<RootDse> {
        Ok(read_root_dse(&mut self.ldap, timeout).await?)
    }

    async fn simple_bind(&mut self, dn: &str, password: &str, timeout: Duration) -> SpiResult<()> {
        let result = self
            .ldap
            .with_timeout(timeout)
            .simple_bind(dn, password)
            .await
            .map_err(LdapError::from)?;
        Ok(check(result)?)
    }

    async fn sasl_bind(
        &mut self,
        mechanism: SaslMechanism,
        credentials: SaslCredentials<'_>,
        _timeout: Duration,
    ) -> SpiResult<()> {
        debug!(
            mechanism = %mechanism,
            username = %credentials.username,
            "SASL mechanism not provided by ldap3"
        );
        Err(LdapError::UnsupportedMechanism(mechanism.to_string()).into())
    }

    #[cfg(feature = "gssapi")]
    async fn gssapi_bind(
        &mut self,
        ticket: &TicketHandle,
        service_host: &str,
        timeout: Duration,
    ) -> SpiResult<()> {
        // ldap3 reads the process default ticket cache.
        debug!(principal = %ticket.principal, service_host = %service_host, "GSSAPI bind");
        let result = self
            .ldap
            .with_timeout(timeout)
            .sasl_gssapi_bind(service_host)
            .await
            .map_err(LdapError::from)?;
        Ok(check(result)?)
    }

    #[cfg(not(feature = "gssapi"))]
    async fn gssapi_bind(
        &mut self,
        ticket: &TicketHandle,
        service_host: &str,
        _timeout: Duration,
    ) -> SpiResult<()> {
        debug!(
            principal = %ticket.principal,
            service_host = %service_host,
            "GSSAPI support not compiled in"
        );
        Err(LdapError::UnsupportedMechanism(SaslMechanism::Gssapi.to_string()).into())
    }

    async fn unbind(&mut self) -> SpiResult<()> {
        Ok(self.ldap.unbind().await.map_err(LdapError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starttls_only_applies_to_clear_tcp() {
        let transport = LdapTransport::new(LdapTransportConfig::builder().starttls(true).build());

        let clear = Endpoint::tcp("ldap.example.com", "10.0.0.1:389".parse().unwrap(), false);
        assert!(transport.uses_starttls(&clear));

        let tls = Endpoint::tcp("ldap.example.com", "10.0.0.1:636".parse().unwrap(), true);
        assert!(!transport.uses_starttls(&tls));

        let local = Endpoint::local_socket("/var/run/ldapi");
        assert!(!transport.uses_starttls(&local));

        assert!(!LdapTransport::default().uses_starttls(&clear));
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let transport = LdapTransport::default();
        // Port 9 on loopback is closed on test hosts.
        let endpoint = Endpoint::tcp("localhost", "127.0.0.1:9".parse().unwrap(), false);
        let err = transport
            .connect(&endpoint, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(err.is_connection_error());
    }
}
