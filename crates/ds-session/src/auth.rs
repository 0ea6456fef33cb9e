//! Authentication negotiation.
//!
//! Mechanisms are tried in preference order. A mechanism is a candidate
//! only if it, together with the transport, meets the node's required
//! security. Simple binds are the last resort and only where policy
//! tolerates them.

use std::fmt;
use std::time::Duration;

use ds_core::{SaslMechanism, SecurityLevel};
use ds_spi::{CredentialStore, DirectorySession, SaslCredentials, SpiError, SpiResult, TicketHandle};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::node::NodeConfig;
use crate::replica::ReplicaInfo;

/// Password presented when the caller supplied an empty one.
///
/// Keeps "empty password" distinct from "no authentication".
pub const EMPTY_PASSWORD_SENTINEL: &str = "\u{1}";

// ============================================================================
// Modes and States
// ============================================================================

/// How a connection authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Unauthenticated, or the node's stored service credentials.
    Anonymous,
    /// User name and password, with an optional Kerberos principal.
    Password {
        /// User name or bind DN.
        username: String,
        /// Password.
        password: String,
        /// Kerberos principal, when it differs from the user name.
        kerberos_id: Option<String>,
    },
    /// An existing Kerberos ticket cache.
    Kerberos {
        /// Principal whose cache is used.
        kerberos_id: String,
    },
}

impl AuthMode {
    /// Returns true for [`AuthMode::Anonymous`].
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    /// Identity the mode authenticates as, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::Password { username, .. } => Some(username),
            Self::Kerberos { kerberos_id } => Some(kerberos_id),
        }
    }
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Password {
                username,
                kerberos_id,
                ..
            } => f
                .debug_struct("Password")
                .field("username", username)
                .field("kerberos_id", kerberos_id)
                .finish_non_exhaustive(),
            Self::Kerberos { kerberos_id } => f
                .debug_struct("Kerberos")
                .field("kerberos_id", kerberos_id)
                .finish(),
        }
    }
}

/// Authentication progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No session has been authenticated yet, or the mode is anonymous.
    Unauthenticated,
    /// The current credentials were accepted.
    Authenticated,
    /// The current credentials were rejected; no automatic retry.
    CredentialsRejected,
}

/// Outcome of a successful negotiation.
#[derive(Debug)]
pub(crate) struct Negotiated {
    pub ticket: Option<TicketHandle>,
    pub security: SecurityLevel,
}

// ============================================================================
// Credential Gate
// ============================================================================

/// Serialises calls into the credential store.
///
/// The gate is the only lock held while the store runs.
pub(crate) struct CredentialGate {
    lock: Mutex<()>,
}

impl CredentialGate {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    pub(crate) async fn acquire(
        &self,
        store: &dyn CredentialStore,
        principal: &str,
        secret: Option<&str>,
    ) -> SpiResult<TicketHandle> {
        let _gate = self.lock.lock().await;
        store.acquire_ticket(principal, secret).await
    }

    pub(crate) async fn destroy(&self, store: &dyn CredentialStore, ticket: &TicketHandle) {
        let _gate = self.lock.lock().await;
        if let Err(e) = store.destroy_ticket(ticket).await {
            warn!(principal = %ticket.principal, error = %e, "failed to destroy ticket");
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

pub(crate) fn transport_security(tls: bool) -> SecurityLevel {
    if tls {
        SecurityLevel::tls()
    } else {
        SecurityLevel::NONE
    }
}

/// Mechanisms to try, in preference order.
///
/// A mechanism qualifies when the server advertises it, policy does not
/// deny it, and its protections plus the transport's cover `required`.
#[must_use]
pub fn candidate_mechanisms(
    supported: &[String],
    denied: &[String],
    required: SecurityLevel,
    tls: bool,
) -> Vec<SaslMechanism> {
    let transport = transport_security(tls);
    SaslMechanism::PREFERENCE
        .into_iter()
        .filter(|m| supported.iter().any(|s| s.eq_ignore_ascii_case(m.as_str())))
        .filter(|m| !denied.iter().any(|d| d.eq_ignore_ascii_case(m.as_str())))
        .filter(|m| (m.security() | transport).satisfies(required))
        .collect()
}

/// Returns whether a simple bind is acceptable.
#[must_use]
pub fn permits_cleartext(required: SecurityLevel, tls: bool) -> bool {
    if required.intersects(SecurityLevel::PACKET_SIGNING | SecurityLevel::MAN_IN_MIDDLE) {
        return false;
    }
    tls || !required.intersects(SecurityLevel::DISALLOW_CLEARTEXT | SecurityLevel::PACKET_ENCRYPTION)
}

/// Kerberos principal for a password login.
#[must_use]
pub fn resolve_principal(username: &str, kerberos_id: Option<&str>, realm: Option<&str>) -> String {
    if let Some(id) = kerberos_id.filter(|id| !id.is_empty()) {
        return qualify(id, realm);
    }
    qualify(username, realm)
}

fn qualify(name: &str, realm: Option<&str>) -> String {
    match realm {
        Some(realm) if !name.contains('@') => format!("{name}@{realm}"),
        _ => name.to_string(),
    }
}

fn normalize_password(password: &str) -> &str {
    if password.is_empty() {
        EMPTY_PASSWORD_SENTINEL
    } else {
        password
    }
}

// ============================================================================
// Negotiation
// ============================================================================

impl NodeConfig {
    /// Authenticates `session` with a user name and password.
    pub(crate) async fn authenticate_using_credentials(
        &self,
        session: &mut dyn DirectorySession,
        replica: &ReplicaInfo,
        username: &str,
        password: &str,
        kerberos_id: Option<&str>,
    ) -> SpiResult<Negotiated> {
        let settings = self.settings();
        let timeout = settings.open_close_timeout();
        let tls = session.is_tls() || replica.endpoint().tls;
        let required = self.required_security();
        let candidates = candidate_mechanisms(
            &replica.sasl_mechanisms(),
            &settings.denied_mechanisms,
            required,
            tls,
        );
        let password = normalize_password(password);
        let mut last_error = None;

        for mechanism in candidates {
            let attempt = match mechanism {
                SaslMechanism::Gssapi => {
                    let principal = resolve_principal(
                        username,
                        kerberos_id,
                        settings.kerberos_realm.as_deref(),
                    );
                    self.gssapi_bind(session, replica, &principal, Some(password), timeout)
                        .await
                        .map(Some)
                }
                other => session
                    .sasl_bind(other, SaslCredentials { username, password }, timeout)
                    .await
                    .map(|()| None),
            };
            match attempt {
                Ok(ticket) => {
                    debug!(node = %self.name(), mechanism = %mechanism, "authenticated");
                    return Ok(Negotiated {
                        ticket,
                        security: mechanism.security() | transport_security(tls),
                    });
                }
                Err(e) => {
                    debug!(node = %self.name(), mechanism = %mechanism, error = %e, "mechanism failed");
                    last_error = Some(e);
                }
            }
        }

        if !permits_cleartext(required, tls) {
            return Err(last_error.unwrap_or_else(|| {
                SpiError::MechanismUnsupported(format!(
                    "no mechanism satisfies required security {required}"
                ))
            }));
        }

        session.simple_bind(username, password, timeout).await?;
        debug!(node = %self.name(), tls, "authenticated with simple bind");
        Ok(Negotiated {
            ticket: None,
            security: transport_security(tls),
        })
    }

    /// Authenticates `session` from an existing ticket cache.
    pub(crate) async fn authenticate_using_kerberos(
        &self,
        session: &mut dyn DirectorySession,
        replica: &ReplicaInfo,
        kerberos_id: &str,
    ) -> SpiResult<Negotiated> {
        let settings = self.settings();
        let tls = session.is_tls() || replica.endpoint().tls;
        let offered = replica.sasl_mechanisms();
        let usable = candidate_mechanisms(
            &offered,
            &settings.denied_mechanisms,
            self.required_security(),
            tls,
        )
        .contains(&SaslMechanism::Gssapi);
        if !usable {
            return Err(SpiError::MechanismUnsupported(
                SaslMechanism::Gssapi.to_string(),
            ));
        }

        let principal = qualify(kerberos_id, settings.kerberos_realm.as_deref());
        let ticket = self
            .gssapi_bind(session, replica, &principal, None, settings.open_close_timeout())
            .await?;
        Ok(Negotiated {
            ticket: Some(ticket),
            security: SaslMechanism::Gssapi.security() | transport_security(tls),
        })
    }

    async fn gssapi_bind(
        &self,
        session: &mut dyn DirectorySession,
        replica: &ReplicaInfo,
        principal: &str,
        secret: Option<&str>,
        timeout: Duration,
    ) -> SpiResult<TicketHandle> {
        let store = self.services().credentials.as_ref();
        let ticket = self.credential_gate().acquire(store, principal, secret).await?;
        let service_host = replica
            .server_fqdn()
            .unwrap_or_else(|| replica.endpoint().host.clone());

        match session.gssapi_bind(&ticket, &service_host, timeout).await {
            Ok(()) => Ok(ticket),
            Err(e) => {
                self.credential_gate().destroy(store, &ticket).await;
                Err(e)
            }
        }
    }
}
