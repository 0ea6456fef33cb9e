//! Caller-facing errors.
//!
//! Callers learn *that* a node could not be reached, never *which* replicas
//! were tried. Authentication failures stay distinct so upper layers can
//! report bad credentials separately from an unreachable server.

use ds_spi::SpiError;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by connections and the pool.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No replica of the node could be reached and verified.
    #[error("directory node {0} is unavailable")]
    Unavailable(String),

    /// A replica was reached but authentication failed.
    #[error("authentication to directory node {node} failed")]
    AuthFailed {
        /// Node name.
        node: String,
        /// Failure reported by the server or credential store.
        #[source]
        source: SpiError,
    },

    /// Credentials were rejected earlier and have not been updated since.
    #[error("credentials for directory node {0} were rejected")]
    CredentialsRejected(String),

    /// The node is configured but disabled.
    #[error("directory node {0} is disabled")]
    NodeDisabled(String),

    /// The node configuration was deleted.
    #[error("directory node {0} was deleted")]
    NodeDeleted(String),

    /// No node is registered under the name and it is not a server URL.
    #[error("unknown directory node {0}")]
    UnknownNode(String),

    /// The node cannot perform the requested operation.
    #[error("unsupported for directory node {node}: {reason}")]
    Unsupported {
        /// Node name.
        node: String,
        /// What was refused.
        reason: String,
    },

    /// Node settings were invalid.
    #[error(transparent)]
    Config(#[from] ds_core::Error),
}

impl SessionError {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(node: impl Into<String>) -> Self {
        Self::Unavailable(node.into())
    }

    /// Creates an authentication error.
    #[must_use]
    pub fn auth_failed(node: impl Into<String>, source: SpiError) -> Self {
        Self::AuthFailed {
            node: node.into(),
            source,
        }
    }

    /// Creates an unsupported-operation error.
    #[must_use]
    pub fn unsupported(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Checks if this is an authentication error.
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self, Self::AuthFailed { .. } | Self::CredentialsRejected(_))
    }

    /// Checks if the node itself refused service.
    #[must_use]
    pub const fn is_node_error(&self) -> bool {
        matches!(
            self,
            Self::NodeDisabled(_) | Self::NodeDeleted(_) | Self::UnknownNode(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_categories() {
        let auth = SessionError::auth_failed("/LDAPv3/a", SpiError::rejected("rc 49"));
        assert!(auth.is_auth_error());
        assert!(SessionError::CredentialsRejected("/LDAPv3/a".to_string()).is_auth_error());
        assert!(!SessionError::unavailable("/LDAPv3/a").is_auth_error());
        assert!(SessionError::NodeDeleted("/LDAPv3/a".to_string()).is_node_error());
        assert!(!SessionError::unsupported("ldapi://x", "password bind").is_node_error());
    }

    #[test]
    fn unavailable_names_only_the_node() {
        let msg = SessionError::unavailable("/LDAPv3/ldap.example.com").to_string();
        assert_eq!(msg, "directory node /LDAPv3/ldap.example.com is unavailable");
    }
}
