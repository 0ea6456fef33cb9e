//! Errors reported by collaborator implementations.
//!
//! Messages must not include passwords or ticket contents.

use thiserror::Error;

/// Errors that can occur at the collaborator boundary.
#[derive(Debug, Error)]
pub enum SpiError {
    /// The endpoint could not be reached or the session broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// A network step exceeded its budget.
    #[error("operation timed out")]
    Timeout,

    /// The server rejected the supplied credentials.
    #[error("credentials rejected: {0}")]
    CredentialsRejected(String),

    /// The server or client cannot perform the requested mechanism.
    #[error("mechanism not supported: {0}")]
    MechanismUnsupported(String),

    /// The credential store failed.
    #[error("credential store error: {0}")]
    CredentialStore(String),

    /// A host name could not be resolved.
    #[error("resolution failed: {0}")]
    Resolve(String),

    /// The server answered with a protocol-level failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The collaborator does not implement the operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl SpiError {
    /// Creates a transport error.
    #[must_use]
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a credentials-rejected error.
    #[must_use]
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::CredentialsRejected(msg.into())
    }

    /// Creates an unsupported-operation error.
    #[must_use]
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Checks if this is an authentication error.
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self, Self::CredentialsRejected(_) | Self::CredentialStore(_))
    }

    /// Checks if this is a connection-related error.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout | Self::Resolve(_))
    }
}

/// Result type for collaborator operations.
pub type SpiResult<T> = Result<T, SpiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_categories() {
        assert!(SpiError::rejected("invalid credentials").is_auth_error());
        assert!(SpiError::CredentialStore("kdc unreachable".to_string()).is_auth_error());
        assert!(SpiError::transport("refused").is_connection_error());
        assert!(SpiError::Timeout.is_connection_error());
        assert!(!SpiError::unsupported("CRAM-MD5").is_connection_error());
        assert!(!SpiError::MechanismUnsupported("X".to_string()).is_auth_error());
    }
}
