//! LDAP-specific error types.
//!
//! ## Security Note
//!
//! Error messages must not leak passwords or bind credentials. Server
//! diagnostic text is kept because it never echoes the secret.

use ds_spi::SpiError;
use thiserror::Error;

/// LDAP result code for rejected credentials.
pub const RC_INVALID_CREDENTIALS: u32 = 49;

/// LDAP result code for an authentication method the server refuses.
pub const RC_AUTH_METHOD_NOT_SUPPORTED: u32 = 7;

/// LDAP-specific errors.
#[derive(Debug, Error)]
pub enum LdapError {
    /// Invalid configuration.
    #[error("LDAP configuration error: {0}")]
    Configuration(String),

    /// Connection failed.
    #[error("LDAP connection failed: {0}")]
    Connection(String),

    /// The server answered with a non-success result code.
    #[error("LDAP operation failed with result code {rc}: {text}")]
    ResultCode {
        /// Result code.
        rc: u32,
        /// Diagnostic text from the server.
        text: String,
    },

    /// The client cannot perform the requested mechanism.
    #[error("SASL mechanism not available: {0}")]
    UnsupportedMechanism(String),

    /// Timeout error.
    #[error("LDAP operation timed out")]
    Timeout,

    /// Underlying ldap3 error.
    #[error("LDAP error: {0}")]
    Ldap3(#[from] ldap3::LdapError),
}

impl LdapError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates a connection error.
    #[must_use]
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Returns the server result code, if the error carries one.
    #[must_use]
    pub fn result_code(&self) -> Option<u32> {
        match self {
            Self::ResultCode { rc, .. } => Some(*rc),
            Self::Ldap3(ldap3::LdapError::LdapResult { result }) => Some(result.rc),
            _ => None,
        }
    }

    /// Checks if the server rejected the credentials.
    #[must_use]
    pub fn is_invalid_credentials(&self) -> bool {
        self.result_code() == Some(RC_INVALID_CREDENTIALS)
    }

    /// Checks if this is a connection-related error.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout => true,
            Self::Ldap3(ldap3::LdapError::Timeout { .. }) => true,
            Self::Ldap3(e) => !matches!(e, ldap3::LdapError::LdapResult { .. }),
            _ => false,
        }
    }
}

/// Converts a completed operation result into `Ok` or a result-code error.
pub(crate) fn check(result: ldap3::LdapResult) -> LdapResult<()> {
    if result.rc == 0 {
        Ok(())
    } else {
        Err(LdapError::ResultCode {
            rc: result.rc,
            text: result.text,
        })
    }
}

/// Result type for LDAP operations.
pub type LdapResult<T> = Result<T, LdapError>;

impl From<LdapError> for SpiError {
    fn from(err: LdapError) -> Self {
        match err.result_code() {
            Some(RC_INVALID_CREDENTIALS) => return Self::rejected(err.to_string()),
            Some(RC_AUTH_METHOD_NOT_SUPPORTED) => {
                return Self::MechanismUnsupported(err.to_string())
            }
            Some(_) => return Self::Protocol(err.to_string()),
            None => {}
        }
        match err {
            LdapError::Configuration(msg) => Self::unsupported(msg),
            LdapError::UnsupportedMechanism(mech) => Self::MechanismUnsupported(mech),
            LdapError::Timeout | LdapError::Ldap3(ldap3::LdapError::Timeout { .. }) => {
                Self::Timeout
            }
            other => Self::transport(other.to_string()),
        }
    }
}
