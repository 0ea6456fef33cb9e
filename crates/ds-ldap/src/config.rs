//! Transport settings.
//!
//! ## Security
//!
//! Certificate validation is on by default. Turning it off is meant for
//! test directories with self-signed certificates only.

use serde::{Deserialize, Serialize};

use crate::error::{LdapError, LdapResult};

/// Settings applied to every connection the transport opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapTransportConfig {
    /// Verify server certificates on TLS endpoints.
    pub validate_certificates: bool,

    /// Upgrade clear endpoints with StartTLS before use.
    pub starttls: bool,
}

impl Default for LdapTransportConfig {
    fn default() -> Self {
        Self {
            validate_certificates: true,
            starttls: false,
        }
    }
}

impl LdapTransportConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> LdapTransportConfigBuilder {
        LdapTransportConfigBuilder::new()
    }

    /// Parses settings from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed.
    pub fn from_toml(doc: &str) -> LdapResult<Self> {
        toml::from_str(doc).map_err(|e| LdapError::config(e.to_string()))
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for [`LdapTransportConfig`].
#[derive(Debug, Default)]
pub struct LdapTransportConfigBuilder {
    config: LdapTransportConfig,
}

impl LdapTransportConfigBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets certificate validation.
    #[must_use]
    pub const fn validate_certificates(mut self, validate: bool) -> Self {
        self.config.validate_certificates = validate;
        self
    }

    /// Sets StartTLS upgrade for clear endpoints.
    #[must_use]
    pub const fn starttls(mut self, starttls: bool) -> Self {
        self.config.starttls = starttls;
        self
    }

    /// Builds the settings.
    #[must_use]
    pub fn build(self) -> LdapTransportConfig {
        self.config
    }
}
