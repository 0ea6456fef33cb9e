//! Error handling for settings and shared types.
//!
//! Error messages never carry credentials. Server names and URLs are safe to
//! include; passwords and ticket material are not.

use thiserror::Error;

/// Result type alias using the core error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or loading settings.
#[derive(Debug, Error)]
pub enum Error {
    /// A setting is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A server URL could not be understood.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// A TOML document could not be parsed.
    #[error("failed to parse settings: {0}")]
    Parse(String),

    /// An environment variable held an unusable value.
    #[error("invalid value for {name}: {value}")]
    Environment {
        /// Variable name.
        name: String,
        /// Offending value.
        value: String,
    },
}

impl Error {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an invalid URL error.
    #[must_use]
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl(url.into())
    }

    /// Returns whether the error came from user-supplied settings.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidUrl(_) | Self::Parse(_) | Self::Environment { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_error_names_variable() {
        let error = Error::Environment {
            name: "DS_MAINTENANCE_INTERVAL_SECS".to_string(),
            value: "soon".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("DS_MAINTENANCE_INTERVAL_SECS"));
        assert!(msg.contains("soon"));
    }

    #[test]
    fn all_variants_are_config_errors() {
        assert!(Error::config("missing servers").is_config_error());
        assert!(Error::invalid_url("ftp://nope").is_config_error());
        assert!(Error::Parse("eof".to_string()).is_config_error());
    }
}
