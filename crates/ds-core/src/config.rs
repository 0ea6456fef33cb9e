//! Node policy and pool tuning.
//!
//! [`NodeSettings`] describes one logical directory node: which servers back
//! it, how long network steps may take, which protections a session must
//! offer and which credentials the node binds with. Settings are usually
//! loaded from TOML or synthesised from a server URL the first time a caller
//! addresses a node that was never configured.
//!
//! [`PoolSettings`] tunes the connection pool itself and can be read from
//! `DS_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::security::SecurityLevel;

/// Default LDAP port.
pub const LDAP_PORT: u16 = 389;
/// Default LDAPS port.
pub const LDAPS_PORT: u16 = 636;

// ============================================================================
// Service Credentials
// ============================================================================

/// Credentials a node binds with when no caller credentials are supplied.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCredentials {
    /// Bind name (a DN or an account name).
    pub username: String,

    /// Bind password.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Kerberos principal to use instead of deriving one from `username`.
    #[serde(default)]
    pub kerberos_id: Option<String>,
}

impl ServiceCredentials {
    /// Creates password credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            kerberos_id: None,
        }
    }

    /// Sets the Kerberos principal.
    #[must_use]
    pub fn with_kerberos_id(mut self, kerberos_id: impl Into<String>) -> Self {
        self.kerberos_id = Some(kerberos_id.into());
        self
    }
}

impl std::fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("kerberos_id", &self.kerberos_id)
            .finish()
    }
}

// ============================================================================
// Node Settings
// ============================================================================

/// Per-node policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Logical node name callers address.
    pub name: String,

    /// Configuration identity.
    pub uuid: Uuid,

    /// Server names or URLs, primary first.
    pub servers: Vec<String>,

    /// Port used for servers that do not carry one.
    pub port: u16,

    /// Whether sessions use TLS from connection start.
    pub use_tls: bool,

    /// Budget for connect plus handshake, in seconds.
    pub open_close_timeout_secs: u64,

    /// Budget for a single search, in seconds.
    pub search_timeout_secs: u64,

    /// Minimum delay before a failed node is rebound, in seconds.
    pub rebind_timeout_secs: u64,

    /// Periodic ticks a session may sit idle before it is closed (0 = never).
    pub idle_max_count: u32,

    /// Protections required by local policy.
    pub local_security: SecurityLevel,

    /// SASL mechanisms that must never be attempted.
    pub denied_mechanisms: Vec<String>,

    /// Credentials used by anonymous connections of this node.
    pub service_credentials: Option<ServiceCredentials>,

    /// Realm appended to bare user names when deriving Kerberos principals.
    pub kerberos_realm: Option<String>,

    /// Whether the node accepts connections at all.
    pub enabled: bool,

    /// Ask the topology provider for the replica list.
    pub discover_replicas: bool,

    /// Ask the topology provider for schema and mappings.
    pub discover_mappings: bool,

    /// Ask the server for its advertised security policy.
    pub discover_security: bool,

    /// Interval at which discovery is re-flagged, in seconds (0 = never).
    pub refresh_interval_secs: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            uuid: Uuid::nil(),
            servers: Vec::new(),
            port: LDAP_PORT,
            use_tls: false,
            open_close_timeout_secs: 15,
            search_timeout_secs: 120,
            rebind_timeout_secs: 120,
            idle_max_count: 2,
            local_security: SecurityLevel::NONE,
            denied_mechanisms: Vec::new(),
            service_credentials: None,
            kerberos_realm: None,
            enabled: true,
            discover_replicas: true,
            discover_mappings: true,
            discover_security: true,
            refresh_interval_secs: 3600,
        }
    }
}

impl NodeSettings {
    /// Creates a new settings builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> NodeSettingsBuilder {
        NodeSettingsBuilder::new(name)
    }

    /// Parses settings from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml(document: &str) -> Result<Self> {
        let mut settings: Self =
            toml::from_str(document).map_err(|e| Error::Parse(e.to_string()))?;
        if settings.uuid.is_nil() {
            settings.uuid = Uuid::now_v7();
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Synthesises settings for a node addressed by server URL.
    ///
    /// Accepts `ldap://`, `ldaps://` and `ldapi://` URLs. Dynamic nodes do
    /// not discover replicas: the URL names the only server.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed or uses another scheme.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|_| Error::invalid_url(url))?;
        let (use_tls, default_port) = match parsed.scheme() {
            "ldap" | "ldapi" => (false, LDAP_PORT),
            "ldaps" => (true, LDAPS_PORT),
            _ => return Err(Error::invalid_url(url)),
        };
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::invalid_url(url))?;

        let server = if parsed.scheme() == "ldapi" {
            format!("ldapi://{host}")
        } else {
            host.to_string()
        };

        let settings = Self {
            name: url.to_string(),
            uuid: Uuid::now_v7(),
            servers: vec![server],
            port: parsed.port().unwrap_or(default_port),
            use_tls,
            discover_replicas: false,
            ..Self::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or server list is unusable.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("node name cannot be empty"));
        }
        if self.servers.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::config("server names cannot be empty"));
        }
        if self.open_close_timeout_secs == 0 {
            return Err(Error::config("open/close timeout must be at least one second"));
        }
        if self.is_local_socket() && self.servers.len() > 1 {
            return Err(Error::config("a local-socket node has exactly one server"));
        }
        Ok(())
    }

    /// Returns the primary server name, if any.
    #[must_use]
    pub fn primary_server(&self) -> Option<&str> {
        self.servers.first().map(String::as_str)
    }

    /// Returns true for nodes reached over a local socket.
    #[must_use]
    pub fn is_local_socket(&self) -> bool {
        self.servers
            .first()
            .is_some_and(|s| s.to_ascii_lowercase().starts_with("ldapi://"))
    }

    /// Connect plus handshake budget.
    #[must_use]
    pub const fn open_close_timeout(&self) -> Duration {
        Duration::from_secs(self.open_close_timeout_secs)
    }

    /// Single-search budget.
    #[must_use]
    pub const fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    /// Delay before a failed node is retried.
    #[must_use]
    pub const fn rebind_timeout(&self) -> Duration {
        Duration::from_secs(self.rebind_timeout_secs)
    }

    /// Discovery refresh interval, if enabled.
    #[must_use]
    pub const fn refresh_interval(&self) -> Option<Duration> {
        if self.refresh_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.refresh_interval_secs))
        }
    }

    /// Returns true when the named mechanism is denied by policy.
    #[must_use]
    pub fn is_mechanism_denied(&self, mechanism: &str) -> bool {
        self.denied_mechanisms
            .iter()
            .any(|d| d.eq_ignore_ascii_case(mechanism))
    }
}

// ============================================================================
// Node Settings Builder
// ============================================================================

/// Builder for [`NodeSettings`].
#[derive(Debug)]
pub struct NodeSettingsBuilder {
    settings: NodeSettings,
}

impl NodeSettingsBuilder {
    /// Creates a builder with defaults.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            settings: NodeSettings {
                name: name.into(),
                uuid: Uuid::now_v7(),
                ..NodeSettings::default()
            },
        }
    }

    /// Appends a server; the first one added is the primary.
    #[must_use]
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.settings.servers.push(server.into());
        self
    }

    /// Sets the default port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.settings.port = port;
        self
    }

    /// Enables TLS from connection start.
    #[must_use]
    pub const fn use_tls(mut self, use_tls: bool) -> Self {
        self.settings.use_tls = use_tls;
        self
    }

    /// Sets the open/close timeout in seconds.
    #[must_use]
    pub const fn open_close_timeout_secs(mut self, secs: u64) -> Self {
        self.settings.open_close_timeout_secs = secs;
        self
    }

    /// Sets the search timeout in seconds.
    #[must_use]
    pub const fn search_timeout_secs(mut self, secs: u64) -> Self {
        self.settings.search_timeout_secs = secs;
        self
    }

    /// Sets the idle tick limit.
    #[must_use]
    pub const fn idle_max_count(mut self, count: u32) -> Self {
        self.settings.idle_max_count = count;
        self
    }

    /// Sets the locally required security.
    #[must_use]
    pub const fn local_security(mut self, level: SecurityLevel) -> Self {
        self.settings.local_security = level;
        self
    }

    /// Denies a SASL mechanism.
    #[must_use]
    pub fn deny_mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.settings.denied_mechanisms.push(mechanism.into());
        self
    }

    /// Sets the service credentials.
    #[must_use]
    pub fn service_credentials(mut self, credentials: ServiceCredentials) -> Self {
        self.settings.service_credentials = Some(credentials);
        self
    }

    /// Sets the Kerberos realm.
    #[must_use]
    pub fn kerberos_realm(mut self, realm: impl Into<String>) -> Self {
        self.settings.kerberos_realm = Some(realm.into());
        self
    }

    /// Enables or disables the node.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.settings.enabled = enabled;
        self
    }

    /// Turns every topology discovery step on or off.
    #[must_use]
    pub const fn discovery(mut self, enabled: bool) -> Self {
        self.settings.discover_replicas = enabled;
        self.settings.discover_mappings = enabled;
        self.settings.discover_security = enabled;
        self
    }

    /// Turns replica discovery on or off.
    #[must_use]
    pub const fn discover_replicas(mut self, enabled: bool) -> Self {
        self.settings.discover_replicas = enabled;
        self
    }

    /// Sets the discovery refresh interval in seconds (0 disables it).
    #[must_use]
    pub const fn refresh_interval_secs(mut self, secs: u64) -> Self {
        self.settings.refresh_interval_secs = secs;
        self
    }

    /// Builds and validates the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<NodeSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

// ============================================================================
// Pool Settings
// ============================================================================

/// Tuning of the replica race.
///
/// These values shape timing only; callers must not depend on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceSettings {
    /// Most endpoints probed concurrently.
    pub max_candidates: usize,

    /// Initial fast pass before the first poll interval, in milliseconds.
    pub quick_pass_ms: u64,

    /// Length of one poll interval, in milliseconds.
    pub poll_interval_ms: u64,

    /// Budget for probing a replica on a local interface, in milliseconds.
    pub local_probe_timeout_ms: u64,
}

impl Default for RaceSettings {
    fn default() -> Self {
        Self {
            max_candidates: 64,
            quick_pass_ms: 5,
            poll_interval_ms: 1000,
            local_probe_timeout_ms: 2000,
        }
    }
}

impl RaceSettings {
    /// Total race budget for a node whose open/close timeout is `open_close`.
    ///
    /// One quick pass followed by one poll interval per open/close second.
    #[must_use]
    pub fn budget(&self, open_close: Duration) -> Duration {
        let polls = u32::try_from(open_close.as_secs().max(1)).unwrap_or(u32::MAX);
        Duration::from_millis(self.quick_pass_ms)
            + Duration::from_millis(self.poll_interval_ms).saturating_mul(polls)
    }

    /// Local probe budget.
    #[must_use]
    pub const fn local_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.local_probe_timeout_ms)
    }
}

/// Connection pool tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Interval between maintenance sweeps, in seconds.
    pub maintenance_interval_secs: u64,

    /// Minimum spacing of unforced health checks, in seconds.
    pub check_failed_interval_secs: u64,

    /// Replica race tuning.
    pub race: RaceSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            maintenance_interval_secs: 30,
            check_failed_interval_secs: 30,
            race: RaceSettings::default(),
        }
    }
}

impl PoolSettings {
    /// Loads settings from `DS_*` environment variables.
    ///
    /// A `.env` file is honoured when present. Unset variables keep their
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable is set but not a number.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Ok(Self {
            maintenance_interval_secs: env_or(
                "DS_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval_secs,
            )?,
            check_failed_interval_secs: env_or(
                "DS_CHECK_FAILED_INTERVAL_SECS",
                defaults.check_failed_interval_secs,
            )?,
            race: RaceSettings {
                max_candidates: env_or("DS_RACE_MAX_CANDIDATES", defaults.race.max_candidates)?,
                quick_pass_ms: env_or("DS_RACE_QUICK_PASS_MS", defaults.race.quick_pass_ms)?,
                poll_interval_ms: env_or(
                    "DS_RACE_POLL_INTERVAL_MS",
                    defaults.race.poll_interval_ms,
                )?,
                local_probe_timeout_ms: env_or(
                    "DS_LOCAL_PROBE_TIMEOUT_MS",
                    defaults.race.local_probe_timeout_ms,
                )?,
            },
        })
    }

    /// Interval between maintenance sweeps.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Minimum spacing of unforced health checks.
    #[must_use]
    pub const fn check_failed_interval(&self) -> Duration {
        Duration::from_secs(self.check_failed_interval_secs)
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| Error::Environment {
            name: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}
