//! Per-node policy, replica set and session establishment.
//!
//! A [`NodeConfig`] is shared by every connection to the node. Its mutable
//! state lives behind a `parking_lot` lock whose guard is `!Send`, so it can
//! never be held across an `.await`, and in particular never across a call
//! into the credential store.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ds_core::{NodeSettings, RaceSettings, SecurityLevel, ServiceCredentials};
use ds_spi::{
    DirectorySession, Endpoint, ReachabilityTarget, ReplicaList, Services, SpiResult,
    TicketHandle,
};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::auth::{transport_security, AuthMode, CredentialGate, Negotiated};
use crate::error::{SessionError, SessionResult};
use crate::replica::ReplicaInfo;
use crate::select::Selected;

/// Times one establishment restarts after discovery invalidated its replica.
const MAX_DISCOVERY_RESTARTS: usize = 3;

// ============================================================================
// Established Session
// ============================================================================

/// An authenticated session bound to a replica.
pub struct Established {
    /// The live session.
    pub session: Box<dyn DirectorySession>,
    /// Replica the session is bound to.
    pub replica: Arc<ReplicaInfo>,
    /// Ticket acquired during negotiation, owned by the caller.
    pub ticket: Option<TicketHandle>,
    /// Protections the session negotiated.
    pub security: SecurityLevel,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("replica", self.replica.endpoint())
            .field("ticket", &self.ticket)
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Node Config
// ============================================================================

#[derive(Debug)]
struct NodeState {
    replicas: Vec<Arc<ReplicaInfo>>,
    needs_mappings: bool,
    needs_replicas: bool,
    needs_security: bool,
    server_security: SecurityLevel,
    service_credentials: Option<ServiceCredentials>,
}

/// One logical directory node.
pub struct NodeConfig {
    settings: NodeSettings,
    services: Services,
    race: RaceSettings,
    state: RwLock<NodeState>,
    deleted: AtomicBool,
    enabled: AtomicBool,
    available: AtomicBool,
    gate: CredentialGate,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeConfig {
    /// Creates a node from validated settings.
    ///
    /// Background tasks are started separately with
    /// [`start_background`](Self::start_background).
    #[must_use]
    pub fn new(settings: NodeSettings, services: Services, race: RaceSettings) -> Arc<Self> {
        let replicas = if settings.is_local_socket() {
            settings
                .primary_server()
                .map(local_socket_path)
                .map(|path| vec![ReplicaInfo::new(Endpoint::local_socket(path), true)])
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Arc::new(Self {
            state: RwLock::new(NodeState {
                replicas,
                needs_mappings: true,
                needs_replicas: true,
                needs_security: true,
                server_security: SecurityLevel::NONE,
                service_credentials: settings.service_credentials.clone(),
            }),
            enabled: AtomicBool::new(settings.enabled),
            deleted: AtomicBool::new(false),
            available: AtomicBool::new(true),
            gate: CredentialGate::new(),
            tasks: Mutex::new(Vec::new()),
            settings,
            services,
            race,
        })
    }

    /// Starts the refresh timer and the primary-name reachability watch.
    ///
    /// Does nothing outside a Tokio runtime.
    pub fn start_background(self: &Arc<Self>) {
        let Ok(runtime) = Handle::try_current() else {
            debug!(node = %self.name(), "no runtime, background tasks not started");
            return;
        };
        let mut tasks = self.tasks.lock();

        if let Some(period) = self.settings.refresh_interval() {
            let weak = Arc::downgrade(self);
            tasks.push(runtime.spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let Some(node) = weak.upgrade() else {
                        break;
                    };
                    trace!(node = %node.name(), "refresh timer fired");
                    node.flag_rediscovery();
                }
            }));
        }

        let primary = self
            .settings
            .primary_server()
            .filter(|_| !self.is_local_socket());
        if let (Some(provider), Some(primary)) = (&self.services.reachability, primary) {
            let mut events = provider.subscribe(&ReachabilityTarget::Host(primary.to_string()));
            let weak = Arc::downgrade(self);
            tasks.push(runtime.spawn(async move {
                let mut usable = true;
                while let Some(event) = events.recv().await {
                    let Some(node) = weak.upgrade() else {
                        break;
                    };
                    if event.is_usable() && !usable {
                        node.network_transition();
                    }
                    usable = event.is_usable();
                }
            }));
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Configuration UUID.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.settings.uuid
    }

    /// Settings the node was created from.
    #[must_use]
    pub const fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub(crate) const fn services(&self) -> &Services {
        &self.services
    }

    pub(crate) const fn race(&self) -> &RaceSettings {
        &self.race
    }

    pub(crate) const fn credential_gate(&self) -> &CredentialGate {
        &self.gate
    }

    /// Returns true for nodes reached over a local socket.
    #[must_use]
    pub fn is_local_socket(&self) -> bool {
        self.settings.is_local_socket()
    }

    /// Returns whether the configuration was deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Returns whether the node is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enables or disables the node.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Returns whether the last replica search found a usable replica.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Records availability, notifying the availability cache on change.
    pub fn set_available(&self, available: bool) {
        if self.available.swap(available, Ordering::AcqRel) != available {
            info!(node = %self.name(), available, "node availability changed");
            self.services.availability.set_available(self.name(), available);
        }
    }

    /// Required security: local policy united with server policy.
    #[must_use]
    pub fn required_security(&self) -> SecurityLevel {
        self.settings.local_security | self.state.read().server_security
    }

    /// Current replica set.
    #[must_use]
    pub fn replicas(&self) -> Vec<Arc<ReplicaInfo>> {
        self.state.read().replicas.clone()
    }

    /// Returns whether `replica` is in the current replica set.
    #[must_use]
    pub fn contains_replica(&self, replica: &Arc<ReplicaInfo>) -> bool {
        self.state
            .read()
            .replicas
            .iter()
            .any(|r| Arc::ptr_eq(r, replica))
    }

    /// Returns whether `replica` meets the node's required security.
    #[must_use]
    pub fn complies(&self, replica: &ReplicaInfo) -> bool {
        replica
            .offered_security(&self.settings.denied_mechanisms)
            .satisfies(self.required_security())
    }

    /// Replaces the stored service credentials.
    pub fn set_service_credentials(&self, credentials: Option<ServiceCredentials>) {
        self.state.write().service_credentials = credentials;
    }

    /// Returns whether any discovery step is still pending.
    #[must_use]
    pub fn discovery_pending(&self) -> bool {
        let state = self.state.read();
        state.needs_mappings || state.needs_replicas || state.needs_security
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Flags mappings, replicas and server policy for rediscovery.
    pub fn flag_rediscovery(&self) {
        let mut state = self.state.write();
        state.needs_mappings = true;
        state.needs_replicas = true;
        state.needs_security = true;
    }

    /// Reacts to a network change.
    ///
    /// Forces rediscovery and makes failed replicas eligible again.
    pub fn network_transition(&self) {
        self.flag_rediscovery();
        for replica in self.replicas() {
            replica.reset_check();
        }
        debug!(node = %self.name(), "network transition");
    }

    /// Marks the node deleted and stops its background tasks.
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(node = %self.name(), "node deleted");
    }

    /// Probes the node for a usable replica.
    ///
    /// Returns true when one was found. The probe session is closed.
    pub async fn check_failed(&self) -> bool {
        match self.find_suitable_replica(None, true, false).await {
            Some(Selected { mut session, .. }) => {
                let _ = session.unbind().await;
                true
            }
            None => false,
        }
    }

    pub(crate) async fn destroy_ticket(&self, ticket: &TicketHandle) {
        self.gate
            .destroy(self.services.credentials.as_ref(), ticket)
            .await;
    }

    // ------------------------------------------------------------------------
    // Replica Set
    // ------------------------------------------------------------------------

    /// Rebuilds the replica set from `discovered`, or from static settings.
    ///
    /// The primary server stays first and each IP address appears once.
    /// Replicas whose address survives are reused.
    pub async fn rebuild_replicas(
        &self,
        discovered: Option<&ReplicaList>,
    ) -> Vec<Arc<ReplicaInfo>> {
        if self.is_local_socket() {
            return self.replicas();
        }

        let discovered = discovered.filter(|list| !list.is_empty());
        let names = match discovered {
            Some(list) => ordered_names(self.settings.primary_server(), list),
            None => self.settings.servers.clone(),
        };

        let existing = self.replicas();
        let mut seen = HashSet::new();
        let mut rebuilt = Vec::new();

        for name in &names {
            let addrs = match self.services.resolver.resolve(name, self.settings.port).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    debug!(node = %self.name(), server = %name, error = %e, "server did not resolve");
                    continue;
                }
            };
            let supports_writes = discovered.map_or(true, |list| list.is_writable(name));

            for addr in addrs {
                if !seen.insert(addr.ip()) {
                    continue;
                }
                let reused = existing
                    .iter()
                    .find(|r| r.endpoint().socket_addr() == Some(addr))
                    .cloned();
                let replica = match reused {
                    Some(replica) => {
                        replica.set_supports_writes(supports_writes);
                        replica
                    }
                    None => {
                        let endpoint = Endpoint::tcp(name.clone(), addr, self.settings.use_tls);
                        let replica = ReplicaInfo::new(endpoint, supports_writes);
                        if let Some(provider) = &self.services.reachability {
                            replica.watch(provider);
                        }
                        replica
                    }
                };
                rebuilt.push(replica);
            }
        }

        if rebuilt.is_empty() && !existing.is_empty() {
            warn!(node = %self.name(), "no server resolved, keeping current replicas");
            return existing;
        }

        info!(node = %self.name(), replicas = rebuilt.len(), "replica set rebuilt");
        self.state.write().replicas.clone_from(&rebuilt);
        rebuilt
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Runs pending discovery steps through `session`.
    ///
    /// Returns true when the outcome invalidates `current`: the server now
    /// requires more than it offers, or it left the replica set.
    pub(crate) async fn run_pending_discovery(
        &self,
        session: &mut dyn DirectorySession,
        current: Option<&Arc<ReplicaInfo>>,
    ) -> bool {
        let (security, mappings, replicas) = {
            let state = self.state.read();
            (
                state.needs_security,
                state.needs_mappings,
                state.needs_replicas,
            )
        };
        let topology = Arc::clone(&self.services.topology);
        let mut invalidated = false;

        if security {
            if self.settings.discover_security {
                match topology.resolve_security_policy(self.name(), session).await {
                    Ok(level) => {
                        {
                            let mut state = self.state.write();
                            state.server_security = level;
                            state.needs_security = false;
                        }
                        debug!(node = %self.name(), required = %self.required_security(), "server security policy read");
                        invalidated |= current.is_some_and(|r| !self.complies(r));
                    }
                    Err(e) => warn!(node = %self.name(), error = %e, "security policy discovery failed"),
                }
            } else {
                self.state.write().needs_security = false;
            }
        }

        if mappings {
            if self.settings.discover_mappings {
                let loaded = match topology.resolve_schema(self.name(), session).await {
                    Ok(()) => topology.resolve_mappings(self.name(), session).await,
                    Err(e) => Err(e),
                };
                match loaded {
                    Ok(()) => self.state.write().needs_mappings = false,
                    Err(e) => warn!(node = %self.name(), error = %e, "mapping discovery failed"),
                }
            } else {
                self.state.write().needs_mappings = false;
            }
        }

        if replicas {
            if self.settings.discover_replicas && !self.is_local_socket() {
                match topology.resolve_replica_list(self.name(), session).await {
                    Ok(list) => {
                        self.rebuild_replicas(list.as_ref()).await;
                        self.state.write().needs_replicas = false;
                        invalidated |= current.is_some_and(|r| !self.contains_replica(r));
                    }
                    Err(e) => warn!(node = %self.name(), error = %e, "replica discovery failed"),
                }
            } else {
                self.state.write().needs_replicas = false;
            }
        }

        invalidated
    }

    /// Runs pending discovery for an existing session, keeping the session.
    pub async fn refresh_dynamic_data(
        &self,
        session: &mut dyn DirectorySession,
        current: Option<&Arc<ReplicaInfo>>,
    ) {
        if self.discovery_pending() && self.run_pending_discovery(session, current).await {
            debug!(node = %self.name(), "bound replica no longer preferred, keeping session");
        }
    }

    // ------------------------------------------------------------------------
    // Establishment
    // ------------------------------------------------------------------------

    /// Establishes a session with the stored service credentials, if any.
    #[instrument(skip(self, hint), fields(node = %self.name()))]
    pub async fn establish_anonymous(
        &self,
        hint: Option<&Arc<ReplicaInfo>>,
        want_writeable: bool,
    ) -> SessionResult<Established> {
        self.internal_establish(&AuthMode::Anonymous, hint, want_writeable)
            .await
    }

    /// Establishes a session authenticated with a password.
    #[instrument(skip(self, password, hint), fields(node = %self.name()))]
    pub async fn establish_with_credentials(
        &self,
        username: &str,
        password: &str,
        kerberos_id: Option<&str>,
        hint: Option<&Arc<ReplicaInfo>>,
        want_writeable: bool,
    ) -> SessionResult<Established> {
        let mode = AuthMode::Password {
            username: username.to_string(),
            password: password.to_string(),
            kerberos_id: kerberos_id.map(str::to_string),
        };
        self.internal_establish(&mode, hint, want_writeable).await
    }

    /// Establishes a session from an existing Kerberos ticket cache.
    #[instrument(skip(self, hint), fields(node = %self.name()))]
    pub async fn establish_with_kerberos(
        &self,
        kerberos_id: &str,
        hint: Option<&Arc<ReplicaInfo>>,
        want_writeable: bool,
    ) -> SessionResult<Established> {
        let mode = AuthMode::Kerberos {
            kerberos_id: kerberos_id.to_string(),
        };
        self.internal_establish(&mode, hint, want_writeable).await
    }

    /// Establishes a session for `mode`.
    pub async fn establish(
        &self,
        mode: &AuthMode,
        hint: Option<&Arc<ReplicaInfo>>,
        want_writeable: bool,
    ) -> SessionResult<Established> {
        match mode {
            AuthMode::Anonymous => self.establish_anonymous(hint, want_writeable).await,
            AuthMode::Password {
                username,
                password,
                kerberos_id,
            } => {
                self.establish_with_credentials(
                    username,
                    password,
                    kerberos_id.as_deref(),
                    hint,
                    want_writeable,
                )
                .await
            }
            AuthMode::Kerberos { kerberos_id } => {
                self.establish_with_kerberos(kerberos_id, hint, want_writeable)
                    .await
            }
        }
    }

    async fn internal_establish(
        &self,
        mode: &AuthMode,
        hint: Option<&Arc<ReplicaInfo>>,
        want_writeable: bool,
    ) -> SessionResult<Established> {
        if self.is_local_socket() && !mode.is_anonymous() {
            return Err(SessionError::unsupported(
                self.name(),
                "authenticated binds over a local socket",
            ));
        }

        let mut hint = hint.cloned();
        for _ in 0..=MAX_DISCOVERY_RESTARTS {
            let current = hint.take();
            let Some(Selected {
                mut session,
                replica,
            }) = self
                .find_suitable_replica(current.as_ref(), false, want_writeable)
                .await
            else {
                return Err(SessionError::unavailable(self.name()));
            };

            let negotiated = match self.authenticate(mode, session.as_mut(), &replica).await {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    warn!(node = %self.name(), replica = %replica.endpoint(), error = %e, "authentication failed");
                    let _ = session.unbind().await;
                    if e.is_connection_error() {
                        replica.mark_failed();
                        return Err(SessionError::unavailable(self.name()));
                    }
                    return Err(SessionError::auth_failed(self.name(), e));
                }
            };

            if self.discovery_pending()
                && self
                    .run_pending_discovery(session.as_mut(), Some(&replica))
                    .await
            {
                debug!(node = %self.name(), replica = %replica.endpoint(), "discovery invalidated replica, restarting search");
                let _ = session.unbind().await;
                if let Some(ticket) = &negotiated.ticket {
                    self.destroy_ticket(ticket).await;
                }
                continue;
            }

            return Ok(Established {
                session,
                replica,
                ticket: negotiated.ticket,
                security: negotiated.security,
            });
        }

        warn!(node = %self.name(), "replica set kept changing during establishment");
        Err(SessionError::unavailable(self.name()))
    }

    async fn authenticate(
        &self,
        mode: &AuthMode,
        session: &mut dyn DirectorySession,
        replica: &ReplicaInfo,
    ) -> SpiResult<Negotiated> {
        match mode {
            AuthMode::Anonymous => {
                let stored = self.state.read().service_credentials.clone();
                match stored.filter(|_| !self.is_local_socket()) {
                    Some(creds) => {
                        self.authenticate_using_credentials(
                            session,
                            replica,
                            &creds.username,
                            &creds.password,
                            creds.kerberos_id.as_deref(),
                        )
                        .await
                    }
                    None => Ok(Negotiated {
                        ticket: None,
                        security: transport_security(session.is_tls() || replica.endpoint().tls),
                    }),
                }
            }
            AuthMode::Password {
                username,
                password,
                kerberos_id,
            } => {
                self.authenticate_using_credentials(
                    session,
                    replica,
                    username,
                    password,
                    kerberos_id.as_deref(),
                )
                .await
            }
            AuthMode::Kerberos { kerberos_id } => {
                self.authenticate_using_kerberos(session, replica, kerberos_id)
                    .await
            }
        }
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("name", &self.settings.name)
            .field("uuid", &self.settings.uuid)
            .field("deleted", &self.is_deleted())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Drop for NodeConfig {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Discovered server names with the primary first.
fn ordered_names(primary: Option<&str>, list: &ReplicaList) -> Vec<String> {
    let mut names = list.all();
    if let Some(primary) = primary {
        names.retain(|n| !n.eq_ignore_ascii_case(primary));
        names.insert(0, primary.to_string());
    }
    names
}

/// Socket path named by an `ldapi://` server.
fn local_socket_path(server: &str) -> PathBuf {
    let encoded = server.get("ldapi://".len()..).unwrap_or_default();
    PathBuf::from(encoded.replace("%2F", "/").replace("%2f", "/"))
}
