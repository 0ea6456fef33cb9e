//! Scripted collaborators for tests.
//!
//! Everything here is deterministic and driven by Tokio time, so races can
//! be replayed under a paused clock.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ds_core::{SaslMechanism, SecurityLevel};
use ds_spi::{
    CredentialStore, DirectorySession, Endpoint, EndpointAddr, HostResolver,
    NodeAvailabilityCache, ReachabilityEvent, ReachabilityProvider, ReachabilityTarget,
    ReplicaList, RootDse, SaslCredentials, SpiError, SpiResult, TicketHandle, TopologyProvider,
    Transport,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

// ============================================================================
// Transport
// ============================================================================

/// How one scripted endpoint behaves.
#[derive(Debug, Clone, Default)]
pub struct EndpointBehavior {
    delay: Duration,
    hang: bool,
    refuse: bool,
    fail_root_dse: bool,
    tls: bool,
    reject_binds: bool,
    time_out_binds: bool,
    password: Option<String>,
    root_dse: RootDse,
}

impl EndpointBehavior {
    /// An endpoint that answers immediately and accepts every bind.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays the connect by `delay`.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Never completes the connect.
    #[must_use]
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Refuses the connect.
    #[must_use]
    pub fn refuse(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Fails the root DSE read.
    #[must_use]
    pub fn fail_root_dse(mut self) -> Self {
        self.fail_root_dse = true;
        self
    }

    /// Reports the session as running over TLS.
    #[must_use]
    pub fn tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Advertises `mechanisms` in the root DSE.
    #[must_use]
    pub fn mechanisms(mut self, mechanisms: &[SaslMechanism]) -> Self {
        self.root_dse.sasl_mechanisms = mechanisms.iter().map(|m| m.as_str().to_string()).collect();
        self
    }

    /// Reports `fqdn` as the server host name.
    #[must_use]
    pub fn fqdn(mut self, fqdn: &str) -> Self {
        self.root_dse.dns_host_name = Some(fqdn.to_string());
        self
    }

    /// Accepts password binds only with `password`.
    #[must_use]
    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Rejects every bind.
    #[must_use]
    pub fn reject_binds(mut self) -> Self {
        self.reject_binds = true;
        self
    }

    /// Lets every bind run past its budget.
    #[must_use]
    pub fn time_out_binds(mut self) -> Self {
        self.time_out_binds = true;
        self
    }

    fn check_password(&self, password: &str) -> SpiResult<()> {
        if self.time_out_binds {
            return Err(SpiError::Timeout);
        }
        if self.reject_binds {
            return Err(SpiError::rejected("invalid credentials"));
        }
        match &self.password {
            Some(expected) if expected != password => {
                Err(SpiError::rejected("invalid credentials"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct TransportCounters {
    connects: Mutex<HashMap<String, usize>>,
    simple_binds: AtomicUsize,
    sasl_binds: AtomicUsize,
    gssapi_binds: AtomicUsize,
    unbinds: AtomicUsize,
}

/// Transport whose endpoints are scripted by address.
///
/// Endpoints are keyed by `ip:port`, or by path for local sockets. Unknown
/// endpoints refuse connections.
#[derive(Debug, Default)]
pub struct MockTransport {
    endpoints: Mutex<HashMap<String, EndpointBehavior>>,
    counters: Arc<TransportCounters>,
}

impl MockTransport {
    /// Creates a transport with no endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts (or re-scripts) the endpoint at `key`.
    pub fn add(&self, key: &str, behavior: EndpointBehavior) {
        self.endpoints.lock().insert(key.to_string(), behavior);
    }

    /// Connect attempts made to `key`.
    #[must_use]
    pub fn connects(&self, key: &str) -> usize {
        self.counters.connects.lock().get(key).copied().unwrap_or(0)
    }

    /// Connect attempts made to any endpoint.
    #[must_use]
    pub fn total_connects(&self) -> usize {
        self.counters.connects.lock().values().sum()
    }

    /// Simple binds attempted.
    #[must_use]
    pub fn simple_binds(&self) -> usize {
        self.counters.simple_binds.load(Ordering::SeqCst)
    }

    /// SASL and GSSAPI binds attempted.
    #[must_use]
    pub fn sasl_binds(&self) -> usize {
        self.counters.sasl_binds.load(Ordering::SeqCst)
            + self.counters.gssapi_binds.load(Ordering::SeqCst)
    }

    /// GSSAPI binds attempted.
    #[must_use]
    pub fn gssapi_binds(&self) -> usize {
        self.counters.gssapi_binds.load(Ordering::SeqCst)
    }

    /// Sessions closed.
    #[must_use]
    pub fn unbinds(&self) -> usize {
        self.counters.unbinds.load(Ordering::SeqCst)
    }
}

fn endpoint_key(endpoint: &Endpoint) -> String {
    match &endpoint.addr {
        EndpointAddr::Tcp(addr) => addr.to_string(),
        EndpointAddr::LocalSocket(path) => path.display().to_string(),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> SpiResult<Box<dyn DirectorySession>> {
        let key = endpoint_key(endpoint);
        *self.counters.connects.lock().entry(key.clone()).or_insert(0) += 1;
        let behavior = self.endpoints.lock().get(&key).cloned();
        let Some(behavior) = behavior else {
            return Err(SpiError::transport(format!("{key}: connection refused")));
        };

        if !behavior.delay.is_zero() {
            tokio::time::sleep(behavior.delay).await;
        }
        if behavior.hang {
            std::future::pending::<()>().await;
        }
        if behavior.refuse {
            return Err(SpiError::transport(format!("{key}: connection refused")));
        }

        Ok(Box::new(MockSession {
            tls: behavior.tls || endpoint.tls,
            behavior,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MockSession {
    behavior: EndpointBehavior,
    tls: bool,
    counters: Arc<TransportCounters>,
}

#[async_trait]
impl DirectorySession for MockSession {
    fn is_tls(&self) -> bool {
        self.tls
    }

    async fn root_dse(&mut self, _timeout: Duration) -> SpiResult<RootDse> {
        if self.behavior.fail_root_dse {
            return Err(SpiError::Protocol("root DSE unavailable".to_string()));
        }
        Ok(self.behavior.root_dse.clone())
    }

    async fn simple_bind(&mut self, _dn: &str, password: &str, _timeout: Duration) -> SpiResult<()> {
        self.counters.simple_binds.fetch_add(1, Ordering::SeqCst);
        self.behavior.check_password(password)
    }

    async fn sasl_bind(
        &mut self,
        mechanism: SaslMechanism,
        credentials: SaslCredentials<'_>,
        _timeout: Duration,
    ) -> SpiResult<()> {
        self.counters.sasl_binds.fetch_add(1, Ordering::SeqCst);
        if !self.behavior.root_dse.supports(mechanism) {
            return Err(SpiError::MechanismUnsupported(mechanism.to_string()));
        }
        self.behavior.check_password(credentials.password)
    }

    async fn gssapi_bind(
        &mut self,
        _ticket: &TicketHandle,
        _service_host: &str,
        _timeout: Duration,
    ) -> SpiResult<()> {
        self.counters.gssapi_binds.fetch_add(1, Ordering::SeqCst);
        if !self.behavior.root_dse.supports(SaslMechanism::Gssapi) {
            return Err(SpiError::MechanismUnsupported("GSSAPI".to_string()));
        }
        if self.behavior.time_out_binds {
            return Err(SpiError::Timeout);
        }
        if self.behavior.reject_binds {
            return Err(SpiError::rejected("ticket refused"));
        }
        Ok(())
    }

    async fn unbind(&mut self) -> SpiResult<()> {
        self.counters.unbinds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Credential Store
// ============================================================================

/// Credential store that hands out in-memory tickets.
#[derive(Debug, Default)]
pub struct MockCredentialStore {
    fail: std::sync::atomic::AtomicBool,
    acquired: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<TicketHandle>>,
}

impl MockCredentialStore {
    /// Creates a store that grants every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every acquisition fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Principals tickets were acquired for, in order.
    #[must_use]
    pub fn acquired(&self) -> Vec<String> {
        self.acquired.lock().clone()
    }

    /// Tickets destroyed, in order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<TicketHandle> {
        self.destroyed.lock().clone()
    }
}

#[async_trait]
impl CredentialStore for MockCredentialStore {
    async fn acquire_ticket(
        &self,
        principal: &str,
        _secret: Option<&str>,
    ) -> SpiResult<TicketHandle> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SpiError::CredentialStore("KDC unreachable".to_string()));
        }
        let mut acquired = self.acquired.lock();
        acquired.push(principal.to_string());
        Ok(TicketHandle::new(
            principal,
            format!("MEMORY:{}", acquired.len()),
        ))
    }

    async fn destroy_ticket(&self, ticket: &TicketHandle) -> SpiResult<()> {
        self.destroyed.lock().push(ticket.clone());
        Ok(())
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolver backed by a static host table.
///
/// Literal IP addresses resolve to themselves.
#[derive(Debug, Default)]
pub struct MockResolver {
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
    local: Mutex<HashSet<IpAddr>>,
}

impl MockResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `host` to `addrs`.
    pub fn add_host(&self, host: &str, addrs: &[&str]) {
        let addrs = addrs.iter().filter_map(|a| a.parse().ok()).collect();
        self.hosts.lock().insert(host.to_ascii_lowercase(), addrs);
    }

    /// Forgets `host`.
    pub fn remove_host(&self, host: &str) {
        self.hosts.lock().remove(&host.to_ascii_lowercase());
    }

    /// Declares `ip` as assigned to a local interface.
    pub fn add_local(&self, ip: &str) {
        if let Ok(ip) = ip.parse() {
            self.local.lock().insert(ip);
        }
    }
}

#[async_trait]
impl HostResolver for MockResolver {
    async fn resolve(&self, host: &str, port: u16) -> SpiResult<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        self.hosts
            .lock()
            .get(&host.to_ascii_lowercase())
            .map(|ips| ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
            .ok_or_else(|| SpiError::Resolve(host.to_string()))
    }

    fn is_local(&self, ip: &IpAddr) -> bool {
        self.local.lock().contains(ip)
    }
}

// ============================================================================
// Availability, Topology, Reachability
// ============================================================================

/// Availability cache that records every update.
#[derive(Debug, Default)]
pub struct RecordingAvailability {
    updates: Mutex<Vec<(String, bool)>>,
}

impl RecordingAvailability {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All updates, in order.
    #[must_use]
    pub fn updates(&self) -> Vec<(String, bool)> {
        self.updates.lock().clone()
    }

    /// Most recent value recorded for `node`.
    #[must_use]
    pub fn last(&self, node: &str) -> Option<bool> {
        self.updates
            .lock()
            .iter()
            .rev()
            .find(|(n, _)| n == node)
            .map(|(_, available)| *available)
    }
}

impl NodeAvailabilityCache for RecordingAvailability {
    fn set_available(&self, node: &str, available: bool) {
        self.updates.lock().push((node.to_string(), available));
    }
}

/// Topology provider with scripted answers and call counters.
#[derive(Debug, Default)]
pub struct ScriptedTopology {
    replicas: Mutex<Option<ReplicaList>>,
    security: Mutex<SecurityLevel>,
    replica_calls: AtomicUsize,
    mapping_calls: AtomicUsize,
    security_calls: AtomicUsize,
}

impl ScriptedTopology {
    /// Creates a topology that publishes nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the replica list returned by discovery.
    pub fn set_replicas(&self, list: Option<ReplicaList>) {
        *self.replicas.lock() = list;
    }

    /// Sets the server security policy.
    pub fn set_security(&self, level: SecurityLevel) {
        *self.security.lock() = level;
    }

    /// Replica discoveries performed.
    #[must_use]
    pub fn replica_calls(&self) -> usize {
        self.replica_calls.load(Ordering::SeqCst)
    }

    /// Mapping loads performed.
    #[must_use]
    pub fn mapping_calls(&self) -> usize {
        self.mapping_calls.load(Ordering::SeqCst)
    }

    /// Security policy reads performed.
    #[must_use]
    pub fn security_calls(&self) -> usize {
        self.security_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopologyProvider for ScriptedTopology {
    async fn resolve_replica_list(
        &self,
        _node: &str,
        _session: &mut dyn DirectorySession,
    ) -> SpiResult<Option<ReplicaList>> {
        self.replica_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.replicas.lock().clone())
    }

    async fn resolve_schema(
        &self,
        _node: &str,
        _session: &mut dyn DirectorySession,
    ) -> SpiResult<()> {
        Ok(())
    }

    async fn resolve_mappings(
        &self,
        _node: &str,
        _session: &mut dyn DirectorySession,
    ) -> SpiResult<()> {
        self.mapping_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resolve_security_policy(
        &self,
        _node: &str,
        _session: &mut dyn DirectorySession,
    ) -> SpiResult<SecurityLevel> {
        self.security_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.security.lock())
    }
}

/// Reachability provider driven by explicit [`send`](Self::send) calls.
#[derive(Debug, Default)]
pub struct ChannelReachability {
    subscribers: Mutex<Vec<(ReachabilityTarget, mpsc::Sender<ReachabilityEvent>)>>,
}

impl ChannelReachability {
    /// Creates a provider with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every live subscriber of `target`.
    ///
    /// Returns the number of subscribers reached.
    pub fn send(&self, target: &ReachabilityTarget, event: ReachabilityEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(_, tx)| !tx.is_closed());
        subscribers
            .iter()
            .filter(|(t, _)| t == target)
            .filter(|(_, tx)| tx.try_send(event).is_ok())
            .count()
    }

    /// Live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(_, tx)| !tx.is_closed());
        subscribers.len()
    }
}

impl ReachabilityProvider for ChannelReachability {
    fn subscribe(&self, target: &ReachabilityTarget) -> mpsc::Receiver<ReachabilityEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.lock().push((target.clone(), tx));
        rx
    }
}
