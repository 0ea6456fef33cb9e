//! One network endpoint of a node.
//!
//! A [`ReplicaInfo`] is shared between the node's replica list, in-flight
//! probes and the connections bound to it. Its mutable state sits behind its
//! own lock. `reachable` is written only by the reachability subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ds_core::SecurityLevel;
use ds_spi::{
    DirectorySession, Endpoint, ReachabilityProvider, ReachabilityTarget, RootDse, Transport,
};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Probe and capability state of one replica.
#[derive(Debug, Clone)]
struct ReplicaState {
    verified: bool,
    unchecked: bool,
    supports_writes: bool,
    supported_security: SecurityLevel,
    root_dse: RootDse,
}

/// A replica endpoint with its verification and capability state.
#[derive(Debug)]
pub struct ReplicaInfo {
    endpoint: Endpoint,
    reachable: AtomicBool,
    state: RwLock<ReplicaState>,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaInfo {
    /// Creates an unchecked, reachable replica.
    #[must_use]
    pub fn new(endpoint: Endpoint, supports_writes: bool) -> Arc<Self> {
        let supported_security = if endpoint.tls {
            SecurityLevel::tls()
        } else {
            SecurityLevel::NONE
        };
        Arc::new(Self {
            endpoint,
            reachable: AtomicBool::new(true),
            state: RwLock::new(ReplicaState {
                verified: false,
                unchecked: true,
                supports_writes,
                supported_security,
                root_dse: RootDse::default(),
            }),
            subscription: Mutex::new(None),
        })
    }

    /// Subscribes to reachability changes of this replica's address.
    ///
    /// Must be called from within a Tokio runtime. Local-socket replicas are
    /// never watched.
    pub fn watch(self: &Arc<Self>, provider: &Arc<dyn ReachabilityProvider>) {
        let Some(addr) = self.endpoint.socket_addr() else {
            return;
        };
        let mut events = provider.subscribe(&ReachabilityTarget::Address(addr));
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(replica) = weak.upgrade() else {
                    break;
                };
                replica.set_reachable(event.is_usable());
            }
        });
        if let Some(previous) = self.subscription.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Returns the endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns whether the network reports the endpoint reachable.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Records a reachability change.
    ///
    /// Becoming reachable makes the replica eligible for a fresh check.
    pub fn set_reachable(&self, reachable: bool) {
        let previous = self.reachable.swap(reachable, Ordering::AcqRel);
        if reachable && !previous {
            self.state.write().unchecked = true;
        }
        if previous != reachable {
            debug!(replica = %self.endpoint, reachable, "replica reachability changed");
        }
    }

    /// Returns whether the last probe completed a handshake.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.state.read().verified
    }

    /// Returns whether the replica has not been probed since it last failed.
    #[must_use]
    pub fn is_unchecked(&self) -> bool {
        self.state.read().unchecked
    }

    /// Returns whether the replica accepts writes.
    #[must_use]
    pub fn supports_writes(&self) -> bool {
        self.state.read().supports_writes
    }

    /// Updates write capability after a replica-list refresh.
    pub fn set_supports_writes(&self, supports_writes: bool) {
        self.state.write().supports_writes = supports_writes;
    }

    /// Protections the replica offers.
    ///
    /// Mechanism bits are only included once the replica is verified.
    #[must_use]
    pub fn supported_security(&self) -> SecurityLevel {
        self.state.read().supported_security
    }

    /// Protections the replica offers once `denied` mechanisms are removed.
    #[must_use]
    pub fn offered_security(&self, denied: &[String]) -> SecurityLevel {
        let state = self.state.read();
        let mut level = if self.endpoint.tls {
            SecurityLevel::tls()
        } else {
            SecurityLevel::NONE
        };
        if state.verified {
            let allowed: Vec<&String> = state
                .root_dse
                .sasl_mechanisms
                .iter()
                .filter(|m| !denied.iter().any(|d| d.eq_ignore_ascii_case(m)))
                .collect();
            level |= SecurityLevel::from_mechanisms(&allowed);
        }
        level
    }

    /// SASL mechanisms advertised at the last successful probe.
    #[must_use]
    pub fn sasl_mechanisms(&self) -> Vec<String> {
        self.state.read().root_dse.sasl_mechanisms.clone()
    }

    /// Naming contexts advertised at the last successful probe.
    #[must_use]
    pub fn naming_contexts(&self) -> Vec<String> {
        self.state.read().root_dse.naming_contexts.clone()
    }

    /// Host name the server reported for itself.
    #[must_use]
    pub fn server_fqdn(&self) -> Option<String> {
        self.state.read().root_dse.dns_host_name.clone()
    }

    /// Kerberos service principal the server reported.
    #[must_use]
    pub fn service_principal(&self) -> Option<String> {
        self.state.read().root_dse.service_principal.clone()
    }

    /// Makes a failed replica eligible for a fresh check.
    pub fn reset_check(&self) {
        self.state.write().unchecked = true;
    }

    /// Forces a re-probe on next use.
    pub fn mark_failed(&self) {
        let mut state = self.state.write();
        state.verified = false;
        state.unchecked = true;
        trace!(replica = %self.endpoint, "replica marked failed");
    }

    /// Returns whether probing this replica is worthwhile.
    ///
    /// Reachable replicas with a stale failed verification are skipped until
    /// something resets them.
    #[must_use]
    pub fn should_attempt_check(&self) -> bool {
        if !self.is_reachable() {
            return false;
        }
        let state = self.state.read();
        state.unchecked || state.verified
    }

    /// Opens a session and, when due, verifies the replica.
    ///
    /// Returns `None` when the replica is unreachable or the probe failed.
    /// The session is connected but not bound.
    pub async fn probe(
        &self,
        transport: &dyn Transport,
        timeout: Duration,
        force_check: bool,
    ) -> Option<Box<dyn DirectorySession>> {
        if !self.is_reachable() {
            return None;
        }

        let mut session = match transport.connect(&self.endpoint, timeout).await {
            Ok(session) => session,
            Err(e) => {
                debug!(replica = %self.endpoint, error = %e, "connect failed");
                self.record_failure();
                return None;
            }
        };

        let due = {
            let state = self.state.read();
            force_check || state.unchecked || !state.verified
        };
        if !due {
            return Some(session);
        }

        match session.root_dse(timeout).await {
            Ok(dse) => {
                let tls = self.endpoint.tls || session.is_tls();
                let mut state = self.state.write();
                state.verified = true;
                state.unchecked = false;
                state.supported_security = security_for(tls, &dse.sasl_mechanisms);
                state.root_dse = dse;
                drop(state);
                trace!(replica = %self.endpoint, "replica verified");
                Some(session)
            }
            Err(e) => {
                debug!(replica = %self.endpoint, error = %e, "root DSE probe failed");
                self.record_failure();
                let _ = session.unbind().await;
                None
            }
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.write();
        state.verified = false;
        state.unchecked = false;
        state.supported_security = security_for(self.endpoint.tls, &[] as &[String]);
    }
}

impl Drop for ReplicaInfo {
    fn drop(&mut self) {
        if let Some(handle) = self.subscription.get_mut().take() {
            handle.abort();
        }
    }
}

fn security_for<S: AsRef<str>>(tls: bool, mechanisms: &[S]) -> SecurityLevel {
    let transport = if tls {
        SecurityLevel::tls()
    } else {
        SecurityLevel::NONE
    };
    transport | SecurityLevel::from_mechanisms(mechanisms)
}
