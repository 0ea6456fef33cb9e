//! Lazily established sessions to one node.
//!
//! A [`Connection`] owns at most one live session. [`Connection::lock`]
//! hands it out as a [`SessionGuard`] that keeps the connection's mutex
//! held until [`Connection::unlock`]. Establishment, authentication and
//! discovery all run while that mutex is held and never touch the pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use ds_core::{ConnectionStatus, SecurityLevel, StatusTransition};
use ds_spi::{DirectorySession, SpiError, TicketHandle};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthMode, AuthState};
use crate::error::{SessionError, SessionResult};
use crate::node::{Established, NodeConfig};
use crate::replica::ReplicaInfo;

// ============================================================================
// Session Guard
// ============================================================================

struct ConnectionInner {
    session: Option<Box<dyn DirectorySession>>,
    session_id: u64,
    replica: Option<Arc<ReplicaInfo>>,
    ticket: Option<TicketHandle>,
    auth_mode: AuthMode,
    auth_state: AuthState,
}

/// Exclusive use of a connection's live session.
///
/// Return it with [`Connection::unlock`]. Dropping it instead releases the
/// connection's mutex but keeps the session as is.
pub struct SessionGuard {
    inner: OwnedMutexGuard<ConnectionInner>,
    owner: Uuid,
    session_id: u64,
    security: SecurityLevel,
}

impl SessionGuard {
    /// The live session.
    pub fn session(&mut self) -> &mut dyn DirectorySession {
        match self.inner.session.as_deref_mut() {
            Some(session) => session,
            None => unreachable!("a held session guard always has a session"),
        }
    }

    /// Replica the session is bound to.
    #[must_use]
    pub fn replica(&self) -> Option<&Arc<ReplicaInfo>> {
        self.inner.replica.as_ref()
    }

    /// Protections the session negotiated.
    #[must_use]
    pub const fn security_level(&self) -> SecurityLevel {
        self.security
    }

    /// Connection the guard belongs to.
    #[must_use]
    pub const fn connection_id(&self) -> Uuid {
        self.owner
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("owner", &self.owner)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A lazily established, self-healing session to one node.
pub struct Connection {
    id: Uuid,
    node: Arc<NodeConfig>,
    writeable: AtomicBool,
    status: AtomicU8,
    idle_ticks: AtomicU32,
    security: AtomicU32,
    inner: Arc<Mutex<ConnectionInner>>,
}

impl Connection {
    /// Creates a connection that has not yet established a session.
    #[must_use]
    pub fn new(node: Arc<NodeConfig>, auth_mode: AuthMode) -> Self {
        Self {
            id: Uuid::now_v7(),
            node,
            writeable: AtomicBool::new(false),
            status: AtomicU8::new(ConnectionStatus::Safe.as_u8()),
            idle_ticks: AtomicU32::new(0),
            security: AtomicU32::new(0),
            inner: Arc::new(Mutex::new(ConnectionInner {
                session: None,
                session_id: 0,
                replica: None,
                ticket: None,
                auth_mode,
                auth_state: AuthState::Unauthenticated,
            })),
        }
    }

    /// A fresh connection to the same node with another authentication mode.
    #[must_use]
    pub fn duplicate_with(&self, auth_mode: AuthMode) -> Self {
        let copy = Self::new(Arc::clone(&self.node), auth_mode);
        copy.set_writeable(self.is_writeable());
        copy
    }

    /// Unique identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Node the connection belongs to.
    #[must_use]
    pub const fn node(&self) -> &Arc<NodeConfig> {
        &self.node
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Returns whether sessions must land on a writable replica.
    #[must_use]
    pub fn is_writeable(&self) -> bool {
        self.writeable.load(Ordering::Acquire)
    }

    /// Requires sessions to land on a writable replica.
    pub fn set_writeable(&self, writeable: bool) {
        self.writeable.store(writeable, Ordering::Release);
    }

    /// Maintenance ticks since the session was last handed out.
    #[must_use]
    pub fn idle_ticks(&self) -> u32 {
        self.idle_ticks.load(Ordering::Acquire)
    }

    /// Protections of the live session, empty when there is none.
    #[must_use]
    pub fn security_level(&self) -> SecurityLevel {
        SecurityLevel::from_bits_truncate(self.security.load(Ordering::Acquire))
    }

    /// Authentication state.
    pub async fn auth_state(&self) -> AuthState {
        self.inner.lock().await.auth_state
    }

    /// Returns whether a session is currently open.
    pub async fn has_session(&self) -> bool {
        self.inner.lock().await.session.is_some()
    }

    // ------------------------------------------------------------------------
    // Lock / Unlock
    // ------------------------------------------------------------------------

    /// Hands out the live session, establishing one if needed.
    ///
    /// # Errors
    ///
    /// Fails without waiting when the node is deleted or disabled, or the
    /// connection is already known to be unsafe. Otherwise fails when no
    /// session could be established. Only an unreachable node makes the
    /// connection unsafe; an authentication failure leaves the status and
    /// the node's availability alone.
    pub async fn lock(&self) -> SessionResult<SessionGuard> {
        if self.node.is_deleted() {
            return Err(SessionError::NodeDeleted(self.node.name().to_string()));
        }
        if !self.node.is_enabled() {
            return Err(SessionError::NodeDisabled(self.node.name().to_string()));
        }
        if self.status() == ConnectionStatus::Unsafe {
            return Err(SessionError::unavailable(self.node.name()));
        }

        let mut inner = Arc::clone(&self.inner).lock_owned().await;
        match self.acquire(&mut inner).await {
            Ok(()) => {
                self.idle_ticks.store(0, Ordering::Release);
                self.set_status(ConnectionStatus::Safe);
                let session_id = inner.session_id;
                Ok(SessionGuard {
                    inner,
                    owner: self.id,
                    session_id,
                    security: self.security_level(),
                })
            }
            Err(e) => {
                if matches!(e, SessionError::Unavailable(_)) {
                    self.set_status(ConnectionStatus::Unsafe);
                }
                Err(e)
            }
        }
    }

    /// Returns a session handed out by [`lock`](Self::lock).
    ///
    /// With `failed` the session is closed, its replica is marked failed
    /// and the connection becomes `Unknown` so the next lock retries.
    ///
    /// # Panics
    ///
    /// Panics if `guard` was not handed out by this connection for its
    /// current session. The panic unwinds the calling task only; whether it
    /// ends the process is up to the runtime's panic handling.
    pub async fn unlock(&self, mut guard: SessionGuard, failed: bool) {
        assert_eq!(
            guard.owner, self.id,
            "session guard returned to a connection that did not issue it"
        );
        assert!(
            guard.inner.session.is_some() && guard.inner.session_id == guard.session_id,
            "stale session guard"
        );

        if failed {
            if let Some(mut session) = guard.inner.session.take() {
                let _ = session.unbind().await;
            }
            if let Some(replica) = &guard.inner.replica {
                replica.mark_failed();
            }
            self.security.store(0, Ordering::Release);
            self.set_status(ConnectionStatus::Unknown);
        }
    }

    async fn acquire(&self, inner: &mut ConnectionInner) -> SessionResult<()> {
        if inner.session.is_some() {
            if self.status() == ConnectionStatus::Safe {
                if let Some(session) = inner.session.as_deref_mut() {
                    self.node
                        .refresh_dynamic_data(session, inner.replica.as_ref())
                        .await;
                }
                return Ok(());
            }
            self.close_session(inner).await;
        }

        if inner.auth_state == AuthState::CredentialsRejected {
            return Err(SessionError::CredentialsRejected(
                self.node.name().to_string(),
            ));
        }

        let result = self
            .node
            .establish(&inner.auth_mode, inner.replica.as_ref(), self.is_writeable())
            .await;
        match result {
            Ok(established) => {
                self.install(inner, established).await;
                Ok(())
            }
            Err(
                e @ SessionError::AuthFailed {
                    source: SpiError::CredentialsRejected(_),
                    ..
                },
            ) if !inner.auth_mode.is_anonymous() => {
                warn!(
                    node = %self.node.name(),
                    identity = ?inner.auth_mode.identity(),
                    "credentials rejected, automatic retry suspended"
                );
                inner.auth_state = AuthState::CredentialsRejected;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn install(&self, inner: &mut ConnectionInner, established: Established) {
        if let Some(previous) = inner.ticket.take() {
            self.node.destroy_ticket(&previous).await;
        }
        inner.session = Some(established.session);
        inner.session_id += 1;
        inner.replica = Some(established.replica);
        inner.ticket = established.ticket;
        inner.auth_state = if inner.auth_mode.is_anonymous() {
            AuthState::Unauthenticated
        } else {
            AuthState::Authenticated
        };
        self.security
            .store(established.security.bits(), Ordering::Release);
        debug!(
            node = %self.node.name(),
            connection = %self.id,
            security = %established.security,
            "session established"
        );
    }

    async fn close_session(&self, inner: &mut ConnectionInner) {
        if let Some(mut session) = inner.session.take() {
            let _ = session.unbind().await;
            debug!(node = %self.node.name(), connection = %self.id, "session closed");
        }
        self.security.store(0, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// One maintenance tick.
    ///
    /// Skipped while the session is in use. Closes the session when the
    /// connection is not safe or has been idle for the node's limit.
    pub async fn periodic_task(&self) {
        let Ok(mut inner) = self.inner.try_lock() else {
            return;
        };
        let idle_max = self.node.settings().idle_max_count;
        let idle = self.idle_ticks();
        if inner.session.is_some()
            && (self.status() != ConnectionStatus::Safe || (idle_max > 0 && idle >= idle_max))
        {
            self.close_session(&mut inner).await;
            return;
        }
        self.idle_ticks.fetch_add(1, Ordering::AcqRel);
    }

    /// Makes an unsafe connection eligible for retry.
    pub fn network_transition(&self) {
        let promoted = self
            .status
            .compare_exchange(
                ConnectionStatus::Unsafe.as_u8(),
                ConnectionStatus::Unknown.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if promoted {
            self.announce(ConnectionStatus::Unsafe, ConnectionStatus::Unknown);
        }
    }

    /// Probes the node and marks the connection safe if it is reachable.
    ///
    /// Skipped while the connection's credentials stand rejected.
    pub async fn check_failed(&self) {
        let rejected = self
            .inner
            .try_lock()
            .is_ok_and(|inner| inner.auth_state == AuthState::CredentialsRejected);
        if rejected {
            return;
        }
        if self.node.check_failed().await {
            self.set_status(ConnectionStatus::Safe);
        }
    }

    /// Marks the connection unsafe and closes an idle session.
    pub async fn mark_unsafe_and_close_idle(&self) {
        self.set_status(ConnectionStatus::Unsafe);
        if let Ok(mut inner) = self.inner.try_lock() {
            self.close_session(&mut inner).await;
        }
    }

    /// Closes the session and destroys any ticket it holds.
    ///
    /// Waits for a caller holding the session to return it.
    pub async fn release(&self) {
        let mut inner = self.inner.lock().await;
        self.release_locked(&mut inner).await;
    }

    /// Like [`release`](Self::release) but gives up when the session is in
    /// use. Returns whether the connection was released.
    pub async fn release_if_idle(&self) -> bool {
        let Ok(mut inner) = self.inner.try_lock() else {
            return false;
        };
        self.release_locked(&mut inner).await;
        true
    }

    async fn release_locked(&self, inner: &mut ConnectionInner) {
        self.close_session(inner).await;
        if let Some(ticket) = inner.ticket.take() {
            self.node.destroy_ticket(&ticket).await;
        }
        inner.replica = None;
    }

    /// Replaces the credentials and resumes automatic retry.
    pub async fn update_credentials(&self, auth_mode: AuthMode) {
        let mut inner = self.inner.lock().await;
        self.close_session(&mut inner).await;
        if let Some(ticket) = inner.ticket.take() {
            self.node.destroy_ticket(&ticket).await;
        }
        inner.auth_mode = auth_mode;
        inner.auth_state = AuthState::Unauthenticated;
        drop(inner);
        self.network_transition();
        info!(node = %self.node.name(), connection = %self.id, "credentials updated");
    }

    fn set_status(&self, to: ConnectionStatus) {
        let from = ConnectionStatus::from_u8(self.status.swap(to.as_u8(), Ordering::AcqRel));
        if from != to {
            self.announce(from, to);
        }
    }

    fn announce(&self, from: ConnectionStatus, to: ConnectionStatus) {
        let transition = StatusTransition::now(self.node.name(), from, to);
        if transition.changes_availability() {
            info!(
                node = %transition.node,
                connection = %self.id,
                from = %transition.from,
                to = %transition.to,
                at = %transition.at,
                "connection status changed"
            );
        } else {
            debug!(
                node = %transition.node,
                connection = %self.id,
                from = %transition.from,
                to = %transition.to,
                "connection status changed"
            );
        }
        self.node
            .services()
            .availability
            .set_available(&transition.node, to.is_available());
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("node", &self.node.name())
            .field("status", &self.status())
            .field("writeable", &self.is_writeable())
            .finish_non_exhaustive()
    }
}
