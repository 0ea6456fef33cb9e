//! Connection pool.
//!
//! The pool mutex guards only the map of shared connections and the list of
//! authenticated ones. It is never held while a connection establishes,
//! authenticates or releases a session; those paths can block on the
//! network or the credential store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ds_core::{ConnectionStatus, PoolSettings};
use ds_spi::Services;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthMode;
use crate::connection::Connection;
use crate::error::{SessionError, SessionResult};
use crate::registry::NodeRegistry;
use crate::state::PoolState;

#[derive(Default)]
struct PoolInner {
    connections: HashMap<String, Arc<Connection>>,
    authenticated: Vec<Arc<Connection>>,
}

impl PoolInner {
    fn all(&self) -> Vec<Arc<Connection>> {
        self.connections
            .values()
            .chain(self.authenticated.iter())
            .cloned()
            .collect()
    }
}

struct Shared {
    registry: Arc<NodeRegistry>,
    pool: Mutex<PoolInner>,
    state: PoolState,
    settings: PoolSettings,
}

/// Pool of shared directory connections.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Creates a manager with its own node registry.
    #[must_use]
    pub fn new(services: Services, settings: PoolSettings) -> Self {
        let registry = Arc::new(NodeRegistry::new(services, settings.race.clone()));
        Self::with_registry(registry, settings)
    }

    /// Creates a manager over an existing registry.
    #[must_use]
    pub fn with_registry(registry: Arc<NodeRegistry>, settings: PoolSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                pool: Mutex::new(PoolInner::default()),
                state: PoolState::new(),
                settings,
            }),
        }
    }

    /// Node registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.shared.registry
    }

    /// Pool flags.
    #[must_use]
    pub fn state(&self) -> &PoolState {
        &self.shared.state
    }

    /// Number of pooled shared connections.
    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.shared.pool.lock().connections.len()
    }

    /// Number of retained authenticated connections.
    #[must_use]
    pub fn authenticated_len(&self) -> usize {
        self.shared.pool.lock().authenticated.len()
    }

    // ------------------------------------------------------------------------
    // Connection Lookup
    // ------------------------------------------------------------------------

    /// Returns the shared anonymous connection to `name`.
    ///
    /// A safe pooled connection is returned as is. An unknown one is
    /// revalidated first and evicted if that fails. A new connection is
    /// validated before it is returned; local-socket connections are never
    /// pooled.
    ///
    /// # Errors
    ///
    /// Fails when the node is unknown, disabled or deleted, or when no
    /// session can be established.
    #[instrument(skip(self))]
    pub async fn get_connection(&self, name: &str) -> SessionResult<Arc<Connection>> {
        let pooled = self.shared.pool.lock().connections.get(name).cloned();

        if let Some(conn) = pooled {
            if conn.node().is_deleted() {
                self.evict(name, &conn);
                release_evicted(conn).await;
            } else if !conn.node().is_enabled() {
                return Err(SessionError::NodeDisabled(name.to_string()));
            } else {
                match conn.status() {
                    ConnectionStatus::Safe => return Ok(conn),
                    ConnectionStatus::Unknown => {
                        if let Err(e) = validate(&conn).await {
                            self.evict(name, &conn);
                            release_evicted(conn).await;
                            return Err(e);
                        }
                        return Ok(conn);
                    }
                    ConnectionStatus::Unsafe => {
                        self.launch_check_failed(false);
                        return Err(SessionError::unavailable(name));
                    }
                }
            }
        }

        let node = self.shared.registry.node_for(name)?;
        if !node.is_enabled() {
            return Err(SessionError::NodeDisabled(name.to_string()));
        }

        let conn = if node.is_local_socket() {
            Arc::new(Connection::new(node, AuthMode::Anonymous))
        } else {
            let mut pool = self.shared.pool.lock();
            let entry = pool
                .connections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Connection::new(node, AuthMode::Anonymous)));
            Arc::clone(entry)
        };

        validate(&conn).await?;
        Ok(conn)
    }

    /// Replaces `conn` with a writeable clone bound with a password.
    ///
    /// The shared connection is never modified. On success the clone is
    /// retained for maintenance and `conn` points at it.
    ///
    /// # Errors
    ///
    /// Fails when the node is unreachable or the credentials are rejected.
    #[instrument(skip(self, conn, password), fields(node = %conn.node().name()))]
    pub async fn auth_connection(
        &self,
        conn: &mut Arc<Connection>,
        username: &str,
        password: &str,
        kerberos_id: Option<&str>,
    ) -> SessionResult<()> {
        let mode = AuthMode::Password {
            username: username.to_string(),
            password: password.to_string(),
            kerberos_id: kerberos_id.map(str::to_string),
        };
        self.authenticate_clone(conn, mode).await
    }

    /// Replaces `conn` with a writeable clone bound through Kerberos.
    ///
    /// # Errors
    ///
    /// Fails when the node is unreachable or the ticket is refused.
    #[instrument(skip(self, conn), fields(node = %conn.node().name()))]
    pub async fn auth_connection_kerberos(
        &self,
        conn: &mut Arc<Connection>,
        kerberos_id: &str,
    ) -> SessionResult<()> {
        let mode = AuthMode::Kerberos {
            kerberos_id: kerberos_id.to_string(),
        };
        self.authenticate_clone(conn, mode).await
    }

    async fn authenticate_clone(
        &self,
        conn: &mut Arc<Connection>,
        mode: AuthMode,
    ) -> SessionResult<()> {
        let clone = Arc::new(conn.duplicate_with(mode));
        clone.set_writeable(true);

        validate(conn).await?;
        validate(&clone).await?;

        self.shared.pool.lock().authenticated.push(Arc::clone(&clone));
        *conn = clone;
        Ok(())
    }

    fn evict(&self, name: &str, conn: &Arc<Connection>) {
        let mut pool = self.shared.pool.lock();
        if pool
            .connections
            .get(name)
            .is_some_and(|pooled| Arc::ptr_eq(pooled, conn))
        {
            pool.connections.remove(name);
            debug!(node = %name, "connection evicted");
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// One maintenance sweep.
    ///
    /// Connections of deleted nodes and idle safe connections held only by
    /// the pool are evicted and released after the pool mutex is dropped.
    /// A session still in use is released once its holder returns it.
    /// Every other connection runs its own tick. A health check is launched
    /// if any survivor is not safe.
    pub async fn periodic_task(&self) {
        if self.shared.state.is_suspended() {
            return;
        }

        let (survivors, evicted) = {
            let mut pool = self.shared.pool.lock();
            let mut survivors = Vec::new();
            let mut evicted = Vec::new();
            let PoolInner {
                connections,
                authenticated,
            } = &mut *pool;

            connections.retain(|_, conn| sweep(conn, &mut survivors, &mut evicted));
            authenticated.retain(|conn| sweep(conn, &mut survivors, &mut evicted));
            (survivors, evicted)
        };

        for conn in &survivors {
            conn.periodic_task().await;
        }
        let needs_check = survivors
            .iter()
            .any(|conn| conn.status() != ConnectionStatus::Safe);
        drop(survivors);

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "releasing evicted connections");
            join_all(evicted.into_iter().map(release_evicted)).await;
        }

        if needs_check {
            self.launch_check_failed(false);
        }
    }

    /// Probes every connection that is not safe.
    ///
    /// Runs outside the pool mutex. Failures only show up as a connection
    /// staying unsafe.
    pub async fn check_failed(&self) {
        if self.shared.state.is_suspended() {
            return;
        }
        let failing: Vec<Arc<Connection>> = self
            .shared
            .pool
            .lock()
            .all()
            .into_iter()
            .filter(|conn| conn.status() != ConnectionStatus::Safe)
            .collect();

        if failing.is_empty() {
            return;
        }
        debug!(count = failing.len(), "checking failed connections");
        join_all(failing.iter().map(|conn| conn.check_failed())).await;
    }

    /// Starts a background health check.
    ///
    /// Returns false when a check is already running, the last one ran too
    /// recently and `force` is not set, the pool is suspended, or there is
    /// no runtime.
    pub fn launch_check_failed(&self, force: bool) -> bool {
        let state = &self.shared.state;
        if state.is_suspended() {
            return false;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("no runtime, health check not started");
            return false;
        };
        if !state.try_begin_check(force, self.shared.settings.check_failed_interval()) {
            return false;
        }

        let manager = self.clone();
        runtime.spawn(async move {
            manager.check_failed().await;
            manager.shared.state.end_check();
        });
        true
    }

    /// Suspends reactions to network changes and closes idle sessions.
    ///
    /// Every connection is marked unsafe.
    pub async fn system_going_to_sleep(&self) {
        info!("system going to sleep, suspending connection maintenance");
        self.shared.state.suspend();
        let all = self.shared.pool.lock().all();
        for conn in &all {
            conn.mark_unsafe_and_close_idle().await;
        }
    }

    /// Resumes reactions and treats the wake-up as a network change.
    pub fn system_will_power_on(&self) {
        info!("system powered on, resuming connection maintenance");
        self.shared.state.resume();
        self.network_transition();
    }

    /// Reacts to a change of network configuration.
    ///
    /// Every node is flagged for rediscovery, unsafe connections become
    /// retry-eligible and a health check is forced.
    pub fn network_transition(&self) {
        if self.shared.state.is_suspended() {
            return;
        }
        self.shared.registry.network_transition();
        let all = self.shared.pool.lock().all();
        for conn in &all {
            conn.network_transition();
        }
        self.launch_check_failed(true);
    }

    /// Runs [`periodic_task`](Self::periodic_task) on the configured
    /// maintenance interval until the handle is dropped.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime.
    #[must_use]
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        let period = self
            .shared
            .settings
            .maintenance_interval()
            .max(Duration::from_secs(1));
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.periodic_task().await;
            }
        });
        MaintenanceHandle { task }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("pooled", &self.pool_len())
            .field("authenticated", &self.authenticated_len())
            .field("suspended", &self.shared.state.is_suspended())
            .finish_non_exhaustive()
    }
}

/// Keeps the maintenance task alive; dropping it stops the task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    task: JoinHandle<()>,
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn validate(conn: &Connection) -> SessionResult<()> {
    let guard = conn.lock().await?;
    conn.unlock(guard, false).await;
    Ok(())
}

/// Releases an evicted connection without waiting on a session holder.
async fn release_evicted(conn: Arc<Connection>) {
    if conn.release_if_idle().await {
        return;
    }
    debug!(connection = %conn.id(), "evicted connection in use, release deferred");
    tokio::spawn(async move { conn.release().await });
}

fn sweep(
    conn: &Arc<Connection>,
    survivors: &mut Vec<Arc<Connection>>,
    evicted: &mut Vec<Arc<Connection>>,
) -> bool {
    let idle_safe = Arc::strong_count(conn) == 1 && conn.status() == ConnectionStatus::Safe;
    if conn.node().is_deleted() || idle_safe {
        evicted.push(Arc::clone(conn));
        false
    } else {
        survivors.push(Arc::clone(conn));
        true
    }
}
