//! Replica selection.
//!
//! Replicas on a local interface are probed one at a time before anything
//! else, since local failures are immediate. All remaining candidates race:
//! each gets its own probe task and the first one that answers and meets
//! policy wins. Losers are aborted when the winner is chosen or the race
//! budget runs out.

use std::fmt;
use std::sync::Arc;

use ds_spi::DirectorySession;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

use crate::node::NodeConfig;
use crate::replica::ReplicaInfo;

/// A probed session and the replica it reached.
pub struct Selected {
    /// Connected, unbound session.
    pub session: Box<dyn DirectorySession>,
    /// Replica the session is connected to.
    pub replica: Arc<ReplicaInfo>,
}

impl fmt::Debug for Selected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selected")
            .field("replica", self.replica.endpoint())
            .finish_non_exhaustive()
    }
}

type ProbeOutcome = (Arc<ReplicaInfo>, Option<Box<dyn DirectorySession>>);

impl NodeConfig {
    /// Finds a connectable replica that meets the node's security policy.
    ///
    /// `current` is tried first when it still qualifies. With
    /// `force_check` every reachable replica is re-verified, including ones
    /// whose last verification failed. When nothing qualifies every probed
    /// replica is marked failed and, for read searches, the node is flagged
    /// unavailable.
    pub async fn find_suitable_replica(
        &self,
        current: Option<&Arc<ReplicaInfo>>,
        force_check: bool,
        want_writeable: bool,
    ) -> Option<Selected> {
        let open_close = self.settings().open_close_timeout();
        let transport = Arc::clone(&self.services().transport);

        if self.is_local_socket() {
            let replica = self.replicas().into_iter().next()?;
            let session = replica.probe(transport.as_ref(), open_close, force_check).await;
            return match session {
                Some(session) => {
                    self.set_available(true);
                    Some(Selected { session, replica })
                }
                None => {
                    replica.mark_failed();
                    if !want_writeable {
                        self.set_available(false);
                    }
                    None
                }
            };
        }

        let mut replicas = self.replicas();
        if replicas.is_empty() && self.settings().primary_server().is_some() {
            replicas = self.rebuild_replicas(None).await;
        }

        let qualifies = |replica: &ReplicaInfo| !want_writeable || replica.supports_writes();
        let mut probed: Vec<Arc<ReplicaInfo>> = Vec::new();

        // The bound replica comes first.
        if let Some(current) = current.filter(|r| qualifies(r) && self.contains_replica(r)) {
            if let Some(session) = self
                .probe_one(current, open_close, force_check)
                .await
            {
                self.set_available(true);
                return Some(Selected {
                    session,
                    replica: Arc::clone(current),
                });
            }
            probed.push(Arc::clone(current));
        }

        // Local interfaces, synchronously.
        let resolver = Arc::clone(&self.services().resolver);
        let mut remote = Vec::new();
        for replica in replicas {
            if !qualifies(&replica) || probed.iter().any(|p| Arc::ptr_eq(p, &replica)) {
                continue;
            }
            let is_local = replica
                .endpoint()
                .socket_addr()
                .is_some_and(|addr| resolver.is_local(&addr.ip()));
            if !is_local {
                remote.push(replica);
                continue;
            }
            let budget = self.race().local_probe_timeout();
            if let Some(session) = self.probe_one(&replica, budget, force_check).await {
                trace!(node = %self.name(), replica = %replica.endpoint(), "selected local replica");
                self.set_available(true);
                return Some(Selected { session, replica });
            }
            probed.push(replica);
        }

        // Everything else races.
        let candidates: Vec<Arc<ReplicaInfo>> = remote
            .into_iter()
            .filter(|r| r.is_reachable() && (force_check || r.should_attempt_check()))
            .take(self.race().max_candidates)
            .collect();

        if !candidates.is_empty() {
            probed.extend(candidates.iter().cloned());
            if let Some(selected) = self.race_candidates(candidates, force_check).await {
                self.set_available(true);
                return Some(selected);
            }
        }

        for replica in &probed {
            replica.mark_failed();
        }
        if !want_writeable {
            self.set_available(false);
        }
        debug!(node = %self.name(), probed = probed.len(), want_writeable, "no suitable replica");
        None
    }

    /// Probes one replica and keeps the session only if it complies.
    async fn probe_one(
        &self,
        replica: &Arc<ReplicaInfo>,
        budget: std::time::Duration,
        force_check: bool,
    ) -> Option<Box<dyn DirectorySession>> {
        let transport = self.services().transport.as_ref();
        let mut session = timeout(budget, replica.probe(transport, budget, force_check))
            .await
            .ok()
            .flatten()?;
        if self.complies(replica) {
            return Some(session);
        }
        debug!(node = %self.name(), replica = %replica.endpoint(), "replica does not meet security policy");
        let _ = session.unbind().await;
        None
    }

    async fn race_candidates(
        &self,
        candidates: Vec<Arc<ReplicaInfo>>,
        force_check: bool,
    ) -> Option<Selected> {
        let open_close = self.settings().open_close_timeout();
        let deadline = Instant::now() + self.race().budget(open_close);
        let mut probes: JoinSet<ProbeOutcome> = JoinSet::new();

        for replica in candidates {
            let transport = Arc::clone(&self.services().transport);
            probes.spawn(async move {
                let session = timeout(
                    open_close,
                    replica.probe(transport.as_ref(), open_close, force_check),
                )
                .await
                .ok()
                .flatten();
                (replica, session)
            });
        }

        let mut winner = None;
        loop {
            match timeout_at(deadline, probes.join_next()).await {
                Ok(Some(Ok((replica, Some(mut session))))) => {
                    if self.complies(&replica) {
                        trace!(node = %self.name(), replica = %replica.endpoint(), "replica won race");
                        winner = Some(Selected { session, replica });
                        break;
                    }
                    debug!(node = %self.name(), replica = %replica.endpoint(), "responder does not meet security policy");
                    let _ = session.unbind().await;
                }
                Ok(Some(Ok((_, None)))) => {}
                Ok(Some(Err(e))) => debug!(node = %self.name(), error = %e, "probe task failed"),
                Ok(None) => break,
                Err(_) => {
                    debug!(node = %self.name(), "race budget exhausted");
                    break;
                }
            }
        }

        probes.abort_all();
        winner
    }
}
