//! Process-wide pool flags.
//!
//! [`PoolState`] holds the sleep suspension flag and the single-flight guard
//! of the background health check. It is owned by the manager and shared by
//! reference with the tasks it spawns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Suspension flag and health-check single-flight guard.
#[derive(Debug, Default)]
pub struct PoolState {
    suspended: AtomicBool,
    check_active: AtomicBool,
    last_check: Mutex<Option<Instant>>,
    check_done: Notify,
}

impl PoolState {
    /// Creates an idle, unsuspended state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends reactions to network changes.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    /// Resumes reactions to network changes.
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    /// Returns whether reactions are suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Returns whether a health check is running.
    #[must_use]
    pub fn is_check_active(&self) -> bool {
        self.check_active.load(Ordering::Acquire)
    }

    /// Claims the health check slot.
    ///
    /// Succeeds when no check is running and either `force` is set or at
    /// least `min_interval` has passed since the last check started. The
    /// caller must call [`end_check`](Self::end_check) once done.
    pub fn try_begin_check(&self, force: bool, min_interval: Duration) -> bool {
        let mut last = self.last_check.lock();
        let due = force || last.map_or(true, |at| at.elapsed() >= min_interval);
        if !due {
            return false;
        }
        if self
            .check_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *last = Some(Instant::now());
        true
    }

    /// Releases the health check slot and wakes waiters.
    pub fn end_check(&self) {
        self.check_active.store(false, Ordering::Release);
        self.check_done.notify_waiters();
    }

    /// Waits until no health check is running.
    pub async fn wait_for_check(&self) {
        loop {
            let notified = self.check_done.notified();
            if !self.is_check_active() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_and_resume() {
        let state = PoolState::new();
        assert!(!state.is_suspended());
        state.suspend();
        assert!(state.is_suspended());
        state.resume();
        assert!(!state.is_suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn check_is_single_flight_and_spaced() {
        let state = PoolState::new();
        let spacing = Duration::from_secs(30);

        assert!(state.try_begin_check(false, spacing));
        assert!(!state.try_begin_check(true, spacing));
        state.end_check();

        assert!(!state.try_begin_check(false, spacing));
        assert!(state.try_begin_check(true, spacing));
        state.end_check();

        tokio::time::advance(spacing).await;
        assert!(state.try_begin_check(false, spacing));
        state.end_check();
    }

    #[tokio::test]
    async fn wait_returns_once_check_ends() {
        let state = std::sync::Arc::new(PoolState::new());
        assert!(state.try_begin_check(true, Duration::ZERO));

        let waiter = {
            let state = std::sync::Arc::clone(&state);
            tokio::spawn(async move { state.wait_for_check().await })
        };
        tokio::task::yield_now().await;
        state.end_check();
        waiter.await.unwrap();
        assert!(!state.is_check_active());
    }
}
