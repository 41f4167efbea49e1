//! Single-flight coordination of access token refreshes.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

/// Why a shared refresh did not produce a new access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailure {
    pub message: String,
    /// The leader went away before the refresh finished. The session itself may still be valid.
    pub abandoned: bool,
}

impl RefreshFailure {
    pub fn new(message: impl Into<String>) -> RefreshFailure {
        RefreshFailure {
            message: message.into(),
            abandoned: false,
        }
    }

    pub fn abandoned() -> RefreshFailure {
        RefreshFailure {
            message: "token refresh was abandoned".to_owned(),
            abandoned: true,
        }
    }
}

/// Outcome handed to every caller waiting on a refresh.
pub type RefreshOutcome = Result<String, RefreshFailure>;

#[derive(Default)]
struct State {
    in_flight: bool,
    pending: VecDeque<oneshot::Sender<RefreshOutcome>>,
}

/// Tracks whether a refresh is in flight and which callers are waiting on it.
///
/// At most one [`RefreshGuard`] exists at any time. Everyone else asking while it is alive gets
/// a [`Ticket::Wait`] that resolves once the guard is settled.
#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<State>,
}

/// Result of [`RefreshCoordinator::acquire_or_enqueue`].
pub enum Ticket<'a> {
    /// The caller must perform the refresh and settle the guard.
    Lead(RefreshGuard<'a>),
    /// Another caller is refreshing; await the receiver for its outcome.
    Wait(oneshot::Receiver<RefreshOutcome>),
}

impl RefreshCoordinator {
    pub fn new() -> RefreshCoordinator {
        RefreshCoordinator::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The state is never left half-updated, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Becomes the refresh leader if no refresh is in flight, otherwise joins the queue.
    pub fn acquire_or_enqueue(&self) -> Ticket<'_> {
        let mut state = self.lock();

        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.pending.push_back(tx);
            Ticket::Wait(rx)
        } else {
            state.in_flight = true;
            Ticket::Lead(RefreshGuard {
                coordinator: self,
                settled: false,
            })
        }
    }

    /// Returns true while a refresh is outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.lock().in_flight
    }

    /// Number of callers currently waiting on the outstanding refresh.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Hands `outcome` to every waiter in enqueue order and clears the in-flight flag, all under
    /// one lock so no waiter can observe a partially settled refresh. Returns the number of
    /// waiters that were released.
    fn settle(&self, outcome: RefreshOutcome) -> usize {
        let mut state = self.lock();
        let waiters = state.pending.len();

        for tx in state.pending.drain(..) {
            // A waiter whose caller went away has nothing left to resume.
            let _ = tx.send(outcome.clone());
        }

        state.in_flight = false;
        waiters
    }
}

/// Proof of refresh leadership.
///
/// Dropping the guard without calling [`RefreshGuard::settle`] fails all waiters, so a cancelled
/// leader never leaves the queue stranded.
pub struct RefreshGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl RefreshGuard<'_> {
    /// Releases all waiters with `outcome`. Returns how many were waiting.
    pub fn settle(mut self, outcome: RefreshOutcome) -> usize {
        self.settled = true;
        self.coordinator.settle(outcome)
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            log::warn!("token refresh abandoned before completion");
            self.coordinator.settle(Err(RefreshFailure::abandoned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead(coordinator: &RefreshCoordinator) -> RefreshGuard<'_> {
        match coordinator.acquire_or_enqueue() {
            Ticket::Lead(guard) => guard,
            Ticket::Wait(_) => panic!("expected to lead the refresh"),
        }
    }

    fn wait(coordinator: &RefreshCoordinator) -> oneshot::Receiver<RefreshOutcome> {
        match coordinator.acquire_or_enqueue() {
            Ticket::Wait(rx) => rx,
            Ticket::Lead(_) => panic!("expected to wait for the refresh"),
        }
    }

    #[test]
    fn only_one_leader_at_a_time() {
        let coordinator = RefreshCoordinator::new();
        let guard = lead(&coordinator);

        assert!(coordinator.is_refreshing());

        let _first = wait(&coordinator);
        let _second = wait(&coordinator);
        assert_eq!(coordinator.pending(), 2);

        assert_eq!(guard.settle(Ok("token".into())), 2);
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.pending(), 0);

        // A new cycle can start once the previous one settled.
        let _guard = lead(&coordinator);
    }

    #[test]
    fn settle_resolves_every_waiter() {
        let coordinator = RefreshCoordinator::new();
        let guard = lead(&coordinator);
        let mut first = wait(&coordinator);
        let mut second = wait(&coordinator);

        guard.settle(Ok("fresh".into()));

        assert_eq!(first.try_recv().unwrap(), Ok("fresh".to_string()));
        assert_eq!(second.try_recv().unwrap(), Ok("fresh".to_string()));
    }

    #[test]
    fn settle_rejects_every_waiter() {
        let coordinator = RefreshCoordinator::new();
        let guard = lead(&coordinator);
        let mut waiter = wait(&coordinator);

        guard.settle(Err(RefreshFailure::new("refresh rejected")));

        assert_eq!(
            waiter.try_recv().unwrap(),
            Err(RefreshFailure::new("refresh rejected"))
        );
    }

    #[test]
    fn dropped_guard_fails_waiters() {
        let coordinator = RefreshCoordinator::new();
        let guard = lead(&coordinator);
        let mut waiter = wait(&coordinator);

        drop(guard);

        assert!(!coordinator.is_refreshing());
        assert_eq!(waiter.try_recv().unwrap(), Err(RefreshFailure::abandoned()));
    }

    #[test]
    fn waiter_that_went_away_does_not_block_settle() {
        let coordinator = RefreshCoordinator::new();
        let guard = lead(&coordinator);
        drop(wait(&coordinator));
        let mut waiter = wait(&coordinator);

        assert_eq!(guard.settle(Ok("t".into())), 2);
        assert_eq!(waiter.try_recv().unwrap(), Ok("t".to_string()));
    }
}
