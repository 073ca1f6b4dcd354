//! Single-flight session refresh
//!
//! Two states: Idle and Refreshing. The first caller to `begin()` while Idle
//! becomes the leader and performs the refresh; every caller that arrives
//! while Refreshing is queued and receives the leader's result. However many
//! requests hit 401 together, one refresh call goes out.
//!
//! `enqueue` (inside `begin`) and `settle` are the only mutators of
//! `RefreshState`. The leader's guard settles on drop, so a cancelled or
//! panicking refresh still returns the coordinator to Idle and wakes the queue.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::Secret;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What the queued callers replay with.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Attach this access token as `Authorization: Bearer`.
    Bearer(Secret<String>),
    /// Cookies were renewed; replay without an Authorization header.
    Cookie,
}

/// The refresh failed; every queued caller sees the same failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("session refresh failed: {0}")]
pub struct RefreshFailed(pub String);

pub type Settled = Result<RefreshOutcome, RefreshFailed>;

/// Invariant: `in_flight == false` implies `queue.is_empty()`.
#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    queue: Vec<oneshot::Sender<Settled>>,
}

/// Result of asking to refresh.
pub enum Ticket<'a> {
    /// Perform the refresh, then settle through the guard.
    Leader(LeaderGuard<'a>),
    /// Wait for the in-flight refresh.
    Follower(oneshot::Receiver<Settled>),
}

#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idle -> Refreshing for the first caller; enqueue everyone else.
    pub fn begin(&self) -> Ticket<'_> {
        let mut state = self.lock();
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.queue.push(tx);
            debug!(queued = state.queue.len(), "refresh in flight, queued caller");
            metrics::counter!("pipeline_refresh_queued_total").increment(1);
            Ticket::Follower(rx)
        } else {
            state.in_flight = true;
            Ticket::Leader(LeaderGuard {
                coordinator: self,
                settled: false,
            })
        }
    }

    /// Deliver `result` to every queued caller and return to Idle.
    fn settle(&self, result: &Settled) {
        let queue = {
            let mut state = self.lock();
            state.in_flight = false;
            std::mem::take(&mut state.queue)
        };
        debug!(waiters = queue.len(), ok = result.is_ok(), "refresh settled");
        for waiter in queue {
            // A waiter whose request was dropped has nobody to tell.
            let _ = waiter.send(result.clone());
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().in_flight
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Run `refresh` if no refresh is in flight, otherwise wait for the one
    /// that is. Either way, return the shared result.
    pub async fn run<F, Fut>(&self, refresh: F) -> Settled
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Settled>,
    {
        match self.begin() {
            Ticket::Leader(guard) => {
                let result = refresh().await;
                guard.settle(&result);
                result
            }
            Ticket::Follower(rx) => rx
                .await
                .unwrap_or_else(|_| Err(RefreshFailed("refresh abandoned".into()))),
        }
    }
}

/// Held by the leader for the duration of the refresh.
pub struct LeaderGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl LeaderGuard<'_> {
    pub fn settle(mut self, result: &Settled) {
        self.settled = true;
        self.coordinator.settle(result);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("refresh leader dropped before settling, failing queued callers");
            self.coordinator
                .settle(&Err(RefreshFailed("refresh abandoned".into())));
        }
    }
}
