//! Coordinated shutdown.
//!
//! The process exits when every configured equipment has run its scenario to
//! completion and no accept-side connection remains open. Completed passive
//! equipment leaves its connection up for the counterpart to close, so both
//! conditions are needed; tracking only completions would tear sockets out
//! from under a counterpart that is still reading.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

/// Settle time between the exit condition holding and shutdown, letting
/// final writes flush.
const EXIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct Inner {
    expected: HashSet<String>,
    completed: HashSet<String>,
    passive_open: HashSet<u64>,
}

/// Tracks scenario completion and open accept-side connections.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl CompletionTracker {
    /// Creates a tracker expecting the given equipment ids to complete.
    pub fn new(expected: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                expected: expected.into_iter().collect(),
                completed: HashSet::new(),
                passive_open: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Records an accept-side connection opening.
    pub fn passive_opened(&self, conn_id: u64) {
        let mut inner = self.lock();
        inner.passive_open.insert(conn_id);
        drop(inner);
    }

    /// Records an accept-side connection closing.
    pub fn passive_closed(&self, conn_id: u64) {
        let mut inner = self.lock();
        inner.passive_open.remove(&conn_id);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Records an equipment finishing its scenario. Reruns of the same
    /// equipment (a reconnecting counterpart replaying the plan) are
    /// idempotent.
    pub fn scenario_completed(&self, eqp_id: &str) {
        let mut inner = self.lock();
        if inner.completed.insert(eqp_id.to_string()) {
            info!(
                eqp_id = %eqp_id,
                completed = inner.completed.len(),
                expected = inner.expected.len(),
                "scenario completed"
            );
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Resolves once every expected equipment has completed and no
    /// accept-side connection remains open, then waits out a short grace
    /// period. Never resolves for an empty equipment set.
    pub async fn wait_for_shutdown(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_done() {
                break;
            }
            notified.await;
        }
        debug!(grace_ms = EXIT_GRACE.as_millis(), "exit condition met");
        tokio::time::sleep(EXIT_GRACE).await;
    }

    fn is_done(&self) -> bool {
        let inner = self.lock();
        !inner.expected.is_empty()
            && inner.expected.iter().all(|id| inner.completed.contains(id))
            && inner.passive_open.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tracker(ids: &[&str]) -> CompletionTracker {
        CompletionTracker::new(ids.iter().map(ToString::to_string))
    }

    #[test]
    fn done_requires_all_completions() {
        let t = tracker(&["A", "B"]);
        t.scenario_completed("A");
        assert!(!t.is_done());
        t.scenario_completed("B");
        assert!(t.is_done());
    }

    #[test]
    fn open_passive_connection_blocks_shutdown() {
        let t = tracker(&["A"]);
        t.passive_opened(1);
        t.scenario_completed("A");
        assert!(!t.is_done());
        t.passive_closed(1);
        assert!(t.is_done());
    }

    #[test]
    fn empty_equipment_set_never_completes() {
        let t = tracker(&[]);
        assert!(!t.is_done());
    }

    #[test]
    fn repeated_completion_is_idempotent() {
        let t = tracker(&["A", "B"]);
        t.scenario_completed("A");
        t.scenario_completed("A");
        assert!(!t.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_resolves_after_grace() {
        let t = std::sync::Arc::new(tracker(&["A"]));
        let waiter = {
            let t = std::sync::Arc::clone(&t);
            tokio::spawn(async move { t.wait_for_shutdown().await })
        };
        tokio::task::yield_now().await;
        t.scenario_completed("A");
        waiter.await.unwrap();
    }
}
