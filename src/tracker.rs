// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outstanding-Work Tracker
//!
//! Live count of in-flight handler invocations, used to block shutdown until
//! every accepted message finished processing. The consumer loop registers a
//! guard before invoking the handler; dropping the guard on settlement wakes
//! shutdown waiters.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::Notify;

/// Tracks handler invocations that were dispatched but have not settled.
#[derive(Default)]
pub struct WorkTracker {
    in_flight: AtomicUsize,
    drained: Notify,
}

impl WorkTracker {
    pub fn new() -> Arc<WorkTracker> {
        Arc::new(WorkTracker::default())
    }

    /// Registers one in-flight handler invocation. Dropping the guard marks
    /// it settled.
    pub fn register(self: &Arc<Self>) -> WorkGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Number of handler invocations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once no handler invocation is in flight.
    ///
    /// The count may keep growing briefly after consumer cancellation for
    /// deliveries dispatched just before it; the wait re-checks until the
    /// set converges to empty.
    pub async fn wait_idle(&self) {
        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// RAII registration of one in-flight handler invocation.
pub struct WorkGuard {
    tracker: Arc<WorkTracker>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn idle_tracker_resolves_immediately() {
        let tracker = WorkTracker::new();
        tracker.wait_idle().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_every_guard_drops() {
        let tracker = WorkTracker::new();
        let first = tracker.register();
        let second = tracker.register();
        assert_eq!(tracker.in_flight(), 2);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn tolerates_growth_while_draining() {
        let tracker = WorkTracker::new();
        let early = tracker.register();

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        // A delivery dispatched just before cancellation registers while the
        // drain is already waiting.
        sleep(Duration::from_millis(10)).await;
        let straggler = tracker.register();
        drop(early);

        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(straggler);
        waiter.await.unwrap();
    }
}
