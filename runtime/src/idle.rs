// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The parking array: coordinates a scheduling group's idle workers so an
//! enqueuer can wake exactly one of them instead of broadcasting.
//!
//! Built on its own private [`Parker`] instance (never shared with the
//! process-wide synchronization parker) so that re-enqueueing a woken task
//! from inside a `wake` call — which `crate::group::reschedule` does, via
//! `notify_one` below — never recurses into the bucket lock its own
//! caller might be holding.

use crate::park::{Parker, WaitResult};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

pub(crate) struct Idle {
    parker: Parker,
    /// Bumped on every enqueue; workers record the value they observed
    /// before publishing themselves as parked, and recheck it on their
    /// final rescan so a task enqueued concurrently with a park is never
    /// missed (see `SPEC_FULL.md` §4.4's "non-empty parking array + epoch
    /// bump" ordering).
    epoch: AtomicU32,
    parked: AtomicUsize,
}

impl Idle {
    pub(crate) fn new() -> Self {
        Self {
            parker: Parker::new(),
            epoch: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    fn addr(&self) -> u64 {
        Parker::key_of(&self.epoch)
    }

    pub(crate) fn snapshot(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn any_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst) > 0
    }

    /// Publishes this worker as parked and waits until woken, `deadline`
    /// passes, or the epoch has already moved past `since` (a task was
    /// enqueued between the caller's last scan and this call).
    pub(crate) fn park(&self, since: u32, deadline: Option<Instant>) {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let _ = self.parker.wait_thread(self.addr(), &self.epoch, since, deadline);
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wakes one parked worker, if any. Called by the enqueue path after
    /// the new task is already visible to the group.
    pub(crate) fn notify_one(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.any_parked() {
            self.parker.wake(self.addr(), 1);
        }
    }

    pub(crate) fn notify_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.parker.wake(self.addr(), u32::MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn notify_one_wakes_parked_worker() {
        let idle = Arc::new(Idle::new());
        let idle2 = idle.clone();
        let handle = thread::spawn(move || {
            let since = idle2.snapshot();
            idle2.park(since, Some(Instant::now() + Duration::from_secs(5)));
        });
        thread::sleep(Duration::from_millis(20));
        idle.notify_one();
        handle.join().unwrap();
    }
}
