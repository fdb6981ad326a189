// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A monotonically decreasing counter that releases every waiter once it
//! reaches zero, e.g. for fanning a task out into N children and waiting
//! for all of them.

use crate::park::{park_on, Parker, WaitResult};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub struct CountdownEvent {
    count: AtomicU32,
}

impl CountdownEvent {
    pub fn new(count: u32) -> Self {
        Self {
            count: AtomicU32::new(count),
        }
    }

    fn addr(&self) -> u64 {
        Parker::key_of(&self.count)
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Decrements the counter by `n`. Wakes every waiter once it reaches
    /// zero.
    ///
    /// # Panics
    /// Panics if `n` exceeds the remaining count.
    pub fn signal(&self, n: u32) {
        let prev = self.count.fetch_sub(n, Ordering::AcqRel);
        assert!(prev >= n, "CountdownEvent::signal called with more than the remaining count");
        if prev == n {
            crate::park::sync_parker().wake(self.addr(), u32::MAX);
        }
    }

    pub fn wait(&self) {
        self.wait_deadline(None);
    }

    /// Returns `true` if the counter reached zero before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_deadline(Some(Instant::now() + timeout))
    }

    fn wait_deadline(&self, deadline: Option<Instant>) -> bool {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current == 0 {
                return true;
            }
            match park_on(&self.count, self.addr(), current, deadline) {
                WaitResult::TimedOut => return self.count.load(Ordering::Acquire) == 0,
                WaitResult::Woke | WaitResult::Mismatch => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_once_all_signaled() {
        let event = Arc::new(CountdownEvent::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let event = event.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    event.signal(1);
                })
            })
            .collect();
        event.wait();
        assert_eq!(event.count(), 0);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn wait_timeout_elapses_if_not_signaled() {
        let event = CountdownEvent::new(1);
        assert!(!event.wait_timeout(Duration::from_millis(20)));
    }
}
