// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A sequence-counter condition variable, paired with [`super::Mutex`].

use crate::error::Result;
use crate::park::{park_on, Parker};
use crate::sync::mutex::MutexGuard;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub struct CondVar {
    seq: AtomicU32,
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl CondVar {
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
        }
    }

    fn addr(&self) -> u64 {
        Parker::key_of(&self.seq)
    }

    /// Releases `guard`'s mutex and waits for a notification, reacquiring
    /// the mutex before returning.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> Result<MutexGuard<'a, T>> {
        Ok(self.wait_timeout(guard, None)?.0)
    }

    /// Same as [`Self::wait`] but gives up after `timeout`. The returned
    /// `bool` is `true` if the wait timed out rather than being notified.
    pub fn wait_for<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> Result<(MutexGuard<'a, T>, bool)> {
        self.wait_timeout(guard, Some(Instant::now() + timeout))
    }

    fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Option<Instant>,
    ) -> Result<(MutexGuard<'a, T>, bool)> {
        let mutex = MutexGuard::mutex(&guard);
        let seq = self.seq.load(Ordering::SeqCst);
        drop(guard);
        let result = park_on(&self.seq, self.addr(), seq, deadline);
        let timed_out = matches!(result, crate::park::WaitResult::TimedOut);
        Ok((mutex.lock()?, timed_out))
    }

    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
        crate::park::sync_parker().wake(self.addr(), 1);
    }

    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
        crate::park::sync_parker().wake(self.addr(), u32::MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Mutex;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notify_one_wakes_waiter() {
        let pair = Arc::new((Mutex::new(false), CondVar::new()));
        let pair2 = pair.clone();
        let handle = thread::spawn(move || {
            let (mutex, cv) = &*pair2;
            let mut ready = mutex.lock().unwrap();
            while !*ready {
                ready = cv.wait(ready).unwrap();
            }
        });
        thread::sleep(Duration::from_millis(20));
        let (mutex, cv) = &*pair;
        *mutex.lock().unwrap() = true;
        cv.notify_one();
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_times_out_without_notification() {
        let mutex = Mutex::new(());
        let cv = CondVar::new();
        let guard = mutex.lock().unwrap();
        let (_guard, timed_out) = cv.wait_for(guard, Duration::from_millis(20)).unwrap();
        assert!(timed_out);
    }
}
