// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A three-state mutex built on the parking word: unlocked, locked with no
//! waiters, and locked with waiters. The uncontended path is a single CAS;
//! the slow path marks the word contended and parks.

use crate::error::{Error, Result};
use crate::park::{park_on, Parker};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Tags an owner identity as belonging to an OS thread rather than a task,
/// so the two spaces (task pointer addresses, thread ids) never collide.
const THREAD_TAG: u64 = 1 << 63;

/// Identifies whichever fiber or OS thread is currently executing, for the
/// sole purpose of recognizing "this caller already holds this lock". A
/// task's identity is its `Arc<Task>` address, stable for exactly as long
/// as the task can possibly be the one re-entering `lock()`; an OS thread's
/// identity is its `ThreadId`. The two are disjoint by construction via
/// [`THREAD_TAG`].
fn current_owner() -> u64 {
    if let Some(task) = crate::task::current_task() {
        (std::sync::Arc::as_ptr(&task) as usize as u64) & !THREAD_TAG
    } else {
        std::thread::current().id().as_u64().get() | THREAD_TAG
    }
}

/// A mutex callable from both fibers (suspends the task) and plain OS
/// threads (genuinely blocks), per this codebase's synchronization design.
pub struct Mutex<T: ?Sized> {
    state: AtomicU32,
    /// The current holder's identity, per [`current_owner`]; `0` while
    /// unlocked (never a valid owner value). Used only to reject a
    /// self-reentrant `lock()` with [`Error::WouldDeadlock`] instead of
    /// spinning forever, since no other caller could ever unlock it.
    owner: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            owner: AtomicU64::new(0),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    fn addr(&self) -> u64 {
        Parker::key_of(&self.state)
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended()?;
        }
        self.owner.store(current_owner(), Ordering::Relaxed);
        Ok(MutexGuard { mutex: self })
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| {
                self.owner.store(current_owner(), Ordering::Relaxed);
                MutexGuard { mutex: self }
            })
    }

    fn lock_contended(&self) -> Result<()> {
        let self_owner = current_owner();
        let addr = self.addr();
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state == UNLOCKED {
                match self.state.compare_exchange_weak(
                    UNLOCKED,
                    CONTENDED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Ok(()),
                    Err(s) => {
                        state = s;
                        continue;
                    }
                }
            }
            // The lock is held (LOCKED or CONTENDED) by us: no other
            // caller can ever unlock it, so parking here would hang
            // forever. This can only be true reentrancy, never a race,
            // since a single owner cannot call `lock()` concurrently
            // with itself.
            if self.owner.load(Ordering::Relaxed) == self_owner {
                return Err(Error::WouldDeadlock);
            }
            if state == LOCKED {
                if let Err(s) = self.state.compare_exchange_weak(
                    LOCKED,
                    CONTENDED,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    state = s;
                    continue;
                }
            }
            park_on(&self.state, addr, CONTENDED, None);
            state = self.state.load(Ordering::Relaxed);
        }
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Relaxed);
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            crate::park::sync_parker().wake(self.addr(), 1);
        }
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            owner: AtomicU64::new(0),
            data: UnsafeCell::new(T::default()),
        }
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// Exposes the guard's mutex so [`super::CondVar`] can release it and
    /// reacquire it later without ever leaking direct access to the
    /// underlying `UnsafeCell`.
    pub(crate) fn mutex(guard: &MutexGuard<'a, T>) -> &'a Mutex<T> {
        guard.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: holding the guard means the mutex is locked by us alone.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see above.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn uncontended_lock_roundtrips() {
        let mutex = Mutex::new(5);
        {
            let mut guard = mutex.lock().unwrap();
            *guard += 1;
        }
        assert_eq!(*mutex.lock().unwrap(), 6);
    }

    #[test]
    fn contended_threads_serialize() {
        let mutex = Arc::new(Mutex::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *mutex.lock().unwrap() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*mutex.lock().unwrap(), 8000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Mutex::new(());
        let guard = mutex.lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn reentrant_lock_is_rejected_instead_of_hanging() {
        let mutex = Mutex::new(0);
        let _guard = mutex.lock().unwrap();
        assert!(matches!(mutex.lock(), Err(Error::WouldDeadlock)));
    }
}
