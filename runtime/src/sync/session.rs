// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Session ids: version-tagged handles protecting a per-slot mutex and a
//! one-shot error callback from use-after-free, for correlating an
//! in-flight operation (an RPC call, a cancellable request) with state that
//! outlives any single lock/unlock pair.

use crate::error::{Error, Result};
use crate::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// `(version << 32) | slot`, per this codebase's other ABA-safe ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId {
    slot: u32,
    version: u32,
}

type OnError<T> = Box<dyn FnOnce(&mut T, u32) + Send>;

struct Entry<T> {
    version: AtomicU32,
    live: AtomicBool,
    data: Mutex<Option<T>>,
    on_error: std::sync::Mutex<Option<OnError<T>>>,
    failed: AtomicBool,
    refcount: AtomicU32,
    /// Set by [`Session::unlock_and_destroy`] when it finds the slot still
    /// referenced by an in-flight [`Session::with`]; whichever of the two
    /// sides brings `refcount` to zero afterwards is the one that frees the
    /// slot, so a destroy racing a live `with` call can never leak it.
    pending_free: AtomicBool,
}

/// A pool of session ids, each guarding one `T`.
pub struct Session<T> {
    table: std::sync::Mutex<Vec<Arc<Entry<T>>>>,
    free: std::sync::Mutex<Vec<u32>>,
}

impl<T: Send + 'static> Default for Session<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Session<T> {
    pub fn new() -> Self {
        Self {
            table: std::sync::Mutex::new(Vec::new()),
            free: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Creates a new session holding `data`. `on_error` runs at most once,
    /// the first time [`Self::set_failed`] is called on this id's current
    /// version.
    pub fn create(
        &self,
        data: T,
        on_error: impl FnOnce(&mut T, u32) + Send + 'static,
    ) -> SessionId {
        if let Some(slot) = self.free.lock().unwrap().pop() {
            let entry = self.table.lock().unwrap()[slot as usize].clone();
            *entry
                .data
                .lock()
                .expect("freshly recycled session slot should never be self-locked") = Some(data);
            *entry.on_error.lock().unwrap() = Some(Box::new(on_error));
            entry.failed.store(false, Ordering::SeqCst);
            entry.refcount.store(0, Ordering::SeqCst);
            entry.pending_free.store(false, Ordering::SeqCst);
            entry.live.store(true, Ordering::SeqCst);
            let version = entry.version.load(Ordering::SeqCst);
            return SessionId { slot, version };
        }
        let mut table = self.table.lock().unwrap();
        let slot = table.len() as u32;
        table.push(Arc::new(Entry {
            version: AtomicU32::new(0),
            live: AtomicBool::new(true),
            data: Mutex::new(Some(data)),
            on_error: std::sync::Mutex::new(Some(Box::new(on_error))),
            failed: AtomicBool::new(false),
            refcount: AtomicU32::new(0),
            pending_free: AtomicBool::new(false),
        }));
        SessionId { slot, version: 0 }
    }

    fn get_live(&self, id: SessionId) -> Result<Arc<Entry<T>>> {
        let entry = self
            .table
            .lock()
            .unwrap()
            .get(id.slot as usize)
            .cloned()
            .ok_or(Error::InvalidId)?;
        if entry.version.load(Ordering::SeqCst) != id.version || !entry.live.load(Ordering::SeqCst)
        {
            return Err(Error::InvalidId);
        }
        Ok(entry)
    }

    /// Locks `id`'s data for the duration of `f`. Rejects a stale or
    /// already-destroyed id with [`Error::InvalidId`] without blocking.
    pub fn with<R>(&self, id: SessionId, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let entry = self.get_live(id)?;
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        let result = (|| {
            let mut guard = entry.data.lock()?;
            if entry.version.load(Ordering::SeqCst) != id.version {
                return Err(Error::InvalidId);
            }
            let data = guard.as_mut().ok_or(Error::InvalidId)?;
            Ok(f(data))
        })();
        // Last one out frees it: if this decrement is the one that brings
        // the count to zero, and `unlock_and_destroy` ran concurrently and
        // left a free pending, we're the one that finishes it. The CAS
        // makes this race-free against `unlock_and_destroy`'s own attempt
        // to free the slot, so exactly one side ever pushes it.
        if entry.refcount.fetch_sub(1, Ordering::AcqRel) == 1
            && entry
                .pending_free
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.free.lock().unwrap().push(id.slot);
        }
        result
    }

    /// Runs the on-error closure exactly once for `id`'s current version;
    /// a second call (or a call after [`Self::unlock_and_destroy`]) is a
    /// no-op that still succeeds, matching the first-wins CAS contract.
    pub fn set_failed(&self, id: SessionId, code: u32) -> Result<()> {
        let entry = self.get_live(id)?;
        if entry
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let cb = entry.on_error.lock().unwrap().take();
            if let Some(cb) = cb {
                let mut guard = entry
                    .data
                    .lock()
                    .expect("live session entry should never be self-locked");
                if let Some(data) = guard.as_mut() {
                    cb(data, code);
                }
            }
        }
        Ok(())
    }

    /// Bumps the version, invalidating `id` and every other handle to the
    /// same slot, and returns the slot to the free list once no in-flight
    /// [`Self::with`] call is still holding it.
    pub fn unlock_and_destroy(&self, id: SessionId) -> Result<()> {
        let entry = self.get_live(id)?;
        entry.live.store(false, Ordering::SeqCst);
        entry.version.fetch_add(1, Ordering::AcqRel);
        *entry.data.lock()? = None;
        *entry.on_error.lock().unwrap() = None;
        entry.pending_free.store(true, Ordering::Release);
        if entry.refcount.load(Ordering::SeqCst) == 0
            && entry
                .pending_free
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.free.lock().unwrap().push(id.slot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_after_destroy_is_rejected() {
        let session: Session<u32> = Session::new();
        let id = session.create(0, |_, _| {});
        session.unlock_and_destroy(id).unwrap();
        assert!(matches!(session.with(id, |_| {}), Err(Error::InvalidId)));
    }

    #[test]
    fn set_failed_runs_on_error_once() {
        let session: Session<u32> = Session::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let id = session.create(0, move |data, code| {
            *data = code;
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        session.set_failed(id, 42).unwrap();
        session.set_failed(id, 99).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        session.with(id, |data| assert_eq!(*data, 42)).unwrap();
    }

    #[test]
    fn recycled_slot_gets_a_new_version() {
        let session: Session<u32> = Session::new();
        let first = session.create(1, |_, _| {});
        session.unlock_and_destroy(first).unwrap();
        let second = session.create(2, |_, _| {});
        assert_eq!(first.slot, second.slot);
        assert_ne!(first.version, second.version);
        assert!(session.with(first, |_| {}).is_err());
        assert!(session.with(second, |_| {}).is_ok());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Create,
        Destroy(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Create),
            2 => (0usize..8).prop_map(Op::Destroy),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]
        // A slot's version only ever goes up as it's recycled, and an id
        // captured before a destroy is rejected by every later generation
        // of the same slot, no matter how creates and destroys interleave.
        #[test]
        fn recycled_versions_strictly_increase(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let session: Session<u32> = Session::new();
            let mut live: Vec<SessionId> = Vec::new();
            let mut stale: Vec<SessionId> = Vec::new();
            let mut last_version: HashMap<u32, u32> = HashMap::new();

            for op in ops {
                match op {
                    Op::Create => {
                        let id = session.create(0, |_, _| {});
                        if let Some(&previous) = last_version.get(&id.slot) {
                            prop_assert!(
                                id.version > previous,
                                "slot {} reused with non-increasing version ({} <= {})",
                                id.slot, id.version, previous
                            );
                        }
                        last_version.insert(id.slot, id.version);
                        live.push(id);
                    }
                    Op::Destroy(pick) => {
                        if live.is_empty() {
                            continue;
                        }
                        let index = pick % live.len();
                        let id = live.swap_remove(index);
                        session.unlock_and_destroy(id).unwrap();
                        stale.push(id);
                    }
                }
            }

            for id in &live {
                prop_assert!(session.with(*id, |_| {}).is_ok(), "live id rejected");
            }
            for id in &stale {
                prop_assert!(session.with(*id, |_| {}).is_err(), "stale id accepted");
            }
        }
    }
}
