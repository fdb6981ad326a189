// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The parking word: a futex-like `wait`/`wake` primitive keyed by address.
//!
//! There is no portable, stable userspace futex in `std`, so this emulates
//! one with a hashed bucket table of (mutex, condvar) pairs, following the
//! classic "publish the waiter before re-checking the predicate" discipline
//! needed to avoid lost wakeups.
//!
//! A waiter is either a real OS thread (an idle worker with no ready work)
//! or a suspended task (a fiber blocked on a sync primitive). Both share the
//! same bucket table and the same publish-before-recheck protocol; only
//! what "go to sleep" and "wake me" mean differs between the two, which lets
//! every synchronization primitive in [`crate::sync`] be built once on top
//! of this single abstraction while still never blocking a worker's OS
//! thread on behalf of a fiber (see `SPEC_FULL.md` §4.1).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use util::CachePadded;

/// Number of independently-locked shards in a [`Parker`]'s bucket table.
/// Sharding (on top of the per-address bucket hashing already done within
/// a shard) keeps unrelated addresses that happen to collide under
/// contention from serializing on the same lock and cache line.
const SHARD_COUNT: usize = 16;

/// Outcome of a [`Parker::wait`] call.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WaitResult {
    /// Woken by a matching `wake` call.
    Woke,
    /// The deadline passed before a wake arrived.
    TimedOut,
    /// `*addr != expected` at the time of the call; nothing was waited on.
    Mismatch,
}

/// What a parked waiter resumes into once woken.
pub enum WaiterKind {
    /// Block the calling OS thread on a private condvar until notified.
    Thread(Condvar),
    /// Suspend a fiber: when woken, invoke the closure that re-enqueues the
    /// task onto its scheduling group's ready path instead of blocking any
    /// OS thread.
    Task(Box<dyn FnOnce() + Send>),
}

struct Node {
    links: linked_list::Links<Node>,
    notified: bool,
    kind: WaiterKind,
}

// The list is a non-owning registry: it stores a raw pointer to a `Node`
// that someone else owns, the same way the bucket table this is grounded
// on tracks `WaiterInner`s that live on the waiting thread's own stack.
// `wait()` keeps its `Box<Node>` alive for the whole call and frees it on
// return; `register_task` leaks its box and `wake` reclaims it when it
// pops a `Task` waiter, since nothing else will.
//
// Safety: `Node` is only ever linked into one of the `Parker`'s own bucket
// lists under its internal mutex, and the boxed closure inside
// `WaiterKind::Task` is `Send`.
unsafe impl linked_list::Linked for Node {
    type Handle = std::ptr::NonNull<Node>;

    fn into_ptr(r: Self::Handle) -> std::ptr::NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: std::ptr::NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: std::ptr::NonNull<Self>) -> std::ptr::NonNull<linked_list::Links<Self>> {
        // Safety: `links` is the first field and `Node` is not `repr(packed)`.
        ptr.cast()
    }
}

#[derive(Default)]
struct Bucket(linked_list::List<Node>);

/// The process (or per-group) parking table.
///
/// One instance is shared by every synchronization primitive that needs
/// compare-and-sleep semantics: workers park on the address of their own
/// parking array slot, and sync primitives park on the address of their
/// state word.
pub struct Parker {
    shards: Vec<CachePadded<Mutex<BTreeMap<u64, Bucket>>>>,
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

impl Parker {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| CachePadded::from(Mutex::new(BTreeMap::new())))
            .collect();
        Self { shards }
    }

    fn shard(&self, addr: u64) -> &Mutex<BTreeMap<u64, Bucket>> {
        &self.shards[(addr as usize) % self.shards.len()]
    }

    /// Atomically checks `*addr == expected` and, if so, blocks the calling
    /// OS thread until woken or `deadline` elapses. Returns immediately with
    /// [`WaitResult::Mismatch`] if the check fails.
    pub fn wait_thread(
        &self,
        addr: u64,
        atomic: &AtomicU32,
        expected: u32,
        deadline: Option<Instant>,
    ) -> WaitResult {
        self.wait(addr, || atomic.load(Ordering::SeqCst) == expected, deadline, |_| {
            WaiterKind::Thread(Condvar::new())
        })
    }

    /// Same as [`Self::wait_thread`] but for 64-bit words (used by the join
    /// word and session id version checks).
    pub fn wait_thread64(
        &self,
        addr: u64,
        atomic: &AtomicU64,
        expected: u64,
        deadline: Option<Instant>,
    ) -> WaitResult {
        self.wait(addr, || atomic.load(Ordering::SeqCst) == expected, deadline, |_| {
            WaiterKind::Thread(Condvar::new())
        })
    }

    /// Registers a fiber-level waiter: if `validate` still holds, `resume`
    /// is stashed and invoked exactly once, from whichever thread calls
    /// [`Self::wake`] on `addr`, instead of blocking anything. Returns
    /// `false` (no registration happened) if `validate` already failed, in
    /// which case the caller must not suspend and should retry its
    /// operation instead.
    pub fn register_task(
        &self,
        addr: u64,
        validate: impl FnOnce() -> bool,
        resume: impl FnOnce() + Send + 'static,
    ) -> bool {
        let mut buckets = self.shard(addr).lock().unwrap();
        if !validate() {
            return false;
        }
        let node = Box::new(Node {
            links: linked_list::Links::default(),
            notified: false,
            kind: WaiterKind::Task(Box::new(resume)),
        });
        // Leaked: a `Task` node is never reclaimed by its registrant, only
        // by whichever `wake` call eventually pops it.
        let ptr = std::ptr::NonNull::from(Box::leak(node));
        buckets.entry(addr).or_default().0.push_back(ptr);
        true
    }

    fn wait(
        &self,
        addr: u64,
        validate: impl FnOnce() -> bool,
        deadline: Option<Instant>,
        make_kind: impl FnOnce(()) -> WaiterKind,
    ) -> WaitResult {
        let mut buckets = self.shard(addr).lock().unwrap();
        if !validate() {
            return WaitResult::Mismatch;
        }

        // Kept alive in this stack slot for the whole call: the list only
        // ever holds a non-owning pointer into it, so this box must not be
        // freed until the node is unlinked, which happens either here (on
        // timeout) or inside `wake` (on a successful pop).
        let node = Box::new(Node {
            links: linked_list::Links::default(),
            notified: false,
            kind: make_kind(()),
        });
        let ptr = std::ptr::NonNull::from(node.as_ref());
        buckets.entry(addr).or_default().0.push_back(ptr);

        loop {
            // Safety: `ptr` points at `node`, which outlives this loop.
            if unsafe { ptr.as_ref() }.notified {
                return WaitResult::Woke;
            }

            buckets = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        remove_node(&mut buckets, addr, ptr);
                        return WaitResult::TimedOut;
                    }
                    // Safety: see above.
                    let WaiterKind::Thread(condvar) = &unsafe { ptr.as_ref() }.kind else {
                        unreachable!("wait() only ever constructs WaiterKind::Thread waiters")
                    };
                    let (guard, _timeout_result) = condvar
                        .wait_timeout(buckets, deadline - now)
                        .expect("parker mutex poisoned");
                    guard
                }
                None => {
                    // Safety: see above.
                    let WaiterKind::Thread(condvar) = &unsafe { ptr.as_ref() }.kind else {
                        unreachable!("wait() only ever constructs WaiterKind::Thread waiters")
                    };
                    condvar.wait(buckets).expect("parker mutex poisoned")
                }
            };
        }
    }

    /// Wakes up to `max_wakers` waiters parked on `addr`. Returns the
    /// number actually woken.
    pub fn wake(&self, addr: u64, max_wakers: u32) -> u32 {
        if max_wakers == 0 {
            return 0;
        }
        let mut woken = 0;
        let mut buckets = self.shard(addr).lock().unwrap();
        if let Some(bucket) = buckets.get_mut(&addr) {
            while woken < max_wakers {
                let Some(mut ptr) = bucket.0.pop_front() else {
                    break;
                };
                // Safety: `ptr` was just unlinked, so we have exclusive
                // access to it until we hand it back to its owner (the
                // `Thread` case) or reclaim it ourselves (the `Task` case,
                // which has no other owner).
                match unsafe { &mut ptr.as_mut().kind } {
                    WaiterKind::Thread(condvar) => {
                        unsafe { ptr.as_mut() }.notified = true;
                        condvar.notify_one();
                    }
                    WaiterKind::Task(_) => {
                        // Safety: `register_task` leaked this node and
                        // never reclaims it; this is the one place that
                        // does, exactly once.
                        let node = unsafe { Box::from_raw(ptr.as_ptr()) };
                        let WaiterKind::Task(resume) = node.kind else {
                            unreachable!()
                        };
                        // Runs with the bucket lock still held so a
                        // concurrent `wait` on the same address cannot
                        // observe a torn wakeup.
                        resume();
                    }
                }
                woken += 1;
            }
            if bucket.0.is_empty() {
                buckets.remove(&addr);
            }
        }
        woken
    }

    /// Convenience: turns an arbitrary reference into a stable `u64` key.
    pub fn key_of<T>(r: &T) -> u64 {
        r as *const T as u64
    }
}

/// The process-wide parking word used by every task/thread-level
/// synchronization primitive (mutex, condition variable, countdown event,
/// session, join). Address hashing already disambiguates unrelated
/// primitives, so there is no need for one instance per scheduling group;
/// a group's own idle-parking table (see `crate::idle`) is deliberately a
/// *separate* `Parker`, so that a `WaiterKind::Task` resume closure queued
/// here can re-enqueue its task and wake an idle worker without
/// recursively locking the bucket table its own wakeup is running under.
pub(crate) fn sync_parker() -> std::sync::Arc<Parker> {
    static SYNC_PARKER: std::sync::OnceLock<std::sync::Arc<Parker>> = std::sync::OnceLock::new();
    SYNC_PARKER
        .get_or_init(|| std::sync::Arc::new(Parker::new()))
        .clone()
}

/// Unlinks `ptr` from the bucket at `addr`, dropping the bucket entry if it
/// becomes empty. The kept list only supports front/back-anchored cursors,
/// so removing an arbitrary node means walking from the front comparing
/// pointers; buckets stay short (one entry per contended address) so this
/// is not a hot path.
fn remove_node(
    buckets: &mut std::sync::MutexGuard<'_, BTreeMap<u64, Bucket>>,
    addr: u64,
    ptr: std::ptr::NonNull<Node>,
) -> bool {
    let Some(bucket) = buckets.get_mut(&addr) else {
        return false;
    };
    let mut cursor = bucket.0.cusor_front_mut();
    let found = loop {
        match cursor.get_ptr() {
            Some(p) if p == ptr => break true,
            Some(_) => cursor.move_next(),
            None => break false,
        }
    };
    if found {
        cursor.remove();
    }
    if bucket.0.is_empty() {
        buckets.remove(&addr);
    }
    found
}

/// Shared wait primitive for everything in [`crate::sync`]: blocks the
/// calling OS thread if called from outside a fiber, or suspends the
/// calling task otherwise, until `*atomic != expected` or `deadline`
/// elapses.
///
/// A timed task-level wait races the parker registration against a timer
/// callback: whichever fires first claims a shared flag and is the only one
/// that reschedules the task, so the other is a harmless no-op. If the
/// timer wins, the parker's `Task` node is left registered until this same
/// `addr` is next woken naturally (its own primitive's `unlock`/`notify`
/// path always does this eventually) — a harmless delayed reclaim, not a
/// correctness issue.
pub(crate) fn park_on(
    atomic: &AtomicU32,
    addr: u64,
    expected: u32,
    deadline: Option<Instant>,
) -> WaitResult {
    let parker = sync_parker();
    match crate::task::current_task() {
        None => parker.wait_thread(addr, atomic, expected, deadline),
        Some(task) => {
            let notified = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
            let claimed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

            let registered = {
                let (task, notified, claimed) = (task.clone(), notified.clone(), claimed.clone());
                parker.register_task(
                    addr,
                    || atomic.load(Ordering::SeqCst) == expected,
                    move || {
                        if !claimed.swap(true, Ordering::SeqCst) {
                            notified.store(true, Ordering::SeqCst);
                            crate::group::reschedule(&task);
                        }
                    },
                )
            };
            if !registered {
                return WaitResult::Mismatch;
            }

            if let Some(deadline) = deadline {
                if let Some(group) = task.group.upgrade() {
                    let (task, claimed) = (task.clone(), claimed.clone());
                    group.timer_add(deadline, move || {
                        if !claimed.swap(true, Ordering::SeqCst) {
                            crate::group::reschedule(&task);
                        }
                    });
                }
            }

            crate::task::suspend_current(crate::task::Suspension::Parked);
            if notified.load(Ordering::SeqCst) {
                WaitResult::Woke
            } else {
                WaitResult::TimedOut
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
    fn wake_releases_parked_thread() {
        let parker = Arc::new(Parker::new());
        let word = Arc::new(AtomicU32::new(0));
        let addr = Parker::key_of(&*word);

        let p2 = parker.clone();
        let w2 = word.clone();
        let handle = thread::spawn(move || {
            p2.wait_thread(addr, &w2, 0, None);
        });

        // Give the waiter a chance to publish itself; a real no-lost-wakeup
        // guarantee does not require this, but avoids a flaky wake-before-park
        // race turning this test into a hang on an unlucky scheduler.
        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::SeqCst);
        while parker.wake(addr, 1) == 0 {
            thread::yield_now();
        }

        handle.join().unwrap();
    }

    #[test]
    fn mismatch_returns_immediately() {
        let parker = Parker::new();
        let word = AtomicU32::new(5);
        let addr = Parker::key_of(&word);
        let result = parker.wait_thread(addr, &word, 0, None);
        assert_eq!(result, WaitResult::Mismatch);
    }

    #[test]
    fn timeout_elapses() {
        let parker = Parker::new();
        let word = AtomicU32::new(0);
        let addr = Parker::key_of(&word);
        let result = parker.wait_thread(
            addr,
            &word,
            0,
            Some(Instant::now() + Duration::from_millis(20)),
        );
        assert_eq!(result, WaitResult::TimedOut);
    }

    #[test]
    fn task_waiter_resumes_without_blocking() {
        let parker = Parker::new();
        let word = AtomicU32::new(0);
        let addr = Parker::key_of(&word);
        let resumed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let resumed2 = resumed.clone();

        let registered =
            parker.register_task(addr, || word.load(Ordering::SeqCst) == 0, move || {
                resumed2.store(true, Ordering::SeqCst);
            });
        assert!(registered);

        parker.wake(addr, 1);
        assert!(resumed.load(Ordering::SeqCst));
    }
}
