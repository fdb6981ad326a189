// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Execution queues: per-key objects that linearize concurrent submissions
//! into one at-most-one-consumer pipeline, so independent producers can
//! submit work for the same logical stream without coordinating a consumer
//! fiber themselves.

use crate::error::{Error, Result};
use crate::group::Group;
use crate::park::{park_on, Parker};
use crate::runtime::Runtime;
use crate::task::{GroupAffinity, TaskAttrs};
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueId {
    slot: u32,
    version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Ok,
    Executing,
    TooLate,
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Pending = 0,
    Running = 1,
    Done = 2,
    Canceled = 3,
}

/// A handle to one submitted item, usable to cancel it before the consumer
/// has started on its batch.
pub struct ExecuteHandle {
    state: Arc<AtomicU8>,
}

impl ExecuteHandle {
    pub fn cancel(&self) -> CancelOutcome {
        match self.state.compare_exchange(
            HandleState::Pending as u8,
            HandleState::Canceled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => CancelOutcome::Ok,
            Err(s) if s == HandleState::Running as u8 => CancelOutcome::Executing,
            Err(_) => CancelOutcome::TooLate,
        }
    }
}

enum Item<T> {
    Task { value: T, state: Arc<AtomicU8> },
    Stop,
}

// `item` is read exactly once, by `collect`, right after the node comes off
// the (pinned, boxed) queue; a `Mutex` sidesteps moving a field out from
// behind the `Pin<Box<_>>` handle `dequeue()` hands back, the same problem
// `GlobalQueue::pop` avoids by cloning instead of moving.
struct Node<T> {
    links: mpsc_queue::Links<Node<T>>,
    item: StdMutex<Option<Item<T>>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            links: mpsc_queue::Links::default(),
            item: StdMutex::new(None),
        }
    }
}

// Safety: mirrors `crate::queue::GlobalNode`'s justification — a `Node<T>`
// is only ever moved into the queue it was built for.
unsafe impl<T: Send> mpsc_queue::Linked for Node<T> {
    type Handle = Pin<Box<Node<T>>>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        unsafe { NonNull::from(Box::leak(Pin::into_inner_unchecked(handle))) }
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        unsafe { Pin::new_unchecked(Box::from_raw(ptr.as_ptr())) }
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<mpsc_queue::Links<Self>> {
        let links = unsafe { ptr::addr_of_mut!((*target.as_ptr()).links) };
        unsafe { NonNull::new_unchecked(links) }
    }
}

type OnBatch<T> = Box<dyn FnMut(Vec<T>, bool) + Send>;

struct Inner<T: Send> {
    normal: mpsc_queue::MpscQueue<Node<T>>,
    high: mpsc_queue::MpscQueue<Node<T>>,
    has_consumer: AtomicBool,
    stopped: AtomicU32,
    group: Weak<Group>,
    on_batch: StdMutex<Option<OnBatch<T>>>,
}

/// A pool of execution queue ids, each an independent single-consumer
/// pipeline of `T` items.
///
/// The version for a slot lives in `versions`, separate from the `Inner` a
/// slot currently points at, so that destroying and reusing a slot always
/// bumps the version a stale [`QueueId`] was issued against — matching
/// `crate::group::Group`'s own id table instead of `crate::sync::Session`'s
/// (which keeps one `Entry` alive forever and resets it in place; here each
/// `start()` call needs a fresh `Inner` of whatever `on_batch` closure type
/// it was given).
pub struct ExecutionQueue<T: Send> {
    table: StdMutex<Vec<Arc<Inner<T>>>>,
    versions: StdMutex<Vec<u32>>,
    free: StdMutex<Vec<u32>>,
}

impl<T: Send + 'static> Default for ExecutionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> ExecutionQueue<T> {
    pub fn new() -> Self {
        Self {
            table: StdMutex::new(Vec::new()),
            versions: StdMutex::new(Vec::new()),
            free: StdMutex::new(Vec::new()),
        }
    }

    /// Starts a new queue whose consumer fiber is spawned, lazily on first
    /// submission, into whichever group `runtime` would pick for a task
    /// with [`GroupAffinity::Current`] spawned right now.
    pub fn start(
        &self,
        runtime: &Runtime,
        on_batch: impl FnMut(Vec<T>, bool) + Send + 'static,
    ) -> Result<QueueId> {
        let group = runtime.resolve_group(GroupAffinity::Current)?;
        let inner = Arc::new(Inner {
            normal: mpsc_queue::MpscQueue::new_with_stub(Box::pin(Node::default())),
            high: mpsc_queue::MpscQueue::new_with_stub(Box::pin(Node::default())),
            has_consumer: AtomicBool::new(false),
            stopped: AtomicU32::new(0),
            group: Arc::downgrade(group),
            on_batch: StdMutex::new(Some(Box::new(on_batch))),
        });
        if let Some(slot) = self.free.lock().unwrap().pop() {
            self.table.lock().unwrap()[slot as usize] = inner;
            let version = self.versions.lock().unwrap()[slot as usize];
            return Ok(QueueId { slot, version });
        }
        let mut table = self.table.lock().unwrap();
        let slot = table.len() as u32;
        table.push(inner);
        self.versions.lock().unwrap().push(0);
        Ok(QueueId { slot, version: 0 })
    }

    fn get_live(&self, id: QueueId) -> Result<Arc<Inner<T>>> {
        if self.versions.lock().unwrap().get(id.slot as usize).copied() != Some(id.version) {
            return Err(Error::InvalidId);
        }
        self.table
            .lock()
            .unwrap()
            .get(id.slot as usize)
            .cloned()
            .ok_or(Error::InvalidId)
    }

    /// Enqueues `value`, spawning a consumer fiber if none is currently
    /// running.
    pub fn execute(&self, id: QueueId, value: T) -> Result<ExecuteHandle> {
        self.execute_inner(id, value, false)
    }

    /// Like [`Self::execute`] but dispatched ahead of any pending normal
    /// submissions at the consumer's next batch boundary.
    pub fn execute_high_priority(&self, id: QueueId, value: T) -> Result<ExecuteHandle> {
        self.execute_inner(id, value, true)
    }

    fn execute_inner(&self, id: QueueId, value: T, high_priority: bool) -> Result<ExecuteHandle> {
        let inner = self.get_live(id)?;
        let state = Arc::new(AtomicU8::new(HandleState::Pending as u8));
        let node = Box::pin(Node {
            links: mpsc_queue::Links::default(),
            item: StdMutex::new(Some(Item::Task {
                value,
                state: state.clone(),
            })),
        });
        if high_priority {
            inner.high.enqueue(node);
        } else {
            inner.normal.enqueue(node);
        }
        self.ensure_consumer(&inner);
        Ok(ExecuteHandle { state })
    }

    /// Enqueues a stop sentinel; the consumer calls `on_batch` once more
    /// with `is_queue_stopped = true` once it is dispatched.
    pub fn stop(&self, id: QueueId) -> Result<()> {
        let inner = self.get_live(id)?;
        inner.normal.enqueue(Box::pin(Node {
            links: mpsc_queue::Links::default(),
            item: StdMutex::new(Some(Item::Stop)),
        }));
        self.ensure_consumer(&inner);
        Ok(())
    }

    /// Blocks until the queue's sentinel has been dispatched.
    pub fn join(&self, id: QueueId) -> Result<()> {
        let inner = self.get_live(id)?;
        let addr = Parker::key_of(&inner.stopped);
        loop {
            let current = inner.stopped.load(Ordering::Acquire);
            if current != 0 {
                self.reclaim(id);
                return Ok(());
            }
            park_on(&inner.stopped, addr, current, None);
        }
    }

    fn reclaim(&self, id: QueueId) {
        let mut versions = self.versions.lock().unwrap();
        versions[id.slot as usize] = versions[id.slot as usize].wrapping_add(1);
        self.free.lock().unwrap().push(id.slot);
    }

    fn ensure_consumer(&self, inner: &Arc<Inner<T>>) {
        if inner.has_consumer.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(group) = inner.group.upgrade() else {
            inner.has_consumer.store(false, Ordering::Release);
            return;
        };
        let inner = inner.clone();
        let _ = group.spawn(TaskAttrs::default(), move || consume(inner));
    }
}

fn consume<T: Send + 'static>(inner: Arc<Inner<T>>) {
    loop {
        let mut batch = Vec::new();
        let mut states = Vec::new();
        let mut stopping = false;

        while let Some(node) = inner.high.dequeue() {
            collect(node, &mut batch, &mut states, &mut stopping);
        }
        while let Some(node) = inner.normal.dequeue() {
            let was_stop = collect(node, &mut batch, &mut states, &mut stopping);
            if was_stop {
                break;
            }
        }

        if batch.is_empty() && !stopping {
            // Give up, but a submission racing this exact instant may have
            // just lost the `ensure_consumer` CAS believing we are still
            // responsible. Recheck once before actually stepping down; if
            // something turns up we already own it (dequeue is destructive)
            // and keep going regardless of who "wins" the flag afterwards.
            inner.has_consumer.store(false, Ordering::Release);
            match inner.high.dequeue().or_else(|| inner.normal.dequeue()) {
                Some(node) => {
                    inner.has_consumer.store(true, Ordering::Release);
                    let was_stop = collect(node, &mut batch, &mut states, &mut stopping);
                    if !was_stop {
                        while let Some(node) = inner.normal.dequeue() {
                            let was_stop = collect(node, &mut batch, &mut states, &mut stopping);
                            if was_stop {
                                break;
                            }
                        }
                    }
                }
                None => return,
            }
        }

        for state in &states {
            state.store(HandleState::Running as u8, Ordering::Release);
        }
        if let Some(on_batch) = inner.on_batch.lock().unwrap().as_mut() {
            on_batch(batch, stopping);
        }
        for state in &states {
            let _ = state.compare_exchange(
                HandleState::Running as u8,
                HandleState::Done as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        if stopping {
            inner.has_consumer.store(false, Ordering::Release);
            inner.stopped.store(1, Ordering::Release);
            crate::park::sync_parker().wake(Parker::key_of(&inner.stopped), u32::MAX);
            return;
        }
    }
}

/// Appends a dequeued node's value to `batch`/`states` if it was not
/// canceled first, and reports whether it was the stop sentinel.
fn collect<T>(
    node: Pin<Box<Node<T>>>,
    batch: &mut Vec<T>,
    states: &mut Vec<Arc<AtomicU8>>,
    stopping: &mut bool,
) -> bool {
    match node.item.lock().unwrap().take() {
        Some(Item::Stop) => {
            *stopping = true;
            true
        }
        Some(Item::Task { value, state }) => {
            if state.load(Ordering::Acquire) != HandleState::Canceled as u8 {
                batch.push(value);
                states.push(state);
            }
            false
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupConfig, RuntimeConfig};
    use std::sync::atomic::AtomicUsize;

    fn test_runtime() -> Runtime {
        let config = RuntimeConfig::builder()
            .groups(vec![GroupConfig::new("exec-queue-test", 2)])
            .build();
        Runtime::start(config).unwrap()
    }

    #[test]
    fn batches_are_dispatched_in_order() {
        let runtime = test_runtime();
        let queue: Arc<ExecutionQueue<u32>> = Arc::new(ExecutionQueue::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let id = queue
            .start(&runtime, move |batch, _stopped| {
                seen2.lock().unwrap().extend(batch);
            })
            .unwrap();
        for i in 0..10 {
            queue.execute(id, i).unwrap();
        }
        queue.stop(id).unwrap();
        queue.join(id).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        runtime.shutdown();
    }

    #[test]
    fn canceled_item_is_skipped() {
        let runtime = test_runtime();
        let queue: Arc<ExecutionQueue<u32>> = Arc::new(ExecutionQueue::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let id = queue
            .start(&runtime, move |batch, _| {
                seen2.fetch_add(batch.len(), Ordering::SeqCst);
            })
            .unwrap();
        let handle = queue.execute(id, 1).unwrap();
        let _ = handle.cancel();
        queue.execute(id, 2).unwrap();
        queue.stop(id).unwrap();
        queue.join(id).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        runtime.shutdown();
    }
}
