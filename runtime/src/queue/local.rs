// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A worker's local ready queue: a bounded ring touched by its owner at
//! both ends, and by stealers at the head only — classic work-stealing
//! discipline, with one LIFO slot in front of the ring for cache locality
//! of a just-woken continuation.

use crate::queue::GlobalQueue;
use crate::task::Task;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const RING_CAPACITY: usize = 256;

/// One worker's share of the ready queue.
///
/// The LIFO slot and the ring's tail are only ever touched by the owning
/// worker; the ring's head is touched by both the owner (on overflow
/// drain) and stealers, so it is guarded by a lock. A lock (rather than a
/// lock-free deque) keeps this grounded in the same "small critical
/// section on the cold path" shape as the rest of this codebase's
/// mutex-protected fast-path-miss structures, at the cost of one extra
/// word of contention under heavy stealing.
pub(crate) struct LocalQueue {
    lifo_slot: Mutex<Option<Arc<Task>>>,
    ring: Mutex<VecDeque<Arc<Task>>>,
    len: AtomicUsize,
}

impl LocalQueue {
    pub(crate) fn new() -> Self {
        Self {
            lifo_slot: Mutex::new(None),
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Pushes into the LIFO slot, demoting whatever was there onto the
    /// ring's tail. If the ring is full, the demoted task spills into
    /// `overflow`.
    pub(crate) fn push_lifo(&self, task: Arc<Task>, overflow: &GlobalQueue) {
        let prev = self.lifo_slot.lock().unwrap().replace(task);
        if let Some(prev) = prev {
            self.push_ring(prev, overflow);
        } else {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Appends at the ring's tail; used for tasks that should not preempt
    /// whatever is already in the LIFO slot (e.g. re-enqueued stolen work).
    pub(crate) fn push_back(&self, task: Arc<Task>, overflow: &GlobalQueue) {
        self.push_ring(task, overflow);
    }

    fn push_ring(&self, task: Arc<Task>, overflow: &GlobalQueue) {
        let mut ring = self.ring.lock().unwrap();
        // A scheduling-group-local task must never leave this worker's
        // queue, so it cannot spill into the group's shared overflow on a
        // full ring; it grows the ring instead.
        if ring.len() >= RING_CAPACITY && !task.attrs.scheduling_group_local {
            overflow.push(task);
            return;
        }
        ring.push_back(task);
        drop(ring);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Pops the LIFO slot if occupied, else the ring's tail.
    pub(crate) fn pop(&self) -> Option<Arc<Task>> {
        if let Some(task) = self.lifo_slot.lock().unwrap().take() {
            self.len.fetch_sub(1, Ordering::Relaxed);
            return Some(task);
        }
        let task = self.ring.lock().unwrap().pop_back();
        if task.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        task
    }

    /// Steals from the ring's head, never touching the LIFO slot (the
    /// owner's most recently woken continuation stays put so stealing does
    /// not fight the owner for cache-hot work), and skipping over any
    /// scheduling-group-local task it finds along the way so pinned work
    /// stays put too.
    pub(crate) fn steal(&self) -> Option<Arc<Task>> {
        let mut ring = self.ring.lock().unwrap();
        let index = ring.iter().position(|task| !task.attrs.scheduling_group_local)?;
        let task = ring.remove(index);
        drop(ring);
        if task.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        task
    }

    /// Drains up to `max` tasks from the ring's head into `overflow`, used
    /// periodically so a worker that never blocks does not starve the
    /// group's overflow queue of attention.
    pub(crate) fn drain_into(&self, overflow: &GlobalQueue, max: usize) {
        let mut ring = self.ring.lock().unwrap();
        let mut moved = 0;
        while moved < max {
            let Some(task) = ring.pop_front() else {
                break;
            };
            overflow.push(task);
            moved += 1;
        }
        drop(ring);
        self.len.fetch_sub(moved, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::task::{StackClass, StackPool, Task, TaskAttrs, TaskId};
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn dummy_task(pool: &StackPool, slot: u32) -> Arc<Task> {
        let stack = pool.acquire(StackClass::Small).unwrap();
        Task::new(TaskId::new(slot, 0), TaskAttrs::default(), std::sync::Weak::new(), stack, || {})
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        PushLifo(usize),
        PushBack(usize),
        Pop(usize),
        Steal(usize),
        Drain(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..2).prop_map(Op::PushLifo),
            (0usize..2).prop_map(Op::PushBack),
            (0usize..2).prop_map(Op::Pop),
            (0usize..2).prop_map(Op::Steal),
            (0usize..2).prop_map(Op::Drain),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]
        // Every task that is pushed into a local queue (directly, or as the
        // demoted occupant of the LIFO slot, or spilled into the overflow
        // queue) comes back out exactly once across pop/steal/drain, no
        // matter how those calls are interleaved.
        #[test]
        fn every_pushed_task_is_retrieved_exactly_once(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let pool = StackPool::new(crate::config::StackSizes::default());
            let queues = [LocalQueue::new(), LocalQueue::new()];
            let overflow = GlobalQueue::new();

            let mut next_id = 0u32;
            let mut pushed: HashSet<u32> = HashSet::new();
            let mut retrieved: HashSet<u32> = HashSet::new();

            for op in ops {
                match op {
                    Op::PushLifo(q) => {
                        let task = dummy_task(&pool, next_id);
                        pushed.insert(next_id);
                        next_id += 1;
                        queues[q].push_lifo(task, &overflow);
                    }
                    Op::PushBack(q) => {
                        let task = dummy_task(&pool, next_id);
                        pushed.insert(next_id);
                        next_id += 1;
                        queues[q].push_back(task, &overflow);
                    }
                    Op::Pop(q) => {
                        if let Some(task) = queues[q].pop() {
                            let id = task.id().slot();
                            prop_assert!(retrieved.insert(id), "task {id} retrieved twice");
                        }
                    }
                    Op::Steal(q) => {
                        if let Some(task) = queues[q].steal() {
                            let id = task.id().slot();
                            prop_assert!(retrieved.insert(id), "task {id} retrieved twice");
                        }
                    }
                    Op::Drain(q) => {
                        // drain_into moves into `overflow`; drain it back out
                        // through pop so it counts as retrieved here too.
                        queues[q].drain_into(&overflow, 8);
                        while let Some(task) = overflow.pop() {
                            let id = task.id().slot();
                            prop_assert!(retrieved.insert(id), "task {id} retrieved twice");
                        }
                    }
                }
            }

            // Drain whatever is left in every queue and the overflow so the
            // final tally is complete.
            for q in &queues {
                while let Some(task) = q.pop() {
                    retrieved.insert(task.id().slot());
                }
            }
            while let Some(task) = overflow.pop() {
                retrieved.insert(task.id().slot());
            }

            prop_assert_eq!(pushed, retrieved);
        }
    }
}
