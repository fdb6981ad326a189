// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A scheduling group: a fixed pool of worker OS threads sharing one ready
//! queue, one timer wheel, and one stack pool. Workers run a cooperative,
//! work-stealing loop: pop local, occasionally check the group's overflow
//! injector, steal from siblings, then park.

use crate::config::GroupConfig;
use crate::error::Result;
use crate::idle::Idle;
use crate::queue::{GlobalQueue, LocalQueue};
use crate::task::{StackPool, State, Suspension, Task, TaskAttrs, TaskId};
use crate::timer::{Fired, Timer};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

thread_local! {
    static WORKER: Cell<Option<(Weak<Group>, usize)>> = const { Cell::new(None) };
}

struct Entities {
    versions: Vec<u32>,
    free: Vec<u32>,
}

/// One scheduling group.
pub struct Group {
    pub(crate) name: &'static str,
    pub(crate) is_system: bool,
    worker_count: usize,
    stealing_retries: u32,
    overflow_drain_every: u32,
    local_queues: Vec<LocalQueue>,
    global: GlobalQueue,
    idle: Idle,
    /// One RNG per worker, used only to pick a randomized starting point
    /// for the steal scan below so siblings don't all hammer worker 0
    /// first on every steal attempt.
    steal_rngs: Vec<Mutex<k23_fastrand::FastRand>>,
    stack_pool: StackPool,
    timer: Timer,
    entities: Mutex<Entities>,
    shutdown: AtomicBool,
    live_tasks: AtomicU32,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Group {
    pub(crate) fn new(
        config: &GroupConfig,
        stack_pool: StackPool,
        timer_tick: std::time::Duration,
        stealing_retries: u32,
        overflow_drain_every: u32,
    ) -> Arc<Self> {
        let worker_count = config.worker_count.max(1);
        let local_queues = (0..worker_count).map(|_| LocalQueue::new()).collect();
        let steal_rngs = (0..worker_count)
            .map(|id| {
                let seed = (id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                Mutex::new(k23_fastrand::FastRand::from_seed(seed))
            })
            .collect();
        Arc::new(Self {
            name: config.name,
            is_system: config.is_system,
            worker_count,
            stealing_retries: stealing_retries.max(1),
            overflow_drain_every: overflow_drain_every.max(1),
            local_queues,
            global: GlobalQueue::new(),
            idle: Idle::new(),
            steal_rngs,
            stack_pool,
            timer: Timer::new(timer_tick),
            entities: Mutex::new(Entities {
                versions: Vec::new(),
                free: Vec::new(),
            }),
            shutdown: AtomicBool::new(false),
            live_tasks: AtomicU32::new(0),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the group's worker threads. Idempotent only in the sense that
    /// calling it twice spawns two sets of workers; callers (the `Runtime`)
    /// must call this exactly once per group.
    pub(crate) fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        for id in 0..self.worker_count {
            let group = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{id}", self.name))
                .spawn(move || worker_main(group, id))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.idle.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn alloc_id(&self) -> TaskId {
        let mut entities = self.entities.lock().unwrap();
        if let Some(slot) = entities.free.pop() {
            TaskId::new(slot, entities.versions[slot as usize])
        } else {
            let slot = entities.versions.len() as u32;
            entities.versions.push(0);
            TaskId::new(slot, 0)
        }
    }

    fn release_id(&self, id: TaskId) {
        let mut entities = self.entities.lock().unwrap();
        let slot = id.slot() as usize;
        entities.versions[slot] = entities.versions[slot].wrapping_add(1);
        entities.free.push(id.slot());
    }

    /// Spawns a new task into this group and enqueues it for execution.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        attrs: TaskAttrs,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<Task>> {
        let id = self.alloc_id();
        let stack = match self.stack_pool.acquire(attrs.stack_class) {
            Ok(stack) => stack,
            Err(e) => {
                self.release_id(id);
                return Err(e);
            }
        };
        let task = Task::new(id, attrs, Arc::downgrade(self), stack, entry);
        self.live_tasks.fetch_add(1, Ordering::Relaxed);
        task.set_state(State::Ready);
        self.enqueue_external(task.clone());
        Ok(task)
    }

    /// Enqueues a task from outside a worker's own run loop (a fresh spawn,
    /// or a wakeup delivered from another thread): lands in the current
    /// worker's local queue if called from one, the global injector
    /// otherwise, and always wakes one idle worker since the enqueuing
    /// thread itself is not about to immediately pop it back off.
    fn enqueue_external(self: &Arc<Self>, task: Arc<Task>) {
        task.set_state(State::Ready);
        if let Some(id) = current_worker_id(self) {
            self.local_queues[id].push_back(task, &self.global);
        } else {
            self.global.push(task);
        }
        self.idle.notify_one();
    }

    fn next_task(&self, worker_id: usize, tick: u32) -> Option<Arc<Task>> {
        if tick % self.overflow_drain_every == 0 {
            if let Some(task) = self.global.pop() {
                return Some(task);
            }
        }
        let local = &self.local_queues[worker_id];
        if let Some(task) = local.pop() {
            return Some(task);
        }
        if let Some(task) = self.global.pop() {
            return Some(task);
        }
        let count = self.local_queues.len() as u32;
        for _ in 0..self.stealing_retries {
            let start = self.steal_rngs[worker_id].lock().unwrap().fastrand_n(count);
            for offset in 0..count {
                let i = ((start + offset) % count) as usize;
                if i == worker_id {
                    continue;
                }
                if let Some(task) = self.local_queues[i].steal() {
                    task.stolen.fetch_add(1, Ordering::Relaxed);
                    return Some(task);
                }
            }
        }
        None
    }

    fn run_task(self: &Arc<Self>, worker_id: usize, task: Arc<Task>) {
        task.last_worker.store(worker_id, Ordering::Relaxed);
        let resumption = task.take_resumption();
        match task.resume(resumption) {
            crate::task::StepOutcome::Suspended(Suspension::Yielded) => {
                task.set_state(State::Ready);
                self.local_queues[worker_id].push_lifo(task, &self.global);
            }
            crate::task::StepOutcome::Suspended(Suspension::SleepUntil(deadline)) => {
                if task.stop_requested() {
                    task.cancel_sleep_now();
                    self.enqueue_external(task);
                } else {
                    let timer_id = self.timer.add_wake(deadline, task.clone());
                    task.set_sleep_timer(Some(timer_id));
                }
            }
            crate::task::StepOutcome::Suspended(Suspension::Parked) => {
                // The task has already registered its own resume
                // continuation with `sync_parker()`; there is nothing more
                // for the worker to do until that continuation fires.
            }
            crate::task::StepOutcome::Done => {
                self.release_task(&task);
            }
        }
    }

    fn release_task(&self, task: &Arc<Task>) {
        if let Some(stack) = task.take_stack() {
            self.stack_pool.release(task.attrs.stack_class, stack);
        }
        self.release_id(task.id());
        self.live_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    fn drive_timer(self: &Arc<Self>) {
        for fired in self.timer.poll() {
            match fired {
                Fired::Wake(task) => {
                    task.clear_sleep_timer();
                    self.enqueue_external(task);
                }
                Fired::Callback(f) => {
                    let _ = self.spawn(TaskAttrs::default(), f);
                }
            }
        }
    }

    pub(crate) fn timer_add(
        &self,
        deadline: std::time::Instant,
        callback: impl FnOnce() + Send + 'static,
    ) -> crate::timer::TimerId {
        self.timer.add_callback(deadline, callback)
    }

    pub(crate) fn timer_cancel(&self, id: crate::timer::TimerId) -> crate::timer::CancelOutcome {
        self.timer.cancel(id)
    }
}

fn current_worker_id(group: &Arc<Group>) -> Option<usize> {
    WORKER.with(|w| {
        let cell = w.take();
        let id = cell.as_ref().and_then(|(weak, id)| {
            weak.upgrade().and_then(|g| (Arc::ptr_eq(&g, group)).then_some(*id))
        });
        w.set(cell);
        id
    })
}

/// Returns the group the calling OS thread is currently a worker of, if
/// any — used by `crate::runtime::Runtime` to resolve
/// `GroupAffinity::Current` for a task that itself calls `Runtime::spawn`.
pub(crate) fn current_group() -> Option<Arc<Group>> {
    WORKER.with(|w| {
        let cell = w.take();
        let group = cell.as_ref().and_then(|(weak, _)| weak.upgrade());
        w.set(cell);
        group
    })
}

/// Re-enqueues a task that a sync primitive or timer has decided is ready
/// again, from whatever thread happens to be running the wakeup (which may
/// or may not be one of the task's own group's workers).
pub(crate) fn reschedule(task: &Arc<Task>) {
    let Some(group) = task.group.upgrade() else {
        // The group has already shut down; nothing to reschedule into.
        return;
    };
    group.enqueue_external(task.clone());
}

fn worker_main(group: Arc<Group>, worker_id: usize) {
    WORKER.with(|w| w.set(Some((Arc::downgrade(&group), worker_id))));
    let mut tick: u32 = 0;
    loop {
        if group.shutdown.load(Ordering::SeqCst) {
            break;
        }

        tick = tick.wrapping_add(1);
        if let Some(task) = group.next_task(worker_id, tick) {
            group.run_task(worker_id, task);
            continue;
        }

        group.drive_timer();
        if let Some(task) = group.next_task(worker_id, tick) {
            group.run_task(worker_id, task);
            continue;
        }

        // Publish-then-rescan: record the epoch before the final check so a
        // task enqueued between this rescan and `idle.park` bumps the epoch
        // past `since` and `park` returns immediately instead of sleeping
        // through a lost wakeup.
        let since = group.idle.snapshot();
        if let Some(task) = group.next_task(worker_id, tick) {
            group.run_task(worker_id, task);
            continue;
        }
        if group.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let deadline = group.timer.next_deadline();
        group.idle.park(since, deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackSizes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_group(workers: usize) -> Arc<Group> {
        let config = GroupConfig::new("test", workers);
        let stack_pool = StackPool::new(StackSizes::default());
        let group = Group::new(&config, stack_pool, Duration::from_millis(1), 4, 61);
        group.start();
        group
    }

    #[test]
    fn spawned_task_runs_to_completion() {
        let group = test_group(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let task = group.spawn(TaskAttrs::default(), move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !task.is_done() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(task.is_done());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        group.shutdown();
    }

    #[test]
    fn yielding_task_is_resumed_and_completes() {
        let group = test_group(1);
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = steps.clone();
        let task = group.spawn(TaskAttrs::default(), move || {
            for _ in 0..3 {
                steps2.fetch_add(1, Ordering::SeqCst);
                crate::task::yield_now();
            }
        }).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !task.is_done() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(task.is_done());
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        group.shutdown();
    }

    #[test]
    fn sleeping_task_wakes_after_deadline() {
        let group = test_group(1);
        let task = group.spawn(TaskAttrs::default(), || {
            crate::task::sleep_for(Duration::from_millis(20));
        }).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !task.is_done() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(task.is_done());
        group.shutdown();
    }
}
