// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task entity: one fiber's heap-owned record, and the thread-local
//! plumbing that lets code nested arbitrarily deep inside a running task
//! (a mutex wait, a timer sleep, an explicit `yield_now`) find its way back
//! to the worker that is driving it.

mod stack_pool;

pub use stack_pool::{StackClass, StackPool};

use crate::error::{Error, Result};
use crate::park::{Parker, WaitResult};
use fiber::stack::DefaultFiberStack;
use fiber::{Fiber, Suspend};
use std::any::Any;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Identifies a task across its lifetime. The version is bumped every time
/// a slot is reused, so a stale [`TaskId`] captured before recycling is
/// rejected rather than silently touching an unrelated task.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    slot: u32,
    version: u32,
}

impl TaskId {
    pub(crate) fn new(slot: u32, version: u32) -> Self {
        Self { slot, version }
    }

    pub(crate) fn slot(self) -> u32 {
        self.slot
    }

    pub(crate) fn version(self) -> u32 {
        self.version
    }
}

/// Where a task prefers to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAffinity {
    /// The group the spawning code is currently running in (or the default
    /// group, if called from outside any worker).
    Current,
    /// Any group; the runtime picks.
    Any,
    /// The runtime's reserved system group.
    System,
}

/// Attributes fixed at spawn time.
#[derive(Debug, Clone)]
pub struct TaskAttrs {
    pub stack_class: StackClass,
    pub affinity: GroupAffinity,
    pub is_system: bool,
    pub joinable: bool,
    /// Pins the task to whichever worker's local queue it lands on: once
    /// there, it is never picked up by `LocalQueue::steal`, and a demoted
    /// or overflowing push keeps it in that worker's ring rather than
    /// spilling it to the group's shared injector.
    pub scheduling_group_local: bool,
}

impl Default for TaskAttrs {
    fn default() -> Self {
        Self {
            stack_class: StackClass::Small,
            affinity: GroupAffinity::Current,
            is_system: false,
            joinable: true,
            scheduling_group_local: false,
        }
    }
}

/// What a completed task handed back to its joiners.
pub enum TaskOutcome {
    Completed,
    /// The entry closure panicked; the payload is whatever
    /// `std::panic::catch_unwind` caught.
    Panicked(Box<dyn Any + Send + 'static>),
    Canceled,
}

impl std::fmt::Debug for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Completed => write!(f, "Completed"),
            TaskOutcome::Panicked(_) => write!(f, "Panicked"),
            TaskOutcome::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Why a fiber suspended itself, as reported to the driving worker.
pub(crate) enum Suspension {
    /// Cooperative `yield_now()`: reschedule immediately.
    Yielded,
    /// `sleep_until`/`sleep_for`: hand to the timer wheel.
    SleepUntil(Instant),
    /// Blocked on a sync primitive; the task has already registered a
    /// resume continuation with the [`Parker`] and needs no further action
    /// from the worker beyond not touching it again until woken.
    Parked,
}

/// What a suspended fiber is told when next resumed. Lets `sleep_until`
/// distinguish "the deadline passed" from "`request_stop` cut the sleep
/// short", without giving every other suspension kind a reason to care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resumption {
    Ready,
    Canceled,
}

#[derive(Default)]
pub(crate) struct TaskLocal {
    pub(crate) id: Cell<TaskId>,
}

type TaskFiber = Fiber<Resumption, Suspension, TaskOutcome, TaskLocal, DefaultFiberStack>;

struct LocalSlot {
    value: Box<dyn Any + Send>,
    destructor: fn(Box<dyn Any + Send>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    New = 0,
    Ready = 1,
    Running = 2,
    Suspended = 3,
    Done = 4,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::New,
            1 => State::Ready,
            2 => State::Running,
            3 => State::Suspended,
            _ => State::Done,
        }
    }
}

/// The heap-owned record backing one fiber.
///
/// A `Task` outlives individual resumptions: it is created by `spawn`,
/// driven to completion across possibly many worker threads (it only ever
/// runs on one thread *at a time* — see the `Send` justification below),
/// and returned to its group's free list once its stack has been released.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) attrs: TaskAttrs,
    pub(crate) group: std::sync::Weak<crate::group::Group>,
    state: AtomicU8,
    /// Bumped once on completion; joiners park on this word's address via
    /// [`Parker::wait_thread64`] / [`Parker::register_task`].
    join_word: AtomicU64,
    pub(crate) stop_requested: AtomicBool,
    /// The timer backing an in-progress `sleep_until`, if any, so
    /// `request_stop` can cancel it and wake the task early instead of
    /// waiting out the full deadline.
    sleep_timer: Mutex<Option<crate::timer::TimerId>>,
    /// Whether the next `resume()` call should feed the fiber
    /// [`Resumption::Canceled`] instead of [`Resumption::Ready`]. Set by
    /// `request_stop` when it wins the race to cancel a pending sleep;
    /// read and reset by the worker driving this task.
    pending_cancel: AtomicBool,
    locals: Mutex<Vec<Option<LocalSlot>>>,
    pub(crate) stolen: AtomicU32,
    pub(crate) last_worker: std::sync::atomic::AtomicUsize,
    outcome: Mutex<Option<TaskOutcome>>,
    fiber: Mutex<Option<Box<TaskFiber>>>,
    released_stack: Mutex<Option<DefaultFiberStack>>,
}

// Safety: a `Task` is resumed by exactly one worker at a time (the
// scheduling group's READY -> RUNNING transition is exclusive, see
// `group.rs`), and it is never touched by two threads concurrently while
// `State::Running`. The `Fiber` inside only objects to being *resumed* from
// more than one thread at once, which this upholds.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        attrs: TaskAttrs,
        group: std::sync::Weak<crate::group::Group>,
        stack: DefaultFiberStack,
        entry: impl FnOnce() + Send + 'static,
    ) -> Arc<Task> {
        Arc::new_cyclic(|weak: &std::sync::Weak<Task>| {
            let weak = weak.clone();
            let fiber = TaskFiber::with_stack_and_local(
                stack,
                TaskLocal { id: Cell::new(id) },
                move |_input: Resumption, suspend, local| {
                    local.id.set(id);
                    // Safety: `suspend` is valid for the duration of this
                    // closure body, which is exactly the window during
                    // which nested runtime code may want to suspend.
                    let ctx = FiberCtx {
                        suspend: NonNull::from(suspend),
                        task: weak.clone(),
                    };
                    CURRENT.with(|c| c.set(Some(ctx)));
                    let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)) {
                        Ok(()) => TaskOutcome::Completed,
                        Err(payload) => TaskOutcome::Panicked(payload),
                    };
                    CURRENT.with(|c| c.set(None));
                    outcome
                },
            );
            Task {
                id,
                attrs,
                group,
                state: AtomicU8::new(State::New as u8),
                join_word: AtomicU64::new(0),
                stop_requested: AtomicBool::new(false),
                sleep_timer: Mutex::new(None),
                pending_cancel: AtomicBool::new(false),
                locals: Mutex::new(Vec::new()),
                stolen: AtomicU32::new(0),
                last_worker: std::sync::atomic::AtomicUsize::new(usize::MAX),
                outcome: Mutex::new(None),
                fiber: Mutex::new(Some(Box::new(fiber))),
                released_stack: Mutex::new(None),
            }
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Requests cooperative cancellation. A task polling [`Self::stop_requested`]
    /// at its own yield points sees this on its next check; a task currently
    /// asleep in `sleep_until`/`sleep_for` is woken immediately instead of
    /// waiting out its deadline, and its sleep returns [`Error::Canceled`].
    pub fn request_stop(self: &Arc<Task>) {
        self.stop_requested.store(true, Ordering::Relaxed);
        let Some(timer_id) = self.sleep_timer.lock().unwrap().take() else {
            return;
        };
        let Some(group) = self.group.upgrade() else {
            return;
        };
        if matches!(
            group.timer_cancel(timer_id),
            crate::timer::CancelOutcome::Canceled
        ) {
            self.pending_cancel.store(true, Ordering::SeqCst);
            crate::group::reschedule(self);
        }
    }

    /// Marks the next resume as canceled without going through the timer:
    /// used when a sleep is about to start but `stop_requested` is already
    /// set, so there is no timer registration to race against.
    pub(crate) fn cancel_sleep_now(&self) {
        self.pending_cancel.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_sleep_timer(&self, id: Option<crate::timer::TimerId>) {
        *self.sleep_timer.lock().unwrap() = id;
    }

    pub(crate) fn clear_sleep_timer(&self) {
        self.sleep_timer.lock().unwrap().take();
    }

    /// Reads and clears the pending-cancel flag, returning the [`Resumption`]
    /// the next `resume()` call should feed the fiber.
    pub(crate) fn take_resumption(&self) -> Resumption {
        if self.pending_cancel.swap(false, Ordering::SeqCst) {
            Resumption::Canceled
        } else {
            Resumption::Ready
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Relaxed)
    }

    pub(crate) fn join_word_addr(&self) -> u64 {
        Parker::key_of(&self.join_word)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state() == State::Done
    }

    /// Drives the task one step: resumes its fiber until it either
    /// suspends (returning the [`Suspension`] reason) or completes.
    ///
    /// # Panics
    /// Panics if the task has already completed.
    pub(crate) fn resume(self: &Arc<Task>, resumption: Resumption) -> StepOutcome {
        self.set_state(State::Running);
        let mut guard = self.fiber.lock().unwrap();
        let fiber = guard.as_mut().expect("resume() called on a completed task");
        match fiber.resume(resumption) {
            fiber::FiberResult::Yield(s) => {
                self.set_state(State::Suspended);
                StepOutcome::Suspended(s)
            }
            fiber::FiberResult::Return(outcome) => {
                let fiber = guard.take().expect("fiber taken twice");
                *self.released_stack.lock().unwrap() = Some(fiber.into_stack());
                self.run_destructors();
                *self.outcome.lock().unwrap() = Some(outcome);
                self.set_state(State::Done);
                self.join_word.fetch_add(1, Ordering::AcqRel);
                StepOutcome::Done
            }
        }
    }

    /// Takes the stack freed by a completed fiber, if any, so the owning
    /// group's stack pool can recycle it.
    pub(crate) fn take_stack(&self) -> Option<DefaultFiberStack> {
        self.released_stack.lock().unwrap().take()
    }

    fn run_destructors(&self) {
        let mut locals = self.locals.lock().unwrap();
        for slot in locals.drain(..).rev().flatten() {
            (slot.destructor)(slot.value);
        }
    }

    /// Runs `f` against the task-local slot `key`, lazily initializing it
    /// with `init` on first access. `destructor` runs, in reverse
    /// insertion order across all of a task's slots, when the task
    /// terminates.
    pub(crate) fn local_with<T: Any + Send + 'static, R>(
        &self,
        key: usize,
        init: impl FnOnce() -> T,
        destructor: fn(Box<dyn Any + Send>),
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        let mut locals = self.locals.lock().unwrap();
        if locals.len() <= key {
            locals.resize_with(key + 1, || None);
        }
        if locals[key].is_none() {
            locals[key] = Some(LocalSlot {
                value: Box::new(init()),
                destructor,
            });
        }
        let slot = locals[key]
            .as_mut()
            .unwrap()
            .value
            .downcast_mut::<T>()
            .expect("task-local slot type mismatch");
        f(slot)
    }
}

pub(crate) enum StepOutcome {
    Suspended(Suspension),
    Done,
}

/// A joinable handle returned by `spawn`.
pub struct JoinHandle {
    pub(crate) task: Arc<Task>,
}

impl JoinHandle {
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    /// Requests cooperative cancellation of the task this handle refers to.
    /// See [`Task::request_stop`].
    pub fn request_stop(&self) {
        self.task.request_stop();
    }

    /// Blocks the calling OS thread until the task completes. If called
    /// from inside a fiber, suspends the *task* instead of the worker
    /// thread, per the parking word's dual-waiter design.
    pub fn join(&self) -> Result<TaskOutcome> {
        if current_task_id() == Some(self.task.id()) {
            return Err(Error::WouldDeadlock);
        }
        let parker = crate::park::sync_parker();
        let addr = self.task.join_word_addr();
        loop {
            if self.task.is_done() {
                break;
            }
            if let Some(ctx) = current_ctx() {
                let task = ctx.task.upgrade();
                let target = self.task.clone();
                let registered = parker.register_task(
                    addr,
                    || !target.is_done(),
                    move || {
                        if let Some(task) = task {
                            crate::group::reschedule(&task);
                        }
                    },
                );
                if registered {
                    suspend_current(Suspension::Parked);
                }
            } else {
                match parker.wait_thread64(
                    addr,
                    &self.task.join_word,
                    self.task.join_word.load(Ordering::Acquire),
                    None,
                ) {
                    WaitResult::Woke | WaitResult::Mismatch => continue,
                    WaitResult::TimedOut => unreachable!("no deadline was given"),
                }
            }
        }
        self.task
            .outcome
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::Internal("task marked done with no outcome"))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_done()
    }
}

struct FiberCtx {
    suspend: NonNull<Suspend<Resumption, Suspension>>,
    task: std::sync::Weak<Task>,
}

thread_local! {
    static CURRENT: Cell<Option<FiberCtx>> = const { Cell::new(None) };
}

/// The identity of the task currently running on this worker thread, if
/// any code on the call stack is executing inside a fiber.
pub fn current_task_id() -> Option<TaskId> {
    CURRENT.with(|c| {
        let ctx = c.take();
        let id = ctx.as_ref().and_then(|ctx| ctx.task.upgrade()).map(|t| t.id);
        c.set(ctx);
        id
    })
}

/// The task currently running on this worker thread, if any. Used by
/// [`crate::sync`] primitives to decide whether a wait should suspend the
/// fiber or block the OS thread.
pub(crate) fn current_task() -> Option<Arc<Task>> {
    CURRENT.with(|c| {
        let ctx = c.take();
        let task = ctx.as_ref().and_then(|ctx| ctx.task.upgrade());
        c.set(ctx);
        task
    })
}

fn current_ctx() -> Option<FiberCtxHandle> {
    CURRENT.with(|c| {
        let ctx = c.take();
        let handle = ctx.as_ref().map(|ctx| FiberCtxHandle {
            suspend: ctx.suspend,
            task: ctx.task.clone(),
        });
        c.set(ctx);
        handle
    })
}

struct FiberCtxHandle {
    suspend: NonNull<Suspend<Resumption, Suspension>>,
    task: std::sync::Weak<Task>,
}

/// Suspends the currently-running task with the given reason.
///
/// # Panics
/// Panics if called outside a fiber (use [`current_task_id`] to check
/// first, or call this only from code paths reachable solely from inside
/// `spawn`ed entry closures).
pub(crate) fn suspend_current(reason: Suspension) -> Resumption {
    let ctx = current_ctx().expect("suspend_current() called outside a running task");
    // Safety: `suspend` was published for the lifetime of the enclosing
    // fiber body and we are still executing inside it.
    unsafe { ctx.suspend.as_ref() }.suspend(reason)
}

/// Cooperatively yields the current task back to its worker, which will
/// reschedule it immediately.
pub fn yield_now() {
    suspend_current(Suspension::Yielded);
}

/// Suspends the current task until `deadline`, handing the sleep to the
/// owning group's timer wheel. Returns [`Error::Canceled`] if
/// [`Task::request_stop`] cuts the sleep short instead of letting it run to
/// its deadline.
pub fn sleep_until(deadline: Instant) -> Result<()> {
    match suspend_current(Suspension::SleepUntil(deadline)) {
        Resumption::Ready => Ok(()),
        Resumption::Canceled => Err(Error::Canceled),
    }
}

pub fn sleep_for(duration: std::time::Duration) -> Result<()> {
    sleep_until(Instant::now() + duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_versions_differ() {
        let a = TaskId { slot: 0, version: 0 };
        let b = TaskId { slot: 0, version: 1 };
        assert_ne!(a, b);
    }
}
