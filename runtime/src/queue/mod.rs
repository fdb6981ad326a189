// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The ready queue: one bounded local ring plus LIFO slot per worker, and a
//! group-wide overflow injector for tasks that do not fit locally or that
//! were enqueued from outside any worker.

mod local;

pub(crate) use local::LocalQueue;

use crate::task::Task;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::Arc;

struct GlobalNode {
    links: mpsc_queue::Links<GlobalNode>,
    task: Option<Arc<Task>>,
}

impl Default for GlobalNode {
    fn default() -> Self {
        Self {
            links: mpsc_queue::Links::default(),
            task: None,
        }
    }
}

// Safety: `GlobalNode` is only ever moved into the queue it was built for,
// and `links` is a plain field accessed via `addr_of_mut!`, never moved out
// from under a pinned allocation.
unsafe impl mpsc_queue::Linked for GlobalNode {
    type Handle = Pin<Box<GlobalNode>>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        // Safety: the handle came from a `Box::pin` and is never moved
        // again once linked into the queue.
        unsafe { NonNull::from(Box::leak(Pin::into_inner_unchecked(handle))) }
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: caller guarantees `ptr` came from a prior `into_ptr`.
        unsafe { Pin::new_unchecked(Box::from_raw(ptr.as_ptr())) }
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<mpsc_queue::Links<Self>> {
        // Safety: caller guarantees `target` is a valid, live `GlobalNode`.
        let links = unsafe { ptr::addr_of_mut!((*target.as_ptr()).links) };
        unsafe { NonNull::new_unchecked(links) }
    }
}

/// The group-wide overflow queue: tasks that did not fit in a worker's
/// local ring, or that were enqueued by a thread that is not a worker at
/// all, land here. Drained periodically by every worker (see
/// `RuntimeConfig::overflow_drain_every`) so overflowed tasks are not
/// starved behind an endless supply of freshly-spawned local work.
pub(crate) struct GlobalQueue {
    queue: mpsc_queue::MpscQueue<GlobalNode>,
}

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: mpsc_queue::MpscQueue::new_with_stub(Box::pin(GlobalNode::default())),
        }
    }

    pub(crate) fn push(&self, task: Arc<Task>) {
        self.queue.enqueue(Box::pin(GlobalNode {
            links: mpsc_queue::Links::default(),
            task: Some(task),
        }));
    }

    pub(crate) fn pop(&self) -> Option<Arc<Task>> {
        let node = self.queue.dequeue()?;
        node.task.clone()
    }
}
