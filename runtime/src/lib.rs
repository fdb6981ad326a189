// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An M:N fiber scheduling runtime: cooperative user-space tasks
//! work-stolen across a pool of worker OS threads, with a timer wheel,
//! fiber-aware synchronization primitives, and per-key execution queues.
//!
//! A [`Runtime`] owns one or more scheduling groups. Spawn a
//! task with [`Runtime::spawn`], block on it with [`task::JoinHandle::join`],
//! and coordinate between tasks with [`sync`]'s `Mutex`/`CondVar`/
//! `CountdownEvent`/`Session`, all of which suspend the calling task instead
//! of its worker thread when called from inside one.

#![feature(thread_id_value)]

mod config;
mod error;
mod exec_queue;
mod group;
mod idle;
mod park;
mod queue;
mod runtime;
pub mod sync;
pub mod task;
mod timer;

pub use config::{CliArgs, GroupConfig, RuntimeConfig, RuntimeConfigBuilder, StackSizes};
pub use error::{Error, Result};
pub use exec_queue::{
    CancelOutcome as ExecQueueCancelOutcome, ExecuteHandle, ExecutionQueue, QueueId,
};
pub use runtime::Runtime;
pub use timer::{CancelOutcome as TimerCancelOutcome, TimerId};
