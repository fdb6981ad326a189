// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime's unified error taxonomy.

/// Errors returned by the public runtime API.
///
/// All errors are values; the runtime never unwinds across a task's
/// trampoline boundary (a panicking task entry closure is caught and
/// surfaced to joiners as [`crate::task::TaskResult::Panicked`], not as
/// an `Error`).
#[derive(Debug, onlyerror::Error)]
pub enum Error {
    /// The identifier's version no longer matches the live entity; it has
    /// already been recycled.
    #[error("stale identifier, the referenced entity has been recycled")]
    InvalidId,

    /// A deadline expired before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// The calling task's `stop_requested` flag was observed.
    #[error("operation was canceled")]
    Canceled,

    /// A pool was empty and growing it failed, or a bounded queue is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The operation would deadlock the calling task against itself.
    #[error("operation would deadlock")]
    WouldDeadlock,

    /// An internal invariant was violated.
    ///
    /// Debug builds `debug_assert!` at the violated invariant instead of
    /// returning this value. Release builds return it so the violation is
    /// observable without crashing the process.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

/// Convenience alias for fallible runtime operations.
pub type Result<T> = core::result::Result<T, Error>;
