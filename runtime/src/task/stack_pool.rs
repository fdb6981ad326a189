// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Size-classed stack allocation: a per-class free list backed by guard-
//! paged mappings, so steady-state spawning does not pay an `mmap` on
//! every task.

use crate::config::StackSizes;
use crate::error::{Error, Result};
use fiber::stack::DefaultFiberStack;
use std::sync::Mutex;

/// Stack size classes. `Main` denotes the OS thread's own stack and is
/// never allocated by the pool; it exists only as an attribute tag for
/// tasks that are meant to run on a worker's native stack (none currently
/// do — reserved for a future "inline" execution mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackClass {
    Main,
    Small,
    Normal,
    Large,
}

struct Lists {
    small: Vec<DefaultFiberStack>,
    normal: Vec<DefaultFiberStack>,
    large: Vec<DefaultFiberStack>,
}

/// Per-group stack pool. Falls back to a fresh guard-paged `mmap`/
/// `VirtualAlloc` mapping (via [`DefaultFiberStack::new`]) when its free
/// list for a class is empty.
pub struct StackPool {
    sizes: StackSizes,
    lists: Mutex<Lists>,
}

impl StackPool {
    pub fn new(sizes: StackSizes) -> Self {
        Self {
            sizes,
            lists: Mutex::new(Lists {
                small: Vec::new(),
                normal: Vec::new(),
                large: Vec::new(),
            }),
        }
    }

    pub fn acquire(&self, class: StackClass) -> Result<DefaultFiberStack> {
        let (list, size) = {
            let lists = self.lists.lock().unwrap();
            match class {
                StackClass::Main => {
                    return Err(Error::Internal(
                        "StackClass::Main is never allocated from the pool",
                    ));
                }
                StackClass::Small => (lists.small.len(), self.sizes.small),
                StackClass::Normal => (lists.normal.len(), self.sizes.normal),
                StackClass::Large => (lists.large.len(), self.sizes.large),
            }
        };
        if list > 0 {
            let mut lists = self.lists.lock().unwrap();
            let popped = match class {
                StackClass::Main => unreachable!(),
                StackClass::Small => lists.small.pop(),
                StackClass::Normal => lists.normal.pop(),
                StackClass::Large => lists.large.pop(),
            };
            if let Some(stack) = popped {
                return Ok(stack);
            }
        }
        DefaultFiberStack::new(size).map_err(|_| Error::ResourceExhausted("stack allocation failed"))
    }

    /// Returns a stack to its class's free list. Must only be called after
    /// the task that owned it has fully switched off it.
    pub fn release(&self, class: StackClass, stack: DefaultFiberStack) {
        let mut lists = self.lists.lock().unwrap();
        match class {
            StackClass::Main => {}
            StackClass::Small => lists.small.push(stack),
            StackClass::Normal => lists.normal.push(stack),
            StackClass::Large => lists.large.push(stack),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_reuses_stack() {
        let pool = StackPool::new(StackSizes::default());
        let stack = pool.acquire(StackClass::Small).unwrap();
        pool.release(StackClass::Small, stack);
        let lists = pool.lists.lock().unwrap();
        assert_eq!(lists.small.len(), 1);
    }
}
