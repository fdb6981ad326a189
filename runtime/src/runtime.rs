// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime: a set of scheduling groups, started together and shut down
//! together. `spawn` resolves [`crate::task::GroupAffinity::Current`] by
//! asking [`crate::group::current_group`] which group (if any) owns the
//! calling OS thread, so a task that itself calls `Runtime::spawn` again
//! lands in its own group by default.

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::task::{GroupAffinity, JoinHandle, StackPool, TaskAttrs};
use std::sync::Arc;

/// A started fiber runtime: one or more scheduling groups, each with its
/// own worker pool, ready queue, and timer wheel.
pub struct Runtime {
    groups: Vec<Arc<Group>>,
}

impl Runtime {
    /// Starts a runtime from the given configuration. Spawns every group's
    /// worker threads before returning.
    pub fn start(config: RuntimeConfig) -> Result<Self> {
        if config.groups.is_empty() {
            return Err(Error::Internal("RuntimeConfig must have at least one group"));
        }
        let groups: Vec<Arc<Group>> = config
            .groups
            .iter()
            .map(|group_config| {
                let stack_pool = StackPool::new(config.default_stack_sizes);
                Group::new(
                    group_config,
                    stack_pool,
                    config.timer_tick,
                    config.stealing_retries,
                    config.overflow_drain_every,
                )
            })
            .collect();
        for group in &groups {
            group.start();
        }
        Ok(Self { groups })
    }

    /// Starts a runtime with [`RuntimeConfig::default`].
    pub fn start_default() -> Result<Self> {
        Self::start(RuntimeConfig::default())
    }

    /// Resolves which scheduling group an operation with the given
    /// affinity should land in. Exposed crate-internally so
    /// [`crate::exec_queue::ExecutionQueue`] can pick a group the same way
    /// `spawn` does, without needing `Group` itself in the public API.
    pub(crate) fn resolve_group(&self, affinity: GroupAffinity) -> Result<&Arc<Group>> {
        match affinity {
            GroupAffinity::Current => {
                if let Some(current) = crate::group::current_group() {
                    if let Some(found) = self.groups.iter().find(|g| Arc::ptr_eq(g, &current)) {
                        return Ok(found);
                    }
                }
                self.groups
                    .iter()
                    .find(|g| !g.is_system)
                    .or_else(|| self.groups.first())
                    .ok_or(Error::Internal("runtime has no scheduling groups"))
            }
            GroupAffinity::Any => self
                .groups
                .iter()
                .min_by_key(|g| g.name)
                .ok_or(Error::Internal("runtime has no scheduling groups")),
            GroupAffinity::System => self
                .groups
                .iter()
                .find(|g| g.is_system)
                .ok_or(Error::Internal("runtime has no system scheduling group")),
        }
    }

    /// Spawns `entry` according to `attrs.affinity`, defaulting to the
    /// group the caller is currently running in (or the default workload
    /// group, if called from outside any worker).
    pub fn spawn(
        &self,
        attrs: TaskAttrs,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<JoinHandle> {
        let group = self.resolve_group(attrs.affinity)?;
        let task = group.spawn(attrs, entry)?;
        Ok(JoinHandle { task })
    }

    /// Spawns with default attributes.
    pub fn spawn_default(&self, entry: impl FnOnce() + Send + 'static) -> Result<JoinHandle> {
        self.spawn(TaskAttrs::default(), entry)
    }

    /// Schedules `callback` to run, as a freshly spawned task in the
    /// default workload group, once `deadline` passes.
    pub fn timer_add(
        &self,
        deadline: std::time::Instant,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<crate::timer::TimerId> {
        let group = self.resolve_group(GroupAffinity::Current)?;
        Ok(group.timer_add(deadline, callback))
    }

    pub fn timer_cancel(&self, id: crate::timer::TimerId) -> Result<crate::timer::CancelOutcome> {
        let group = self.resolve_group(GroupAffinity::Current)?;
        Ok(group.timer_cancel(id))
    }

    /// Stops every scheduling group's workers and blocks until they exit.
    /// Tasks still pending when this is called are dropped without running
    /// to completion.
    pub fn shutdown(self) {
        for group in &self.groups {
            group.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn spawn_default_runs_and_joins() {
        let config = RuntimeConfig::builder()
            .groups(vec![crate::config::GroupConfig::new("workload", 2)])
            .build();
        let rt = Runtime::start(config).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let handle = rt
            .spawn_default(move || {
                ran2.store(true, Ordering::SeqCst);
            })
            .unwrap();
        handle.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        rt.shutdown();
    }

    #[test]
    fn system_affinity_requires_system_group() {
        let config = RuntimeConfig::builder()
            .groups(vec![crate::config::GroupConfig::new("workload", 1)])
            .build();
        let rt = Runtime::start(config).unwrap();
        let err = rt.spawn(
            TaskAttrs {
                affinity: GroupAffinity::System,
                ..TaskAttrs::default()
            },
            || {},
        );
        assert!(err.is_err());
        rt.shutdown();
    }

    #[test]
    fn timer_add_fires_callback() {
        let rt = Runtime::start_default().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        rt.timer_add(std::time::Instant::now(), move || {
            fired2.store(true, Ordering::SeqCst);
        })
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !fired.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::SeqCst));
        rt.shutdown();
    }
}
