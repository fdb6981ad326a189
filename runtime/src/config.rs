// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime configuration: the programmatic builder and a `clap`-derived CLI
//! surface for binaries that want a ready-made `--workers` flag.

use std::time::Duration;

/// Byte sizes for each stack size class.
#[derive(Debug, Clone, Copy)]
pub struct StackSizes {
    pub small: usize,
    pub normal: usize,
    pub large: usize,
}

impl Default for StackSizes {
    fn default() -> Self {
        Self {
            small: 32 * 1024,
            normal: 256 * 1024,
            large: 4 * 1024 * 1024,
        }
    }
}

/// Configuration for a single scheduling group.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Number of worker threads in this group.
    pub worker_count: usize,
    /// Name used for worker thread names and tracing spans.
    pub name: &'static str,
    /// Whether this group is reserved for "system" tasks.
    pub is_system: bool,
}

impl GroupConfig {
    pub fn new(name: &'static str, worker_count: usize) -> Self {
        Self {
            worker_count,
            name,
            is_system: false,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub groups: Vec<GroupConfig>,
    pub default_stack_sizes: StackSizes,
    pub parking_array_size: usize,
    pub stealing_retries: u32,
    pub overflow_drain_every: u32,
    pub timer_tick: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = default_worker_count();
        Self {
            groups: vec![GroupConfig::new("workload", workers)],
            default_stack_sizes: StackSizes::default(),
            parking_array_size: 32,
            stealing_retries: 4,
            overflow_drain_every: 61,
            timer_tick: Duration::from_millis(1),
        }
    }
}

impl RuntimeConfig {
    /// Starts a builder seeded with the default configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Fluent builder for [`RuntimeConfig`].
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn groups(mut self, groups: Vec<GroupConfig>) -> Self {
        self.config.groups = groups;
        self
    }

    pub fn stack_sizes(mut self, sizes: StackSizes) -> Self {
        self.config.default_stack_sizes = sizes;
        self
    }

    pub fn parking_array_size(mut self, n: usize) -> Self {
        self.config.parking_array_size = n;
        self
    }

    pub fn stealing_retries(mut self, n: u32) -> Self {
        self.config.stealing_retries = n;
        self
    }

    pub fn overflow_drain_every(mut self, n: u32) -> Self {
        self.config.overflow_drain_every = n;
        self
    }

    pub fn timer_tick(mut self, d: Duration) -> Self {
        self.config.timer_tick = d;
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

/// Derives the default worker count: `FIBER_WORKER_THREADS` if set and
/// valid, otherwise the host's available parallelism.
fn default_worker_count() -> usize {
    std::env::var("FIBER_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        })
}

/// Command-line arguments for binaries embedding the runtime.
///
/// Mirrors this codebase's `cmdline`-parsing convention but targets a
/// hosted binary's `argv`/environment instead of a kernel boot command
/// line.
#[derive(Debug, clap::Parser)]
#[command(name = "fiber-rt", about = "fiber scheduling runtime")]
pub struct CliArgs {
    /// Number of worker threads in the default workload group.
    #[arg(long, env = "FIBER_WORKER_THREADS")]
    pub workers: Option<usize>,

    /// Enables a second scheduling group reserved for system tasks, sized
    /// to one worker.
    #[arg(long)]
    pub system_group: bool,
}

impl CliArgs {
    pub fn into_config(self) -> RuntimeConfig {
        let workers = self.workers.unwrap_or_else(default_worker_count);
        let mut groups = vec![GroupConfig::new("workload", workers)];
        if self.system_group {
            let mut system = GroupConfig::new("system", 1);
            system.is_system = true;
            groups.push(system);
        }
        RuntimeConfig::builder().groups(groups).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_group() {
        let config = RuntimeConfig::default();
        assert_eq!(config.groups.len(), 1);
        assert!(config.groups[0].worker_count >= 1);
    }

    #[test]
    fn builder_overrides_tunables() {
        let config = RuntimeConfig::builder()
            .parking_array_size(8)
            .stealing_retries(2)
            .overflow_drain_every(10)
            .build();
        assert_eq!(config.parking_array_size, 8);
        assert_eq!(config.stealing_retries, 2);
        assert_eq!(config.overflow_drain_every, 10);
    }
}
