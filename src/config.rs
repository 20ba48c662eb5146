//! Kernel configuration
//!
//! Capacities are compile-time constants; tunables that a board or a test
//! wants to change live in [`KernelConfig`].

use crate::error::{KResult, KernelError};
use crate::thread::Priority;

/// Maximum threads the kernel can manage, idle thread included
pub const MAX_THREADS: usize = 32;

/// Number of cooperative (non-preemptible) priority levels
pub const NUM_COOP_PRIORITIES: usize = 16;

/// Number of preemptible priority levels
pub const NUM_PREEMPT_PRIORITIES: usize = 16;

/// Ready-queue levels: cooperative + preemptible + the idle level
pub const PRIORITY_LEVELS: usize = NUM_COOP_PRIORITIES + NUM_PREEMPT_PRIORITIES + 1;

/// Maximum events in a single `poll` call
pub const MAX_POLL_EVENTS: usize = 32;

/// Stack size recorded for threads spawned without an explicit one
pub const DEFAULT_STACK_SIZE: usize = 1024;

/// What the kernel does when it detects a programming error
/// (`InvalidState` or `ContextViolation`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisusePolicy {
    /// Log and return the error to the caller
    Report,
    /// Log, terminate the offending thread, and return the error
    AbortThread,
    /// Log and panic
    Panic,
}

/// Runtime kernel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Tick rate of the time source
    pub ticks_per_sec: u32,
    /// Round-robin quantum in ticks (0 disables time slicing)
    pub time_slice_ticks: u32,
    /// Only threads at this priority or less urgent are time-sliced
    pub time_slice_ceiling: Priority,
    /// Size of the TCB table (at most [`MAX_THREADS`])
    pub max_threads: usize,
    /// Handling of programming errors
    pub misuse: MisusePolicy,
}

impl KernelConfig {
    /// Defaults: 1 kHz tick, no time slicing, full thread table.
    /// Misuse panics in debug builds and is reported in release builds.
    pub const fn new() -> Self {
        Self {
            ticks_per_sec: 1000,
            time_slice_ticks: 0,
            time_slice_ceiling: Priority(0),
            max_threads: MAX_THREADS,
            misuse: if cfg!(debug_assertions) {
                MisusePolicy::Panic
            } else {
                MisusePolicy::Report
            },
        }
    }

    /// Configuration for tests: misuse is reported, never fatal
    pub const fn testing() -> Self {
        Self {
            misuse: MisusePolicy::Report,
            ..Self::new()
        }
    }

    /// Set the tick rate
    pub const fn with_ticks_per_sec(self, ticks_per_sec: u32) -> Self {
        Self {
            ticks_per_sec,
            ..self
        }
    }

    /// Enable time slicing of `ticks` for priorities at or below `ceiling`
    pub const fn with_time_slice(self, ticks: u32, ceiling: Priority) -> Self {
        Self {
            time_slice_ticks: ticks,
            time_slice_ceiling: ceiling,
            ..self
        }
    }

    /// Shrink the thread table
    pub const fn with_max_threads(self, max_threads: usize) -> Self {
        Self {
            max_threads,
            ..self
        }
    }

    /// Choose the misuse policy
    pub const fn with_misuse(self, misuse: MisusePolicy) -> Self {
        Self { misuse, ..self }
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> KResult<()> {
        if self.ticks_per_sec == 0 {
            return Err(KernelError::InvalidState);
        }
        // idle plus at least one application thread
        if self.max_threads < 2 || self.max_threads > MAX_THREADS {
            return Err(KernelError::InvalidState);
        }
        if !self.time_slice_ceiling.is_valid() {
            return Err(KernelError::InvalidState);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(KernelConfig::new().validate().is_ok());
        assert!(KernelConfig::testing().validate().is_ok());
        assert_eq!(KernelConfig::testing().misuse, MisusePolicy::Report);
    }

    #[test]
    fn test_builder() {
        let cfg = KernelConfig::testing()
            .with_ticks_per_sec(100)
            .with_time_slice(5, Priority(2))
            .with_max_threads(4);
        assert_eq!(cfg.ticks_per_sec, 100);
        assert_eq!(cfg.time_slice_ticks, 5);
        assert_eq!(cfg.time_slice_ceiling, Priority(2));
        assert_eq!(cfg.max_threads, 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let zero_rate = KernelConfig::testing().with_ticks_per_sec(0);
        assert_eq!(zero_rate.validate(), Err(KernelError::InvalidState));

        let too_many = KernelConfig::testing().with_max_threads(MAX_THREADS + 1);
        assert_eq!(too_many.validate(), Err(KernelError::InvalidState));

        let only_idle = KernelConfig::testing().with_max_threads(1);
        assert_eq!(only_idle.validate(), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_priority_levels() {
        assert_eq!(PRIORITY_LEVELS, 33);
        assert!(PRIORITY_LEVELS <= 64, "ready bitmap is a u64");
    }
}
