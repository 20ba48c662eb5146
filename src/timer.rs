//! System timer: the kernel's tick source
//!
//! A monotonic tick counter advanced once per timer interrupt. Every
//! timeout in the kernel is expressed as an absolute tick deadline against
//! this counter. On real hardware the tick comes from SysTick (Cortex-M) or
//! MTIME (RISC-V); here it is driven by [`Kernel::on_tick`](crate::Kernel::on_tick).

/// System timer
pub struct SysTimer {
    /// Ticks since boot
    ticks: u64,
    /// Tick rate
    ticks_per_sec: u32,
    /// Counter wrap-arounds
    overflows: u32,
}

impl SysTimer {
    /// Create a timer ticking at `ticks_per_sec`
    pub const fn new(ticks_per_sec: u32) -> Self {
        Self {
            ticks: 0,
            ticks_per_sec,
            overflows: 0,
        }
    }

    /// Software timer for testing (1 kHz)
    pub const fn software() -> Self {
        Self::new(1000)
    }

    /// Advance time by `ticks`
    pub fn advance(&mut self, ticks: u64) {
        let new = self.ticks.wrapping_add(ticks);
        if new < self.ticks {
            self.overflows += 1;
        }
        self.ticks = new;
    }

    /// Current tick count
    pub fn now(&self) -> u64 {
        self.ticks
    }

    /// Uptime in milliseconds
    pub fn uptime_ms(&self) -> u64 {
        self.ticks_to_ms(self.ticks)
    }

    /// Tick rate
    pub fn ticks_per_sec(&self) -> u32 {
        self.ticks_per_sec
    }

    /// Number of overflows
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// Ticks elapsed since a reference point
    pub fn elapsed_since(&self, reference: u64) -> u64 {
        self.ticks.wrapping_sub(reference)
    }

    /// Milliseconds to ticks, rounded up so a wait never ends early.
    /// Saturates at `u64::MAX`.
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        let ticks = (ms as u128 * self.ticks_per_sec as u128).div_ceil(1000);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Ticks to milliseconds, rounded down; saturates at `u64::MAX`
    pub fn ticks_to_ms(&self, ticks: u64) -> u64 {
        let ms = ticks as u128 * 1000 / self.ticks_per_sec as u128;
        u64::try_from(ms).unwrap_or(u64::MAX)
    }

    /// Bounded timeout of `ms` milliseconds at this timer's rate
    pub fn timeout_ms(&self, ms: u64) -> Timeout {
        Timeout::Ticks(self.ms_to_ticks(ms))
    }
}

/// How long a blocking call may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail with `WouldBlock` instead of waiting
    NoWait,
    /// Wait until released
    Forever,
    /// Wait at most this many ticks
    Ticks(u64),
}

impl Timeout {
    /// `NoWait`, or a zero-tick bound
    pub const fn is_no_wait(self) -> bool {
        matches!(self, Timeout::NoWait | Timeout::Ticks(0))
    }

    /// Absolute deadline for a wait starting at `now` (`None` = unbounded)
    pub fn deadline(self, now: u64) -> Option<u64> {
        match self {
            Timeout::Ticks(n) if n > 0 => Some(now.saturating_add(n)),
            _ => None,
        }
    }
}

/// Ticks left until `deadline` (0 once passed)
pub fn remaining(now: u64, deadline: u64) -> u64 {
    deadline.saturating_sub(now)
}
