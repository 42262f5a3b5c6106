//! Virtual time for the executor.
//!
//! The executor never reads the wall clock. Time only moves when the owner calls
//! [`Executor::advance_by`](crate::Executor::advance_by) or
//! [`Executor::advance_to`](crate::Executor::advance_to), which makes every
//! timeout path reproducible.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// A point in executor time, in microseconds since the executor was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FlowTime(u64);

impl FlowTime {
    /// The executor epoch.
    pub const ZERO: FlowTime = FlowTime(0);

    /// Create a time from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        FlowTime(us)
    }

    /// Create a time from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        FlowTime(ms * 1_000)
    }

    /// Microseconds since the epoch.
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Milliseconds since the epoch (truncated).
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000
    }

    /// Seconds since the epoch.
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Time elapsed since `earlier`, saturating at zero.
    pub fn saturating_since(&self, earlier: FlowTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for FlowTime {
    type Output = FlowTime;

    fn add(self, rhs: Duration) -> FlowTime {
        let us = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        FlowTime(self.0.saturating_add(us))
    }
}

impl Sub for FlowTime {
    type Output = Duration;

    fn sub(self, rhs: FlowTime) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for FlowTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}
