//! High-precision timing primitives for the metrics context.
//!
//! # Why Nanosecond Precision?
//!
//! The operations this core times span several orders of magnitude: a full
//! stride is seconds, a training iteration is milliseconds, and a single
//! expand or batch slice is microseconds or less. Millisecond counters would
//! round the hot buffer operations to zero and make overhead analysis
//! meaningless, so durations are carried as integer nanoseconds end to end
//! and only converted at the reporting boundary.
//!
//! The types here are deliberately free of any global state; they are owned
//! by [`RunMetrics`](crate::metrics::RunMetrics), whose lifetime is one
//! training run.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Instant;

// ===== Duration =====

/// A span of time with nanosecond resolution.
///
/// A thin newtype over `u64` nanoseconds with saturating arithmetic, so
/// accumulation never panics and never wraps.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Duration(u64);

impl Duration {
    /// The zero duration.
    pub const ZERO: Self = Self(0);

    /// Creates a duration from nanoseconds.
    #[inline]
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a duration from microseconds.
    #[inline]
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros.saturating_mul(1_000))
    }

    /// Creates a duration from milliseconds.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a duration from fractional seconds.
    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs <= 0.0 {
            return Self::ZERO;
        }
        Self((secs * 1e9) as u64)
    }

    /// Returns the duration in whole nanoseconds.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the duration in whole microseconds.
    #[inline]
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Returns the duration in whole milliseconds.
    #[inline]
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Returns the duration in fractional milliseconds.
    #[inline]
    #[must_use]
    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / 1e6
    }

    /// Returns the duration in fractional seconds.
    #[inline]
    #[must_use]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Saturating subtraction.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Whether this is the zero duration.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for Duration {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Duration {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Duration {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl SubAssign for Duration {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = self.saturating_sub(rhs);
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Self(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

// ===== Timer =====

/// A wall-clock stopwatch.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Starts a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time since the timer started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from(self.start.elapsed())
    }

    /// Restarts the timer and returns the elapsed time up to the restart.
    pub fn restart(&mut self) -> Duration {
        let elapsed = self.elapsed();
        self.start = Instant::now();
        elapsed
    }
}

// ===== ScopedTimer =====

/// RAII timer that reports its elapsed time to a callback on drop.
///
/// Used around scopes whose exits are numerous or implicit, so the
/// measurement cannot be forgotten on an early return.
pub struct ScopedTimer<F: FnOnce(Duration)> {
    timer: Timer,
    callback: Option<F>,
}

impl<F: FnOnce(Duration)> ScopedTimer<F> {
    /// Starts a scoped timer with the given completion callback.
    #[must_use]
    pub fn new(callback: F) -> Self {
        Self {
            timer: Timer::start(),
            callback: Some(callback),
        }
    }
}

impl<F: FnOnce(Duration)> Drop for ScopedTimer<F> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(self.timer.elapsed());
        }
    }
}

// ===== TimingStats =====

/// Accumulated timing statistics for one labeled operation.
///
/// Tracks count, total, minimum and maximum so averages and outliers are
/// both recoverable without retaining individual samples.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimingStats {
    /// Number of recorded samples.
    pub count: u64,
    /// Sum of all samples.
    pub total: Duration,
    /// Smallest sample, zero when empty.
    pub min: Duration,
    /// Largest sample, zero when empty.
    pub max: Duration,
}

impl TimingStats {
    /// Creates empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one sample.
    pub fn record(&mut self, sample: Duration) {
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            if sample < self.min {
                self.min = sample;
            }
            if sample > self.max {
                self.max = sample;
            }
        }
        self.count += 1;
        self.total += sample;
    }

    /// Average sample duration, zero when empty.
    #[must_use]
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total.as_nanos() / self.count)
        }
    }

    /// Average sample duration in fractional milliseconds.
    #[must_use]
    pub fn average_ms(&self) -> f64 {
        self.average().as_millis_f64()
    }

    /// Merges another accumulator into this one.
    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.count += other.count;
        self.total += other.total;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_conversions() {
        let d = Duration::from_millis(3);
        assert_eq!(d.as_nanos(), 3_000_000);
        assert_eq!(d.as_micros(), 3_000);
        assert_eq!(d.as_millis(), 3);
        assert!((d.as_millis_f64() - 3.0).abs() < 1e-12);
        assert!((d.as_secs_f64() - 0.003).abs() < 1e-12);
    }

    #[test]
    fn duration_arithmetic_saturates() {
        let a = Duration::from_nanos(10);
        let b = Duration::from_nanos(25);
        assert_eq!((a + b).as_nanos(), 35);
        assert_eq!((a - b).as_nanos(), 0);

        let mut acc = Duration::from_nanos(u64::MAX - 1);
        acc += Duration::from_nanos(100);
        assert_eq!(acc.as_nanos(), u64::MAX);
    }

    #[test]
    fn duration_from_secs_f64_clamps_negative() {
        assert_eq!(Duration::from_secs_f64(-1.0), Duration::ZERO);
        assert_eq!(Duration::from_secs_f64(1.5).as_millis(), 1_500);
    }

    #[test]
    fn timer_measures_something() {
        let timer = Timer::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let elapsed = timer.elapsed();
        assert!(elapsed.as_nanos() > 0);
    }

    #[test]
    fn scoped_timer_reports_on_drop() {
        let mut reported = Duration::ZERO;
        {
            let _scope = ScopedTimer::new(|d| reported = d);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(reported.as_nanos() > 0);
    }

    #[test]
    fn stats_track_min_max_average() {
        let mut stats = TimingStats::new();
        stats.record(Duration::from_nanos(100));
        stats.record(Duration::from_nanos(300));
        stats.record(Duration::from_nanos(200));

        assert_eq!(stats.count, 3);
        assert_eq!(stats.min.as_nanos(), 100);
        assert_eq!(stats.max.as_nanos(), 300);
        assert_eq!(stats.average().as_nanos(), 200);
    }

    #[test]
    fn stats_merge() {
        let mut a = TimingStats::new();
        a.record(Duration::from_nanos(50));
        let mut b = TimingStats::new();
        b.record(Duration::from_nanos(150));
        b.record(Duration::from_nanos(250));

        a.merge(&b);
        assert_eq!(a.count, 3);
        assert_eq!(a.min.as_nanos(), 50);
        assert_eq!(a.max.as_nanos(), 250);

        let empty = TimingStats::new();
        a.merge(&empty);
        assert_eq!(a.count, 3);
    }
}
