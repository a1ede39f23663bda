//! Canonical time window arithmetic.
//!
//! A [`TimeHorizon`] answers one question for every component above it: how
//! far ahead in time does this component need to see, and in how many steps.
//! The problem owns one horizon; the engine, each driver, and each phase all
//! work on translated and re-derived copies of it, never on shared state.
//!
//! # Why Accumulate Instead of Divide?
//!
//! `init` and `init_via_stepsize` count steps by repeated addition of the
//! step size rather than by dividing the extent. The two differ in the last
//! ulps, and the accumulated value is the one the temporal buffers actually
//! reach after `nstep` calls to `advance`. Deriving `nstep` the same way the
//! time column evolves keeps the final buffer time and the horizon endpoint
//! in exact agreement, which the terminus check compares directly.

use tracing::{debug, warn};

/// Tolerance used when accumulating steps toward a target extent.
const ACCUMULATION_TOLERANCE: f64 = 1e-14;

/// Tolerance above which a reached endpoint is reported as drifted.
const DRIFT_TOLERANCE: f64 = 1e-9;

/// A time window `[tinit, tfinal]` with an optional step discretization.
///
/// Immutable after initialization except for [`shift`](Self::shift), which
/// translates both bounds. `stepsize` and `nstep` stay `None` for problems
/// with no time dependence.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeHorizon {
    tinit: f64,
    tfinal: Option<f64>,
    stepsize: Option<f64>,
    nstep: Option<usize>,
}

impl TimeHorizon {
    /// Creates a degenerate horizon pinned at a single instant.
    #[must_use]
    pub fn new(tinit: f64) -> Self {
        Self {
            tinit,
            tfinal: Some(tinit),
            stepsize: None,
            nstep: Some(0),
        }
    }

    /// Creates a horizon spanning `[tinit, tinit + textent]`.
    #[must_use]
    pub fn with_extent(tinit: f64, textent: f64) -> Self {
        Self {
            tinit,
            tfinal: Some(tinit + textent),
            stepsize: None,
            nstep: Some(0),
        }
    }

    /// Creates a horizon with both endpoints given exactly, bit for bit.
    #[must_use]
    pub fn between(tinit: f64, tfinal: f64) -> Self {
        Self {
            tinit,
            tfinal: Some(tfinal),
            stepsize: None,
            nstep: Some(0),
        }
    }

    /// Sets the step size without deriving a step count.
    #[must_use]
    pub fn with_stepsize(mut self, stepsize: f64) -> Self {
        self.stepsize = Some(stepsize);
        self
    }

    /// Derives `nstep` and `tfinal` from a target extent.
    ///
    /// With a step size set, accumulates `tinit + k * stepsize` until the
    /// target is reached and stores the reached value as `tfinal`, which may
    /// overshoot the request by up to one step. Without a step size the
    /// horizon becomes unbounded: both `nstep` and `tfinal` turn `None`.
    pub fn init(&mut self, textent: f64) {
        match self.stepsize {
            Some(stepsize) => {
                let target = self.tinit + textent;
                let mut reached = self.tinit;
                let mut nstep = 0usize;
                while reached <= target - ACCUMULATION_TOLERANCE {
                    reached += stepsize;
                    nstep += 1;
                }
                self.tfinal = Some(reached);
                self.nstep = Some(nstep);
                self.check(reached, target);
            }
            None => {
                self.tfinal = None;
                self.nstep = None;
            }
        }
    }

    /// Derives `nstep` from a step size, keeping `tinit` and `tfinal` fixed.
    pub fn init_via_stepsize(&mut self, stepsize: f64) {
        let Some(tfinal) = self.tfinal else {
            warn!("init_via_stepsize called on an unbounded horizon, ignored");
            return;
        };
        self.stepsize = Some(stepsize);
        let mut reached = self.tinit;
        let mut nstep = 0usize;
        while reached < tfinal - ACCUMULATION_TOLERANCE {
            reached += stepsize;
            nstep += 1;
        }
        self.nstep = Some(nstep);
        self.check(reached, tfinal);
    }

    /// Derives the step size from a step count, keeping `tinit` and `tfinal`
    /// fixed. Exact by construction.
    pub fn init_via_nstep(&mut self, nstep: usize) {
        let Some(tfinal) = self.tfinal else {
            warn!("init_via_nstep called on an unbounded horizon, ignored");
            return;
        };
        let stepsize = (tfinal - self.tinit) / nstep as f64;
        self.nstep = Some(nstep);
        self.stepsize = Some(stepsize);
        let reached = self.tinit + stepsize * nstep as f64;
        self.check(reached, tfinal);
    }

    /// Translates both bounds by a constant amount.
    pub fn shift(&mut self, shamt: f64) {
        self.tinit += shamt;
        if let Some(tfinal) = self.tfinal.as_mut() {
            *tfinal += shamt;
        }
    }

    /// Initial time.
    #[inline]
    #[must_use]
    pub fn tinit(&self) -> f64 {
        self.tinit
    }

    /// Final time, `None` when unbounded.
    #[inline]
    #[must_use]
    pub fn tfinal(&self) -> Option<f64> {
        self.tfinal
    }

    /// Step size, `None` when the problem has no time dependence.
    #[inline]
    #[must_use]
    pub fn stepsize(&self) -> Option<f64> {
        self.stepsize
    }

    /// Number of steps spanning the window, `None` when indeterminate.
    #[inline]
    #[must_use]
    pub fn nstep(&self) -> Option<usize> {
        self.nstep
    }

    /// Length of the window, zero when unbounded.
    #[inline]
    #[must_use]
    pub fn extent(&self) -> f64 {
        self.tfinal.unwrap_or(self.tinit) - self.tinit
    }

    fn check(&self, reached: f64, requested: f64) {
        let drift = (reached - requested).abs();
        if drift > DRIFT_TOLERANCE {
            warn!(
                requested,
                reached, drift, "horizon endpoint drifted from requested value"
            );
        } else {
            debug!(
                tinit = self.tinit,
                tfinal = reached,
                nstep = ?self.nstep,
                "horizon initialized"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_counts_steps_toward_extent() {
        let mut th = TimeHorizon::new(0.0).with_stepsize(0.1);
        th.init(1.0);
        assert_eq!(th.nstep(), Some(10));
        let tfinal = th.tfinal().unwrap();
        assert!((tfinal - 1.0).abs() < 1e-9);
        assert!((th.extent() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn init_overshoots_to_reached_value() {
        // Extent between multiples of the step lands on the next full step.
        let mut th = TimeHorizon::new(0.0).with_stepsize(0.1);
        th.init(0.95);
        assert_eq!(th.nstep(), Some(10));
        assert!((th.tfinal().unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn init_without_stepsize_is_unbounded() {
        let mut th = TimeHorizon::new(0.5);
        th.init(1.0);
        assert_eq!(th.nstep(), None);
        assert_eq!(th.tfinal(), None);
        assert_eq!(th.extent(), 0.0);
    }

    #[test]
    fn init_via_stepsize_keeps_tfinal() {
        let mut th = TimeHorizon::with_extent(0.0, 1.0);
        th.init_via_stepsize(0.25);
        assert_eq!(th.nstep(), Some(4));
        assert_eq!(th.tfinal(), Some(1.0));
        assert_eq!(th.stepsize(), Some(0.25));
    }

    #[test]
    fn init_via_nstep_is_exact() {
        let mut th = TimeHorizon::with_extent(0.0, 1.0);
        th.init_via_nstep(8);
        assert_eq!(th.nstep(), Some(8));
        assert_eq!(th.stepsize(), Some(0.125));
        assert_eq!(th.tfinal(), Some(1.0));
    }

    #[test]
    fn between_keeps_endpoints_exactly() {
        let mut th = TimeHorizon::between(0.3, 0.7);
        assert_eq!(th.tinit(), 0.3);
        assert_eq!(th.tfinal(), Some(0.7));
        th.init_via_nstep(4);
        // init_via_nstep derives the step size but never moves the ends.
        assert_eq!(th.tfinal(), Some(0.7));
        assert_eq!(th.nstep(), Some(4));
    }

    #[test]
    fn shift_translates_both_bounds() {
        let mut th = TimeHorizon::with_extent(2.0, 1.0);
        th.shift(0.5);
        assert!((th.tinit() - 2.5).abs() < 1e-12);
        assert!((th.tfinal().unwrap() - 3.5).abs() < 1e-12);
        assert!((th.extent() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_horizon_has_zero_extent() {
        let th = TimeHorizon::new(3.0);
        assert_eq!(th.tfinal(), Some(3.0));
        assert_eq!(th.extent(), 0.0);
        assert_eq!(th.nstep(), Some(0));
    }
}
