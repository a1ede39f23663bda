//! Run configuration and the resolved run plan.
//!
//! [`RunConfig`] holds the topline knobs of a run: the stride/step/substep
//! division of the time horizon, sampling densities, seeds, and the
//! truncation switches used for smoke tests. It says nothing about the
//! problem; [`RunConfig::plan`] marries the two, applies the truncation
//! coercions, and produces the [`RunPlan`] the engine actually executes.
//!
//! # Defaults
//!
//! | Field        | Default | Meaning                                        |
//! |--------------|---------|------------------------------------------------|
//! | `stride`     | 1       | strides the horizon divides into               |
//! | `step`       | 1       | steps per stride                               |
//! | `substep`    | 1       | per-step subdivision offered to surrogates     |
//! | `batchsize`  | 64      | default batch size for phases without one      |
//! | `spl`        | 32.0    | default samples per unit length                |
//! | `spd`        | none    | samples per step division (moment lattices)    |
//! | `spd_parts`  | none    | `spd` as a divisor of the step size            |
//! | `shelf`      | 0.0     | temporal margin past each step endpoint        |
//! | `seed`       | 42      | master RNG seed                                |
//! | `drivers`    | 1       | drivers marching the horizon in a ring         |
//! | `dryrun`     | false   | coerce the run to one minimal step             |
//! | `early_nstep`| none    | truncate to the first k steps                  |
//! | `early_nstride`| none  | truncate to the first k strides                |
//! | `metrics`    | true    | record timings and counters                    |

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PinnResult, PinnTrainingError};
use crate::horizon::TimeHorizon;
use crate::problem::Problem;

/// Iteration ceiling forced on every phase in a dry run.
pub const DRYRUN_MAX_ITERATIONS: usize = 2;

/// Samples per unit length forced on every phase in a dry run.
pub const DRYRUN_SPL: f64 = 32.0;

/// Batch size forced on every phase in a dry run.
pub const DRYRUN_BATCHSIZE: usize = 16;

fn default_stride() -> usize {
    1
}

fn default_step() -> usize {
    1
}

fn default_substep() -> usize {
    1
}

fn default_batchsize() -> usize {
    64
}

fn default_spl() -> f64 {
    32.0
}

fn default_shelf() -> f64 {
    0.0
}

fn default_seed() -> u64 {
    42
}

fn default_drivers() -> usize {
    1
}

fn default_metrics() -> bool {
    true
}

/// Topline configuration of a training run.
///
/// Deserializes from TOML with every field optional; missing fields take
/// the documented defaults. Values are checked by [`validate`](Self::validate),
/// not at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of strides the time horizon divides into.
    #[serde(default = "default_stride")]
    pub stride: usize,

    /// Number of steps per stride.
    #[serde(default = "default_step")]
    pub step: usize,

    /// Per-step subdivision surfaced to surrogate-side integrators.
    #[serde(default = "default_substep")]
    pub substep: usize,

    /// Batch size for phases that do not set their own.
    #[serde(default = "default_batchsize")]
    pub batchsize: usize,

    /// Samples per unit length for phases that do not set their own.
    #[serde(default = "default_spl")]
    pub spl: f64,

    /// Samples per step division, for temporal columns and moment lattices.
    #[serde(default)]
    pub spd: Option<f64>,

    /// Alternative `spd` form: the step size divided into this many parts.
    /// Mutually exclusive with `spd`.
    #[serde(default)]
    pub spd_parts: Option<usize>,

    /// Temporal margin sampled past each step endpoint, as a fraction of
    /// the step size.
    #[serde(default = "default_shelf")]
    pub shelf: f64,

    /// Master seed; every sampler derives its stream from it.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Number of drivers marching the horizon in a ring.
    #[serde(default = "default_drivers")]
    pub drivers: usize,

    /// Coerce the run to a single cheap step for smoke testing.
    #[serde(default)]
    pub dryrun: bool,

    /// Truncate the run to its first `k` steps (single stride).
    #[serde(default)]
    pub early_nstep: Option<usize>,

    /// Truncate the run to its first `k` strides.
    #[serde(default)]
    pub early_nstride: Option<usize>,

    /// Whether to record run metrics.
    #[serde(default = "default_metrics")]
    pub metrics: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stride: default_stride(),
            step: default_step(),
            substep: default_substep(),
            batchsize: default_batchsize(),
            spl: default_spl(),
            spd: None,
            spd_parts: None,
            shelf: default_shelf(),
            seed: default_seed(),
            drivers: default_drivers(),
            dryrun: false,
            early_nstep: None,
            early_nstride: None,
            metrics: default_metrics(),
        }
    }
}

impl RunConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Loads and validates a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, does not parse, or holds an
    /// inconsistent configuration.
    pub fn from_file<P: AsRef<Path>>(path: P) -> PinnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Fails when serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> PinnResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first inconsistency found.
    pub fn validate(&self) -> PinnResult<()> {
        if self.stride == 0 {
            return Err(config_error("stride must be > 0"));
        }
        if self.step == 0 {
            return Err(config_error("step must be > 0"));
        }
        if self.substep == 0 {
            return Err(config_error("substep must be > 0"));
        }
        if self.batchsize == 0 {
            return Err(config_error("batchsize must be > 0"));
        }
        if !(self.spl > 0.0 && self.spl.is_finite()) {
            return Err(config_error("spl must be positive and finite"));
        }
        if let Some(spd) = self.spd {
            if !(spd > 0.0 && spd.is_finite()) {
                return Err(config_error("spd must be positive and finite"));
            }
        }
        if let Some(parts) = self.spd_parts {
            if parts == 0 {
                return Err(config_error("spd_parts must be > 0"));
            }
        }
        if self.spd.is_some() && self.spd_parts.is_some() {
            return Err(config_error("spd and spd_parts are mutually exclusive"));
        }
        if !(self.shelf >= 0.0 && self.shelf.is_finite()) {
            return Err(config_error("shelf must be nonnegative and finite"));
        }
        if self.drivers == 0 {
            return Err(config_error("drivers must be > 0"));
        }
        if self.drivers > self.stride {
            return Err(config_error("drivers must not exceed the stride count"));
        }
        if self.early_nstep.is_some() && self.early_nstride.is_some() {
            return Err(config_error(
                "early_nstep and early_nstride are mutually exclusive",
            ));
        }
        if self.dryrun && (self.early_nstep.is_some() || self.early_nstride.is_some()) {
            return Err(config_error("dryrun already truncates the run; drop the early option"));
        }
        if let Some(k) = self.early_nstep {
            if k == 0 {
                return Err(config_error("early_nstep must be > 0"));
            }
            if k > self.step * self.stride {
                return Err(config_error("early_nstep exceeds the run's total steps"));
            }
        }
        if let Some(k) = self.early_nstride {
            if k == 0 {
                return Err(config_error("early_nstride must be > 0"));
            }
            if k > self.stride {
                return Err(config_error("early_nstride exceeds the stride count"));
            }
        }
        Ok(())
    }

    /// Resolves the configuration against a problem into a [`RunPlan`].
    ///
    /// For a time-dependent problem the plan's horizon spans the (possibly
    /// truncated) extent with `step * stride` exact steps; the step size is
    /// invariant under every truncation, so a truncated run walks the same
    /// temporal grid as the full one. A time-independent problem plans a
    /// single vacuous stride.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, a combination the problem cannot
    /// support (striding without time, `spd_parts` without a step size), or
    /// more drivers than planned strides.
    pub fn plan(&self, problem: &Problem) -> PinnResult<RunPlan> {
        self.validate()?;

        if !problem.time_dependent() {
            return self.plan_static(problem);
        }

        let tinit = problem.th().tinit();
        let textent = problem.th().extent();
        if textent <= 0.0 {
            return Err(config_error("time-dependent problem has an empty horizon"));
        }

        let stride_extent = textent / self.stride as f64;
        let step_extent = stride_extent / self.step as f64;

        let mut stride = self.stride;
        let mut step = self.step;
        let mut drivers = self.drivers;

        let early_extent = if self.dryrun {
            info!("dry run: coercing to a single stride of a single step");
            stride = 1;
            step = 1;
            drivers = 1;
            step_extent
        } else if let Some(k) = self.early_nstride {
            info!(nstride = k, "stopping early after {k} strides");
            stride = k;
            k as f64 * stride_extent
        } else if let Some(k) = self.early_nstep {
            info!(nstep = k, "stopping early after {k} steps");
            stride = 1;
            step = k;
            k as f64 * step_extent
        } else {
            textent
        };

        if drivers > stride {
            return Err(config_error("drivers exceed the planned stride count"));
        }

        let mut th = TimeHorizon::with_extent(tinit, early_extent);
        th.init_via_nstep(step * stride);
        let stepsize = th.stepsize().unwrap_or(step_extent);
        if let Some(problem_step) = problem.th().stepsize() {
            if (stepsize - problem_step).abs() > 1e-9 {
                warn!(
                    planned = stepsize,
                    declared = problem_step,
                    "planned step size differs from the problem's"
                );
            }
        }

        let spd = if let Some(parts) = self.spd_parts {
            Some(stepsize / parts as f64)
        } else {
            self.spd
        };

        Ok(RunPlan {
            stride,
            step,
            substep: self.substep,
            drivers,
            th,
            spd,
            dryrun: self.dryrun,
        })
    }

    /// Plan for a problem with no time dependence: one vacuous stride.
    fn plan_static(&self, problem: &Problem) -> PinnResult<RunPlan> {
        if self.stride > 1 {
            return Err(config_error("stride > 1 requires a time-dependent problem"));
        }
        if self.early_nstep.is_some() || self.early_nstride.is_some() {
            return Err(config_error(
                "early truncation requires a time-dependent problem",
            ));
        }
        if self.spd_parts.is_some() {
            return Err(config_error("spd_parts requires a step size to divide"));
        }
        if self.step != 1 || self.substep != 1 {
            warn!(
                step = self.step,
                substep = self.substep,
                "problem has no time dependence, forcing step and substep to 1"
            );
        }
        Ok(RunPlan {
            stride: 1,
            step: 1,
            substep: 1,
            drivers: 1,
            th: problem.th().clone(),
            spd: self.spd,
            dryrun: self.dryrun,
        })
    }
}

fn config_error(message: &str) -> PinnTrainingError {
    PinnTrainingError::Config {
        message: message.to_string(),
    }
}

/// A configuration resolved against a problem, ready to execute.
///
/// The horizon is derived via an exact step count, so
/// `th.stepsize() * (step * stride)` lands on `th.tfinal()` with no
/// accumulation drift.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    /// Number of strides to march.
    pub stride: usize,
    /// Steps per stride.
    pub step: usize,
    /// Per-step subdivision surfaced to surrogates.
    pub substep: usize,
    /// Drivers in the ring.
    pub drivers: usize,
    /// The resolved run horizon.
    pub th: TimeHorizon,
    /// Resolved samples per step division.
    pub spd: Option<f64>,
    /// Whether dry-run phase coercions apply.
    pub dryrun: bool,
}

impl RunPlan {
    /// Total steps the run will take; one for a time-independent run.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        if self.th.stepsize().is_some() {
            self.th.nstep().unwrap_or(self.step * self.stride)
        } else {
            1
        }
    }

    /// Temporal extent of one stride, zero without time dependence.
    #[must_use]
    pub fn stride_extent(&self) -> f64 {
        self.th.extent() / self.stride as f64
    }

    /// The planned step size.
    #[must_use]
    pub fn stepsize(&self) -> Option<f64> {
        self.th.stepsize()
    }
}

/// Builder for [`RunConfig`].
#[derive(Debug, Default)]
pub struct RunConfigBuilder {
    stride: Option<usize>,
    step: Option<usize>,
    substep: Option<usize>,
    batchsize: Option<usize>,
    spl: Option<f64>,
    spd: Option<f64>,
    spd_parts: Option<usize>,
    shelf: Option<f64>,
    seed: Option<u64>,
    drivers: Option<usize>,
    dryrun: Option<bool>,
    early_nstep: Option<usize>,
    early_nstride: Option<usize>,
    metrics: Option<bool>,
}

impl RunConfigBuilder {
    /// Sets the number of strides.
    #[must_use]
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = Some(stride);
        self
    }

    /// Sets the steps per stride.
    #[must_use]
    pub fn step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    /// Sets the per-step subdivision.
    #[must_use]
    pub fn substep(mut self, substep: usize) -> Self {
        self.substep = Some(substep);
        self
    }

    /// Sets the default batch size.
    #[must_use]
    pub fn batchsize(mut self, batchsize: usize) -> Self {
        self.batchsize = Some(batchsize);
        self
    }

    /// Sets the default samples per unit length.
    #[must_use]
    pub fn spl(mut self, spl: f64) -> Self {
        self.spl = Some(spl);
        self
    }

    /// Sets the samples per step division.
    #[must_use]
    pub fn spd(mut self, spd: f64) -> Self {
        self.spd = Some(spd);
        self
    }

    /// Sets the step division as a divisor of the step size.
    #[must_use]
    pub fn spd_parts(mut self, parts: usize) -> Self {
        self.spd_parts = Some(parts);
        self
    }

    /// Sets the temporal shelf fraction.
    #[must_use]
    pub fn shelf(mut self, shelf: f64) -> Self {
        self.shelf = Some(shelf);
        self
    }

    /// Sets the master seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the driver count.
    #[must_use]
    pub fn drivers(mut self, drivers: usize) -> Self {
        self.drivers = Some(drivers);
        self
    }

    /// Enables or disables the dry run.
    #[must_use]
    pub fn dryrun(mut self, dryrun: bool) -> Self {
        self.dryrun = Some(dryrun);
        self
    }

    /// Truncates the run to its first `k` steps.
    #[must_use]
    pub fn early_nstep(mut self, k: usize) -> Self {
        self.early_nstep = Some(k);
        self
    }

    /// Truncates the run to its first `k` strides.
    #[must_use]
    pub fn early_nstride(mut self, k: usize) -> Self {
        self.early_nstride = Some(k);
        self
    }

    /// Enables or disables metrics recording.
    #[must_use]
    pub fn metrics(mut self, metrics: bool) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the configuration, filling unset fields with defaults.
    #[must_use]
    pub fn build(self) -> RunConfig {
        RunConfig {
            stride: self.stride.unwrap_or_else(default_stride),
            step: self.step.unwrap_or_else(default_step),
            substep: self.substep.unwrap_or_else(default_substep),
            batchsize: self.batchsize.unwrap_or_else(default_batchsize),
            spl: self.spl.unwrap_or_else(default_spl),
            spd: self.spd,
            spd_parts: self.spd_parts,
            shelf: self.shelf.unwrap_or_else(default_shelf),
            seed: self.seed.unwrap_or_else(default_seed),
            drivers: self.drivers.unwrap_or_else(default_drivers),
            dryrun: self.dryrun.unwrap_or(false),
            early_nstep: self.early_nstep,
            early_nstride: self.early_nstride,
            metrics: self.metrics.unwrap_or_else(default_metrics),
        }
    }
}
