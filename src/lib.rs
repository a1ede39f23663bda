//! # pinn-stride-trainer-rs
//!
//! Adaptive temporal sampling and training-loop orchestration for neural
//! surrogates of time-dependent PDE and ODE problems.
//!
//! ## Overview
//!
//! Training a physics-informed surrogate over a long time horizon in one shot
//! is unstable: early-time errors poison late-time residuals. This crate
//! instead marches the horizon in *strides*. Each stride trains on a short
//! time window whose initial condition is the terminal state of the previous
//! window, handed off exactly, so the surrogate always learns against a
//! correct initial slice. Within a stride, sample buffers are extruded along
//! time into cylinders that can *expand* (halve the step, double temporal
//! resolution) and *contract* invertibly, letting a grading schedule spend
//! extra training effort exactly where the carry structure of the step index
//! says it pays.
//!
//! ## Run Anatomy
//!
//! ```text
//! run
//!  └─ stride                    one driver window, marched by the ring
//!      └─ phase                 buffers armed against the window
//!          └─ step              grading picks n = nexpand(step)
//!              ├─ expand ▸ train     n times, levels 1..n
//!              ├─ contract ▸ train   n times, levels n-1..0
//!              └─ advance            buffers move one step in time
//! ```
//!
//! Every `train` above is a session: batches are assembled from the active
//! buffers and fed to the surrogate until the session's tolerance is met or
//! its iteration budget runs out.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pinn_stride_trainer_rs::{Phase, RunConfig, StrideEngine};
//!
//! // Divide the problem horizon into 8 strides of 4 steps.
//! let config = RunConfig::builder()
//!     .stride(8)
//!     .step(4)
//!     .batchsize(64)
//!     .build();
//!
//! // Describe the problem and its sampling sources, then run:
//! // let problem = Problem::new(...).with_constraint(...).with_ic(...);
//! // let engine = StrideEngine::new(problem, config, surrogate,
//! //     vec![Phase::new("sweep")])?;
//! // let report = engine.run()?;
//! // println!("reached t = {:?} in {} strides", report.final_time, report.strides);
//! ```
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`config`] - Run configuration, validation, and plan resolution
//! - [`error`] - Error types with structural/configuration categories
//! - [`problem`] - Problem statement: outputs, constraints, initial condition
//! - [`horizon`] - Time window arithmetic shared by every layer
//! - [`sampler`] - Sample sources and low-discrepancy generators
//! - [`cylinder`] - Expandable time-cylinder sample buffers
//! - [`constraint`] - Per-constraint buffer assembly
//! - [`icbase`] - Initial-condition slices and the hand-off buffer
//! - [`samplesets`] - Multi-buffer aggregation with epoch synchronization
//! - [`moments`] - Moment lattices advanced alongside the buffers
//! - [`strategy`] - Grading and weighting policies with per-level kits
//! - [`phases`] - Phase descriptors and the training iteration loop
//! - [`driver`] - The per-stride state machine
//! - [`ring`] - The rotating driver ring
//! - [`batch`] - Assembled training batches
//! - [`hooks`] - Lifecycle observers and the cooperative stop flag
//! - [`metrics`] - Run counters and per-operation timings
//! - [`timing`] - High-precision timing utilities

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]
// Allow precision loss casts - acceptable in numerical sampling code
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Suppress documentation warnings during development
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]
// Allow other common patterns
#![allow(clippy::needless_range_loop)]
#![allow(clippy::items_after_statements)]

// Core modules
pub mod config;
pub mod error;
pub mod horizon;
pub mod problem;

// Sampling and buffers
pub mod constraint;
pub mod cylinder;
pub mod icbase;
pub mod moments;
pub mod sampler;
pub mod samplesets;

// Training control
pub mod batch;
pub mod hooks;
pub mod phases;
pub mod strategy;

// Stride machinery
pub mod driver;
pub mod ring;

// Metrics and monitoring
pub mod metrics;

// High-precision timing utilities
pub mod timing;

// Re-exports for convenient access
pub use batch::{Batch, ConstraintBatch, IcBatch, TrainStepResult};
pub use config::{RunConfig, RunConfigBuilder, RunPlan};
pub use driver::Driver;
pub use error::{ErrorCategory, PinnResult, PinnTrainingError};
pub use hooks::{Hooks, NullHooks, StopFlag};
pub use horizon::TimeHorizon;
pub use icbase::{IcBase, IcBuffer};
pub use metrics::{RunCounters, RunMetrics, TrainOp};
pub use phases::{Phase, PhaseDefaults};
pub use problem::{Constraint, Problem, ProblemIc};
pub use ring::RingBuffer;
pub use sampler::{
    InitialCondition, IntervalSource, PointSource, SampleMode, Source, UnitSegment,
};
pub use samplesets::SampleSets;
pub use strategy::{
    EagerGrading, Grading, GradingPolicy, Kit, LogarithmicGrading, Strategies, StrategyKind,
    UniformWeighting, WeightingPolicy,
};
pub use timing::{Duration, Timer, TimingStats};

// Standard library imports
use std::sync::Arc;

// External crate imports
// Note: Mutex instead of RwLock for surrogate storage to support !Sync models
use ndarray::Array2;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Trait for models trained as surrogates of the problem's solution.
///
/// # Why This Trait?
///
/// The engine is framework-agnostic. By requiring only pointwise evaluation
/// and a single optimization step against an assembled batch, it works with
/// any tensor framework that can implement these two operations.
///
/// # Thread Safety
///
/// Surrogates must be `Send` to allow moving between threads, but `Sync` is
/// not required. This enables integration with autodiff frameworks whose
/// gradient types are `!Sync` by design; the engine stores the surrogate
/// behind `Arc<Mutex<_>>` accordingly.
///
/// # Example
///
/// ```rust,ignore
/// impl Surrogate for MyNet {
///     fn evaluate(&mut self, inputs: &Array2<f64>) -> Array2<f64> {
///         self.forward(inputs)
///     }
///
///     fn train_step(&mut self, batch: Batch) -> PinnResult<TrainStepResult> {
///         let loss = self.residual_loss(&batch);
///         self.optimizer_step()?;
///         Ok(TrainStepResult { loss })
///     }
/// }
/// ```
pub trait Surrogate: Send {
    /// Evaluates the surrogate at the given points.
    ///
    /// `inputs` has one row per point; for time-dependent problems the time
    /// coordinate is the trailing column. Returns one row per input point
    /// with the problem's output dimension.
    fn evaluate(&mut self, inputs: &Array2<f64>) -> Array2<f64>;

    /// Performs one optimization step against the assembled batch.
    ///
    /// # Errors
    ///
    /// Fails when the step cannot be taken; the error aborts the run.
    fn train_step(&mut self, batch: Batch) -> PinnResult<TrainStepResult>;
}

/// The engine: marches a ring of drivers across the problem's time horizon.
///
/// # Overview
///
/// `StrideEngine` owns the problem, the resolved plan, the surrogate, and a
/// ring of [`Driver`]s. [`run`](Self::run) executes the stride loop: the
/// front driver trains its window, hands its terminal slice to the driver
/// holding the next window, and the oldest window leapfrogs the ring until
/// every window is retired at the horizon's end. A single driver degenerates
/// to plain sequential marching.
///
/// # Example
///
/// ```no_run
/// use pinn_stride_trainer_rs::{Phase, RunConfig, StrideEngine};
///
/// let config = RunConfig::builder().stride(8).step(4).build();
/// // let mut engine = StrideEngine::new(problem, config, net, vec![Phase::new("sweep")])?;
/// // let report = engine.run()?;
/// ```
pub struct StrideEngine<M> {
    /// The problem statement.
    problem: Problem,

    /// The configuration resolved against the problem.
    plan: RunPlan,

    /// The surrogate being trained.
    ///
    /// `Mutex` instead of `RwLock` because surrogates may not be `Sync`.
    surrogate: Arc<Mutex<M>>,

    /// Drivers in march order; position 0 holds the oldest window.
    drivers: RingBuffer<Driver>,

    /// Lifecycle observer.
    hooks: Box<dyn Hooks>,

    /// Cooperative stop flag, observed between iterations and strides.
    stop: StopFlag,

    /// Run counters and per-operation timings.
    metrics: RunMetrics,

    /// Drivers already retired at the horizon's end.
    nretired: usize,
}

impl<M: Surrogate> StrideEngine<M> {
    /// Creates an engine from a problem, a configuration, a surrogate, and
    /// the phases every driver will train.
    ///
    /// The phase list is a template: each driver gets its own copy with its
    /// own seed stream. Under a dry run the template is coerced to the cheap
    /// smoke-test knobs before the drivers are built.
    ///
    /// # Errors
    ///
    /// Fails on an invalid problem or configuration, an empty phase list, or
    /// an `early_nstep` that does not cover whole steps of every phase.
    pub fn new(
        problem: Problem,
        config: RunConfig,
        surrogate: M,
        phases: Vec<Phase>,
    ) -> PinnResult<Self> {
        problem.validate()?;
        let plan = config.plan(&problem)?;
        if phases.is_empty() {
            return Err(PinnTrainingError::Config {
                message: "an engine needs at least one phase".into(),
            });
        }
        if let Some(k) = config.early_nstep {
            for (i, phase) in phases.iter().enumerate() {
                // The final phase always runs at the problem resolution.
                let multiple = if i + 1 == phases.len() {
                    1
                } else {
                    phase.step_multiple()
                };
                if k % multiple != 0 {
                    return Err(PinnTrainingError::Config {
                        message: format!(
                            "early_nstep {k} does not cover whole steps of phase {:?}",
                            phase.label()
                        ),
                    });
                }
            }
        }

        let mut template = phases;
        if plan.dryrun {
            for phase in &mut template {
                phase.coerce_dryrun();
            }
        }

        let drivers: RingBuffer<Driver> = (0..plan.drivers)
            .map(|i| {
                let defaults = PhaseDefaults {
                    // Disjoint seed blocks per driver.
                    seed: config.seed.wrapping_add((i as u64) << 32),
                    ..PhaseDefaults::from_config(&config, plan.spd)
                };
                Driver::new(template.clone(), defaults)
            })
            .collect();

        Ok(Self {
            problem,
            plan,
            surrogate: Arc::new(Mutex::new(surrogate)),
            drivers,
            hooks: Box::new(NullHooks),
            stop: StopFlag::new(),
            metrics: RunMetrics::new(config.metrics),
            nretired: 0,
        })
    }

    /// Attaches a lifecycle observer, replacing the default no-op one.
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl Hooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// The problem being solved.
    #[must_use]
    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    /// The resolved run plan.
    #[must_use]
    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// A handle on the stop flag; setting it winds the run down at the next
    /// check point.
    #[must_use]
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// The run's metrics so far.
    #[must_use]
    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Locks and returns the surrogate, for inspection or checkpointing.
    pub fn surrogate(&self) -> parking_lot::MutexGuard<'_, M> {
        self.surrogate.lock()
    }

    /// Executes the full stride loop.
    ///
    /// Initializes every driver, then marches: critical section on the front
    /// driver, hand-off to the next window's driver, and either a leapfrog
    /// of the oldest window or a retirement once the last window touches the
    /// horizon's end. Returns a [`RunReport`] summarizing the run; a raised
    /// stop flag ends the loop between strides and reports the progress made.
    ///
    /// # Errors
    ///
    /// Fails when initialization, training, or the hand-off fails; the run
    /// stops at the failing stride.
    pub fn run(&mut self) -> PinnResult<RunReport> {
        self.init()?;

        let total = self.plan.total_steps();
        let mut ti = 0usize;
        let mut strides = 0usize;
        info!(
            total_steps = total,
            drivers = self.drivers.len(),
            "stride loop started"
        );

        while ti < total {
            if self.stop.is_set() {
                info!(ti, "stop flag observed, winding down");
                break;
            }
            self.hooks.on_stride(strides, ti);

            let front = self.nretired;
            let timer = Timer::start();
            {
                let driver = self.drivers.get_mut(front).ok_or_else(empty_ring)?;
                driver.critical_section(
                    &self.problem,
                    &self.surrogate,
                    &mut *self.hooks,
                    &self.stop,
                    &mut self.metrics,
                )?;
            }
            self.metrics.record(TrainOp::CriticalSection, timer.elapsed());
            self.metrics.record_stride();
            self.hooks.after_critical_section();

            let progress = self.drivers.get(front).map_or(1, Driver::nstep);

            // Hand the finished slice to the driver holding the next window.
            // The front driver finishing the run's final window has no one
            // to hand to.
            let front_done = self
                .drivers
                .get(front)
                .is_some_and(|d| d.terminus_check(&self.plan.th));
            if !front_done {
                let timer = Timer::start();
                let buffer = self
                    .drivers
                    .get(front)
                    .and_then(Driver::handoff)
                    .cloned()
                    .ok_or_else(|| PinnTrainingError::Uninitialized {
                        label: "driver".into(),
                        what: "hand-off slice",
                    })?;
                self.drivers
                    .get_mut(front + 1)
                    .ok_or_else(empty_ring)?
                    .load_icbase(&buffer)?;
                self.metrics.record(TrainOp::Communication, timer.elapsed());
            }
            self.hooks.after_communication();

            // Leapfrog the oldest window past the ring, or retire once the
            // last window touches the horizon's end.
            let timer = Timer::start();
            let terminus = self
                .drivers
                .back()
                .is_some_and(|d| d.terminus_check(&self.plan.th));
            if terminus {
                self.nretired += 1;
                debug!(retired = self.nretired, "window retired at the run end");
            } else {
                self.increment(ti)?;
            }
            self.metrics.record(TrainOp::Increment, timer.elapsed());

            ti += progress;
            strides += 1;
            self.hooks.after_stride(ti);
        }

        self.hooks.on_end();
        info!(strides, steps = ti, "run complete");

        let final_time = match self.plan.stepsize() {
            Some(_) if ti >= total => self.plan.th.tfinal(),
            Some(stepsize) => Some(self.plan.th.tinit() + stepsize * ti as f64),
            None => None,
        };
        Ok(RunReport {
            strides,
            steps: ti,
            epochs: self.metrics.counters().epochs,
            final_time,
        })
    }

    /// Prepares every driver: phases, bases, and stride windows.
    ///
    /// Driver 0 samples the initial condition; the others copy its pristine
    /// base and receive corrected slices through communication later.
    fn init(&mut self) -> PinnResult<()> {
        let timer = Timer::start();
        self.hooks.on_start();

        for i in 0..self.drivers.len() {
            let driver = self.drivers.get_mut(i).ok_or_else(empty_ring)?;
            driver.init(&self.problem, i == 0)?;
        }
        if self.problem.time_dependent() && self.drivers.len() > 1 {
            let snapshot = self
                .drivers
                .get(0)
                .ok_or_else(empty_ring)?
                .icbase_snapshot()?;
            for i in 1..self.drivers.len() {
                self.drivers
                    .get_mut(i)
                    .ok_or_else(empty_ring)?
                    .load_icbase(&snapshot)?;
            }
        }

        if self.problem.time_dependent() {
            for i in 0..self.drivers.len() {
                let window = self.window_for(i * self.plan.step, (i + 1) * self.plan.step)?;
                self.drivers
                    .get_mut(i)
                    .ok_or_else(empty_ring)?
                    .set_th(window);
            }
        } else {
            for i in 0..self.drivers.len() {
                let window = self.plan.th.clone();
                self.drivers
                    .get_mut(i)
                    .ok_or_else(empty_ring)?
                    .set_th(window);
            }
        }

        self.metrics.record(TrainOp::Init, timer.elapsed());
        self.hooks.after_init();
        info!(
            drivers = self.drivers.len(),
            total_steps = self.plan.total_steps(),
            "engine initialized"
        );
        Ok(())
    }

    /// The window covering problem steps `[a, b)`.
    ///
    /// Interior bounds are derived from the step index, so adjacent windows
    /// share their boundary bit for bit; the final window's endpoint is
    /// pinned to the run's, which the terminus check compares exactly.
    fn window_for(&self, a: usize, b: usize) -> PinnResult<TimeHorizon> {
        let th = &self.plan.th;
        let stepsize = th.stepsize().ok_or_else(|| PinnTrainingError::Config {
            message: "window arithmetic needs a planned step size".into(),
        })?;
        let run_end = th.tfinal().ok_or_else(|| PinnTrainingError::Config {
            message: "window arithmetic needs a bounded horizon".into(),
        })?;
        let total = self.plan.total_steps();

        let start = th.tinit() + stepsize * a as f64;
        let end = if b >= total {
            run_end
        } else {
            th.tinit() + stepsize * b as f64
        };
        let mut window = TimeHorizon::between(start, end);
        if b > a {
            window.init_via_nstep(b - a);
        }
        Ok(window)
    }

    /// Moves the oldest window past every window in the ring, re-derives it
    /// over the steps that remain, and rotates the ring.
    fn increment(&mut self, ti: usize) -> PinnResult<()> {
        let total = self.plan.total_steps();
        let in_flight: usize = self
            .drivers
            .iter()
            .filter_map(|d| d.th().and_then(TimeHorizon::nstep))
            .sum();
        let start = ti + in_flight;
        let nout = self.plan.step.min(total.saturating_sub(start));

        let window = self.window_for(start, start + nout)?;
        debug!(
            tinit = window.tinit(),
            tfinal = ?window.tfinal(),
            "oldest window leapfrogged"
        );
        self.drivers
            .front_mut()
            .ok_or_else(empty_ring)?
            .set_th(window);
        self.drivers.rotate();
        Ok(())
    }
}

fn empty_ring() -> PinnTrainingError {
    PinnTrainingError::Config {
        message: "driver ring is empty".into(),
    }
}

/// Result of a completed (or stopped) run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunReport {
    /// Strides marched.
    pub strides: usize,

    /// Problem steps completed.
    pub steps: usize,

    /// Buffer epochs crossed during training; zero when metrics are
    /// disabled.
    pub epochs: u64,

    /// Final time reached, `None` for a time-independent run.
    pub final_time: Option<f64>,
}

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```
/// use pinn_stride_trainer_rs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Batch, Grading, Hooks, NullHooks, Phase, PinnResult, PinnTrainingError, Problem,
        RunConfig, RunReport, StopFlag, Strategies, StrideEngine, Surrogate, TimeHorizon,
        TrainStepResult,
    };
}
