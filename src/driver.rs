//! The per-stride state machine.
//!
//! A [`Driver`] owns an ordered list of phases and marches them across one
//! stride window at a time. Its critical section arms each phase, walks the
//! phase's steps (expanding and contracting the buffers as the grading
//! schedule dictates, training once at every level visited), advances the
//! buffers to the next step, and finally snapshots the terminal
//! initial-condition slice into a hand-off buffer for whoever trains the
//! next window.
//!
//! The level counter lives here, not in the buffers: every expand raises it,
//! every contract lowers it, and a completed step always leaves it at zero.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{PinnResult, PinnTrainingError};
use crate::hooks::{Hooks, StopFlag};
use crate::horizon::TimeHorizon;
use crate::icbase::{IcBase, IcBuffer};
use crate::metrics::{RunMetrics, TrainOp};
use crate::phases::{Phase, PhaseDefaults};
use crate::problem::Problem;
use crate::timing::Timer;
use crate::Surrogate;

/// Marches a set of phases across stride windows.
pub struct Driver {
    phases: Vec<Phase>,
    defaults: PhaseDefaults,
    th: Option<TimeHorizon>,
    icbase: Option<IcBase>,
    handoff: Option<IcBuffer>,
    level: u32,
}

impl Driver {
    /// Creates a driver over the given phases, in training order.
    #[must_use]
    pub fn new(phases: Vec<Phase>, defaults: PhaseDefaults) -> Self {
        Self {
            phases,
            defaults,
            th: None,
            icbase: None,
            handoff: None,
            level: 0,
        }
    }

    /// Prepares the driver for its first stride.
    ///
    /// The final phase is forced to the problem's step resolution, because
    /// its terminal state seeds the next stride. Only the first driver of a
    /// run samples the initial condition; later drivers start empty and
    /// receive their slice through communication.
    ///
    /// # Errors
    ///
    /// Fails without phases, on a phase naming an unknown constraint, or
    /// when the initial-condition sample fails.
    pub fn init(&mut self, problem: &Problem, first: bool) -> PinnResult<()> {
        if self.phases.is_empty() {
            return Err(PinnTrainingError::Config {
                message: "a driver needs at least one phase".into(),
            });
        }
        if let Some(last) = self.phases.last_mut() {
            if last.step_multiple() != 1 {
                debug!(
                    phase = last.label(),
                    "forcing the final phase to the problem step resolution"
                );
                last.set_step_multiple(1);
            }
        }
        for (i, phase) in self.phases.iter_mut().enumerate() {
            phase.init(problem, self.defaults.seed.wrapping_add(i as u64))?;
        }
        if problem.time_dependent() {
            self.icbase = Some(if first {
                let spl = self
                    .phases
                    .last()
                    .and_then(Phase::spl)
                    .unwrap_or(self.defaults.spl);
                IcBase::sample(problem, spl, self.defaults.seed)?
            } else {
                IcBase::new(self.defaults.seed)
            });
        }
        Ok(())
    }

    /// Assigns the driver's stride window.
    pub fn set_th(&mut self, th: TimeHorizon) {
        self.th = Some(th);
    }

    /// The driver's stride window.
    #[must_use]
    pub fn th(&self) -> Option<&TimeHorizon> {
        self.th.as_ref()
    }

    /// Mutable access to the stride window, for shifting between strides.
    pub fn th_mut(&mut self) -> Option<&mut TimeHorizon> {
        self.th.as_mut()
    }

    /// Steps this driver's stride contributes to the run.
    #[must_use]
    pub fn nstep(&self) -> usize {
        self.th
            .as_ref()
            .and_then(TimeHorizon::nstep)
            .map_or(1, |n| n.max(1))
    }

    /// Current expansion level; zero between steps.
    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    /// The driver's phases, in training order.
    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// The terminal slice of the last completed stride.
    #[must_use]
    pub fn handoff(&self) -> Option<&IcBuffer> {
        self.handoff.as_ref()
    }

    /// Loads a hand-off slice into the driver's pristine base.
    ///
    /// # Errors
    ///
    /// Fails for a time-independent driver, which has no base to load.
    pub fn load_icbase(&mut self, buffer: &IcBuffer) -> PinnResult<()> {
        let base = self.icbase.as_mut().ok_or_else(|| PinnTrainingError::Config {
            message: "cannot load an initial-condition slice without time dependence".into(),
        })?;
        base.load(buffer);
        Ok(())
    }

    /// Copies the driver's pristine base, for seeding other drivers.
    ///
    /// # Errors
    ///
    /// Fails when the base is absent or empty.
    pub fn icbase_snapshot(&self) -> PinnResult<IcBuffer> {
        self.icbase
            .as_ref()
            .ok_or_else(|| PinnTrainingError::Config {
                message: "driver has no initial-condition base to copy".into(),
            })?
            .snapshot()
    }

    /// Whether this driver's window ends exactly at the target's end.
    ///
    /// A driver over a target with no step discretization is terminus after
    /// its single stride.
    #[must_use]
    pub fn terminus_check(&self, target: &TimeHorizon) -> bool {
        if target.stepsize().is_none() {
            return true;
        }
        match (
            self.th.as_ref().and_then(TimeHorizon::tfinal),
            target.tfinal(),
        ) {
            // Exact comparison: the terminal window's endpoint is pinned to
            // the run's, bit for bit, when the window is assigned.
            #[allow(clippy::float_cmp)]
            (Some(mine), Some(end)) => mine == end,
            _ => false,
        }
    }

    /// Trains every phase across the current stride window.
    ///
    /// Per phase: arm, then for each step run the grading schedule
    /// (`n` expand/train pairs followed by `n` contract/train pairs, or a
    /// single level-0 session when `n` is zero), then advance the buffers
    /// one step. Non-final phases disarm as soon as they finish; the final
    /// phase's terminal slice is snapshotted into the hand-off buffer
    /// before it disarms.
    ///
    /// # Errors
    ///
    /// Fails when arming, training, expanding, contracting, or advancing
    /// fails; buffers may be left mid-stride.
    pub fn critical_section<M: Surrogate>(
        &mut self,
        problem: &Problem,
        surrogate: &Arc<Mutex<M>>,
        hooks: &mut dyn Hooks,
        stop: &StopFlag,
        metrics: &mut RunMetrics,
    ) -> PinnResult<()> {
        let th = self.th.clone().ok_or_else(|| PinnTrainingError::Config {
            message: "driver has no stride window".into(),
        })?;
        info!(
            tinit = th.tinit(),
            tfinal = ?th.tfinal(),
            phases = self.phases.len(),
            "critical section"
        );
        let nphases = self.phases.len();
        for pi in 0..nphases {
            let is_final = pi + 1 == nphases;
            self.level = 0;

            let timer = Timer::start();
            {
                let pristine = self.icbase.as_ref();
                self.phases[pi].init_phase(problem, &th, pristine, &self.defaults)?;
            }
            metrics.record(TrainOp::InitPhase, timer.elapsed());
            hooks.on_phase(self.phases[pi].label());

            let steps = self.phases[pi].steps_in_stride();
            for step in 0..steps {
                hooks.on_step(step);
                metrics.record_step();

                // Grading schedules by the 1-based step within the stride.
                let n = self.phases[pi]
                    .strategies()
                    .grading()
                    .map_or(0, |g| g.nexpand(step + 1, steps));

                if n == 0 {
                    self.train_at(pi, problem, surrogate, hooks, stop, metrics)?;
                } else {
                    for _ in 0..n {
                        let timer = Timer::start();
                        self.phases[pi].expand()?;
                        metrics.record(TrainOp::Expand, timer.elapsed());
                        metrics.record_expansion();
                        self.level += 1;
                        hooks.on_expand(self.level);
                        self.train_at(pi, problem, surrogate, hooks, stop, metrics)?;
                    }
                    for _ in 0..n {
                        let timer = Timer::start();
                        self.phases[pi].contract()?;
                        metrics.record(TrainOp::Contract, timer.elapsed());
                        metrics.record_contraction();
                        self.level -= 1;
                        hooks.on_contract(self.level);
                        self.train_at(pi, problem, surrogate, hooks, stop, metrics)?;
                    }
                }

                let dt = self.phases[pi]
                    .th()
                    .and_then(TimeHorizon::stepsize)
                    .unwrap_or(0.0);
                hooks.on_advance(dt);
                let timer = Timer::start();
                self.phases[pi].advance(surrogate)?;
                metrics.record(TrainOp::Advance, timer.elapsed());
                hooks.after_step(step);
            }

            hooks.after_phase(self.phases[pi].label());
            if !is_final {
                self.phases[pi].deinit();
            }
        }
        self.deinit_stride()
    }

    fn train_at<M: Surrogate>(
        &mut self,
        pi: usize,
        problem: &Problem,
        surrogate: &Arc<Mutex<M>>,
        hooks: &mut dyn Hooks,
        stop: &StopFlag,
        metrics: &mut RunMetrics,
    ) -> PinnResult<bool> {
        hooks.on_train(self.level);
        let timer = Timer::start();
        let passed =
            self.phases[pi].train(self.level, problem, surrogate, hooks, stop, metrics)?;
        metrics.record(TrainOp::Train, timer.elapsed());
        hooks.after_train(self.level, passed);
        Ok(passed)
    }

    /// Snapshots the final phase's terminal slice, then disarms it.
    fn deinit_stride(&mut self) -> PinnResult<()> {
        if self.icbase.is_some() {
            let last = self.phases.last().ok_or_else(|| PinnTrainingError::Config {
                message: "a driver needs at least one phase".into(),
            })?;
            self.handoff = Some(last.ic_snapshot()?);
        }
        if let Some(last) = self.phases.last_mut() {
            last.deinit();
        }
        debug!(handoff_t = ?self.handoff.as_ref().map(|b| b.t), "stride wound down");
        Ok(())
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("phases", &self.phases.len())
            .field("th", &self.th)
            .field("level", &self.level)
            .field("handoff", &self.handoff.is_some())
            .finish()
    }
}
