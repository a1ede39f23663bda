//! Phase descriptors and the training iteration loop.
//!
//! A [`Phase`] names a slice of the problem to train (which constraints, at
//! what temporal resolution, under which strategies) and owns the runtime
//! buffers while a stride is in flight. A driver walks its phases in order
//! every stride: coarse warmup phases first, the full-resolution phase last.
//!
//! The phase's step size is `step_multiple` times the problem's, re-derived
//! against the stride window at arming time, so a warmup phase can march
//! the same window in fewer, larger steps. The final phase of a driver is
//! always forced back to the problem resolution, because its terminal state
//! becomes the next stride's initial condition.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::batch::{Batch, ConstraintBatch, IcBatch};
use crate::config::{RunConfig, DRYRUN_BATCHSIZE, DRYRUN_MAX_ITERATIONS, DRYRUN_SPL};
use crate::constraint::PhaseSampling;
use crate::error::{PinnResult, PinnTrainingError};
use crate::hooks::{Hooks, StopFlag};
use crate::horizon::TimeHorizon;
use crate::icbase::{IcBase, IcBuffer};
use crate::metrics::{RunMetrics, TrainOp};
use crate::moments::MomentSets;
use crate::problem::Problem;
use crate::sampler::SampleMode;
use crate::samplesets::SampleSets;
use crate::strategy::{Kit, Strategies, StrategyKind};
use crate::timing::Timer;
use crate::Surrogate;

/// Slack below the problem step size a phase step may not fall under.
const STEPSIZE_GUARD: f64 = 1e-10;

/// Run-level fallbacks for the knobs a phase leaves unset.
#[derive(Debug, Clone, Copy)]
pub struct PhaseDefaults {
    /// Samples per unit length.
    pub spl: f64,
    /// Batch size.
    pub batchsize: usize,
    /// Temporal shelf fraction.
    pub shelf: f64,
    /// Samples per step division for temporal columns and moments.
    pub spd: Option<f64>,
    /// Seed for the phase's sample streams.
    pub seed: u64,
}

impl PhaseDefaults {
    /// Extracts the fallbacks from a run configuration and a resolved step
    /// division.
    #[must_use]
    pub fn from_config(config: &RunConfig, spd: Option<f64>) -> Self {
        Self {
            spl: config.spl,
            batchsize: config.batchsize,
            shelf: config.shelf,
            spd,
            seed: config.seed,
        }
    }
}

impl Default for PhaseDefaults {
    fn default() -> Self {
        Self::from_config(&RunConfig::default(), None)
    }
}

/// One training phase: configuration plus, while a stride is in flight, the
/// armed sample buffers and moment lattices.
///
/// Construction is builder-style; unset knobs fall back to the run's
/// [`PhaseDefaults`]. Cloning copies the configuration only, runtime
/// buffers never travel.
pub struct Phase {
    label: String,
    step_multiple: usize,
    batchsize: Option<usize>,
    spl: Option<f64>,
    shelf: Option<f64>,
    max_iterations: usize,
    tolerance: f64,
    mode: SampleMode,
    constraints: Vec<String>,
    constraints_skip: Vec<String>,
    strategies: Strategies,
    active: HashMap<String, bool>,
    samplesets: Option<SampleSets>,
    momentsets: MomentSets,
    th: Option<TimeHorizon>,
}

impl Clone for Phase {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            step_multiple: self.step_multiple,
            batchsize: self.batchsize,
            spl: self.spl,
            shelf: self.shelf,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            mode: self.mode,
            constraints: self.constraints.clone(),
            constraints_skip: self.constraints_skip.clone(),
            strategies: self.strategies.clone(),
            active: HashMap::new(),
            samplesets: None,
            momentsets: MomentSets::new(),
            th: None,
        }
    }
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("label", &self.label)
            .field("step_multiple", &self.step_multiple)
            .field("max_iterations", &self.max_iterations)
            .field("tolerance", &self.tolerance)
            .field("strategies", &self.strategies)
            .field("armed", &self.th.is_some())
            .finish()
    }
}

impl Phase {
    /// Creates a phase with default knobs: problem resolution, every
    /// constraint active, no strategies.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        let kit = Kit::default();
        Self {
            label: label.into(),
            step_multiple: 1,
            batchsize: None,
            spl: None,
            shelf: None,
            max_iterations: kit.max_iterations,
            tolerance: kit.tolerance,
            mode: SampleMode::default(),
            constraints: Vec::new(),
            constraints_skip: Vec::new(),
            strategies: Strategies::new(),
            active: HashMap::new(),
            samplesets: None,
            momentsets: MomentSets::new(),
            th: None,
        }
    }

    /// Sets the step size multiple relative to the problem resolution.
    #[must_use]
    pub fn with_step_multiple(mut self, step_multiple: usize) -> Self {
        self.step_multiple = step_multiple;
        self
    }

    /// Sets the phase's batch size.
    #[must_use]
    pub fn with_batchsize(mut self, batchsize: usize) -> Self {
        self.batchsize = Some(batchsize);
        self
    }

    /// Sets the phase's samples per unit length.
    #[must_use]
    pub fn with_spl(mut self, spl: f64) -> Self {
        self.spl = Some(spl);
        self
    }

    /// Sets the phase's temporal shelf fraction.
    #[must_use]
    pub fn with_shelf(mut self, shelf: f64) -> Self {
        self.shelf = Some(shelf);
        self
    }

    /// Sets the training iteration ceiling per session.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the convergence tolerance per session.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Sets the sampling mode for the phase's buffers.
    #[must_use]
    pub fn with_mode(mut self, mode: SampleMode) -> Self {
        self.mode = mode;
        self
    }

    /// Restricts the phase to the listed constraints; everything not listed
    /// goes inactive.
    #[must_use]
    pub fn with_constraints<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constraints = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Deactivates the listed constraints, keeping the rest.
    #[must_use]
    pub fn with_constraints_skip<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constraints_skip = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Attaches the phase's strategies.
    #[must_use]
    pub fn with_strategies(mut self, strategies: Strategies) -> Self {
        self.strategies = strategies;
        self
    }

    /// The phase's label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The phase's step size multiple.
    #[must_use]
    pub fn step_multiple(&self) -> usize {
        self.step_multiple
    }

    pub(crate) fn set_step_multiple(&mut self, step_multiple: usize) {
        self.step_multiple = step_multiple;
    }

    /// The phase's strategies.
    #[must_use]
    pub fn strategies(&self) -> &Strategies {
        &self.strategies
    }

    /// The phase's explicit samples per unit length, if set.
    #[must_use]
    pub fn spl(&self) -> Option<f64> {
        self.spl
    }

    /// The phase's working horizon while armed.
    #[must_use]
    pub fn th(&self) -> Option<&TimeHorizon> {
        self.th.as_ref()
    }

    /// The phase's armed sample buffers.
    #[must_use]
    pub fn samplesets(&self) -> Option<&SampleSets> {
        self.samplesets.as_ref()
    }

    /// The phase's moment lattices.
    #[must_use]
    pub fn momentsets(&self) -> &MomentSets {
        &self.momentsets
    }

    /// Which constraints this phase trains, by label.
    #[must_use]
    pub fn active(&self) -> &HashMap<String, bool> {
        &self.active
    }

    /// Completed epochs of the armed buffers.
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.samplesets.as_ref().map_or(0, SampleSets::epoch)
    }

    /// Steps this phase takes across the current stride window.
    #[must_use]
    pub fn steps_in_stride(&self) -> usize {
        self.th
            .as_ref()
            .and_then(TimeHorizon::nstep)
            .map_or(1, |n| n.max(1))
    }

    /// The iteration budget in force at the given level.
    ///
    /// A graded phase with a kit for the level uses that kit; otherwise the
    /// phase's own ceiling and tolerance apply.
    #[must_use]
    pub fn session_kit(&self, level: u32) -> Kit {
        self.strategies
            .grading()
            .and_then(|g| g.kit(level))
            .unwrap_or(Kit {
                max_iterations: self.max_iterations,
                tolerance: self.tolerance,
            })
    }

    /// Forces the dry-run knobs: single-multiple steps, thin sampling, two
    /// iterations per session.
    pub(crate) fn coerce_dryrun(&mut self) {
        self.step_multiple = 1;
        self.spl = Some(DRYRUN_SPL);
        self.batchsize = Some(DRYRUN_BATCHSIZE);
        self.max_iterations = DRYRUN_MAX_ITERATIONS;
    }

    /// Resolves the active-constraint map and builds buffer shells.
    ///
    /// Called once per driver lifetime, before any stride.
    ///
    /// # Errors
    ///
    /// Fails when a listed constraint label is unknown to the problem.
    pub fn init(&mut self, problem: &Problem, seed: u64) -> PinnResult<()> {
        for name in self.constraints.iter().chain(self.constraints_skip.iter()) {
            if problem.constraint(name).is_none() {
                return Err(PinnTrainingError::Config {
                    message: format!(
                        "phase {:?} references unknown constraint {name:?}",
                        self.label
                    ),
                });
            }
        }
        let default_active = self.constraints.is_empty();
        self.active.clear();
        for constraint in problem.constraints() {
            let label = constraint.label();
            let listed = self.constraints.iter().any(|n| n == label);
            let skipped = self.constraints_skip.iter().any(|n| n == label);
            let on = !skipped && (listed || default_active);
            self.active.insert(label.to_string(), on);
        }
        self.samplesets = Some(SampleSets::new(problem, seed));
        Ok(())
    }

    /// Arms the phase against a stride window.
    ///
    /// The working horizon is a copy of the stride's, re-derived at the
    /// phase's step size (`step_multiple` times the problem's). Buffers and
    /// lattices are filled from the problem's sources and the driver's
    /// pristine base.
    ///
    /// # Errors
    ///
    /// Fails when the phase step size falls below the problem's, when
    /// grading is active without a power-of-two step count (or without time
    /// dependence), or when any buffer fails to build.
    pub fn init_phase(
        &mut self,
        problem: &Problem,
        stride_th: &TimeHorizon,
        pristine: Option<&IcBase>,
        defaults: &PhaseDefaults,
    ) -> PinnResult<()> {
        let mut th = stride_th.clone();
        if let Some(problem_step) = problem.th().stepsize() {
            let stepsize = problem_step * self.step_multiple as f64;
            if stepsize < problem_step - STEPSIZE_GUARD {
                return Err(PinnTrainingError::Config {
                    message: format!(
                        "phase {:?}: step size {stepsize} is below the problem step size {problem_step}",
                        self.label
                    ),
                });
            }
            th.init_via_stepsize(stepsize);
        }

        let grading = self.strategies.is_active(StrategyKind::Grading);
        if grading {
            if !problem.time_dependent() {
                return Err(PinnTrainingError::Config {
                    message: format!(
                        "phase {:?}: grading requires a time-dependent problem",
                        self.label
                    ),
                });
            }
            if let Some(nstep) = th.nstep() {
                if !nstep.is_power_of_two() {
                    return Err(PinnTrainingError::GradedSizeNotPow2 {
                        label: self.label.clone(),
                        what: "steps per stride",
                        value: nstep,
                    });
                }
            }
        }

        let params = PhaseSampling {
            spl: self.spl.unwrap_or(defaults.spl),
            batchsize: self.batchsize.unwrap_or(defaults.batchsize),
            spd: defaults.spd,
            shelf: self.shelf.unwrap_or(defaults.shelf),
            grading,
            mode: self.mode,
            th: problem.time_dependent().then(|| th.clone()),
            seed: defaults.seed,
        };
        let sets = self
            .samplesets
            .as_mut()
            .ok_or_else(|| uninitialized(&self.label))?;
        sets.init_phase(problem, &self.active, pristine, &params)?;
        self.momentsets.init_phase(problem, &th, defaults.spd)?;
        self.th = Some(th);
        debug!(phase = %self.label, steps = self.steps_in_stride(), "phase armed");
        Ok(())
    }

    /// Drops the phase's buffer contents at the end of a stride.
    pub fn deinit(&mut self) {
        if let Some(sets) = self.samplesets.as_mut() {
            sets.deinit();
        }
        self.momentsets.deinit();
        self.th = None;
    }

    /// Expands every active buffer by one level.
    ///
    /// # Errors
    ///
    /// Fails past a structural or hard level ceiling, or unarmed.
    pub fn expand(&mut self) -> PinnResult<()> {
        self.samplesets_mut()?.expand_all()
    }

    /// Contracts every active buffer by one level.
    ///
    /// # Errors
    ///
    /// Fails at level zero, or unarmed.
    pub fn contract(&mut self) -> PinnResult<()> {
        self.samplesets_mut()?.contract_all()
    }

    /// Runs one training session at the given level.
    ///
    /// Iterates batch assembly and surrogate steps until the session's kit
    /// tolerance is reached, its iteration budget runs out, or the stop
    /// flag is observed, in that order of precedence. Epoch boundaries are
    /// counted between iterations; moment lattices update before the first
    /// iteration and after every completed one.
    ///
    /// Returns whether the session converged below its tolerance.
    ///
    /// # Errors
    ///
    /// Fails when batch assembly or the surrogate's step fails.
    pub fn train<M: Surrogate>(
        &mut self,
        level: u32,
        problem: &Problem,
        surrogate: &Arc<Mutex<M>>,
        hooks: &mut dyn Hooks,
        stop: &StopFlag,
        metrics: &mut RunMetrics,
    ) -> PinnResult<bool> {
        let kit = self.session_kit(level);
        if kit.max_iterations == 0 {
            warn!(phase = %self.label, level, "session has a zero iteration budget, skipping");
            return Ok(false);
        }
        let dt = self.th.as_ref().and_then(TimeHorizon::stepsize).unwrap_or(0.0);
        debug!(
            phase = %self.label,
            level,
            max_iterations = kit.max_iterations,
            tolerance = kit.tolerance,
            "training session"
        );
        self.momentsets.update(0, problem)?;
        let mut iteration = 0usize;
        let mut passed = false;
        loop {
            hooks.on_iter(iteration);
            let timer = Timer::start();
            let batch = self.assemble(problem, dt, level, iteration, kit.max_iterations)?;
            metrics.record(TrainOp::Batch, timer.elapsed());
            metrics.record_batch();
            hooks.after_batch(&batch);

            let result = surrogate.lock().train_step(batch)?;
            metrics.record_iteration();
            hooks.after_iter(iteration, result.loss);

            if result.loss <= kit.tolerance {
                hooks.on_tolerance_break(iteration, result.loss);
                debug!(phase = %self.label, level, iteration, loss = result.loss, "converged");
                passed = true;
                break;
            }
            if iteration + 1 == kit.max_iterations {
                hooks.on_maxiter_break(iteration);
                break;
            }
            if stop.is_set() {
                hooks.on_stop_break(iteration);
                break;
            }

            if let Some(sets) = self.samplesets.as_mut() {
                if sets.end_of_epoch() {
                    metrics.record_epoch();
                    hooks.on_end_of_epoch(sets.epoch());
                }
            }
            iteration += 1;
            self.momentsets.update(iteration, problem)?;
        }
        Ok(passed)
    }

    /// Advances the phase's buffers and lattices by one of its steps.
    ///
    /// The next slice's targets come from the surrogate's own prediction at
    /// the advanced points. A phase without time dependence advances
    /// nothing.
    ///
    /// # Errors
    ///
    /// Fails when a buffer rejects the advance.
    pub fn advance<M: Surrogate>(
        &mut self,
        surrogate: &Arc<Mutex<M>>,
    ) -> PinnResult<()> {
        let Some(dt) = self.th.as_ref().and_then(TimeHorizon::stepsize) else {
            return Ok(());
        };
        let sets = self
            .samplesets
            .as_mut()
            .ok_or_else(|| uninitialized(&self.label))?;
        let model = Arc::clone(surrogate);
        sets.advance(dt, move |points| model.lock().evaluate(points))?;
        self.momentsets.advance(dt);
        Ok(())
    }

    /// Copies the working initial-condition slice out of the buffers.
    ///
    /// # Errors
    ///
    /// Fails for a time-independent phase or before arming.
    pub fn ic_snapshot(&self) -> PinnResult<IcBuffer> {
        let sets = self
            .samplesets
            .as_ref()
            .ok_or_else(|| uninitialized(&self.label))?;
        let icbase = sets.icbase().ok_or_else(|| PinnTrainingError::Config {
            message: format!("phase {:?} has no initial-condition base", self.label),
        })?;
        icbase.snapshot()
    }

    fn samplesets_mut(&mut self) -> PinnResult<&mut SampleSets> {
        self.samplesets
            .as_mut()
            .ok_or_else(|| uninitialized(&self.label))
    }

    /// Assembles one owned batch: the IC slice first, then every active
    /// constraint in the problem's declaration order.
    fn assemble(
        &mut self,
        problem: &Problem,
        dt: f64,
        level: u32,
        iteration: usize,
        max_iterations: usize,
    ) -> PinnResult<Batch> {
        let weighting = self.strategies.is_active(StrategyKind::Weighting);
        let time_dependent = problem.time_dependent();
        let sets = self
            .samplesets
            .as_mut()
            .ok_or_else(|| uninitialized(&self.label))?;
        let ic = sets
            .ic_batch()?
            .map(|(inputs, targets)| IcBatch { inputs, targets });
        let mut constraints = Vec::new();
        for (label, inputs, reference) in sets.constraint_batches()? {
            let weights = if weighting && time_dependent && inputs.ncols() > 0 {
                let t = inputs.column(inputs.ncols() - 1).to_owned();
                self.strategies.weighting().map(|w| w.weights(&t))
            } else {
                None
            };
            constraints.push(ConstraintBatch {
                label,
                inputs,
                reference,
                weights,
            });
        }
        Ok(Batch {
            ic,
            constraints,
            dt,
            level,
            iteration,
            max_iterations,
        })
    }
}

fn uninitialized(label: &str) -> PinnTrainingError {
    PinnTrainingError::Uninitialized {
        label: label.to_string(),
        what: "phase",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::TrainStepResult;
    use crate::hooks::NullHooks;
    use crate::problem::{Constraint, ProblemIc};
    use crate::sampler::IntervalSource;
    use crate::strategy::Grading;
    use ndarray::Array2;

    struct FlatLoss {
        loss: f64,
        calls: usize,
    }

    impl FlatLoss {
        fn new(loss: f64) -> Self {
            Self { loss, calls: 0 }
        }
    }

    impl Surrogate for FlatLoss {
        fn evaluate(&mut self, points: &Array2<f64>) -> Array2<f64> {
            Array2::zeros((points.nrows(), 1))
        }

        fn train_step(&mut self, _batch: Batch) -> PinnResult<TrainStepResult> {
            self.calls += 1;
            Ok(TrainStepResult { loss: self.loss })
        }
    }

    fn heat_problem() -> Problem {
        let th = TimeHorizon::with_extent(0.0, 0.5).with_stepsize(0.125);
        Problem::new(vec!["u".to_string()], 1, th)
            .with_constraint(Constraint::new(
                "interior",
                Some(Box::new(IntervalSource::new(
                    0.0,
                    1.0,
                    SampleMode::Pseudo,
                    11,
                ))),
            ))
            .with_constraint(Constraint::new(
                "bc_left",
                Some(Box::new(IntervalSource::new(
                    0.0,
                    0.0,
                    SampleMode::Pseudo,
                    13,
                ))),
            ))
            .with_ic(ProblemIc::new(
                Box::new(IntervalSource::new(0.0, 1.0, SampleMode::Pseudo, 17)),
                Box::new(|points: &Array2<f64>| points.mapv(f64::sin)),
            ))
    }

    fn stride_th() -> TimeHorizon {
        let mut th = TimeHorizon::with_extent(0.0, 0.5).with_stepsize(0.125);
        th.init(0.5);
        th
    }

    fn armed_phase(phase: Phase, problem: &Problem) -> (Phase, IcBase) {
        let mut phase = phase;
        phase.init(problem, 3).unwrap();
        let pristine = IcBase::sample(problem, 32.0, 3).unwrap();
        let defaults = PhaseDefaults {
            batchsize: 16,
            ..PhaseDefaults::default()
        };
        phase
            .init_phase(problem, &stride_th(), Some(&pristine), &defaults)
            .unwrap();
        (phase, pristine)
    }

    #[test]
    fn active_map_defaults_to_everything() {
        let problem = heat_problem();
        let mut phase = Phase::new("sweep");
        phase.init(&problem, 1).unwrap();
        assert!(phase.active()["interior"]);
        assert!(phase.active()["bc_left"]);
    }

    #[test]
    fn listing_constraints_deactivates_the_rest() {
        let problem = heat_problem();
        let mut phase = Phase::new("ic_only").with_constraints(["bc_left"]);
        phase.init(&problem, 1).unwrap();
        assert!(!phase.active()["interior"]);
        assert!(phase.active()["bc_left"]);
    }

    #[test]
    fn skip_list_wins_over_default() {
        let problem = heat_problem();
        let mut phase = Phase::new("no_bc").with_constraints_skip(["bc_left"]);
        phase.init(&problem, 1).unwrap();
        assert!(phase.active()["interior"]);
        assert!(!phase.active()["bc_left"]);
    }

    #[test]
    fn unknown_constraint_label_is_rejected() {
        let problem = heat_problem();
        let mut phase = Phase::new("typo").with_constraints(["interor"]);
        assert!(phase.init(&problem, 1).is_err());
    }

    #[test]
    fn step_multiple_rederives_the_horizon() {
        let problem = heat_problem();
        let phase = Phase::new("coarse").with_step_multiple(2);
        let (phase, _pristine) = armed_phase(phase, &problem);
        // The stride has 4 problem steps; at twice the step size it has 2.
        assert_eq!(phase.steps_in_stride(), 2);
        assert_eq!(phase.th().unwrap().stepsize(), Some(0.25));
    }

    #[test]
    fn grading_requires_pow2_steps() {
        let problem = heat_problem();
        let mut phase = Phase::new("graded")
            .with_strategies(Strategies::new().with_grading(Grading::logarithmic()));
        phase.init(&problem, 1).unwrap();
        let pristine = IcBase::sample(&problem, 32.0, 3).unwrap();
        // A 3-step window is not a power of two.
        let mut th = TimeHorizon::with_extent(0.0, 0.375).with_stepsize(0.125);
        th.init(0.375);
        let err = phase
            .init_phase(&problem, &th, Some(&pristine), &PhaseDefaults::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PinnTrainingError::GradedSizeNotPow2 { value: 3, .. }
        ));
    }

    #[test]
    fn maxiter_break_consumes_the_budget() {
        let problem = heat_problem();
        let phase = Phase::new("sweep").with_max_iterations(3);
        let (mut phase, _pristine) = armed_phase(phase, &problem);
        let surrogate = Arc::new(Mutex::new(FlatLoss::new(1.0)));
        let mut metrics = RunMetrics::new(true);
        let passed = phase
            .train(
                0,
                &problem,
                &surrogate,
                &mut NullHooks,
                &StopFlag::new(),
                &mut metrics,
            )
            .unwrap();
        assert!(!passed);
        assert_eq!(surrogate.lock().calls, 3);
        assert_eq!(metrics.counters().iterations, 3);
        assert_eq!(metrics.counters().batches, 3);
    }

    #[test]
    fn tolerance_break_reports_convergence() {
        let problem = heat_problem();
        let phase = Phase::new("sweep").with_max_iterations(50).with_tolerance(1e-3);
        let (mut phase, _pristine) = armed_phase(phase, &problem);
        let surrogate = Arc::new(Mutex::new(FlatLoss::new(1e-4)));
        let mut metrics = RunMetrics::disabled();
        let passed = phase
            .train(
                0,
                &problem,
                &surrogate,
                &mut NullHooks,
                &StopFlag::new(),
                &mut metrics,
            )
            .unwrap();
        assert!(passed);
        assert_eq!(surrogate.lock().calls, 1);
    }

    #[test]
    fn stop_flag_breaks_after_one_iteration() {
        let problem = heat_problem();
        let phase = Phase::new("sweep").with_max_iterations(1000);
        let (mut phase, _pristine) = armed_phase(phase, &problem);
        let surrogate = Arc::new(Mutex::new(FlatLoss::new(1.0)));
        let stop = StopFlag::new();
        stop.set();
        let mut metrics = RunMetrics::disabled();
        let passed = phase
            .train(0, &problem, &surrogate, &mut NullHooks, &stop, &mut metrics)
            .unwrap();
        assert!(!passed);
        assert_eq!(surrogate.lock().calls, 1);
    }

    #[test]
    fn per_level_kits_override_the_budget() {
        let problem = heat_problem();
        let phase = Phase::new("graded")
            .with_max_iterations(100)
            .with_strategies(Strategies::new().with_grading(
                Grading::logarithmic().with_kits(vec![Kit::new(5, 1e-12), Kit::new(2, 1e-12)]),
            ));
        let (mut phase, _pristine) = armed_phase(phase, &problem);
        assert_eq!(phase.session_kit(0).max_iterations, 5);
        assert_eq!(phase.session_kit(1).max_iterations, 2);
        // Past the kit list, the phase's own budget applies.
        assert_eq!(phase.session_kit(2).max_iterations, 100);

        phase.expand().unwrap();
        let surrogate = Arc::new(Mutex::new(FlatLoss::new(1.0)));
        let mut metrics = RunMetrics::disabled();
        phase
            .train(
                1,
                &problem,
                &surrogate,
                &mut NullHooks,
                &StopFlag::new(),
                &mut metrics,
            )
            .unwrap();
        assert_eq!(surrogate.lock().calls, 2);
        phase.contract().unwrap();
    }

    #[test]
    fn batches_carry_ic_first_then_active_constraints() {
        struct CaptureFirst {
            batch: Option<Batch>,
        }

        impl Hooks for CaptureFirst {
            fn after_batch(&mut self, batch: &Batch) {
                if self.batch.is_none() {
                    self.batch = Some(batch.clone());
                }
            }
        }

        let problem = heat_problem();
        let phase = Phase::new("sweep").with_max_iterations(1);
        let (mut phase, _pristine) = armed_phase(phase, &problem);
        let surrogate = Arc::new(Mutex::new(FlatLoss::new(1.0)));
        let mut hooks = CaptureFirst { batch: None };
        let mut metrics = RunMetrics::disabled();
        phase
            .train(
                0,
                &problem,
                &surrogate,
                &mut hooks,
                &StopFlag::new(),
                &mut metrics,
            )
            .unwrap();
        let batch = hooks.batch.unwrap();
        assert!(batch.ic.is_some());
        let labels: Vec<&str> = batch.constraints.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["interior", "bc_left"]);
        assert!((batch.dt - 0.125).abs() < 1e-15);
        assert_eq!(batch.level, 0);
        // Inputs carry the trailing time column.
        let ic = batch.ic.as_ref().unwrap();
        assert_eq!(ic.inputs.ncols(), 2);
    }

    #[test]
    fn advance_walks_the_ic_time() {
        let problem = heat_problem();
        let phase = Phase::new("sweep");
        let (mut phase, _pristine) = armed_phase(phase, &problem);
        let surrogate = Arc::new(Mutex::new(FlatLoss::new(1.0)));
        let before = phase.samplesets().unwrap().icbase().unwrap().t().unwrap();
        phase.advance(&surrogate).unwrap();
        let after = phase.samplesets().unwrap().icbase().unwrap().t().unwrap();
        assert!((after - before - 0.125).abs() < 1e-12);
    }

    #[test]
    fn snapshot_then_deinit_preserves_the_handoff() {
        let problem = heat_problem();
        let phase = Phase::new("sweep");
        let (mut phase, _pristine) = armed_phase(phase, &problem);
        let snapshot = phase.ic_snapshot().unwrap();
        assert!(!snapshot.is_empty());
        phase.deinit();
        assert!(phase.th().is_none());
        assert_eq!(snapshot.t, 0.0);
    }
}
