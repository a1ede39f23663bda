//! Per-constraint sample sets, one cylinder each.
//!
//! A [`ConstraintSampleSet`] turns one constraint of the problem into a
//! batch server for one phase. At phase entry it samples the constraint's
//! spatial base at the phase's density, derives the temporal sample count
//! from the step size, and builds a [`Cylinder`] over the two. Everything
//! after that is a thin pass-through to the cylinder.

use ndarray::Array2;
use tracing::{debug, warn};

use crate::cylinder::{Cylinder, CylinderSetup};
use crate::error::{PinnResult, PinnTrainingError};
use crate::horizon::TimeHorizon;
use crate::problem::Constraint;
use crate::sampler::SampleMode;

/// Sampling parameters shared by every sample set of one phase.
#[derive(Debug, Clone)]
pub struct PhaseSampling {
    /// Samples per unit length, along each spatial axis and along time.
    pub spl: f64,
    /// Batch size served to training.
    pub batchsize: usize,
    /// Optional regular spacing of temporal samples. When set it overrides
    /// the density-derived temporal count and forces a regular partition,
    /// so that moment extraction finds samples exactly on its lattice.
    pub spd: Option<f64>,
    /// Extent of the sampled window past the end of the step.
    pub shelf: f64,
    /// Whether a grading policy will expand and contract the buffers.
    pub grading: bool,
    /// Sampling mode for temporal values when `spd` is unset.
    pub mode: SampleMode,
    /// The phase's time horizon, `None` for a time-independent problem.
    pub th: Option<TimeHorizon>,
    /// Seed for the phase's sample streams.
    pub seed: u64,
}

/// Batch server for one constraint during one phase.
pub struct ConstraintSampleSet {
    label: String,
    time_dependent: bool,
    spatial_measure: f64,
    cyl: Option<Cylinder>,
}

impl ConstraintSampleSet {
    /// Creates an empty shell for the labelled constraint. The shell
    /// persists across phases; [`init_phase`](Self::init_phase) fills it.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            time_dependent: false,
            spatial_measure: 1.0,
            cyl: None,
        }
    }

    /// Builds the cylinder for one phase.
    ///
    /// The spatial base is sampled at the phase's density, floored at the
    /// batch size, rounded to a power of two when grading, with the hull
    /// points pinned. The temporal count is `ceil(stepsize / spd) + 1` when
    /// a step division is set, else `ceil(stepsize * spl) + 1`; grading
    /// rounds it up to the next power of two.
    ///
    /// # Errors
    ///
    /// Fails when the base sample or the cylinder construction fails.
    pub fn init_phase(&mut self, constraint: &Constraint, params: &PhaseSampling) -> PinnResult<()> {
        debug!(constraint = %self.label, spl = params.spl, "initializing sample set");
        self.time_dependent = params.th.is_some();
        self.spatial_measure = constraint.measure();

        let base = match constraint.source() {
            Some(source) => Some(source.sample(
                params.spl,
                Some(params.batchsize),
                params.grading,
                true,
            )?),
            None => None,
        };

        let (nsamples_1d, mode) = match params.th.as_ref() {
            None => (None, params.mode),
            Some(th) => {
                let stepsize = th.stepsize().ok_or(PinnTrainingError::Config {
                    message: "phase horizon carries no step size".into(),
                })?;
                let mut n1 = match params.spd {
                    Some(spd) => {
                        // The step division is a regular partition of the
                        // step; if it does not divide evenly, extend past
                        // the edge rather than undershoot. Closed endpoints
                        // add one.
                        let n = (stepsize / spd).ceil() as usize + 1;
                        debug!(
                            constraint = %self.label,
                            n1 = n,
                            spd,
                            "regular time partition from step division"
                        );
                        n
                    }
                    None => (stepsize * params.spl).ceil() as usize + 1,
                };
                if params.grading {
                    if params.spd.is_some() {
                        warn!(
                            constraint = %self.label,
                            "grading rounds the time partition; the step division spacing may be violated"
                        );
                    }
                    let mut rounded = 2;
                    while rounded < n1 {
                        rounded *= 2;
                    }
                    if rounded > n1 {
                        debug!(
                            constraint = %self.label,
                            from = n1,
                            to = rounded,
                            "rounding temporal samples up to a power of two"
                        );
                        n1 = rounded;
                    }
                }
                let mode = if params.spd.is_some() {
                    SampleMode::Regular
                } else {
                    params.mode
                };
                (Some(n1), mode)
            }
        };

        let mut cyl = Cylinder::new(CylinderSetup {
            label: self.label.clone(),
            base,
            time_dependent: self.time_dependent,
            nsamples_1d,
            batchsize: params.batchsize,
            mode,
            custom_batch: constraint.custom_batch(),
            grading: params.grading,
            reference_size: constraint.reference_size(),
            seed: params.seed,
        })?;
        match params.th.as_ref() {
            Some(th) => {
                let stepsize = th.stepsize().ok_or(PinnTrainingError::Config {
                    message: "phase horizon carries no step size".into(),
                })?;
                cyl.init(th.tinit(), stepsize, params.shelf)?;
            }
            None => cyl.init_static()?,
        }
        self.cyl = Some(cyl);
        Ok(())
    }

    /// Drops the cylinder contents at the end of a phase.
    pub fn deinit(&mut self) {
        if let Some(cyl) = self.cyl.as_mut() {
            cyl.deinit();
        }
        self.cyl = None;
    }

    /// Measure of the sampled region, spatial measure times the temporal
    /// window for time-dependent sets.
    #[must_use]
    pub fn measure(&self) -> f64 {
        let mut m = self.spatial_measure;
        if self.time_dependent {
            m *= self.cyl.as_ref().map_or(0.0, Cylinder::measure_1d);
        }
        m
    }

    /// Raises the cylinder's level by one.
    ///
    /// # Errors
    ///
    /// Fails before `init_phase` or when the cylinder refuses.
    pub fn expand(&mut self) -> PinnResult<()> {
        self.cylinder_mut()?.expand()
    }

    /// Lowers the cylinder's level by one.
    ///
    /// # Errors
    ///
    /// Fails before `init_phase` or when the cylinder refuses.
    pub fn contract(&mut self) -> PinnResult<()> {
        self.cylinder_mut()?.contract()
    }

    /// Translates the cylinder forward in time.
    ///
    /// # Errors
    ///
    /// Fails before `init_phase` or on a time-independent set.
    pub fn advance(&mut self, dt: Option<f64>) -> PinnResult<()> {
        self.cylinder_mut()?.advance(dt)
    }

    /// Serves the next `(inputs, reference)` batch.
    ///
    /// # Errors
    ///
    /// Fails before `init_phase`.
    pub fn batch(&mut self) -> PinnResult<(Array2<f64>, Option<Array2<f64>>)> {
        self.cylinder_mut()?.batch()
    }

    /// Completed traversals of the sample set since the last advance.
    #[must_use]
    pub fn age(&self) -> usize {
        self.cyl.as_ref().map_or(0, Cylinder::age)
    }

    /// Whether a traversal completed since the marker was last cleared.
    #[must_use]
    pub fn epoch_marker(&self) -> bool {
        self.cyl.as_ref().is_some_and(Cylinder::epoch_marker)
    }

    /// Clears the traversal marker.
    pub fn clear_epoch_marker(&mut self) {
        if let Some(cyl) = self.cyl.as_mut() {
            cyl.clear_epoch_marker();
        }
    }

    /// The constraint label this set serves.
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The live cylinder, for diagnostics.
    #[inline]
    #[must_use]
    pub fn cylinder(&self) -> Option<&Cylinder> {
        self.cyl.as_ref()
    }

    fn cylinder_mut(&mut self) -> PinnResult<&mut Cylinder> {
        self.cyl
            .as_mut()
            .ok_or_else(|| PinnTrainingError::Uninitialized {
                label: self.label.clone(),
                what: "sample set",
            })
    }
}
