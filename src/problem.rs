//! Problem definition: constraints, initial condition, and the global
//! time window.
//!
//! A [`Problem`] is the immutable description of what is being solved. It
//! never trains anything itself; drivers and phases read it to build their
//! per-stride sample sets. Everything mutable during a run lives in those
//! components, so one problem value can back many drivers.

use std::sync::Arc;

use ndarray::Array2;

use crate::cylinder::CustomBatch;
use crate::error::{PinnResult, PinnTrainingError};
use crate::horizon::TimeHorizon;
use crate::moments::Moment;
use crate::sampler::{InitialCondition, Source};

/// One constraint of the problem: a spatial source plus batch options.
///
/// The residual that turns a batch into a loss term belongs to the model
/// collaborator; the constraint only describes where its points come from
/// and how they are shaped.
pub struct Constraint {
    label: String,
    source: Option<Box<dyn Source>>,
    reference_size: usize,
    custom_batch: Option<Arc<dyn CustomBatch>>,
}

impl Constraint {
    /// Creates a constraint. A `None` source marks the zero-dimensional
    /// case where points have a time coordinate only.
    #[must_use]
    pub fn new(label: impl Into<String>, source: Option<Box<dyn Source>>) -> Self {
        Self {
            label: label.into(),
            source,
            reference_size: 0,
            custom_batch: None,
        }
    }

    /// Declares trailing reference columns carried by the source's rows,
    /// as produced by dataset-style sources whose points include target
    /// values after the coordinates.
    #[must_use]
    pub fn with_reference_size(mut self, reference_size: usize) -> Self {
        self.reference_size = reference_size;
        self
    }

    /// Installs a batch transform applied to every raw batch slice.
    #[must_use]
    pub fn with_custom_batch(mut self, custom_batch: Arc<dyn CustomBatch>) -> Self {
        self.custom_batch = Some(custom_batch);
        self
    }

    /// The constraint's label.
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The spatial source, absent in the zero-dimensional case.
    #[inline]
    #[must_use]
    pub fn source(&self) -> Option<&dyn Source> {
        self.source.as_deref()
    }

    /// Number of trailing reference columns in the source's rows.
    #[inline]
    #[must_use]
    pub fn reference_size(&self) -> usize {
        self.reference_size
    }

    /// The installed batch transform, if any, shared with the cylinders
    /// built against this constraint.
    #[inline]
    #[must_use]
    pub fn custom_batch(&self) -> Option<Arc<dyn CustomBatch>> {
        self.custom_batch.clone()
    }

    /// Spatial measure of the constraint's domain, one for the
    /// zero-dimensional case. The time axis is not included.
    #[must_use]
    pub fn measure(&self) -> f64 {
        self.source.as_ref().map_or(1.0, |s| s.measure())
    }
}

/// The initial condition: where to sample it and what values hold there.
pub struct ProblemIc {
    source: Box<dyn Source>,
    values: Box<dyn InitialCondition>,
}

impl ProblemIc {
    /// Pairs an initial-condition source with its value function.
    #[must_use]
    pub fn new(source: Box<dyn Source>, values: Box<dyn InitialCondition>) -> Self {
        Self { source, values }
    }

    /// The source supplying spatial points at the initial time.
    #[inline]
    #[must_use]
    pub fn source(&self) -> &dyn Source {
        self.source.as_ref()
    }

    /// Evaluates the condition at the given spatial points.
    #[must_use]
    pub fn evaluate(&self, points: &Array2<f64>) -> Array2<f64> {
        self.values.evaluate(points)
    }
}

/// Full problem description consumed by the engine.
pub struct Problem {
    outputs: Vec<String>,
    indim: usize,
    th: TimeHorizon,
    constraints: Vec<Constraint>,
    ic: Option<ProblemIc>,
    moments: Vec<Moment>,
}

impl Problem {
    /// Creates a problem over the given time window.
    ///
    /// `outputs` are the solution component labels, `indim` the spatial
    /// dimension. A horizon carrying a step size marks the problem as
    /// time-dependent.
    #[must_use]
    pub fn new(outputs: Vec<String>, indim: usize, th: TimeHorizon) -> Self {
        Self {
            outputs,
            indim,
            th,
            constraints: Vec::new(),
            ic: None,
            moments: Vec::new(),
        }
    }

    /// Appends a constraint. Order is preserved and determines batch
    /// assembly order during training.
    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Sets the initial condition.
    #[must_use]
    pub fn with_ic(mut self, ic: ProblemIc) -> Self {
        self.ic = Some(ic);
        self
    }

    /// Appends a moment declaration.
    #[must_use]
    pub fn with_moment(mut self, moment: Moment) -> Self {
        self.moments.push(moment);
        self
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Fails when outputs or constraints are empty, or when the initial
    /// condition's presence disagrees with the problem's time dependence.
    pub fn validate(&self) -> PinnResult<()> {
        if self.outputs.is_empty() {
            return Err(PinnTrainingError::Config {
                message: "problem declares no outputs".into(),
            });
        }
        if self.constraints.is_empty() {
            return Err(PinnTrainingError::Config {
                message: "problem declares no constraints".into(),
            });
        }
        if self.time_dependent() && self.ic.is_none() {
            return Err(PinnTrainingError::Config {
                message: "time-dependent problem requires an initial condition".into(),
            });
        }
        if !self.time_dependent() && self.ic.is_some() {
            return Err(PinnTrainingError::Config {
                message: "time-independent problem cannot take an initial condition".into(),
            });
        }
        let mut seen: Vec<&str> = Vec::new();
        for c in &self.constraints {
            if seen.contains(&c.label()) {
                return Err(PinnTrainingError::Config {
                    message: format!("duplicate constraint label {:?}", c.label()),
                });
            }
            seen.push(c.label());
        }
        Ok(())
    }

    /// Whether the problem evolves in time.
    #[inline]
    #[must_use]
    pub fn time_dependent(&self) -> bool {
        self.th.stepsize().is_some()
    }

    /// The problem-wide time window.
    #[inline]
    #[must_use]
    pub fn th(&self) -> &TimeHorizon {
        &self.th
    }

    /// Spatial input dimension.
    #[inline]
    #[must_use]
    pub fn indim(&self) -> usize {
        self.indim
    }

    /// Number of solution components.
    #[inline]
    #[must_use]
    pub fn outdim(&self) -> usize {
        self.outputs.len()
    }

    /// Solution component labels.
    #[inline]
    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// The constraints in declaration order.
    #[inline]
    #[must_use]
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Looks up a constraint by label.
    #[must_use]
    pub fn constraint(&self, label: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.label() == label)
    }

    /// The initial condition, present only for time-dependent problems.
    #[inline]
    #[must_use]
    pub fn ic(&self) -> Option<&ProblemIc> {
        self.ic.as_ref()
    }

    /// Declared moments.
    #[inline]
    #[must_use]
    pub fn moments(&self) -> &[Moment] {
        &self.moments
    }
}
