//! Owned per-iteration training payloads.
//!
//! A [`Batch`] is assembled fresh for every training iteration from the
//! phase's sample buffers and handed to the surrogate by value. Nothing in
//! the batch aliases live buffer state: the buffers reshuffle and advance
//! underneath without invalidating anything the surrogate holds, and the
//! surrogate is free to consume, transpose, or ship the arrays to a device
//! without defensive copies.

use ndarray::{Array1, Array2};

/// The initial-condition slice of a batch.
#[derive(Debug, Clone)]
pub struct IcBatch {
    /// Sample points, one row per sample, with the trailing time column.
    pub inputs: Array2<f64>,
    /// Target solution values at those points, one row per sample.
    pub targets: Array2<f64>,
}

/// One constraint's slice of a batch.
#[derive(Debug, Clone)]
pub struct ConstraintBatch {
    /// Label of the constraint the slice was drawn from.
    pub label: String,
    /// Sample points, one row per sample; time-dependent constraints carry
    /// the time coordinate in the last column.
    pub inputs: Array2<f64>,
    /// Trailing reference columns split off the base, when declared.
    pub reference: Option<Array2<f64>>,
    /// Per-row loss weights, present when a weighting strategy is active.
    pub weights: Option<Array1<f64>>,
}

impl ConstraintBatch {
    /// Number of sample rows in the slice.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    /// Whether the slice is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }
}

/// Everything one training iteration consumes.
///
/// `level`, `iteration` and `max_iterations` ride along so a surrogate can
/// schedule learning rates or loss weights without a back-channel into the
/// driver.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Initial-condition slice, absent for time-independent problems.
    pub ic: Option<IcBatch>,
    /// One slice per active constraint, in the problem's declaration order.
    pub constraints: Vec<ConstraintBatch>,
    /// Time delta the phase advances by after this step's training, zero
    /// when the problem has no time dependence.
    pub dt: f64,
    /// Expansion level the buffers were at when the batch was drawn.
    pub level: u32,
    /// Zero-based iteration index within the current training session.
    pub iteration: usize,
    /// Iteration ceiling of the current training session.
    pub max_iterations: usize,
}

impl Batch {
    /// Looks up a constraint slice by label.
    #[must_use]
    pub fn constraint(&self, label: &str) -> Option<&ConstraintBatch> {
        self.constraints.iter().find(|c| c.label == label)
    }

    /// Total number of sample rows across all slices.
    #[must_use]
    pub fn nrows(&self) -> usize {
        let ic = self.ic.as_ref().map_or(0, |ic| ic.inputs.nrows());
        ic + self.constraints.iter().map(ConstraintBatch::len).sum::<usize>()
    }
}

/// What a surrogate reports back from one optimization step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainStepResult {
    /// Scalar training loss after the step, compared against the session
    /// tolerance for the convergence break.
    pub loss: f64,
}
