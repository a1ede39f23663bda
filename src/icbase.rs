//! Initial-condition time-slice buffers.
//!
//! An [`IcBase`] holds the solution state at the start of the current step:
//! spatial points, the solution values at those points, and the scalar time
//! of the slice. It is the temporal anchor of a time-dependent run. Where a
//! [`Cylinder`](crate::cylinder::Cylinder) covers a window of time, the IC
//! base is a single slice that [`advance`](IcBase::advance) pushes forward
//! by re-evaluating the trained model.
//!
//! # Why Two Copies?
//!
//! One pristine base per driver records the state at the start of the
//! stride. Each phase then copies it into a working base of its own, sets
//! its batch size, and consumes batches from the copy while marching it
//! through the phase's steps. Because every phase starts from the pristine
//! copy, earlier phases cannot contaminate the slice that later phases
//! train from, and the stride can host phases of different step multiples
//! over the same time window. At the end of the stride the final phase's
//! working base is snapshot into an [`IcBuffer`] and handed to the next
//! driver, which loads it without ever touching the producing driver's
//! buffers.

use ndarray::{s, Array2, Axis};

use crate::error::{PinnResult, PinnTrainingError};
use crate::problem::Problem;
use crate::sampler::{SampleMode, UnitSegment};

/// A detached snapshot of an IC slice, used to hand state across drivers.
#[derive(Debug, Clone)]
pub struct IcBuffer {
    /// Spatial points, shape `[n, indim]`.
    pub x: Array2<f64>,
    /// Solution values at the points, shape `[n, outdim]`.
    pub q: Array2<f64>,
    /// Time of the slice.
    pub t: f64,
}

impl IcBuffer {
    /// Number of points in the slice.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    /// Whether the slice holds no points.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.nrows() == 0
    }
}

/// The solution state at the start of the current step.
pub struct IcBase {
    data: Option<IcBuffer>,
    batchsize: usize,
    segment: UnitSegment,
    cursor: usize,
    age_counter: usize,
    epoch_marker: bool,
}

impl IcBase {
    /// Creates an empty base. Populate it with [`sample`](Self::sample)
    /// output via [`load`](Self::load), or from another base via
    /// [`init_phase`](Self::init_phase).
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            data: None,
            batchsize: 0,
            segment: UnitSegment::new(SampleMode::Pseudo, seed),
            cursor: 0,
            age_counter: 0,
            epoch_marker: false,
        }
    }

    /// Samples the problem's initial condition at the problem's initial
    /// time. Done once per run, by the first driver only; every other
    /// driver receives the slice through communication.
    ///
    /// The spatial sample pins the domain's extreme points so that later
    /// interpolation from the slice covers the full domain.
    ///
    /// # Errors
    ///
    /// Fails when the problem declares no initial condition, or when the
    /// condition's value function disagrees with the sample shape.
    pub fn sample(problem: &Problem, density: f64, seed: u64) -> PinnResult<Self> {
        let Some(ic) = problem.ic() else {
            return Err(PinnTrainingError::Config {
                message: "cannot sample an initial condition the problem does not declare".into(),
            });
        };
        let x = ic.source().sample(density, None, false, true)?;
        let q = ic.evaluate(&x);
        if q.nrows() != x.nrows() {
            return Err(PinnTrainingError::Collaborator {
                context: "initial condition",
                message: format!(
                    "value function returned {} rows for {} points",
                    q.nrows(),
                    x.nrows()
                ),
            });
        }
        Ok(Self {
            data: Some(IcBuffer {
                x,
                q,
                t: problem.th().tinit(),
            }),
            batchsize: 0,
            segment: UnitSegment::new(SampleMode::Pseudo, seed),
            cursor: 0,
            age_counter: 0,
            epoch_marker: false,
        })
    }

    /// Copies another base's slice into this one and arms it for batching:
    /// the batch size is set, the counters are zeroed, and the rows are
    /// shuffled once. Called at the start of each phase against the
    /// driver's pristine base.
    ///
    /// # Errors
    ///
    /// Fails when the other base holds no slice.
    pub fn init_phase(&mut self, pristine: &IcBase, batchsize: usize) -> PinnResult<()> {
        let Some(data) = pristine.data.as_ref() else {
            return Err(PinnTrainingError::Uninitialized {
                label: "ic".into(),
                what: "sample",
            });
        };
        self.data = Some(data.clone());
        self.batchsize = batchsize;
        self.cursor = 0;
        self.age_counter = 0;
        self.epoch_marker = false;
        self.shuffle();
        Ok(())
    }

    /// Drops the slice at the end of a phase.
    pub fn deinit(&mut self) {
        self.data = None;
    }

    /// Replaces the slice with a communicated snapshot.
    pub fn load(&mut self, buffer: &IcBuffer) {
        self.data = Some(buffer.clone());
        self.cursor = 0;
        self.age_counter = 0;
    }

    /// Clones the slice out for communication.
    ///
    /// # Errors
    ///
    /// Fails when the base holds no slice.
    pub fn snapshot(&self) -> PinnResult<IcBuffer> {
        self.data
            .as_ref()
            .cloned()
            .ok_or_else(|| PinnTrainingError::Uninitialized {
                label: "ic".into(),
                what: "sample",
            })
    }

    /// Serves the next batch as `(inputs, targets)`, where inputs carry the
    /// slice time as a trailing column and targets are the stored solution
    /// values. Wrap semantics match the cylinder: when the next read would
    /// run off the end, the remainder is discarded, the rows reshuffle, the
    /// age counter increments and the epoch marker is set.
    ///
    /// # Errors
    ///
    /// Fails when the base holds no slice or the batch size is unset.
    pub fn batch(&mut self) -> PinnResult<(Array2<f64>, Array2<f64>)> {
        let Some(data) = self.data.as_ref() else {
            return Err(PinnTrainingError::Uninitialized {
                label: "ic".into(),
                what: "sample",
            });
        };
        if self.batchsize == 0 {
            return Err(PinnTrainingError::Uninitialized {
                label: "ic".into(),
                what: "batch size",
            });
        }
        let rows = data.x.nrows();
        let beg = self.cursor.min(rows);
        let end = (self.cursor + self.batchsize).min(rows);
        let inputs = with_time(&data.x.slice(s![beg..end, ..]).to_owned(), data.t);
        let targets = data.q.slice(s![beg..end, ..]).to_owned();
        self.cursor += self.batchsize;
        if self.cursor + self.batchsize > rows {
            self.shuffle();
            self.cursor = 0;
            self.age_counter += 1;
            self.epoch_marker = true;
        }
        Ok((inputs, targets))
    }

    /// Pushes the slice one step forward: the time moves by `dt` and the
    /// stored values are replaced by evaluating the model at the points at
    /// the new time. The age counter resets; the epoch marker is left for
    /// the owning aggregate to clear.
    ///
    /// # Errors
    ///
    /// Fails when the base holds no slice or the evaluation disagrees with
    /// the sample shape.
    pub fn advance<F>(&mut self, dt: f64, evaluate: F) -> PinnResult<()>
    where
        F: FnOnce(&Array2<f64>) -> Array2<f64>,
    {
        let Some(data) = self.data.as_mut() else {
            return Err(PinnTrainingError::Uninitialized {
                label: "ic".into(),
                what: "sample",
            });
        };
        let t_next = data.t + dt;
        let inputs = with_time(&data.x, t_next);
        let q = evaluate(&inputs);
        if q.nrows() != data.x.nrows() {
            return Err(PinnTrainingError::Collaborator {
                context: "ic advance",
                message: format!(
                    "evaluation returned {} rows for {} points",
                    q.nrows(),
                    data.x.nrows()
                ),
            });
        }
        data.q = q;
        data.t = t_next;
        self.age_counter = 0;
        Ok(())
    }

    /// Time of the slice, `None` before the base is populated.
    #[must_use]
    pub fn t(&self) -> Option<f64> {
        self.data.as_ref().map(|d| d.t)
    }

    /// Number of points in the slice, zero before the base is populated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, IcBuffer::len)
    }

    /// Whether the base holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spatial dimension of the slice points.
    #[must_use]
    pub fn indim(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.x.ncols())
    }

    /// Number of solution components stored per point.
    #[must_use]
    pub fn outdim(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.q.ncols())
    }

    /// The slice's spatial points, for diagnostics and interpolation.
    #[inline]
    #[must_use]
    pub fn points(&self) -> Option<&Array2<f64>> {
        self.data.as_ref().map(|d| &d.x)
    }

    /// The slice's solution values.
    #[inline]
    #[must_use]
    pub fn values(&self) -> Option<&Array2<f64>> {
        self.data.as_ref().map(|d| &d.q)
    }

    /// Configured batch size, zero until `init_phase`.
    #[inline]
    #[must_use]
    pub fn batchsize(&self) -> usize {
        self.batchsize
    }

    /// Number of completed full traversals since the last advance.
    #[inline]
    #[must_use]
    pub fn age(&self) -> usize {
        self.age_counter
    }

    /// Whether a traversal completed since the marker was last cleared.
    #[inline]
    #[must_use]
    pub fn epoch_marker(&self) -> bool {
        self.epoch_marker
    }

    /// Clears the epoch marker. Called by the owning sample-set aggregate
    /// once every buffer's marker has been observed set.
    #[inline]
    pub fn clear_epoch_marker(&mut self) {
        self.epoch_marker = false;
    }

    /// Reorders points and values with one shared permutation.
    fn shuffle(&mut self) {
        if let Some(data) = self.data.as_mut() {
            let perm = self.segment.permutation(data.x.nrows());
            data.x = data.x.select(Axis(0), &perm);
            data.q = data.q.select(Axis(0), &perm);
        }
    }
}

/// Appends a constant time column to a block of spatial points.
fn with_time(x: &Array2<f64>, t: f64) -> Array2<f64> {
    let indim = x.ncols();
    let mut inputs = Array2::zeros((x.nrows(), indim + 1));
    inputs.slice_mut(s![.., ..indim]).assign(x);
    inputs.column_mut(indim).fill(t);
    inputs
}
