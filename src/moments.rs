//! Cached nonlocal quantities on per-step temporal lattices.
//!
//! A moment is a quantity that a residual needs but that no single batch
//! can supply, for example an integral of the current surrogate over the
//! domain. Recomputing such a quantity inside every residual evaluation
//! would dwarf the cost of the training step, so [`MomentSets`] computes
//! each declared moment on a fixed lattice of points and a fixed set of
//! time slots once per update cadence, and residuals read the cache
//! through [`lookup`](MomentSets::lookup) with interpolation in space and
//! exact slot matching in time.
//!
//! The temporal slots partition the current step: slot `ti` sits at
//! `tinit + ti * spd`, with `Nts = ceil(stepsize / spd) + 1` closed
//! endpoints. Lookups must land on a slot within a small tolerance; a
//! miss is a configuration error, not something to smooth over, because a
//! residual sampling between slots would silently read a stale time.

use ndarray::{Array1, Array2};
use tracing::debug;

use crate::error::{PinnResult, PinnTrainingError};
use crate::horizon::TimeHorizon;
use crate::problem::Problem;

/// Absolute tolerance for matching a lookup time to a lattice slot.
const ALIGNMENT_TOLERANCE: f64 = 1e-8;

/// Computes one moment's values on a timeslice.
pub trait MomentMethod: Send + Sync {
    /// Evaluates the moment at the lattice points on the slice at `t`.
    /// Returns one value per point row.
    fn evaluate(&self, points: &Array2<f64>, t: f64) -> Array1<f64>;
}

impl<F> MomentMethod for F
where
    F: Fn(&Array2<f64>, f64) -> Array1<f64> + Send + Sync,
{
    fn evaluate(&self, points: &Array2<f64>, t: f64) -> Array1<f64> {
        self(points, t)
    }
}

/// Declaration of one moment: its label, its nontemporal lattice, its
/// update cadence, and the method that computes it.
pub struct Moment {
    label: String,
    points: Array2<f64>,
    every: usize,
    method: Box<dyn MomentMethod>,
}

impl Moment {
    /// Declares a moment computed on the given lattice points, shape
    /// `[m, indim]`. A zero-column lattice with a single row declares a
    /// moment of time alone.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        points: Array2<f64>,
        method: Box<dyn MomentMethod>,
    ) -> Self {
        Self {
            label: label.into(),
            points,
            every: 1,
            method,
        }
    }

    /// Sets the update cadence in training iterations. Default one,
    /// refresh on every iteration.
    #[must_use]
    pub fn with_every(mut self, every: usize) -> Self {
        self.every = every;
        self
    }

    /// The moment's label, as residuals look it up.
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The declared lattice points.
    #[inline]
    #[must_use]
    pub fn points(&self) -> &Array2<f64> {
        &self.points
    }

    /// Update cadence in iterations.
    #[inline]
    #[must_use]
    pub fn every(&self) -> usize {
        self.every
    }

    /// The method computing this moment.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &dyn MomentMethod {
        self.method.as_ref()
    }
}

/// One moment's cache: lattice points and a value column per time slot.
pub struct MomentLattice {
    label: String,
    points: Array2<f64>,
    values: Array2<f64>,
}

impl MomentLattice {
    /// The moment label this lattice caches.
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The lattice points, sorted ascending for one-dimensional lattices.
    #[inline]
    #[must_use]
    pub fn points(&self) -> &Array2<f64> {
        &self.points
    }

    /// Cached values, shape `[m, Nts]`.
    #[inline]
    #[must_use]
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Reads the cached slot out to the requested points.
    fn read(&self, slot: usize, query: Option<&Array2<f64>>) -> Array2<f64> {
        let column = self.values.column(slot);
        let Some(query) = query else {
            return Array2::from_shape_fn((column.len(), 1), |(r, _)| column[r]);
        };
        let indim = self.points.ncols();
        let n = query.nrows();
        match indim {
            // A moment of time alone is constant on the slice.
            0 => Array2::from_elem((n, 1), column[0]),
            1 => {
                let xs = self.points.column(0);
                Array2::from_shape_fn((n, 1), |(r, _)| {
                    interp_linear(&xs.to_vec(), &column.to_vec(), query[[r, 0]])
                })
            }
            _ => Array2::from_shape_fn((n, 1), |(r, _)| {
                let mut best = 0;
                let mut best_d = f64::INFINITY;
                for m in 0..self.points.nrows() {
                    let mut d = 0.0;
                    for c in 0..indim {
                        let delta = self.points[[m, c]] - query[[r, c]];
                        d += delta * delta;
                    }
                    if d < best_d {
                        best_d = d;
                        best = m;
                    }
                }
                column[best]
            }),
        }
    }
}

/// Per-phase manager of every declared moment's cache.
pub struct MomentSets {
    lattices: Vec<MomentLattice>,
    spd: Option<f64>,
    nts: usize,
    tinit: f64,
}

impl Default for MomentSets {
    fn default() -> Self {
        Self::new()
    }
}

impl MomentSets {
    /// Creates an empty manager; [`init_phase`](Self::init_phase) builds
    /// the lattices.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lattices: Vec::new(),
            spd: None,
            nts: 0,
            tinit: 0.0,
        }
    }

    /// Builds one lattice per declared moment over the phase's step.
    ///
    /// A problem without moments initializes vacuously. Otherwise a step
    /// division must be configured, the horizon must carry a step size,
    /// and every moment needs a nonempty lattice and a unique label.
    ///
    /// # Errors
    ///
    /// Fails on any of the conditions above.
    pub fn init_phase(
        &mut self,
        problem: &Problem,
        th: &TimeHorizon,
        spd: Option<f64>,
    ) -> PinnResult<()> {
        self.lattices.clear();
        self.tinit = th.tinit();
        if problem.moments().is_empty() {
            self.spd = None;
            self.nts = 0;
            return Ok(());
        }
        let Some(spd) = spd else {
            return Err(PinnTrainingError::Config {
                message: "moments are declared but no step division is configured".into(),
            });
        };
        let Some(stepsize) = th.stepsize() else {
            return Err(PinnTrainingError::Config {
                message: "moments require a time-dependent horizon".into(),
            });
        };
        self.spd = Some(spd);
        self.nts = (stepsize / spd).ceil() as usize + 1;
        debug!(nts = self.nts, spd, "building moment lattices");
        for moment in problem.moments() {
            if self.lattices.iter().any(|l| l.label() == moment.label()) {
                return Err(PinnTrainingError::Config {
                    message: format!("duplicate moment label {:?}", moment.label()),
                });
            }
            if moment.points().nrows() == 0 {
                return Err(PinnTrainingError::Config {
                    message: format!("moment {:?} declares an empty lattice", moment.label()),
                });
            }
            let mut points = moment.points().clone();
            if points.ncols() == 1 {
                // Interpolation wants the one-dimensional lattice ordered.
                let mut rows: Vec<f64> = points.column(0).to_vec();
                rows.sort_by(f64::total_cmp);
                for (r, x) in rows.into_iter().enumerate() {
                    points[[r, 0]] = x;
                }
            }
            let rows = points.nrows();
            self.lattices.push(MomentLattice {
                label: moment.label().to_string(),
                points,
                values: Array2::zeros((rows, self.nts)),
            });
        }
        Ok(())
    }

    /// Drops the lattices at the end of a phase.
    pub fn deinit(&mut self) {
        self.lattices.clear();
    }

    /// Refreshes every moment whose cadence divides `iteration`, filling
    /// all temporal slots from the moment's method.
    ///
    /// # Errors
    ///
    /// Fails when a declared moment has no lattice, its cadence is zero,
    /// or its method returns the wrong number of values.
    pub fn update(&mut self, iteration: usize, problem: &Problem) -> PinnResult<()> {
        for moment in problem.moments() {
            if moment.every() == 0 {
                return Err(PinnTrainingError::Config {
                    message: format!("moment {:?} declares a zero cadence", moment.label()),
                });
            }
            if iteration % moment.every() != 0 {
                continue;
            }
            let spd = self.spd.unwrap_or(0.0);
            let tinit = self.tinit;
            let Some(lattice) = self
                .lattices
                .iter_mut()
                .find(|l| l.label() == moment.label())
            else {
                return Err(PinnTrainingError::MomentLabel {
                    label: moment.label().to_string(),
                });
            };
            for ti in 0..lattice.values.ncols() {
                let t = tinit + spd * ti as f64;
                let slice = moment.method().evaluate(&lattice.points, t);
                if slice.len() != lattice.points.nrows() {
                    return Err(PinnTrainingError::Collaborator {
                        context: "moment update",
                        message: format!(
                            "moment {:?} returned {} values for {} points",
                            moment.label(),
                            slice.len(),
                            lattice.points.nrows()
                        ),
                    });
                }
                for (r, v) in slice.iter().enumerate() {
                    lattice.values[[r, ti]] = *v;
                }
            }
        }
        Ok(())
    }

    /// Translates the lattice base time by one step.
    pub fn advance(&mut self, dt: f64) {
        self.tinit += dt;
    }

    /// Looks up a moment's cached values at time `t`.
    ///
    /// With `query` points the slot column is interpolated to them:
    /// constant for zero-dimensional lattices, linear with endpoint
    /// clamping in one dimension, nearest neighbour above. Without a query
    /// the raw slot column is returned.
    ///
    /// # Errors
    ///
    /// Fails on an unknown label, a time outside the lattice's temporal
    /// range, or a time not aligned to a slot within tolerance.
    pub fn lookup(
        &self,
        label: &str,
        t: f64,
        query: Option<&Array2<f64>>,
    ) -> PinnResult<Array2<f64>> {
        let Some(lattice) = self.lattices.iter().find(|l| l.label() == label) else {
            return Err(PinnTrainingError::MomentLabel {
                label: label.to_string(),
            });
        };
        let spd = self.spd.unwrap_or(0.0);
        let tmax = self.tinit + spd * (self.nts.saturating_sub(1)) as f64;
        if t < self.tinit - ALIGNMENT_TOLERANCE || t > tmax + ALIGNMENT_TOLERANCE {
            return Err(PinnTrainingError::MomentRange {
                label: label.to_string(),
                t,
                tinit: self.tinit,
                tmax,
            });
        }
        let slot_f = (t - self.tinit) / spd;
        let slot = slot_f.round().max(0.0) as usize;
        let offset = (t - (self.tinit + spd * slot as f64)).abs();
        if offset > ALIGNMENT_TOLERANCE {
            return Err(PinnTrainingError::MomentAlignment {
                label: label.to_string(),
                t,
                slot,
                offset,
                tolerance: ALIGNMENT_TOLERANCE,
            });
        }
        if slot >= self.nts {
            return Err(PinnTrainingError::MomentRange {
                label: label.to_string(),
                t,
                tinit: self.tinit,
                tmax,
            });
        }
        Ok(lattice.read(slot, query))
    }

    /// Number of temporal slots per step.
    #[inline]
    #[must_use]
    pub fn nts(&self) -> usize {
        self.nts
    }

    /// Current base time of the lattices.
    #[inline]
    #[must_use]
    pub fn tinit(&self) -> f64 {
        self.tinit
    }

    /// The configured step division, if moments are live.
    #[inline]
    #[must_use]
    pub fn spd(&self) -> Option<f64> {
        self.spd
    }

    /// The built lattices, for diagnostics.
    #[inline]
    #[must_use]
    pub fn lattices(&self) -> &[MomentLattice] {
        &self.lattices
    }
}

/// Piecewise-linear interpolation over a sorted abscissa, clamped to the
/// endpoint values outside the lattice.
fn interp_linear(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }
    let mut hi = 1;
    while xs[hi] < x {
        hi += 1;
    }
    let lo = hi - 1;
    let width = xs[hi] - xs[lo];
    if width == 0.0 {
        return ys[lo];
    }
    let w = (x - xs[lo]) / width;
    ys[lo] * (1.0 - w) + ys[hi] * w
}
