//! Point-set generation for spatial bases and temporal partitions.
//!
//! Every random draw in the crate flows through a [`UnitSegment`], a seeded
//! one-dimensional sampler over `[0, 1]`. Buffers scale and translate its
//! output into their own coordinates, so a run is reproducible from the
//! seeds in its configuration alone.
//!
//! # Why Pin Corners?
//!
//! A surrogate trained on a purely random sample can drift unchecked at the
//! domain boundary, exactly where initial and boundary conditions live. The
//! `corners` flag overwrites the first rows of a sample with the interval
//! endpoints so the convex hull of every base contains the domain.

use ndarray::{Array1, Array2};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PinnResult, PinnTrainingError};

/// Strategy for drawing values from the unit interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SampleMode {
    /// Evenly spaced partition including both endpoints.
    Regular,
    /// Independent uniform draws.
    #[default]
    Pseudo,
    /// Stratified draws, one per equal-width bin, in shuffled order.
    Latin,
}

/// Seeded sampler over the unit interval `[0, 1]`.
#[derive(Debug, Clone)]
pub struct UnitSegment {
    mode: SampleMode,
    rng: ChaCha8Rng,
}

impl UnitSegment {
    /// Creates a sampler with a deterministic stream.
    #[must_use]
    pub fn new(mode: SampleMode, seed: u64) -> Self {
        Self {
            mode,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// The sampling strategy.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> SampleMode {
        self.mode
    }

    /// Draws `n` values from `[0, 1]`.
    ///
    /// With `corners` set, the first two values are overwritten with the
    /// exact endpoints `0` and `1`. Regular mode carries its endpoints
    /// already and ignores the flag.
    ///
    /// # Errors
    ///
    /// Fails when `corners` is requested with fewer than two samples.
    pub fn sample(&mut self, n: usize, corners: bool) -> PinnResult<Array1<f64>> {
        let mut values = match self.mode {
            SampleMode::Regular => {
                if n <= 1 {
                    Array1::zeros(n)
                } else {
                    Array1::from_iter((0..n).map(|i| i as f64 / (n - 1) as f64))
                }
            }
            SampleMode::Pseudo => Array1::from_iter((0..n).map(|_| self.rng.gen::<f64>())),
            SampleMode::Latin => {
                let mut bins: Vec<f64> = (0..n)
                    .map(|i| (i as f64 + self.rng.gen::<f64>()) / n as f64)
                    .collect();
                bins.shuffle(&mut self.rng);
                Array1::from_vec(bins)
            }
        };
        if corners && self.mode != SampleMode::Regular {
            if n < 2 {
                return Err(PinnTrainingError::Config {
                    message: format!("cannot pin both interval endpoints with {n} sample(s)"),
                });
            }
            values[0] = 0.0;
            values[1] = 1.0;
        }
        Ok(values)
    }

    /// Returns a shuffled index permutation of `0..n`.
    pub fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(&mut self.rng);
        perm
    }
}

/// Rounds a sample count up to the next power of two.
#[inline]
#[must_use]
pub fn round_up_pow2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// A supplier of static spatial point sets.
///
/// Implementations are geometric domains or datasets living outside the
/// sampling core. The core only ever asks for a sample of a given density
/// and for the measure used to weigh the constraint's loss term.
pub trait Source: Send + Sync {
    /// Draws a point set of shape `[N, dim]`.
    ///
    /// `density` is a samples-per-unit-length value, raised to the internal
    /// dimension and multiplied by the measure to find `N`. `min_count`
    /// floors `N`, `pow2` rounds it up to a power of two, and `hull`
    /// overwrites leading rows with the domain's extreme points.
    ///
    /// # Errors
    ///
    /// Fails when the requested sample cannot satisfy the flags, for
    /// example a hull request with too few points.
    fn sample(
        &self,
        density: f64,
        min_count: Option<usize>,
        pow2: bool,
        hull: bool,
    ) -> PinnResult<Array2<f64>>;

    /// The measure (length, area, volume) of the sampled set. Dimension
    /// zero sources report measure one.
    fn measure(&self) -> f64;

    /// The dimension of the set itself, which may be lower than the
    /// ambient space dimension.
    fn internal_dimension(&self) -> usize;

    /// The dimension of the ambient space.
    fn dimension(&self) -> usize;
}

/// Resolves the row count for a sample request.
fn resolve_count(
    density: f64,
    internal_dimension: usize,
    measure: f64,
    min_count: Option<usize>,
    pow2: bool,
) -> usize {
    let mut n = (density.powi(internal_dimension as i32) * measure) as usize;
    if let Some(min) = min_count {
        n = n.max(min);
    }
    if pow2 {
        n = round_up_pow2(n);
    }
    n
}

/// A one-dimensional interval `[left, right]`.
pub struct IntervalSource {
    left: f64,
    right: f64,
    segment: Mutex<UnitSegment>,
}

impl IntervalSource {
    /// Creates an interval source with its own sample stream.
    #[must_use]
    pub fn new(left: f64, right: f64, mode: SampleMode, seed: u64) -> Self {
        Self {
            left,
            right,
            segment: Mutex::new(UnitSegment::new(mode, seed)),
        }
    }
}

impl Source for IntervalSource {
    fn sample(
        &self,
        density: f64,
        min_count: Option<usize>,
        pow2: bool,
        hull: bool,
    ) -> PinnResult<Array2<f64>> {
        let n = resolve_count(density, 1, self.measure(), min_count, pow2);
        let unit = self.segment.lock().sample(n, hull)?;
        let width = self.right - self.left;
        let mut points = Array2::zeros((n, 1));
        for (i, u) in unit.iter().enumerate() {
            points[[i, 0]] = self.left + width * u;
        }
        Ok(points)
    }

    fn measure(&self) -> f64 {
        self.right - self.left
    }

    fn internal_dimension(&self) -> usize {
        1
    }

    fn dimension(&self) -> usize {
        1
    }
}

/// A zero-dimensional source: one fixed point, repeated per request.
///
/// Boundary conditions of one-dimensional problems sample from these.
pub struct PointSource {
    coords: Vec<f64>,
}

impl PointSource {
    /// Creates a source pinned at the given coordinates.
    #[must_use]
    pub fn new(coords: Vec<f64>) -> Self {
        Self { coords }
    }
}

impl Source for PointSource {
    fn sample(
        &self,
        density: f64,
        min_count: Option<usize>,
        pow2: bool,
        _hull: bool,
    ) -> PinnResult<Array2<f64>> {
        let n = resolve_count(density, 0, self.measure(), min_count, pow2);
        let dim = self.coords.len();
        let mut points = Array2::zeros((n, dim));
        for mut row in points.rows_mut() {
            for (j, c) in self.coords.iter().enumerate() {
                row[j] = *c;
            }
        }
        Ok(points)
    }

    fn measure(&self) -> f64 {
        1.0
    }

    fn internal_dimension(&self) -> usize {
        0
    }

    fn dimension(&self) -> usize {
        self.coords.len()
    }
}

/// Values of the solution at the initial time, evaluated on demand.
pub trait InitialCondition: Send + Sync {
    /// Evaluates the condition at spatial points of shape `[N, dim]`,
    /// returning outputs of shape `[N, outdim]`.
    fn evaluate(&self, points: &Array2<f64>) -> Array2<f64>;
}

impl<F> InitialCondition for F
where
    F: Fn(&Array2<f64>) -> Array2<f64> + Send + Sync,
{
    fn evaluate(&self, points: &Array2<f64>) -> Array2<f64> {
        self(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_partition_hits_both_endpoints() {
        let mut seg = UnitSegment::new(SampleMode::Regular, 7);
        let values = seg.sample(5, false).unwrap();
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[4], 1.0);
        assert!((values[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn pseudo_draws_stay_in_unit_interval() {
        let mut seg = UnitSegment::new(SampleMode::Pseudo, 11);
        let values = seg.sample(64, false).unwrap();
        assert!(values.iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn corners_overwrite_first_two_draws() {
        let mut seg = UnitSegment::new(SampleMode::Pseudo, 11);
        let values = seg.sample(8, true).unwrap();
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], 1.0);
    }

    #[test]
    fn corners_need_two_samples() {
        let mut seg = UnitSegment::new(SampleMode::Pseudo, 11);
        assert!(seg.sample(1, true).is_err());
    }

    #[test]
    fn latin_fills_every_bin() {
        let mut seg = UnitSegment::new(SampleMode::Latin, 3);
        let n = 16;
        let mut values = seg.sample(n, false).unwrap().to_vec();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (i, v) in values.iter().enumerate() {
            let lo = i as f64 / n as f64;
            let hi = (i + 1) as f64 / n as f64;
            assert!((lo..hi).contains(v), "value {v} escaped bin [{lo}, {hi})");
        }
    }

    #[test]
    fn same_seed_reproduces_stream() {
        let mut a = UnitSegment::new(SampleMode::Pseudo, 99);
        let mut b = UnitSegment::new(SampleMode::Pseudo, 99);
        assert_eq!(
            a.sample(10, false).unwrap().to_vec(),
            b.sample(10, false).unwrap().to_vec()
        );
        assert_eq!(a.permutation(10), b.permutation(10));
    }

    #[test]
    fn permutation_covers_all_indices() {
        let mut seg = UnitSegment::new(SampleMode::Pseudo, 5);
        let mut perm = seg.permutation(32);
        perm.sort_unstable();
        assert_eq!(perm, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn round_up_pow2_behaves() {
        assert_eq!(round_up_pow2(1), 1);
        assert_eq!(round_up_pow2(12), 16);
        assert_eq!(round_up_pow2(16), 16);
        assert_eq!(round_up_pow2(0), 1);
    }

    #[test]
    fn interval_source_scales_and_counts() {
        let source = IntervalSource::new(-2.0, 2.0, SampleMode::Pseudo, 41);
        // density 8 over measure 4 gives 32 points before flooring.
        let points = source.sample(8.0, Some(10), false, true).unwrap();
        assert_eq!(points.shape(), &[32, 1]);
        assert_eq!(points[[0, 0]], -2.0);
        assert_eq!(points[[1, 0]], 2.0);
        assert!(points.iter().all(|x| (-2.0..=2.0).contains(x)));
    }

    #[test]
    fn interval_source_honors_min_count_and_pow2() {
        let source = IntervalSource::new(0.0, 1.0, SampleMode::Pseudo, 41);
        let points = source.sample(3.0, Some(20), true, false).unwrap();
        // density 3 yields 3, floored to 20, rounded up to 32.
        assert_eq!(points.shape(), &[32, 1]);
    }

    #[test]
    fn point_source_repeats_coordinates() {
        let source = PointSource::new(vec![1.5]);
        let points = source.sample(100.0, Some(4), false, false).unwrap();
        assert_eq!(points.shape(), &[4, 1]);
        assert!(points.iter().all(|x| *x == 1.5));
        assert_eq!(source.internal_dimension(), 0);
        assert_eq!(source.measure(), 1.0);
    }
}
