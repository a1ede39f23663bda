//! Expandable time-cylinder sample buffers.
//!
//! A [`Cylinder`] extrudes a static spatial base along the time axis to
//! cover one training step, then serves shuffled batches from the result.
//! Three in-place mutations give the buffer its lifecycle: [`expand`] and
//! [`contract`] reshape temporal coverage for graded training, and
//! [`advance`] slides the whole buffer forward one step.
//!
//! # Why Expand And Contract?
//!
//! Graded training wants a curriculum: fit the current step, push part of
//! the sample deeper into the future and fit again, then pull it back and
//! consolidate. `expand` raises the buffer's `level` and advances the time
//! column of a structured subset of rows by `2^(level-1)` steps; the subset
//! is a binary partition of the buffer that thins geometrically with depth,
//! so early levels move large slices one step while deep levels probe far
//! ahead with a handful of rows. `contract` applies the same slices with
//! the delta negated, which makes one expand followed by one contract
//! restore the buffer it displaced. The level can never exceed
//! `floor(log2(rows))`, past which no rows remain to partition.
//!
//! [`expand`]: Cylinder::expand
//! [`contract`]: Cylinder::contract
//! [`advance`]: Cylinder::advance

use std::sync::Arc;

use ndarray::{s, Array2, Axis};
use tracing::warn;

use crate::error::{PinnResult, PinnTrainingError};
use crate::sampler::{SampleMode, UnitSegment};

/// Hard ceiling on the expansion level, imposed by the word-size shifts in
/// the segment arithmetic.
const HARD_MAXLEVEL: u32 = 63;

/// Batches-per-age count below which a configuration draws a warning.
const BATCHES_PER_AGE_FLOOR: usize = 16;

/// A transform applied to every raw batch slice before training sees it.
///
/// The raw slice holds `batchsize / divisor()` rows; the transform may grow
/// it back to the configured batch size, for example by mirroring rows
/// across a periodic boundary.
pub trait CustomBatch: Send + Sync {
    /// Factor by which raw slices are smaller than the configured batch.
    fn divisor(&self) -> usize;

    /// Maps a raw slice to the batch handed to training.
    fn apply(&self, raw: Array2<f64>) -> Array2<f64>;
}

/// Construction inputs for a [`Cylinder`].
pub struct CylinderSetup {
    /// Label of the owning constraint, carried into errors and log lines.
    pub label: String,
    /// Static spatial base, `None` in the zero-dimensional case where
    /// points carry a time coordinate only.
    pub base: Option<Array2<f64>>,
    /// Whether the buffer extrudes along a time axis.
    pub time_dependent: bool,
    /// Temporal samples per base point, `None` when time-independent.
    pub nsamples_1d: Option<usize>,
    /// Configured training batch size.
    pub batchsize: usize,
    /// Sampling mode for temporal values.
    pub mode: SampleMode,
    /// Optional transform applied to raw batch slices.
    pub custom_batch: Option<Arc<dyn CustomBatch>>,
    /// Whether a grading policy will expand and contract this buffer.
    pub grading: bool,
    /// Trailing reference columns carried by the base's rows.
    pub reference_size: usize,
    /// Seed for the buffer's sample and shuffle stream.
    pub seed: u64,
}

/// Temporal structure of a buffer.
#[derive(Debug, Clone, Copy)]
enum TimeAxis {
    /// No time column; the buffer is the shuffled base itself.
    Static,
    /// Extruded along time.
    Extruded {
        nsamples_1d: usize,
        structural_maxlevel: u32,
    },
}

/// An expandable sample buffer over one constraint's time cylinder.
///
/// The buffer is exclusively owned: nothing outside holds a live view into
/// it across an `expand`, `contract`, `advance` or `batch` call.
pub struct Cylinder {
    label: String,
    base: Option<Array2<f64>>,
    axis: TimeAxis,
    batchsize: usize,
    reference_size: usize,
    indim: usize,
    custom_batch: Option<Arc<dyn CustomBatch>>,
    segment: UnitSegment,
    stepsize: Option<f64>,
    shelf: Option<f64>,
    sampleset: Option<Array2<f64>>,
    level: u32,
    cursor: usize,
    age_counter: usize,
    epoch_marker: bool,
}

impl std::fmt::Debug for Cylinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cylinder")
            .field("label", &self.label)
            .field("axis", &self.axis)
            .field("batchsize", &self.batchsize)
            .field("level", &self.level)
            .field("cursor", &self.cursor)
            .field("custom_batch", &self.custom_batch.is_some())
            .finish()
    }
}

impl Cylinder {
    /// Builds an empty cylinder; call [`init`](Self::init) or
    /// [`init_static`](Self::init_static) to populate it.
    ///
    /// # Errors
    ///
    /// Fails on an indivisible custom-batch divisor, a missing base for a
    /// time-independent buffer, reference columns wider than the base,
    /// fewer than two temporal samples, or non-power-of-two sizes when
    /// grading is requested.
    pub fn new(setup: CylinderSetup) -> PinnResult<Self> {
        let CylinderSetup {
            label,
            base,
            time_dependent,
            nsamples_1d,
            batchsize,
            mode,
            custom_batch,
            grading,
            reference_size,
            seed,
        } = setup;

        let batchsize = match &custom_batch {
            Some(transform) => {
                let divisor = transform.divisor();
                if divisor == 0 || batchsize % divisor != 0 {
                    return Err(PinnTrainingError::BatchDivisor {
                        label,
                        batchsize,
                        divisor,
                    });
                }
                batchsize / divisor
            }
            None => batchsize,
        };

        let (indim, size) = match &base {
            None => {
                if !time_dependent {
                    return Err(PinnTrainingError::Config {
                        message: format!(
                            "constraint {label:?}: time-independent buffer requires a base sample set"
                        ),
                    });
                }
                (0, 1)
            }
            Some(base) => {
                if base.ncols() <= reference_size {
                    return Err(PinnTrainingError::ReferenceColumns {
                        label,
                        columns: base.ncols(),
                        reference_size,
                    });
                }
                (base.ncols() - reference_size, base.nrows())
            }
        };

        let axis = if time_dependent {
            let Some(n1) = nsamples_1d else {
                return Err(PinnTrainingError::Config {
                    message: format!(
                        "constraint {label:?}: time-dependent buffer requires nsamples_1d"
                    ),
                });
            };
            if n1 < 2 {
                return Err(PinnTrainingError::TemporalDensity {
                    label,
                    nsamples: n1,
                });
            }
            if grading {
                if !n1.is_power_of_two() {
                    return Err(PinnTrainingError::GradedSizeNotPow2 {
                        label,
                        what: "nsamples_1d",
                        value: n1,
                    });
                }
                if !size.is_power_of_two() {
                    return Err(PinnTrainingError::GradedSizeNotPow2 {
                        label,
                        what: "base size",
                        value: size,
                    });
                }
            }
            let batches_per_age = size * n1 / batchsize;
            if batches_per_age < BATCHES_PER_AGE_FLOOR {
                warn!(
                    constraint = %label,
                    batches_per_age,
                    base_size = size,
                    nsamples_1d = n1,
                    "few batches per age; shrink the batch size or raise the sample density"
                );
            }
            TimeAxis::Extruded {
                nsamples_1d: n1,
                structural_maxlevel: (size * n1).ilog2(),
            }
        } else {
            TimeAxis::Static
        };

        Ok(Self {
            label,
            base,
            axis,
            batchsize,
            reference_size,
            indim,
            custom_batch,
            segment: UnitSegment::new(mode, seed),
            stepsize: None,
            shelf: None,
            sampleset: None,
            level: 0,
            cursor: 0,
            age_counter: 0,
            epoch_marker: false,
        })
    }

    /// Populates the buffer over `[tinit, tinit + stepsize + shelf]` and
    /// shuffles it once. May be called again at any point to resample over
    /// a new window while keeping the base.
    ///
    /// In regular mode every base point is copied at each value of an even
    /// temporal partition. Otherwise the first two copies are pinned to the
    /// exact step endpoints `tinit` and `tinit + stepsize`, and the rest of
    /// the buffer draws each row's time from the whole window.
    ///
    /// # Errors
    ///
    /// Fails on a time-independent buffer.
    pub fn init(&mut self, tinit: f64, stepsize: f64, shelf: f64) -> PinnResult<()> {
        self.populate(tinit, stepsize, shelf)?;
        self.shuffle();
        Ok(())
    }

    /// Populates a time-independent buffer with a shuffled copy of its base.
    ///
    /// # Errors
    ///
    /// Fails on a time-dependent buffer.
    pub fn init_static(&mut self) -> PinnResult<()> {
        if self.time_dependent() {
            return Err(PinnTrainingError::Config {
                message: format!(
                    "constraint {:?}: time-dependent buffer takes init(tinit, stepsize, shelf)",
                    self.label
                ),
            });
        }
        // The constructor guarantees a base in the static case.
        let Some(base) = self.base.as_ref() else {
            return Err(PinnTrainingError::Uninitialized {
                label: self.label.clone(),
                what: "cylinder",
            });
        };
        self.sampleset = Some(base.clone());
        self.cursor = 0;
        self.level = 0;
        self.age_counter = 0;
        self.shuffle();
        Ok(())
    }

    /// Drops the buffer contents at the end of a phase.
    pub fn deinit(&mut self) {
        self.sampleset = None;
    }

    /// Raises the level by one and pushes the new level's row segments one
    /// multiple of the step size deeper into the future.
    ///
    /// # Errors
    ///
    /// Fails past the structural maximum level, past the hard word-size
    /// ceiling, or on a time-independent buffer.
    pub fn expand(&mut self) -> PinnResult<()> {
        let TimeAxis::Extruded {
            structural_maxlevel,
            ..
        } = self.axis
        else {
            return Err(PinnTrainingError::TimeIndependentAdvance {
                label: self.label.clone(),
            });
        };
        if self.level == HARD_MAXLEVEL {
            return Err(PinnTrainingError::LevelCeiling {
                label: self.label.clone(),
            });
        }
        if self.level == structural_maxlevel {
            return Err(PinnTrainingError::StructuralLimit {
                label: self.label.clone(),
                level: (self.level + 1) as usize,
                maxlevel: structural_maxlevel as usize,
            });
        }
        self.level += 1;
        self.shift_segments(false)
    }

    /// Applies the current level's row segments with the delta negated,
    /// restoring what the matching [`expand`](Self::expand) displaced, then
    /// lowers the level by one.
    ///
    /// # Errors
    ///
    /// Fails at level zero.
    pub fn contract(&mut self) -> PinnResult<()> {
        if self.level == 0 {
            return Err(PinnTrainingError::LevelFloor {
                label: self.label.clone(),
            });
        }
        self.shift_segments(true)?;
        self.level -= 1;
        Ok(())
    }

    /// Translates the whole time column by `dt`, or by the buffer's own
    /// step size when `dt` is `None`, and zeroes the age counter. The
    /// window keeps the width imposed at `init`.
    ///
    /// # Errors
    ///
    /// Fails on a time-independent or uninitialized buffer.
    pub fn advance(&mut self, dt: Option<f64>) -> PinnResult<()> {
        if !self.time_dependent() {
            return Err(PinnTrainingError::TimeIndependentAdvance {
                label: self.label.clone(),
            });
        }
        let delta = match dt {
            Some(dt) => dt,
            None => self.stepsize.ok_or_else(|| PinnTrainingError::Uninitialized {
                label: self.label.clone(),
                what: "cylinder",
            })?,
        };
        let Some(sampleset) = self.sampleset.as_mut() else {
            return Err(PinnTrainingError::Uninitialized {
                label: self.label.clone(),
                what: "cylinder",
            });
        };
        let mut column = sampleset.column_mut(self.indim);
        column += delta;
        self.age_counter = 0;
        Ok(())
    }

    /// Serves the next batch as `(inputs, reference)`.
    ///
    /// Slices `batchsize` contiguous rows at the cursor. When the next read
    /// would run off the end, the remainder is discarded, the buffer
    /// reshuffles, the age counter increments and the epoch marker is set.
    /// A custom batch transform, if installed, is applied to the raw slice.
    /// Trailing reference columns, if declared, are split off after the
    /// time column.
    ///
    /// # Errors
    ///
    /// Fails on an uninitialized buffer.
    pub fn batch(&mut self) -> PinnResult<(Array2<f64>, Option<Array2<f64>>)> {
        let Some(sampleset) = self.sampleset.as_ref() else {
            return Err(PinnTrainingError::Uninitialized {
                label: self.label.clone(),
                what: "cylinder",
            });
        };
        let rows = sampleset.nrows();
        let beg = self.cursor.min(rows);
        let end = (self.cursor + self.batchsize).min(rows);
        let mut raw = sampleset.slice(s![beg..end, ..]).to_owned();
        self.cursor += self.batchsize;
        if self.cursor + self.batchsize > rows {
            self.shuffle();
            self.cursor = 0;
            self.age_counter += 1;
            self.epoch_marker = true;
        }
        if let Some(transform) = self.custom_batch.as_ref() {
            raw = transform.apply(raw);
        }
        if self.reference_size > 0 {
            let at = if self.time_dependent() {
                self.indim + 1
            } else {
                self.indim
            };
            let inputs = raw.slice(s![.., ..at]).to_owned();
            let reference = raw.slice(s![.., at..]).to_owned();
            Ok((inputs, Some(reference)))
        } else {
            Ok((raw, None))
        }
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

    /// Current expansion level.
    #[inline]
    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    /// The level past which expansion is structurally impossible, `None`
    /// for time-independent buffers.
    #[must_use]
    pub fn structural_maxlevel(&self) -> Option<u32> {
        match self.axis {
            TimeAxis::Static => None,
            TimeAxis::Extruded {
                structural_maxlevel,
                ..
            } => Some(structural_maxlevel),
        }
    }

    /// Whether the buffer carries a time column.
    #[inline]
    #[must_use]
    pub fn time_dependent(&self) -> bool {
        matches!(self.axis, TimeAxis::Extruded { .. })
    }

    /// Effective batch size after any custom-batch divisor.
    #[inline]
    #[must_use]
    pub fn batchsize(&self) -> usize {
        self.batchsize
    }

    /// Buffer row count, zero before `init`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.sampleset.as_ref().map_or(0, Array2::nrows)
    }

    /// Input dimension of the base, excluding time and reference columns.
    #[inline]
    #[must_use]
    pub fn indim(&self) -> usize {
        self.indim
    }

    /// Extent of the sampled time window, step plus shelf.
    #[must_use]
    pub fn measure_1d(&self) -> f64 {
        self.stepsize.unwrap_or(0.0) + self.shelf.unwrap_or(0.0)
    }

    /// The constraint label this buffer serves.
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The whole sample set, for diagnostics and monitors.
    #[inline]
    #[must_use]
    pub fn points(&self) -> Option<&Array2<f64>> {
        self.sampleset.as_ref()
    }

    /// Builds the buffer contents and resets cursor, level and age, without
    /// the finalizing shuffle.
    fn populate(&mut self, tinit: f64, stepsize: f64, shelf: f64) -> PinnResult<()> {
        let TimeAxis::Extruded { nsamples_1d, .. } = self.axis else {
            return Err(PinnTrainingError::Config {
                message: format!(
                    "constraint {:?}: time-independent buffer takes init_static",
                    self.label
                ),
            });
        };
        self.stepsize = Some(stepsize);
        self.shelf = Some(shelf);
        let textent = stepsize + shelf;
        let indim = self.indim;

        let sampleset = match self.base.as_ref() {
            None => {
                // Zero-dimensional case: the buffer is the time sample itself.
                let unit = self.segment.sample(nsamples_1d, true)?;
                let mut x = Array2::zeros((nsamples_1d, 1));
                for (i, u) in unit.iter().enumerate() {
                    x[[i, 0]] = tinit + textent * u;
                }
                x
            }
            Some(base) => {
                let size = base.nrows();
                let cols = indim + 1 + self.reference_size;
                let mut x = Array2::zeros((size * nsamples_1d, cols));
                if self.segment.mode() == SampleMode::Regular {
                    let unit = self.segment.sample(nsamples_1d, true)?;
                    for (k, u) in unit.iter().enumerate() {
                        let t = tinit + textent * u;
                        splice_block(&mut x, base, indim, k * size, |_| t);
                    }
                } else {
                    // Pin the first two copies to the exact step endpoints,
                    // then draw each remaining row's time from the window.
                    for (k, t) in [tinit, tinit + stepsize].into_iter().enumerate() {
                        splice_block(&mut x, base, indim, k * size, |_| t);
                    }
                    for k in 2..nsamples_1d {
                        let unit = self.segment.sample(size, false)?;
                        splice_block(&mut x, base, indim, k * size, |r| tinit + textent * unit[r]);
                    }
                }
                x
            }
        };

        self.sampleset = Some(sampleset);
        self.cursor = 0;
        self.level = 0;
        self.age_counter = 0;
        Ok(())
    }

    /// Shifts the current level's row segments along the time column, the
    /// shared body of expand and contract.
    fn shift_segments(&mut self, contract: bool) -> PinnResult<()> {
        let Some(stepsize) = self.stepsize else {
            return Err(PinnTrainingError::Uninitialized {
                label: self.label.clone(),
                what: "cylinder",
            });
        };
        let Some(sampleset) = self.sampleset.as_mut() else {
            return Err(PinnTrainingError::Uninitialized {
                label: self.label.clone(),
                what: "cylinder",
            });
        };
        let dt = if contract { -stepsize } else { stepsize };
        let rows = sampleset.nrows();
        let p = 1_u64 << self.level;
        let mut beg = 0_usize;
        let mut end = shr_sat(rows, p);
        let p = p >> 1;
        let m = shr_sat(rows, p);
        let shift = p as f64 * dt;
        let itime = self.indim;
        for _ in 0..self.level {
            let lo = beg.min(rows);
            let hi = end.min(rows);
            let mut column = sampleset.slice_mut(s![lo..hi, itime]);
            column += shift;
            beg += m;
            end += m;
        }
        Ok(())
    }

    /// Reorders the buffer rows with the cylinder's own stream.
    fn shuffle(&mut self) {
        if let Some(sampleset) = self.sampleset.take() {
            let perm = self.segment.permutation(sampleset.nrows());
            self.sampleset = Some(sampleset.select(Axis(0), &perm));
        }
    }
}

/// Writes one copy of the base into `x` at row offset `at`, splicing the
/// time column between the coordinates and any reference columns.
fn splice_block<F: Fn(usize) -> f64>(
    x: &mut Array2<f64>,
    base: &Array2<f64>,
    indim: usize,
    at: usize,
    time_of: F,
) {
    let refs = base.ncols() - indim;
    for r in 0..base.nrows() {
        for c in 0..indim {
            x[[at + r, c]] = base[[r, c]];
        }
        x[[at + r, indim]] = time_of(r);
        for c in 0..refs {
            x[[at + r, indim + 1 + c]] = base[[r, indim + c]];
        }
    }
}

/// Right shift that saturates to zero past the word size, matching the
/// arbitrary-width arithmetic the segment recursion is defined with.
#[inline]
fn shr_sat(n: usize, shift: u64) -> usize {
    if shift >= u64::from(usize::BITS) {
        0
    } else {
        n >> shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    fn line_base(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 1), |(r, _)| 10.0 + r as f64)
    }

    fn setup(base: Option<Array2<f64>>, n1: usize, batchsize: usize) -> CylinderSetup {
        CylinderSetup {
            label: "interior".to_string(),
            base,
            time_dependent: true,
            nsamples_1d: Some(n1),
            batchsize,
            mode: SampleMode::Pseudo,
            custom_batch: None,
            grading: false,
            reference_size: 0,
            seed: 17,
        }
    }

    fn time_column(cyl: &Cylinder) -> Array1<f64> {
        cyl.points().unwrap().column(cyl.indim()).to_owned()
    }

    #[test]
    fn expand_shifts_leading_rows_by_one_step() {
        let base = array![[10.0], [20.0]];
        let mut cyl = Cylinder::new(CylinderSetup {
            mode: SampleMode::Regular,
            ..setup(Some(base), 4, 2)
        })
        .unwrap();
        // Unshuffled layout: one base copy per partition value.
        cyl.populate(0.0, 1.0, 0.0).unwrap();
        let third = 1.0 / 3.0;
        assert_eq!(
            time_column(&cyl).to_vec(),
            vec![0.0, 0.0, third, third, 2.0 * third, 2.0 * third, 1.0, 1.0]
        );

        cyl.expand().unwrap();
        assert_eq!(cyl.level(), 1);
        assert_eq!(
            time_column(&cyl).to_vec(),
            vec![1.0, 1.0, third, third, 2.0 * third, 2.0 * third, 1.0, 1.0]
        );

        cyl.contract().unwrap();
        assert_eq!(cyl.level(), 0);
        assert_eq!(
            time_column(&cyl).to_vec(),
            vec![0.0, 0.0, third, third, 2.0 * third, 2.0 * third, 1.0, 1.0]
        );
    }

    #[test]
    fn deep_levels_degenerate_to_empty_segments() {
        // With 8 rows, levels 2 and 3 partition into zero-length segments
        // and leave the buffer untouched.
        let base = array![[10.0], [20.0]];
        let mut cyl = Cylinder::new(CylinderSetup {
            mode: SampleMode::Regular,
            ..setup(Some(base), 4, 2)
        })
        .unwrap();
        cyl.populate(0.0, 1.0, 0.0).unwrap();
        cyl.expand().unwrap();
        let after_one = time_column(&cyl);
        cyl.expand().unwrap();
        assert_eq!(time_column(&cyl), after_one);
        cyl.expand().unwrap();
        assert_eq!(cyl.level(), 3);
        assert_eq!(time_column(&cyl), after_one);
    }

    #[test]
    fn expand_contract_round_trip_is_exact() {
        // Dyadic step and partition make every shift exact in binary
        // floating point, so the round trip restores the buffer bit for bit.
        let mut cyl = Cylinder::new(CylinderSetup {
            mode: SampleMode::Regular,
            ..setup(Some(line_base(8)), 5, 8)
        })
        .unwrap();
        cyl.init(0.0, 0.25, 0.0).unwrap();
        let snapshot = cyl.points().unwrap().clone();

        cyl.expand().unwrap();
        cyl.expand().unwrap();
        cyl.contract().unwrap();
        cyl.contract().unwrap();

        assert_eq!(cyl.level(), 0);
        assert_eq!(cyl.points().unwrap(), &snapshot);
    }

    #[test]
    fn full_depth_round_trip_stays_close() {
        let mut cyl = Cylinder::new(CylinderSetup {
            grading: true,
            ..setup(Some(line_base(16)), 4, 16)
        })
        .unwrap();
        cyl.init(0.5, 0.1, 0.02).unwrap();
        assert_eq!(cyl.structural_maxlevel(), Some(6));
        let snapshot = cyl.points().unwrap().clone();

        for _ in 0..6 {
            cyl.expand().unwrap();
        }
        assert!(matches!(
            cyl.expand(),
            Err(PinnTrainingError::StructuralLimit { maxlevel: 6, .. })
        ));
        for _ in 0..6 {
            cyl.contract().unwrap();
        }

        assert_eq!(cyl.level(), 0);
        for (a, b) in cyl.points().unwrap().iter().zip(snapshot.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn contract_below_ground_fails() {
        let mut cyl = Cylinder::new(setup(Some(line_base(8)), 4, 8)).unwrap();
        cyl.init(0.0, 0.1, 0.0).unwrap();
        assert!(matches!(
            cyl.contract(),
            Err(PinnTrainingError::LevelFloor { .. })
        ));
    }

    #[test]
    fn batch_cursor_wraps_and_sets_marker() {
        let mut cyl = Cylinder::new(setup(Some(line_base(8)), 4, 8)).unwrap();
        cyl.init(0.0, 0.1, 0.0).unwrap();
        assert_eq!(cyl.size(), 32);

        for _ in 0..3 {
            let (inputs, reference) = cyl.batch().unwrap();
            assert_eq!(inputs.shape(), &[8, 2]);
            assert!(reference.is_none());
            assert!(!cyl.epoch_marker());
            assert_eq!(cyl.age(), 0);
        }
        let _ = cyl.batch().unwrap();
        assert!(cyl.epoch_marker());
        assert_eq!(cyl.age(), 1);

        // The buffer reshuffled and keeps serving.
        let (inputs, _) = cyl.batch().unwrap();
        assert_eq!(inputs.nrows(), 8);
    }

    #[test]
    fn batch_splits_reference_columns() {
        // Base rows carry (x, 10x, 100x); the trailing two are references.
        let base = Array2::from_shape_fn((8, 3), |(r, c)| {
            let x = r as f64;
            x * 10_f64.powi(c as i32)
        });
        let mut cyl = Cylinder::new(CylinderSetup {
            reference_size: 2,
            ..setup(Some(base), 4, 8)
        })
        .unwrap();
        assert_eq!(cyl.indim(), 1);
        cyl.init(0.0, 0.1, 0.0).unwrap();

        let (inputs, reference) = cyl.batch().unwrap();
        let reference = reference.unwrap();
        assert_eq!(inputs.shape(), &[8, 2]);
        assert_eq!(reference.shape(), &[8, 2]);
        for r in 0..8 {
            let x = inputs[[r, 0]];
            assert_eq!(reference[[r, 0]], 10.0 * x);
            assert_eq!(reference[[r, 1]], 100.0 * x);
        }
    }

    struct Doubler;

    impl CustomBatch for Doubler {
        fn divisor(&self) -> usize {
            2
        }

        fn apply(&self, raw: Array2<f64>) -> Array2<f64> {
            ndarray::concatenate(Axis(0), &[raw.view(), raw.view()]).unwrap()
        }
    }

    #[test]
    fn custom_batch_transform_applies() {
        let mut cyl = Cylinder::new(CylinderSetup {
            custom_batch: Some(Arc::new(Doubler)),
            ..setup(Some(line_base(8)), 4, 8)
        })
        .unwrap();
        assert_eq!(cyl.batchsize(), 4);
        cyl.init(0.0, 0.1, 0.0).unwrap();

        let (inputs, _) = cyl.batch().unwrap();
        assert_eq!(inputs.nrows(), 8);
        for r in 0..4 {
            assert_eq!(inputs.row(r), inputs.row(r + 4));
        }
    }

    #[test]
    fn custom_batch_divisor_must_divide() {
        let err = Cylinder::new(CylinderSetup {
            custom_batch: Some(Arc::new(Doubler)),
            ..setup(Some(line_base(8)), 4, 9)
        })
        .unwrap_err();
        assert!(matches!(
            err,
            PinnTrainingError::BatchDivisor {
                batchsize: 9,
                divisor: 2,
                ..
            }
        ));
    }

    #[test]
    fn advance_translates_time_and_resets_age() {
        let mut cyl = Cylinder::new(setup(Some(line_base(8)), 4, 8)).unwrap();
        cyl.init(0.0, 0.5, 0.0).unwrap();
        for _ in 0..4 {
            let _ = cyl.batch().unwrap();
        }
        assert_eq!(cyl.age(), 1);
        assert!(cyl.epoch_marker());

        let before = time_column(&cyl);
        cyl.advance(None).unwrap();
        let after = time_column(&cyl);
        for (b, a) in before.iter().zip(after.iter()) {
            assert!((a - b - 0.5).abs() < 1e-12);
        }
        assert_eq!(cyl.age(), 0);
        // The marker survives an advance; only the aggregate clears it.
        assert!(cyl.epoch_marker());
    }

    #[test]
    fn time_independent_buffer_serves_static_base() {
        let base = Array2::from_shape_fn((32, 2), |(r, c)| r as f64 + c as f64);
        let mut cyl = Cylinder::new(CylinderSetup {
            time_dependent: false,
            nsamples_1d: None,
            ..setup(Some(base), 2, 8)
        })
        .unwrap();
        cyl.init_static().unwrap();
        assert_eq!(cyl.size(), 32);

        let (inputs, reference) = cyl.batch().unwrap();
        assert_eq!(inputs.shape(), &[8, 2]);
        assert!(reference.is_none());

        assert!(matches!(
            cyl.advance(None),
            Err(PinnTrainingError::TimeIndependentAdvance { .. })
        ));
        assert!(matches!(
            cyl.expand(),
            Err(PinnTrainingError::TimeIndependentAdvance { .. })
        ));
    }

    #[test]
    fn zero_dimensional_buffer_covers_the_window() {
        let mut cyl = Cylinder::new(setup(None, 8, 2)).unwrap();
        cyl.init(1.0, 0.5, 0.25).unwrap();
        let points = cyl.points().unwrap();
        assert_eq!(points.shape(), &[8, 1]);
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for t in points.iter() {
            lo = lo.min(*t);
            hi = hi.max(*t);
        }
        // Corner pinning spans the full window including the shelf.
        assert_eq!(lo, 1.0);
        assert_eq!(hi, 1.75);
    }

    #[test]
    fn pseudo_mode_pins_step_endpoints() {
        let mut cyl = Cylinder::new(setup(Some(line_base(4)), 4, 4)).unwrap();
        cyl.init(2.0, 0.5, 0.25).unwrap();
        let times = time_column(&cyl);
        let at_start = times.iter().filter(|t| **t == 2.0).count();
        let at_step_end = times.iter().filter(|t| **t == 2.5).count();
        assert!(at_start >= 4);
        assert!(at_step_end >= 4);
        assert!(times.iter().all(|t| (2.0..=2.75).contains(t)));
    }

    #[test]
    fn graded_construction_requires_pow2() {
        let err = Cylinder::new(CylinderSetup {
            grading: true,
            ..setup(Some(line_base(12)), 4, 8)
        })
        .unwrap_err();
        assert!(matches!(
            err,
            PinnTrainingError::GradedSizeNotPow2 {
                what: "base size",
                value: 12,
                ..
            }
        ));

        let err = Cylinder::new(CylinderSetup {
            grading: true,
            ..setup(Some(line_base(16)), 6, 8)
        })
        .unwrap_err();
        assert!(matches!(
            err,
            PinnTrainingError::GradedSizeNotPow2 {
                what: "nsamples_1d",
                value: 6,
                ..
            }
        ));
    }

    #[test]
    fn single_temporal_sample_rejected() {
        let err = Cylinder::new(setup(Some(line_base(8)), 1, 8)).unwrap_err();
        assert!(matches!(
            err,
            PinnTrainingError::TemporalDensity { nsamples: 1, .. }
        ));
    }

    #[test]
    fn missing_base_requires_time_dependence() {
        let err = Cylinder::new(CylinderSetup {
            time_dependent: false,
            nsamples_1d: None,
            ..setup(None, 2, 8)
        })
        .unwrap_err();
        assert!(matches!(err, PinnTrainingError::Config { .. }));
    }

    #[test]
    fn batch_before_init_fails() {
        let mut cyl = Cylinder::new(setup(Some(line_base(8)), 4, 8)).unwrap();
        assert!(matches!(
            cyl.batch(),
            Err(PinnTrainingError::Uninitialized { .. })
        ));
        assert_eq!(cyl.size(), 0);
        assert_eq!(cyl.measure_1d(), 0.0);
    }
}
