//! Training strategies: buffer grading and loss weighting.
//!
//! Strategies ride on a [`Phase`](crate::phases::Phase) and modulate how its
//! training sessions run. Grading decides, per step, how many times the
//! sample buffers expand toward the step endpoint before contracting back;
//! weighting attaches per-sample loss weights derived from the time
//! coordinate. Each strategy occupies a fixed, typed slot in [`Strategies`];
//! activation is a plain field check, never name-based discovery.

use std::fmt;
use std::sync::Arc;

use ndarray::Array1;

/// Iteration budget and convergence tolerance for one training session.
///
/// Graded phases carry one kit per expansion level, so shallow levels can
/// run long while deep levels take a few polishing iterations. Levels
/// without a kit fall back to the phase's own budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kit {
    /// Ceiling on training iterations for the session.
    pub max_iterations: usize,
    /// Loss value at or below which the session converges.
    pub tolerance: f64,
}

impl Kit {
    /// Creates a kit with an explicit budget.
    #[must_use]
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }
}

impl Default for Kit {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            tolerance: 1e-10,
        }
    }
}

/// Per-step expansion schedule over a stride.
///
/// `step` counts from 1 within the stride; `steps_per_stride` is the
/// stride's step count, a power of two when grading is active. The returned
/// count is the number of expand calls (each followed by a training session)
/// the driver performs on that step, matched by the same number of
/// contracts.
pub trait GradingPolicy: Send + Sync {
    /// Short name for logs and summaries.
    fn name(&self) -> &'static str;

    /// Number of expansions on the given 1-based step.
    fn nexpand(&self, step: usize, steps_per_stride: usize) -> usize;
}

/// Expands to full depth on the first step of the stride and never again.
///
/// The opening step trains at every level down to the finest slices, after
/// which the remaining steps run flat at level 0 on buffers already carried
/// to depth once.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerGrading;

impl GradingPolicy for EagerGrading {
    fn name(&self) -> &'static str {
        "eager"
    }

    fn nexpand(&self, step: usize, steps_per_stride: usize) -> usize {
        if step == 1 {
            depth(steps_per_stride)
        } else {
            0
        }
    }
}

/// Expands by the binary carry pattern of the step number.
///
/// Step `s` expands `trailing_zeros(s)` times, capped at the stride's full
/// depth: odd steps run flat, every second step goes one level deep, every
/// fourth two levels, and the final step of the stride reaches full depth.
/// Over a stride of `2^k` steps this spends `2^k - 1` expansions in total,
/// front-loading none of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogarithmicGrading;

impl GradingPolicy for LogarithmicGrading {
    fn name(&self) -> &'static str {
        "logarithmic"
    }

    fn nexpand(&self, step: usize, steps_per_stride: usize) -> usize {
        // Steps count from 1; 0 has no trailing-zero reading.
        if step == 0 {
            return 0;
        }
        (step.trailing_zeros() as usize).min(depth(steps_per_stride))
    }
}

/// Full expansion depth of a stride: `floor(log2(steps_per_stride))`.
fn depth(steps_per_stride: usize) -> usize {
    if steps_per_stride <= 1 {
        0
    } else {
        steps_per_stride.ilog2() as usize
    }
}

/// An armed grading strategy: a policy plus per-level training kits.
#[derive(Clone)]
pub struct Grading {
    policy: Arc<dyn GradingPolicy>,
    kits: Vec<Kit>,
}

impl Grading {
    /// Grading with the eager schedule.
    #[must_use]
    pub fn eager() -> Self {
        Self::with_policy(Arc::new(EagerGrading))
    }

    /// Grading with the logarithmic schedule.
    #[must_use]
    pub fn logarithmic() -> Self {
        Self::with_policy(Arc::new(LogarithmicGrading))
    }

    /// Grading with a caller-supplied schedule.
    #[must_use]
    pub fn with_policy(policy: Arc<dyn GradingPolicy>) -> Self {
        Self {
            policy,
            kits: Vec::new(),
        }
    }

    /// Attaches per-level kits; index 0 budgets level 0.
    #[must_use]
    pub fn with_kits(mut self, kits: Vec<Kit>) -> Self {
        self.kits = kits;
        self
    }

    /// Number of expansions on the given 1-based step.
    #[must_use]
    pub fn nexpand(&self, step: usize, steps_per_stride: usize) -> usize {
        self.policy.nexpand(step, steps_per_stride)
    }

    /// The kit budgeting the given level, if one was attached.
    #[must_use]
    pub fn kit(&self, level: u32) -> Option<Kit> {
        self.kits.get(level as usize).copied()
    }

    /// The schedule's name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.policy.name()
    }
}

impl fmt::Debug for Grading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grading")
            .field("policy", &self.policy.name())
            .field("kits", &self.kits)
            .finish()
    }
}

/// Per-sample loss weights derived from the time coordinate.
pub trait WeightingPolicy: Send + Sync {
    /// Short name for logs and summaries.
    fn name(&self) -> &'static str;

    /// Weights for a batch, one per entry of the time column `t`.
    fn weights(&self, t: &Array1<f64>) -> Array1<f64>;
}

/// Weights every sample equally.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformWeighting;

impl WeightingPolicy for UniformWeighting {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn weights(&self, t: &Array1<f64>) -> Array1<f64> {
        Array1::ones(t.len())
    }
}

/// The strategy kinds a phase can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Expand/contract scheduling over the stride.
    Grading,
    /// Per-sample loss weighting.
    Weighting,
}

/// The fixed strategy slots attached to one phase.
///
/// Empty by default; each slot is filled explicitly at construction. The
/// driver and training loop never enumerate strategies, they ask for the
/// slot they understand.
#[derive(Clone, Default)]
pub struct Strategies {
    grading: Option<Grading>,
    weighting: Option<Arc<dyn WeightingPolicy>>,
}

impl Strategies {
    /// No strategies active.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills the grading slot.
    #[must_use]
    pub fn with_grading(mut self, grading: Grading) -> Self {
        self.grading = Some(grading);
        self
    }

    /// Fills the weighting slot.
    #[must_use]
    pub fn with_weighting(mut self, weighting: Arc<dyn WeightingPolicy>) -> Self {
        self.weighting = Some(weighting);
        self
    }

    /// Whether the given slot is filled.
    #[must_use]
    pub fn is_active(&self, kind: StrategyKind) -> bool {
        match kind {
            StrategyKind::Grading => self.grading.is_some(),
            StrategyKind::Weighting => self.weighting.is_some(),
        }
    }

    /// The grading slot.
    #[must_use]
    pub fn grading(&self) -> Option<&Grading> {
        self.grading.as_ref()
    }

    /// The weighting slot.
    #[must_use]
    pub fn weighting(&self) -> Option<&dyn WeightingPolicy> {
        self.weighting.as_deref()
    }
}

impl fmt::Debug for Strategies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategies")
            .field("grading", &self.grading)
            .field(
                "weighting",
                &self.weighting.as_ref().map(|w| w.name()),
            )
            .finish()
    }
}
