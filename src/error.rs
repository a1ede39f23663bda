//! Error types for the sampling and orchestration core.
//!
//! # Why One Crate-Wide Enum?
//!
//! Every failure this core can produce is a programming or configuration
//! error detected at a precondition: there is nothing to retry, no partial
//! result to salvage, and no clamping that would be sound. A single enum with
//! struct variants keeps full context (constraint label, offending level,
//! violated bound) attached to the error at the site that detected it, so the
//! caller sees exactly which upstream configuration to fix.
//!
//! Quality concerns that do not invalidate the run (a time horizon that can
//! only approximately hit a requested final time, a buffer with few batches
//! per age) are *not* errors; they are emitted as `tracing::warn!` events at
//! the point of detection.

use thiserror::Error;

/// Errors raised by the sampling buffers, time arithmetic, moment lattices,
/// and the stride/phase orchestration around them.
#[derive(Debug, Error)]
pub enum PinnTrainingError {
    /// An expand was requested past the structural ceiling of a cylinder.
    ///
    /// The ceiling is `floor(log2(buffer rows))`; deeper levels have no rows
    /// left to partition. Hitting this usually means the grading policy asks
    /// for more depth than the sample density supports.
    #[error("constraint '{label}': expand past structural maxlevel {maxlevel} (level {level})")]
    StructuralLimit {
        /// Label of the constraint whose cylinder rejected the expand.
        label: String,
        /// Level the expand would have produced.
        level: usize,
        /// The cylinder's structural maximum level.
        maxlevel: usize,
    },

    /// An expand was requested past the hard word-size ceiling (level 63).
    #[error("constraint '{label}': expand past hard level ceiling")]
    LevelCeiling {
        /// Label of the constraint whose cylinder rejected the expand.
        label: String,
    },

    /// A contract was requested at level zero.
    #[error("constraint '{label}': contract below level 0")]
    LevelFloor {
        /// Label of the constraint whose cylinder rejected the contract.
        label: String,
    },

    /// A time advance was requested on a time-independent buffer.
    #[error("constraint '{label}': cannot advance a time-independent sample set")]
    TimeIndependentAdvance {
        /// Label of the offending constraint.
        label: String,
    },

    /// A graded cylinder requires power-of-two sizes.
    #[error("constraint '{label}': {what} = {value} must be a power of 2 for graded training")]
    GradedSizeNotPow2 {
        /// Label of the offending constraint.
        label: String,
        /// Which size failed the check (`"base size"`, `"nsamples_1d"`,
        /// `"steps per stride"`).
        what: &'static str,
        /// The offending value.
        value: usize,
    },

    /// Too few temporal samples to cover both step endpoints.
    #[error("constraint '{label}': nsamples_1d = {nsamples} but at least 2 are required")]
    TemporalDensity {
        /// Label of the offending constraint.
        label: String,
        /// The requested temporal sample count.
        nsamples: usize,
    },

    /// Reference columns exceed the base array's width.
    #[error("constraint '{label}': {reference_size} reference columns in a base of {columns} columns")]
    ReferenceColumns {
        /// Label of the offending constraint.
        label: String,
        /// Total columns in the base array.
        columns: usize,
        /// Declared number of trailing reference columns.
        reference_size: usize,
    },

    /// A custom batch transform's divisor does not divide the batch size.
    #[error("constraint '{label}': batchsize {batchsize} is not divisible by custom batch divisor {divisor}")]
    BatchDivisor {
        /// Label of the offending constraint.
        label: String,
        /// Configured batch size.
        batchsize: usize,
        /// The transform's divisor.
        divisor: usize,
    },

    /// An operation touched a buffer before `init` or after `deinit`.
    #[error("{what} '{label}' is not initialized")]
    Uninitialized {
        /// Label of the buffer.
        label: String,
        /// Kind of buffer (`"cylinder"`, `"ic base"`, ...).
        what: &'static str,
    },

    /// A moment lookup time fell outside the lattice's temporal range.
    #[error("moment '{label}': t = {t} outside lattice range [{tinit}, {tmax}]")]
    MomentRange {
        /// Field/solution label of the lattice.
        label: String,
        /// The requested time.
        t: f64,
        /// Start of the lattice's temporal range.
        tinit: f64,
        /// End of the lattice's temporal range.
        tmax: f64,
    },

    /// A moment lookup time does not align with a lattice slot.
    #[error("moment '{label}': t = {t} is {offset:e} from slot {slot} (tolerance {tolerance:e})")]
    MomentAlignment {
        /// Field/solution label of the lattice.
        label: String,
        /// The requested time.
        t: f64,
        /// The nearest slot index.
        slot: usize,
        /// Distance from the slot time.
        offset: f64,
        /// The permitted misalignment.
        tolerance: f64,
    },

    /// A moment lookup referenced an unknown lattice label.
    #[error("moment '{label}': no such lattice")]
    MomentLabel {
        /// The unknown label.
        label: String,
    },

    /// An inconsistent run configuration.
    #[error("configuration: {message}")]
    Config {
        /// Description of the inconsistency.
        message: String,
    },

    /// A collaborator (surrogate evaluation, source sampling, moment method)
    /// reported a failure.
    #[error("collaborator failure in {context}: {message}")]
    Collaborator {
        /// Where the collaborator was invoked.
        context: &'static str,
        /// The collaborator's report.
        message: String,
    },

    /// Reading or writing a configuration file failed.
    #[error("config file I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing a TOML configuration failed.
    #[error("config parse: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Serializing a configuration to TOML failed.
    #[error("config serialize: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Serializing metrics to JSON failed.
    #[error("metrics serialize: {0}")]
    MetricsSerialize(#[from] serde_json::Error),
}

/// Coarse classification of an error, for reporting and triage.
///
/// There is deliberately no "retryable" class: every condition in this core
/// is deterministic, so a failed precondition will fail identically on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A buffer's structural invariants were violated (levels, sizes).
    Structural,
    /// The run configuration is inconsistent.
    Configuration,
    /// A lattice lookup fell outside its domain.
    Lookup,
    /// An external collaborator failed.
    Collaborator,
    /// A serialization surface failed.
    Serialization,
}

impl ErrorCategory {
    /// Short human-readable name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Configuration => "configuration",
            Self::Lookup => "lookup",
            Self::Collaborator => "collaborator",
            Self::Serialization => "serialization",
        }
    }
}

impl PinnTrainingError {
    /// Classifies the error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StructuralLimit { .. }
            | Self::LevelCeiling { .. }
            | Self::LevelFloor { .. }
            | Self::TimeIndependentAdvance { .. }
            | Self::Uninitialized { .. } => ErrorCategory::Structural,
            Self::GradedSizeNotPow2 { .. }
            | Self::TemporalDensity { .. }
            | Self::ReferenceColumns { .. }
            | Self::BatchDivisor { .. }
            | Self::Config { .. } => ErrorCategory::Configuration,
            Self::MomentRange { .. }
            | Self::MomentAlignment { .. }
            | Self::MomentLabel { .. } => ErrorCategory::Lookup,
            Self::Collaborator { .. } => ErrorCategory::Collaborator,
            Self::Io(_)
            | Self::ConfigParse(_)
            | Self::ConfigSerialize(_)
            | Self::MetricsSerialize(_) => ErrorCategory::Serialization,
        }
    }

    /// Whether the error points at the run configuration rather than at a
    /// defect inside the core.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }
}

/// Result alias used throughout the crate.
pub type PinnResult<T> = Result<T, PinnTrainingError>;
