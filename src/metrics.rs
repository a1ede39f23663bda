//! Per-run timing and event accounting.
//!
//! One [`RunMetrics`] travels with the engine instead of living in a global
//! registry: two runs in the same process never share a clock, and a test
//! can assert on exactly the run it drove. Recording is gated by a single
//! `enabled` flag so a production run with metrics off pays one branch per
//! event.
//!
//! Timed operations are identified by [`TrainOp`]. The outer operations
//! (init, critical section, communication, increment) partition the run's
//! wall time; the inner ones (train, expand, contract, advance, batch) nest
//! inside the critical section and overlap it by construction.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::PinnResult;
use crate::timing::{Duration, TimingStats};

/// The operations the run clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainOp {
    /// Engine startup: driver construction, horizons, base sampling.
    Init,
    /// One driver's full critical section (all phases, all steps).
    CriticalSection,
    /// Hand-off of the terminal state to the next driver.
    Communication,
    /// Horizon shift, re-derivation, and ring rotation between strides.
    Increment,
    /// Arming one phase's buffers and lattices.
    InitPhase,
    /// One training session (the full iteration loop at one level).
    Train,
    /// One expand across a phase's buffers.
    Expand,
    /// One contract across a phase's buffers.
    Contract,
    /// One time advance across a phase's buffers.
    Advance,
    /// Assembling one training batch.
    Batch,
}

impl TrainOp {
    /// Every operation, in reporting order.
    pub const ALL: [Self; 10] = [
        Self::Init,
        Self::CriticalSection,
        Self::Communication,
        Self::Increment,
        Self::InitPhase,
        Self::Train,
        Self::Expand,
        Self::Contract,
        Self::Advance,
        Self::Batch,
    ];

    /// Stable snake_case name, matching the JSON export keys.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::CriticalSection => "critical_section",
            Self::Communication => "communication",
            Self::Increment => "increment",
            Self::InitPhase => "init_phase",
            Self::Train => "train",
            Self::Expand => "expand",
            Self::Contract => "contract",
            Self::Advance => "advance",
            Self::Batch => "batch",
        }
    }
}

/// Event counts accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Strides completed.
    pub strides: u64,
    /// Steps completed across all strides.
    pub steps: u64,
    /// Buffer expansions performed.
    pub expansions: u64,
    /// Buffer contractions performed.
    pub contractions: u64,
    /// Training iterations across all sessions.
    pub iterations: u64,
    /// Epoch boundaries crossed by the sample buffers.
    pub epochs: u64,
    /// Batches assembled.
    pub batches: u64,
}

/// Timing statistics and counters for one run.
#[derive(Debug, Clone)]
pub struct RunMetrics {
    enabled: bool,
    ops: HashMap<TrainOp, TimingStats>,
    counters: RunCounters,
}

/// Serialization shape for the JSON export.
#[derive(Serialize)]
struct MetricsExport<'a> {
    counters: &'a RunCounters,
    operations: BTreeMap<&'static str, OpExport>,
}

#[derive(Serialize)]
struct OpExport {
    count: u64,
    total_ms: f64,
    average_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl RunMetrics {
    /// Creates a metrics context; a disabled one ignores every event.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ops: HashMap::new(),
            counters: RunCounters::default(),
        }
    }

    /// Creates a context that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Whether events are being recorded.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records one timed sample of an operation.
    pub fn record(&mut self, op: TrainOp, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        self.ops.entry(op).or_default().record(elapsed);
    }

    /// Counts a completed stride.
    pub fn record_stride(&mut self) {
        if self.enabled {
            self.counters.strides += 1;
        }
    }

    /// Counts a completed step.
    pub fn record_step(&mut self) {
        if self.enabled {
            self.counters.steps += 1;
        }
    }

    /// Counts a buffer expansion.
    pub fn record_expansion(&mut self) {
        if self.enabled {
            self.counters.expansions += 1;
        }
    }

    /// Counts a buffer contraction.
    pub fn record_contraction(&mut self) {
        if self.enabled {
            self.counters.contractions += 1;
        }
    }

    /// Counts a training iteration.
    pub fn record_iteration(&mut self) {
        if self.enabled {
            self.counters.iterations += 1;
        }
    }

    /// Counts an epoch boundary.
    pub fn record_epoch(&mut self) {
        if self.enabled {
            self.counters.epochs += 1;
        }
    }

    /// Counts an assembled batch.
    pub fn record_batch(&mut self) {
        if self.enabled {
            self.counters.batches += 1;
        }
    }

    /// Timing statistics for one operation, if it ever ran.
    #[must_use]
    pub fn op_stats(&self, op: TrainOp) -> Option<&TimingStats> {
        self.ops.get(&op)
    }

    /// The accumulated event counts.
    #[must_use]
    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    /// Total time in the outer operations.
    ///
    /// Init, critical section, communication, and increment partition the
    /// run; the nested operations are already inside those and are excluded
    /// to avoid double counting.
    #[must_use]
    pub fn total_time(&self) -> Duration {
        [
            TrainOp::Init,
            TrainOp::CriticalSection,
            TrainOp::Communication,
            TrainOp::Increment,
        ]
        .iter()
        .filter_map(|op| self.ops.get(op))
        .fold(Duration::ZERO, |acc, stats| acc + stats.total)
    }

    /// Exports counters and per-operation statistics as pretty JSON.
    ///
    /// # Errors
    ///
    /// Fails only if JSON serialization fails.
    pub fn to_json(&self) -> PinnResult<String> {
        let operations = TrainOp::ALL
            .iter()
            .filter_map(|&op| {
                self.ops.get(&op).map(|stats| {
                    (
                        op.name(),
                        OpExport {
                            count: stats.count,
                            total_ms: stats.total.as_millis_f64(),
                            average_ms: stats.average_ms(),
                            min_ms: stats.min.as_millis_f64(),
                            max_ms: stats.max.as_millis_f64(),
                        },
                    )
                })
            })
            .collect();
        let export = MetricsExport {
            counters: &self.counters,
            operations,
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Renders a human-readable run summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::from("Run Metrics\n");
        out.push_str(&format!(
            "├─ strides: {}  steps: {}  iterations: {}\n",
            self.counters.strides, self.counters.steps, self.counters.iterations
        ));
        out.push_str(&format!(
            "├─ expansions: {}  contractions: {}  epochs: {}  batches: {}\n",
            self.counters.expansions,
            self.counters.contractions,
            self.counters.epochs,
            self.counters.batches
        ));
        out.push_str(&format!(
            "├─ outer time: {:.2} ms\n",
            self.total_time().as_millis_f64()
        ));
        let timed: Vec<TrainOp> = TrainOp::ALL
            .iter()
            .copied()
            .filter(|op| self.ops.contains_key(op))
            .collect();
        for (i, op) in timed.iter().enumerate() {
            let stats = &self.ops[op];
            let branch = if i + 1 == timed.len() {
                "└─"
            } else {
                "├─"
            };
            out.push_str(&format!(
                "{branch} {}: {} × avg {:.3} ms (total {:.2} ms)\n",
                op.name(),
                stats.count,
                stats.average_ms(),
                stats.total.as_millis_f64()
            ));
        }
        out
    }

    /// Clears all recorded data, keeping the enabled flag.
    pub fn reset(&mut self) {
        self.ops.clear();
        self.counters = RunCounters::default();
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> RunMetrics {
        let mut metrics = RunMetrics::new(true);
        metrics.record(TrainOp::Init, Duration::from_millis(5));
        metrics.record(TrainOp::CriticalSection, Duration::from_millis(40));
        metrics.record(TrainOp::CriticalSection, Duration::from_millis(60));
        metrics.record(TrainOp::Train, Duration::from_millis(30));
        metrics.record_stride();
        metrics.record_step();
        metrics.record_step();
        metrics.record_iteration();
        metrics
    }

    #[test]
    fn disabled_metrics_record_nothing() {
        let mut metrics = RunMetrics::disabled();
        metrics.record(TrainOp::Train, Duration::from_millis(10));
        metrics.record_stride();
        metrics.record_epoch();
        assert!(metrics.op_stats(TrainOp::Train).is_none());
        assert_eq!(*metrics.counters(), RunCounters::default());
    }

    #[test]
    fn record_accumulates_per_op() {
        let metrics = populated();
        let cs = metrics.op_stats(TrainOp::CriticalSection).unwrap();
        assert_eq!(cs.count, 2);
        assert_eq!(cs.total, Duration::from_millis(100));
        assert_eq!(cs.min, Duration::from_millis(40));
        assert_eq!(cs.max, Duration::from_millis(60));
        assert_eq!(metrics.counters().steps, 2);
    }

    #[test]
    fn outer_time_excludes_nested_ops() {
        let metrics = populated();
        // 5 ms init + 100 ms critical section; the 30 ms train nests inside.
        assert_eq!(metrics.total_time(), Duration::from_millis(105));
    }

    #[test]
    fn json_export_has_stable_keys() {
        let metrics = populated();
        let json = metrics.to_json().unwrap();
        assert!(json.contains("\"counters\""));
        assert!(json.contains("\"critical_section\""));
        assert!(json.contains("\"strides\": 1"));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["operations"]["train"]["count"], 1);
        assert!(parsed["operations"].get("expand").is_none());
    }

    #[test]
    fn summary_lists_recorded_ops() {
        let metrics = populated();
        let summary = metrics.summary();
        assert!(summary.contains("strides: 1"));
        assert!(summary.contains("critical_section: 2"));
        assert!(!summary.contains("communication:"));
    }

    #[test]
    fn reset_clears_but_keeps_enabled() {
        let mut metrics = populated();
        metrics.reset();
        assert!(metrics.is_enabled());
        assert!(metrics.op_stats(TrainOp::Init).is_none());
        assert_eq!(metrics.counters().strides, 0);
        metrics.record_stride();
        assert_eq!(metrics.counters().strides, 1);
    }
}
