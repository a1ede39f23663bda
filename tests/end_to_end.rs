//! End-to-end runs through the public API: a 1-D heat-style problem marched
//! across its horizon by the stride engine with a closed-form surrogate.

use std::sync::{Arc, Mutex};

use ndarray::Array2;
use pinn_stride_trainer_rs::prelude::*;
use pinn_stride_trainer_rs::{Constraint, IntervalSource, ProblemIc, SampleMode, TrainOp};

/// Surrogate that predicts zero everywhere and reports a fixed loss.
struct FlatModel {
    loss: f64,
    train_calls: usize,
}

impl FlatModel {
    fn new(loss: f64) -> Self {
        Self {
            loss,
            train_calls: 0,
        }
    }
}

impl Surrogate for FlatModel {
    fn evaluate(&mut self, points: &Array2<f64>) -> Array2<f64> {
        Array2::zeros((points.nrows(), 1))
    }

    fn train_step(&mut self, _batch: Batch) -> PinnResult<TrainStepResult> {
        self.train_calls += 1;
        Ok(TrainStepResult { loss: self.loss })
    }
}

/// Hooks that append one line per lifecycle event to a shared log.
#[derive(Clone, Default)]
struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn take(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Hooks for EventLog {
    fn on_phase(&mut self, label: &str) {
        self.push(format!("phase {label}"));
    }

    fn on_step(&mut self, step: usize) {
        self.push(format!("step {step}"));
    }

    fn on_expand(&mut self, level: u32) {
        self.push(format!("expand {level}"));
    }

    fn on_contract(&mut self, level: u32) {
        self.push(format!("contract {level}"));
    }

    fn on_train(&mut self, level: u32) {
        self.push(format!("train {level}"));
    }

    fn on_advance(&mut self, dt: f64) {
        self.push(format!("advance {dt}"));
    }
}

/// u_t = u_xx on [0, 1] with a sine initial profile, declared at the given
/// temporal resolution.
fn heat_problem(stepsize: f64) -> Problem {
    let th = TimeHorizon::with_extent(0.0, 0.5).with_stepsize(stepsize);
    Problem::new(vec!["u".to_string()], 1, th)
        .with_constraint(Constraint::new(
            "interior",
            Some(Box::new(IntervalSource::new(
                0.0,
                1.0,
                SampleMode::Pseudo,
                11,
            ))),
        ))
        .with_ic(ProblemIc::new(
            Box::new(IntervalSource::new(0.0, 1.0, SampleMode::Pseudo, 17)),
            Box::new(|points: &Array2<f64>| points.mapv(f64::sin)),
        ))
}

#[test]
fn single_stride_marches_four_flat_steps() {
    let config = RunConfig::builder().stride(1).step(4).batchsize(16).build();
    let phases = vec![Phase::new("sweep").with_max_iterations(2)];
    let log = EventLog::default();
    let events = log.clone();

    let mut engine = StrideEngine::new(heat_problem(0.125), config, FlatModel::new(0.8), phases)
        .unwrap()
        .with_hooks(log);
    let report = engine.run().unwrap();

    assert_eq!(report.strides, 1);
    assert_eq!(report.steps, 4);
    assert!((report.final_time.unwrap() - 0.5).abs() < 1e-12);

    // Without grading every step trains once, at ground level.
    let events = events.take();
    assert_eq!(events.iter().filter(|e| e.starts_with("step")).count(), 4);
    assert_eq!(events.iter().filter(|e| *e == "train 0").count(), 4);
    assert!(!events
        .iter()
        .any(|e| e.starts_with("expand") || e.starts_with("contract")));
    assert_eq!(events.iter().filter(|e| *e == "advance 0.125").count(), 4);

    // Two iterations per session, four sessions.
    assert_eq!(engine.surrogate().train_calls, 8);
}

#[test]
fn warmup_phase_runs_coarse_before_the_polish() {
    // 8 problem steps of 0.0625; the warmup takes them two at a time.
    let config = RunConfig::builder().stride(2).step(4).batchsize(16).build();
    let phases = vec![
        Phase::new("warmup")
            .with_step_multiple(2)
            .with_max_iterations(1),
        Phase::new("polish").with_max_iterations(1),
    ];
    let log = EventLog::default();
    let events = log.clone();

    let mut engine = StrideEngine::new(heat_problem(0.0625), config, FlatModel::new(0.8), phases)
        .unwrap()
        .with_hooks(log);
    let report = engine.run().unwrap();

    assert_eq!(report.strides, 2);
    assert_eq!(report.steps, 8);
    assert!((report.final_time.unwrap() - 0.5).abs() < 1e-12);

    let events = events.take();
    let phases_seen: Vec<&str> = events
        .iter()
        .filter(|e| e.starts_with("phase"))
        .map(String::as_str)
        .collect();
    assert_eq!(
        phases_seen,
        ["phase warmup", "phase polish", "phase warmup", "phase polish"]
    );

    // Per stride: 2 coarse warmup steps, then 4 at problem resolution.
    assert_eq!(events.iter().filter(|e| e.starts_with("step")).count(), 12);
    assert_eq!(events.iter().filter(|e| *e == "advance 0.125").count(), 4);
    assert_eq!(events.iter().filter(|e| *e == "advance 0.0625").count(), 8);
    assert_eq!(engine.metrics().counters().steps, 12);
}

#[test]
fn metrics_narrate_the_whole_run() {
    let config = RunConfig::builder().stride(1).step(4).batchsize(16).build();
    let phases = vec![Phase::new("sweep").with_max_iterations(2)];
    let mut engine =
        StrideEngine::new(heat_problem(0.125), config, FlatModel::new(0.8), phases).unwrap();
    engine.run().unwrap();

    let counters = engine.metrics().counters();
    assert_eq!(counters.strides, 1);
    assert_eq!(counters.steps, 4);
    assert_eq!(counters.iterations, 8);
    assert_eq!(counters.batches, 8);
    assert_eq!(counters.expansions, 0);
    assert_eq!(counters.contractions, 0);

    let critical = engine.metrics().op_stats(TrainOp::CriticalSection).unwrap();
    assert_eq!(critical.count, 1);
    let trains = engine.metrics().op_stats(TrainOp::Train).unwrap();
    assert_eq!(trains.count, 4);
    // A single stride ends at the horizon; nothing is handed off.
    assert!(engine.metrics().op_stats(TrainOp::Communication).is_none());

    let json = engine.metrics().to_json().unwrap();
    assert!(json.contains("\"counters\""));
    assert!(json.contains("critical_section"));
}

#[test]
fn disabled_metrics_leave_the_report_bare() {
    let config = RunConfig::builder()
        .stride(1)
        .step(2)
        .batchsize(16)
        .metrics(false)
        .build();
    let phases = vec![Phase::new("sweep").with_max_iterations(1)];
    let mut engine =
        StrideEngine::new(heat_problem(0.25), config, FlatModel::new(0.8), phases).unwrap();
    let report = engine.run().unwrap();

    assert_eq!(report.steps, 2);
    assert_eq!(report.epochs, 0);
    assert_eq!(engine.metrics().counters().iterations, 0);
    assert!(engine.metrics().op_stats(TrainOp::Train).is_none());
}
