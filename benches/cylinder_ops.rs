//! Cylinder buffer benchmarks.
//!
//! Benchmarks the per-step buffer mutations and batch assembly on the hot
//! path of a training session.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;
use pinn_stride_trainer_rs::cylinder::{Cylinder, CylinderSetup};
use pinn_stride_trainer_rs::horizon::TimeHorizon;
use pinn_stride_trainer_rs::icbase::IcBase;
use pinn_stride_trainer_rs::phases::{Phase, PhaseDefaults};
use pinn_stride_trainer_rs::problem::{Constraint, Problem, ProblemIc};
use pinn_stride_trainer_rs::sampler::{IntervalSource, SampleMode};

fn graded_cylinder(rows: usize, n1: usize) -> Cylinder {
    let base = Array2::from_shape_fn((rows, 1), |(r, _)| r as f64 / rows as f64);
    let mut cylinder = Cylinder::new(CylinderSetup {
        label: "interior".to_string(),
        base: Some(base),
        time_dependent: true,
        nsamples_1d: Some(n1),
        batchsize: 64,
        mode: SampleMode::Pseudo,
        custom_batch: None,
        grading: true,
        reference_size: 0,
        seed: 17,
    })
    .unwrap();
    cylinder.init(0.0, 0.125, 0.0).unwrap();
    cylinder
}

fn benchmark_expand_contract(c: &mut Criterion) {
    let mut cylinder = graded_cylinder(256, 8);

    c.bench_function("cylinder_expand_contract", |b| {
        b.iter(|| {
            cylinder.expand().unwrap();
            cylinder.contract().unwrap();
            black_box(cylinder.level())
        })
    });
}

fn benchmark_batch_assembly(c: &mut Criterion) {
    let mut cylinder = graded_cylinder(256, 8);

    c.bench_function("cylinder_batch", |b| {
        b.iter(|| black_box(cylinder.batch().unwrap()))
    });
}

fn benchmark_advance(c: &mut Criterion) {
    let mut cylinder = graded_cylinder(256, 8);

    c.bench_function("cylinder_advance", |b| {
        b.iter(|| {
            cylinder.advance(Some(black_box(0.125))).unwrap();
            black_box(cylinder.size())
        })
    });
}

fn benchmark_phase_arming(c: &mut Criterion) {
    let th = TimeHorizon::with_extent(0.0, 0.5).with_stepsize(0.125);
    let problem = Problem::new(vec!["u".to_string()], 1, th)
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
        ));
    let defaults = PhaseDefaults {
        spl: 32.0,
        batchsize: 64,
        shelf: 0.0,
        spd: None,
        seed: 9,
    };
    let pristine = IcBase::sample(&problem, defaults.spl, defaults.seed).unwrap();
    let mut phase = Phase::new("sweep");
    phase.init(&problem, defaults.seed).unwrap();
    let window = problem.th().clone();

    c.bench_function("phase_arming", |b| {
        b.iter(|| {
            phase
                .init_phase(&problem, &window, Some(&pristine), &defaults)
                .unwrap();
            phase.deinit();
        })
    });
}

criterion_group!(
    cylinder_benches,
    benchmark_expand_contract,
    benchmark_batch_assembly,
    benchmark_advance,
    benchmark_phase_arming,
);
criterion_main!(cylinder_benches);
