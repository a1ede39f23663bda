//! Observation hooks and the cooperative stop flag.
//!
//! Everything the engine, drivers, and phases do is narrated through a
//! single [`Hooks`] implementation: one callback per lifecycle event, fired
//! synchronously at the point the event happens. Probes, progress bars, and
//! loggers implement the subset they care about and inherit no-ops for the
//! rest.
//!
//! # Why Value Snapshots?
//!
//! Callbacks receive plain values (step numbers, levels, losses) rather than
//! references into live engine state. Hook implementations can therefore
//! store what they receive without lifetime entanglement, and the engine
//! never exposes a mutation surface mid-stride. The one exception is
//! [`after_batch`](Hooks::after_batch), which borrows the batch just
//! assembled; it is owned by the training loop and dropped at the end of the
//! iteration, so the borrow is strictly read-and-return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::batch::Batch;

/// Lifecycle observer for a training run.
///
/// Every method has a no-op default; implement only the events of interest.
/// Callbacks fire on the thread running the engine, so anything slow in a
/// hook stalls training.
#[allow(unused_variables)]
pub trait Hooks: Send {
    /// The run is about to start, before any buffer exists.
    fn on_start(&mut self) {}

    /// Drivers and their horizons are initialized; the stride loop is next.
    fn after_init(&mut self) {}

    /// A stride is starting. `stride` counts from zero; `ti` is the global
    /// step cursor at the stride's start.
    fn on_stride(&mut self, stride: usize, ti: usize) {}

    /// The front driver finished its critical section.
    fn after_critical_section(&mut self) {}

    /// The hand-off buffer was loaded into the next driver's base.
    fn after_communication(&mut self) {}

    /// The stride is fully wound down. `ti` is the updated step cursor.
    fn after_stride(&mut self, ti: usize) {}

    /// The run is over; no more callbacks will fire.
    fn on_end(&mut self) {}

    /// A phase's buffers were armed and its training is about to start.
    fn on_phase(&mut self, label: &str) {}

    /// A phase finished all of its steps.
    fn after_phase(&mut self, label: &str) {}

    /// A step within the current phase is starting. `step` counts from zero
    /// within the stride.
    fn on_step(&mut self, step: usize) {}

    /// A step's training and advance are done.
    fn after_step(&mut self, step: usize) {}

    /// The buffers expanded; `level` is the level just reached.
    fn on_expand(&mut self, level: u32) {}

    /// The buffers contracted; `level` is the level just reached.
    fn on_contract(&mut self, level: u32) {}

    /// The buffers are about to advance their time slice by `dt`.
    fn on_advance(&mut self, dt: f64) {}

    /// A training session at `level` is starting.
    fn on_train(&mut self, level: u32) {}

    /// A training session at `level` ended; `passed` reports whether it hit
    /// its tolerance.
    fn after_train(&mut self, level: u32, passed: bool) {}

    /// A training iteration is starting.
    fn on_iter(&mut self, iteration: usize) {}

    /// A batch was assembled for the current iteration.
    fn after_batch(&mut self, batch: &Batch) {}

    /// The surrogate finished an optimization step.
    fn after_iter(&mut self, iteration: usize, loss: f64) {}

    /// All sample buffers crossed an age boundary together.
    fn on_end_of_epoch(&mut self, epoch: usize) {}

    /// The session converged below its tolerance and is breaking.
    fn on_tolerance_break(&mut self, iteration: usize, loss: f64) {}

    /// The session exhausted its iteration budget and is breaking.
    fn on_maxiter_break(&mut self, iteration: usize) {}

    /// The external stop flag was observed set and the session is breaking.
    fn on_stop_break(&mut self, iteration: usize) {}
}

/// A [`Hooks`] implementation that observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHooks;

impl Hooks for NullHooks {}

/// Externally settable flag polled once per training iteration.
///
/// Clones share the flag, so a handle can be moved to a signal handler or a
/// watchdog thread while the engine keeps its own. Setting the flag does not
/// interrupt anything mid-operation; the training loop observes it at its
/// next iteration boundary and unwinds cleanly through the normal break
/// path.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    flag: Arc<AtomicBool>,
}

impl StopFlag {
    /// Creates a cleared flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a cooperative stop.
    pub fn set(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Clears a previously requested stop.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
