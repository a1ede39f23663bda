//! Aggregation of every sample buffer serving one phase.
//!
//! A [`SampleSets`] owns the phase's working [`IcBase`] and one
//! [`ConstraintSampleSet`] per problem constraint. Besides fan-out of the
//! lifecycle calls, it owns the one piece of state no single buffer can
//! provide: the epoch counter.
//!
//! # Why A Shared Epoch?
//!
//! With several constraints, and an IC on top, there is one notion of a
//! "pass through the data" per buffer, and the buffers differ in size, so
//! their passes complete at different rates. Calling each buffer's pass an
//! age, an epoch is complete when every active buffer has completed at
//! least one age since the previous epoch. Each buffer latches a marker at
//! its age boundary and holds it until the aggregate observes all markers
//! set at once, so a fast buffer's many ages collapse into one epoch tick
//! and no buffer's completed age is missed.

use std::collections::HashMap;

use ndarray::Array2;

use crate::constraint::{ConstraintSampleSet, PhaseSampling};
use crate::error::{PinnResult, PinnTrainingError};
use crate::icbase::IcBase;
use crate::problem::Problem;

/// Every sample buffer of one phase, plus the epoch state machine.
pub struct SampleSets {
    icbase: Option<IcBase>,
    csss: Vec<ConstraintSampleSet>,
    active: Vec<String>,
    epoch_counter: usize,
}

impl SampleSets {
    /// Creates shells for the problem's constraints, and a working IC base
    /// when the problem is time-dependent. Buffers stay empty until
    /// [`init_phase`](Self::init_phase).
    #[must_use]
    pub fn new(problem: &Problem, seed: u64) -> Self {
        let icbase = problem.time_dependent().then(|| IcBase::new(seed));
        let csss = problem
            .constraints()
            .iter()
            .map(|c| ConstraintSampleSet::new(c.label()))
            .collect();
        Self {
            icbase,
            csss,
            active: Vec::new(),
            epoch_counter: 0,
        }
    }

    /// Builds every active buffer for one phase.
    ///
    /// `active` maps constraint labels to activation; labels missing from
    /// the map are active. The activation order of `active_labels` follows
    /// the problem's declaration order regardless of map order. For a
    /// time-dependent problem the working IC base is copied from the
    /// driver's pristine base and armed with the phase's batch size.
    ///
    /// # Errors
    ///
    /// Fails when the pristine base's presence disagrees with the
    /// problem's time dependence, or when any buffer fails to build.
    pub fn init_phase(
        &mut self,
        problem: &Problem,
        active: &HashMap<String, bool>,
        pristine: Option<&IcBase>,
        params: &PhaseSampling,
    ) -> PinnResult<()> {
        match (self.icbase.as_mut(), pristine) {
            (Some(working), Some(pristine)) => {
                working.init_phase(pristine, params.batchsize)?;
            }
            (None, None) => {}
            (Some(_), None) => {
                return Err(PinnTrainingError::Config {
                    message: "time-dependent sample sets require the driver's IC base".into(),
                });
            }
            (None, Some(_)) => {
                return Err(PinnTrainingError::Config {
                    message: "time-independent sample sets received an IC base".into(),
                });
            }
        }
        self.active.clear();
        for css in &mut self.csss {
            if !active.get(css.label()).copied().unwrap_or(true) {
                continue;
            }
            let Some(constraint) = problem.constraint(css.label()) else {
                return Err(PinnTrainingError::Collaborator {
                    context: "sample sets",
                    message: format!("constraint {:?} vanished from the problem", css.label()),
                });
            };
            css.init_phase(constraint, params)?;
            self.active.push(css.label().to_string());
        }
        Ok(())
    }

    /// Drops every active buffer's contents at the end of a phase.
    pub fn deinit(&mut self) {
        if let Some(icbase) = self.icbase.as_mut() {
            icbase.deinit();
        }
        for css in &mut self.csss {
            if self.active.iter().any(|lb| lb == css.label()) {
                css.deinit();
            }
        }
    }

    /// Observes the epoch state machine. Returns true exactly when every
    /// active buffer's marker and the IC base's marker are set in the same
    /// observation; the markers are then cleared and the epoch counter
    /// ticks. On false every marker is left untouched, so per-buffer
    /// progress persists across calls.
    pub fn end_of_epoch(&mut self) -> bool {
        let csss_done = self
            .csss
            .iter()
            .filter(|css| self.active.iter().any(|lb| lb == css.label()))
            .all(ConstraintSampleSet::epoch_marker);
        let base_done = self.icbase.as_ref().map_or(true, IcBase::epoch_marker);
        if !(csss_done && base_done) {
            return false;
        }
        if let Some(icbase) = self.icbase.as_mut() {
            icbase.clear_epoch_marker();
        }
        for css in &mut self.csss {
            if self.active.iter().any(|lb| lb == css.label()) {
                css.clear_epoch_marker();
            }
        }
        self.epoch_counter += 1;
        true
    }

    /// Number of completed epochs.
    #[inline]
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.epoch_counter
    }

    /// Pushes every buffer one step forward in time. The IC base advances
    /// first, evaluating the model at its points at the new time; the
    /// cylinders then translate by the same delta.
    ///
    /// # Errors
    ///
    /// Fails on time-independent sample sets or a model evaluation of the
    /// wrong shape.
    pub fn advance<F>(&mut self, dt: f64, evaluate: F) -> PinnResult<()>
    where
        F: FnOnce(&Array2<f64>) -> Array2<f64>,
    {
        if let Some(icbase) = self.icbase.as_mut() {
            icbase.advance(dt, evaluate)?;
        }
        for css in &mut self.csss {
            if self.active.iter().any(|lb| lb == css.label()) {
                css.advance(Some(dt))?;
            }
        }
        Ok(())
    }

    /// Raises every active cylinder's level by one.
    ///
    /// # Errors
    ///
    /// Fails when any cylinder refuses to expand.
    pub fn expand_all(&mut self) -> PinnResult<()> {
        for css in &mut self.csss {
            if self.active.iter().any(|lb| lb == css.label()) {
                css.expand()?;
            }
        }
        Ok(())
    }

    /// Lowers every active cylinder's level by one.
    ///
    /// # Errors
    ///
    /// Fails when any cylinder refuses to contract.
    pub fn contract_all(&mut self) -> PinnResult<()> {
        for css in &mut self.csss {
            if self.active.iter().any(|lb| lb == css.label()) {
                css.contract()?;
            }
        }
        Ok(())
    }

    /// Serves the IC batch, `None` for a time-independent problem.
    ///
    /// # Errors
    ///
    /// Fails when the working base is not armed.
    pub fn ic_batch(&mut self) -> PinnResult<Option<(Array2<f64>, Array2<f64>)>> {
        match self.icbase.as_mut() {
            Some(icbase) => Ok(Some(icbase.batch()?)),
            None => Ok(None),
        }
    }

    /// Serves one batch per active constraint, in activation order, as
    /// `(label, inputs, reference)` triples.
    ///
    /// # Errors
    ///
    /// Fails when any buffer is not armed.
    pub fn constraint_batches(
        &mut self,
    ) -> PinnResult<Vec<(String, Array2<f64>, Option<Array2<f64>>)>> {
        let mut out = Vec::with_capacity(self.active.len());
        for css in &mut self.csss {
            if self.active.iter().any(|lb| lb == css.label()) {
                let (inputs, reference) = css.batch()?;
                out.push((css.label().to_string(), inputs, reference));
            }
        }
        Ok(out)
    }

    /// Labels of the buffers activated by the current phase, in the
    /// problem's declaration order.
    #[inline]
    #[must_use]
    pub fn active(&self) -> &[String] {
        &self.active
    }

    /// The working IC base.
    #[inline]
    #[must_use]
    pub fn icbase(&self) -> Option<&IcBase> {
        self.icbase.as_ref()
    }

    /// Looks up a sample set by constraint label.
    #[must_use]
    pub fn css(&self, label: &str) -> Option<&ConstraintSampleSet> {
        self.csss.iter().find(|css| css.label() == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::horizon::TimeHorizon;
    use crate::problem::{Constraint, ProblemIc};
    use crate::sampler::{IntervalSource, PointSource, SampleMode};

    fn two_constraint_problem() -> Problem {
        let th = TimeHorizon::with_extent(0.0, 1.0).with_stepsize(0.5);
        Problem::new(vec!["u".into()], 1, th)
            .with_constraint(Constraint::new(
                "interior",
                Some(Box::new(IntervalSource::new(
                    0.0,
                    2.0,
                    SampleMode::Pseudo,
                    3,
                ))),
            ))
            .with_constraint(Constraint::new(
                "left",
                Some(Box::new(PointSource::new(vec![0.0]))),
            ))
            .with_ic(ProblemIc::new(
                Box::new(IntervalSource::new(0.0, 2.0, SampleMode::Pseudo, 4)),
                Box::new(|x: &Array2<f64>| x.clone()),
            ))
    }

    fn params(th: TimeHorizon) -> PhaseSampling {
        PhaseSampling {
            spl: 16.0,
            batchsize: 8,
            spd: None,
            shelf: 0.0,
            grading: false,
            mode: SampleMode::Pseudo,
            th: Some(th),
            seed: 31,
        }
    }

    fn armed_sets(problem: &Problem) -> (SampleSets, IcBase) {
        let pristine = IcBase::sample(problem, 16.0, 7).unwrap();
        let mut sets = SampleSets::new(problem, 11);
        sets.init_phase(
            problem,
            &HashMap::new(),
            Some(&pristine),
            &params(problem.th().clone()),
        )
        .unwrap();
        (sets, pristine)
    }

    #[test]
    fn activation_follows_declaration_order() {
        let problem = two_constraint_problem();
        let (sets, _pristine) = armed_sets(&problem);
        assert_eq!(sets.active(), &["interior".to_string(), "left".to_string()]);
        assert!(sets.icbase().is_some());
        assert!(sets.css("interior").unwrap().cylinder().is_some());
    }

    #[test]
    fn deactivated_constraints_stay_empty() {
        let problem = two_constraint_problem();
        let pristine = IcBase::sample(&problem, 16.0, 7).unwrap();
        let mut sets = SampleSets::new(&problem, 11);
        let mut active = HashMap::new();
        active.insert("left".to_string(), false);
        sets.init_phase(
            &problem,
            &active,
            Some(&pristine),
            &params(problem.th().clone()),
        )
        .unwrap();
        assert_eq!(sets.active(), &["interior".to_string()]);
        assert!(sets.css("left").unwrap().cylinder().is_none());

        let batches = sets.constraint_batches().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "interior");
    }

    #[test]
    fn pristine_base_presence_must_match() {
        let problem = two_constraint_problem();
        let mut sets = SampleSets::new(&problem, 11);
        assert!(matches!(
            sets.init_phase(
                &problem,
                &HashMap::new(),
                None,
                &params(problem.th().clone())
            ),
            Err(PinnTrainingError::Config { .. })
        ));
    }

    #[test]
    fn epoch_ticks_only_when_all_markers_meet() {
        let problem = two_constraint_problem();
        let (mut sets, _pristine) = armed_sets(&problem);
        // Ages complete at different rates: the IC base after 4 batches,
        // the boundary after 9, the interior after 36.
        let interior_rows = sets.css("interior").unwrap().cylinder().unwrap().size();
        assert_eq!(interior_rows, 32 * 9);

        let mut first_epoch_at = None;
        for iteration in 1..=40 {
            let _ = sets.ic_batch().unwrap().unwrap();
            let _ = sets.constraint_batches().unwrap();
            if sets.end_of_epoch() {
                first_epoch_at = Some(iteration);
                break;
            }
        }
        assert_eq!(first_epoch_at, Some(36));
        assert_eq!(sets.epoch(), 1);

        // Immediately after a tick every marker is clear again.
        assert!(!sets.end_of_epoch());
        assert_eq!(sets.epoch(), 1);
    }

    #[test]
    fn advance_moves_base_and_cylinders_together() {
        let problem = two_constraint_problem();
        let (mut sets, _pristine) = armed_sets(&problem);
        let before: f64 = sets
            .css("interior")
            .unwrap()
            .cylinder()
            .unwrap()
            .points()
            .unwrap()
            .column(1)
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);

        sets.advance(0.5, |inputs| {
            Array2::from_shape_fn((inputs.nrows(), 1), |(r, _)| inputs[[r, 0]])
        })
        .unwrap();

        assert_eq!(sets.icbase().unwrap().t(), Some(0.5));
        let after: f64 = sets
            .css("interior")
            .unwrap()
            .cylinder()
            .unwrap()
            .points()
            .unwrap()
            .column(1)
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        assert!((after - before - 0.5).abs() < 1e-12);
    }

    #[test]
    fn expand_and_contract_fan_out() {
        let problem = two_constraint_problem();
        let pristine = IcBase::sample(&problem, 16.0, 7).unwrap();
        let mut sets = SampleSets::new(&problem, 11);
        sets.init_phase(
            &problem,
            &HashMap::new(),
            Some(&pristine),
            &PhaseSampling {
                grading: true,
                ..params(problem.th().clone())
            },
        )
        .unwrap();

        sets.expand_all().unwrap();
        for lb in ["interior", "left"] {
            assert_eq!(sets.css(lb).unwrap().cylinder().unwrap().level(), 1);
        }
        sets.contract_all().unwrap();
        for lb in ["interior", "left"] {
            assert_eq!(sets.css(lb).unwrap().cylinder().unwrap().level(), 0);
        }
    }

    #[test]
    fn deinit_empties_buffers_but_keeps_epochs() {
        let problem = two_constraint_problem();
        let (mut sets, pristine) = armed_sets(&problem);
        for _ in 0..36 {
            let _ = sets.ic_batch().unwrap();
            let _ = sets.constraint_batches().unwrap();
            let _ = sets.end_of_epoch();
        }
        let epochs = sets.epoch();
        assert!(epochs >= 1);

        sets.deinit();
        assert!(sets.css("interior").unwrap().cylinder().is_none());
        assert!(matches!(
            sets.ic_batch(),
            Err(PinnTrainingError::Uninitialized { .. })
        ));

        // The next phase re-arms the same shells.
        sets.init_phase(
            &problem,
            &HashMap::new(),
            Some(&pristine),
            &params(problem.th().clone()),
        )
        .unwrap();
        assert_eq!(sets.epoch(), epochs);
        let _ = sets.ic_batch().unwrap().unwrap();
    }
}
