//! Zero-loss binary search.
//!
//! Finds the highest offered load on a fixed ladder whose measured loss
//! stays within a tolerance. The loss function is only reachable through
//! an expensive `run(load)`, so every ladder value is evaluated at most
//! once and all results are handed back for diagnostics.

use std::collections::BTreeMap;

use thiserror::Error;

/// Loads are rounded to this many decimal places so repeated
/// subtraction of the step does not drift.
const LADDER_DECIMALS: i32 = 9;

#[derive(Debug, Error, PartialEq)]
pub enum SearchError {
    #[error("invalid zero-loss search parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

// ── Ladder / Bracket ────────────────────────────────────────────────

/// Candidate loads `max, max - step, ...` down to the last value not
/// below `min`, in ascending order.
pub fn ladder(min: f64, max: f64, step: f64) -> Vec<f64> {
    let scale = 10f64.powi(LADDER_DECIMALS);
    let floor = (min * scale).round() / scale;
    let mut values = Vec::new();
    let mut i = 0u32;
    loop {
        let value = ((max - f64::from(i) * step) * scale).round() / scale;
        if value < floor {
            break;
        }
        values.push(value);
        i += 1;
    }
    values.reverse();
    values
}

/// Index range still containing the answer. Each narrowing step returns
/// a new bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bracket {
    pub lo: usize,
    pub hi: usize,
}

impl Bracket {
    /// The whole ladder, or `None` with fewer than two candidates.
    pub fn full(len: usize) -> Option<Self> {
        (len >= 2).then(|| Bracket { lo: 0, hi: len - 1 })
    }

    pub fn converged(&self) -> bool {
        self.hi - self.lo <= 1
    }

    pub fn mid(&self) -> usize {
        self.lo + (self.hi - self.lo) / 2
    }

    /// Keep the lower half when the midpoint exceeded the tolerance,
    /// the upper half otherwise.
    pub fn narrow(self, exceeded: bool) -> Self {
        let mid = self.mid();
        if exceeded {
            Bracket { lo: self.lo, hi: mid }
        } else {
            Bracket { lo: mid, hi: self.hi }
        }
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Memoized results of one search.
#[derive(Debug, Clone)]
pub struct SearchState<R> {
    ladder: Vec<f64>,
    results: BTreeMap<usize, R>,
    bracket: Option<Bracket>,
}

impl<R> SearchState<R> {
    fn new(ladder: Vec<f64>) -> Self {
        let bracket = Bracket::full(ladder.len());
        Self {
            ladder,
            results: BTreeMap::new(),
            bracket,
        }
    }

    pub fn ladder(&self) -> &[f64] {
        &self.ladder
    }

    pub fn bracket(&self) -> Option<Bracket> {
        self.bracket
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Result measured at `load`, if that load was evaluated.
    pub fn get(&self, load: f64) -> Option<&R> {
        let index = self.ladder.iter().position(|&l| l == load)?;
        self.results.get(&index)
    }

    /// Evaluated `(load, result)` pairs in ascending load order.
    pub fn results(&self) -> impl Iterator<Item = (f64, &R)> {
        self.results.iter().map(|(&i, r)| (self.ladder[i], r))
    }

    pub fn into_results(self) -> Vec<(f64, R)> {
        let ladder = self.ladder;
        self.results
            .into_iter()
            .map(|(i, r)| (ladder[i], r))
            .collect()
    }

    fn evaluate<E>(
        &mut self,
        index: usize,
        run: &mut impl FnMut(f64) -> Result<R, E>,
    ) -> Result<&R, E> {
        if !self.results.contains_key(&index) {
            let result = run(self.ladder[index])?;
            self.results.insert(index, result);
        }
        // just inserted or already present
        Ok(&self.results[&index])
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome<R> {
    pub state: SearchState<R>,
    /// Highest load within tolerance; `None` when no candidate passed or
    /// the ladder had fewer than two values.
    pub chosen: Option<f64>,
}

impl<R> SearchOutcome<R> {
    pub fn chosen_result(&self) -> Option<&R> {
        self.chosen.and_then(|load| self.state.get(load))
    }
}

// ── Search ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZeroLossSearch {
    pub min: f64,
    pub max: f64,
    /// Highest acceptable loss, in percent.
    pub required_loss: f64,
    pub step: f64,
}

impl ZeroLossSearch {
    pub fn new(min: f64, max: f64, required_loss: f64, step: f64) -> Result<Self, SearchError> {
        let check = |name, value: f64, valid: bool| {
            if valid && value.is_finite() {
                Ok(())
            } else {
                Err(SearchError::InvalidParameter { name, value })
            }
        };
        check("step", step, step > 0.0)?;
        check("min", min, true)?;
        check("max", max, true)?;
        check("required_loss", required_loss, required_loss >= 0.0)?;
        Ok(Self {
            min,
            max,
            required_loss,
            step,
        })
    }

    /// Binary-search the ladder with `run`, judging each result by
    /// `metric` (loss in percent). A failing `run` aborts the search.
    pub fn search<R, E>(
        &self,
        mut run: impl FnMut(f64) -> Result<R, E>,
        metric: impl Fn(&R) -> f64,
    ) -> Result<SearchOutcome<R>, E> {
        let mut state = SearchState::new(ladder(self.min, self.max, self.step));
        let Some(mut bracket) = state.bracket else {
            tracing::warn!(
                min = self.min,
                max = self.max,
                step = self.step,
                "zero-loss ladder has fewer than two loads"
            );
            return Ok(SearchOutcome {
                state,
                chosen: None,
            });
        };

        while !bracket.converged() {
            let mid = bracket.mid();
            let loss = metric(state.evaluate(mid, &mut run)?);
            let exceeded = loss > self.required_loss;
            tracing::info!(
                load = state.ladder[mid],
                loss_percent = loss,
                exceeded,
                "zero-loss search step"
            );
            bracket = bracket.narrow(exceeded);
            state.bracket = Some(bracket);
        }

        for index in [bracket.hi, bracket.lo] {
            let loss = metric(state.evaluate(index, &mut run)?);
            if loss <= self.required_loss {
                let load = state.ladder[index];
                tracing::info!(load, loss_percent = loss, "zero-loss load found");
                return Ok(SearchOutcome {
                    state,
                    chosen: Some(load),
                });
            }
        }
        tracing::warn!(
            required_loss = self.required_loss,
            "no load met the zero-loss requirement"
        );
        Ok(SearchOutcome {
            state,
            chosen: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::convert::Infallible;

    fn step_loss(threshold: f64) -> impl Fn(&f64) -> f64 {
        move |load: &f64| if *load > threshold { *load - threshold } else { 0.0 }
    }

    #[test]
    fn ladder_descends_from_max() {
        assert_eq!(ladder(1.0, 5.0, 1.0), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(ladder(0.5, 2.0, 0.4), vec![0.8, 1.2, 1.6, 2.0]);
        assert_eq!(ladder(99.95, 100.0, 0.1), vec![100.0]);
        assert!(ladder(10.0, 5.0, 1.0).is_empty());
    }

    #[test]
    fn ladder_values_are_rounded() {
        let values = ladder(0.0, 1.0, 0.1);
        assert_eq!(values.len(), 11);
        assert_eq!(values[3], 0.3);
        assert_eq!(values[0], 0.0);
    }

    #[test]
    fn bracket_narrows_without_mutation() {
        let b = Bracket::full(10).unwrap();
        assert_eq!(b, Bracket { lo: 0, hi: 9 });
        assert_eq!(b.mid(), 4);
        assert_eq!(b.narrow(true), Bracket { lo: 0, hi: 4 });
        assert_eq!(b.narrow(false), Bracket { lo: 4, hi: 9 });
        assert!(Bracket { lo: 3, hi: 4 }.converged());
        assert!(Bracket::full(1).is_none());
    }

    #[test]
    fn narrow_range_returns_nothing() {
        let search = ZeroLossSearch::new(99.5, 100.0, 0.0, 1.0).unwrap();
        let mut calls = 0;
        let outcome = search
            .search(
                |load| {
                    calls += 1;
                    Ok::<_, Infallible>(load)
                },
                step_loss(50.0),
            )
            .unwrap();
        assert!(outcome.state.is_empty());
        assert_eq!(outcome.chosen, None);
        assert_eq!(calls, 0);
    }

    #[test]
    fn finds_highest_passing_load() {
        let search = ZeroLossSearch::new(1.0, 100.0, 0.00001, 1.0).unwrap();
        let outcome = search
            .search(|load| Ok::<_, Infallible>(load), step_loss(37.5))
            .unwrap();
        assert_eq!(outcome.chosen, Some(37.0));
        assert_eq!(outcome.chosen_result(), Some(&37.0));
        // log2(100) bisection steps plus the final check, never the whole ladder
        assert!(outcome.state.len() <= 9);
    }

    #[test]
    fn flat_loss_converges_to_max() {
        let search = ZeroLossSearch::new(1.0, 100.0, 0.0, 1.0).unwrap();
        let outcome = search
            .search(|load| Ok::<_, Infallible>(load), |_| 0.0)
            .unwrap();
        assert_eq!(outcome.chosen, Some(100.0));
    }

    #[test]
    fn all_failing_returns_none_with_results() {
        let search = ZeroLossSearch::new(1.0, 100.0, 0.0, 1.0).unwrap();
        let outcome = search
            .search(|load| Ok::<_, Infallible>(load), |_| 5.0)
            .unwrap();
        assert_eq!(outcome.chosen, None);
        assert!(outcome.state.get(1.0).is_some());
        assert!(outcome.state.get(2.0).is_some());
        let loads: Vec<f64> = outcome.state.results().map(|(l, _)| l).collect();
        assert!(loads.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn run_failure_aborts() {
        let search = ZeroLossSearch::new(1.0, 100.0, 0.0, 1.0).unwrap();
        let result = search.search(
            |load| if load > 40.0 { Err("boom") } else { Ok(load) },
            |_| 0.0,
        );
        assert_eq!(result.unwrap_err(), "boom");
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(matches!(
            ZeroLossSearch::new(1.0, 100.0, 0.0, 0.0),
            Err(SearchError::InvalidParameter { name: "step", .. })
        ));
        assert!(ZeroLossSearch::new(1.0, f64::NAN, 0.0, 1.0).is_err());
        assert!(ZeroLossSearch::new(1.0, 100.0, -1.0, 1.0).is_err());
    }

    proptest! {
        #[test]
        fn proptest_monotone_loss_picks_boundary(threshold in 0.0f64..110.0) {
            let search = ZeroLossSearch::new(1.0, 100.0, 0.00001, 1.0).unwrap();
            let mut seen: HashMap<u64, u32> = HashMap::new();
            let outcome = search
                .search(
                    |load: f64| {
                        *seen.entry(load.to_bits()).or_default() += 1;
                        Ok::<_, Infallible>(load)
                    },
                    step_loss(threshold),
                )
                .unwrap();

            prop_assert!(seen.values().all(|&n| n == 1));
            let best = ladder(1.0, 100.0, 1.0)
                .into_iter()
                .filter(|&l| l <= threshold)
                .last();
            prop_assert_eq!(outcome.chosen, best);
            if let Some(chosen) = outcome.chosen {
                for (load, _) in outcome.state.results() {
                    if load > chosen {
                        prop_assert!(step_loss(threshold)(&load) > 0.00001);
                    }
                }
            }
        }
    }
}
