//! Acquisition maximization: dense random scan followed by multi-start local
//! refinement.

use parking_lot::Mutex;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use cbo_types::{config_error, CboError, CboResult, Interval};

/// Best point found by a search, with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalOptimum {
    pub x: Vec<f64>,
    pub value: f64,
}

/// Bounded local search capability.
pub trait LocalMaximizer: Send + Sync {
    /// Climb `objective` from `x0`, never leaving `bounds`. Returns `None`
    /// when no finite value was found.
    fn maximize(
        &self,
        objective: &(dyn Fn(&[f64]) -> f64 + Sync),
        x0: &[f64],
        bounds: &[Interval],
    ) -> Option<LocalOptimum>;
}

/// Derivative-free compass search.
///
/// Tries `±step` along each axis (step measured as a fraction of the axis
/// width), moves on the first improvement and halves the step when no move
/// improves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSearch {
    pub initial_step: f64,
    pub min_step: f64,
    pub max_evaluations: usize,
}

impl Default for PatternSearch {
    fn default() -> Self {
        Self {
            initial_step: 0.1,
            min_step: 1e-6,
            max_evaluations: 200,
        }
    }
}

impl LocalMaximizer for PatternSearch {
    fn maximize(
        &self,
        objective: &(dyn Fn(&[f64]) -> f64 + Sync),
        x0: &[f64],
        bounds: &[Interval],
    ) -> Option<LocalOptimum> {
        let mut x: Vec<f64> = x0.iter().zip(bounds).map(|(v, b)| b.clamp(*v)).collect();
        let mut fx = sanitize(objective(&x));
        let mut evaluations = 1;
        let mut step = self.initial_step;

        'search: while step > self.min_step {
            let mut improved = false;
            'axes: for d in 0..x.len() {
                for direction in [1.0, -1.0] {
                    if evaluations >= self.max_evaluations {
                        break 'search;
                    }
                    let mut candidate = x.clone();
                    candidate[d] = bounds[d].clamp(x[d] + direction * step * bounds[d].width());
                    if candidate[d] == x[d] {
                        continue;
                    }
                    let fc = sanitize(objective(&candidate));
                    evaluations += 1;
                    if fc > fx {
                        x = candidate;
                        fx = fc;
                        improved = true;
                        break 'axes;
                    }
                }
            }
            if !improved {
                step *= 0.5;
            }
        }

        fx.is_finite().then_some(LocalOptimum { x, value: fx })
    }
}

/// NaN scores never win a comparison.
fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        f64::NEG_INFINITY
    } else {
        value
    }
}

/// Search budget for [`AcquisitionMaximizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Uniform random candidates scored before local refinement.
    pub n_warmup: usize,
    /// Local refinements: one from the best random candidate, the rest from
    /// fresh random seeds.
    pub n_iter: usize,
    /// Run local refinements on the rayon pool.
    pub parallel: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            n_warmup: 10_000,
            n_iter: 10,
            parallel: true,
        }
    }
}

impl AcquisitionSettings {
    pub fn with_warmup(mut self, n_warmup: usize) -> Self {
        self.n_warmup = n_warmup;
        self
    }

    pub fn with_local_searches(mut self, n_iter: usize) -> Self {
        self.n_iter = n_iter;
        self
    }

    pub fn validate(&self) -> CboResult<()> {
        if self.n_warmup == 0 {
            return Err(config_error!("n_warmup must be at least 1"));
        }
        Ok(())
    }
}

/// Finds the point in a box that maximizes an acquisition score.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionMaximizer<L = PatternSearch> {
    settings: AcquisitionSettings,
    local: L,
}

impl AcquisitionMaximizer<PatternSearch> {
    pub fn new(settings: AcquisitionSettings) -> Self {
        Self {
            settings,
            local: PatternSearch::default(),
        }
    }
}

impl<L: LocalMaximizer> AcquisitionMaximizer<L> {
    pub fn with_local(settings: AcquisitionSettings, local: L) -> Self {
        Self { settings, local }
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Maximize `score` over `bounds`.
    ///
    /// Candidates are compared in scan order (random candidates first, then
    /// local refinements in seed order) and a later candidate only wins with
    /// a strictly higher score. The result is clipped to `bounds`. A score
    /// error during the scan or any refinement fails the whole search.
    pub fn maximize<F, R>(&self, score: F, bounds: &[Interval], rng: &mut R) -> CboResult<LocalOptimum>
    where
        F: Fn(&[f64]) -> CboResult<f64> + Sync,
        R: Rng + ?Sized,
    {
        self.settings.validate()?;
        let sample = |rng: &mut R| -> Vec<f64> {
            bounds
                .iter()
                .map(|b| rng.random_range(b.low..=b.high))
                .collect()
        };

        let mut best_x = sample(rng);
        let mut best = sanitize(score(&best_x)?);
        for _ in 1..self.settings.n_warmup {
            let x = sample(rng);
            let s = sanitize(score(&x)?);
            if s > best {
                best = s;
                best_x = x;
            }
        }

        let mut seeds = Vec::with_capacity(self.settings.n_iter);
        if self.settings.n_iter > 0 {
            seeds.push(best_x.clone());
            seeds.extend((1..self.settings.n_iter).map(|_| sample(rng)));
        }

        let failure: Mutex<Option<CboError>> = Mutex::new(None);
        let objective = |x: &[f64]| match score(x) {
            Ok(value) => sanitize(value),
            Err(err) => {
                let mut first = failure.lock();
                if first.is_none() {
                    *first = Some(err);
                }
                f64::NEG_INFINITY
            }
        };
        let refined: Vec<Option<LocalOptimum>> = if self.settings.parallel {
            seeds
                .par_iter()
                .map(|seed| self.local.maximize(&objective, seed, bounds))
                .collect()
        } else {
            seeds
                .iter()
                .map(|seed| self.local.maximize(&objective, seed, bounds))
                .collect()
        };

        if let Some(err) = failure.into_inner() {
            return Err(err);
        }

        for optimum in refined.into_iter().flatten() {
            if optimum.value > best {
                best = optimum.value;
                best_x = optimum.x;
            }
        }

        let x: Vec<f64> = best_x.iter().zip(bounds).map(|(v, b)| b.clamp(*v)).collect();
        debug!("acquisition maximum {:.6} at {:?}", best, x);
        Ok(LocalOptimum { x, value: best })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn unit_box(dim: usize) -> Vec<Interval> {
        vec![Interval::new(0.0, 1.0); dim]
    }

    #[test]
    fn pattern_search_climbs_to_interior_peak() {
        let f = |x: &[f64]| -(x[0] - 0.3).powi(2) - (x[1] - 0.7).powi(2);
        let optimum = PatternSearch::default()
            .maximize(&f, &[0.9, 0.1], &unit_box(2))
            .unwrap();
        assert!((optimum.x[0] - 0.3).abs() < 1e-3);
        assert!((optimum.x[1] - 0.7).abs() < 1e-3);
    }

    #[test]
    fn pattern_search_stays_in_bounds() {
        let f = |x: &[f64]| x[0];
        let bounds = vec![Interval::new(-2.0, 3.0)];
        let optimum = PatternSearch::default().maximize(&f, &[10.0], &bounds).unwrap();
        assert_eq!(optimum.x[0], 3.0);
    }

    #[test]
    fn maximizer_finds_peak_and_respects_bounds() {
        let maximizer = AcquisitionMaximizer::new(AcquisitionSettings::default().with_warmup(500));
        let bounds = vec![Interval::new(-1.0, 1.0), Interval::new(2.0, 4.0)];
        let score = |x: &[f64]| Ok(-(x[0] - 0.25).powi(2) - (x[1] - 3.5).powi(2));
        let mut rng = StdRng::seed_from_u64(42);

        let best = maximizer.maximize(score, &bounds, &mut rng).unwrap();
        assert!((best.x[0] - 0.25).abs() < 1e-2);
        assert!((best.x[1] - 3.5).abs() < 1e-2);
        for (v, b) in best.x.iter().zip(&bounds) {
            assert!(b.contains(*v));
        }
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let bounds = unit_box(3);
        let score = |x: &[f64]| Ok((x[0] * 7.0).sin() + (x[1] * 3.0).cos() - x[2]);

        let par = AcquisitionMaximizer::new(AcquisitionSettings::default().with_warmup(200));
        let seq = AcquisitionMaximizer::new(AcquisitionSettings {
            parallel: false,
            ..AcquisitionSettings::default().with_warmup(200)
        });

        let a = par.maximize(score, &bounds, &mut StdRng::seed_from_u64(5)).unwrap();
        let b = seq.maximize(score, &bounds, &mut StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ties_keep_first_candidate() {
        // A flat score: nothing beats the first random candidate.
        let settings = AcquisitionSettings::default().with_warmup(50).with_local_searches(3);
        let maximizer = AcquisitionMaximizer::new(settings);
        let bounds = unit_box(2);

        let mut rng = StdRng::seed_from_u64(9);
        let best = maximizer.maximize(|_x: &[f64]| Ok(1.0), &bounds, &mut rng).unwrap();

        let mut replay = StdRng::seed_from_u64(9);
        let first: Vec<f64> = bounds.iter().map(|b| replay.random_range(b.low..=b.high)).collect();
        assert_eq!(best.x, first);
    }

    #[test]
    fn score_errors_propagate() {
        let maximizer = AcquisitionMaximizer::new(AcquisitionSettings::default().with_warmup(10));
        let mut rng = StdRng::seed_from_u64(1);
        let result = maximizer.maximize(
            |_x: &[f64]| Err(cbo_types::CboError::Regressor { message: "unfitted".into() }),
            &unit_box(1),
            &mut rng,
        );
        assert!(result.is_err());
    }

    #[test]
    fn refinement_errors_propagate() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let settings = AcquisitionSettings::default().with_warmup(20).with_local_searches(2);
        let maximizer = AcquisitionMaximizer::new(settings);
        let calls = AtomicUsize::new(0);
        // The scan succeeds; the regressor starts failing once refinement begins.
        let score = |x: &[f64]| {
            if calls.fetch_add(1, Ordering::SeqCst) < 20 {
                Ok(x[0])
            } else {
                Err(cbo_types::CboError::Regressor { message: "lost fit".into() })
            }
        };

        let mut rng = StdRng::seed_from_u64(4);
        let result = maximizer.maximize(score, &unit_box(1), &mut rng);
        assert!(matches!(result, Err(cbo_types::CboError::Regressor { .. })));
    }

    #[test]
    fn zero_warmup_is_rejected() {
        let maximizer = AcquisitionMaximizer::new(AcquisitionSettings::default().with_warmup(0));
        let mut rng = StdRng::seed_from_u64(1);
        assert!(maximizer.maximize(|_x: &[f64]| Ok(0.0), &unit_box(1), &mut rng).is_err());
    }
}
