//! Per-tag observation store: bounds, evaluation history and the
//! parameter <-> array encoding.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use cbo_types::{domain_error, Bounds, CboError, CboResult, Interval, Observation, ParamSet};

/// Ordered parameter vocabulary shared by every tag's store.
///
/// Built once from the construction bounds; names are sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    names: Vec<String>,
}

impl Vocabulary {
    pub fn from_bounds(bounds: &Bounds) -> Self {
        Self {
            names: bounds.names().map(str::to_string).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).ok()
    }

    pub fn matches(&self, bounds: &Bounds) -> bool {
        bounds.len() == self.names.len() && bounds.names().zip(&self.names).all(|(a, b)| a == b)
    }
}

/// Dedup key: exact bit pattern of each coordinate, with `-0.0` folded into
/// `0.0`.
fn point_key(x: &[f64]) -> Vec<u64> {
    x.iter()
        .map(|v| if *v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() })
        .collect()
}

/// Observation store for a single tag.
#[derive(Debug, Clone)]
pub struct TargetSpace {
    tag: String,
    vocabulary: Arc<Vocabulary>,
    /// Current bounds, in vocabulary order.
    bounds: Vec<Interval>,
    observations: Vec<Observation>,
    /// Encoded rows, parallel to `observations`.
    params: Vec<Vec<f64>>,
    targets: Vec<f64>,
    index: HashMap<Vec<u64>, usize>,
}

impl TargetSpace {
    pub fn new(
        tag: impl Into<String>,
        vocabulary: Arc<Vocabulary>,
        bounds: &Bounds,
    ) -> CboResult<Self> {
        let tag = tag.into();
        bounds.validate()?;
        if !vocabulary.matches(bounds) {
            return Err(domain_error!(
                "bounds for tag {} do not match the parameter vocabulary {:?}",
                tag,
                vocabulary.names()
            ));
        }
        Ok(Self {
            tag,
            vocabulary,
            bounds: bounds.intervals().copied().collect(),
            observations: Vec::new(),
            params: Vec::new(),
            targets: Vec::new(),
            index: HashMap::new(),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Parameter names in encoding order.
    pub fn keys(&self) -> &[String] {
        self.vocabulary.names()
    }

    pub fn dim(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Current bounds as intervals in encoding order.
    pub fn intervals(&self) -> &[Interval] {
        &self.bounds
    }

    pub fn bounds(&self) -> Bounds {
        let mut bounds = Bounds::new();
        for (name, interval) in self.keys().iter().zip(&self.bounds) {
            bounds.insert(name.clone(), *interval);
        }
        bounds
    }

    /// Encoded parameter rows of every observation, in registration order.
    pub fn params(&self) -> &[Vec<f64>] {
        &self.params
    }

    pub fn targets(&self) -> &[f64] {
        &self.targets
    }

    /// Encode an assignment into a vector in vocabulary order.
    ///
    /// The assignment must name every parameter exactly once and nothing else.
    pub fn params_to_array(&self, params: &ParamSet) -> CboResult<Vec<f64>> {
        if let Some(unknown) = params.keys().find(|k| self.vocabulary.index_of(k).is_none()) {
            return Err(domain_error!(
                "unknown parameter {} (expected {:?})",
                unknown,
                self.keys()
            ));
        }
        self.keys()
            .iter()
            .map(|name| {
                params
                    .get(name)
                    .copied()
                    .ok_or_else(|| domain_error!("missing parameter {}", name))
            })
            .collect()
    }

    pub fn array_to_params(&self, x: &[f64]) -> CboResult<ParamSet> {
        if x.len() != self.dim() {
            return Err(CboError::DimensionMismatch {
                expected: self.dim(),
                actual: x.len(),
            });
        }
        Ok(self.keys().iter().cloned().zip(x.iter().copied()).collect())
    }

    /// Target previously observed at `x`, if any.
    pub fn lookup(&self, x: &[f64]) -> Option<f64> {
        self.index.get(&point_key(x)).map(|&i| self.targets[i])
    }

    /// Record an evaluated point.
    ///
    /// Fails with a domain error when the assignment does not match the
    /// vocabulary, lies outside the current bounds, or the target is not
    /// finite; fails with [`CboError::DuplicateObservation`] when the exact
    /// point is already registered. The store is untouched on failure.
    pub fn register(&mut self, params: &ParamSet, target: f64) -> CboResult<()> {
        let x = self.params_to_array(params)?;
        self.check_in_bounds(&x)?;
        if !target.is_finite() {
            return Err(domain_error!("target for tag {} is not finite: {}", self.tag, target));
        }
        let key = point_key(&x);
        if self.index.contains_key(&key) {
            return Err(CboError::DuplicateObservation {
                point: format!("{params:?}"),
            });
        }

        self.index.insert(key, self.observations.len());
        self.params.push(x);
        self.targets.push(target);
        self.observations.push(Observation::new(params.clone(), target));
        Ok(())
    }

    /// Evaluate `params` with `evaluate` and register the result, or return
    /// the cached target when the point was already observed.
    pub fn probe<F>(&mut self, params: &ParamSet, evaluate: F) -> CboResult<f64>
    where
        F: FnOnce(&ParamSet) -> CboResult<f64>,
    {
        let x = self.params_to_array(params)?;
        if let Some(target) = self.lookup(&x) {
            debug!("tag {}: point already observed, reusing target {}", self.tag, target);
            return Ok(target);
        }
        self.check_in_bounds(&x)?;
        let target = evaluate(params)?;
        self.register(params, target)?;
        Ok(target)
    }

    pub(crate) fn check_in_bounds(&self, x: &[f64]) -> CboResult<()> {
        for ((name, interval), value) in self.keys().iter().zip(&self.bounds).zip(x) {
            if !interval.contains(*value) {
                return Err(domain_error!(
                    "{} = {} lies outside [{}, {}]",
                    name,
                    value,
                    interval.low,
                    interval.high
                ));
            }
        }
        Ok(())
    }

    /// Uniform draw inside the current bounds, in array form.
    pub fn random_array<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.bounds
            .iter()
            .map(|interval| rng.random_range(interval.low..=interval.high))
            .collect()
    }

    /// Uniform draw inside the current bounds, as an assignment.
    pub fn random_sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamSet {
        let x = self.random_array(rng);
        self.keys().iter().cloned().zip(x).collect()
    }

    /// Replace the bounds. Observations outside the new bounds are kept.
    pub fn set_bounds(&mut self, new_bounds: &Bounds) -> CboResult<()> {
        new_bounds.validate()?;
        if !self.vocabulary.matches(new_bounds) {
            return Err(domain_error!(
                "new bounds {:?} do not match the parameter vocabulary {:?}",
                new_bounds.names().collect::<Vec<_>>(),
                self.keys()
            ));
        }
        self.bounds = new_bounds.intervals().copied().collect();
        Ok(())
    }

    /// Best observation so far; ties go to the most recent registration.
    pub fn max(&self) -> CboResult<&Observation> {
        let mut best: Option<&Observation> = None;
        for obs in &self.observations {
            match best {
                Some(current) if obs.target < current.target => {}
                _ => best = Some(obs),
            }
        }
        best.ok_or_else(|| self.empty_error())
    }

    /// Best target value, or `None` when nothing has been observed.
    pub fn max_target(&self) -> Option<f64> {
        self.max().ok().map(|obs| obs.target)
    }

    /// Full history in registration order.
    pub fn res(&self) -> CboResult<&[Observation]> {
        if self.observations.is_empty() {
            return Err(self.empty_error());
        }
        Ok(&self.observations)
    }

    /// Encoded row of the best observation.
    pub fn max_array(&self) -> CboResult<Vec<f64>> {
        let best = self.max()?;
        self.params_to_array(&best.params)
    }

    fn empty_error(&self) -> CboError {
        CboError::EmptyStore {
            tag: self.tag.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_bounds() -> Bounds {
        Bounds::new().add("x", 0.0, 1.0).add("y", -5.0, 5.0)
    }

    fn sample_space() -> TargetSpace {
        let bounds = sample_bounds();
        TargetSpace::new("objective", Arc::new(Vocabulary::from_bounds(&bounds)), &bounds).unwrap()
    }

    fn point(x: f64, y: f64) -> ParamSet {
        [("x".to_string(), x), ("y".to_string(), y)].into_iter().collect()
    }

    #[test]
    fn array_round_trip_is_exact() {
        let space = sample_space();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let params = space.random_sample(&mut rng);
            let x = space.params_to_array(&params).unwrap();
            assert_eq!(space.array_to_params(&x).unwrap(), params);
        }
    }

    #[test]
    fn array_to_params_rejects_wrong_length() {
        let space = sample_space();
        match space.array_to_params(&[0.1]) {
            Err(CboError::DimensionMismatch { expected, actual }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 1);
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[test]
    fn register_validates_vocabulary_and_bounds() {
        let mut space = sample_space();

        let mut missing = ParamSet::new();
        missing.insert("x".into(), 0.5);
        assert!(matches!(space.register(&missing, 1.0), Err(CboError::Domain(_))));

        let mut unknown = point(0.5, 0.0);
        unknown.insert("z".into(), 1.0);
        assert!(matches!(space.register(&unknown, 1.0), Err(CboError::Domain(_))));

        assert!(matches!(space.register(&point(1.5, 0.0), 1.0), Err(CboError::Domain(_))));
        assert!(matches!(space.register(&point(0.5, 0.0), f64::NAN), Err(CboError::Domain(_))));
        assert!(space.is_empty());
    }

    #[test]
    fn duplicate_registration_leaves_store_unchanged() {
        let mut space = sample_space();
        space.register(&point(0.2, 1.0), -0.5).unwrap();
        space.register(&point(0.7, 2.0), 0.25).unwrap();

        let before_res = space.res().unwrap().to_vec();
        let before_max = space.max().unwrap().clone();

        let err = space.register(&point(0.2, 1.0), 10.0).unwrap_err();
        assert!(matches!(err, CboError::DuplicateObservation { .. }));
        assert_eq!(space.len(), 2);
        assert_eq!(space.res().unwrap(), before_res.as_slice());
        assert_eq!(space.max().unwrap(), &before_max);
    }

    #[test]
    fn negative_zero_counts_as_duplicate() {
        let mut space = sample_space();
        space.register(&point(0.0, 1.0), 1.0).unwrap();
        assert!(matches!(
            space.register(&point(-0.0, 1.0), 2.0),
            Err(CboError::DuplicateObservation { .. })
        ));
    }

    #[test]
    fn max_breaks_ties_by_most_recent() {
        let mut space = sample_space();
        space.register(&point(0.1, 0.0), 3.0).unwrap();
        space.register(&point(0.2, 0.0), 1.0).unwrap();
        space.register(&point(0.3, 0.0), 3.0).unwrap();
        assert_eq!(space.max().unwrap().params, point(0.3, 0.0));
    }

    #[test]
    fn empty_store_queries_fail() {
        let space = sample_space();
        assert!(matches!(space.max(), Err(CboError::EmptyStore { .. })));
        assert!(matches!(space.res(), Err(CboError::EmptyStore { .. })));
        assert_eq!(space.max_target(), None);
    }

    #[test]
    fn probe_caches_previous_evaluations() {
        let mut space = sample_space();
        let mut calls = 0;
        let target = space
            .probe(&point(0.5, 0.5), |_| {
                calls += 1;
                Ok(4.0)
            })
            .unwrap();
        assert_eq!(target, 4.0);

        let again = space
            .probe(&point(0.5, 0.5), |_| {
                calls += 1;
                Ok(99.0)
            })
            .unwrap();
        assert_eq!(again, 4.0);
        assert_eq!(calls, 1);
        assert_eq!(space.len(), 1);
    }

    #[test]
    fn set_bounds_moves_sampling_but_keeps_history() {
        let mut space = sample_space();
        space.register(&point(0.9, 4.0), 1.0).unwrap();

        let narrow = Bounds::new().add("x", 0.0, 0.1).add("y", 0.0, 1.0);
        space.set_bounds(&narrow).unwrap();

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let p = space.random_sample(&mut rng);
            assert!(p["x"] >= 0.0 && p["x"] <= 0.1);
            assert!(p["y"] >= 0.0 && p["y"] <= 1.0);
        }
        assert_eq!(space.res().unwrap()[0].params, point(0.9, 4.0));
        assert_eq!(space.bounds(), narrow);
    }

    #[test]
    fn set_bounds_rejects_vocabulary_change() {
        let mut space = sample_space();
        let other = Bounds::new().add("x", 0.0, 1.0).add("z", 0.0, 1.0);
        assert!(matches!(space.set_bounds(&other), Err(CboError::Domain(_))));
        assert_eq!(space.bounds(), sample_bounds());
    }

    #[test]
    fn random_sample_is_deterministic_given_rng() {
        let space = sample_space();
        let a = space.random_sample(&mut StdRng::seed_from_u64(3));
        let b = space.random_sample(&mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }
}
