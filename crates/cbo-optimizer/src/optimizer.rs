//! The sequential optimization loop.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use cbo_types::{config_error, domain_error, Bounds, CboError, CboResult, Event, Observation, ParamSet};

use crate::acquisition::{feasibility, weight_by_feasibility, AcquisitionKind, UtilityFunction};
use crate::domain::DomainTransformer;
use crate::maximizer::{AcquisitionMaximizer, AcquisitionSettings, LocalMaximizer, PatternSearch};
use crate::objective::Objective;
use crate::observer::{EventBus, OptimizerView, SharedObserver, SubscriberId};
use crate::queue::ProbeQueue;
use crate::surrogate::{GaussianProcess, GpParams, Regressor, SurrogateSlot};
use crate::target_space::{TargetSpace, Vocabulary};

/// Where the optimizer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerState {
    Idle,
    Priming,
    DrainingQueue,
    Fitting,
    Suggesting,
    Terminated,
}

impl Default for OptimizerState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Construction-time configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Tags in order; the first one is the target being maximized.
    pub tags: Vec<String>,

    /// Search domain shared by every tag.
    pub bounds: Bounds,

    /// Seed for candidate sampling. `None` seeds from the OS.
    pub seed: Option<u64>,

    /// Events subscribers may register for.
    pub events: Vec<Event>,

    pub acquisition: AcquisitionSettings,

    /// Constraint tags and their limits. A constraint holds when its value
    /// is at or below the limit.
    pub constraints: BTreeMap<String, f64>,
}

impl OptimizerConfig {
    pub fn new(bounds: Bounds) -> Self {
        Self {
            tags: vec!["objective".to_string(), "constraint".to_string()],
            bounds,
            seed: None,
            events: Event::ALL.to_vec(),
            acquisition: AcquisitionSettings::default(),
            constraints: BTreeMap::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    pub fn with_acquisition(mut self, acquisition: AcquisitionSettings) -> Self {
        self.acquisition = acquisition;
        self
    }

    /// Treat `tag` as a constraint that must stay at or below `limit`.
    pub fn with_constraint(mut self, tag: impl Into<String>, limit: f64) -> Self {
        self.constraints.insert(tag.into(), limit);
        self
    }

    pub fn validate(&self) -> CboResult<()> {
        let Some(primary) = self.tags.first() else {
            return Err(config_error!("at least one tag is required"));
        };
        let mut seen = HashSet::new();
        for tag in &self.tags {
            if !seen.insert(tag.as_str()) {
                return Err(config_error!("duplicate tag {:?}", tag));
            }
        }
        for (tag, limit) in &self.constraints {
            if !seen.contains(tag.as_str()) {
                return Err(config_error!("constraint {:?} is not a configured tag", tag));
            }
            if tag == primary {
                return Err(config_error!("the primary tag {:?} cannot be a constraint", tag));
            }
            if !limit.is_finite() {
                return Err(config_error!("constraint {:?} has a non-finite limit", tag));
            }
        }
        self.bounds.validate()?;
        self.acquisition.validate()
    }
}

/// Options for one [`BayesianOptimizer::maximize`] run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaximizeOptions<P = GpParams> {
    /// Random points queued before model-based search.
    pub init_points: usize,
    /// Model-based iterations.
    pub n_iter: usize,
    pub acquisition: AcquisitionKind,
    pub kappa: f64,
    pub kappa_decay: f64,
    pub kappa_decay_delay: usize,
    pub xi: f64,
    /// Regressor hyper-parameters applied per tag before the run.
    pub gp_params: BTreeMap<String, P>,
}

impl<P> Default for MaximizeOptions<P> {
    fn default() -> Self {
        Self {
            init_points: 5,
            n_iter: 25,
            acquisition: AcquisitionKind::UpperConfidenceBound,
            kappa: 2.576,
            kappa_decay: 1.0,
            kappa_decay_delay: 0,
            xi: 0.0,
            gp_params: BTreeMap::new(),
        }
    }
}

impl<P> MaximizeOptions<P> {
    pub fn new(init_points: usize, n_iter: usize) -> Self {
        Self {
            init_points,
            n_iter,
            ..Self::default()
        }
    }

    pub fn with_acquisition(mut self, acquisition: AcquisitionKind) -> Self {
        self.acquisition = acquisition;
        self
    }

    pub fn with_kappa(mut self, kappa: f64) -> Self {
        self.kappa = kappa;
        self
    }

    pub fn with_kappa_decay(mut self, decay: f64, delay: usize) -> Self {
        self.kappa_decay = decay;
        self.kappa_decay_delay = delay;
        self
    }

    pub fn with_xi(mut self, xi: f64) -> Self {
        self.xi = xi;
        self
    }

    pub fn with_gp_params(mut self, tag: impl Into<String>, params: P) -> Self {
        self.gp_params.insert(tag.into(), params);
        self
    }

    pub fn utility(&self) -> UtilityFunction {
        UtilityFunction::new(self.acquisition, self.kappa, self.xi)
            .with_decay(self.kappa_decay, self.kappa_decay_delay)
    }

    fn validate(&self) -> CboResult<()> {
        if !(self.kappa.is_finite() && self.kappa >= 0.0) {
            return Err(config_error!("kappa must be non-negative, got {}", self.kappa));
        }
        if !(self.kappa_decay.is_finite() && self.kappa_decay > 0.0) {
            return Err(config_error!("kappa_decay must be positive, got {}", self.kappa_decay));
        }
        if !self.xi.is_finite() {
            return Err(config_error!("xi must be finite, got {}", self.xi));
        }
        Ok(())
    }
}

type BoundsTransformer = (String, Box<dyn DomainTransformer>);

/// Sequential model-based optimizer over one or more tagged signals.
///
/// Every tag shares the parameter vocabulary and bounds but keeps its own
/// observation store and surrogate. The first tag is the one maximized;
/// tags configured as constraints weight the acquisition score by their
/// probability of feasibility.
pub struct BayesianOptimizer<R: Regressor = GaussianProcess, L: LocalMaximizer = PatternSearch> {
    tags: Vec<String>,
    vocabulary: Arc<Vocabulary>,
    spaces: HashMap<String, TargetSpace>,
    surrogates: HashMap<String, SurrogateSlot<R>>,
    constraints: BTreeMap<String, f64>,
    queue: ProbeQueue,
    events: EventBus,
    objective: Box<dyn Objective + Send>,
    maximizer: AcquisitionMaximizer<L>,
    bounds_transformer: Option<BoundsTransformer>,
    rng: StdRng,
    state: OptimizerState,
    iterations: usize,
}

impl BayesianOptimizer<GaussianProcess, PatternSearch> {
    /// Optimizer with a default Gaussian process per tag.
    pub fn new<O>(objective: O, config: OptimizerConfig) -> CboResult<Self>
    where
        O: Objective + Send + 'static,
    {
        let local = PatternSearch::default();
        Self::with_components(objective, config, |_tag: &str| GaussianProcess::default(), local)
    }
}

impl<R: Regressor, L: LocalMaximizer> BayesianOptimizer<R, L> {
    /// Optimizer with a regressor built per tag by `make_regressor` and a
    /// custom local search.
    pub fn with_components<O, F>(
        objective: O,
        config: OptimizerConfig,
        mut make_regressor: F,
        local: L,
    ) -> CboResult<Self>
    where
        O: Objective + Send + 'static,
        F: FnMut(&str) -> R,
    {
        config.validate()?;
        let vocabulary = Arc::new(Vocabulary::from_bounds(&config.bounds));

        let mut spaces = HashMap::with_capacity(config.tags.len());
        let mut surrogates = HashMap::with_capacity(config.tags.len());
        for tag in &config.tags {
            let space = TargetSpace::new(tag.clone(), Arc::clone(&vocabulary), &config.bounds)?;
            spaces.insert(tag.clone(), space);
            surrogates.insert(tag.clone(), SurrogateSlot::new(tag.clone(), make_regressor(tag)));
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        info!(
            "Initializing optimizer: tags {:?}, {} parameters, constraints {:?}",
            config.tags,
            vocabulary.len(),
            config.constraints
        );

        Ok(Self {
            tags: config.tags,
            vocabulary,
            spaces,
            surrogates,
            constraints: config.constraints,
            queue: ProbeQueue::new(),
            events: EventBus::new(config.events),
            objective: Box::new(objective),
            maximizer: AcquisitionMaximizer::with_local(config.acquisition, local),
            bounds_transformer: None,
            rng,
            state: OptimizerState::Idle,
            iterations: 0,
        })
    }

    /// Attach a bounds transformer driven by `tag`'s history. The
    /// transformer is initialized from that tag's store immediately.
    pub fn with_bounds_transformer<T>(mut self, tag: impl Into<String>, mut transformer: T) -> CboResult<Self>
    where
        T: DomainTransformer + 'static,
    {
        let tag = tag.into();
        transformer.initialize(self.space_ref(&tag)?)?;
        debug!("bounds transformer attached to tag {}", tag);
        self.bounds_transformer = Some((tag, Box::new(transformer)));
        Ok(self)
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub fn subscribe(
        &mut self,
        event: Event,
        id: impl Into<SubscriberId>,
        observer: SharedObserver,
    ) -> CboResult<()> {
        self.events.subscribe(event, id, observer)
    }

    /// Subscribe `observer` under `id` to every configured event.
    pub fn subscribe_all(&mut self, id: impl Into<SubscriberId>, observer: SharedObserver) -> CboResult<()> {
        let id = id.into();
        let events: Vec<Event> = self.events.events().collect();
        for event in events {
            self.events.subscribe(event, id.clone(), Arc::clone(&observer))?;
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, event: Event, id: &SubscriberId) -> CboResult<SharedObserver> {
        self.events.unsubscribe(event, id)
    }

    fn dispatch(&self, event: Event) -> CboResult<()> {
        self.events.dispatch(event, self)
    }

    // -----------------------------------------------------------------------
    // Observations
    // -----------------------------------------------------------------------

    /// Evaluate `params` for `tag` now, or queue it for the next
    /// [`maximize`](Self::maximize) run when `lazy` is set.
    ///
    /// An eager probe of an already observed point reuses the stored target
    /// and does not call the objective. Every eager probe publishes one
    /// step event.
    pub fn probe(&mut self, tag: &str, params: ParamSet, lazy: bool) -> CboResult<()> {
        let space = self
            .spaces
            .get_mut(tag)
            .ok_or_else(|| CboError::UnknownTag { tag: tag.to_string() })?;

        if lazy {
            let x = space.params_to_array(&params)?;
            space.check_in_bounds(&x)?;
            self.queue.add(params);
            debug!("queued point for later evaluation ({} pending)", self.queue.len());
            return Ok(());
        }

        let objective = &mut self.objective;
        let target = space.probe(&params, |p| objective.evaluate(tag, p))?;
        debug!("tag {}: probed {:?} -> {}", tag, params, target);
        self.dispatch(Event::OptimizationStep)
    }

    /// Record an externally evaluated point for `tag`.
    ///
    /// Publishes one step event and, when `tag` drives the bounds
    /// transformer, applies the transformer's new bounds to every tag.
    pub fn register(&mut self, tag: &str, params: &ParamSet, target: f64) -> CboResult<()> {
        self.space_mut(tag)?.register(params, target)?;
        debug!("tag {}: registered {:?} -> {}", tag, params, target);
        self.dispatch(Event::OptimizationStep)?;

        let drives_transformer = self
            .bounds_transformer
            .as_ref()
            .is_some_and(|(driver, _)| driver == tag);
        if drives_transformer {
            self.apply_bounds_transformer()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Suggestion
    // -----------------------------------------------------------------------

    /// Propose the next point to evaluate.
    ///
    /// With no primary observations yet, this is a uniform draw inside the
    /// bounds and no surrogate is touched. Otherwise every non-empty tag's
    /// surrogate is refit if its store grew since the last fit, and the
    /// acquisition score is maximized.
    pub fn suggest(&mut self, utility: &UtilityFunction) -> CboResult<ParamSet> {
        let primary = &self.tags[0];
        let space = self
            .spaces
            .get(primary)
            .ok_or_else(|| CboError::UnknownTag { tag: primary.clone() })?;

        let Some(y_max) = space.max_target() else {
            debug!("tag {}: no observations yet, suggesting a random point", primary);
            return Ok(space.random_sample(&mut self.rng));
        };

        self.state = OptimizerState::Fitting;
        for tag in &self.tags {
            let (Some(tag_space), Some(slot)) = (self.spaces.get(tag), self.surrogates.get_mut(tag))
            else {
                return Err(CboError::UnknownTag { tag: tag.clone() });
            };
            if tag_space.is_empty() {
                debug!("tag {}: no observations, skipping surrogate fit", tag);
                continue;
            }
            if slot.is_stale(tag_space) {
                slot.fit(tag_space)?;
            }
        }

        self.state = OptimizerState::Suggesting;
        let objective_model = self
            .surrogates
            .get(primary)
            .ok_or_else(|| CboError::UnknownTag { tag: primary.clone() })?;
        let mut constraint_models = Vec::with_capacity(self.constraints.len());
        for (tag, limit) in &self.constraints {
            match (self.spaces.get(tag), self.surrogates.get(tag)) {
                (Some(tag_space), Some(slot)) if !tag_space.is_empty() => {
                    constraint_models.push((slot, *limit));
                }
                (Some(_), Some(_)) => debug!("constraint {}: no observations, ignored", tag),
                _ => return Err(CboError::UnknownTag { tag: tag.clone() }),
            }
        }

        let score = |x: &[f64]| -> CboResult<f64> {
            let value = utility.score(objective_model.predict(x)?, y_max);
            if constraint_models.is_empty() {
                return Ok(value);
            }
            let mut probability = 1.0;
            for (slot, limit) in &constraint_models {
                probability *= feasibility(slot.predict(x)?, *limit);
            }
            Ok(weight_by_feasibility(value, probability))
        };

        let optimum = self.maximizer.maximize(score, space.intervals(), &mut self.rng)?;
        debug!(
            "suggesting {:?} (acquisition {:.6}, kappa {:.4})",
            optimum.x,
            optimum.value,
            utility.kappa()
        );
        space.array_to_params(&optimum.x)
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run the optimization loop.
    ///
    /// Queues `init_points` random points (at least one when nothing has
    /// been observed or queued), then evaluates queued points followed by
    /// `n_iter` model-based suggestions. Every point is evaluated for every
    /// tag and publishes exactly one step event. A failing objective,
    /// regressor or subscriber stops the run and leaves the stores with
    /// whatever was recorded before the failure.
    pub fn maximize(&mut self, options: MaximizeOptions<R::Params>) -> CboResult<()> {
        options.validate()?;
        for (tag, params) in &options.gp_params {
            self.set_gp_params(tag, params)?;
        }

        self.iterations = 0;
        self.state = OptimizerState::Priming;
        self.dispatch(Event::OptimizationStart)?;
        self.prime_queue(options.init_points);

        let mut utility = options.utility();
        info!(
            "Maximizing with {} ({} queued, {} iterations)",
            utility.kind(),
            self.queue.len(),
            options.n_iter
        );

        while !self.queue.is_empty() || self.iterations < options.n_iter {
            match self.queue.next() {
                Some(point) => {
                    self.state = OptimizerState::DrainingQueue;
                    self.evaluate_point(&point)?;
                }
                None => {
                    utility.update_params();
                    let point = self.suggest(&utility)?;
                    self.iterations += 1;
                    self.evaluate_point(&point)?;
                    self.apply_bounds_transformer()?;
                    self.state = OptimizerState::Idle;
                }
            }
        }

        self.state = OptimizerState::Terminated;
        match self.spaces.get(&self.tags[0]).and_then(|s| s.max_target()) {
            Some(best) => info!("Optimization complete: best {} = {:.6}", self.tags[0], best),
            None => warn!("Optimization complete without observations"),
        }
        self.dispatch(Event::OptimizationEnd)
    }

    fn prime_queue(&mut self, init_points: usize) {
        let Some(space) = self.spaces.get(&self.tags[0]) else {
            return;
        };
        let n = if self.queue.is_empty() && space.is_empty() {
            init_points.max(1)
        } else {
            init_points
        };
        for _ in 0..n {
            self.queue.add(space.random_sample(&mut self.rng));
        }
        debug!("queued {} initial points", n);
    }

    /// Evaluate one point for every tag, then publish a single step event.
    fn evaluate_point(&mut self, params: &ParamSet) -> CboResult<()> {
        for tag in &self.tags {
            let space = self
                .spaces
                .get_mut(tag)
                .ok_or_else(|| CboError::UnknownTag { tag: tag.clone() })?;
            let objective = &mut self.objective;
            let target = space.probe(params, |p| objective.evaluate(tag, p))?;
            debug!("tag {}: {:?} -> {}", tag, params, target);
        }
        self.dispatch(Event::OptimizationStep)
    }

    fn apply_bounds_transformer(&mut self) -> CboResult<()> {
        let Some((tag, transformer)) = self.bounds_transformer.as_mut() else {
            return Ok(());
        };
        let space = self
            .spaces
            .get(tag.as_str())
            .ok_or_else(|| CboError::UnknownTag { tag: tag.clone() })?;
        let new_bounds = transformer.transform(space)?;
        self.set_bounds(&new_bounds)
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Replace the bounds of every tag. Nothing changes unless the new
    /// bounds are valid for the shared vocabulary.
    pub fn set_bounds(&mut self, new_bounds: &Bounds) -> CboResult<()> {
        new_bounds.validate()?;
        if !self.vocabulary.matches(new_bounds) {
            return Err(domain_error!(
                "new bounds {:?} do not match the parameter vocabulary {:?}",
                new_bounds.names().collect::<Vec<_>>(),
                self.vocabulary.names()
            ));
        }
        for space in self.spaces.values_mut() {
            space.set_bounds(new_bounds)?;
        }
        debug!("bounds updated to {:?}", new_bounds);
        Ok(())
    }

    /// Reconfigure the regressor of `tag`.
    pub fn set_gp_params(&mut self, tag: &str, params: &R::Params) -> CboResult<()> {
        self.surrogates
            .get_mut(tag)
            .ok_or_else(|| CboError::UnknownTag { tag: tag.to_string() })?
            .configure(params)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Best observation for `tag`.
    pub fn max(&self, tag: &str) -> CboResult<&Observation> {
        self.space_ref(tag)?.max()
    }

    /// Every observation for `tag`, in registration order.
    pub fn res(&self, tag: &str) -> CboResult<&[Observation]> {
        self.space_ref(tag)?.res()
    }

    /// Current bounds (identical for every tag).
    pub fn bounds(&self) -> CboResult<Bounds> {
        Ok(self.space_ref(&self.tags[0])?.bounds())
    }

    pub fn state(&self) -> OptimizerState {
        self.state
    }

    /// Model-based iterations completed in the current or last run.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn space_ref(&self, tag: &str) -> CboResult<&TargetSpace> {
        self.spaces
            .get(tag)
            .ok_or_else(|| CboError::UnknownTag { tag: tag.to_string() })
    }

    fn space_mut(&mut self, tag: &str) -> CboResult<&mut TargetSpace> {
        self.spaces
            .get_mut(tag)
            .ok_or_else(|| CboError::UnknownTag { tag: tag.to_string() })
    }
}

impl<R: Regressor, L: LocalMaximizer> OptimizerView for BayesianOptimizer<R, L> {
    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn space(&self, tag: &str) -> CboResult<&TargetSpace> {
        self.space_ref(tag)
    }

    fn state(&self) -> OptimizerState {
        self.state
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl<R: Regressor, L: LocalMaximizer> fmt::Debug for BayesianOptimizer<R, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BayesianOptimizer")
            .field("tags", &self.tags)
            .field("constraints", &self.constraints)
            .field("state", &self.state)
            .field("iterations", &self.iterations)
            .field("pending", &self.queue.len())
            .field("events", &self.events)
            .finish()
    }
}
