//! # cbo-optimizer
//!
//! Sequential model-based optimization of expensive black-box functions.
//!
//! A [`BayesianOptimizer`] keeps one observation store and one surrogate per
//! tag (typically an `"objective"` to maximize and a `"constraint"` to keep
//! feasible), proposes points by maximizing an acquisition function over the
//! surrogate, and publishes lifecycle events to subscribers. Search bounds
//! can shrink as evidence accumulates through a [`DomainTransformer`].

mod acquisition;
mod domain;
mod logger;
mod maximizer;
mod objective;
mod observer;
mod optimizer;
mod queue;
mod surrogate;
mod target_space;

pub use acquisition::{feasibility, weight_by_feasibility, AcquisitionKind, UtilityFunction};
pub use domain::{DomainTransformer, SequentialDomainReduction};
pub use logger::StepLogger;
pub use maximizer::{
    AcquisitionMaximizer, AcquisitionSettings, LocalMaximizer, LocalOptimum, PatternSearch,
};
pub use objective::{Objective, PerTagObjective};
pub use observer::{shared, EventBus, Observer, OptimizerView, SharedObserver, SubscriberId};
pub use optimizer::{BayesianOptimizer, MaximizeOptions, OptimizerConfig, OptimizerState};
pub use queue::ProbeQueue;
pub use surrogate::{GaussianProcess, GpParams, Prediction, Regressor, SurrogateSlot};
pub use target_space::{TargetSpace, Vocabulary};
