use cbo_optimizer::{
    shared, AcquisitionKind, BayesianOptimizer, MaximizeOptions, OptimizerConfig, PerTagObjective,
    SequentialDomainReduction, StepLogger,
};
use cbo_types::{Bounds, ParamSet};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bounds = Bounds::new().add("x", -2.0, 2.0).add("y", -1.0, 3.0);

    // Maximize a bumpy surface while keeping x + y at or below 1.5.
    let objective = PerTagObjective::new()
        .with("objective", |p: &ParamSet| {
            let (x, y) = (p["x"], p["y"]);
            -(x - 0.5).powi(2) - (y - 1.0).powi(2) + 0.1 * (5.0 * x).sin()
        })
        .with("constraint", |p: &ParamSet| p["x"] + p["y"]);

    let config = OptimizerConfig::new(bounds)
        .with_tags(["objective", "constraint"])
        .with_constraint("constraint", 1.5)
        .with_seed(42);

    let mut optimizer = BayesianOptimizer::new(objective, config)?
        .with_bounds_transformer("objective", SequentialDomainReduction::new().with_minimum_window(0.2))?;

    let logger = shared(StepLogger::new());
    optimizer.subscribe_all("logger", logger.clone())?;

    let mut warm_start = ParamSet::new();
    warm_start.insert("x".to_string(), 0.0);
    warm_start.insert("y".to_string(), 0.0);
    optimizer.probe("objective", warm_start, true)?;

    let options = MaximizeOptions::new(5, 20)
        .with_acquisition(AcquisitionKind::ExpectedImprovement)
        .with_xi(0.01);
    optimizer.maximize(options)?;

    let best = optimizer.max("objective")?;
    println!("Best objective {:.4} at {:?}", best.target, best.params);
    println!("Final bounds: {:?}", optimizer.bounds()?);
    println!("Steps logged: {}", logger.lock().steps());

    Ok(())
}
