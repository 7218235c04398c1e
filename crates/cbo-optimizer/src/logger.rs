//! Progress reporting through `tracing`.

use tracing::{debug, info};

use cbo_types::{CboResult, Event, ParamSet};

use crate::observer::{Observer, OptimizerView};

/// Observer that reports run start, every improvement of the primary tag's
/// best target, and run end.
#[derive(Debug, Clone, Default)]
pub struct StepLogger {
    steps: usize,
    best: Option<f64>,
    best_params: Option<ParamSet>,
}

impl StepLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step events seen so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Best primary target seen at any step.
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_params(&self) -> Option<&ParamSet> {
        self.best_params.as_ref()
    }

    fn on_step(&mut self, optimizer: &dyn OptimizerView) -> CboResult<()> {
        self.steps += 1;
        let space = optimizer.primary_space()?;
        let Ok(current) = space.max() else {
            debug!("step {}: no observations yet", self.steps);
            return Ok(());
        };

        let improved = self.best.map_or(true, |best| current.target > best);
        if improved {
            info!(
                "step {} | tag {} | new best {:.6} at {:?}",
                self.steps,
                space.tag(),
                current.target,
                current.params
            );
            self.best = Some(current.target);
            self.best_params = Some(current.params.clone());
        } else {
            debug!(
                "step {} | tag {} | best remains {:.6}",
                self.steps,
                space.tag(),
                current.target
            );
        }
        Ok(())
    }
}

impl Observer for StepLogger {
    fn notify(&mut self, event: Event, optimizer: &dyn OptimizerView) -> CboResult<()> {
        match event {
            Event::OptimizationStart => {
                info!(
                    "Starting optimization over tags {:?} ({} queued points)",
                    optimizer.tags(),
                    optimizer.pending()
                );
                Ok(())
            }
            Event::OptimizationStep => self.on_step(optimizer),
            Event::OptimizationEnd => {
                match self.best {
                    Some(best) => info!(
                        "Optimization finished after {} steps ({} model-based); best target {:.6}",
                        self.steps,
                        optimizer.iterations(),
                        best
                    ),
                    None => info!("Optimization finished with no observations"),
                }
                Ok(())
            }
        }
    }
}
