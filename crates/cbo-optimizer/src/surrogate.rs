//! Surrogate models: the regressor contract, the per-tag model slot and a
//! default Gaussian-process regressor.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use cbo_types::{CboError, CboResult};

use crate::target_space::TargetSpace;

/// Posterior mean and standard deviation at one point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub mean: f64,
    pub std: f64,
}

/// Regression capability used as a surrogate for one tag.
///
/// Implementations must be `Sync`: predictions are evaluated concurrently
/// during acquisition search.
pub trait Regressor: Send + Sync {
    /// Hyper-parameters accepted by [`Regressor::configure`].
    type Params: Clone + fmt::Debug + Send + Sync;

    fn configure(&mut self, params: &Self::Params) -> CboResult<()>;

    /// Fit on encoded rows `x` and targets `y` (same length, at least one).
    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> CboResult<()>;

    fn predict(&self, x: &[f64]) -> CboResult<Prediction>;
}

/// One tag's regressor plus bookkeeping of what it was fitted on.
#[derive(Debug, Clone)]
pub struct SurrogateSlot<R> {
    tag: String,
    regressor: R,
    fitted_on: Option<usize>,
}

impl<R: Regressor> SurrogateSlot<R> {
    pub fn new(tag: impl Into<String>, regressor: R) -> Self {
        Self {
            tag: tag.into(),
            regressor,
            fitted_on: None,
        }
    }

    pub fn configure(&mut self, params: &R::Params) -> CboResult<()> {
        self.regressor.configure(params)?;
        self.fitted_on = None;
        Ok(())
    }

    /// Refit from the tag's store.
    pub fn fit(&mut self, space: &TargetSpace) -> CboResult<()> {
        if space.is_empty() {
            return Err(CboError::EmptyStore {
                tag: self.tag.clone(),
            });
        }
        self.regressor.fit(space.params(), space.targets())?;
        self.fitted_on = Some(space.len());
        debug!("tag {}: surrogate fitted on {} observations", self.tag, space.len());
        Ok(())
    }

    /// True when the store grew (or nothing was fitted) since the last fit.
    pub fn is_stale(&self, space: &TargetSpace) -> bool {
        self.fitted_on != Some(space.len())
    }

    pub fn predict(&self, x: &[f64]) -> CboResult<Prediction> {
        if self.fitted_on.is_none() {
            return Err(CboError::Regressor {
                message: format!("surrogate for tag {} has not been fitted", self.tag),
            });
        }
        self.regressor.predict(x)
    }
}

// ---------------------------------------------------------------------------
// Gaussian process
// ---------------------------------------------------------------------------

/// Hyper-parameters of [`GaussianProcess`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpParams {
    /// Fixed isotropic length scale. `None` uses the per-dimension spread of
    /// the training inputs.
    pub length_scale: Option<f64>,
    /// Kernel amplitude on the (normalized) target scale.
    pub signal_variance: f64,
    /// White-noise variance added to the kernel diagonal.
    pub noise_level: f64,
    /// Standardize targets before fitting.
    pub normalize_y: bool,
}

impl Default for GpParams {
    fn default() -> Self {
        Self {
            length_scale: None,
            signal_variance: 1.0,
            noise_level: 1e-3,
            normalize_y: true,
        }
    }
}

impl GpParams {
    pub fn with_length_scale(mut self, length_scale: f64) -> Self {
        self.length_scale = Some(length_scale);
        self
    }

    pub fn with_noise_level(mut self, noise_level: f64) -> Self {
        self.noise_level = noise_level;
        self
    }

    fn validate(&self) -> CboResult<()> {
        if let Some(l) = self.length_scale {
            if !(l.is_finite() && l > 0.0) {
                return Err(cbo_types::config_error!("length_scale must be positive, got {}", l));
            }
        }
        if !(self.signal_variance.is_finite() && self.signal_variance > 0.0) {
            return Err(cbo_types::config_error!(
                "signal_variance must be positive, got {}",
                self.signal_variance
            ));
        }
        if !(self.noise_level.is_finite() && self.noise_level >= 0.0) {
            return Err(cbo_types::config_error!(
                "noise_level must be non-negative, got {}",
                self.noise_level
            ));
        }
        Ok(())
    }
}

/// Precomputed √5 constant.
const SQRT_5: f64 = 2.236_067_977_499_79;

/// Diagonal jitter tried, in order, when the kernel matrix is not positive
/// definite.
const JITTER_LADDER: [f64; 5] = [0.0, 1e-10, 1e-8, 1e-6, 1e-4];

/// Matérn 5/2 kernel with per-dimension length scales.
///
/// `k(x1, x2) = σ² (1 + √5 r + 5/3 r²) exp(-√5 r)`
fn matern52(x1: &[f64], x2: &[f64], lengthscales: &[f64], signal_var: f64) -> f64 {
    let r_sq: f64 = x1
        .iter()
        .zip(x2)
        .zip(lengthscales)
        .map(|((a, b), l)| ((a - b) / l).powi(2))
        .sum();
    let sqrt5_r = SQRT_5 * r_sq.sqrt();
    signal_var * (1.0 + sqrt5_r + 5.0 / 3.0 * r_sq) * (-sqrt5_r).exp()
}

#[derive(Debug, Clone)]
struct GpModel {
    cholesky: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
    x_train: Vec<Vec<f64>>,
    lengthscales: Vec<f64>,
    y_mean: f64,
    y_std: f64,
}

/// Gaussian-process regressor with a Matérn 5/2 kernel and white noise.
#[derive(Debug, Clone, Default)]
pub struct GaussianProcess {
    params: GpParams,
    model: Option<GpModel>,
}

impl GaussianProcess {
    pub fn new(params: GpParams) -> Self {
        Self {
            params,
            model: None,
        }
    }

    pub fn params(&self) -> &GpParams {
        &self.params
    }

    fn lengthscales(&self, x: &[Vec<f64>]) -> Vec<f64> {
        let d = x.first().map_or(0, Vec::len);
        if let Some(l) = self.params.length_scale {
            return vec![l; d];
        }
        let n = x.len() as f64;
        (0..d)
            .map(|j| {
                let mean = x.iter().map(|row| row[j]).sum::<f64>() / n;
                let var = x.iter().map(|row| (row[j] - mean).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                if std > 1e-8 {
                    std
                } else {
                    1.0
                }
            })
            .collect()
    }
}

impl Regressor for GaussianProcess {
    type Params = GpParams;

    fn configure(&mut self, params: &GpParams) -> CboResult<()> {
        params.validate()?;
        self.params = params.clone();
        self.model = None;
        Ok(())
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> CboResult<()> {
        if x.is_empty() || x.len() != y.len() {
            return Err(CboError::Regressor {
                message: format!("cannot fit on {} rows and {} targets", x.len(), y.len()),
            });
        }
        let n = y.len();

        let (y_mean, y_std) = if self.params.normalize_y {
            let mean = y.iter().sum::<f64>() / n as f64;
            let var = y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
            let std = var.sqrt();
            (mean, if std > 1e-12 { std } else { 1.0 })
        } else {
            (0.0, 1.0)
        };
        let y_norm = DVector::from_iterator(n, y.iter().map(|v| (v - y_mean) / y_std));

        let lengthscales = self.lengthscales(x);
        let signal_var = self.params.signal_variance;
        let noise = self.params.noise_level;

        let mut cholesky = None;
        for jitter in JITTER_LADDER {
            let k = DMatrix::from_fn(n, n, |i, j| {
                let kij = matern52(&x[i], &x[j], &lengthscales, signal_var);
                if i == j {
                    kij + noise + jitter
                } else {
                    kij
                }
            });
            if let Some(c) = Cholesky::new(k) {
                if jitter > 0.0 {
                    debug!("kernel matrix needed jitter {} to factorize", jitter);
                }
                cholesky = Some(c);
                break;
            }
        }
        let cholesky = cholesky.ok_or_else(|| CboError::Regressor {
            message: "kernel matrix is not positive definite".to_string(),
        })?;

        let alpha = cholesky.solve(&y_norm);
        self.model = Some(GpModel {
            cholesky,
            alpha,
            x_train: x.to_vec(),
            lengthscales,
            y_mean,
            y_std,
        });
        Ok(())
    }

    fn predict(&self, x: &[f64]) -> CboResult<Prediction> {
        let model = self.model.as_ref().ok_or_else(|| CboError::Regressor {
            message: "gaussian process has not been fitted".to_string(),
        })?;
        let signal_var = self.params.signal_variance;
        let k_star = DVector::from_iterator(
            model.x_train.len(),
            model
                .x_train
                .iter()
                .map(|row| matern52(x, row, &model.lengthscales, signal_var)),
        );

        let mean = k_star.dot(&model.alpha);
        let v = model.cholesky.solve(&k_star);
        let var = (signal_var - k_star.dot(&v)).max(0.0);

        Ok(Prediction {
            mean: mean * model.y_std + model.y_mean,
            std: var.sqrt() * model.y_std,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target_space::Vocabulary;
    use cbo_types::{Bounds, ParamSet};
    use std::sync::Arc;

    fn training_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = [0.0, 0.25, 0.5, 0.75, 1.0].iter().map(|v| vec![*v]).collect();
        let y = x.iter().map(|row| -(row[0] - 0.5).powi(2)).collect();
        (x, y)
    }

    #[test]
    fn gp_interpolates_training_points() {
        let (x, y) = training_data();
        let mut gp = GaussianProcess::new(GpParams::default().with_noise_level(1e-8));
        gp.fit(&x, &y).unwrap();

        for (row, target) in x.iter().zip(&y) {
            let p = gp.predict(row).unwrap();
            assert!((p.mean - target).abs() < 1e-3, "mean {} vs {}", p.mean, target);
            assert!(p.std < 1e-2);
        }
    }

    #[test]
    fn gp_uncertainty_grows_away_from_data() {
        let (x, y) = training_data();
        let mut gp = GaussianProcess::new(GpParams::default().with_length_scale(0.2));
        gp.fit(&x, &y).unwrap();

        let near = gp.predict(&[0.5]).unwrap();
        let far = gp.predict(&[3.0]).unwrap();
        assert!(far.std > near.std);
    }

    #[test]
    fn gp_predict_before_fit_fails() {
        let gp = GaussianProcess::default();
        assert!(matches!(gp.predict(&[0.0]), Err(CboError::Regressor { .. })));
    }

    #[test]
    fn gp_rejects_invalid_params() {
        let mut gp = GaussianProcess::default();
        let bad = GpParams {
            signal_variance: -1.0,
            ..GpParams::default()
        };
        assert!(matches!(gp.configure(&bad), Err(CboError::Config(_))));
    }

    #[test]
    fn gp_handles_duplicate_inputs_with_jitter() {
        let x = vec![vec![0.3], vec![0.3]];
        let y = vec![1.0, 1.0];
        let mut gp = GaussianProcess::new(GpParams::default().with_noise_level(0.0));
        gp.fit(&x, &y).unwrap();
        assert!(gp.predict(&[0.3]).unwrap().mean.is_finite());
    }

    #[test]
    fn slot_fit_requires_observations() {
        let bounds = Bounds::new().add("x", 0.0, 1.0);
        let mut space =
            TargetSpace::new("constraint", Arc::new(Vocabulary::from_bounds(&bounds)), &bounds)
                .unwrap();
        let mut slot = SurrogateSlot::new("constraint", GaussianProcess::default());

        assert!(matches!(slot.fit(&space), Err(CboError::EmptyStore { .. })));
        assert!(matches!(slot.predict(&[0.5]), Err(CboError::Regressor { .. })));

        let params: ParamSet = [("x".to_string(), 0.4)].into_iter().collect();
        space.register(&params, 2.0).unwrap();
        assert!(slot.is_stale(&space));
        slot.fit(&space).unwrap();
        assert!(!slot.is_stale(&space));
        assert!(slot.predict(&[0.4]).is_ok());
    }
}
