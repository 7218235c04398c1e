//! Acquisition functions and the exploration schedule.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use cbo_types::{config_error, CboError};

use crate::surrogate::Prediction;

/// Which acquisition function scores candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionKind {
    /// Upper confidence bound: `mean + kappa * std`.
    UpperConfidenceBound,
    /// Expected improvement over the incumbent by at least `xi`.
    ExpectedImprovement,
    /// Probability of improving on the incumbent by at least `xi`.
    ProbabilityOfImprovement,
}

impl Default for AcquisitionKind {
    fn default() -> Self {
        Self::UpperConfidenceBound
    }
}

impl AcquisitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpperConfidenceBound => "ucb",
            Self::ExpectedImprovement => "ei",
            Self::ProbabilityOfImprovement => "poi",
        }
    }
}

impl fmt::Display for AcquisitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcquisitionKind {
    type Err = CboError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ucb" => Ok(Self::UpperConfidenceBound),
            "ei" => Ok(Self::ExpectedImprovement),
            "poi" => Ok(Self::ProbabilityOfImprovement),
            other => Err(config_error!(
                "unknown acquisition function {:?}; expected one of ucb, ei, poi",
                other
            )),
        }
    }
}

/// An acquisition function together with its exploration schedule.
///
/// `kappa` is held for `kappa_decay_delay` calls to [`update_params`] and
/// multiplied by `kappa_decay` on every call after that.
///
/// [`update_params`]: UtilityFunction::update_params
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilityFunction {
    kind: AcquisitionKind,
    kappa: f64,
    xi: f64,
    kappa_decay: f64,
    kappa_decay_delay: usize,
    iterations: usize,
}

impl UtilityFunction {
    pub fn new(kind: AcquisitionKind, kappa: f64, xi: f64) -> Self {
        Self {
            kind,
            kappa,
            xi,
            kappa_decay: 1.0,
            kappa_decay_delay: 0,
            iterations: 0,
        }
    }

    pub fn with_decay(mut self, kappa_decay: f64, kappa_decay_delay: usize) -> Self {
        self.kappa_decay = kappa_decay;
        self.kappa_decay_delay = kappa_decay_delay;
        self
    }

    pub fn kind(&self) -> AcquisitionKind {
        self.kind
    }

    /// Current (possibly decayed) exploration weight.
    pub fn kappa(&self) -> f64 {
        self.kappa
    }

    pub fn xi(&self) -> f64 {
        self.xi
    }

    /// Number of outer iterations seen so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Advance the schedule by one outer iteration.
    pub fn update_params(&mut self) {
        self.iterations += 1;
        if self.iterations > self.kappa_decay_delay {
            self.kappa *= self.kappa_decay;
        }
    }

    /// Score one prediction against the incumbent best target `y_max`.
    pub fn score(&self, prediction: Prediction, y_max: f64) -> f64 {
        let Prediction { mean, std } = prediction;
        match self.kind {
            AcquisitionKind::UpperConfidenceBound => mean + self.kappa * std,
            AcquisitionKind::ExpectedImprovement => {
                let improvement = mean - y_max - self.xi;
                if std <= 0.0 {
                    return improvement.max(0.0);
                }
                let z = improvement / std;
                improvement * norm_cdf(z) + std * norm_pdf(z)
            }
            AcquisitionKind::ProbabilityOfImprovement => {
                let improvement = mean - y_max - self.xi;
                if std <= 0.0 {
                    return if improvement > 0.0 { 1.0 } else { 0.0 };
                }
                norm_cdf(improvement / std)
            }
        }
    }
}

impl Default for UtilityFunction {
    fn default() -> Self {
        Self::new(AcquisitionKind::UpperConfidenceBound, 2.576, 0.0)
    }
}

/// Probability that a constraint signal with the given prediction stays at
/// or below `limit`.
pub fn feasibility(prediction: Prediction, limit: f64) -> f64 {
    if prediction.std <= 0.0 {
        return if prediction.mean <= limit { 1.0 } else { 0.0 };
    }
    norm_cdf((limit - prediction.mean) / prediction.std)
}

/// Floor on the feasibility weight so negative scores stay finite.
const MIN_FEASIBILITY: f64 = 1e-12;

/// Combine an acquisition score with a probability of feasibility.
///
/// Lower feasibility always lowers the score: non-negative scores are scaled
/// down toward zero and negative scores are pushed further down.
pub fn weight_by_feasibility(score: f64, probability: f64) -> f64 {
    if score >= 0.0 {
        score * probability
    } else {
        score / probability.max(MIN_FEASIBILITY)
    }
}

// ---------------------------------------------------------------------------
// Normal distribution helpers
// ---------------------------------------------------------------------------

/// Standard normal PDF.
pub(crate) fn norm_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Standard normal CDF (Abramowitz-Stegun rational approximation).
pub(crate) fn norm_cdf(x: f64) -> f64 {
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }

    let abs_x = x.abs();
    let t = 1.0 / (1.0 + 0.231_641_9 * abs_x);
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782 + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let cdf = 1.0 - norm_pdf(abs_x) * poly;

    if x >= 0.0 {
        cdf
    } else {
        1.0 - cdf
    }
}
