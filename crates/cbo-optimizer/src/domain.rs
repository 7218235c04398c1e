//! Bounds transformers: policies that shrink or shift the search domain as
//! evidence accumulates.

use serde::{Deserialize, Serialize};
use tracing::debug;

use cbo_types::{config_error, Bounds, CboError, CboResult, Interval};

use crate::target_space::TargetSpace;

/// A policy proposing new bounds from one tag's observation store.
///
/// Transformers only read the store; the optimizer applies the returned
/// bounds to every tag.
pub trait DomainTransformer: Send {
    /// Capture the starting domain. Called once at optimizer construction.
    fn initialize(&mut self, space: &TargetSpace) -> CboResult<()>;

    /// Propose bounds given the store's current history.
    fn transform(&mut self, space: &TargetSpace) -> CboResult<Bounds>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ReductionState {
    keys: Vec<String>,
    original: Vec<Interval>,
    previous_optimal: Vec<f64>,
    current_optimal: Vec<f64>,
    previous_d: Vec<f64>,
    current_d: Vec<f64>,
    /// Current window width per dimension.
    r: Vec<f64>,
}

/// Sequential domain reduction.
///
/// Recenters the domain on the incumbent optimum every step and contracts
/// it at a rate driven by how the optimum moves: steady panning contracts
/// at `gamma_pan`, oscillation at `gamma_osc`, and a stationary optimum at
/// `eta`. Windows never leave the original bounds and never get narrower
/// than `minimum_window`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequentialDomainReduction {
    pub gamma_osc: f64,
    pub gamma_pan: f64,
    pub eta: f64,
    pub minimum_window: f64,
    state: Option<ReductionState>,
    history: Vec<Bounds>,
}

impl Default for SequentialDomainReduction {
    fn default() -> Self {
        Self {
            gamma_osc: 0.7,
            gamma_pan: 1.0,
            eta: 0.9,
            minimum_window: 0.0,
            state: None,
            history: Vec::new(),
        }
    }
}

impl SequentialDomainReduction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_minimum_window(mut self, minimum_window: f64) -> Self {
        self.minimum_window = minimum_window;
        self
    }

    pub fn with_rates(mut self, gamma_osc: f64, gamma_pan: f64, eta: f64) -> Self {
        self.gamma_osc = gamma_osc;
        self.gamma_pan = gamma_pan;
        self.eta = eta;
        self
    }

    /// Every set of bounds produced so far, starting with the original.
    pub fn history(&self) -> &[Bounds] {
        &self.history
    }

    fn validate(&self) -> CboResult<()> {
        for (name, value) in [
            ("gamma_osc", self.gamma_osc),
            ("gamma_pan", self.gamma_pan),
            ("eta", self.eta),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(config_error!("{} must be positive, got {}", name, value));
            }
        }
        if !(self.minimum_window.is_finite() && self.minimum_window >= 0.0) {
            return Err(config_error!(
                "minimum_window must be non-negative, got {}",
                self.minimum_window
            ));
        }
        Ok(())
    }

    fn contraction_rate(&self, current_d: f64, previous_d: f64) -> f64 {
        let c = current_d * previous_d;
        let c_hat = c.abs().sqrt() * c.signum();
        let gamma = 0.5 * (self.gamma_pan * (1.0 + c_hat) + self.gamma_osc * (1.0 - c_hat));
        self.eta + current_d.abs() * (gamma - self.eta)
    }

    /// Clip a window into the original interval and widen it to the minimum
    /// window, shifting it back inside the original interval if needed.
    fn trim(&self, mut low: f64, mut high: f64, original: &Interval) -> Interval {
        low = low.max(original.low);
        high = high.min(original.high);

        let window = self.minimum_window.min(original.width());
        if high - low < window {
            let center = 0.5 * (low + high);
            low = center - 0.5 * window;
            high = center + 0.5 * window;
            if low < original.low {
                high += original.low - low;
                low = original.low;
            }
            if high > original.high {
                low -= high - original.high;
                high = original.high;
            }
        }
        Interval::new(low, high)
    }
}

fn relative_shift(current: f64, previous: f64, r: f64) -> f64 {
    if r > 0.0 {
        2.0 * (current - previous) / r
    } else {
        0.0
    }
}

impl DomainTransformer for SequentialDomainReduction {
    fn initialize(&mut self, space: &TargetSpace) -> CboResult<()> {
        self.validate()?;
        let original = space.intervals().to_vec();
        let centers: Vec<f64> = original.iter().map(Interval::center).collect();
        let zeros = vec![0.0; original.len()];

        let r = original
            .iter()
            .map(|b| self.contraction_rate(0.0, 0.0) * b.width())
            .collect();

        self.history = vec![space.bounds()];
        self.state = Some(ReductionState {
            keys: space.keys().to_vec(),
            original,
            previous_optimal: centers.clone(),
            current_optimal: centers,
            previous_d: zeros.clone(),
            current_d: zeros,
            r,
        });
        Ok(())
    }

    fn transform(&mut self, space: &TargetSpace) -> CboResult<Bounds> {
        let optimum = space.max_array()?;
        let mut state = self
            .state
            .take()
            .ok_or_else(|| CboError::Internal("domain reduction used before initialize".into()))?;
        let expected = state.keys.len();
        if optimum.len() != expected {
            let actual = optimum.len();
            self.state = Some(state);
            return Err(CboError::DimensionMismatch { expected, actual });
        }

        state.previous_optimal = std::mem::replace(&mut state.current_optimal, optimum);
        state.previous_d = std::mem::take(&mut state.current_d);
        state.current_d = state
            .current_optimal
            .iter()
            .zip(&state.previous_optimal)
            .zip(&state.r)
            .map(|((cur, prev), r)| relative_shift(*cur, *prev, *r))
            .collect();
        for i in 0..state.r.len() {
            state.r[i] *= self.contraction_rate(state.current_d[i], state.previous_d[i]);
        }

        let mut bounds = Bounds::new();
        for i in 0..state.keys.len() {
            let center = state.current_optimal[i];
            let half = 0.5 * state.r[i];
            let interval = self.trim(center - half, center + half, &state.original[i]);
            bounds.insert(state.keys[i].clone(), interval);
        }
        debug!("domain reduced to {:?}", bounds);

        self.state = Some(state);
        self.history.push(bounds.clone());
        Ok(bounds)
    }
}
