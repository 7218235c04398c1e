//! The black-box function being optimized.

use std::collections::HashMap;
use std::fmt;

use cbo_types::{CboError, CboResult, ParamSet};

/// Black-box evaluation for one tag at one point.
///
/// Every plain `FnMut(&ParamSet) -> f64` closure is an objective that
/// returns the same signal for every tag. Use [`PerTagObjective`] to give
/// each tag its own function.
pub trait Objective {
    fn evaluate(&mut self, tag: &str, params: &ParamSet) -> CboResult<f64>;
}

impl<F> Objective for F
where
    F: FnMut(&ParamSet) -> f64,
{
    fn evaluate(&mut self, tag: &str, params: &ParamSet) -> CboResult<f64> {
        finite(tag, self(params))
    }
}

fn finite(tag: &str, value: f64) -> CboResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CboError::Evaluation {
            tag: tag.to_string(),
            message: format!("objective returned a non-finite value: {value}"),
        })
    }
}

type TagFn = Box<dyn FnMut(&ParamSet) -> CboResult<f64> + Send>;

/// One function per tag, e.g. a cost for `"objective"` and a resource usage
/// for `"constraint"`.
#[derive(Default)]
pub struct PerTagObjective {
    functions: HashMap<String, TagFn>,
}

impl PerTagObjective {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an infallible function for `tag`.
    pub fn with<F>(mut self, tag: impl Into<String>, mut f: F) -> Self
    where
        F: FnMut(&ParamSet) -> f64 + Send + 'static,
    {
        self.functions
            .insert(tag.into(), Box::new(move |p: &ParamSet| -> CboResult<f64> { Ok(f(p)) }));
        self
    }

    /// Register a function for `tag` that may fail.
    pub fn with_fallible<F>(mut self, tag: impl Into<String>, f: F) -> Self
    where
        F: FnMut(&ParamSet) -> CboResult<f64> + Send + 'static,
    {
        self.functions.insert(tag.into(), Box::new(f));
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.functions.contains_key(tag)
    }
}

impl Objective for PerTagObjective {
    fn evaluate(&mut self, tag: &str, params: &ParamSet) -> CboResult<f64> {
        let f = self
            .functions
            .get_mut(tag)
            .ok_or_else(|| CboError::UnknownTag { tag: tag.to_string() })?;
        let value = f(params)?;
        finite(tag, value)
    }
}

impl fmt::Debug for PerTagObjective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&String> = self.functions.keys().collect();
        tags.sort();
        f.debug_struct("PerTagObjective").field("tags", &tags).finish()
    }
}
