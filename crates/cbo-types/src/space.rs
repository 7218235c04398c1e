//! Parameter-space value types: intervals, bounds, assignments and observations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::CboResult;
use crate::domain_error;

/// A concrete parameter assignment, keyed by parameter name.
///
/// Keys are kept sorted so the iteration order always matches the
/// vocabulary order used for array encoding.
pub type ParamSet = BTreeMap<String, f64>;

/// Closed real interval `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub low: f64,
    pub high: f64,
}

impl Interval {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn center(&self) -> f64 {
        0.5 * (self.low + self.high)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && value <= self.high
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.low).min(self.high)
    }

    fn is_valid(&self) -> bool {
        self.low.is_finite()
            && self.high.is_finite()
            && self.low <= self.high
            && self.width().is_finite()
    }
}

/// Search-domain bounds: parameter name to closed interval.
///
/// The (sorted) key set is the parameter vocabulary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bounds {
    intervals: BTreeMap<String, Interval>,
}

impl Bounds {
    pub fn new() -> Self {
        Self {
            intervals: BTreeMap::new(),
        }
    }

    /// Builder-style insertion of a `[low, high]` range.
    pub fn add(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.intervals.insert(name.into(), Interval::new(low, high));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, interval: Interval) -> Option<Interval> {
        self.intervals.insert(name.into(), interval)
    }

    pub fn get(&self, name: &str) -> Option<&Interval> {
        self.intervals.get(name)
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Parameter names in vocabulary order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.intervals.keys().map(String::as_str)
    }

    pub fn intervals(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Interval)> {
        self.intervals.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True when both bounds describe exactly the same parameter names.
    /// Check the bounds are non-empty and every interval is finite with
    /// `low <= high`.
    pub fn validate(&self) -> CboResult<()> {
        if self.is_empty() {
            return Err(domain_error!("bounds must define at least one parameter"));
        }
        for (name, interval) in self.iter() {
            if !interval.is_valid() {
                return Err(domain_error!(
                    "invalid interval for {}: [{}, {}]",
                    name,
                    interval.low,
                    interval.high
                ));
            }
        }
        Ok(())
    }
}

impl<K: Into<String>> FromIterator<(K, (f64, f64))> for Bounds {
    fn from_iter<I: IntoIterator<Item = (K, (f64, f64))>>(iter: I) -> Self {
        let intervals = iter
            .into_iter()
            .map(|(name, (low, high))| (name.into(), Interval::new(low, high)))
            .collect();
        Self { intervals }
    }
}

/// One evaluated point: the parameter assignment and its observed target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub params: ParamSet,
    pub target: f64,
}

impl Observation {
    pub fn new(params: ParamSet, target: f64) -> Self {
        Self { params, target }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_keep_sorted_vocabulary() {
        let bounds = Bounds::new().add("y", -1.0, 1.0).add("x", 0.0, 2.0);
        let names: Vec<&str> = bounds.names().collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(bounds.get("x").unwrap().width(), 2.0);
    }

    #[test]
    fn validate_rejects_inverted_and_empty_bounds() {
        assert!(Bounds::new().validate().is_err());
        assert!(Bounds::new().add("x", 1.0, 0.0).validate().is_err());
        assert!(Bounds::new().add("x", 0.0, f64::INFINITY).validate().is_err());
        // Finite endpoints whose width overflows cannot be sampled from.
        assert!(matches!(
            Bounds::new().add("x", -1e308, 1e308).validate(),
            Err(crate::CboError::Domain(_))
        ));
        assert!(Bounds::new().add("x", -1e300, 1e300).validate().is_ok());
        assert!(Bounds::new().add("x", 0.5, 0.5).validate().is_ok());
    }

    #[test]
    fn interval_clamp_and_contains() {
        let interval = Interval::new(-1.0, 1.0);
        assert_eq!(interval.clamp(3.0), 1.0);
        assert_eq!(interval.clamp(-3.0), -1.0);
        assert!(interval.contains(0.0));
        assert!(!interval.contains(1.0001));
        assert_eq!(interval.center(), 0.0);
    }

    #[test]
    fn bounds_serialize_as_plain_map() {
        let bounds = Bounds::new().add("x", 0.0, 1.0);
        let json = serde_json::to_value(&bounds).unwrap();
        assert_eq!(json, serde_json::json!({"x": {"low": 0.0, "high": 1.0}}));
        let back: Bounds = serde_json::from_value(json).unwrap();
        assert_eq!(bounds, back);
    }
}
