//! Optimization lifecycle events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle marker dispatched by the optimizer to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Event {
    /// `maximize` is starting.
    OptimizationStart,
    /// A point was evaluated or registered.
    OptimizationStep,
    /// `maximize` finished.
    OptimizationEnd,
}

impl Event {
    /// Every lifecycle event, in dispatch order of a full run.
    pub const ALL: [Event; 3] = [
        Event::OptimizationStart,
        Event::OptimizationStep,
        Event::OptimizationEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptimizationStart => "optimization:start",
            Self::OptimizationStep => "optimization:step",
            Self::OptimizationEnd => "optimization:end",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
