//! FIFO of points waiting to be evaluated.

use std::collections::VecDeque;

use cbo_types::ParamSet;

/// Pending-probe queue.
///
/// `next` returns `None` once drained; that is the signal to switch from
/// warm-start evaluation to model-based suggestion.
#[derive(Debug, Clone, Default)]
pub struct ProbeQueue {
    pending: VecDeque<ParamSet>,
}

impl ProbeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point to the back of the queue.
    pub fn add(&mut self, params: ParamSet) {
        self.pending.push_back(params);
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<ParamSet> {
        self.pending.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
