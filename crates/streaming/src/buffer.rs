//! Per-answer accumulation buffer.
//!
//! One `StreamingBuffer` exists per in-flight answer: raw text deltas from
//! the model land here, and the pacer consumes the assembled text once the
//! source reports completion. Destroyed with the turn.

/// Accumulates the answer text for one in-flight turn.
#[derive(Debug, Default)]
pub struct StreamingBuffer {
    accumulated: String,
    /// Characters already delivered to the consumer. Monotonically
    /// non-decreasing until `reset`.
    position: usize,
    /// Expected final length in characters, when the source announced one.
    total_expected: Option<usize>,
}

impl StreamingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expected(total: usize) -> Self {
        Self {
            total_expected: Some(total),
            ..Self::default()
        }
    }

    /// Append a raw text delta from the model.
    pub fn push(&mut self, delta: &str) {
        self.accumulated.push_str(delta);
    }

    /// The full accumulated text so far.
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn char_len(&self) -> usize {
        self.accumulated.chars().count()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Record delivery progress. Positions never move backwards; a stale
    /// or duplicate report is ignored.
    pub fn mark_delivered(&mut self, position: usize) {
        if position > self.position {
            self.position = position;
        }
    }

    /// Whether everything accumulated (and expected) has been delivered.
    pub fn is_drained(&self) -> bool {
        let accumulated_done = self.position >= self.char_len();
        match self.total_expected {
            Some(total) => accumulated_done && self.char_len() >= total,
            None => accumulated_done,
        }
    }

    /// Discard everything, e.g. when a turn is cancelled.
    pub fn reset(&mut self) {
        self.accumulated.clear();
        self.position = 0;
        self.total_expected = None;
    }
}
