//! Answer-generation phases.
//!
//! A phase is a named stage of answer generation used for status display:
//! the UI shows "thinking…", "running a tool…", and so on while the model
//! works. Phases are paced and ordered by the scheduler in
//! `cadenza-streaming`; this module only defines the vocabulary.

use serde::{Deserialize, Serialize};

/// The visible stages of one answer's generation.
///
/// Normal progression is `Idle → Thinking → Browsing → ToolExecution →
/// TextStreaming → Processing → Idle`, but any phase may drop straight to
/// `Idle` on cancellation or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Thinking,
    Browsing,
    ToolExecution,
    TextStreaming,
    Processing,
}

impl Phase {
    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Browsing => "browsing",
            Self::ToolExecution => "tool_execution",
            Self::TextStreaming => "text_streaming",
            Self::Processing => "processing",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority for a queued phase transition.
///
/// Higher priorities are delivered before queue order; `Low` items are the
/// first candidates for eviction when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}
