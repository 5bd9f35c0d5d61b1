//! Consumer-facing turn events.
//!
//! The presentation layer subscribes to a single tagged sequence per turn:
//! phase transitions, paced text chunks, a terminal error, or completion.
//! Keeping this a closed sum type forces exhaustive matching at the
//! consumer boundary instead of string-discriminant dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::phase::Phase;

/// Events emitted to the consumer while one answer is generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The visible status changed (thinking, tool execution, …).
    PhaseTransition {
        phase: Phase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        at: DateTime<Utc>,
    },

    /// A paced chunk of the answer text.
    TextChunk {
        content: String,
        /// Character position in the full answer after this chunk.
        position: usize,
        /// True for the final chunk of the answer.
        is_complete: bool,
    },

    /// The turn failed. `retry_after_secs` is set for throttling-shaped
    /// failures so the UI can show a wait hint.
    Error {
        kind: TurnErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },

    /// The turn finished normally.
    Complete {
        /// Which model source produced the answer.
        source: String,
        /// Total characters delivered.
        total_chars: usize,
        at: DateTime<Utc>,
    },
}

/// Coarse classification of a failed turn, stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnErrorKind {
    RateLimited,
    Banned,
    ProviderUnavailable,
    Cancelled,
    Internal,
}

impl TurnEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PhaseTransition { .. } => "phase_transition",
            Self::TextChunk { .. } => "text_chunk",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }
}
