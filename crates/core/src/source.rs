//! ModelSource trait — the abstraction over upstream answer generators.
//!
//! A model source knows how to take one chat turn and produce a stream of
//! raw phase/text events. The provider selector holds two of these (primary
//! and fallback) and decides which one a given turn actually reaches.
//!
//! Implementations: OpenAI-compatible streaming endpoints, test doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::SourceError;
use crate::message::TurnRequest;
use crate::phase::Phase;

/// A raw event emitted by a model source while generating an answer.
///
/// These are unnormalized: sources may emit duplicate phase events or
/// bursty text deltas. The streaming layer orders and paces them before
/// anything reaches a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawModelEvent {
    /// The source moved to a new generation phase.
    Phase {
        phase: Phase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A partial text delta of the answer.
    Text { content: String },

    /// The answer is complete.
    Done,
}

/// A live stream of raw events from one source, plus which source it is.
#[derive(Debug)]
pub struct ModelStream {
    /// Name of the source that accepted the turn ("primary"/"fallback"
    /// source names, e.g. "anthropic").
    pub source: String,

    /// The raw event stream. A `SourceError` item means the stream broke
    /// mid-answer; the channel closing after `Done` is normal completion.
    pub events: tokio::sync::mpsc::Receiver<std::result::Result<RawModelEvent, SourceError>>,
}

/// The core model-source trait.
///
/// `open` either fails fast (the selector treats that as "this source
/// failed" and moves on) or returns a live event stream for the turn.
#[async_trait]
pub trait ModelSource: Send + Sync {
    /// A human-readable name for this source (e.g. "anthropic", "ollama").
    fn name(&self) -> &str;

    /// Start one chat turn and return its raw event stream.
    async fn open(
        &self,
        request: TurnRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<RawModelEvent, SourceError>>,
        SourceError,
    >;

    /// Health check — can we reach the source?
    async fn health_check(&self) -> std::result::Result<bool, SourceError> {
        Ok(true)
    }
}
