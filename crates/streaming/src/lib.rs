//! # Cadenza Streaming
//!
//! The response-pacing half of the core: the phase scheduler that orders
//! and paces status transitions, the text pacer that delivers answer text
//! at a controlled cadence, and the per-answer accumulation buffer that
//! joins them.

pub mod buffer;
pub mod pacer;
pub mod scheduler;

pub use buffer::StreamingBuffer;
pub use pacer::{
    NetworkQuality, PaceMode, PaceOptions, PacedChunk, PacedStream, PacerControl, TextPacer, plan,
};
pub use scheduler::{EnqueueOptions, PhaseScheduler, PhaseTransition, SchedulerConfig};
