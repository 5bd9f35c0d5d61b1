//! Text pacer — emits answer text to the consumer at a controlled cadence.
//!
//! The chunk plan is a pure function of the input text and options, so the
//! same answer always paces identically; the driver task only executes the
//! plan. Pause, skip, and stop act through a control handle that cancels
//! any pending delay before taking effect.

use cadenza_config::PacingConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

/// Emission cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaceMode {
    /// Fixed delay per character.
    Character,
    /// Delay per word boundary.
    Word,
}

/// Externally supplied link-quality estimate. The pacer never measures the
/// network itself — it only consumes this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Good,
    Degraded,
    Poor,
}

impl NetworkQuality {
    /// Delay scaling per emission.
    fn delay_factor(self) -> u32 {
        match self {
            Self::Good => 1,
            Self::Degraded => 2,
            Self::Poor => 4,
        }
    }

    /// Characters bundled per chunk in character cadence. Degraded links
    /// get fewer, larger chunks.
    fn chunk_span(self) -> usize {
        match self {
            Self::Good => 1,
            Self::Degraded => 4,
            Self::Poor => 8,
        }
    }
}

/// Pacing parameters. Pure data; the plan derives from these alone.
#[derive(Debug, Clone)]
pub struct PaceOptions {
    pub mode: PaceMode,
    pub quality: NetworkQuality,
    pub char_delay: Duration,
    pub word_delay: Duration,
    pub boundary_multiplier: f64,
}

impl PaceOptions {
    pub fn from_config(config: &PacingConfig) -> Self {
        Self {
            mode: PaceMode::Character,
            quality: NetworkQuality::Good,
            char_delay: Duration::from_millis(config.char_delay_ms),
            word_delay: Duration::from_millis(config.word_delay_ms),
            boundary_multiplier: config.boundary_multiplier,
        }
    }

    pub fn with_mode(mut self, mode: PaceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_quality(mut self, quality: NetworkQuality) -> Self {
        self.quality = quality;
        self
    }
}

impl Default for PaceOptions {
    fn default() -> Self {
        Self::from_config(&PacingConfig::default())
    }
}

/// One chunk of the precomputed emission plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
    pub content: String,
    /// Characters emitted once this chunk is delivered.
    pub position: usize,
    pub delay_before: Duration,
    pub is_complete: bool,
}

/// A chunk as delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacedChunk {
    pub content: String,
    pub position: usize,
    pub is_complete: bool,
}

/// Word-boundary detector: whitespace, sentence-ending punctuation before
/// this point, or a capital letter following whitespace.
fn boundary_at(chars: &[char], start: usize) -> bool {
    if start == 0 {
        return false;
    }
    let cur = chars[start];
    if cur.is_whitespace() {
        return true;
    }
    let prev_non_ws = chars[..start].iter().rev().find(|c| !c.is_whitespace());
    matches!(prev_non_ws, Some('.' | '!' | '?'))
        || (cur.is_uppercase() && chars[start - 1].is_whitespace())
}

/// Split into word segments: each maximal non-whitespace run plus the
/// whitespace that follows it.
fn word_segments(chars: &[char]) -> Vec<(usize, String)> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut current = String::new();
    let mut in_trailing_ws = false;

    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_whitespace() {
            in_trailing_ws = true;
            current.push(ch);
        } else {
            if in_trailing_ws {
                segments.push((start, std::mem::take(&mut current)));
                start = i;
                in_trailing_ws = false;
            }
            current.push(ch);
        }
    }
    if !current.is_empty() {
        segments.push((start, current));
    }
    segments
}

/// Compute the deterministic emission plan for one answer.
///
/// Restartable by construction: the same `(text, options)` pair always
/// yields an identical plan. Finite: the final chunk carries
/// `position == char count` and `is_complete`.
pub fn plan(text: &str, options: &PaceOptions) -> Vec<PlannedChunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![PlannedChunk {
            content: String::new(),
            position: 0,
            delay_before: Duration::ZERO,
            is_complete: true,
        }];
    }

    let factor = options.quality.delay_factor();
    let (pieces, base_delay): (Vec<(usize, String)>, Duration) = match options.mode {
        PaceMode::Character => {
            let span = options.quality.chunk_span();
            let pieces = chars
                .chunks(span)
                .enumerate()
                .map(|(i, piece)| (i * span, piece.iter().collect()))
                .collect();
            (
                pieces,
                options.char_delay.saturating_mul(factor * span as u32),
            )
        }
        PaceMode::Word => (
            word_segments(&chars),
            options.word_delay.saturating_mul(factor),
        ),
    };

    let total = chars.len();
    let last_idx = pieces.len() - 1;
    let mut position = 0;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, (start, content))| {
            position += content.chars().count();
            let delay_before = if i == 0 {
                Duration::ZERO
            } else if boundary_at(&chars, start) {
                base_delay.mul_f64(options.boundary_multiplier)
            } else {
                base_delay
            };
            PlannedChunk {
                content,
                position,
                delay_before,
                is_complete: i == last_idx && position == total,
            }
        })
        .collect()
}

// --- Control handle ---

#[derive(Debug, Default, Clone, Copy)]
struct CtrlFlags {
    paused: bool,
    skip: bool,
    stopped: bool,
}

struct ControlInner {
    flags: Mutex<CtrlFlags>,
    notify: Notify,
}

/// Handle to pause, resume, skip, or stop an in-flight paced stream.
/// Every control cancels the pending delay before taking effect.
#[derive(Clone)]
pub struct PacerControl {
    inner: Arc<ControlInner>,
}

impl PacerControl {
    fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                flags: Mutex::new(CtrlFlags::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Suspend the delay sequence without losing position.
    pub fn pause(&self) {
        self.set(|f| f.paused = true);
    }

    /// Continue the delay sequence where it left off.
    pub fn resume(&self) {
        self.set(|f| f.paused = false);
    }

    /// Emit all remaining text as a single terminal chunk.
    pub fn skip_to_end(&self) {
        self.set(|f| f.skip = true);
    }

    /// End the stream early. Cancellation, not an error.
    pub fn stop(&self) {
        self.set(|f| f.stopped = true);
    }

    fn set(&self, apply: impl FnOnce(&mut CtrlFlags)) {
        apply(&mut self.inner.flags.lock().unwrap_or_else(|e| e.into_inner()));
        self.inner.notify.notify_one();
    }

    fn flags(&self) -> CtrlFlags {
        *self.inner.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn changed(&self) {
        self.inner.notify.notified().await;
    }
}

/// A running paced stream: the chunk receiver plus its control handle.
pub struct PacedStream {
    pub chunks: mpsc::Receiver<PacedChunk>,
    pub control: PacerControl,
}

/// The pacer service. Holds the cadence options; `pace` starts one stream
/// per answer. Quality can be retuned between answers as the link changes.
pub struct TextPacer {
    options: PaceOptions,
}

impl TextPacer {
    pub fn new(options: PaceOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &PaceOptions {
        &self.options
    }

    /// Adjust cadence to a new link-quality estimate.
    pub fn set_quality(&mut self, quality: NetworkQuality) {
        self.options.quality = quality;
    }

    /// Start pacing one answer. The returned stream is finite and, for a
    /// given `(text, options)`, deterministic.
    pub fn pace(&self, text: impl Into<String>) -> PacedStream {
        let planned = plan(&text.into(), &self.options);
        let control = PacerControl::new();
        let (tx, rx) = mpsc::channel(32);

        let ctrl = control.clone();
        tokio::spawn(async move {
            drive(planned, tx, ctrl).await;
        });

        PacedStream {
            chunks: rx,
            control,
        }
    }
}

async fn drive(planned: Vec<PlannedChunk>, tx: mpsc::Sender<PacedChunk>, ctrl: PacerControl) {
    let total = planned.last().map(|c| c.position).unwrap_or(0);
    let mut idx = 0;

    while idx < planned.len() {
        let mut remaining = planned[idx].delay_before;
        loop {
            let flags = ctrl.flags();
            if flags.stopped {
                return;
            }
            if flags.skip {
                let rest: String = planned[idx..].iter().map(|c| c.content.as_str()).collect();
                let _ = tx
                    .send(PacedChunk {
                        content: rest,
                        position: total,
                        is_complete: true,
                    })
                    .await;
                return;
            }
            if flags.paused {
                ctrl.changed().await;
                continue;
            }
            if remaining.is_zero() {
                break;
            }
            let started = Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    remaining = Duration::ZERO;
                }
                _ = ctrl.changed() => {
                    // Keep whatever delay is left; the flag check above
                    // decides what happens next.
                    remaining = remaining.saturating_sub(started.elapsed());
                }
            }
        }

        let chunk = &planned[idx];
        let delivered = PacedChunk {
            content: chunk.content.clone(),
            position: chunk.position,
            is_complete: chunk.is_complete,
        };
        if tx.send(delivered).await.is_err() {
            return;
        }
        idx += 1;
    }
}
