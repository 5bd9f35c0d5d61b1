//! One chat turn, end to end.
//!
//! Takes the raw event stream a model source produced and drives it
//! through the phase scheduler and the text pacer, emitting the tagged
//! `TurnEvent` sequence the presentation layer consumes. The consumer
//! dropping its receiver cancels the whole pipeline: every stage's send
//! fails and the tasks unwind.

use cadenza_config::PacingConfig;
use cadenza_core::event::{TurnErrorKind, TurnEvent};
use cadenza_core::phase::{Phase, Priority};
use cadenza_core::source::{ModelStream, RawModelEvent};
use cadenza_streaming::{
    EnqueueOptions, NetworkQuality, PaceOptions, PhaseScheduler, SchedulerConfig, StreamingBuffer,
    TextPacer,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Spawn the pipeline for one turn and return the consumer event stream.
pub fn run_turn(
    stream: ModelStream,
    pacing: &PacingConfig,
    quality: NetworkQuality,
) -> mpsc::Receiver<TurnEvent> {
    let (out_tx, out_rx) = mpsc::channel(64);

    let scheduler = Arc::new(PhaseScheduler::new(SchedulerConfig::from_pacing(pacing)));
    let (phase_tx, mut phase_rx) = mpsc::channel(32);
    scheduler.run(phase_tx);

    // Forward scheduled phase transitions to the consumer.
    let phase_out = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(transition) = phase_rx.recv().await {
            let event = TurnEvent::PhaseTransition {
                phase: transition.phase,
                message: transition.message,
                at: chrono::Utc::now(),
            };
            if phase_out.send(event).await.is_err() {
                return;
            }
        }
    });

    let pace_options = PaceOptions::from_config(pacing).with_quality(quality);
    tokio::spawn(drive_turn(
        stream,
        scheduler,
        forwarder,
        pace_options,
        out_tx,
    ));

    out_rx
}

async fn drive_turn(
    mut stream: ModelStream,
    scheduler: Arc<PhaseScheduler>,
    forwarder: tokio::task::JoinHandle<()>,
    pace_options: PaceOptions,
    out_tx: mpsc::Sender<TurnEvent>,
) {
    let source = stream.source.clone();
    let mut buffer = StreamingBuffer::new();

    loop {
        match stream.events.recv().await {
            Some(Ok(RawModelEvent::Phase { phase, message })) => {
                scheduler.enqueue(phase, message, EnqueueOptions::default());
            }
            Some(Ok(RawModelEvent::Text { content })) => {
                buffer.push(&content);
            }
            Some(Ok(RawModelEvent::Done)) => break,
            Some(Err(e)) => {
                warn!(source = %source, error = %e, "Model stream failed mid-turn");
                // Hard reset of the status display, then the error event.
                scheduler.enqueue(
                    Phase::Idle,
                    None,
                    EnqueueOptions {
                        replace: true,
                        priority: Priority::High,
                        ..Default::default()
                    },
                );
                scheduler.shutdown();
                let _ = forwarder.await;
                let _ = out_tx
                    .send(TurnEvent::Error {
                        kind: TurnErrorKind::Internal,
                        message: e.to_string(),
                        retry_after_secs: None,
                    })
                    .await;
                return;
            }
            None => {
                // Source hung up without `Done`; deliver what we have.
                debug!(source = %source, "Model stream closed without done marker");
                break;
            }
        }
    }

    // Answer assembled — pace it out.
    scheduler.enqueue(Phase::TextStreaming, None, EnqueueOptions::default());

    let pacer = TextPacer::new(pace_options);
    let mut paced = pacer.pace(buffer.text());
    let mut total_chars = 0;
    while let Some(chunk) = paced.chunks.recv().await {
        buffer.mark_delivered(chunk.position);
        total_chars = total_chars.max(chunk.position);
        let event = TurnEvent::TextChunk {
            content: chunk.content,
            position: chunk.position,
            is_complete: chunk.is_complete,
        };
        if out_tx.send(event).await.is_err() {
            // Consumer went away; stop pacing too.
            paced.control.stop();
            scheduler.shutdown();
            let _ = forwarder.await;
            return;
        }
    }

    scheduler.enqueue(Phase::Processing, None, EnqueueOptions::default());
    scheduler.enqueue(Phase::Idle, None, EnqueueOptions::default());
    scheduler.shutdown();
    let _ = forwarder.await;

    let _ = out_tx
        .send(TurnEvent::Complete {
            source,
            total_chars,
            at: chrono::Utc::now(),
        })
        .await;
}
