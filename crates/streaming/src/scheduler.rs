//! Phase scheduler — orders, de-duplicates, and paces the status
//! transitions shown while an answer is generated.
//!
//! The scheduler is a bounded queue of pending transitions plus a "current
//! transition" pointer, drained by a driver task that enforces a minimum
//! visible duration per transition and a small debounce between
//! deliveries. All waiting is timer-based suspension; pause and clear wake
//! the driver so a cancelled continuation can never advance discarded
//! state.

use cadenza_core::phase::{Phase, Priority};
use cadenza_config::PacingConfig;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::debug;

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Floor for how long a transition stays visible when the item itself
    /// does not specify one.
    pub default_min_duration: Duration,
    /// Gap between consecutive deliveries so a consumer is not flooded.
    pub debounce: Duration,
    /// Bound on the pending queue.
    pub max_queue_size: usize,
}

impl SchedulerConfig {
    pub fn from_pacing(config: &PacingConfig) -> Self {
        Self {
            default_min_duration: Duration::from_millis(config.min_phase_ms),
            debounce: Duration::from_millis(config.debounce_ms),
            max_queue_size: config.max_queue_size,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_pacing(&PacingConfig::default())
    }
}

/// One queued status transition.
#[derive(Debug, Clone)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub message: Option<String>,
    pub queued_at: Instant,
    pub min_duration: Option<Duration>,
    pub priority: Priority,
}

/// Options for [`PhaseScheduler::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub min_duration: Option<Duration>,
    pub priority: Priority,
    /// Discard everything pending and make this item next. Used for hard
    /// resets, e.g. an error transition.
    pub replace: bool,
}

struct CurrentTransition {
    phase: Phase,
    message: Option<String>,
    since: Instant,
    min_duration: Duration,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<PhaseTransition>,
    current: Option<CurrentTransition>,
    last_delivered: Option<(Phase, Option<String>)>,
    paused: bool,
    closed: bool,
}

/// What the driver should do next, decided under the state lock.
enum Step {
    Park,
    WaitUntil(Instant),
    Deliver(PhaseTransition),
    Stop,
}

/// The phase scheduler service. One per in-flight answer.
pub struct PhaseScheduler {
    config: SchedulerConfig,
    state: Arc<Mutex<SchedulerState>>,
    notify: Arc<Notify>,
}

impl PhaseScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Queue a transition.
    ///
    /// Same-phase tail items merge in place (message and timestamp update,
    /// priority only ever rises). A full queue evicts the oldest
    /// low-priority item, or failing that the oldest item — overflow is
    /// recovered here, never surfaced as an error.
    pub fn enqueue(&self, phase: Phase, message: Option<String>, opts: EnqueueOptions) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let item = PhaseTransition {
            phase,
            message,
            queued_at: Instant::now(),
            min_duration: opts.min_duration,
            priority: opts.priority,
        };

        if opts.replace {
            state.queue.clear();
            state.current = None;
            state.queue.push_back(item);
            drop(state);
            self.notify.notify_one();
            return;
        }

        // De-duplication: a same-phase tail item is updated, not doubled.
        if let Some(last) = state.queue.back_mut() {
            if last.phase == item.phase {
                last.message = item.message;
                last.queued_at = item.queued_at;
                if item.priority > last.priority {
                    last.priority = item.priority;
                }
                if item.min_duration.is_some() {
                    last.min_duration = item.min_duration;
                }
                drop(state);
                self.notify.notify_one();
                return;
            }
        }

        if state.queue.len() >= self.config.max_queue_size {
            let evicted = match state.queue.iter().position(|t| t.priority == Priority::Low) {
                Some(idx) => state.queue.remove(idx),
                None => state.queue.pop_front(),
            };
            if let Some(evicted) = evicted {
                debug!(phase = %evicted.phase, "Phase queue full, evicted oldest item");
            }
        }

        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Suspend delivery without discarding the queue. Any pending
    /// continuation is cancelled by waking the driver into the parked
    /// state.
    pub fn pause(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).paused = true;
        self.notify.notify_one();
    }

    /// Restart delivery.
    pub fn resume(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).paused = false;
        self.notify.notify_one();
    }

    /// Discard queue and current transition atomically.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.clear();
        state.current = None;
        state.last_delivered = None;
        drop(state);
        self.notify.notify_one();
    }

    /// Stop the driver task once the queue has been dealt with.
    pub fn shutdown(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        self.notify.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    /// The transition currently on display, if any.
    pub fn current(&self) -> Option<(Phase, Option<String>)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .current
            .as_ref()
            .map(|cur| (cur.phase, cur.message.clone()))
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).paused
    }

    /// Spawn the driver task delivering transitions into `sink`.
    ///
    /// Delivery order is highest priority first, then queue order. Two
    /// adjacent deliveries never share an identical `(phase, message)`
    /// pair, and a delivery never happens before the previous transition's
    /// minimum duration has elapsed.
    pub fn run(&self, sink: mpsc::Sender<PhaseTransition>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let notify = Arc::clone(&self.notify);
        let config = self.config;

        tokio::spawn(async move {
            loop {
                let step = {
                    let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
                    if s.closed && s.queue.is_empty() {
                        Step::Stop
                    } else if s.paused || s.queue.is_empty() {
                        if s.closed { Step::Stop } else { Step::Park }
                    } else if let Some(cur) = &s.current {
                        let deadline = cur.since + cur.min_duration;
                        if Instant::now() < deadline {
                            Step::WaitUntil(deadline)
                        } else {
                            Self::take_next(&mut s, &config)
                        }
                    } else {
                        Self::take_next(&mut s, &config)
                    }
                };

                match step {
                    Step::Stop => break,
                    Step::Park => notify.notified().await,
                    Step::WaitUntil(deadline) => {
                        // Wake early on pause/clear/enqueue so a stale
                        // timer cannot act on discarded state.
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {}
                            _ = notify.notified() => {}
                        }
                    }
                    Step::Deliver(item) => {
                        if sink.send(item).await.is_err() {
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(config.debounce) => {}
                            _ = notify.notified() => {}
                        }
                    }
                }
            }
        })
    }

    /// Pop the next deliverable item and make it current. Returns `Park`
    /// when the only candidates duplicate the last delivery.
    fn take_next(s: &mut SchedulerState, config: &SchedulerConfig) -> Step {
        while let Some(item) = Self::select_index(&s.queue).and_then(|idx| s.queue.remove(idx)) {
            if let Some((phase, message)) = &s.last_delivered {
                if *phase == item.phase && *message == item.message {
                    // Adjacent duplicate — drop and look again.
                    continue;
                }
            }

            s.current = Some(CurrentTransition {
                phase: item.phase,
                message: item.message.clone(),
                since: Instant::now(),
                min_duration: item.min_duration.unwrap_or(config.default_min_duration),
            });
            s.last_delivered = Some((item.phase, item.message.clone()));
            return Step::Deliver(item);
        }
        if s.closed { Step::Stop } else { Step::Park }
    }

    /// Highest priority wins; queue order breaks ties.
    fn select_index(queue: &VecDeque<PhaseTransition>) -> Option<usize> {
        let best = queue.iter().map(|t| t.priority).max()?;
        queue.iter().position(|t| t.priority == best)
    }
}
