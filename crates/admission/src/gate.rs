//! The admission gate — per-identity rate limiting across multiple window
//! tiers, with escalating bans for repeat offenders.
//!
//! Tiers are evaluated tightest-first and the first denying tier
//! short-circuits the check. A successful check increments every tier.
//! Repeated denials on one tier escalate to a time-boxed ban that is
//! checked before any window bookkeeping.
//!
//! All timing uses `tokio::time::Instant` so tests can run under a paused
//! clock.

use cadenza_core::error::AdmissionError;
use cadenza_core::identity::ClientIdentity;
use cadenza_config::AdmissionConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One rate-window tier: a capacity over a rolling window.
#[derive(Debug, Clone)]
pub struct WindowTier {
    pub name: String,
    pub capacity: u32,
    pub window: Duration,
}

/// Per-(identity, tier) window bookkeeping.
///
/// Replaced wholesale when the window expires — never partially reset, so
/// concurrent checks on a window boundary cannot double-count.
#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    reset_at: Instant,
    violations: u32,
    last_violation: Option<Instant>,
    /// Diagnostics only. Never part of the decision.
    fingerprint: Option<String>,
}

impl WindowEntry {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now + window,
            violations: 0,
            last_violation: None,
            fingerprint: None,
        }
    }
}

#[derive(Debug, Clone)]
struct BanRecord {
    expires_at: Instant,
}

#[derive(Default)]
struct GateState {
    /// One window table per tier, same index order as `tiers`.
    windows: Vec<HashMap<String, WindowEntry>>,
    bans: HashMap<String, BanRecord>,
}

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,

    /// When allowed: the minimum remaining quota across tiers.
    /// When denied: always 0.
    pub remaining: u32,

    /// Time until the relevant window resets. When allowed this is the
    /// reset of the tier with the least remaining quota; when denied it is
    /// the denying tier's reset.
    pub reset_after: Duration,

    /// Wait hint for denied checks.
    pub retry_after: Option<Duration>,

    /// Forbidden semantics — distinct from ordinary throttling.
    pub banned: bool,

    /// The denying tier, when denied by a tier.
    pub tier: Option<String>,
}

impl AdmissionDecision {
    /// Map a denial to the admission error taxonomy. `None` when allowed.
    pub fn as_error(&self) -> Option<AdmissionError> {
        if self.allowed {
            return None;
        }
        let retry_after_secs = self
            .retry_after
            .map(|d| d.as_secs_f64().ceil() as u64)
            .unwrap_or(0);
        if self.banned {
            Some(AdmissionError::Banned { retry_after_secs })
        } else {
            Some(AdmissionError::RateLimited {
                tier: self.tier.clone().unwrap_or_default(),
                retry_after_secs,
            })
        }
    }
}

/// Snapshot of gate table sizes for observability.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GateStats {
    pub tracked_identities: usize,
    pub active_bans: usize,
}

/// Diagnostic view of one identity's tightest-tier window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WindowInfo {
    pub count: u32,
    pub violations: u32,
    pub last_violation_age_secs: Option<u64>,
    pub fingerprint: Option<String>,
}

/// The admission gate service.
///
/// One instance is shared by all concurrent sessions; the tables live
/// behind a single mutex held only for short, non-async critical sections.
pub struct AdmissionGate {
    tiers: Vec<WindowTier>,
    violation_threshold: u32,
    ban_duration: Duration,
    sweep_interval: Duration,
    state: Mutex<GateState>,
}

impl AdmissionGate {
    pub fn new(config: &AdmissionConfig) -> Self {
        let tiers: Vec<WindowTier> = config
            .tiers
            .iter()
            .map(|t| WindowTier {
                name: t.name.clone(),
                capacity: t.capacity,
                window: Duration::from_secs(t.window_secs),
            })
            .collect();

        let windows = tiers.iter().map(|_| HashMap::new()).collect();

        Self {
            tiers,
            violation_threshold: config.violation_threshold,
            ban_duration: Duration::from_secs(config.ban_duration_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            state: Mutex::new(GateState {
                windows,
                bans: HashMap::new(),
            }),
        }
    }

    /// Check whether this identity may start a chat turn.
    ///
    /// An unexpired ban short-circuits before any window counters are
    /// touched. Otherwise tiers are evaluated tightest-first; the first
    /// denying tier is reported and only its violation counter moves. A
    /// fully allowed check increments every tier.
    pub fn check(&self, identity: &ClientIdentity) -> AdmissionDecision {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // Ban check first — bans strictly suppress window bookkeeping.
        if let Some(ban) = state.bans.get(&identity.identifier) {
            if now < ban.expires_at {
                let retry = ban.expires_at - now;
                return AdmissionDecision {
                    allowed: false,
                    remaining: 0,
                    reset_after: retry,
                    retry_after: Some(retry),
                    banned: true,
                    tier: None,
                };
            }
            // Expired — delete lazily and evaluate as if no ban existed.
            state.bans.remove(&identity.identifier);
            debug!(identity = %identity.identifier, "Expired ban removed");
        }

        // First pass: find the tightest denying tier, short-circuiting.
        for (idx, tier) in self.tiers.iter().enumerate() {
            let mut denial: Option<(u32, Duration)> = None;

            if let Some(entry) = state.windows[idx].get_mut(&identity.identifier) {
                if now >= entry.reset_at {
                    // Window expired — replace wholesale, never decrement.
                    *entry = WindowEntry::fresh(now, tier.window);
                } else if entry.count >= tier.capacity {
                    entry.violations += 1;
                    entry.last_violation = Some(now);
                    denial = Some((entry.violations, entry.reset_at - now));
                }
            }

            if let Some((violations, reset_after)) = denial {
                if violations >= self.violation_threshold {
                    state.bans.insert(
                        identity.identifier.clone(),
                        BanRecord {
                            expires_at: now + self.ban_duration,
                        },
                    );
                    warn!(
                        identity = %identity.identifier,
                        tier = %tier.name,
                        violations,
                        ban_secs = self.ban_duration.as_secs(),
                        "Violation threshold reached, identity banned"
                    );
                } else {
                    debug!(
                        identity = %identity.identifier,
                        tier = %tier.name,
                        violations,
                        "Request denied by rate window"
                    );
                }

                // The tripping check itself still reports rate-limited;
                // the ban takes effect on the next check.
                return AdmissionDecision {
                    allowed: false,
                    remaining: 0,
                    reset_after,
                    retry_after: Some(reset_after),
                    banned: false,
                    tier: Some(tier.name.clone()),
                };
            }
        }

        // Second pass: all tiers allow — commit the increments.
        let mut min_remaining = u32::MAX;
        let mut min_reset_after = Duration::ZERO;
        for (idx, tier) in self.tiers.iter().enumerate() {
            let entry = state.windows[idx]
                .entry(identity.identifier.clone())
                .or_insert_with(|| WindowEntry::fresh(now, tier.window));
            entry.count += 1;
            if !identity.fingerprint.is_empty() {
                entry.fingerprint = Some(identity.fingerprint.clone());
            }

            let remaining = tier.capacity.saturating_sub(entry.count);
            if remaining < min_remaining {
                min_remaining = remaining;
                min_reset_after = entry.reset_at.saturating_duration_since(now);
            }
        }

        AdmissionDecision {
            allowed: true,
            remaining: min_remaining,
            reset_after: min_reset_after,
            retry_after: None,
            banned: false,
            tier: None,
        }
    }

    /// Operator override: ban immediately, bypassing the violation counter.
    pub fn ban(&self, identifier: &str, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.bans.insert(
            identifier.to_string(),
            BanRecord {
                expires_at: Instant::now() + duration,
            },
        );
        info!(identity = %identifier, secs = duration.as_secs(), "Manual ban applied");
    }

    /// Operator override: lift a ban immediately. Returns whether a ban
    /// existed.
    pub fn unban(&self, identifier: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let removed = state.bans.remove(identifier).is_some();
        if removed {
            info!(identity = %identifier, "Manual unban");
        }
        removed
    }

    /// Purge expired window entries and bans to bound memory.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for table in &mut state.windows {
            table.retain(|_, entry| now < entry.reset_at);
        }
        state.bans.retain(|_, ban| now < ban.expires_at);
    }

    /// Diagnostic lookup for operator tooling. Reads the tightest tier's
    /// window for this identity; never mutates anything.
    pub fn window_info(&self, identifier: &str) -> Option<WindowInfo> {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.windows.first()?.get(identifier)?;
        Some(WindowInfo {
            count: entry.count,
            violations: entry.violations,
            last_violation_age_secs: entry.last_violation.map(|at| (now - at).as_secs()),
            fingerprint: entry.fingerprint.clone(),
        })
    }

    /// Table sizes for the status endpoint.
    pub fn stats(&self) -> GateStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        GateStats {
            tracked_identities: state.windows.iter().map(HashMap::len).max().unwrap_or(0),
            active_bans: state.bans.len(),
        }
    }

    /// Spawn the periodic sweep task. Runs for the life of the process.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gate = Arc::clone(self);
        let period = gate.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gate.sweep();
            }
        })
    }
}
