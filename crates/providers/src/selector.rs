//! Provider selection — circuit-breaker failover between a primary and a
//! fallback model source.
//!
//! Health state is shared by every concurrent session. A primary failure
//! flips the breaker and schedules an auto-clear after an exponential
//! backoff window; the clear task carries a generation number so a stale
//! timer from an earlier failure can detect it has been superseded and
//! no-op instead of reviving the primary early.

use cadenza_core::error::{SelectorError, SourceError};
use cadenza_core::message::TurnRequest;
use cadenza_core::source::{ModelSource, ModelStream, RawModelEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Exponential backoff schedule for primary recovery.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// `min(base * 2^(failures-1), max)`. Non-decreasing in `failures`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let secs = self.base.as_secs().saturating_mul(1u64 << exp);
        Duration::from_secs(secs.min(self.max.as_secs()))
    }
}

/// Shared health state for one primary/fallback pairing.
#[derive(Debug, Default)]
struct HealthInner {
    primary_failed: bool,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    backoff_until: Option<Instant>,
    /// Bumped on every failure and every reset; auto-clear timers compare
    /// their captured value before touching state.
    generation: u64,
}

/// Read-only health snapshot for observability.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub primary_available: bool,
    pub failure_count: u32,
    pub last_failure_age_secs: Option<u64>,
    pub backoff_active: bool,
    pub backoff_remaining_secs: Option<u64>,
}

/// Circuit-breaker failover between two model sources.
pub struct ProviderSelector {
    primary: Arc<dyn ModelSource>,
    fallback: Arc<dyn ModelSource>,
    attempt_timeout: Duration,
    backoff: BackoffPolicy,
    failure_recency: Duration,
    failure_count_threshold: u32,
    health: Arc<Mutex<HealthInner>>,
}

impl ProviderSelector {
    pub fn new(
        primary: Arc<dyn ModelSource>,
        fallback: Arc<dyn ModelSource>,
        config: &cadenza_config::ProviderConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
            backoff: BackoffPolicy {
                base: Duration::from_secs(config.backoff_base_secs),
                max: Duration::from_secs(config.backoff_max_secs),
            },
            failure_recency: Duration::from_secs(config.failure_recency_secs),
            failure_count_threshold: config.failure_count_threshold,
            health: Arc::new(Mutex::new(HealthInner::default())),
        }
    }

    /// Acquire a live model stream for one turn.
    ///
    /// Tries the primary unless the breaker says otherwise, then the
    /// fallback. Fails with `Unavailable` only when both fail — all retry
    /// and backoff bookkeeping stays invisible to the caller.
    pub async fn acquire(&self, request: TurnRequest) -> Result<ModelStream, SelectorError> {
        if self.should_use_fallback() {
            debug!(
                source = %self.primary.name(),
                "Breaker open, routing turn to fallback"
            );
        } else {
            match self.attempt(&self.primary, request.clone()).await {
                Ok(events) => {
                    self.mark_primary_recovered();
                    return Ok(ModelStream {
                        source: self.primary.name().to_string(),
                        events,
                    });
                }
                Err(e) => {
                    warn!(
                        source = %self.primary.name(),
                        error = %e,
                        "Primary source failed, trying fallback"
                    );
                    self.mark_primary_failed();
                }
            }
        }

        match self.attempt(&self.fallback, request).await {
            Ok(events) => Ok(ModelStream {
                source: self.fallback.name().to_string(),
                events,
            }),
            Err(e) => {
                warn!(
                    source = %self.fallback.name(),
                    error = %e,
                    "Fallback source failed, turn unavailable"
                );
                Err(SelectorError::Unavailable { last: e })
            }
        }
    }

    async fn attempt(
        &self,
        source: &Arc<dyn ModelSource>,
        request: TurnRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<RawModelEvent, SourceError>>, SourceError> {
        match tokio::time::timeout(self.attempt_timeout, source.open(request)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(format!(
                "Source '{}' timed out after {}s",
                source.name(),
                self.attempt_timeout.as_secs()
            ))),
        }
    }

    /// Whether the breaker currently diverts traffic away from the primary.
    pub fn should_use_fallback(&self) -> bool {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if health.primary_failed {
            return true;
        }
        if health.failure_count > self.failure_count_threshold {
            if let Some(at) = health.last_failure_at {
                return at.elapsed() < self.failure_recency;
            }
        }
        false
    }

    /// Record a primary failure and arm the backoff auto-clear.
    ///
    /// The latest failure's timer is authoritative: each failure bumps the
    /// generation, and a timer only clears the flag if its generation is
    /// still current when it fires.
    pub fn mark_primary_failed(&self) {
        let (generation, delay, failure_count) = {
            let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
            health.primary_failed = true;
            health.failure_count += 1;
            health.last_failure_at = Some(Instant::now());
            health.generation += 1;
            let delay = self.backoff.delay_for(health.failure_count);
            health.backoff_until = Some(Instant::now() + delay);
            (health.generation, delay, health.failure_count)
        };

        info!(
            failure_count,
            backoff_secs = delay.as_secs(),
            "Primary marked failed, backoff armed"
        );

        let health = Arc::clone(&self.health);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut h = health.lock().unwrap_or_else(|e| e.into_inner());
            if h.generation == generation {
                h.primary_failed = false;
                h.backoff_until = None;
                info!("Backoff elapsed, primary eligible again");
            }
            // A newer failure or a manual reset superseded this timer.
        });
    }

    /// Primary succeeded: close the breaker without forgetting history.
    /// `failure_count` only resets via `reset_failure_state`.
    fn mark_primary_recovered(&self) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if health.primary_failed {
            health.primary_failed = false;
            health.backoff_until = None;
        }
    }

    /// Operator override: clear all failure state immediately and disarm
    /// any in-flight backoff timer.
    pub fn reset_failure_state(&self) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.primary_failed = false;
        health.failure_count = 0;
        health.last_failure_at = None;
        health.backoff_until = None;
        health.generation += 1;
        info!("Provider failure state reset");
    }

    /// Health snapshot for the status endpoint.
    pub fn health_status(&self) -> HealthStatus {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        HealthStatus {
            primary_available: !health.primary_failed,
            failure_count: health.failure_count,
            last_failure_age_secs: health.last_failure_at.map(|at| (now - at).as_secs()),
            backoff_active: health.primary_failed,
            backoff_remaining_secs: health
                .backoff_until
                .map(|until| until.saturating_duration_since(now).as_secs()),
        }
    }

    /// Names of the configured sources, primary first.
    pub fn source_names(&self) -> (String, String) {
        (
            self.primary.name().to_string(),
            self.fallback.name().to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> cadenza_config::ProviderConfig {
        cadenza_config::ProviderConfig {
            attempt_timeout_secs: 5,
            backoff_base_secs: 60,
            backoff_max_secs: 1800,
            failure_recency_secs: 300,
            failure_count_threshold: 3,
            ..Default::default()
        }
    }

    fn request() -> TurnRequest {
        TurnRequest::single("hello", "test-model")
    }

    /// A source that always fails fast.
    struct FailingSource {
        name: String,
        error: SourceError,
        calls: AtomicUsize,
    }

    impl FailingSource {
        fn new(name: &str, error: SourceError) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                error,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelSource for FailingSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn open(
            &self,
            _request: TurnRequest,
        ) -> Result<tokio::sync::mpsc::Receiver<Result<RawModelEvent, SourceError>>, SourceError>
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    /// A source that always accepts and immediately completes.
    struct OkSource {
        name: String,
        calls: AtomicUsize,
    }

    impl OkSource {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelSource for OkSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn open(
            &self,
            _request: TurnRequest,
        ) -> Result<tokio::sync::mpsc::Receiver<Result<RawModelEvent, SourceError>>, SourceError>
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            let _ = tx.send(Ok(RawModelEvent::Done)).await;
            Ok(rx)
        }
    }

    /// A source that hangs forever (for timeout testing).
    struct HangingSource;

    #[async_trait]
    impl ModelSource for HangingSource {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn open(
            &self,
            _request: TurnRequest,
        ) -> Result<tokio::sync::mpsc::Receiver<Result<RawModelEvent, SourceError>>, SourceError>
        {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[test]
    fn backoff_schedule_matches_contract() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(60),
            max: Duration::from_secs(1800),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for(5), Duration::from_secs(960));
        // 60 * 2^5 = 1920 — capped.
        assert_eq!(policy.delay_for(6), Duration::from_secs(1800));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1800));

        // Non-decreasing.
        let mut prev = Duration::ZERO;
        for k in 1..20 {
            let d = policy.delay_for(k);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn primary_success_skips_fallback() {
        let primary = OkSource::new("primary");
        let fallback = OkSource::new("fallback");
        let selector =
            ProviderSelector::new(primary.clone(), fallback.clone(), &test_config());

        let stream = selector.acquire(request()).await.unwrap();
        assert_eq!(stream.source, "primary");
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failover_to_fallback_on_primary_failure() {
        let primary = FailingSource::new("primary", SourceError::Network("down".into()));
        let fallback = OkSource::new("fallback");
        let selector =
            ProviderSelector::new(primary.clone(), fallback.clone(), &test_config());

        let stream = selector.acquire(request()).await.unwrap();
        assert_eq!(stream.source, "fallback");
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);

        let status = selector.health_status();
        assert!(!status.primary_available);
        assert_eq!(status.failure_count, 1);
        assert!(status.backoff_active);
    }

    #[tokio::test(start_paused = true)]
    async fn no_primary_attempt_during_backoff() {
        let primary = FailingSource::new("primary", SourceError::Network("down".into()));
        let fallback = OkSource::new("fallback");
        let selector =
            ProviderSelector::new(primary.clone(), fallback.clone(), &test_config());

        selector.acquire(request()).await.unwrap();
        assert_eq!(primary.calls(), 1);

        // Inside the 60s backoff window the primary is never touched.
        tokio::time::advance(Duration::from_secs(30)).await;
        selector.acquire(request()).await.unwrap();
        selector.acquire(request()).await.unwrap();
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn primary_retried_after_backoff_elapses() {
        let primary = FailingSource::new("primary", SourceError::Network("down".into()));
        let fallback = OkSource::new("fallback");
        let selector =
            ProviderSelector::new(primary.clone(), fallback.clone(), &test_config());

        selector.acquire(request()).await.unwrap();
        assert_eq!(primary.calls(), 1);

        // Past backoff(1) = 60s the auto-clear task has fired.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(selector.health_status().primary_available);

        selector.acquire(request()).await.unwrap();
        assert_eq!(primary.calls(), 2);
        // Second failure doubles the backoff.
        assert_eq!(selector.health_status().failure_count, 2);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!selector.health_status().primary_available);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(selector.health_status().primary_available);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_clear_newer_failure() {
        let primary = FailingSource::new("primary", SourceError::Network("down".into()));
        let fallback = OkSource::new("fallback");
        let selector = ProviderSelector::new(primary, fallback, &test_config());

        // Two racing requests both fail the primary: generation 1 arms a
        // 60s timer, generation 2 a 120s timer.
        selector.mark_primary_failed();
        selector.mark_primary_failed();

        // Generation 1's timer fires at 60s but has been superseded.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!selector.health_status().primary_available);

        // The authoritative (latest) timer clears at 120s.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(selector.health_status().primary_available);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restores_primary_immediately() {
        let primary = FailingSource::new("primary", SourceError::Network("down".into()));
        let fallback = OkSource::new("fallback");
        let selector = ProviderSelector::new(primary, fallback.clone(), &test_config());

        selector.acquire(request()).await.unwrap();
        assert!(!selector.health_status().primary_available);

        selector.reset_failure_state();
        let status = selector.health_status();
        assert!(status.primary_available);
        assert_eq!(status.failure_count, 0);
        assert!(!selector.should_use_fallback());

        // The disarmed timer firing later must not disturb the clean state.
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(selector.health_status().primary_available);
        assert_eq!(selector.health_status().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_flag_but_keeps_failure_count() {
        let fallback = OkSource::new("fallback");
        // Start with a primary that fails once, then use a fresh OkSource
        // by driving the health state directly.
        let primary = OkSource::new("primary");
        let selector =
            ProviderSelector::new(primary.clone(), fallback, &test_config());

        selector.mark_primary_failed();
        tokio::time::advance(Duration::from_secs(61)).await;

        selector.acquire(request()).await.unwrap();
        let status = selector.health_status();
        assert!(status.primary_available);
        assert_eq!(status.failure_count, 1, "failure_count only resets explicitly");
    }

    #[tokio::test(start_paused = true)]
    async fn both_sources_failing_is_unavailable() {
        let primary = FailingSource::new("primary", SourceError::Network("conn refused".into()));
        let fallback = FailingSource::new(
            "fallback",
            SourceError::AuthenticationFailed("bad key".into()),
        );
        let selector =
            ProviderSelector::new(primary.clone(), fallback.clone(), &test_config());

        let err = selector.acquire(request()).await.unwrap_err();
        match err {
            SelectorError::Unavailable {
                last: SourceError::AuthenticationFailed(_),
            } => {}
            other => panic!("Expected Unavailable(AuthenticationFailed), got: {other:?}"),
        }
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_primary_times_out_and_fails_over() {
        let mut config = test_config();
        config.attempt_timeout_secs = 1;
        let fallback = OkSource::new("fallback");
        let selector =
            ProviderSelector::new(Arc::new(HangingSource), fallback.clone(), &config);

        let stream = selector.acquire(request()).await.unwrap();
        assert_eq!(stream.source, "fallback");
        assert_eq!(selector.health_status().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_failure_streak_forces_fallback() {
        let primary = OkSource::new("primary");
        let fallback = OkSource::new("fallback");
        let selector =
            ProviderSelector::new(primary.clone(), fallback.clone(), &test_config());

        // Four failures, breaker flag cleared by elapsed backoffs each
        // time, but the streak alone keeps traffic on the fallback while
        // the last failure is recent.
        for _ in 0..4 {
            selector.mark_primary_failed();
        }
        tokio::time::advance(Duration::from_secs(1000)).await;
        // Backoff long elapsed; primary_failed cleared by the timer.
        assert!(selector.health_status().primary_available);

        // Refresh the last-failure stamp to make the streak recent again.
        selector.mark_primary_failed();
        tokio::time::advance(Duration::from_secs(1800)).await;
        assert!(selector.health_status().primary_available);
        // 1800s > 300s recency — streak no longer forces fallback.
        assert!(!selector.should_use_fallback());

        selector.mark_primary_failed();
        tokio::time::advance(Duration::from_secs(10)).await;
        // Flag still set (backoff running) and streak recent.
        assert!(selector.should_use_fallback());
    }
}
