//! HTTP gateway for Cadenza.
//!
//! Exposes the chat-turn endpoint (SSE event stream), a health check, and
//! the operator controls: manual ban/unban, provider failure-state reset,
//! and a status snapshot.
//!
//! Built on Axum. Admission is decided before any provider work begins;
//! a throttled or banned caller gets a structured rejection with a wait
//! hint, and total provider failure surfaces as 502 — distinct from
//! throttling.

pub mod turn;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::{
    Router,
    routing::{delete, get, post},
};
use cadenza_admission::{AdmissionDecision, AdmissionGate, GateStats};
use cadenza_core::error::SelectorError;
use cadenza_core::identity::{ClientIdentity, resolve_identity};
use cadenza_core::message::{ChatMessage, TurnRequest};
use cadenza_providers::{HealthStatus, ProviderSelector};
use cadenza_streaming::NetworkQuality;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub config: cadenza_config::AppConfig,
    pub gate: Arc<AdmissionGate>,
    pub selector: Arc<ProviderSelector>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
///
/// The /health endpoint sits outside admission control so monitoring can
/// poll it freely; /v1/admin requires the operator bearer token when one
/// is configured.
pub fn build_router(state: SharedState) -> Router {
    let admin = Router::new()
        .route("/bans", post(ban_handler))
        .route("/bans/{identifier}", delete(unban_handler))
        .route("/provider/reset", post(provider_reset_handler))
        .route("/status", get(status_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            operator_auth_middleware,
        ));

    // CORS: only the configured frontend origin.
    let origin = state
        .config
        .gateway
        .cors_origin
        .parse()
        .map(AllowOrigin::exact)
        .unwrap_or_else(|_| {
            AllowOrigin::exact(axum::http::HeaderValue::from_static("http://localhost:8080"))
        });
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/chat", post(chat_handler))
        .nest("/v1/admin", admin)
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server.
pub async fn start(config: cadenza_config::AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let gate = Arc::new(AdmissionGate::new(&config.admission));
    gate.spawn_sweeper();

    let selector = Arc::new(cadenza_providers::build_from_config(&config.provider));
    let (primary, fallback) = selector.source_names();

    let state = Arc::new(GatewayState {
        config,
        gate,
        selector,
        started_at: chrono::Utc::now(),
    });

    let app = build_router(state);

    info!(addr = %addr, primary = %primary, fallback = %fallback, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Chat turn ---

#[derive(Debug, Deserialize)]
pub struct ChatTurnBody {
    /// The user's new message.
    pub message: String,

    #[serde(default)]
    pub conversation_id: Option<String>,

    /// Persona system prompt selected by the (out-of-scope) template layer.
    #[serde(default)]
    pub persona: Option<String>,

    /// Prior conversation payload, oldest first.
    #[serde(default)]
    pub history: Vec<ChatMessage>,

    /// Client-estimated link quality; tunes pacing only.
    #[serde(default)]
    pub quality: Option<NetworkQuality>,
}

#[derive(Debug, Serialize)]
struct RejectionBody {
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tier: Option<String>,
}

async fn chat_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<ChatTurnBody>,
) -> Response {
    let identity = identity_from_request(&headers);

    let decision = state.gate.check(&identity);
    if !decision.allowed {
        return rejection_response(&identity, &decision);
    }

    let mut messages = body.history;
    messages.push(ChatMessage::user(&body.message));
    let request = TurnRequest {
        conversation_id: body
            .conversation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        persona: body.persona,
        // Each source applies its own configured model.
        model: String::new(),
        messages,
        temperature: 0.7,
    };

    match state.selector.acquire(request).await {
        Ok(stream) => {
            let events = turn::run_turn(
                stream,
                &state.config.pacing,
                body.quality.unwrap_or(NetworkQuality::Good),
            );
            let sse = ReceiverStream::new(events)
                .map(|event| Event::default().event(event.event_type()).json_data(&event));
            Sse::new(sse).keep_alive(KeepAlive::default()).into_response()
        }
        Err(e @ SelectorError::Unavailable { .. }) => {
            warn!(identity = %identity.identifier, error = %e, "Turn failed: no source available");
            (
                StatusCode::BAD_GATEWAY,
                Json(RejectionBody {
                    error: e.to_string(),
                    kind: "provider_unavailable",
                    retry_after_secs: None,
                    tier: None,
                }),
            )
                .into_response()
        }
    }
}

/// Resolve the caller's identity from request headers alone.
///
/// Deployments sit behind a reverse proxy that sets `x-forwarded-for`;
/// direct connections collapse to a shared "local" identity.
fn identity_from_request(headers: &HeaderMap) -> ClientIdentity {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    let peer_addr = real_ip.unwrap_or("local");

    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };
    let parts = [
        header_str("user-agent"),
        header_str("accept-language"),
        header_str("accept-encoding"),
    ];

    resolve_identity(forwarded, peer_addr, &parts)
}

fn rejection_response(identity: &ClientIdentity, decision: &AdmissionDecision) -> Response {
    let retry_after_secs = decision.retry_after.map(|d| d.as_secs_f64().ceil() as u64);
    if decision.banned {
        warn!(identity = %identity.identifier, "Rejected banned caller");
        (
            StatusCode::FORBIDDEN,
            Json(RejectionBody {
                error: "You are temporarily banned".into(),
                kind: "banned",
                retry_after_secs,
                tier: None,
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RejectionBody {
                error: "Too many requests".into(),
                kind: "rate_limited",
                retry_after_secs,
                tier: decision.tier.clone(),
            }),
        )
            .into_response()
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Deserialize)]
struct BanRequest {
    identifier: String,
    #[serde(default)]
    duration_secs: Option<u64>,
}

async fn ban_handler(
    State(state): State<SharedState>,
    Json(body): Json<BanRequest>,
) -> StatusCode {
    let duration = Duration::from_secs(
        body.duration_secs
            .unwrap_or(state.config.admission.ban_duration_secs),
    );
    state.gate.ban(&body.identifier, duration);
    StatusCode::NO_CONTENT
}

async fn unban_handler(
    State(state): State<SharedState>,
    Path(identifier): Path<String>,
) -> StatusCode {
    if state.gate.unban(&identifier) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn provider_reset_handler(State(state): State<SharedState>) -> StatusCode {
    state.selector.reset_failure_state();
    StatusCode::NO_CONTENT
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
    admission: GateStats,
    provider: HealthStatus,
}

async fn status_handler(State(state): State<SharedState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        admission: state.gate.stats(),
        provider: state.selector.health_status(),
    })
}

/// Bearer-token authentication for the /v1/admin routes.
///
/// When no operator token is configured the routes are open — local
/// development only.
async fn operator_auth_middleware(
    State(state): State<SharedState>,
    req: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.config.gateway.operator_token.as_deref() else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(next.run(req).await),
        _ => {
            warn!("Unauthorized request to /v1/admin — missing or invalid operator token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use cadenza_config::{AppConfig, TierConfig};
    use cadenza_core::error::SourceError;
    use cadenza_core::phase::Phase;
    use cadenza_core::source::{ModelSource, RawModelEvent};
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    /// A source that streams a small scripted answer.
    struct ScriptedSource;

    #[async_trait]
    impl ModelSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn open(
            &self,
            _request: TurnRequest,
        ) -> Result<mpsc::Receiver<Result<RawModelEvent, SourceError>>, SourceError> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx
                    .send(Ok(RawModelEvent::Phase {
                        phase: Phase::Thinking,
                        message: None,
                    }))
                    .await;
                let _ = tx
                    .send(Ok(RawModelEvent::Text {
                        content: "Hi!".into(),
                    }))
                    .await;
                let _ = tx.send(Ok(RawModelEvent::Done)).await;
            });
            Ok(rx)
        }
    }

    /// A source that always fails fast.
    struct DeadSource;

    #[async_trait]
    impl ModelSource for DeadSource {
        fn name(&self) -> &str {
            "dead"
        }

        async fn open(
            &self,
            _request: TurnRequest,
        ) -> Result<mpsc::Receiver<Result<RawModelEvent, SourceError>>, SourceError> {
            Err(SourceError::Network("conn refused".into()))
        }
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        // Fast pacing so SSE bodies finish quickly under real timers.
        config.pacing.char_delay_ms = 1;
        config.pacing.word_delay_ms = 1;
        config.pacing.min_phase_ms = 1;
        config.pacing.debounce_ms = 1;
        config
    }

    fn test_state(
        config: AppConfig,
        primary: Arc<dyn ModelSource>,
        fallback: Arc<dyn ModelSource>,
    ) -> SharedState {
        let gate = Arc::new(AdmissionGate::new(&config.admission));
        let selector = Arc::new(ProviderSelector::new(primary, fallback, &config.provider));
        Arc::new(GatewayState {
            config,
            gate,
            selector,
            started_at: chrono::Utc::now(),
        })
    }

    fn chat_request(message: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::from(format!(r#"{{"message":"{message}"}}"#)))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let state = test_state(test_config(), Arc::new(ScriptedSource), Arc::new(ScriptedSource));
        let app = build_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_turn_streams_events_over_sse() {
        let state = test_state(test_config(), Arc::new(ScriptedSource), Arc::new(ScriptedSource));
        let app = build_router(state);

        let response = app.oneshot(chat_request("hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("event: phase_transition"));
        assert!(text.contains("event: text_chunk"));
        assert!(text.contains("event: complete"));
        assert!(text.contains(r#""is_complete":true"#));
    }

    #[tokio::test]
    async fn throttled_caller_gets_structured_429() {
        let mut config = test_config();
        config.admission.tiers = vec![TierConfig {
            name: "burst".into(),
            capacity: 1,
            window_secs: 60,
        }];
        config.admission.violation_threshold = 100;
        let state = test_state(config, Arc::new(ScriptedSource), Arc::new(ScriptedSource));
        let app = build_router(state);

        let ok = app.clone().oneshot(chat_request("one")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let denied = app.oneshot(chat_request("two")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = denied.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "rate_limited");
        assert_eq!(json["tier"], "burst");
        assert!(json["retry_after_secs"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn repeat_offender_gets_403_distinct_from_throttling() {
        let mut config = test_config();
        config.admission.tiers = vec![TierConfig {
            name: "burst".into(),
            capacity: 1,
            window_secs: 60,
        }];
        config.admission.violation_threshold = 1;
        let state = test_state(config, Arc::new(ScriptedSource), Arc::new(ScriptedSource));
        let app = build_router(state);

        let ok = app.clone().oneshot(chat_request("one")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        // The tripping denial is still a 429...
        let denied = app.clone().oneshot(chat_request("two")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

        // ...and every check after it is a 403 ban.
        let banned = app.oneshot(chat_request("three")).await.unwrap();
        assert_eq!(banned.status(), StatusCode::FORBIDDEN);
        let body = banned.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "banned");
    }

    #[tokio::test]
    async fn total_provider_failure_is_502() {
        let state = test_state(test_config(), Arc::new(DeadSource), Arc::new(DeadSource));
        let app = build_router(state);

        let response = app.oneshot(chat_request("hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "provider_unavailable");
    }

    #[tokio::test]
    async fn admin_routes_require_operator_token() {
        let mut config = test_config();
        config.gateway.operator_token = Some("op-secret".into());
        let state = test_state(config, Arc::new(ScriptedSource), Arc::new(ScriptedSource));
        let app = build_router(state);

        let unauthorized = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/admin/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let authorized = app
            .oneshot(
                Request::builder()
                    .uri("/v1/admin/status")
                    .header("Authorization", "Bearer op-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(authorized.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn manual_ban_blocks_chat_until_unban() {
        let state = test_state(test_config(), Arc::new(ScriptedSource), Arc::new(ScriptedSource));
        let app = build_router(state);

        let ban = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/admin/bans")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"identifier":"203.0.113.7"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ban.status(), StatusCode::NO_CONTENT);

        let blocked = app.clone().oneshot(chat_request("hi")).await.unwrap();
        assert_eq!(blocked.status(), StatusCode::FORBIDDEN);

        let unban = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v1/admin/bans/203.0.113.7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unban.status(), StatusCode::NO_CONTENT);

        let allowed = app.oneshot(chat_request("hi")).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_admission_and_provider_health() {
        let state = test_state(test_config(), Arc::new(DeadSource), Arc::new(ScriptedSource));
        let app = build_router(state.clone());

        // One turn through the dead primary flips the breaker.
        let ok = app.clone().oneshot(chat_request("hello")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/admin/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["provider"]["primary_available"], false);
        assert_eq!(json["provider"]["failure_count"], 1);
        assert_eq!(json["admission"]["tracked_identities"], 1);

        // Operator reset makes the primary eligible again.
        let reset = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/admin/provider/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::NO_CONTENT);
        assert!(state.selector.health_status().primary_available);
    }
}
