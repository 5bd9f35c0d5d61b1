//! Configuration loading, validation, and management for Cadenza.
//!
//! Loads configuration from a `cadenza.toml` file with environment
//! variable overrides for secrets. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// The root configuration structure.
///
/// Maps directly to `cadenza.toml`. Every section is optional and falls
/// back to defaults, so an empty file is a valid configuration.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Gateway (HTTP surface) configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Admission gate configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Provider selection and backoff configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Phase scheduling and text pacing configuration
    #[serde(default)]
    pub pacing: PacingConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("gateway", &self.gateway)
            .field("admission", &self.admission)
            .field("provider", &self.provider)
            .field("pacing", &self.pacing)
            .finish()
    }
}

// --- Gateway ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required for /v1/admin routes. When unset, admin
    /// routes are open (local development only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_token: Option<String>,

    /// Allowed CORS origin for the browser frontend.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_cors_origin() -> String {
    "http://localhost:8080".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            operator_token: None,
            cors_origin: default_cors_origin(),
        }
    }
}

// --- Admission ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Window tiers, tightest first. Evaluation order follows list order.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,

    /// Denials on one tier before that identity is banned.
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// How long an escalated ban lasts.
    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,

    /// Interval for the background purge of expired windows and bans.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub capacity: u32,
    pub window_secs: u64,
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            name: "burst".into(),
            capacity: 5,
            window_secs: 5,
        },
        TierConfig {
            name: "medium".into(),
            capacity: 30,
            window_secs: 60,
        },
        TierConfig {
            name: "long".into(),
            capacity: 100,
            window_secs: 300,
        },
    ]
}
fn default_violation_threshold() -> u32 {
    3
}
fn default_ban_duration_secs() -> u64 {
    900
}
fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            violation_threshold: default_violation_threshold(),
            ban_duration_secs: default_ban_duration_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

// --- Provider ---

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Primary model source.
    #[serde(default = "default_primary")]
    pub primary: SourceConfig,

    /// Fallback model source.
    #[serde(default = "default_fallback")]
    pub fallback: SourceConfig,

    /// Per-attempt timeout when opening a turn against one source.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Base backoff after the first primary failure.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Backoff cap.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// A failure older than this no longer pushes traffic to the fallback
    /// on its own.
    #[serde(default = "default_failure_recency_secs")]
    pub failure_recency_secs: u64,

    /// Failure count above which recent failures force the fallback.
    #[serde(default = "default_failure_count_threshold")]
    pub failure_count_threshold: u32,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name, used in logs and the `Complete` event.
    pub name: String,

    /// OpenAI-compatible base URL.
    pub api_url: String,

    /// API key. Prefer the `CADENZA_API_KEY` / `CADENZA_FALLBACK_API_KEY`
    /// environment variables over putting this in the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model identifier requested from this source.
    pub model: String,
}

fn default_primary() -> SourceConfig {
    SourceConfig {
        name: "openrouter".into(),
        api_url: "https://openrouter.ai/api/v1".into(),
        api_key: None,
        model: "anthropic/claude-sonnet-4".into(),
    }
}
fn default_fallback() -> SourceConfig {
    SourceConfig {
        name: "ollama".into(),
        api_url: "http://localhost:11434/v1".into(),
        api_key: None,
        model: "llama3.1".into(),
    }
}
fn default_attempt_timeout_secs() -> u64 {
    120
}
fn default_backoff_base_secs() -> u64 {
    60
}
fn default_backoff_max_secs() -> u64 {
    1800
}
fn default_failure_recency_secs() -> u64 {
    300
}
fn default_failure_count_threshold() -> u32 {
    3
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            fallback: default_fallback(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            failure_recency_secs: default_failure_recency_secs(),
            failure_count_threshold: default_failure_count_threshold(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("primary", &self.primary)
            .field("fallback", &self.fallback)
            .field("attempt_timeout_secs", &self.attempt_timeout_secs)
            .field("backoff_base_secs", &self.backoff_base_secs)
            .field("backoff_max_secs", &self.backoff_max_secs)
            .field("failure_recency_secs", &self.failure_recency_secs)
            .field("failure_count_threshold", &self.failure_count_threshold)
            .finish()
    }
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("name", &self.name)
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

// --- Pacing ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Delay per character in character cadence.
    #[serde(default = "default_char_delay_ms")]
    pub char_delay_ms: u64,

    /// Delay per word in word cadence.
    #[serde(default = "default_word_delay_ms")]
    pub word_delay_ms: u64,

    /// Delay multiplier after a word/sentence boundary.
    #[serde(default = "default_boundary_multiplier")]
    pub boundary_multiplier: f64,

    /// Minimum visible duration for a phase transition.
    #[serde(default = "default_min_phase_ms")]
    pub min_phase_ms: u64,

    /// Debounce between consecutive phase deliveries.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Bound on the pending phase-transition queue.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_char_delay_ms() -> u64 {
    25
}
fn default_word_delay_ms() -> u64 {
    100
}
fn default_boundary_multiplier() -> f64 {
    1.5
}
fn default_min_phase_ms() -> u64 {
    500
}
fn default_debounce_ms() -> u64 {
    50
}
fn default_max_queue_size() -> usize {
    24
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            char_delay_ms: default_char_delay_ms(),
            word_delay_ms: default_word_delay_ms(),
            boundary_multiplier: default_boundary_multiplier(),
            min_phase_ms: default_min_phase_ms(),
            debounce_ms: default_debounce_ms(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

// --- Loading & validation ---

impl AppConfig {
    /// Load configuration from a TOML file, then apply environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: &Path) -> cadenza_core::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| cadenza_core::Error::Config {
                message: format!("failed to read {}: {e}", path.display()),
            })?;
            toml::from_str(&raw).map_err(|e| cadenza_core::Error::Config {
                message: format!("failed to parse {}: {e}", path.display()),
            })?
        } else {
            tracing::info!(path = %path.display(), "No config file found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Pull secrets from the environment, overriding any file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("CADENZA_API_KEY") {
            if !key.is_empty() {
                self.provider.primary.api_key = Some(key);
            }
        }
        if let Ok(key) = std::env::var("CADENZA_FALLBACK_API_KEY") {
            if !key.is_empty() {
                self.provider.fallback.api_key = Some(key);
            }
        }
    }

    /// Validate settings that serde defaults cannot enforce.
    pub fn validate(&self) -> cadenza_core::Result<()> {
        if self.admission.tiers.is_empty() {
            return Err(cadenza_core::Error::Config {
                message: "admission.tiers must not be empty".into(),
            });
        }
        for tier in &self.admission.tiers {
            if tier.capacity == 0 || tier.window_secs == 0 {
                return Err(cadenza_core::Error::Config {
                    message: format!("admission tier '{}' has zero capacity or window", tier.name),
                });
            }
        }
        if self.admission.violation_threshold == 0 {
            return Err(cadenza_core::Error::Config {
                message: "admission.violation_threshold must be at least 1".into(),
            });
        }
        if self.provider.backoff_base_secs == 0
            || self.provider.backoff_max_secs < self.provider.backoff_base_secs
        {
            return Err(cadenza_core::Error::Config {
                message: "provider backoff must satisfy 0 < base <= max".into(),
            });
        }
        if self.pacing.boundary_multiplier < 1.0 {
            return Err(cadenza_core::Error::Config {
                message: "pacing.boundary_multiplier must be >= 1.0".into(),
            });
        }
        if self.pacing.max_queue_size == 0 {
            return Err(cadenza_core::Error::Config {
                message: "pacing.max_queue_size must be at least 1".into(),
            });
        }
        Ok(())
    }
}
