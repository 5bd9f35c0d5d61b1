//! # Cadenza Providers
//!
//! Model source implementations and the circuit-breaker selector that
//! fails over between a primary and a fallback source.

pub mod openai_compat;
pub mod selector;

pub use openai_compat::OpenAiCompatSource;
pub use selector::{BackoffPolicy, HealthStatus, ProviderSelector};

use std::sync::Arc;

/// Build the selector from configuration: one OpenAI-compatible source per
/// configured endpoint, wired primary-then-fallback.
pub fn build_from_config(config: &cadenza_config::ProviderConfig) -> ProviderSelector {
    let primary = Arc::new(OpenAiCompatSource::new(&config.primary));
    let fallback = Arc::new(OpenAiCompatSource::new(&config.fallback));
    ProviderSelector::new(primary, fallback, config)
}
