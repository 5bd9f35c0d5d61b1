//! Conversation payload types.
//!
//! The chat surface persists conversations elsewhere; the resilience core
//! only carries the payload through to a model source, so these types stay
//! deliberately small.

use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in the conversation payload sent upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One chat turn handed to a model source.
///
/// `persona` is opaque metadata from the persona-template layer (out of
/// scope here); the core only forwards it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Conversation this turn belongs to.
    pub conversation_id: String,

    /// Persona system prompt, if the surrounding app selected one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,

    /// The conversation payload, oldest first.
    pub messages: Vec<ChatMessage>,

    /// Requested model identifier.
    pub model: String,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_temperature() -> f32 {
    0.7
}

impl TurnRequest {
    /// Build a single-message turn, generating a fresh conversation id.
    pub fn single(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            persona: None,
            messages: vec![ChatMessage::user(content)],
            model: model.into(),
            temperature: default_temperature(),
        }
    }
}
