//! OpenAI-compatible model source.
//!
//! Speaks the `/chat/completions` SSE dialect used by OpenRouter, OpenAI,
//! Ollama, and most self-hosted gateways, and adapts it to the raw
//! phase/text event stream the rest of the pipeline consumes. Transport
//! failures surface as `SourceError` so the selector can count them
//! against the primary.

use async_trait::async_trait;
use cadenza_config::SourceConfig;
use cadenza_core::error::SourceError;
use cadenza_core::message::{Role, TurnRequest};
use cadenza_core::phase::Phase;
use cadenza_core::source::{ModelSource, RawModelEvent};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

/// A model source backed by an OpenAI-compatible streaming endpoint.
pub struct OpenAiCompatSource {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// The model to request: the turn's explicit choice, else this
    /// source's configured default.
    fn model_for<'a>(&'a self, request: &'a TurnRequest) -> &'a str {
        if request.model.is_empty() {
            &self.model
        } else {
            &request.model
        }
    }

    /// Convert the turn payload to API messages, prepending the persona
    /// system prompt when present.
    fn to_api_messages(request: &TurnRequest) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(persona) = &request.persona {
            messages.push(serde_json::json!({
                "role": "system",
                "content": persona,
            }));
        }
        for msg in &request.messages {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(serde_json::json!({
                "role": role,
                "content": msg.content,
            }));
        }
        messages
    }
}

/// Parse one SSE `data:` payload into a raw event, if it carries one.
fn parse_stream_data(data: &str) -> Option<RawModelEvent> {
    if data == "[DONE]" {
        return Some(RawModelEvent::Done);
    }

    let parsed: StreamResponse = serde_json::from_str(data).ok()?;
    let choice = parsed.choices.into_iter().next()?;

    if let Some(tool_calls) = choice.delta.tool_calls {
        let tool_name = tool_calls
            .into_iter()
            .find_map(|tc| tc.function.and_then(|f| f.name));
        return Some(RawModelEvent::Phase {
            phase: Phase::ToolExecution,
            message: tool_name,
        });
    }

    let content = choice.delta.content?;
    if content.is_empty() {
        return None;
    }
    Some(RawModelEvent::Text { content })
}

#[async_trait]
impl ModelSource for OpenAiCompatSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(
        &self,
        request: TurnRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<RawModelEvent, SourceError>>,
        SourceError,
    > {
        let url = format!("{}/chat/completions", self.base_url);
        let model = self.model_for(&request).to_string();

        let body = serde_json::json!({
            "model": model,
            "messages": Self::to_api_messages(&request),
            "temperature": request.temperature,
            "stream": true,
        });

        debug!(source = %self.name, model = %model, "Opening streaming turn");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 401 || status == 403 {
            return Err(SourceError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(source = %self.name, status, body = %error_body, "Source streaming error");
            return Err(SourceError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let source_name = self.name.clone();

        // Read the SSE byte stream and translate chunks to raw events.
        tokio::spawn(async move {
            // The model is working before the first delta arrives.
            if tx
                .send(Ok(RawModelEvent::Phase {
                    phase: Phase::Thinking,
                    message: None,
                }))
                .await
                .is_err()
            {
                return;
            }

            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(source = %source_name, error = %e, "SSE stream broke mid-answer");
                        let _ = tx
                            .send(Err(SourceError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }

                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Some(event) = parse_stream_data(data.trim()) {
                            let done = matches!(event, RawModelEvent::Done);
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                            if done {
                                return;
                            }
                        }
                    }
                }
            }

            // Stream ended without [DONE]; treat as normal completion.
            let _ = tx.send(Ok(RawModelEvent::Done)).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> std::result::Result<bool, SourceError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }
}

// --- API response shapes (streaming) ---

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
}
