//! Inference collaborator.
//!
//! The analyzer and the chat manager both talk to a generative model through
//! [`InferenceClient`]. The production implementation is [`GeminiClient`],
//! which calls the Gemini `generateContent` REST endpoint.
//!
//! Retry strategy (same as every outbound HTTP call in this crate):
//! - HTTP 429 or 5xx → retry with exponential backoff (1s, 2s, 4s, ...)
//! - other HTTP 4xx → fail immediately
//! - network error → retry

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::InferenceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// One model call: an optional system instruction plus the conversation.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    /// Ask the model for a JSON document instead of prose.
    pub json: bool,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference service unavailable: {0}")]
    Unavailable(String),
    #[error("inference request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed inference response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Model identifier, for health and logs.
    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, InferenceError>;
}

pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl GeminiClient {
    pub fn new(config: &InferenceConfig, api_key: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: api_key.to_string(),
            max_retries: config.max_retries,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl InferenceClient for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, InferenceError> {
        let body = request_body(request);
        let url = self.endpoint();
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(attempt, ?delay, "retrying inference call");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
                        return parse_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(InferenceError::Unavailable(format!(
                            "HTTP {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    return Err(InferenceError::Rejected {
                        status: status.as_u16(),
                        body: body_text,
                    });
                }
                Err(e) => {
                    last_err = Some(InferenceError::Unavailable(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| InferenceError::Unavailable("inference failed after retries".into())))
    }
}

fn request_body(request: &CompletionRequest) -> Value {
    let contents: Vec<Value> = request
        .messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            json!({ "role": role, "parts": [{ "text": m.text }] })
        })
        .collect();

    let mut body = json!({ "contents": contents });
    if let Some(system) = &request.system {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    if request.json {
        body["generationConfig"] = json!({ "responseMimeType": "application/json" });
    }
    body
}

/// Concatenate the text parts of the first candidate.
fn parse_response(json: &Value) -> Result<String, InferenceError> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| InferenceError::Malformed("missing candidates[0].content.parts".into()))?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();

    if text.trim().is_empty() {
        let reason = json
            .pointer("/candidates/0/finishReason")
            .and_then(|r| r.as_str())
            .unwrap_or("unknown");
        return Err(InferenceError::Malformed(format!(
            "empty response (finishReason: {})",
            reason
        )));
    }
    Ok(text)
}
