//! Chat completion backend for the Azure AI Foundry OpenAI-compatible API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::error::{ExtractError, ExtractResult};
use crate::services::credentials::{TokenProvider, COGNITIVE_SERVICES_SCOPE};

/// Sampling settings shared by extraction and validation calls. Structured
/// output wants low variance, not creativity.
pub const LOW_VARIANCE_TEMPERATURE: f32 = 0.1;
pub const LOW_VARIANCE_TOP_P: f32 = 0.9;

/// User-turn content, optionally with an inline image attachment.
#[derive(Debug, Clone)]
pub enum UserContent {
    Text(String),
    TextWithAttachment {
        text: String,
        media_type: String,
        base64_data: String,
    },
}

/// One chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: UserContent,
    pub temperature: f32,
    pub top_p: f32,
}

/// Abstraction over the chat model so the pipeline can be tested with
/// scripted responses.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> ExtractResult<String>;

    /// Release held resources at shutdown.
    async fn close(&self) {}
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Chat client for an Azure AI Foundry deployment.
pub struct FoundryChatClient {
    http: Client,
    base_url: String,
    tokens: Arc<TokenProvider>,
}

impl FoundryChatClient {
    pub fn new(base_url: &str, tokens: Arc<TokenProvider>, timeout_seconds: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create chat HTTP client")?;

        tracing::info!(base_url = base_url, "Chat client initialized");

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn user_message(content: &UserContent) -> Value {
        match content {
            UserContent::Text(text) => json!({ "role": "user", "content": text }),
            UserContent::TextWithAttachment {
                text,
                media_type,
                base64_data,
            } => json!({
                "role": "user",
                "content": [
                    { "type": "text", "text": text },
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{media_type};base64,{base64_data}")
                        }
                    }
                ]
            }),
        }
    }
}

#[async_trait]
impl ChatBackend for FoundryChatClient {
    async fn complete(&self, request: ChatRequest) -> ExtractResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let token = self
            .tokens
            .token(COGNITIVE_SERVICES_SCOPE)
            .await
            .map_err(|e| ExtractError::ChatBackend(format!("credential error: {e}")))?;

        let body = json!({
            "model": request.model,
            "messages": [
                { "role": "system", "content": request.system },
                Self::user_message(&request.user)
            ],
            "temperature": request.temperature,
            "top_p": request.top_p,
        });

        debug!(url = %url, model = %request.model, "Chat completion request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Chat service request failed");
                ExtractError::ChatBackend(format!("chat service unavailable: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            error!(status = %status, detail = %detail, "Chat service error");
            return Err(ExtractError::ChatBackend(format!(
                "chat service returned status {status}"
            )));
        }

        let completion: CompletionResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse chat completion response");
            ExtractError::ChatBackend(format!("invalid chat completion response: {e}"))
        })?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| {
                ExtractError::ChatBackend("chat completion returned no content".to_string())
            })
    }
}
