//! OCR backend backed by Azure Document Intelligence prebuilt-read.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error};

use crate::error::{ExtractError, ExtractResult};
use crate::services::credentials::{TokenProvider, COGNITIVE_SERVICES_SCOPE};

const ANALYZE_API_VERSION: &str = "2024-11-30";

/// Recognized text for one page, in reading order.
#[derive(Debug, Clone)]
pub struct OcrPage {
    pub page_number: u32,
    pub lines: Vec<String>,
}

/// Abstraction over the OCR service.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Run layout-free text recognition over raw document bytes.
    async fn read(&self, bytes: &[u8]) -> ExtractResult<Vec<OcrPage>>;

    /// Release held resources at shutdown.
    async fn close(&self) {}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResultEnvelope {
    status: String,
    #[serde(default)]
    analyze_result: Option<AnalyzeResult>,
    #[serde(default)]
    error: Option<AnalyzeError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    #[serde(default)]
    pages: Vec<AnalyzePage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzePage {
    page_number: u32,
    #[serde(default)]
    lines: Vec<AnalyzeLine>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeLine {
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnalyzeError {
    message: String,
}

/// Client for the Document Intelligence analyze/poll API.
pub struct DocumentIntelligenceClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    tokens: Option<Arc<TokenProvider>>,
    poll_interval: Duration,
    poll_max_attempts: u32,
}

impl DocumentIntelligenceClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        tokens: Option<Arc<TokenProvider>>,
        poll_interval_ms: u64,
        poll_max_attempts: u32,
    ) -> Result<Self> {
        if api_key.is_none() && tokens.is_none() {
            anyhow::bail!("Document Intelligence needs an API key or managed identity");
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create OCR HTTP client")?;

        tracing::info!(endpoint = endpoint, "Document Intelligence client initialized");

        Ok(Self {
            http,
            base_url: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            tokens,
            poll_interval: Duration::from_millis(poll_interval_ms),
            poll_max_attempts,
        })
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> ExtractResult<reqwest::RequestBuilder> {
        if let Some(key) = &self.api_key {
            return Ok(request.header("Ocp-Apim-Subscription-Key", key));
        }
        let tokens = self.tokens.as_ref().ok_or_else(|| {
            ExtractError::OcrBackend("no Document Intelligence credential available".to_string())
        })?;
        let token = tokens
            .token(COGNITIVE_SERVICES_SCOPE)
            .await
            .map_err(|e| ExtractError::OcrBackend(format!("credential error: {e}")))?;
        Ok(request.bearer_auth(token))
    }

    async fn submit(&self, bytes: &[u8]) -> ExtractResult<String> {
        let url = format!(
            "{}/documentintelligence/documentModels/prebuilt-read:analyze?api-version={ANALYZE_API_VERSION}",
            self.base_url
        );

        let request = self
            .authorize(self.http.post(&url))
            .await?
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec());

        let response = request.send().await.map_err(|e| {
            error!(error = %e, "OCR analyze request failed");
            ExtractError::OcrBackend(format!("OCR service unavailable: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            error!(status = %status, detail = %detail, "OCR analyze rejected");
            return Err(ExtractError::OcrBackend(format!(
                "OCR analyze returned status {status}"
            )));
        }

        response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ExtractError::OcrBackend("OCR analyze response missing Operation-Location".to_string())
            })
    }

    async fn poll(&self, operation_url: &str) -> ExtractResult<AnalyzeResult> {
        for attempt in 1..=self.poll_max_attempts {
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .authorize(self.http.get(operation_url))
                .await?
                .send()
                .await
                .map_err(|e| ExtractError::OcrBackend(format!("OCR poll failed: {e}")))?;

            if !response.status().is_success() {
                return Err(ExtractError::OcrBackend(format!(
                    "OCR poll returned status {}",
                    response.status()
                )));
            }

            let envelope: AnalyzeResultEnvelope = response.json().await.map_err(|e| {
                ExtractError::OcrBackend(format!("invalid OCR poll response: {e}"))
            })?;

            debug!(attempt = attempt, status = %envelope.status, "OCR poll");
            match envelope.status.as_str() {
                "succeeded" => {
                    return envelope.analyze_result.ok_or_else(|| {
                        ExtractError::OcrBackend(
                            "OCR succeeded without an analyze result".to_string(),
                        )
                    })
                }
                "failed" => {
                    let message = envelope
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "unspecified OCR failure".to_string());
                    return Err(ExtractError::OcrBackend(format!("OCR analysis failed: {message}")));
                }
                _ => {}
            }
        }

        Err(ExtractError::OcrBackend(format!(
            "OCR analysis did not complete within {} polls",
            self.poll_max_attempts
        )))
    }
}

#[async_trait]
impl OcrBackend for DocumentIntelligenceClient {
    async fn read(&self, bytes: &[u8]) -> ExtractResult<Vec<OcrPage>> {
        let operation_url = self.submit(bytes).await?;
        let result = self.poll(&operation_url).await?;

        Ok(result
            .pages
            .into_iter()
            .map(|page| OcrPage {
                page_number: page.page_number,
                lines: page.lines.into_iter().map(|line| line.content).collect(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn analyze_envelope_parses_succeeded_payload() {
        let envelope: AnalyzeResultEnvelope = serde_json::from_value(json!({
            "status": "succeeded",
            "analyzeResult": {
                "pages": [
                    { "pageNumber": 1, "lines": [{ "content": "Invoice 42" }] },
                    { "pageNumber": 2, "lines": [] }
                ]
            }
        }))
        .unwrap();

        let result = envelope.analyze_result.unwrap();
        assert_eq!(result.pages.len(), 2);
        assert_eq!(result.pages[0].lines[0].content, "Invoice 42");
    }

    #[test]
    fn analyze_envelope_parses_failure_payload() {
        let envelope: AnalyzeResultEnvelope = serde_json::from_value(json!({
            "status": "failed",
            "error": { "message": "content unreadable" }
        }))
        .unwrap();
        assert_eq!(envelope.status, "failed");
        assert_eq!(envelope.error.unwrap().message, "content unreadable");
    }

    #[test]
    fn client_requires_some_credential() {
        assert!(DocumentIntelligenceClient::new("https://di.example.com", None, None, 100, 10)
            .is_err());
    }
}
