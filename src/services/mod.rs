//! External service clients: chat completion, OCR and Azure credentials.

pub mod chat;
pub mod credentials;
pub mod ocr;

use std::sync::Arc;

use anyhow::Result;

use crate::config::Settings;
use crate::services::credentials::TokenProvider;
use crate::services::ocr::{DocumentIntelligenceClient, OcrBackend};

/// Build the OCR client when Document Intelligence is configured.
///
/// Returns `None` when no endpoint is set, which downgrades routing to the
/// vision fallback rather than failing startup.
pub fn build_ocr_client(
    settings: &Settings,
    tokens: &Arc<TokenProvider>,
) -> Result<Option<Arc<dyn OcrBackend>>> {
    let Some(endpoint) = settings.di_endpoint.as_deref() else {
        return Ok(None);
    };

    let client = DocumentIntelligenceClient::new(
        endpoint,
        settings.di_key.clone(),
        settings.di_use_managed_identity.then(|| Arc::clone(tokens)),
        settings.ocr_poll_interval_ms,
        settings.ocr_poll_max_attempts,
    )?;
    Ok(Some(Arc::new(client)))
}
