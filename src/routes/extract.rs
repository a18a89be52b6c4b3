//! Document extraction endpoint.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use tracing::info;

use crate::app::AppState;
use crate::domain::extraction::{DataElement, OrchestrationResult};
use crate::error::{ExtractError, ExtractResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractDocumentRequest {
    pub document_base64: String,
    pub file_type: String,
    pub data_elements: Vec<DataElement>,
}

/// POST /extract_document_data
pub async fn extract_document_data(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExtractDocumentRequest>,
) -> ExtractResult<Json<OrchestrationResult>> {
    validate_request(&request)?;

    // Base64 carries 3 payload bytes per 4 characters.
    let max_encoded_len = state.settings.max_document_size_bytes() / 3 * 4 + 4;
    if request.document_base64.len() > max_encoded_len {
        return Err(ExtractError::InvalidRequest(format!(
            "document exceeds maximum size of {} MB",
            state.settings.max_document_size_mb
        )));
    }

    info!(
        file_type = %request.file_type,
        elements = request.data_elements.len(),
        "Extraction request received"
    );

    let mut result = state
        .orchestrator
        .orchestrate(
            &request.document_base64,
            &request.file_type,
            &request.data_elements,
        )
        .await;

    // Extraction-stage failures map to their HTTP status; validation
    // outcomes always come back 200 with the success flag set.
    if let Some(failure) = result.failure.take() {
        return Err(failure);
    }
    Ok(Json(result))
}

fn validate_request(request: &ExtractDocumentRequest) -> ExtractResult<()> {
    if request.document_base64.trim().is_empty() {
        return Err(ExtractError::InvalidEncoding(
            "document payload is empty".to_string(),
        ));
    }
    if request.data_elements.is_empty() {
        return Err(ExtractError::InvalidRequest(
            "dataElements must not be empty".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for element in &request.data_elements {
        if element.name.trim().is_empty() {
            return Err(ExtractError::InvalidRequest(
                "data element names must not be empty".to_string(),
            ));
        }
        if !seen.insert(element.name.as_str()) {
            return Err(ExtractError::InvalidRequest(format!(
                "duplicate data element name '{}'",
                element.name
            )));
        }
    }
    Ok(())
}
