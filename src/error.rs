//! Unified domain error handling
//!
//! One typed error covers the whole pipeline so every failure maps cleanly
//! to a machine-readable kind and an HTTP status at the boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid base64 document payload: {0}")]
    InvalidEncoding(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported file type: {file_type}")]
    UnsupportedFileType {
        file_type: String,
        supported_types: Vec<&'static str>,
    },

    #[error("Failed to parse PDF document: {0}")]
    PdfParsing(String),

    #[error("Failed to parse DOCX document: {0}")]
    DocxParsing(String),

    #[error("Failed to parse image: {0}")]
    ImageParsing(String),

    #[error("Document routing failed: {0}")]
    Routing(String),

    #[error("Required field '{field_name}' not found in document")]
    RequiredFieldMissing {
        field_name: String,
        field_description: Option<String>,
    },

    #[error("Invalid extraction result: {0}")]
    InvalidExtractionResult(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Chat backend request failed: {0}")]
    ChatBackend(String),

    #[error("OCR backend request failed: {0}")]
    OcrBackend(String),

    #[error("Document Intelligence is required for this document but not configured")]
    OcrNotConfigured,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ExtractError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidEncoding(_)
            | Self::InvalidRequest(_)
            | Self::UnsupportedFileType { .. }
            | Self::PdfParsing(_)
            | Self::DocxParsing(_)
            | Self::ImageParsing(_)
            | Self::Routing(_) => StatusCode::BAD_REQUEST,
            Self::RequiredFieldMissing { .. } | Self::InvalidExtractionResult(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::OcrBackend(_) => StatusCode::BAD_GATEWAY,
            Self::OcrNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration(_)
            | Self::Extraction(_)
            | Self::Validation(_)
            | Self::ChatBackend(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::InvalidEncoding(_) => "invalid_base64",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnsupportedFileType { .. } => "unsupported_file_type",
            Self::PdfParsing(_) => "pdf_parsing_error",
            Self::DocxParsing(_) => "docx_parsing_error",
            Self::ImageParsing(_) => "image_parsing_error",
            Self::Routing(_) => "document_routing_error",
            Self::RequiredFieldMissing { .. } => "required_field_missing",
            Self::InvalidExtractionResult(_) => "invalid_extraction_result",
            Self::Extraction(_) => "extraction_error",
            Self::Validation(_) => "validation_error",
            Self::ChatBackend(_) => "chat_backend_error",
            Self::OcrBackend(_) => "ocr_backend_error",
            Self::OcrNotConfigured => "document_intelligence_not_configured",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Structured context for the error body, where the variant carries any.
    pub fn metadata(&self) -> Option<Value> {
        match self {
            Self::UnsupportedFileType {
                file_type,
                supported_types,
            } => Some(json!({
                "file_type": file_type,
                "supported_types": supported_types,
            })),
            Self::RequiredFieldMissing {
                field_name,
                field_description,
            } => Some(json!({
                "field_name": field_name,
                "field_description": field_description,
            })),
            _ => None,
        }
    }

    fn public_message(&self) -> String {
        match self {
            // Don't leak internal error details
            Self::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ExtractError {
    fn into_response(self) -> Response {
        match &self {
            Self::Internal(e) => {
                tracing::error!(error = ?e, "Internal server error");
            }
            Self::ChatBackend(_) | Self::OcrBackend(_) => {
                tracing::error!(error = %self, "Backend call failed");
            }
            _ => {
                tracing::warn!(error = %self, "Request failed");
            }
        }

        let status = self.status_code();
        let body = ErrorResponse {
            error: self.kind().to_string(),
            message: self.public_message(),
            metadata: self.metadata(),
        };

        (status, Json(body)).into_response()
    }
}

pub type ExtractResult<T> = Result<T, ExtractError>;
