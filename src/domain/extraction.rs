//! Extraction domain types
//!
//! Types shared across the routing, extraction, validation and
//! orchestration stages of the pipeline.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ExtractError;

// ============================================================================
// Document and method enums
// ============================================================================

/// File types the pipeline accepts, sorted alphabetically for error output.
pub const SUPPORTED_FILE_TYPES: [&str; 5] = ["docx", "jpeg", "jpg", "pdf", "png"];

/// Extraction strategy chosen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    LlmText,
    LlmVision,
    DocumentIntelligence,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmText => "llm_text",
            Self::LlmVision => "llm_vision",
            Self::DocumentIntelligence => "document_intelligence",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Pdf,
    Docx,
    Png,
    Jpg,
    Jpeg,
}

impl DocumentType {
    /// Normalize and validate a caller-supplied file type string.
    pub fn parse(file_type: &str) -> Result<Self, ExtractError> {
        match file_type.trim().to_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            "png" => Ok(Self::Png),
            "jpg" => Ok(Self::Jpg),
            "jpeg" => Ok(Self::Jpeg),
            other => Err(ExtractError::UnsupportedFileType {
                file_type: other.to_string(),
                supported_types: SUPPORTED_FILE_TYPES.to_vec(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Jpeg => "jpeg",
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Png | Self::Jpg | Self::Jpeg)
    }

    /// Types with directly extractable text content.
    pub fn is_text_native(&self) -> bool {
        matches!(self, Self::Pdf | Self::Docx)
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Self::Png => "image/png",
            Self::Jpg | Self::Jpeg => "image/jpeg",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Outcome of routing one document to an extraction strategy.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub method: ExtractionMethod,
    pub doc_type: DocumentType,
    /// Human-readable explanation, always non-empty.
    pub reasoning: String,
    /// Open key-value bag: page count, text density, image dimensions,
    /// or an `analysis_error` key when characteristic analysis failed.
    pub metadata: Map<String, Value>,
}

// ============================================================================
// Request field specification
// ============================================================================

/// One field the caller wants extracted from the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataElement {
    pub name: String,
    pub description: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub required: bool,
}

fn default_format() -> String {
    "string".to_string()
}

// ============================================================================
// Stage payloads
// ============================================================================

/// Image (or whole-document) payload handed to the vision strategy.
#[derive(Debug, Clone, Serialize)]
pub struct ImageData {
    pub base64_data: String,
    pub media_type: String,
    pub width: u32,
    pub height: u32,
    pub mode: String,
    pub format: String,
}

/// Output of the extraction stage.
#[derive(Debug, Clone)]
pub struct ExtractionPayload {
    /// Field name -> extracted value (JSON scalar or null).
    pub data: Map<String, Value>,
    /// Text handed to the validation stage. For vision extraction this is a
    /// descriptor placeholder rather than real document text.
    pub document_content: String,
    pub content_is_placeholder: bool,
}

// ============================================================================
// Validation results
// ============================================================================

/// Verdict for a single extracted field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldValidationResult {
    pub field_name: String,
    pub is_valid: bool,
    /// Model-assigned estimate in [0, 1].
    pub confidence_score: f64,
    pub extracted_value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Aggregated validation verdict across all fields.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub success: bool,
    pub field_results: BTreeMap<String, FieldValidationResult>,
    pub overall_confidence: f64,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn confidence_scores(&self) -> BTreeMap<String, f64> {
        self.field_results
            .iter()
            .map(|(name, result)| (name.clone(), result.confidence_score))
            .collect()
    }
}

// ============================================================================
// Orchestration result
// ============================================================================

/// Final merged view returned to the caller. Constructed once per request
/// and serialized directly.
#[derive(Debug, Serialize)]
pub struct OrchestrationResult {
    pub success: bool,
    #[serde(rename = "extractedData")]
    pub extracted_data: Map<String, Value>,
    #[serde(rename = "confidence")]
    pub confidence_scores: BTreeMap<String, f64>,
    pub overall_confidence: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Typed extraction-stage failure, kept out of the body so the HTTP
    /// layer can map it to a status code.
    #[serde(skip)]
    pub failure: Option<ExtractError>,
}

impl OrchestrationResult {
    pub fn extraction_failure(error: ExtractError, metadata: Map<String, Value>) -> Self {
        Self {
            success: false,
            extracted_data: Map::new(),
            confidence_scores: BTreeMap::new(),
            overall_confidence: 0.0,
            errors: vec![error.to_string()],
            metadata,
            failure: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_type_parse_normalizes_case_and_whitespace() {
        assert_eq!(DocumentType::parse(" PDF\n").unwrap(), DocumentType::Pdf);
        assert_eq!(DocumentType::parse("Jpeg").unwrap(), DocumentType::Jpeg);
    }

    #[test]
    fn document_type_parse_rejects_unknown_with_sorted_supported_list() {
        let err = DocumentType::parse("txt").unwrap_err();
        match err {
            ExtractError::UnsupportedFileType {
                file_type,
                supported_types,
            } => {
                assert_eq!(file_type, "txt");
                assert_eq!(supported_types, vec!["docx", "jpeg", "jpg", "pdf", "png"]);
                let mut sorted = supported_types.clone();
                sorted.sort_unstable();
                assert_eq!(supported_types, sorted);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn data_element_defaults_apply_on_deserialize() {
        let element: DataElement =
            serde_json::from_str(r#"{"name": "total", "description": "Invoice total"}"#).unwrap();
        assert_eq!(element.format, "string");
        assert!(!element.required);
    }

    #[test]
    fn orchestration_result_serializes_camel_case_and_omits_empty() {
        let result = OrchestrationResult {
            success: true,
            extracted_data: Map::new(),
            confidence_scores: BTreeMap::from([("total".to_string(), 0.9)]),
            overall_confidence: 0.9,
            errors: Vec::new(),
            metadata: Map::new(),
            failure: None,
        };
        let body = serde_json::to_value(&result).unwrap();
        assert!(body.get("extractedData").is_some());
        assert_eq!(body["confidence"]["total"], 0.9);
        assert!(body.get("errors").is_none());
        assert!(body.get("metadata").is_none());
        assert!(body.get("failure").is_none());
    }
}
