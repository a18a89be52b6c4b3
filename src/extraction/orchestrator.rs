//! Two-stage pipeline: route and extract, then validate.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use crate::config::Settings;
use crate::domain::extraction::{
    DataElement, DocumentType, ExtractionMethod, ExtractionPayload, ImageData,
    OrchestrationResult,
};
use crate::error::{ExtractError, ExtractResult};
use crate::extraction::context::DocumentContext;
use crate::extraction::extractor::{ExtractionRequest, Extractor, ExtractorConfig};
use crate::extraction::parser;
use crate::extraction::router::DocumentRouter;
use crate::extraction::validator::{Validator, ValidatorConfig};
use crate::services::chat::ChatBackend;
use crate::services::ocr::OcrBackend;

struct ExtractionStage {
    payload: ExtractionPayload,
    metadata: Map<String, Value>,
    context: DocumentContext,
}

/// Drives one document through routing, extraction and validation.
pub struct Orchestrator {
    router: DocumentRouter,
    extractor: Extractor,
    validator: Validator,
}

impl Orchestrator {
    pub fn new(
        settings: &Settings,
        chat: Arc<dyn ChatBackend>,
        ocr: Option<Arc<dyn OcrBackend>>,
    ) -> Self {
        Self {
            router: DocumentRouter::new(settings.routing_config()),
            extractor: Extractor::new(
                Arc::clone(&chat),
                ocr,
                ExtractorConfig {
                    extraction_model: settings.extraction_model.clone(),
                    prompt_template: settings.extraction_prompt.clone(),
                },
            ),
            validator: Validator::new(
                chat,
                ValidatorConfig {
                    validation_model: settings.validation_model.clone(),
                    prompt_template: settings.validation_prompt.clone(),
                    min_confidence_threshold: settings.min_confidence_threshold,
                },
            ),
        }
    }

    /// Extraction failures become a failed result carrying the typed error;
    /// validation failures keep the extracted data with success set false.
    #[instrument(skip_all, fields(file_type = file_type, elements = elements.len()))]
    pub async fn orchestrate(
        &self,
        document_base64: &str,
        file_type: &str,
        elements: &[DataElement],
    ) -> OrchestrationResult {
        let stage = match self.run_extraction(document_base64, file_type, elements).await {
            Ok(stage) => stage,
            Err((error, metadata)) => {
                warn!(error = %error, "Extraction stage failed");
                return OrchestrationResult::extraction_failure(error, metadata);
            }
        };

        let ExtractionStage {
            payload,
            mut metadata,
            context,
        } = stage;
        let content = validation_content(&payload, &context, &mut metadata);

        match self
            .validator
            .validate(&payload.data, &content, elements)
            .await
        {
            Ok(validation) => {
                metadata.insert(
                    "validation".to_string(),
                    json!({
                        "overall_confidence": validation.overall_confidence,
                        "field_count": validation.field_results.len(),
                    }),
                );
                info!(
                    success = validation.success,
                    overall_confidence = validation.overall_confidence,
                    "Pipeline complete"
                );
                OrchestrationResult {
                    success: validation.success,
                    extracted_data: payload.data,
                    confidence_scores: validation.confidence_scores(),
                    overall_confidence: validation.overall_confidence,
                    errors: validation.errors,
                    metadata,
                    failure: None,
                }
            }
            Err(error) => {
                warn!(error = %error, "Validation stage failed");
                OrchestrationResult {
                    success: false,
                    extracted_data: payload.data,
                    confidence_scores: BTreeMap::new(),
                    overall_confidence: 0.0,
                    errors: vec![error.to_string()],
                    metadata,
                    failure: None,
                }
            }
        }
    }

    async fn run_extraction(
        &self,
        document_base64: &str,
        file_type: &str,
        elements: &[DataElement],
    ) -> Result<ExtractionStage, (ExtractError, Map<String, Value>)> {
        let mut metadata = Map::new();

        let doc_type = DocumentType::parse(file_type).map_err(|e| (e, Map::new()))?;
        let context = DocumentContext::new(doc_type, document_base64);
        // Fail fast on undecodable payloads before any analysis.
        context.raw_bytes().map_err(|e| (e, Map::new()))?;

        let decision = self
            .router
            .analyze_and_route(&context)
            .map_err(|e| (e, metadata.clone()))?;
        metadata.extend(decision.metadata.clone());
        metadata.insert("extraction_method".to_string(), json!(decision.method.as_str()));
        metadata.insert("routing_reasoning".to_string(), json!(decision.reasoning));

        info!(method = %decision.method, doc_type = %doc_type, "Document routed");

        let payload = match decision.method {
            ExtractionMethod::LlmText => {
                let text = parser::parse_document(&context, true)
                    .map_err(|e| (e, metadata.clone()))?;
                self.extractor
                    .extract(
                        ExtractionRequest {
                            text: Some(&text),
                            ..Default::default()
                        },
                        elements,
                    )
                    .await
                    .map_err(|e| (e, metadata.clone()))?
            }
            ExtractionMethod::LlmVision => {
                let image = vision_payload(&context).map_err(|e| (e, metadata.clone()))?;
                self.extractor
                    .extract(
                        ExtractionRequest {
                            image: Some(&image),
                            ..Default::default()
                        },
                        elements,
                    )
                    .await
                    .map_err(|e| (e, metadata.clone()))?
            }
            ExtractionMethod::DocumentIntelligence => self
                .extractor
                .extract(
                    ExtractionRequest {
                        document: Some(&context),
                        use_document_intelligence: true,
                        ..Default::default()
                    },
                    elements,
                )
                .await
                .map_err(|e| (e, metadata.clone()))?,
        };

        Ok(ExtractionStage {
            payload,
            metadata,
            context,
        })
    }
}

/// Whole document handed to the vision model. Images are decoded and
/// normalized; PDFs go through as-is since vision deployments accept them.
fn vision_payload(context: &DocumentContext) -> ExtractResult<ImageData> {
    if context.doc_type().is_image() {
        return parser::parse_image_document(context);
    }
    Ok(ImageData {
        base64_data: context.base64_data().trim().to_string(),
        media_type: context.doc_type().media_type().to_string(),
        width: 0,
        height: 0,
        mode: "document".to_string(),
        format: context.doc_type().as_str().to_string(),
    })
}

/// Pick the text the validator should see. Vision extraction only has a
/// placeholder, so text-native documents get their text re-derived.
fn validation_content(
    payload: &ExtractionPayload,
    context: &DocumentContext,
    metadata: &mut Map<String, Value>,
) -> String {
    if !payload.content_is_placeholder {
        return payload.document_content.clone();
    }
    if context.doc_type().is_text_native() {
        // The vision path never parsed the document, so any text it does
        // hold is recovered here for the validator.
        match parser::parse_document(context, true) {
            Ok(text) => return text,
            Err(error) => {
                warn!(error = %error, "Could not re-derive document text for validation");
            }
        }
    }
    metadata.insert("validation_content_placeholder".to_string(), json!(true));
    payload.document_content.clone()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::extraction::extractor::tests::ScriptedChat;
    use crate::extraction::parser::tests::{docx_context, pdf_context};
    use crate::services::chat::UserContent;

    fn settings() -> Settings {
        Settings::default()
    }

    fn elements() -> Vec<DataElement> {
        vec![DataElement {
            name: "total".to_string(),
            description: "Invoice total".to_string(),
            format: "number".to_string(),
            required: true,
        }]
    }

    fn docx_base64(body: &str) -> String {
        docx_context(body).base64_data().to_string()
    }

    #[tokio::test]
    async fn successful_docx_pipeline_merges_both_stages() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(r#"{"total": 42.5}"#.to_string()),
            Ok(json!({ "total": { "is_valid": true, "confidence": 0.95 } }).to_string()),
        ]));
        let orchestrator = Orchestrator::new(&settings(), chat.clone(), None);

        let base64 = docx_base64("<w:p><w:r><w:t>Total: 42.50</w:t></w:r></w:p>");
        let result = orchestrator.orchestrate(&base64, "docx", &elements()).await;

        assert!(result.success, "errors: {:?}", result.errors);
        assert!(result.failure.is_none());
        assert_eq!(result.extracted_data["total"], json!(42.5));
        assert_eq!(result.confidence_scores["total"], 0.95);
        assert_eq!(result.overall_confidence, 0.95);
        assert_eq!(result.metadata["extraction_method"], json!("llm_text"));
        assert!(result.metadata.contains_key("routing_reasoning"));
        assert_eq!(result.metadata["validation"]["field_count"], json!(1));
        assert_eq!(chat.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn dense_pdf_pipeline_extracts_from_parsed_text() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(r#"{"total": 99.5}"#.to_string()),
            Ok(json!({ "total": { "is_valid": true, "confidence": 0.95 } }).to_string()),
        ]));
        let orchestrator = Orchestrator::new(&settings(), chat.clone(), None);

        let body = "Invoice INV-1042 from Acme Corp. Total due: 99.50 USD. ".repeat(10);
        let base64 = pdf_context(&[body.trim_end()]).base64_data().to_string();
        let result = orchestrator.orchestrate(&base64, "pdf", &elements()).await;

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.metadata["extraction_method"], json!("llm_text"));
        assert_eq!(result.metadata["total_pages"], json!(1));
        assert_eq!(result.overall_confidence, 0.95);

        // The extraction request carried the parsed page text, not raw bytes.
        let requests = chat.requests.lock();
        match &requests[0].user {
            UserContent::Text(text) => {
                assert!(text.contains("=== Page 1 ==="));
                assert!(text.contains("INV-1042"));
            }
            other => panic!("expected text content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn vision_routed_pdf_revalidates_against_parsed_text() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(r#"{"total": 12}"#.to_string()),
            Ok(json!({ "total": { "is_valid": true, "confidence": 0.9 } }).to_string()),
        ]));
        let orchestrator = Orchestrator::new(&settings(), chat.clone(), None);

        // Too little text for text extraction, but enough to validate against.
        let base64 = pdf_context(&["INV-9 total 12"]).base64_data().to_string();
        let result = orchestrator.orchestrate(&base64, "pdf", &elements()).await;

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.metadata["extraction_method"], json!("llm_vision"));
        assert!(!result.metadata.contains_key("validation_content_placeholder"));

        // The validation prompt saw the re-derived page text, not the
        // vision descriptor.
        let requests = chat.requests.lock();
        match &requests[1].user {
            UserContent::Text(prompt) => {
                assert!(prompt.contains("INV-9"));
                assert!(!prompt.contains("[application/pdf document]"));
            }
            other => panic!("expected text content, got {other:?}"),
        }
    }

    #[test]
    fn placeholder_content_is_rederived_for_text_bearing_documents() {
        let context = pdf_context(&["Recovered invoice body INV-7"]);
        let payload = ExtractionPayload {
            data: Map::new(),
            document_content: "[application/pdf document]".to_string(),
            content_is_placeholder: true,
        };
        let mut metadata = Map::new();

        let content = validation_content(&payload, &context, &mut metadata);

        assert!(content.contains("=== Page 1 ==="));
        assert!(content.contains("INV-7"));
        assert!(!metadata.contains_key("validation_content_placeholder"));
    }

    #[test]
    fn placeholder_survives_when_no_text_can_be_rederived() {
        use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
        use base64::Engine;

        let context =
            DocumentContext::new(DocumentType::Pdf, BASE64_STANDARD.encode(b"not a pdf"));
        let payload = ExtractionPayload {
            data: Map::new(),
            document_content: "[application/pdf document]".to_string(),
            content_is_placeholder: true,
        };
        let mut metadata = Map::new();

        let content = validation_content(&payload, &context, &mut metadata);

        assert_eq!(content, "[application/pdf document]");
        assert_eq!(metadata["validation_content_placeholder"], json!(true));
    }

    #[tokio::test]
    async fn extraction_failure_skips_validation_entirely() {
        let chat = Arc::new(ScriptedChat::new(vec![]));
        let orchestrator = Orchestrator::new(&settings(), chat.clone(), None);

        // Parseable archive, but no text anywhere.
        let base64 = docx_base64("<w:p></w:p>");
        let result = orchestrator.orchestrate(&base64, "docx", &elements()).await;

        assert!(!result.success);
        assert!(matches!(result.failure, Some(ExtractError::DocxParsing(_))));
        assert!(result.extracted_data.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(chat.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn low_confidence_keeps_extracted_data_with_failure_flag() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(r#"{"total": 42.5}"#.to_string()),
            Ok(json!({ "total": { "is_valid": true, "confidence": 0.4 } }).to_string()),
        ]));
        let orchestrator = Orchestrator::new(&settings(), chat, None);

        let base64 = docx_base64("<w:p><w:r><w:t>Total: 42.50</w:t></w:r></w:p>");
        let result = orchestrator.orchestrate(&base64, "docx", &elements()).await;

        assert!(!result.success);
        assert!(result.failure.is_none(), "validation outcome is not an HTTP error");
        assert_eq!(result.extracted_data["total"], json!(42.5));
        assert!(result.errors[0].contains("below threshold"));
    }

    #[tokio::test]
    async fn unsupported_file_type_fails_before_decoding() {
        let chat = Arc::new(ScriptedChat::new(vec![]));
        let orchestrator = Orchestrator::new(&settings(), chat, None);

        let result = orchestrator.orchestrate("QUJD", "txt", &elements()).await;
        assert!(matches!(
            result.failure,
            Some(ExtractError::UnsupportedFileType { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_base64_fails_before_routing() {
        let chat = Arc::new(ScriptedChat::new(vec![]));
        let orchestrator = Orchestrator::new(&settings(), chat, None);

        let result = orchestrator
            .orchestrate("%%%not-base64%%%", "pdf", &elements())
            .await;
        assert!(matches!(result.failure, Some(ExtractError::InvalidEncoding(_))));
    }

    #[tokio::test]
    async fn required_field_missing_surfaces_as_typed_failure() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok(r#"{"total": null}"#.to_string())]));
        let orchestrator = Orchestrator::new(&settings(), chat.clone(), None);

        let base64 = docx_base64("<w:p><w:r><w:t>No totals here</w:t></w:r></w:p>");
        let result = orchestrator.orchestrate(&base64, "docx", &elements()).await;

        assert!(matches!(
            result.failure,
            Some(ExtractError::RequiredFieldMissing { .. })
        ));
        // Routing had already happened, so metadata survives the failure.
        assert_eq!(result.metadata["extraction_method"], json!("llm_text"));
        assert_eq!(chat.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn validation_backend_failure_keeps_extracted_data() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(r#"{"total": 10}"#.to_string()),
            Err(ExtractError::ChatBackend("connection reset".to_string())),
        ]));
        let orchestrator = Orchestrator::new(&settings(), chat, None);

        let base64 = docx_base64("<w:p><w:r><w:t>Total: 10</w:t></w:r></w:p>");
        let result = orchestrator.orchestrate(&base64, "docx", &elements()).await;

        assert!(!result.success);
        assert!(result.failure.is_none());
        assert_eq!(result.extracted_data["total"], json!(10));
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn image_pipeline_flags_placeholder_validation_content() {
        use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
        use base64::Engine;
        use std::io::Cursor;

        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(r#"{"total": 7}"#.to_string()),
            Ok(json!({ "total": { "is_valid": true, "confidence": 0.9 } }).to_string()),
        ]));
        let orchestrator = Orchestrator::new(&settings(), chat, None);

        let mut png = Cursor::new(Vec::new());
        image::RgbImage::new(8, 8)
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();
        let base64 = BASE64_STANDARD.encode(png.into_inner());

        let result = orchestrator.orchestrate(&base64, "png", &elements()).await;

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.metadata["extraction_method"], json!("llm_vision"));
        assert_eq!(result.metadata["validation_content_placeholder"], json!(true));
    }
}
