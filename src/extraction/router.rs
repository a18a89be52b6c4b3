//! Document routing: analyze characteristics and pick an extraction strategy.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::domain::extraction::{DocumentType, ExtractionMethod, RoutingDecision};
use crate::error::{ExtractError, ExtractResult};
use crate::extraction::context::DocumentContext;
use crate::extraction::parser::color_mode_name;

/// First-page character count at or below which a PDF is treated as scanned.
const SCANNED_TEXT_CUTOFF: usize = 50;

/// What to do with a scanned/low-text PDF when no OCR backend is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScannedPdfPolicy {
    /// Degrade to vision extraction so the request still completes.
    #[default]
    FallbackToVision,
    /// Refuse the document with a routing error.
    Error,
}

impl ScannedPdfPolicy {
    pub fn parse(value: &str) -> ExtractResult<Self> {
        match value.trim().to_lowercase().as_str() {
            "vision" | "fallback" | "fallback_to_vision" => Ok(Self::FallbackToVision),
            "error" => Ok(Self::Error),
            other => Err(ExtractError::Configuration(format!(
                "unknown scanned PDF policy '{other}' (expected 'vision' or 'error')"
            ))),
        }
    }
}

/// Injected routing thresholds and OCR availability.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub ocr_available: bool,
    pub use_di_for_scanned: bool,
    pub use_di_for_low_text: bool,
    /// Minimum first-page character count for text-based extraction.
    pub text_density_threshold: u64,
    /// Pixel count below which an image is flagged low resolution.
    pub low_resolution_threshold: u64,
    pub scanned_pdf_policy: ScannedPdfPolicy,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ocr_available: false,
            use_di_for_scanned: true,
            use_di_for_low_text: true,
            text_density_threshold: 100,
            low_resolution_threshold: 500_000,
            scanned_pdf_policy: ScannedPdfPolicy::FallbackToVision,
        }
    }
}

/// Analyzes documents and routes them to the optimal extraction method.
pub struct DocumentRouter {
    config: RoutingConfig,
}

impl DocumentRouter {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    /// Analyze one document and decide how to extract from it.
    ///
    /// Characteristic analysis is non-fatal: on failure the decision falls
    /// back to conservative defaults and the failure is recorded under
    /// `metadata["analysis_error"]`. Method selection failures propagate.
    pub fn analyze_and_route(&self, context: &DocumentContext) -> ExtractResult<RoutingDecision> {
        let doc_type = context.doc_type();

        let mut metadata = Map::new();
        metadata.insert("doc_type".to_string(), json!(doc_type.as_str()));

        match self.analyze_document(context, doc_type) {
            Ok(analysis) => metadata.extend(analysis),
            Err(e) => {
                warn!(doc_type = %doc_type, error = %e, "Document analysis failed, routing with partial metadata");
                metadata.insert("analysis_error".to_string(), json!(e.to_string()));
            }
        }

        let (method, reasoning) = self.select_extraction_method(doc_type, &metadata)?;
        debug!(doc_type = %doc_type, method = %method, reasoning = %reasoning, "Routing decision");

        Ok(RoutingDecision {
            method,
            doc_type,
            reasoning,
            metadata,
        })
    }

    fn analyze_document(
        &self,
        context: &DocumentContext,
        doc_type: DocumentType,
    ) -> anyhow::Result<Map<String, Value>> {
        match doc_type {
            DocumentType::Pdf => self.analyze_pdf(context),
            DocumentType::Docx => Ok(Map::from_iter([
                // DOCX is always text-native, no decoding needed
                ("has_extractable_text".to_string(), json!(true)),
                ("is_structured".to_string(), json!(true)),
            ])),
            DocumentType::Png | DocumentType::Jpg | DocumentType::Jpeg => {
                self.analyze_image(context)
            }
        }
    }

    fn analyze_pdf(&self, context: &DocumentContext) -> anyhow::Result<Map<String, Value>> {
        let bytes = context.raw_bytes()?;
        let doc = lopdf::Document::load_mem(bytes)?;
        let total_pages = doc.get_pages().len();

        let mut metadata = Map::new();
        metadata.insert("total_pages".to_string(), json!(total_pages));
        if total_pages == 0 {
            return Ok(metadata);
        }

        // First page text length proxies digital-vs-scanned.
        let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)?;
        let text_density = pages.first().map(|text| text.trim().len()).unwrap_or(0);
        let has_text = text_density > SCANNED_TEXT_CUTOFF;

        metadata.insert("text_density".to_string(), json!(text_density));
        metadata.insert("has_extractable_text".to_string(), json!(has_text));
        metadata.insert("is_likely_scanned".to_string(), json!(!has_text));
        Ok(metadata)
    }

    fn analyze_image(&self, context: &DocumentContext) -> anyhow::Result<Map<String, Value>> {
        use image::GenericImageView;

        let bytes = context.raw_bytes()?;
        let img = image::load_from_memory(bytes)?;
        let (width, height) = img.dimensions();
        let total_pixels = u64::from(width) * u64::from(height);

        Ok(Map::from_iter([
            ("width".to_string(), json!(width)),
            ("height".to_string(), json!(height)),
            ("mode".to_string(), json!(color_mode_name(img.color()))),
            ("total_pixels".to_string(), json!(total_pixels)),
            (
                "is_low_resolution".to_string(),
                json!(total_pixels < self.config.low_resolution_threshold),
            ),
            ("is_image".to_string(), json!(true)),
        ]))
    }

    /// Deterministic decision table, evaluated in priority order.
    pub fn select_extraction_method(
        &self,
        doc_type: DocumentType,
        metadata: &Map<String, Value>,
    ) -> ExtractResult<(ExtractionMethod, String)> {
        match doc_type {
            DocumentType::Png | DocumentType::Jpg | DocumentType::Jpeg => Ok((
                ExtractionMethod::LlmVision,
                "Image document requires vision-capable model for extraction".to_string(),
            )),
            DocumentType::Docx => Ok((
                ExtractionMethod::LlmText,
                "DOCX document has structured extractable text".to_string(),
            )),
            DocumentType::Pdf => self.select_pdf_method(metadata),
        }
    }

    fn select_pdf_method(
        &self,
        metadata: &Map<String, Value>,
    ) -> ExtractResult<(ExtractionMethod, String)> {
        let is_scanned = metadata
            .get("is_likely_scanned")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let text_density = metadata
            .get("text_density")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let needs_ocr = (is_scanned && self.config.use_di_for_scanned)
            || (text_density < self.config.text_density_threshold && self.config.use_di_for_low_text);

        if self.config.ocr_available && needs_ocr {
            return Ok((
                ExtractionMethod::DocumentIntelligence,
                format!("Scanned/low-text PDF (density: {text_density}) requires OCR preprocessing"),
            ));
        }

        if is_scanned || text_density < self.config.text_density_threshold {
            return match self.config.scanned_pdf_policy {
                ScannedPdfPolicy::FallbackToVision => Ok((
                    ExtractionMethod::LlmVision,
                    format!(
                        "Scanned/low-text PDF (density: {text_density}) requires vision-capable model"
                    ),
                )),
                ScannedPdfPolicy::Error => Err(ExtractError::Routing(format!(
                    "scanned/low-text PDF (density: {text_density}) requires an OCR backend but none is configured"
                ))),
            };
        }

        Ok((
            ExtractionMethod::LlmText,
            format!("Digital PDF with extractable text (density: {text_density})"),
        ))
    }
}
