//! Field extraction stage: turns document content into structured values.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::domain::extraction::{DataElement, ExtractionPayload, ImageData};
use crate::error::{ExtractError, ExtractResult};
use crate::extraction::context::DocumentContext;
use crate::extraction::structured::StructuredResponseParser;
use crate::services::chat::{
    ChatBackend, ChatRequest, UserContent, LOW_VARIANCE_TEMPERATURE, LOW_VARIANCE_TOP_P,
};
use crate::services::ocr::OcrBackend;

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub extraction_model: String,
    /// System prompt template with an `{elements}` placeholder.
    pub prompt_template: String,
}

/// Inputs for one extraction call. Exactly one source wins, in the order
/// OCR, image, text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionRequest<'a> {
    pub text: Option<&'a str>,
    pub image: Option<&'a ImageData>,
    pub document: Option<&'a DocumentContext>,
    pub use_document_intelligence: bool,
}

enum ResolvedInput<'a> {
    Text(&'a str),
    Image(&'a ImageData),
    Ocr(&'a DocumentContext),
}

/// Runs the selected extraction strategy against the chat model.
pub struct Extractor {
    chat: Arc<dyn ChatBackend>,
    ocr: Option<Arc<dyn OcrBackend>>,
    config: ExtractorConfig,
    parser: StructuredResponseParser,
}

impl Extractor {
    pub fn new(
        chat: Arc<dyn ChatBackend>,
        ocr: Option<Arc<dyn OcrBackend>>,
        config: ExtractorConfig,
    ) -> Self {
        Self {
            chat,
            ocr,
            config,
            parser: StructuredResponseParser::new("extraction"),
        }
    }

    #[instrument(skip_all, fields(elements = elements.len()))]
    pub async fn extract(
        &self,
        request: ExtractionRequest<'_>,
        elements: &[DataElement],
    ) -> ExtractResult<ExtractionPayload> {
        let input = Self::resolve_input(&request)?;

        let payload = match input {
            ResolvedInput::Text(text) => self.extract_from_text(text, elements).await?,
            ResolvedInput::Image(image) => self.extract_from_image(image, elements).await?,
            ResolvedInput::Ocr(document) => self.extract_with_ocr(document, elements).await?,
        };

        check_required_fields(&payload, elements)?;
        Ok(payload)
    }

    fn resolve_input<'a>(request: &ExtractionRequest<'a>) -> ExtractResult<ResolvedInput<'a>> {
        if request.use_document_intelligence {
            if let Some(document) = request.document {
                return Ok(ResolvedInput::Ocr(document));
            }
        }
        if let Some(image) = request.image {
            return Ok(ResolvedInput::Image(image));
        }
        if let Some(text) = request.text {
            return Ok(ResolvedInput::Text(text));
        }
        Err(ExtractError::Extraction(
            "no valid input provided for extraction".to_string(),
        ))
    }

    async fn extract_from_text(
        &self,
        text: &str,
        elements: &[DataElement],
    ) -> ExtractResult<ExtractionPayload> {
        debug!(chars = text.len(), "Text extraction");
        let response = self
            .chat
            .complete(ChatRequest {
                model: self.config.extraction_model.clone(),
                system: self.system_prompt(elements),
                user: UserContent::Text(format!(
                    "Document text:\n\n{text}\n\nExtract the requested data elements."
                )),
                temperature: LOW_VARIANCE_TEMPERATURE,
                top_p: LOW_VARIANCE_TOP_P,
            })
            .await?;

        Ok(ExtractionPayload {
            data: self.parser.parse(&response)?,
            document_content: text.to_string(),
            content_is_placeholder: false,
        })
    }

    async fn extract_from_image(
        &self,
        image: &ImageData,
        elements: &[DataElement],
    ) -> ExtractResult<ExtractionPayload> {
        debug!(media_type = %image.media_type, width = image.width, height = image.height, "Vision extraction");
        let instruction = if image.media_type == "application/pdf" {
            "Read this PDF document and extract the requested data elements."
        } else {
            "Read this document image and extract the requested data elements."
        };

        let response = self
            .chat
            .complete(ChatRequest {
                model: self.config.extraction_model.clone(),
                system: self.system_prompt(elements),
                user: UserContent::TextWithAttachment {
                    text: instruction.to_string(),
                    media_type: image.media_type.clone(),
                    base64_data: image.base64_data.clone(),
                },
                temperature: LOW_VARIANCE_TEMPERATURE,
                top_p: LOW_VARIANCE_TOP_P,
            })
            .await?;

        // Whole documents sent to vision have no meaningful dimensions,
        // so their descriptor omits them.
        let document_content = if image.media_type.starts_with("image/") {
            format!("[{} image, {}x{}]", image.media_type, image.width, image.height)
        } else {
            format!("[{} document]", image.media_type)
        };

        Ok(ExtractionPayload {
            data: self.parser.parse(&response)?,
            document_content,
            content_is_placeholder: true,
        })
    }

    async fn extract_with_ocr(
        &self,
        document: &DocumentContext,
        elements: &[DataElement],
    ) -> ExtractResult<ExtractionPayload> {
        let ocr = self.ocr.as_ref().ok_or(ExtractError::OcrNotConfigured)?;

        let pages = ocr.read(document.raw_bytes()?).await?;
        let text = pages
            .iter()
            .filter(|page| !page.lines.is_empty())
            .map(|page| format!("=== Page {} ===\n{}", page.page_number, page.lines.join("\n")))
            .collect::<Vec<_>>()
            .join("\n\n");

        if text.trim().is_empty() {
            return Err(ExtractError::Extraction(
                "OCR produced no text for this document".to_string(),
            ));
        }

        debug!(pages = pages.len(), chars = text.len(), "OCR extraction");
        self.extract_from_text(&text, elements).await
    }

    fn system_prompt(&self, elements: &[DataElement]) -> String {
        let lines = elements
            .iter()
            .map(|element| {
                let mut line =
                    format!("- {}: {} [format: {}]", element.name, element.description, element.format);
                if element.required {
                    line.push_str(" (REQUIRED)");
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.config.prompt_template.replace("{elements}", &lines)
    }
}

/// Required fields must come back present and non-null.
fn check_required_fields(
    payload: &ExtractionPayload,
    elements: &[DataElement],
) -> ExtractResult<()> {
    for element in elements.iter().filter(|e| e.required) {
        let missing = matches!(payload.data.get(&element.name), None | Some(Value::Null));
        if missing {
            return Err(ExtractError::RequiredFieldMissing {
                field_name: element.name.clone(),
                field_description: Some(element.description.clone()),
            });
        }
    }
    Ok(())
}
