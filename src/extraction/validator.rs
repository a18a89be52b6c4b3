//! Validation stage: model-scored confidence for every extracted field.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::domain::extraction::{DataElement, FieldValidationResult, ValidationResult};
use crate::error::{ExtractError, ExtractResult};
use crate::extraction::structured::StructuredResponseParser;
use crate::services::chat::{
    ChatBackend, ChatRequest, UserContent, LOW_VARIANCE_TEMPERATURE, LOW_VARIANCE_TOP_P,
};

/// Document text beyond this many characters is cut from the validation
/// prompt to bound token usage.
const MAX_CONTENT_CHARS: usize = 5000;

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub validation_model: String,
    /// Prompt template with `{elements}`, `{extracted}` and `{content}`
    /// placeholders.
    pub prompt_template: String,
    /// Required fields below this confidence fail the request.
    pub min_confidence_threshold: f64,
}

/// Scores extracted values against the source document.
pub struct Validator {
    chat: Arc<dyn ChatBackend>,
    config: ValidatorConfig,
    parser: StructuredResponseParser,
}

impl Validator {
    pub fn new(chat: Arc<dyn ChatBackend>, config: ValidatorConfig) -> Self {
        Self {
            chat,
            config,
            parser: StructuredResponseParser::new("validation"),
        }
    }

    #[instrument(skip_all, fields(elements = elements.len()))]
    pub async fn validate(
        &self,
        extracted: &Map<String, Value>,
        document_content: &str,
        elements: &[DataElement],
    ) -> ExtractResult<ValidationResult> {
        if elements.is_empty() {
            return Ok(ValidationResult {
                success: false,
                field_results: BTreeMap::new(),
                overall_confidence: 0.0,
                errors: vec!["Validation requires at least one data element".to_string()],
            });
        }

        let response = self
            .chat
            .complete(ChatRequest {
                model: self.config.validation_model.clone(),
                system: "You are a data validation assistant.".to_string(),
                user: UserContent::Text(self.build_prompt(extracted, document_content, elements)?),
                temperature: LOW_VARIANCE_TEMPERATURE,
                top_p: LOW_VARIANCE_TOP_P,
            })
            .await
            .map_err(|e| ExtractError::Validation(format!("validation call failed: {e}")))?;

        let raw = self.parser.parse(&response)?;
        let field_results = parse_field_results(&raw, extracted)?;
        Ok(self.aggregate(field_results, elements))
    }

    fn build_prompt(
        &self,
        extracted: &Map<String, Value>,
        document_content: &str,
        elements: &[DataElement],
    ) -> ExtractResult<String> {
        let content: String = document_content.chars().take(MAX_CONTENT_CHARS).collect();
        if content.len() < document_content.len() {
            debug!(
                original = document_content.len(),
                truncated = MAX_CONTENT_CHARS,
                "Truncated document content for validation"
            );
        }

        let element_lines = elements
            .iter()
            .map(|element| {
                let mut line = format!("- {}: {}", element.name, element.description);
                if element.required {
                    line.push_str(" (REQUIRED)");
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n");

        let extracted_json = serde_json::to_string_pretty(extracted)
            .map_err(|e| ExtractError::Validation(format!("unserializable extraction data: {e}")))?;

        Ok(self
            .config
            .prompt_template
            .replace("{elements}", &element_lines)
            .replace("{extracted}", &extracted_json)
            .replace("{content}", &content))
    }

    fn aggregate(
        &self,
        field_results: BTreeMap<String, FieldValidationResult>,
        elements: &[DataElement],
    ) -> ValidationResult {
        let threshold = self.config.min_confidence_threshold;
        let mut errors = Vec::new();
        let mut scores = Vec::new();

        for element in elements {
            match field_results.get(&element.name) {
                None => {
                    if element.required {
                        errors.push(format!(
                            "Required field '{}' missing from validation results",
                            element.name
                        ));
                    }
                }
                Some(result) => {
                    scores.push(result.confidence_score);
                    if element.required {
                        if result.confidence_score < threshold {
                            errors.push(format!(
                                "Required field '{}' confidence {:.2} below threshold {:.2}",
                                element.name, result.confidence_score, threshold
                            ));
                        }
                        if !result.is_valid {
                            errors.push(format!(
                                "Required field '{}' failed validation",
                                element.name
                            ));
                        }
                    }
                }
            }
        }

        let overall_confidence = if scores.is_empty() {
            errors.push("Validation produced no confidence scores".to_string());
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        if !errors.is_empty() {
            warn!(errors = errors.len(), "Validation raised errors");
        }

        ValidationResult {
            success: errors.is_empty(),
            field_results,
            overall_confidence,
            errors,
        }
    }
}

/// One verdict per field, keyed by field name. Scores are clamped to [0, 1].
fn parse_field_results(
    raw: &Map<String, Value>,
    extracted: &Map<String, Value>,
) -> ExtractResult<BTreeMap<String, FieldValidationResult>> {
    let mut results = BTreeMap::new();
    for (name, verdict) in raw {
        let verdict = verdict.as_object().ok_or_else(|| {
            ExtractError::InvalidExtractionResult(format!(
                "validation verdict for '{name}' is not an object"
            ))
        })?;

        let confidence = verdict
            .get("confidence")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                ExtractError::InvalidExtractionResult(format!(
                    "validation verdict for '{name}' has no numeric confidence"
                ))
            })?
            .clamp(0.0, 1.0);

        results.insert(
            name.clone(),
            FieldValidationResult {
                field_name: name.clone(),
                is_valid: verdict.get("is_valid").and_then(Value::as_bool).unwrap_or(true),
                confidence_score: confidence,
                extracted_value: extracted.get(name).cloned().unwrap_or(Value::Null),
                reasoning: verdict
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
        );
    }
    Ok(results)
}
