//! Lenient parsing of structured model responses.

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ExtractError, ExtractResult};

/// Parses a JSON object out of free-form model output.
///
/// Models wrap their answers in markdown fences, commentary, doubled braces
/// or YAML-flavored quoting. The parser cuts the outermost brace span out of
/// the response, peels doubled wrappers, then tries strict JSON before
/// falling back to YAML.
pub struct StructuredResponseParser {
    /// Name used in error messages, e.g. "extraction" or "validation".
    expected_root: &'static str,
}

impl StructuredResponseParser {
    pub fn new(expected_root: &'static str) -> Self {
        Self { expected_root }
    }

    pub fn parse(&self, response: &str) -> ExtractResult<Map<String, Value>> {
        let trimmed = response.trim();

        let start = trimmed.find('{');
        let end = trimmed.rfind('}');
        let mut candidate = match (start, end) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => {
                return Err(ExtractError::InvalidExtractionResult(format!(
                    "No JSON object found in {} response",
                    self.expected_root
                )))
            }
        };

        // Some models emit {{ ... }} from literal prompt templates.
        loop {
            let inner = candidate.trim();
            if inner.len() >= 4 && inner.starts_with("{{") && inner.ends_with("}}") {
                candidate = &inner[1..inner.len() - 1];
            } else {
                break;
            }
        }

        let value = match serde_json::from_str::<Value>(candidate) {
            Ok(value) => value,
            Err(json_err) => {
                debug!(
                    root = self.expected_root,
                    error = %json_err,
                    "Strict JSON parse failed, retrying as YAML"
                );
                serde_yaml::from_str::<Value>(candidate).map_err(|yaml_err| {
                    ExtractError::InvalidExtractionResult(format!(
                        "{} response is not valid JSON ({json_err}) or YAML ({yaml_err})",
                        self.expected_root
                    ))
                })?
            }
        };

        match value {
            Value::Object(map) => Ok(map),
            other => Err(ExtractError::InvalidExtractionResult(format!(
                "parsed {} response is not an object; got {}",
                self.expected_root,
                json_type_name(&other)
            ))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
