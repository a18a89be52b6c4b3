//! Immutable per-request document wrapper with memoized transport decoding.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::domain::extraction::DocumentType;
use crate::error::{ExtractError, ExtractResult};

/// One document's declared type plus its base64 transport payload.
///
/// The payload is decoded at most once; the outcome (bytes or failure) is
/// cached so repeated access never re-decodes and a decode failure stays
/// terminal for the request.
#[derive(Debug)]
pub struct DocumentContext {
    doc_type: DocumentType,
    base64_data: String,
    raw_bytes: OnceLock<Result<Vec<u8>, String>>,
}

impl DocumentContext {
    pub fn new(doc_type: DocumentType, base64_data: impl Into<String>) -> Self {
        Self {
            doc_type,
            base64_data: base64_data.into(),
            raw_bytes: OnceLock::new(),
        }
    }

    pub fn doc_type(&self) -> DocumentType {
        self.doc_type
    }

    pub fn base64_data(&self) -> &str {
        &self.base64_data
    }

    /// Decoded payload, computed on first access.
    pub fn raw_bytes(&self) -> ExtractResult<&[u8]> {
        let decoded = self.raw_bytes.get_or_init(|| {
            if self.base64_data.trim().is_empty() {
                return Err("document payload is empty".to_string());
            }
            BASE64_STANDARD
                .decode(self.base64_data.trim())
                .map_err(|e| e.to_string())
        });
        match decoded {
            Ok(bytes) => Ok(bytes),
            Err(message) => Err(ExtractError::InvalidEncoding(message.clone())),
        }
    }
}
