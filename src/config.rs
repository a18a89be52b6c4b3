use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ExtractError;
use crate::extraction::router::{RoutingConfig, ScannedPdfPolicy};

pub const DEFAULT_EXTRACTION_PROMPT: &str = r#"You are a data extraction assistant. Extract the requested data elements from the provided document text.

Data elements to extract:
{elements}

Return the extracted data as a JSON object with field names as keys.
If a field cannot be found, use null as the value.
Return ONLY the JSON object, no additional text or explanation.

Example format:
{"fieldName1": "value1", "fieldName2": 123, "fieldName3": null}"#;

pub const DEFAULT_VALIDATION_PROMPT: &str = r#"You are a data validation assistant. Your task is to validate extracted data against the original document content.

For each field, assess:
1. Whether the extracted value is present in the document
2. Whether the value matches the expected format
3. How confident you are that the extraction is correct (0.0 to 1.0)

Original document content:
{content}

Data elements definition:
{elements}

Extracted data to validate:
{extracted}

Return a JSON object mapping each field name to an object with "is_valid" (boolean), "confidence" (0.0 to 1.0) and "reasoning" (brief explanation).

Guidelines:
- confidence 0.9-1.0: Value clearly present and correctly formatted
- confidence 0.7-0.9: Value present but may have minor formatting issues
- confidence 0.5-0.7: Value partially matches or inferred
- confidence 0.0-0.5: Value not found or incorrect

Return ONLY the JSON object, no additional text."#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }

    pub fn is_prod(&self) -> bool {
        matches!(self, Self::Prod)
    }
}

#[derive(Debug, Clone)]
pub struct RoutingSettings {
    pub text_density_threshold: u64,
    pub low_resolution_threshold: u64,
    pub use_di_for_scanned: bool,
    pub use_di_for_low_text: bool,
    pub scanned_pdf_policy: ScannedPdfPolicy,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            text_density_threshold: 100,
            low_resolution_threshold: 500_000,
            use_di_for_scanned: true,
            use_di_for_low_text: true,
            scanned_pdf_policy: ScannedPdfPolicy::FallbackToVision,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub server_addr: String,
    pub cors_allow_origins: Vec<String>,

    // Azure AI Foundry
    pub foundry_endpoint: String,
    pub extraction_model: String,
    pub validation_model: String,
    pub use_managed_identity: bool,
    pub access_token: Option<String>,
    pub chat_timeout_seconds: u64,

    // Azure Document Intelligence (optional)
    pub di_endpoint: Option<String>,
    pub di_key: Option<String>,
    pub di_use_managed_identity: bool,
    pub ocr_poll_interval_ms: u64,
    pub ocr_poll_max_attempts: u32,

    // Pipeline
    pub routing: RoutingSettings,
    pub min_confidence_threshold: f64,
    pub max_document_size_mb: usize,
    pub extraction_prompt: String,
    pub validation_prompt: String,
}

/// Shape of the optional config.json file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    #[serde(default, rename = "azureAIFoundry")]
    azure_ai_foundry: Option<FileFoundry>,
    #[serde(default)]
    azure_document_intelligence: Option<FileDocumentIntelligence>,
    #[serde(default)]
    routing_thresholds: Option<FileRouting>,
    #[serde(default)]
    min_confidence_threshold: Option<f64>,
    #[serde(default, rename = "maxBufferSizeMB")]
    max_buffer_size_mb: Option<usize>,
    #[serde(default)]
    prompts: Option<FilePrompts>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFoundry {
    endpoint: Option<String>,
    extraction_model: Option<String>,
    validation_model: Option<String>,
    #[serde(default)]
    use_managed_identity: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileDocumentIntelligence {
    endpoint: Option<String>,
    key: Option<String>,
    #[serde(default)]
    use_managed_identity: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRouting {
    #[serde(default)]
    use_document_intelligence: Option<FileRoutingToggles>,
    text_density_threshold: Option<u64>,
    low_resolution_threshold: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRoutingToggles {
    scanned_document: Option<bool>,
    low_text_density: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FilePrompts {
    extraction: Option<String>,
    validation: Option<String>,
}

impl Settings {
    /// Load settings from the optional config file, then apply environment
    /// overrides. Environment always wins.
    pub fn load() -> Result<Self> {
        let path = env::var("CONFIG_FILE").unwrap_or_else(|_| "config.json".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let file_config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        } else {
            FileConfig::default()
        };

        let mut settings = Self::from_file_config(file_config);
        settings.apply_secret_files();
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Mounted secret files (one value per file, named after the setting)
    /// sit between the config file and environment overrides.
    fn apply_secret_files(&mut self) {
        let Ok(dir) = env::var("SECRETS_DIR") else {
            return;
        };
        if let Some(token) = read_secret(&dir, "AZURE_ACCESS_TOKEN") {
            self.access_token = Some(token);
        }
        if let Some(key) = read_secret(&dir, "AZURE_DOCUMENT_INTELLIGENCE_KEY") {
            self.di_key = Some(key);
        }
    }

    fn from_file_config(file: FileConfig) -> Self {
        let foundry = file.azure_ai_foundry.unwrap_or(FileFoundry {
            endpoint: None,
            extraction_model: None,
            validation_model: None,
            use_managed_identity: None,
        });
        let di = file.azure_document_intelligence;
        let routing_file = file.routing_thresholds;
        let prompts = file.prompts;

        let mut routing = RoutingSettings::default();
        if let Some(r) = &routing_file {
            if let Some(v) = r.text_density_threshold {
                routing.text_density_threshold = v;
            }
            if let Some(v) = r.low_resolution_threshold {
                routing.low_resolution_threshold = v;
            }
            if let Some(toggles) = &r.use_document_intelligence {
                if let Some(v) = toggles.scanned_document {
                    routing.use_di_for_scanned = v;
                }
                if let Some(v) = toggles.low_text_density {
                    routing.use_di_for_low_text = v;
                }
            }
        }

        Self {
            env: Environment::Dev,
            server_addr: "0.0.0.0:8080".to_string(),
            cors_allow_origins: vec!["http://localhost:3000".to_string()],
            foundry_endpoint: foundry.endpoint.unwrap_or_default(),
            extraction_model: foundry.extraction_model.unwrap_or_default(),
            validation_model: foundry
                .validation_model
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            use_managed_identity: foundry.use_managed_identity.unwrap_or(false),
            access_token: None,
            chat_timeout_seconds: 120,
            di_endpoint: di.as_ref().and_then(|d| d.endpoint.clone()),
            di_key: di.as_ref().and_then(|d| d.key.clone()),
            di_use_managed_identity: di
                .as_ref()
                .and_then(|d| d.use_managed_identity)
                .unwrap_or(false),
            ocr_poll_interval_ms: 1000,
            ocr_poll_max_attempts: 60,
            routing,
            min_confidence_threshold: file.min_confidence_threshold.unwrap_or(0.8),
            max_document_size_mb: file.max_buffer_size_mb.unwrap_or(10),
            extraction_prompt: prompts
                .as_ref()
                .and_then(|p| p.extraction.clone())
                .unwrap_or_else(|| DEFAULT_EXTRACTION_PROMPT.to_string()),
            validation_prompt: prompts
                .as_ref()
                .and_then(|p| p.validation.clone())
                .unwrap_or_else(|| DEFAULT_VALIDATION_PROMPT.to_string()),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = env::var("ENV") {
            self.env = Environment::from_str(&v);
        }
        if let Ok(v) = env::var("SERVER_ADDR") {
            self.server_addr = v;
        }
        if let Ok(v) = env::var("CORS_ALLOW_ORIGINS") {
            self.cors_allow_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("AZURE_AI_FOUNDRY_ENDPOINT") {
            self.foundry_endpoint = v;
        }
        if let Ok(v) = env::var("AZURE_EXTRACTION_MODEL") {
            self.extraction_model = v;
        }
        if let Ok(v) = env::var("AZURE_VALIDATION_MODEL") {
            self.validation_model = v;
        }
        if let Ok(v) = env::var("AZURE_USE_MANAGED_IDENTITY") {
            self.use_managed_identity = parse_bool("AZURE_USE_MANAGED_IDENTITY", &v)?;
        }
        if let Ok(v) = env::var("AZURE_ACCESS_TOKEN") {
            if !v.trim().is_empty() {
                self.access_token = Some(v);
            }
        }
        if let Ok(v) = env::var("AZURE_DOCUMENT_INTELLIGENCE_ENDPOINT") {
            self.di_endpoint = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Ok(v) = env::var("AZURE_DOCUMENT_INTELLIGENCE_KEY") {
            self.di_key = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Ok(v) = env::var("AZURE_DOCUMENT_INTELLIGENCE_USE_MANAGED_IDENTITY") {
            self.di_use_managed_identity =
                parse_bool("AZURE_DOCUMENT_INTELLIGENCE_USE_MANAGED_IDENTITY", &v)?;
        }
        if let Ok(v) = env::var("MIN_CONFIDENCE_THRESHOLD") {
            self.min_confidence_threshold = v
                .parse()
                .context("MIN_CONFIDENCE_THRESHOLD must be a number")?;
        }
        if let Ok(v) = env::var("MAX_DOCUMENT_SIZE_MB") {
            self.max_document_size_mb =
                v.parse().context("MAX_DOCUMENT_SIZE_MB must be an integer")?;
        }
        if let Ok(v) = env::var("CHAT_TIMEOUT_SECONDS") {
            self.chat_timeout_seconds =
                v.parse().context("CHAT_TIMEOUT_SECONDS must be an integer")?;
        }
        if let Ok(v) = env::var("SCANNED_PDF_POLICY") {
            self.routing.scanned_pdf_policy =
                ScannedPdfPolicy::parse(&v).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        if let Ok(v) = env::var("EXTRACTION_PROMPT") {
            self.extraction_prompt = v;
        }
        if let Ok(v) = env::var("VALIDATION_PROMPT") {
            self.validation_prompt = v;
        }
        Ok(())
    }

    /// Collect every problem at once instead of failing field by field.
    fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.foundry_endpoint.trim().is_empty() {
            problems.push("AZURE_AI_FOUNDRY_ENDPOINT is not set".to_string());
        }
        if self.extraction_model.trim().is_empty() {
            problems.push("AZURE_EXTRACTION_MODEL is not set".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_confidence_threshold) {
            problems.push(format!(
                "MIN_CONFIDENCE_THRESHOLD {} is outside [0, 1]",
                self.min_confidence_threshold
            ));
        }
        if self.max_document_size_mb == 0 || self.max_document_size_mb > 100 {
            problems.push(format!(
                "MAX_DOCUMENT_SIZE_MB {} is outside (0, 100]",
                self.max_document_size_mb
            ));
        }
        if self.di_endpoint.is_some()
            && self.di_key.is_none()
            && !self.di_use_managed_identity
        {
            problems.push(
                "Document Intelligence endpoint is set without a key or managed identity"
                    .to_string(),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ExtractError::Configuration(problems.join("; ")).into())
        }
    }

    pub fn ocr_available(&self) -> bool {
        self.di_endpoint.is_some() && (self.di_key.is_some() || self.di_use_managed_identity)
    }

    pub fn routing_config(&self) -> RoutingConfig {
        RoutingConfig {
            ocr_available: self.ocr_available(),
            use_di_for_scanned: self.routing.use_di_for_scanned,
            use_di_for_low_text: self.routing.use_di_for_low_text,
            text_density_threshold: self.routing.text_density_threshold,
            low_resolution_threshold: self.routing.low_resolution_threshold,
            scanned_pdf_policy: self.routing.scanned_pdf_policy,
        }
    }

    pub fn max_document_size_bytes(&self) -> usize {
        self.max_document_size_mb * 1024 * 1024
    }
}

fn read_secret(dir: &str, name: &str) -> Option<String> {
    let value = std::fs::read_to_string(Path::new(dir).join(name)).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{name} has non-boolean value '{other}'"),
    }
}

/// Baseline defaults, before any config file or environment overrides.
/// These do not pass `validate()` on their own since no endpoint is set.
impl Default for Settings {
    fn default() -> Self {
        Self::from_file_config(FileConfig::default())
    }
}
