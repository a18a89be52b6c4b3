//! Azure access token acquisition with per-scope caching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

/// Scope for Azure AI Foundry and Document Intelligence bearer tokens.
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";

/// Refresh this long before the token actually expires.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// How tokens are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// Static token, then `AZURE_ACCESS_TOKEN` env, then managed identity.
    Default,
    /// Managed identity only.
    ManagedIdentity,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    /// IMDS returns this as a decimal string.
    expires_in: String,
}

/// Resolves and caches bearer tokens per scope.
pub struct TokenProvider {
    mode: CredentialMode,
    static_token: Option<String>,
    http: Client,
    cache: Arc<RwLock<HashMap<String, CachedToken>>>,
}

impl TokenProvider {
    pub fn new(mode: CredentialMode, static_token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create credential HTTP client")?;

        Ok(Self {
            mode,
            static_token: static_token.filter(|t| !t.trim().is_empty()),
            http,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Bearer token for the given scope.
    pub async fn token(&self, scope: &str) -> Result<String> {
        if self.mode == CredentialMode::Default {
            if let Some(token) = &self.static_token {
                return Ok(token.clone());
            }
            if let Ok(token) = std::env::var("AZURE_ACCESS_TOKEN") {
                if !token.trim().is_empty() {
                    return Ok(token.trim().to_string());
                }
            }
        }

        {
            let cache = self.cache.read();
            if let Some(cached) = cache.get(scope) {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch_managed_identity_token(scope).await?;
        let expires_at = Instant::now() + expires_in.saturating_sub(EXPIRY_SKEW);
        self.cache.write().insert(
            scope.to_string(),
            CachedToken {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(token)
    }

    async fn fetch_managed_identity_token(&self, scope: &str) -> Result<(String, Duration)> {
        // IMDS takes a bare resource URI, not an OAuth scope.
        let resource = scope.trim_end_matches("/.default").trim_end_matches('/');
        let endpoint =
            std::env::var("IDENTITY_ENDPOINT").unwrap_or_else(|_| IMDS_TOKEN_URL.to_string());

        debug!(scope = scope, "Requesting managed identity token");

        let response = self
            .http
            .get(&endpoint)
            .header("Metadata", "true")
            .query(&[("api-version", IMDS_API_VERSION), ("resource", resource)])
            .send()
            .await
            .context("Managed identity endpoint unreachable")?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(status = %status, "Managed identity token request rejected");
            anyhow::bail!("managed identity token request failed with status {status}");
        }

        let body: ImdsTokenResponse = response
            .json()
            .await
            .context("Invalid managed identity token response")?;
        let expires_in: u64 = body
            .expires_in
            .parse()
            .context("Non-numeric expires_in in token response")?;

        Ok((body.access_token, Duration::from_secs(expires_in)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_token_short_circuits_in_default_mode() {
        let provider =
            TokenProvider::new(CredentialMode::Default, Some("tok-123".to_string())).unwrap();
        let token = provider.token(COGNITIVE_SERVICES_SCOPE).await.unwrap();
        assert_eq!(token, "tok-123");
    }

    #[tokio::test]
    async fn blank_static_token_is_ignored() {
        let provider = TokenProvider::new(CredentialMode::ManagedIdentity, Some("  ".to_string()))
            .unwrap();
        assert!(provider.static_token.is_none());
    }

    #[test]
    fn scope_to_resource_strips_default_suffix() {
        let resource = COGNITIVE_SERVICES_SCOPE
            .trim_end_matches("/.default")
            .trim_end_matches('/');
        assert_eq!(resource, "https://cognitiveservices.azure.com");
    }
}
