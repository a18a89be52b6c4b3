use axum::{http::HeaderValue, Router};
use std::sync::Arc;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::config::Settings;
use crate::extraction::orchestrator::Orchestrator;
use crate::middleware::request_id_layer;
use crate::routes;
use crate::services::chat::ChatBackend;
use crate::services::ocr::OcrBackend;

/// Shared application state
pub struct AppState {
    pub settings: Arc<Settings>,
    pub orchestrator: Orchestrator,
    pub chat_client: Arc<dyn ChatBackend>,
    pub ocr_client: Option<Arc<dyn OcrBackend>>,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        chat_client: Arc<dyn ChatBackend>,
        ocr_client: Option<Arc<dyn OcrBackend>>,
    ) -> Arc<Self> {
        let orchestrator = Orchestrator::new(
            &settings,
            Arc::clone(&chat_client),
            ocr_client.clone(),
        );
        Arc::new(Self {
            settings,
            orchestrator,
            chat_client,
            ocr_client,
        })
    }

    /// Release client resources during graceful shutdown.
    pub async fn shutdown(&self) {
        self.chat_client.close().await;
        if let Some(ocr) = &self.ocr_client {
            ocr.close().await;
        }
    }
}

/// Build the complete application with all middleware
pub fn create_app(state: Arc<AppState>) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(&state.settings);

    // Build trace layer (use DEBUG for spans to reduce overhead at INFO level)
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    // Request ID layers
    let (set_request_id, propagate_request_id) = request_id_layer();

    // Base64 inflates documents by ~4/3, plus JSON envelope headroom.
    let body_limit =
        RequestBodyLimitLayer::new(state.settings.max_document_size_bytes() * 3 / 2);

    // Middleware stack (applied bottom-up)
    Router::new()
        .merge(routes::api_router())
        .layer(propagate_request_id)
        .layer(trace_layer)
        .layer(set_request_id)
        .layer(body_limit)
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_allow_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    // In dev mode, use longer preflight cache to reduce OPTIONS requests
    let max_age = if settings.env.is_dev() {
        std::time::Duration::from_secs(86400)
    } else {
        std::time::Duration::from_secs(3600)
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::list([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::list([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::HeaderName::from_static("x-request-id"),
        ]))
        .max_age(max_age)
}
