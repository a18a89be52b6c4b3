use std::sync::Arc;

use anyhow::Result;

use docsift_backend::services::chat::{ChatBackend, FoundryChatClient};
use docsift_backend::services::credentials::{CredentialMode, TokenProvider};
use docsift_backend::{app, config, logging, services};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Arc::new(config::Settings::load()?);

    // Initialize logging
    logging::init_logging(&settings.env);

    tracing::info!(
        env = ?settings.env,
        server_addr = %settings.server_addr,
        "Starting document extraction backend"
    );

    // Credentials shared by the chat and OCR clients
    let mode = if settings.use_managed_identity {
        CredentialMode::ManagedIdentity
    } else {
        CredentialMode::Default
    };
    let tokens = Arc::new(TokenProvider::new(mode, settings.access_token.clone())?);

    // Chat client for both extraction and validation calls
    let chat_client: Arc<dyn ChatBackend> = Arc::new(FoundryChatClient::new(
        &settings.foundry_endpoint,
        Arc::clone(&tokens),
        settings.chat_timeout_seconds,
    )?);

    // OCR is optional; routing degrades to vision without it
    let ocr_client = services::build_ocr_client(&settings, &tokens)?;
    if ocr_client.is_none() {
        tracing::info!("Document Intelligence not configured, OCR routing disabled");
    }

    // Create application state
    let state = app::AppState::new(Arc::clone(&settings), chat_client, ocr_client);

    // Build application
    let router = app::create_app(Arc::clone(&state));

    // Start server
    let listener = tokio::net::TcpListener::bind(&settings.server_addr).await?;
    tracing::info!("Listening on {}", settings.server_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    state.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
