//! HTTP server and API endpoints for the verification service.

use crate::{
    config::{MailTransport, StorageBackend, VerimailConfig},
    dispatch::{ConsoleDispatcher, MailDispatcher, SmtpDispatcher},
    error::{VerifyError, VerifyResult},
    notify::Notifier,
    service::{Confirmation, SubmissionReport, VerificationService},
    store::{AddressStatus, MemoryStore, SqliteStore, StoreStats, VerificationStore},
    validation::{self, DnsValidator},
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct SharedState {
    pub service: Arc<VerificationService>,
}

/// Request to start verification of an address
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub email: String,
}

/// Token presented by the verification link
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub email: String,
    pub status: AddressStatus,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub dispatch_mode: crate::config::DispatchMode,
    pub records: StoreStats,
}

/// Create the HTTP router with all endpoints
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/submit", post(submit))
        .route("/verify", get(verify_link))
        .route("/confirm", post(confirm))
        .route("/status", get(status))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Root endpoint - provides basic information
async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "verimail",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /submit": "Submit an email address for verification (provide email)",
            "GET /verify?token=": "Verification link target",
            "POST /confirm": "Confirm a verification token (provide token)",
            "GET /status?email=": "Verification status of an address",
            "GET /health": "Health check",
        }
    }))
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> VerifyResult<Json<HealthResponse>> {
    let records = state.service.stats()?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        dispatch_mode: state.service.notifier().mode(),
        records,
    }))
}

/// Submit an address: validate, issue a token, send the link
async fn submit(
    State(state): State<SharedState>,
    Json(request): Json<SubmitRequest>,
) -> VerifyResult<Json<SubmissionReport>> {
    let report = state.service.submit(&request.email).await?;
    info!("Submission result: {}", report);
    Ok(Json(report))
}

/// Target of the emailed link
async fn verify_link(
    State(state): State<SharedState>,
    Query(request): Query<ConfirmRequest>,
) -> VerifyResult<(StatusCode, Json<Confirmation>)> {
    confirm_token(&state, &request.token).await
}

async fn confirm(
    State(state): State<SharedState>,
    Json(request): Json<ConfirmRequest>,
) -> VerifyResult<(StatusCode, Json<Confirmation>)> {
    confirm_token(&state, &request.token).await
}

async fn confirm_token(state: &SharedState, token: &str) -> VerifyResult<(StatusCode, Json<Confirmation>)> {
    let confirmation = state.service.confirm(token).await?;
    let code = if confirmation.is_success() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((code, Json(confirmation)))
}

async fn status(
    State(state): State<SharedState>,
    Query(query): Query<StatusQuery>,
) -> VerifyResult<Json<StatusResponse>> {
    let status = state.service.status(&query.email)?;
    Ok(Json(StatusResponse {
        email: validation::normalize(&query.email).unwrap_or_else(|_| query.email.trim().to_string()),
        status,
    }))
}

/// Open the configured storage backend
pub fn open_store(config: &VerimailConfig) -> VerifyResult<Arc<dyn VerificationStore>> {
    let ttl = config.token_ttl();
    let store: Arc<dyn VerificationStore> = match config.storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage");
            Arc::new(MemoryStore::new(ttl))
        }
        StorageBackend::Sqlite => {
            info!("Opening SQLite storage at {}", config.storage.path);
            Arc::new(SqliteStore::open(&config.storage.path, ttl)?)
        }
    };
    Ok(store)
}

/// Build the mail dispatcher, checking the SMTP connection up front
pub async fn build_dispatcher(config: &VerimailConfig) -> VerifyResult<Arc<dyn MailDispatcher>> {
    let dispatcher: Arc<dyn MailDispatcher> = match config.mail.transport {
        MailTransport::Smtp => {
            let dispatcher = SmtpDispatcher::new(&config.smtp)?;
            info!("Testing email connection...");
            dispatcher.test_connection().await?;
            Arc::new(dispatcher)
        }
        MailTransport::Console => Arc::new(ConsoleDispatcher::new()),
    };
    Ok(dispatcher)
}

/// Wire store, validator and notifier together from configuration
pub async fn build_service(config: &VerimailConfig) -> VerifyResult<VerificationService> {
    let store = open_store(config)?;
    let validator = Arc::new(DnsValidator::new(config.verification.check_deliverability));
    let dispatcher = build_dispatcher(config).await?;

    let notifier = Notifier::new(
        config.mail.dispatch_mode,
        dispatcher,
        &config.verification.base_url,
        &config.smtp.subject,
        config.mail.queue_capacity,
    )?
    .with_token_expiry(match config.verification.token_expiry_minutes {
        0 => None,
        minutes => Some(minutes),
    });

    Ok(VerificationService::new(store, validator, notifier))
}

/// Start the HTTP server
pub async fn start_server(config: &VerimailConfig) -> VerifyResult<()> {
    info!("Starting verification server...");

    let service = Arc::new(build_service(config).await?);

    // Start cleanup task
    let cleanup = if config.token_ttl().is_some() {
        let cleanup_service = Arc::clone(&service);
        let cleanup_interval = config.verification.cleanup_interval_minutes;
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(cleanup_interval.saturating_mul(60)));

            loop {
                interval.tick().await;
                if let Err(e) = cleanup_service.purge_expired() {
                    error!("Cleanup of expired tokens failed: {}", e);
                }
            }
        }))
    } else {
        None
    };

    let app = create_router(SharedState {
        service: Arc::clone(&service),
    });

    // Bind and serve
    let bind_addr = format!("{}:{}", config.http.bind_address, config.http.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await
        .map_err(|e| VerifyError::Internal(anyhow::anyhow!("Failed to bind to {}: {}", bind_addr, e)))?;

    info!("Verification server listening on {}", bind_addr);
    info!("Endpoints:");
    info!("  GET  /         - Server information");
    info!("  GET  /health   - Health check");
    info!("  POST /submit   - Submit an address for verification");
    info!("  GET  /verify   - Verification link target");
    info!("  POST /confirm  - Confirm a token");
    info!("  GET  /status   - Address status");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| VerifyError::Internal(anyhow::anyhow!("Server error: {}", e)))?;

    if let Some(cleanup) = cleanup {
        cleanup.abort();
    }
    service.shutdown().await;
    info!("Verification server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
