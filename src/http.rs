//! HTTP front-end: `POST /send` runs one delivery, `GET /health` answers `ok`.
//!
//! Each request is served on its own task by axum. The response body is a
//! short human-readable message; details stay in the logs and job log.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::FailureKind;
use crate::pipeline::DeliveryPipeline;

/// Body of `POST /send`.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    /// Access token.
    #[serde(default)]
    pub api_key: String,
    /// Source URL.
    #[serde(default)]
    pub file_url: String,
}

/// Build the router.
pub fn router(pipeline: Arc<DeliveryPipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/send", post(send))
        .with_state(pipeline)
}

/// Bind the listen address. Done before any task is spawned so a bad
/// address or a port in use fails startup.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn bind(listen: &str) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(listen, "http service listening");
    Ok(listener)
}

/// Serve on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    pipeline: Arc<DeliveryPipeline>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server error")?;

    info!("http service stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn send(
    State(pipeline): State<Arc<DeliveryPipeline>>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> (StatusCode, String) {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection.body_text(), "rejected /send body");
            return (StatusCode::BAD_REQUEST, "bad json".to_owned());
        }
    };
    if request.api_key.trim().is_empty() || request.file_url.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "api_key and file_url are required".to_owned(),
        );
    }

    match pipeline
        .deliver(request.api_key.trim(), request.file_url.trim())
        .await
    {
        Ok(receipt) => (
            StatusCode::OK,
            format!("sent {} ({} bytes)", receipt.filename, receipt.size),
        ),
        Err(e) => (status_for(e.kind()), e.user_message()),
    }
}

/// HTTP status for a failure kind.
pub fn status_for(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::Authorization => StatusCode::UNAUTHORIZED,
        FailureKind::SizeLimit => StatusCode::PAYLOAD_TOO_LARGE,
        FailureKind::TransientRemote | FailureKind::Delivery => StatusCode::BAD_GATEWAY,
        FailureKind::NotFound => StatusCode::NOT_FOUND,
        FailureKind::AlreadyProcessed | FailureKind::Conflict => StatusCode::CONFLICT,
        FailureKind::InternalInconsistency | FailureKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
