// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::claim::ClaimQueue;
use crate::error::FaucetError;
use crate::registry::SessionRegistry;
use crate::types::QueueProgress;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const HEALTH_PATH: &str = "/health";
pub const STATUS_PATH: &str = "/status";
// Using :param syntax for axum 0.7.x (not {param} which is for axum 0.8.x)
pub const SESSION_PATH: &str = "/session/:session_id";
pub const METRICS_PATH: &str = "/metrics";

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub queue: Arc<ClaimQueue>,
    pub prometheus: prometheus::Registry,
}

/// Operational snapshot served on `/status`.
#[derive(serde::Serialize)]
pub struct StatusResponse {
    /// Sum of unclaimed session balances, decimal string
    pub unclaimed_total: String,
    pub queue_length: usize,
    pub pending_claims: usize,
    pub progress: QueueProgress,
}

pub fn run_server(socket_address: &SocketAddr, state: AppState) -> tokio::task::JoinHandle<()> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(socket_address).await.unwrap();
        info!("status server listening on {}", socket_address);
        axum::serve(listener, make_router(Arc::new(state)).into_make_service())
            .await
            .unwrap();
    })
}

pub(crate) fn make_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(STATUS_PATH, get(status))
        .route(SESSION_PATH, get(session_lookup))
        .route(METRICS_PATH, get(metrics))
        .with_state(state)
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            FaucetError::InvalidAddress(_)
            | FaucetError::AmountTooLow(_)
            | FaucetError::NotClaimable(_)
            | FaucetError::InvalidState(_)
            | FaucetError::RaceClaiming(_)
            | FaucetError::ModuleRejected { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({
                "code": self.error_code(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for FaucetError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Generic(err.into().to_string())
    }
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, FaucetError> {
    let unclaimed = state.registry.get_unclaimed_total().await?;
    Ok(Json(StatusResponse {
        unclaimed_total: unclaimed.to_string(),
        queue_length: state.queue.queue_len().await,
        pending_claims: state.queue.pending_count().await,
        progress: state.queue.progress(),
    }))
}

async fn session_lookup(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> axum::response::Response {
    let Ok(session_id) = session_id.parse::<Uuid>() else {
        return FaucetError::InvalidState("invalid session id".to_string()).into_response();
    };
    match state.registry.get_record(&session_id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, FaucetError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&state.prometheus.gather(), &mut buffer)
        .map_err(|e| FaucetError::InternalError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| FaucetError::InternalError(e.to_string()))
}
