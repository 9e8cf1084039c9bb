// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Pub/Sub push endpoints, one per pipeline stage.
//!
//! Any 2xx acknowledges the message; anything else makes Pub/Sub redeliver.
//! Only retryable failures answer 500. Terminal failures and undecodable
//! messages are acknowledged so they do not loop forever.

use crate::error::{AppError, Result};
use crate::models::{EnrichedActivityEvent, EnrichmentEvent, PushEnvelope, UploadJob};
use crate::services::StageOutcome;
use crate::AppState;
use axum::{body::Bytes, extract::State, http::StatusCode, routing::post, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/pubsub/enrich", post(enrich))
        .route("/pubsub/route", post(route))
        .route("/pubsub/upload", post(upload))
}

/// Unwrap a push envelope and parse its base64 JSON payload.
fn decode_message<T: DeserializeOwned>(body: &[u8]) -> Result<(String, T)> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("invalid push envelope: {}", e)))?;
    let data = BASE64
        .decode(envelope.message.data.as_bytes())
        .map_err(|e| AppError::Validation(format!("message data is not base64: {}", e)))?;
    let payload = serde_json::from_slice(&data)
        .map_err(|e| AppError::Validation(format!("invalid message payload: {}", e)))?;
    Ok((envelope.message.message_id, payload))
}

fn ack_status(stage: &'static str, message_id: &str, result: Result<StageOutcome>) -> StatusCode {
    match result {
        Ok(outcome) => {
            tracing::info!(stage, message_id, outcome = ?outcome, "Message handled");
            StatusCode::OK
        }
        Err(e) if e.is_retryable() => {
            tracing::warn!(stage, message_id, error = %e, "Retryable failure, nacking");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(e) => {
            tracing::error!(
                stage,
                message_id,
                kind = ?e.kind(),
                error = %e,
                "Terminal failure, acknowledging"
            );
            StatusCode::OK
        }
    }
}

fn drop_malformed(stage: &'static str, err: AppError) -> StatusCode {
    tracing::error!(stage, error = %err, "Dropping malformed push message");
    StatusCode::OK
}

async fn enrich(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let (message_id, event) = match decode_message::<EnrichmentEvent>(&body) {
        Ok(decoded) => decoded,
        Err(e) => return drop_malformed("enrich", e),
    };
    ack_status(
        "enrich",
        &message_id,
        state.pipeline.handle_enrichment(&event).await,
    )
}

async fn route(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let (message_id, event) = match decode_message::<EnrichedActivityEvent>(&body) {
        Ok(decoded) => decoded,
        Err(e) => return drop_malformed("route", e),
    };
    ack_status("route", &message_id, state.pipeline.handle_routing(&event).await)
}

async fn upload(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let (message_id, job) = match decode_message::<UploadJob>(&body) {
        Ok(decoded) => decoded,
        Err(e) => return drop_malformed("upload", e),
    };
    ack_status("upload", &message_id, state.pipeline.handle_upload(&job).await)
}
