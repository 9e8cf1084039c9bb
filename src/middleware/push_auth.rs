// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Pub/Sub push authentication middleware.

use crate::services::PushAuthError;
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Require a valid push OIDC token for `/pubsub/*` routes.
///
/// A key-fetch failure answers 500 so Pub/Sub redelivers rather than drops.
pub async fn require_push_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(verifier) = state.push_verifier.as_ref() else {
        return Ok(next.run(request).await);
    };

    let principal = verifier
        .verify(request.headers().get(header::AUTHORIZATION))
        .await
        .map_err(|err| match err {
            PushAuthError::Forbidden(reason) => {
                tracing::warn!(reason = %reason, path = %request.uri().path(), "Blocked push request");
                StatusCode::FORBIDDEN
            }
            PushAuthError::Transient(reason) => {
                tracing::error!(reason = %reason, "Push token verification unavailable");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    tracing::debug!(
        email = %principal.email,
        subject = %principal.subject,
        "Push request authenticated"
    );

    Ok(next.run(request).await)
}
