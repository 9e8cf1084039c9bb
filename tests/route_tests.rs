// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Push endpoint tests: ack/nack mapping and OIDC authentication.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use fitrelay::services::PushVerifier;
use fitrelay::AppState;
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower::ServiceExt;

mod common;
use common::{enrichment_event, Harness};

const PRIVATE_KEY: &[u8] = include_bytes!("fixtures/push_signing_key.pem");
const PUBLIC_KEY: &[u8] = include_bytes!("fixtures/push_signing_key.pub.pem");
const KID: &str = "test-key-1";

fn push_body<T: Serialize>(payload: &T) -> Body {
    let data = BASE64.encode(serde_json::to_vec(payload).unwrap());
    Body::from(
        serde_json::to_vec(&serde_json::json!({
            "message": {"data": data, "messageId": "m-1", "attributes": {}},
            "subscription": "projects/test-project/subscriptions/enrich"
        }))
        .unwrap(),
    )
}

fn post(path: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap()
}

#[derive(Serialize)]
struct PushClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    sub: &'a str,
    email: &'a str,
    email_verified: bool,
    iat: u64,
    exp: u64,
}

fn signed_token(audience: &str, email: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    encode(
        &header,
        &PushClaims {
            iss: "https://accounts.google.com",
            aud: audience,
            sub: "1234567890",
            email,
            email_verified: true,
            iat: now,
            exp: now + 3600,
        },
        &EncodingKey::from_rsa_pem(PRIVATE_KEY).unwrap(),
    )
    .unwrap()
}

/// Router over `h` with push authentication enforced.
fn authenticated_app(h: &Harness) -> axum::Router {
    let verifier = PushVerifier::with_static_key(
        &h.config.api_url,
        &h.config.push_service_account,
        KID,
        DecodingKey::from_rsa_pem(PUBLIC_KEY).unwrap(),
    )
    .unwrap();
    let state = Arc::new(AppState {
        pipeline: h.pipeline.clone(),
        push_verifier: Some(Arc::new(verifier)),
    });
    fitrelay::routes::create_router(state)
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = Harness::new();
    let (app, _) = h.app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_enrich_push_is_acknowledged() {
    let h = Harness::new();
    h.seed_user("user-1", "strava").await;
    let (app, _) = h.app();

    let event = enrichment_event("user-1", "act-1", &["strava"]);
    let response = app
        .oneshot(post("/pubsub/enrich", push_body(&event)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.bus.messages_on(&h.config.enriched_topic).await.len(), 1);
}

#[tokio::test]
async fn test_malformed_push_is_dropped() {
    let h = Harness::new();
    let (app, _) = h.app();

    for body in [
        Body::from("not json"),
        Body::from(r#"{"message": {"data": "%%%", "messageId": "m"}}"#),
        push_body(&serde_json::json!({"unexpected": true})),
    ] {
        let response = app
            .clone()
            .oneshot(post("/pubsub/enrich", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(h.store.execution_count(), 0);
}

#[tokio::test]
async fn test_terminal_failure_is_acknowledged() {
    let h = Harness::new();
    let (app, _) = h.app();

    // No user record: NotFound is terminal.
    let event = enrichment_event("ghost", "act-1", &["strava"]);
    let response = app
        .oneshot(post("/pubsub/enrich", push_body(&event)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_retryable_failure_is_nacked() {
    let h = Harness::new();
    let (app, _) = h.app();

    // Upload job for an execution that has not been recorded yet.
    let job = serde_json::json!({
        "executionKey": "act:act-1:pipe-1",
        "userId": "user-1",
        "blobRef": "gs://test-artifacts/artifacts/user-1/abc.frly",
        "activityId": "act-1",
        "pipelineId": "pipe-1",
        "destination": "strava",
        "startTime": "2026-05-01T10:00:00Z"
    });
    let response = app
        .oneshot(post("/pubsub/upload", push_body(&job)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_push_without_token_is_forbidden() {
    let h = Harness::new();
    let app = authenticated_app(&h);

    let event = enrichment_event("user-1", "act-1", &["strava"]);
    let response = app
        .oneshot(post("/pubsub/enrich", push_body(&event)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.store.execution_count(), 0);
}

#[tokio::test]
async fn test_push_with_valid_token_is_processed() {
    let h = Harness::new();
    h.seed_user("user-1", "strava").await;
    let app = authenticated_app(&h);

    let token = signed_token(&h.config.api_url, &h.config.push_service_account);
    let event = enrichment_event("user-1", "act-1", &["strava"]);
    let mut request = post("/pubsub/enrich", push_body(&event));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token).parse().unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.store.execution_count(), 1);
}

#[tokio::test]
async fn test_push_from_other_service_account_is_forbidden() {
    let h = Harness::new();
    let app = authenticated_app(&h);

    let token = signed_token(&h.config.api_url, "someone@evil.iam.gserviceaccount.com");
    let mut request = post(
        "/pubsub/enrich",
        push_body(&enrichment_event("user-1", "act-1", &["strava"])),
    );
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token).parse().unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_push_for_other_audience_is_forbidden() {
    let h = Harness::new();
    let app = authenticated_app(&h);

    let token = signed_token(
        "https://other-service.example.com",
        &h.config.push_service_account,
    );
    let mut request = post(
        "/pubsub/enrich",
        push_body(&enrichment_event("user-1", "act-1", &["strava"])),
    );
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token).parse().unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health_is_not_behind_push_auth() {
    let h = Harness::new();
    let app = authenticated_app(&h);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
