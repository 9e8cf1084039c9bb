// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Destination API client.
//!
//! Uploads are bearer-authenticated multipart POSTs. Status handling:
//! - 401: credential rejected (caller refreshes once)
//! - 429: rate limited, retried through redelivery
//! - other 4xx: rejected, not retried
//! - 5xx and network errors: unavailable, retried

use crate::error::AppError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::collections::HashMap;

/// One activity upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Stable ID the destination can use to recognise a repeated upload
    pub external_id: String,
    pub name: String,
    pub description: String,
    /// Destination display name of the activity type
    pub sport_type: String,
    pub artifact: Vec<u8>,
}

impl UploadRequest {
    /// External ID derived from the activity, identical across retries.
    pub fn external_id_for(activity_id: &str, pipeline_id: &str) -> String {
        format!("fitrelay-{}-{}", activity_id, pipeline_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    #[error("credential rejected (HTTP 401)")]
    Unauthorized,

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A success status with a body we could not interpret. The upload may
    /// have landed, so this is retried and reconciled via `find_existing`.
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl DestinationError {
    /// Classify for the pipeline. `Unauthorized` maps to `AuthExpired`; callers
    /// that still have a refresh to spend must handle it before converting.
    pub fn into_app_error(self, destination: &str) -> AppError {
        match self {
            DestinationError::Unauthorized => AppError::AuthExpired {
                destination: destination.to_string(),
            },
            DestinationError::RateLimited => {
                AppError::Transient(format!("{} rate limited", destination))
            }
            DestinationError::Rejected { status, body } => AppError::Rejected {
                status,
                details: body,
            },
            DestinationError::Unavailable(msg) | DestinationError::Unexpected(msg) => {
                AppError::Transient(format!("{}: {}", destination, msg))
            }
        }
    }
}

#[async_trait]
pub trait DestinationClient: Send + Sync {
    /// Upload and return the ID the destination assigned.
    async fn post_activity(
        &self,
        destination: &str,
        access_token: &str,
        request: &UploadRequest,
    ) -> Result<String, DestinationError>;

    /// Look up an earlier upload carrying `external_id`. Destinations without
    /// a lookup API report `None`.
    async fn find_existing(
        &self,
        _destination: &str,
        _access_token: &str,
        _external_id: &str,
    ) -> Result<Option<String>, DestinationError> {
        Ok(None)
    }
}

// ─── HTTP implementation ─────────────────────────────────────────────────────

/// Where a destination accepts uploads.
#[derive(Debug, Clone)]
pub struct DestinationEndpoint {
    pub upload_url: String,
    /// GET `{lookup_url}?external_id=...` answering 200 with an ID or 404
    pub lookup_url: Option<String>,
}

#[derive(Clone)]
pub struct HttpDestinationClient {
    http: reqwest::Client,
    endpoints: HashMap<String, DestinationEndpoint>,
}

impl HttpDestinationClient {
    /// Client with the built-in destinations. `strava_base_url` replaces
    /// `https://www.strava.com/api/v3` when set.
    pub fn new(strava_base_url: Option<&str>) -> Self {
        let strava = strava_base_url.unwrap_or("https://www.strava.com/api/v3");
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "strava".to_string(),
            DestinationEndpoint {
                upload_url: format!("{}/uploads", strava.trim_end_matches('/')),
                lookup_url: None,
            },
        );
        Self {
            http: reqwest::Client::new(),
            endpoints,
        }
    }

    pub fn with_endpoint(mut self, destination: &str, endpoint: DestinationEndpoint) -> Self {
        self.endpoints.insert(destination.to_string(), endpoint);
        self
    }

    fn endpoint(&self, destination: &str) -> Result<&DestinationEndpoint, DestinationError> {
        self.endpoints
            .get(destination)
            .ok_or_else(|| DestinationError::Rejected {
                status: 404,
                body: format!("no endpoint configured for {}", destination),
            })
    }

    /// Map a non-success status to the destination error taxonomy.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DestinationError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 => Err(DestinationError::Unauthorized),
            429 => {
                tracing::warn!("Destination rate limit hit (429)");
                Err(DestinationError::RateLimited)
            }
            s if s >= 500 => Err(DestinationError::Unavailable(format!("HTTP {}: {}", s, body))),
            s => Err(DestinationError::Rejected { status: s, body }),
        }
    }
}

/// Pull an ID out of a response field that may be a number or a string.
fn id_field(body: &Value, field: &str) -> Option<String> {
    match body.get(field)? {
        Value::Number(n) if n.as_i64() != Some(0) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Prefer the final activity ID; fall back to the upload ID.
fn external_id_from(body: &Value) -> Option<String> {
    id_field(body, "activity_id").or_else(|| id_field(body, "id"))
}

#[async_trait]
impl DestinationClient for HttpDestinationClient {
    async fn post_activity(
        &self,
        destination: &str,
        access_token: &str,
        request: &UploadRequest,
    ) -> Result<String, DestinationError> {
        let endpoint = self.endpoint(destination)?;

        let file = Part::bytes(request.artifact.clone())
            .file_name("activity.frly")
            .mime_str("application/octet-stream")
            .map_err(|e| DestinationError::Unexpected(e.to_string()))?;

        let mut form = Form::new()
            .part("file", file)
            .text("data_type", "frly")
            .text("external_id", request.external_id.clone());
        if !request.name.is_empty() {
            form = form.text("name", request.name.clone());
        }
        if !request.description.is_empty() {
            form = form.text("description", request.description.clone());
        }
        if !request.sport_type.is_empty() {
            form = form.text("sport_type", request.sport_type.clone());
        }

        let response = self
            .http
            .post(&endpoint.upload_url)
            .bearer_auth(access_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DestinationError::Unavailable(e.to_string()))?;

        let response = Self::check_status(response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| DestinationError::Unexpected(format!("JSON parse error: {}", e)))?;

        if let Some(error) = body.get("error").and_then(Value::as_str) {
            if !error.is_empty() {
                return Err(DestinationError::Rejected {
                    status: 200,
                    body: error.to_string(),
                });
            }
        }

        let id = external_id_from(&body)
            .ok_or_else(|| DestinationError::Unexpected("response carried no ID".into()))?;
        tracing::info!(destination, external_id = %id, "Destination accepted upload");
        Ok(id)
    }

    async fn find_existing(
        &self,
        destination: &str,
        access_token: &str,
        external_id: &str,
    ) -> Result<Option<String>, DestinationError> {
        let Some(lookup_url) = &self.endpoint(destination)?.lookup_url else {
            return Ok(None);
        };

        let response = self
            .http
            .get(lookup_url)
            .bearer_auth(access_token)
            .query(&[("external_id", external_id)])
            .send()
            .await
            .map_err(|e| DestinationError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| DestinationError::Unexpected(format!("JSON parse error: {}", e)))?;
        Ok(external_id_from(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn status_classes_map_to_error_kinds() {
        let cases = [
            (DestinationError::Unauthorized, ErrorKind::AuthExpired),
            (DestinationError::RateLimited, ErrorKind::TransientDependency),
            (
                DestinationError::Rejected {
                    status: 422,
                    body: "bad file".into(),
                },
                ErrorKind::Rejected,
            ),
            (
                DestinationError::Unavailable("HTTP 503".into()),
                ErrorKind::TransientDependency,
            ),
        ];
        for (err, kind) in cases {
            assert_eq!(err.into_app_error("strava").kind(), kind);
        }
    }

    #[test]
    fn external_id_prefers_activity_id() {
        let body = serde_json::json!({"id": 10, "activity_id": 42});
        assert_eq!(external_id_from(&body).as_deref(), Some("42"));

        let pending = serde_json::json!({"id": 10, "activity_id": null});
        assert_eq!(external_id_from(&pending).as_deref(), Some("10"));

        let string_ids = serde_json::json!({"id": "up-1", "activity_id": 0});
        assert_eq!(external_id_from(&string_ids).as_deref(), Some("up-1"));

        assert_eq!(external_id_from(&serde_json::json!({})), None);
    }

    #[test]
    fn external_id_is_stable() {
        assert_eq!(
            UploadRequest::external_id_for("a1", "p1"),
            UploadRequest::external_id_for("a1", "p1")
        );
    }
}
