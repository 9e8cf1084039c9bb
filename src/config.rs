// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! OAuth client credentials are not part of the config; they are resolved on
//! demand through `SecretResolver`.

use crate::services::idempotency::{ExecutionPolicy, InFlightAction};
use crate::services::merge::DEFAULT_DURATION_TOLERANCE_SECS;
use crate::services::pipeline::PipelineSettings;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// GCP project ID
    pub gcp_project_id: String,
    /// GCP region (KMS key location)
    pub gcp_region: String,
    /// Server port
    pub port: u16,
    /// Public base URL of this service (push token audience)
    pub api_url: String,

    /// Service account Pub/Sub signs push tokens as
    pub push_service_account: String,
    /// Verify push OIDC tokens; off only for local runs
    pub push_auth_enabled: bool,

    pub artifact_bucket: String,
    pub enriched_topic: String,
    pub upload_topic: String,

    /// Deadline for each dependency call
    pub dependency_timeout: Duration,
    /// Lease held by an in-flight attempt
    pub in_flight_lease: Duration,
    pub in_flight_action: InFlightAction,
    pub max_attempts: u32,
    pub duration_tolerance_secs: u32,

    /// Overrides for destination and telemetry API base URLs
    pub strava_api_base: Option<String>,
    pub fitbit_api_base: Option<String>,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let gcp_project_id =
            env::var("GCP_PROJECT_ID").map_err(|_| ConfigError::Missing("GCP_PROJECT_ID"))?;
        let push_auth_enabled = parse_or("PUSH_AUTH_ENABLED", true)?;
        let push_service_account = match env::var("PUSH_SERVICE_ACCOUNT") {
            Ok(account) => account,
            Err(_) => format!("fitrelay-push@{}.iam.gserviceaccount.com", gcp_project_id),
        };

        Ok(Self {
            gcp_region: env::var("GCP_REGION").unwrap_or_else(|_| "us-central1".to_string()),
            port: parse_or("PORT", 8080)?,
            api_url: env::var("API_URL").map_err(|_| ConfigError::Missing("API_URL"))?,
            push_service_account,
            push_auth_enabled,
            artifact_bucket: env::var("ARTIFACT_BUCKET")
                .unwrap_or_else(|_| format!("{}-artifacts", gcp_project_id)),
            enriched_topic: env::var("ENRICHED_TOPIC")
                .unwrap_or_else(|_| "topic-enriched-activity".to_string()),
            upload_topic: env::var("UPLOAD_TOPIC")
                .unwrap_or_else(|_| "topic-job-upload".to_string()),
            dependency_timeout: Duration::from_secs(parse_or("DEPENDENCY_TIMEOUT_SECS", 30)?),
            in_flight_lease: Duration::from_secs(parse_or("IN_FLIGHT_LEASE_SECS", 300)?),
            in_flight_action: match env::var("IN_FLIGHT_ACTION").as_deref() {
                Err(_) | Ok("wait") => InFlightAction::Wait,
                Ok("skip") => InFlightAction::Skip,
                Ok(_) => return Err(ConfigError::Invalid("IN_FLIGHT_ACTION")),
            },
            max_attempts: parse_or("MAX_ATTEMPTS", 5)?,
            duration_tolerance_secs: parse_or(
                "DURATION_TOLERANCE_SECS",
                DEFAULT_DURATION_TOLERANCE_SECS,
            )?,
            strava_api_base: env::var("STRAVA_API_BASE").ok(),
            fitbit_api_base: env::var("FITBIT_API_BASE").ok(),
            gcp_project_id,
        })
    }

    /// Config for tests: no network, push auth off.
    pub fn test_default() -> Self {
        Self {
            gcp_project_id: "test-project".to_string(),
            gcp_region: "us-central1".to_string(),
            port: 8080,
            api_url: "http://localhost:8080".to_string(),
            push_service_account: "push@test-project.iam.gserviceaccount.com".to_string(),
            push_auth_enabled: false,
            artifact_bucket: "test-artifacts".to_string(),
            enriched_topic: "topic-enriched-activity".to_string(),
            upload_topic: "topic-job-upload".to_string(),
            dependency_timeout: Duration::from_secs(5),
            in_flight_lease: Duration::from_secs(300),
            in_flight_action: InFlightAction::Wait,
            max_attempts: 5,
            duration_tolerance_secs: DEFAULT_DURATION_TOLERANCE_SECS,
            strava_api_base: None,
            fitbit_api_base: None,
        }
    }

    pub fn execution_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy {
            lease: self.in_flight_lease,
            on_in_flight: self.in_flight_action,
            max_attempts: self.max_attempts,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            artifact_bucket: self.artifact_bucket.clone(),
            enriched_topic: self.enriched_topic.clone(),
            upload_topic: self.upload_topic.clone(),
            dependency_timeout: self.dependency_timeout,
            duration_tolerance_secs: self.duration_tolerance_secs,
        }
    }
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
