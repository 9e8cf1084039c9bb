// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Wearable telemetry sources used to enrich an activity.

use crate::error::{AppError, Result};
use crate::models::{MetricKind, Sample, SampleStream};
use crate::services::credentials::CredentialManager;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Deserialize;

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Source name used in merge priority and logs, e.g. `fitbit`.
    fn name(&self) -> &str;

    /// Samples recorded in `[start, start + duration_secs]`, with offsets
    /// relative to `start`.
    async fn fetch(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        duration_secs: u32,
    ) -> Result<SampleStream>;
}

// ─── Fitbit intraday heart rate ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IntradayResponse {
    #[serde(rename = "activities-heart-intraday")]
    intraday: IntradayDataset,
}

#[derive(Debug, Deserialize)]
struct IntradayDataset {
    #[serde(default)]
    dataset: Vec<IntradayPoint>,
}

#[derive(Debug, Deserialize)]
struct IntradayPoint {
    /// `HH:MM:SS`
    time: String,
    value: f64,
}

/// Fitbit intraday heart rate at 1-second resolution.
#[derive(Clone)]
pub struct FitbitHeartRate {
    http: reqwest::Client,
    credentials: CredentialManager,
    base_url: String,
}

impl FitbitHeartRate {
    pub const PROVIDER: &'static str = "fitbit";

    pub fn new(credentials: CredentialManager, base_url: Option<&str>) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            base_url: base_url
                .unwrap_or("https://api.fitbit.com")
                .trim_end_matches('/')
                .to_string(),
        }
    }

    /// Intraday URL for a window. The API only serves one day per request, so
    /// a window crossing midnight is cut at 23:59.
    // TODO: fetch the Fitbit profile timezone; the API answers in local time
    // and offsets are currently computed as if that were UTC.
    fn intraday_url(&self, start: DateTime<Utc>, duration_secs: u32) -> String {
        let end = start + Duration::seconds(i64::from(duration_secs));
        let end_label = if end.date_naive() == start.date_naive() {
            end.format("%H:%M").to_string()
        } else {
            "23:59".to_string()
        };
        format!(
            "{}/1/user/-/activities/heart/date/{}/1d/1sec/time/{}/{}.json",
            self.base_url,
            start.format("%Y-%m-%d"),
            start.format("%H:%M"),
            end_label
        )
    }

    async fn get(&self, url: &str, access_token: &str) -> Result<reqwest::Response> {
        self.http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("Fitbit request failed: {}", e)))
    }
}

/// Convert dataset points to samples relative to `start`.
fn to_samples(start: DateTime<Utc>, points: &[IntradayPoint]) -> Vec<Sample> {
    let day = start.date_naive();
    points
        .iter()
        .filter_map(|point| {
            let time = NaiveTime::parse_from_str(&point.time, "%H:%M:%S").ok()?;
            let at = day.and_time(time).and_utc();
            Some(Sample::new(
                (at - start).num_seconds(),
                MetricKind::HeartRate,
                point.value,
            ))
        })
        .collect()
}

#[async_trait]
impl TelemetrySource for FitbitHeartRate {
    fn name(&self) -> &str {
        Self::PROVIDER
    }

    async fn fetch(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        duration_secs: u32,
    ) -> Result<SampleStream> {
        let url = self.intraday_url(start, duration_secs);

        let credential = self.credentials.current(user_id, Self::PROVIDER).await?;
        let mut response = self.get(&url, &credential.access_token).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let refreshed = self
                .credentials
                .force_refresh(user_id, Self::PROVIDER, &credential)
                .await?;
            response = self.get(&url, &refreshed.access_token).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 => AppError::AuthExpired {
                    destination: Self::PROVIDER.to_string(),
                },
                429 => AppError::Transient("Fitbit rate limited".into()),
                s if s >= 500 => AppError::Transient(format!("Fitbit HTTP {}", s)),
                s => AppError::Rejected {
                    status: s,
                    details: body,
                },
            });
        }

        let parsed: IntradayResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transient(format!("Fitbit response unreadable: {}", e)))?;

        let samples = to_samples(start, &parsed.intraday.dataset);
        if samples.is_empty() {
            tracing::warn!(user_id, start = %start, "No heart rate points in Fitbit response");
        } else {
            tracing::info!(user_id, points = samples.len(), duration_secs, "Retrieved Fitbit HR");
        }

        Ok(SampleStream::new(Self::PROVIDER, samples))
    }
}
