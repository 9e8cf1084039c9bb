// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Messages exchanged between pipeline stages over the event bus.

use crate::models::stream::{EnrichedArtifact, Sample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use validator::Validate;

/// Raw activity published by ingestion. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentEvent {
    #[validate(length(min = 1, max = 256))]
    pub activity_id: String,
    #[validate(length(min = 1, max = 256))]
    pub pipeline_id: String,
    #[validate(length(min = 1, max = 256))]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub activity_type: String,
    /// Provider that produced the activity, e.g. `hevy`
    #[validate(length(min = 1, max = 64))]
    pub source: String,
    pub start_time: DateTime<Utc>,
    #[validate(length(min = 1, max = 16))]
    pub destinations: Vec<String>,
    /// Provider-side event ID, when the provider supplies one
    #[serde(default)]
    pub external_event_id: Option<String>,
    /// Declared duration; derived from samples when absent
    #[serde(default)]
    pub duration_secs: Option<u32>,
    /// Metrics recorded by the source provider itself
    #[serde(default)]
    pub samples: Vec<Sample>,
    /// Wearable sources to pull time-aligned telemetry from, highest priority first
    #[serde(default)]
    pub telemetry: Vec<String>,
}

/// Published by the enrichment stage once the artifact is durably stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedActivityEvent {
    pub activity_id: String,
    pub pipeline_id: String,
    pub pipeline_execution_id: String,
    /// Idempotency key of the execution record
    pub execution_key: String,
    pub user_id: String,
    pub artifact_ref: String,
    pub artifact: EnrichedArtifact,
    pub destinations: Vec<String>,
    pub name: String,
    pub description: String,
    pub activity_type: String,
    pub source: String,
    pub start_time: DateTime<Utc>,
    /// Enrichers that ran, in order
    #[serde(default)]
    pub applied_enrichments: Vec<String>,
    #[serde(default)]
    pub enrichment_metadata: BTreeMap<String, String>,
}

/// One upload to one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadJob {
    /// Idempotency key of the execution this upload belongs to
    pub execution_key: String,
    pub user_id: String,
    pub blob_ref: String,
    pub activity_id: String,
    pub pipeline_id: String,
    pub destination: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub activity_type: String,
    #[serde(default)]
    pub source: String,
    pub start_time: DateTime<Utc>,
}

impl UploadJob {
    /// Build the job for one destination of an enriched activity.
    pub fn for_destination(event: &EnrichedActivityEvent, destination: &str) -> Self {
        Self {
            execution_key: event.execution_key.clone(),
            user_id: event.user_id.clone(),
            blob_ref: event.artifact_ref.clone(),
            activity_id: event.activity_id.clone(),
            pipeline_id: event.pipeline_id.clone(),
            destination: destination.to_string(),
            name: event.name.clone(),
            description: event.description.clone(),
            activity_type: event.activity_type.clone(),
            source: event.source.clone(),
            start_time: event.start_time,
        }
    }
}

/// Pub/Sub push delivery envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Base64-encoded payload
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}
