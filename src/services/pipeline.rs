// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Pipeline stage handlers.
//!
//! Each handler is stateless and safe to call again with the same message.
//! A returned error means "redeliver" only when it is retryable; terminal
//! failures are recorded on the execution record before they are returned.

use crate::db::PipelineStore;
use crate::error::{AppError, Result};
use crate::models::{
    AppliedEnrichment, ArtifactMeta, EnrichedActivityEvent, EnrichedArtifact, EnrichmentEvent,
    PipelineExecution, PipelineStage, SampleStream, UploadJob, UserRecord,
};
use crate::services::blob::{BlobRef, BlobStore};
use crate::services::bus::{publish_json, EventBus};
use crate::services::encoder;
use crate::services::enrichers::{EnricherRegistry, EnrichmentOutcome};
use crate::services::idempotency::{
    Begin, Disposition, ExecutionContext, ExecutionPolicy, IdempotencyKey, InFlightAction,
};
use crate::services::merge::{merge, MergeOptions, DEFAULT_DURATION_TOLERANCE_SECS};
use crate::services::telemetry::TelemetrySource;
use crate::services::tier::{self, GateDecision};
use crate::services::upload::UploadOrchestrator;
use crate::time_utils::within;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

/// Window used when an activity declares no duration and carries no samples.
pub const DEFAULT_ACTIVITY_DURATION_SECS: u32 = 3600;

/// Deployment settings the handlers need.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub artifact_bucket: String,
    pub enriched_topic: String,
    pub upload_topic: String,
    /// Deadline for every dependency call
    pub dependency_timeout: Duration,
    pub duration_tolerance_secs: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            artifact_bucket: "fitrelay-artifacts".to_string(),
            enriched_topic: "topic-enriched-activity".to_string(),
            upload_topic: "topic-job-upload".to_string(),
            dependency_timeout: Duration::from_secs(30),
            duration_tolerance_secs: DEFAULT_DURATION_TOLERANCE_SECS,
        }
    }
}

/// What a handler did with a message that it acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Enriched {
        execution_id: String,
        artifact_ref: String,
    },
    Routed {
        jobs: usize,
    },
    Uploaded {
        execution_id: String,
        destination: String,
        external_id: String,
        reused: bool,
    },
    /// Duplicate delivery that needed no work
    Skipped {
        execution_id: String,
        disposition: Disposition,
    },
    /// An enricher filtered the activity out; nothing is uploaded
    Filtered {
        execution_id: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct PipelineService {
    executions: ExecutionContext,
    store: Arc<dyn PipelineStore>,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn EventBus>,
    uploads: UploadOrchestrator,
    telemetry: HashMap<String, Arc<dyn TelemetrySource>>,
    enrichers: EnricherRegistry,
    settings: PipelineSettings,
}

impl PipelineService {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        blobs: Arc<dyn BlobStore>,
        bus: Arc<dyn EventBus>,
        uploads: UploadOrchestrator,
        policy: ExecutionPolicy,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            executions: ExecutionContext::new(store.clone(), policy),
            store,
            blobs,
            bus,
            uploads,
            telemetry: HashMap::new(),
            enrichers: EnricherRegistry::builtin(),
            settings,
        }
    }

    pub fn with_telemetry_source(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry.insert(source.name().to_string(), source);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Acknowledge or redeliver a duplicate that does not own the attempt.
    fn settle_duplicate(&self, begin: &Begin) -> Result<StageOutcome> {
        if begin.disposition == Disposition::InFlight
            && self.executions.policy().on_in_flight == InFlightAction::Wait
        {
            return Err(AppError::Transient(format!(
                "execution {} is in flight",
                begin.execution_id
            )));
        }
        Ok(StageOutcome::Skipped {
            execution_id: begin.execution_id.clone(),
            disposition: begin.disposition,
        })
    }

    // ─── Enrichment ──────────────────────────────────────────────────────────

    pub async fn handle_enrichment(&self, event: &EnrichmentEvent) -> Result<StageOutcome> {
        event
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let key = execution_key(event);
        let timeout = self.settings.dependency_timeout;

        let seed = PipelineExecution::received(
            key.as_str(),
            &event.activity_id,
            &event.pipeline_id,
            &event.user_id,
            &event.destinations,
            Utc::now(),
        );
        let begin = within(timeout, "begin execution", self.executions.begin(seed)).await?;
        if !begin.should_run() {
            return self.settle_duplicate(&begin);
        }

        tracing::info!(
            user_id = %event.user_id,
            activity_id = %event.activity_id,
            pipeline_id = %event.pipeline_id,
            execution_id = %begin.execution_id,
            disposition = ?begin.disposition,
            stage = ?begin.execution.stage,
            "Enrichment started"
        );

        match self.run_enrichment(event, &key, begin.execution).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                within(
                    self.settings.dependency_timeout,
                    "record failure",
                    self.executions.fail(key.as_str(), &err),
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn run_enrichment(
        &self,
        event: &EnrichmentEvent,
        key: &IdempotencyKey,
        mut execution: PipelineExecution,
    ) -> Result<StageOutcome> {
        let timeout = self.settings.dependency_timeout;

        let (artifact_ref, artifact, details) = if execution.stage == PipelineStage::Received {
            let user = self.check_tier(&event.user_id).await?;

            let details = match within(
                timeout,
                "run enrichers",
                self.enrichers.apply(event, &user),
            )
            .await?
            {
                EnrichmentOutcome::Continue(details) => details,
                EnrichmentOutcome::Halted { enricher, reason } => {
                    let execution = within(
                        timeout,
                        "record skip",
                        self.executions.skip(key.as_str(), &reason),
                    )
                    .await?;
                    tracing::info!(
                        user_id = %event.user_id,
                        activity_id = %event.activity_id,
                        execution_id = %execution.id,
                        enricher = %enricher,
                        reason = %reason,
                        "Activity filtered, not uploading"
                    );
                    return Ok(StageOutcome::Filtered {
                        execution_id: execution.id,
                        reason,
                    });
                }
            };

            let bytes = self.build_artifact(event).await?;
            let summary = summarize(&bytes)?;
            let blob = BlobRef::for_artifact(
                &self.settings.artifact_bucket,
                &event.user_id,
                &summary.checksum,
            );
            within(timeout, "write artifact", self.blobs.write(&blob, bytes)).await?;

            let artifact_ref = blob.to_string();
            let stored_ref = artifact_ref.clone();
            let stored_details = details.clone();
            execution = within(
                timeout,
                "checkpoint enriched",
                self.executions.checkpoint(key.as_str(), move |exec| {
                    exec.stage = PipelineStage::Enriched;
                    exec.artifact_ref = Some(stored_ref.clone());
                    exec.enrichment = Some(stored_details.clone());
                }),
            )
            .await?;
            (artifact_ref, summary, details)
        } else {
            // Resuming after the artifact was stored: re-read it for the event.
            let artifact_ref = execution.artifact_ref.clone().ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "enriched execution {} has no artifact",
                    execution.id
                ))
            })?;
            let blob = BlobRef::parse(&artifact_ref)?;
            let bytes = within(timeout, "read artifact", self.blobs.read(&blob)).await?;
            let details = execution
                .enrichment
                .clone()
                .unwrap_or_else(|| unenriched(event));
            (artifact_ref, summarize(&bytes)?, details)
        };

        if !execution.sync_counted {
            let count = within(
                timeout,
                "increment sync count",
                self.store.increment_sync_count(&event.user_id, Utc::now()),
            )
            .await?;
            execution = within(
                timeout,
                "checkpoint sync count",
                self.executions
                    .checkpoint(key.as_str(), |exec| exec.sync_counted = true),
            )
            .await?;
            tracing::debug!(user_id = %event.user_id, count, "Sync counted");
        }

        let enriched = EnrichedActivityEvent {
            activity_id: event.activity_id.clone(),
            pipeline_id: event.pipeline_id.clone(),
            pipeline_execution_id: execution.id.clone(),
            execution_key: key.to_string(),
            user_id: event.user_id.clone(),
            artifact_ref: artifact_ref.clone(),
            artifact,
            destinations: event.destinations.clone(),
            name: details.name,
            description: details.description,
            activity_type: details.activity_type,
            source: event.source.clone(),
            start_time: event.start_time,
            applied_enrichments: details.applied,
            enrichment_metadata: details.metadata,
        };
        let message_id = within(
            timeout,
            "publish enriched event",
            publish_json(self.bus.as_ref(), &self.settings.enriched_topic, &enriched),
        )
        .await?;

        let execution = within(
            timeout,
            "checkpoint published",
            self.executions.checkpoint(key.as_str(), |exec| {
                exec.published = true;
                exec.lease_until = None;
                exec.last_error = None;
            }),
        )
        .await?;

        tracing::info!(
            user_id = %event.user_id,
            activity_id = %event.activity_id,
            execution_id = %execution.id,
            artifact_ref = %artifact_ref,
            message_id = %message_id,
            "Enrichment complete"
        );

        Ok(StageOutcome::Enriched {
            execution_id: execution.id,
            artifact_ref,
        })
    }

    async fn check_tier(&self, user_id: &str) -> Result<UserRecord> {
        let user = within(
            self.settings.dependency_timeout,
            "load user",
            self.store.get_user(user_id),
        )
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;

        match tier::can_sync(&user, Utc::now()) {
            GateDecision::Allowed => Ok(user),
            GateDecision::Denied(reason) => {
                tracing::info!(user_id, reason = %reason, "Sync denied by tier gate");
                Err(AppError::QuotaExceeded(reason))
            }
        }
    }

    /// Gather streams, merge them over the activity window and encode.
    async fn build_artifact(&self, event: &EnrichmentEvent) -> Result<Vec<u8>> {
        let duration = activity_duration(event);
        let mut streams = Vec::with_capacity(event.telemetry.len() + 1);
        let mut priority: Vec<String> = Vec::with_capacity(event.telemetry.len() + 1);

        for name in &event.telemetry {
            let Some(source) = self.telemetry.get(name) else {
                tracing::warn!(source = %name, "Unknown telemetry source requested, skipping");
                continue;
            };
            let fetched = within(
                self.settings.dependency_timeout,
                "fetch telemetry",
                source.fetch(&event.user_id, event.start_time, duration),
            )
            .await;
            match fetched {
                Ok(stream) => {
                    priority.push(name.clone());
                    streams.push(stream);
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        user_id = %event.user_id,
                        source = %name,
                        error = %e,
                        "Telemetry unavailable, continuing without it"
                    );
                }
            }
        }

        priority.push(event.source.clone());
        streams.push(SampleStream::new(&event.source, event.samples.clone()));

        let options = MergeOptions {
            source_priority: priority,
            duration_tolerance_secs: self.settings.duration_tolerance_secs,
        };
        let merged = merge(&streams, 0, i64::from(duration), &options)?;

        let meta = ArtifactMeta {
            start_time: event.start_time,
            duration_secs: merged.duration_secs,
        };
        Ok(encoder::encode(&meta, &merged)?)
    }

    // ─── Routing ─────────────────────────────────────────────────────────────

    /// Fan an enriched activity out to one upload job per destination.
    pub async fn handle_routing(&self, event: &EnrichedActivityEvent) -> Result<StageOutcome> {
        if event.destinations.is_empty() {
            return Err(AppError::Validation(
                "enriched event names no destinations".to_string(),
            ));
        }

        for destination in &event.destinations {
            let job = UploadJob::for_destination(event, destination);
            within(
                self.settings.dependency_timeout,
                "publish upload job",
                publish_json(self.bus.as_ref(), &self.settings.upload_topic, &job),
            )
            .await?;
            tracing::debug!(
                activity_id = %event.activity_id,
                destination = %destination,
                "Upload job published"
            );
        }

        Ok(StageOutcome::Routed {
            jobs: event.destinations.len(),
        })
    }

    // ─── Upload ──────────────────────────────────────────────────────────────

    pub async fn handle_upload(&self, job: &UploadJob) -> Result<StageOutcome> {
        let key = job.execution_key.as_str();
        let destination = job.destination.as_str();

        let begin = within(
            self.settings.dependency_timeout,
            "claim destination",
            self.executions.begin_destination(key, destination),
        )
        .await?;
        if !begin.should_run() {
            return self.settle_duplicate(&begin);
        }

        let resumed = begin.disposition == Disposition::Resume;
        tracing::info!(
            user_id = %job.user_id,
            activity_id = %job.activity_id,
            destination,
            execution_id = %begin.execution_id,
            resumed,
            "Upload started"
        );

        match self.uploads.upload(job, &begin.execution_id, resumed).await {
            Ok(receipt) => {
                let execution = within(
                    self.settings.dependency_timeout,
                    "complete destination",
                    self.executions.complete_destination(
                        key,
                        destination,
                        &receipt.external_id,
                    ),
                )
                .await?;
                tracing::info!(
                    activity_id = %job.activity_id,
                    destination,
                    external_id = %receipt.external_id,
                    stage = ?execution.stage,
                    "Upload complete"
                );
                Ok(StageOutcome::Uploaded {
                    execution_id: execution.id,
                    destination: receipt.destination,
                    external_id: receipt.external_id,
                    reused: receipt.reused,
                })
            }
            Err(err) => {
                within(
                    self.settings.dependency_timeout,
                    "record destination failure",
                    self.executions
                        .fail_destination(key, destination, &err),
                )
                .await?;
                Err(err)
            }
        }
    }
}

/// Execution key for an enrichment event: the provider's event ID when it
/// sent one, else the activity and pipeline.
pub fn execution_key(event: &EnrichmentEvent) -> IdempotencyKey {
    match event.external_event_id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => IdempotencyKey::from_provider_event(&event.source, id),
        None => IdempotencyKey::for_pipeline(&event.activity_id, &event.pipeline_id),
    }
}

/// Activity details as received, for executions recorded before enrichers ran.
fn unenriched(event: &EnrichmentEvent) -> AppliedEnrichment {
    AppliedEnrichment {
        name: event.name.clone(),
        description: event.description.clone(),
        activity_type: event.activity_type.clone(),
        ..AppliedEnrichment::default()
    }
}

/// Declared duration, else the last provider sample, else the default window.
fn activity_duration(event: &EnrichmentEvent) -> u32 {
    if let Some(declared) = event.duration_secs {
        return declared;
    }
    event
        .samples
        .iter()
        .map(|s| s.offset_secs)
        .max()
        .and_then(|last| u32::try_from(last).ok())
        .filter(|last| *last > 0)
        .unwrap_or(DEFAULT_ACTIVITY_DURATION_SECS)
}

/// Decode (verifying the checksum) and describe an encoded artifact.
fn summarize(bytes: &[u8]) -> Result<EnrichedArtifact> {
    let (meta, stream) = encoder::decode(bytes)?;
    Ok(EnrichedArtifact {
        start_time: meta.start_time,
        duration_secs: meta.duration_secs,
        sample_count: u32::try_from(stream.len()).unwrap_or(u32::MAX),
        checksum: encoder::content_hash(bytes),
    })
}
