// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Upload orchestrator: pushes one enriched artifact to one destination.
//!
//! Order of operations:
//! 1. already recorded for this destination → reuse the stored ID
//! 2. read the artifact and verify it decodes
//! 3. POST with the current credential; on 401 refresh once and retry once
//! 4. merge the destination's ID into the synchronized activity record
//!
//! The remote call happens before the local write. A crash between the two is
//! detected on the next attempt through `find_existing` when the destination
//! supports it; otherwise the upload may repeat.

use crate::db::PipelineStore;
use crate::error::{AppError, Result};
use crate::models::{ActivityType, SynchronizedActivity, UploadJob};
use crate::services::blob::{BlobRef, BlobStore};
use crate::services::credentials::{AccessCredential, CredentialManager};
use crate::services::destination::{DestinationClient, DestinationError, UploadRequest};
use crate::services::encoder;
use crate::time_utils::within;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub destination: String,
    pub external_id: String,
    /// True when no new upload was made because one was already recorded
    /// or found at the destination.
    pub reused: bool,
}

#[derive(Clone)]
pub struct UploadOrchestrator {
    store: Arc<dyn PipelineStore>,
    blobs: Arc<dyn BlobStore>,
    credentials: CredentialManager,
    client: Arc<dyn DestinationClient>,
    timeout: Duration,
}

impl UploadOrchestrator {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        blobs: Arc<dyn BlobStore>,
        credentials: CredentialManager,
        client: Arc<dyn DestinationClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            blobs,
            credentials,
            client,
            timeout,
        }
    }

    /// Upload `job`. `resumed` is true when an earlier attempt for the same
    /// destination may have reached the remote API.
    pub async fn upload(
        &self,
        job: &UploadJob,
        execution_id: &str,
        resumed: bool,
    ) -> Result<UploadReceipt> {
        let destination = job.destination.as_str();

        let existing = within(
            self.timeout,
            "load synchronized activity",
            self.store
                .get_synchronized_activity(&job.user_id, &job.activity_id),
        )
        .await?;
        if let Some(id) = existing
            .as_ref()
            .and_then(|a| a.destinations.get(destination))
        {
            tracing::info!(
                activity_id = %job.activity_id,
                destination,
                external_id = %id,
                "Destination already recorded, skipping upload"
            );
            return Ok(UploadReceipt {
                destination: destination.to_string(),
                external_id: id.clone(),
                reused: true,
            });
        }

        let blob = BlobRef::parse(&job.blob_ref)?;
        let artifact = within(self.timeout, "read artifact", self.blobs.read(&blob)).await?;
        encoder::decode(&artifact)?;

        let activity_type = ActivityType::parse(&job.activity_type);
        let request = UploadRequest {
            external_id: UploadRequest::external_id_for(&job.activity_id, &job.pipeline_id),
            name: job.name.clone(),
            description: job.description.clone(),
            sport_type: activity_type.display_name().to_string(),
            artifact,
        };

        let credential = within(
            self.timeout,
            "fetch credential",
            self.credentials.current(&job.user_id, destination),
        )
        .await?;

        let found = if resumed {
            self.find_existing(destination, &credential, &request.external_id)
                .await?
        } else {
            None
        };

        let (external_id, reused) = match found {
            Some(id) => {
                tracing::info!(
                    activity_id = %job.activity_id,
                    destination,
                    external_id = %id,
                    "Found earlier upload at destination"
                );
                (id, true)
            }
            None => (self.post(job, credential, &request).await?, false),
        };

        let record = SynchronizedActivity {
            activity_id: job.activity_id.clone(),
            user_id: job.user_id.clone(),
            title: if job.name.is_empty() {
                activity_type.display_name().to_string()
            } else {
                job.name.clone()
            },
            activity_type: activity_type.display_name().to_string(),
            source: job.source.clone(),
            start_time: job.start_time,
            synced_at: Utc::now(),
            pipeline_execution_id: execution_id.to_string(),
            destinations: BTreeMap::from([(destination.to_string(), external_id.clone())]),
        };

        within(
            self.timeout,
            "persist synchronized activity",
            self.store.set_synchronized_activity(&record),
        )
        .await
        .map_err(|e| {
            tracing::error!(
                activity_id = %job.activity_id,
                destination,
                external_id = %external_id,
                error = %e,
                "Uploaded but failed to record; will retry"
            );
            AppError::Transient(format!("persist synchronized activity: {}", e))
        })?;

        Ok(UploadReceipt {
            destination: destination.to_string(),
            external_id,
            reused,
        })
    }

    async fn find_existing(
        &self,
        destination: &str,
        credential: &AccessCredential,
        external_id: &str,
    ) -> Result<Option<String>> {
        let lookup = self
            .client
            .find_existing(destination, &credential.access_token, external_id);
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(found)) => Ok(found),
            // The POST path owns the refresh-once rule.
            Ok(Err(DestinationError::Unauthorized)) => Ok(None),
            Ok(Err(e)) => Err(e.into_app_error(destination)),
            Err(_) => Err(AppError::Transient(format!(
                "{} lookup timed out",
                destination
            ))),
        }
    }

    async fn post_once(
        &self,
        destination: &str,
        credential: &AccessCredential,
        request: &UploadRequest,
    ) -> Result<std::result::Result<String, DestinationError>> {
        let call = self
            .client
            .post_activity(destination, &credential.access_token, request);
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| AppError::Transient(format!("{} upload timed out", destination)))
    }

    /// POST, refreshing the credential at most once on 401.
    async fn post(
        &self,
        job: &UploadJob,
        credential: AccessCredential,
        request: &UploadRequest,
    ) -> Result<String> {
        let destination = job.destination.as_str();

        match self.post_once(destination, &credential, request).await? {
            Ok(id) => return Ok(id),
            Err(DestinationError::Unauthorized) => {
                tracing::info!(
                    user_id = %job.user_id,
                    destination,
                    "Destination rejected credential, refreshing once"
                );
            }
            Err(e) => return Err(e.into_app_error(destination)),
        }

        let refreshed = within(
            self.timeout,
            "refresh credential",
            self.credentials
                .force_refresh(&job.user_id, destination, &credential),
        )
        .await?;

        match self.post_once(destination, &refreshed, request).await? {
            Ok(id) => Ok(id),
            Err(e) => {
                if matches!(e, DestinationError::Unauthorized) {
                    tracing::warn!(
                        user_id = %job.user_id,
                        destination,
                        "Credential rejected after refresh"
                    );
                }
                Err(e.into_app_error(destination))
            }
        }
    }
}
