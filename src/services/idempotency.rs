// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Execution context: at-most-once processing on top of at-least-once delivery.
//!
//! Every stage handler calls [`ExecutionContext::begin`] (or
//! [`ExecutionContext::begin_destination`]) before any side effect. The
//! execution record is created with an insert-if-absent write; later writes
//! compare-and-set on the record version. Attempts hold a lease so a
//! duplicate delivery can tell "in flight" from "crashed and abandoned".

use crate::db::{CasOutcome, PipelineStore};
use crate::error::{AppError, Result};
use crate::models::{DestinationStatus, PipelineExecution, PipelineStage};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Attempts to win a compare-and-set race before giving up for this delivery.
const MAX_CAS_RETRIES: usize = 8;

/// Deduplication key for one unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key derived from the event ID the provider assigned.
    pub fn from_provider_event(provider: &str, external_event_id: &str) -> Self {
        Self(format!(
            "evt:{}:{}",
            urlencoding::encode(provider),
            urlencoding::encode(external_event_id)
        ))
    }

    /// Key for one pipeline's processing of one activity.
    pub fn for_pipeline(activity_id: &str, pipeline_id: &str) -> Self {
        Self(format!(
            "act:{}:{}",
            urlencoding::encode(activity_id),
            urlencoding::encode(pipeline_id)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to do with a duplicate that arrives while an attempt is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightAction {
    /// Fail retryably so the bus redelivers after the current attempt settles.
    Wait,
    /// Acknowledge the duplicate without doing anything.
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// How long an attempt's lease lasts. After it lapses the record is
    /// considered abandoned and may be resumed.
    pub lease: Duration,
    pub on_in_flight: InFlightAction,
    /// Attempts before a retryable failure becomes terminal.
    pub max_attempts: u32,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            on_in_flight: InFlightAction::Wait,
            max_attempts: 5,
        }
    }
}

/// How the caller should proceed after `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Record created by this call; run from the start.
    Fresh,
    /// Earlier attempt failed or was abandoned; this call holds the lease and
    /// should continue from the last checkpoint.
    Resume,
    /// Work already finished successfully; acknowledge and do nothing.
    Completed,
    /// Another attempt holds the lease.
    InFlight,
    /// Work already failed terminally.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct Begin {
    pub is_new: bool,
    pub execution_id: String,
    pub disposition: Disposition,
    pub execution: PipelineExecution,
}

impl Begin {
    /// True when this call owns the attempt.
    pub fn should_run(&self) -> bool {
        matches!(self.disposition, Disposition::Fresh | Disposition::Resume)
    }
}

#[derive(Clone)]
pub struct ExecutionContext {
    store: Arc<dyn PipelineStore>,
    policy: ExecutionPolicy,
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(5))
}

fn lease_active(lease: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    lease.is_some_and(|until| until > now)
}

impl ExecutionContext {
    pub fn new(store: Arc<dyn PipelineStore>, policy: ExecutionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    async fn load(&self, key: &str) -> Result<PipelineExecution> {
        self.store.get_execution(key).await?.ok_or_else(|| {
            AppError::Transient(format!("execution {} missing after conflict", key))
        })
    }

    /// Claim the enrichment attempt for `seed.key`, creating the record if needed.
    pub async fn begin(&self, mut seed: PipelineExecution) -> Result<Begin> {
        let now = Utc::now();
        seed.attempt_count = 1;
        seed.lease_until = Some(lease_until(now, self.policy.lease));

        if self.store.set_execution(&seed).await? == CasOutcome::Applied {
            tracing::info!(
                key = %seed.key,
                execution_id = %seed.id,
                "Execution created"
            );
            return Ok(Begin {
                is_new: true,
                execution_id: seed.id.clone(),
                disposition: Disposition::Fresh,
                execution: seed,
            });
        }

        for _ in 0..MAX_CAS_RETRIES {
            let current = self.load(&seed.key).await?;
            let now = Utc::now();

            let disposition = if current.stage == PipelineStage::Failed {
                Disposition::Exhausted
            } else if current.enrichment_complete() || current.stage == PipelineStage::Skipped {
                Disposition::Completed
            } else if lease_active(current.lease_until, now) {
                Disposition::InFlight
            } else {
                Disposition::Resume
            };

            if disposition != Disposition::Resume {
                tracing::info!(
                    key = %current.key,
                    execution_id = %current.id,
                    stage = ?current.stage,
                    disposition = ?disposition,
                    "Duplicate delivery"
                );
                return Ok(Begin {
                    is_new: false,
                    execution_id: current.id.clone(),
                    disposition,
                    execution: current,
                });
            }

            let mut claimed = current.clone();
            claimed.attempt_count += 1;
            claimed.lease_until = Some(lease_until(now, self.policy.lease));
            claimed.updated_at = now;

            if self.store.update_execution(&claimed, current.version).await?
                == CasOutcome::Applied
            {
                claimed.version = current.version + 1;
                tracing::info!(
                    key = %claimed.key,
                    execution_id = %claimed.id,
                    attempt = claimed.attempt_count,
                    stage = ?claimed.stage,
                    "Resuming execution"
                );
                return Ok(Begin {
                    is_new: false,
                    execution_id: claimed.id.clone(),
                    disposition: Disposition::Resume,
                    execution: claimed,
                });
            }
        }

        let current = self.load(&seed.key).await?;
        Ok(Begin {
            is_new: false,
            execution_id: current.id.clone(),
            disposition: Disposition::InFlight,
            execution: current,
        })
    }

    /// Claim the upload attempt for one destination of an existing execution.
    pub async fn begin_destination(&self, key: &str, destination: &str) -> Result<Begin> {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self.store.get_execution(key).await?.ok_or_else(|| {
                AppError::Transient(format!("execution {} not yet recorded", key))
            })?;
            let now = Utc::now();

            if current.stage == PipelineStage::Received {
                return Err(AppError::Transient(format!(
                    "execution {} has not been enriched yet",
                    key
                )));
            }

            let Some(progress) = current.destinations.get(destination) else {
                return Err(AppError::Validation(format!(
                    "destination {} was not requested for this activity",
                    destination
                )));
            };

            let disposition = match &progress.status {
                DestinationStatus::Uploaded { .. } => Disposition::Completed,
                DestinationStatus::Failed { .. } => Disposition::Exhausted,
                DestinationStatus::Pending if lease_active(progress.lease_until, now) => {
                    Disposition::InFlight
                }
                DestinationStatus::Pending if current.stage.is_terminal() => {
                    Disposition::Exhausted
                }
                DestinationStatus::Pending if progress.attempt_count == 0 => Disposition::Fresh,
                DestinationStatus::Pending => Disposition::Resume,
            };

            if !matches!(disposition, Disposition::Fresh | Disposition::Resume) {
                tracing::info!(
                    key,
                    destination,
                    disposition = ?disposition,
                    "Duplicate upload delivery"
                );
                return Ok(Begin {
                    is_new: false,
                    execution_id: current.id.clone(),
                    disposition,
                    execution: current,
                });
            }

            let mut claimed = current.clone();
            if let Some(p) = claimed.destinations.get_mut(destination) {
                p.attempt_count += 1;
                p.lease_until = Some(lease_until(now, self.policy.lease));
            }
            claimed.updated_at = now;

            if self.store.update_execution(&claimed, current.version).await?
                == CasOutcome::Applied
            {
                claimed.version = current.version + 1;
                return Ok(Begin {
                    is_new: disposition == Disposition::Fresh,
                    execution_id: claimed.id.clone(),
                    disposition,
                    execution: claimed,
                });
            }
        }

        Err(AppError::Transient(format!(
            "could not claim {} for {} after repeated conflicts",
            destination, key
        )))
    }

    /// Apply `mutate` to the latest record and write it back, retrying on
    /// version conflicts. Backward stage moves are rejected.
    pub async fn checkpoint<F>(&self, key: &str, mut mutate: F) -> Result<PipelineExecution>
    where
        F: FnMut(&mut PipelineExecution) + Send,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self.load(key).await?;
            let mut next = current.clone();
            mutate(&mut next);

            if next.stage != current.stage && !current.stage.can_advance_to(next.stage) {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "illegal stage transition {:?} -> {:?} for {}",
                    current.stage,
                    next.stage,
                    key
                )));
            }
            if next == current {
                return Ok(current);
            }
            next.updated_at = Utc::now();

            if self.store.update_execution(&next, current.version).await? == CasOutcome::Applied {
                next.version = current.version + 1;
                if next.stage != current.stage {
                    tracing::info!(
                        key,
                        execution_id = %next.id,
                        from = ?current.stage,
                        to = ?next.stage,
                        "Execution stage changed"
                    );
                }
                return Ok(next);
            }
            tracing::debug!(key, "Checkpoint lost version race, retrying");
        }

        Err(AppError::Transient(format!(
            "checkpoint for {} kept conflicting",
            key
        )))
    }

    /// End the execution without uploading because an enricher filtered the
    /// activity out. Later deliveries of the same key acknowledge as complete.
    pub async fn skip(&self, key: &str, reason: &str) -> Result<PipelineExecution> {
        self.checkpoint(key, |exec| {
            if exec.stage != PipelineStage::Received {
                return;
            }
            exec.stage = PipelineStage::Skipped;
            exec.skip_reason = Some(reason.to_string());
            exec.lease_until = None;
            exec.last_error = None;
        })
        .await
    }

    /// Record a failed enrichment attempt. The lease is released so the next
    /// delivery can resume; terminal errors or exhausted attempts end in `Failed`.
    pub async fn fail(&self, key: &str, err: &AppError) -> Result<PipelineExecution> {
        let max_attempts = self.policy.max_attempts;
        let reason = err.public_reason();
        let retryable = err.is_retryable();

        let updated = self
            .checkpoint(key, |exec| {
                if exec.stage.is_terminal() {
                    return;
                }
                exec.last_error = Some(reason.clone());
                exec.lease_until = None;
                if !retryable || exec.attempt_count >= max_attempts {
                    exec.stage = PipelineStage::Failed;
                }
            })
            .await?;

        tracing::warn!(
            key,
            execution_id = %updated.id,
            attempt = updated.attempt_count,
            stage = ?updated.stage,
            error = %err,
            "Execution attempt failed"
        );
        Ok(updated)
    }

    /// Record a failed upload attempt for one destination.
    pub async fn fail_destination(
        &self,
        key: &str,
        destination: &str,
        err: &AppError,
    ) -> Result<PipelineExecution> {
        let max_attempts = self.policy.max_attempts;
        let reason = err.public_reason();
        let retryable = err.is_retryable();

        let updated = self
            .checkpoint(key, |exec| {
                if exec.stage.is_terminal() {
                    return;
                }
                if let Some(p) = exec.destinations.get_mut(destination) {
                    if p.is_terminal() {
                        return;
                    }
                    p.last_error = Some(reason.clone());
                    p.lease_until = None;
                    if !retryable || p.attempt_count >= max_attempts {
                        p.status = DestinationStatus::Failed {
                            reason: reason.clone(),
                        };
                    }
                }
                exec.last_error = Some(format!("{}: {}", destination, reason));
                if let Some(stage) = exec.settled_stage() {
                    exec.stage = stage;
                }
            })
            .await?;

        tracing::warn!(
            key,
            destination,
            execution_id = %updated.id,
            stage = ?updated.stage,
            error = %err,
            "Upload attempt failed"
        );
        Ok(updated)
    }

    /// Record a successful upload for one destination.
    pub async fn complete_destination(
        &self,
        key: &str,
        destination: &str,
        external_id: &str,
    ) -> Result<PipelineExecution> {
        self.checkpoint(key, |exec| {
            if let Some(p) = exec.destinations.get_mut(destination) {
                p.status = DestinationStatus::Uploaded {
                    external_id: external_id.to_string(),
                };
                p.lease_until = None;
                p.last_error = None;
            }
            if !exec.stage.is_terminal() {
                if let Some(stage) = exec.settled_stage() {
                    exec.stage = stage;
                }
            }
        })
        .await
    }
}
