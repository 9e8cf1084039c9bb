// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Pipeline execution record: the persisted state machine for one activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stage of a pipeline execution.
///
/// Moves forward only: `Received → Enriched → Uploaded`, and any
/// non-terminal stage may move to `Failed`. An activity dropped by an
/// enricher's filter moves from `Received` straight to `Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Received,
    Enriched,
    Uploaded,
    Failed,
    Skipped,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStage::Uploaded | PipelineStage::Failed | PipelineStage::Skipped
        )
    }

    /// Whether moving from `self` to `next` is allowed. Staying put is allowed
    /// for non-terminal stages (attempt bookkeeping).
    pub fn can_advance_to(self, next: PipelineStage) -> bool {
        use PipelineStage::*;
        match (self, next) {
            (a, b) if a == b => !a.is_terminal(),
            (Received, Enriched) | (Enriched, Uploaded) => true,
            (Received | Enriched, Failed) => true,
            (Received, Skipped) => true,
            _ => false,
        }
    }
}

/// Upload state for a single destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DestinationStatus {
    Pending,
    Uploaded { external_id: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationProgress {
    pub status: DestinationStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Held while an upload attempt is in flight
    #[serde(default)]
    pub lease_until: Option<DateTime<Utc>>,
}

impl DestinationProgress {
    pub fn pending() -> Self {
        Self {
            status: DestinationStatus::Pending,
            attempt_count: 0,
            last_error: None,
            lease_until: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, DestinationStatus::Pending)
    }
}

/// Activity details after the user's enrichers ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AppliedEnrichment {
    pub name: String,
    pub description: String,
    pub activity_type: String,
    /// Enricher names in the order they ran
    #[serde(default)]
    pub applied: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Persisted execution record, keyed by the pipeline idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Execution ID (stable for the life of the record)
    pub id: String,
    /// Idempotency key (also used as document ID)
    pub key: String,
    pub activity_id: String,
    pub pipeline_id: String,
    pub user_id: String,
    pub stage: PipelineStage,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Content-addressed artifact written by the enrichment stage
    #[serde(default)]
    pub artifact_ref: Option<String>,
    /// Enriched event has been published
    #[serde(default)]
    pub published: bool,
    /// Monthly sync counter has been incremented for this execution
    #[serde(default)]
    pub sync_counted: bool,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationProgress>,
    /// Held while the enrichment stage is in flight
    #[serde(default)]
    pub lease_until: Option<DateTime<Utc>>,
    /// Metadata produced by the user's enrichers, kept so a resumed
    /// execution republishes exactly what the first attempt computed
    #[serde(default)]
    pub enrichment: Option<AppliedEnrichment>,
    /// Why an enricher halted the pipeline, for `Skipped` executions
    #[serde(default)]
    pub skip_reason: Option<String>,
    /// Compare-and-set version, bumped on every write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineExecution {
    /// A fresh record in `Received`, created on first event receipt.
    pub fn received(
        key: impl Into<String>,
        activity_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        user_id: impl Into<String>,
        destinations: &[String],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.into(),
            activity_id: activity_id.into(),
            pipeline_id: pipeline_id.into(),
            user_id: user_id.into(),
            stage: PipelineStage::Received,
            attempt_count: 0,
            last_error: None,
            artifact_ref: None,
            published: false,
            sync_counted: false,
            destinations: destinations
                .iter()
                .map(|d| (d.clone(), DestinationProgress::pending()))
                .collect(),
            lease_until: None,
            enrichment: None,
            skip_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enrichment finished and its event is on the bus.
    pub fn enrichment_complete(&self) -> bool {
        matches!(
            self.stage,
            PipelineStage::Enriched | PipelineStage::Uploaded
        ) && self.published
    }

    /// Stage implied by destination progress once every destination is terminal.
    pub fn settled_stage(&self) -> Option<PipelineStage> {
        if self.destinations.is_empty() || !self.destinations.values().all(|d| d.is_terminal()) {
            return None;
        }
        let all_uploaded = self
            .destinations
            .values()
            .all(|d| matches!(d.status, DestinationStatus::Uploaded { .. }));
        Some(if all_uploaded {
            PipelineStage::Uploaded
        } else {
            PipelineStage::Failed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineStage::*;

    #[test]
    fn stage_transitions_only_move_forward() {
        assert!(Received.can_advance_to(Enriched));
        assert!(Enriched.can_advance_to(Uploaded));
        assert!(Received.can_advance_to(Failed));
        assert!(Enriched.can_advance_to(Failed));
        assert!(Enriched.can_advance_to(Enriched));

        assert!(!Enriched.can_advance_to(Received));
        assert!(!Received.can_advance_to(Uploaded));
        assert!(!Uploaded.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Received));
        assert!(!Uploaded.can_advance_to(Uploaded));

        assert!(Received.can_advance_to(Skipped));
        assert!(!Enriched.can_advance_to(Skipped));
        assert!(!Skipped.can_advance_to(Enriched));
        assert!(Skipped.is_terminal());
    }

    #[test]
    fn settled_stage_waits_for_every_destination() {
        let mut exec = PipelineExecution::received(
            "k",
            "a",
            "p",
            "u",
            &["strava".to_string(), "tp".to_string()],
            Utc::now(),
        );
        assert_eq!(exec.settled_stage(), None);

        exec.destinations.get_mut("strava").unwrap().status = DestinationStatus::Uploaded {
            external_id: "1".into(),
        };
        assert_eq!(exec.settled_stage(), None);

        exec.destinations.get_mut("tp").unwrap().status = DestinationStatus::Failed {
            reason: "rejected".into(),
        };
        assert_eq!(exec.settled_stage(), Some(Failed));

        exec.destinations.get_mut("tp").unwrap().status = DestinationStatus::Uploaded {
            external_id: "2".into(),
        };
        assert_eq!(exec.settled_stage(), Some(Uploaded));
    }
}
