// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod activity;
pub mod activity_type;
pub mod events;
pub mod execution;
pub mod stream;
pub mod user;

pub use activity::SynchronizedActivity;
pub use activity_type::ActivityType;
pub use events::{EnrichedActivityEvent, EnrichmentEvent, PushEnvelope, UploadJob};
pub use execution::{
    AppliedEnrichment, DestinationProgress, DestinationStatus, PipelineExecution,
    PipelineStage,
};
pub use stream::{
    ArtifactMeta, CompositeSample, EnrichedArtifact, MergedStream, MetricKind, Sample,
    SampleStream,
};
pub use user::{EnricherConfig, StoredCredential, Tier, UserRecord};
