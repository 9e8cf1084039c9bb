// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod blob;
pub mod bus;
pub mod credentials;
pub mod destination;
pub mod encoder;
pub mod enrichers;
pub mod idempotency;
pub mod kms;
pub mod merge;
pub mod pipeline;
pub mod push_auth;
pub mod secrets;
pub mod telemetry;
pub mod tier;
pub mod upload;

pub use blob::{BlobRef, BlobStore, GcsBlobStore, MemoryBlobStore};
pub use bus::{EventBus, MemoryBus, PubSubBus};
pub use credentials::{AccessCredential, CredentialManager, OAuthRefresher, TokenGrant, TokenRefresher};
pub use destination::{DestinationClient, DestinationError, HttpDestinationClient, UploadRequest};
pub use enrichers::{Enricher, EnricherRegistry, EnrichmentOutcome, EnrichmentResult};
pub use idempotency::{ExecutionContext, ExecutionPolicy, IdempotencyKey, InFlightAction};
pub use kms::KmsService;
pub use pipeline::{PipelineService, PipelineSettings, StageOutcome};
pub use push_auth::{PushAuthError, PushPrincipal, PushVerifier};
pub use secrets::{SecretManagerStore, SecretResolver, SecretStore};
pub use telemetry::{FitbitHeartRate, TelemetrySource};
pub use upload::{UploadOrchestrator, UploadReceipt};
