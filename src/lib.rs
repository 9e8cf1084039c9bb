// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! fitrelay: fitness activity synchronization pipeline.
//!
//! Activities arrive as events, are enriched with wearable telemetry, encoded
//! into a compact artifact, and uploaded to each requested destination. The
//! stages communicate over Pub/Sub and tolerate redelivery at every step.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use services::{PipelineService, PushVerifier};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub pipeline: PipelineService,
    /// `None` when push authentication is disabled
    pub push_verifier: Option<Arc<PushVerifier>>,
}
