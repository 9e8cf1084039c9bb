// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! fitrelay API server
//!
//! Receives Pub/Sub push deliveries for the enrichment, routing and upload
//! stages of the activity synchronization pipeline.

use fitrelay::{
    config::Config,
    db::FirestoreDb,
    services::{
        CredentialManager, FitbitHeartRate, GcsBlobStore, HttpDestinationClient, KmsService,
        OAuthRefresher, PipelineService, PubSubBus, PushVerifier, SecretManagerStore,
        SecretResolver, UploadOrchestrator,
    },
    AppState,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging for GCP
    init_logging();

    let config = Config::from_env()?;
    tracing::info!(
        port = config.port,
        project = %config.gcp_project_id,
        "Starting fitrelay"
    );

    let db = Arc::new(FirestoreDb::new(&config.gcp_project_id).await?);
    let blobs = Arc::new(GcsBlobStore::new().await?);
    let bus = Arc::new(PubSubBus::new().await?);

    let kms = KmsService::new(
        &config.gcp_project_id,
        &config.gcp_region,
        "token-encryption",
    )
    .await?;

    let secrets = SecretResolver::new(
        config.gcp_project_id.clone(),
        Arc::new(SecretManagerStore::new().await?),
    );
    let credentials = CredentialManager::new(
        db.clone(),
        kms,
        Arc::new(OAuthRefresher::new(secrets)),
    );

    let uploads = UploadOrchestrator::new(
        db.clone(),
        blobs.clone(),
        credentials.clone(),
        Arc::new(HttpDestinationClient::new(config.strava_api_base.as_deref())),
        config.dependency_timeout,
    );

    let pipeline = PipelineService::new(
        db,
        blobs,
        bus.clone(),
        uploads,
        config.execution_policy(),
        config.pipeline_settings(),
    )
    .with_telemetry_source(Arc::new(FitbitHeartRate::new(
        credentials,
        config.fitbit_api_base.as_deref(),
    )));

    let push_verifier = if config.push_auth_enabled {
        Some(Arc::new(PushVerifier::new(
            &config.api_url,
            &config.push_service_account,
        )?))
    } else {
        tracing::warn!("Push authentication disabled");
        None
    };

    let state = Arc::new(AppState {
        pipeline,
        push_verifier,
    });

    let app = fitrelay::routes::create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    bus.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM (Cloud Run sends the latter).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fitrelay=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .with(format)
        .init();
}
