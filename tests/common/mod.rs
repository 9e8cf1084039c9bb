// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fitrelay::config::Config;
use fitrelay::db::{FirestoreDb, MemoryStore};
use fitrelay::error::Result;
use fitrelay::models::{EnrichmentEvent, MetricKind, Sample, StoredCredential, UserRecord};
use fitrelay::routes::create_router;
use fitrelay::services::kms::encrypt_tokens;
use fitrelay::services::{
    CredentialManager, DestinationClient, DestinationError, KmsService, MemoryBlobStore,
    MemoryBus, PipelineService, TokenGrant, TokenRefresher, UploadOrchestrator, UploadRequest,
};
use fitrelay::AppState;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Write a document straight to the emulator, bypassing the store, so tests
/// can seed users and credentials the pipeline only ever reads.
#[allow(dead_code)]
pub async fn seed_doc<T>(collection: &str, id: &str, value: &T)
where
    T: serde::Serialize + for<'de> serde::Deserialize<'de> + Send + Sync,
{
    let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
        Ok(gcloud_sdk::Token {
            token_type: "Bearer".to_string(),
            token: gcloud_sdk::SecretValue::new(
                "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                    .to_string()
                    .into(),
            ),
            expiry: Utc::now() + Duration::hours(1),
        })
    });
    let client = firestore::FirestoreDb::with_options_token_source(
        firestore::FirestoreDbOptions::new("test-project".to_string()),
        gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
        gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
    )
    .await
    .expect("Failed to connect to Firestore emulator");

    let _: T = client
        .fluent()
        .update()
        .in_col(collection)
        .document_id(id)
        .object(value)
        .execute()
        .await
        .expect("Failed to seed document");
}

// ─── Fakes ───────────────────────────────────────────────────────────────────

/// A POST seen by [`ScriptedDestination`].
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub destination: String,
    pub access_token: String,
    pub external_id: String,
}

/// Destination client that replays scripted responses, then succeeds.
#[derive(Default)]
pub struct ScriptedDestination {
    script: Mutex<VecDeque<std::result::Result<String, DestinationError>>>,
    posts: Mutex<Vec<RecordedPost>>,
    /// external idempotency ID → destination ID, answered by `find_existing`
    known: Mutex<HashMap<String, String>>,
}

#[allow(dead_code)]
impl ScriptedDestination {
    pub fn push(&self, response: std::result::Result<String, DestinationError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn remember(&self, external_id: &str, id: &str) {
        self.known
            .lock()
            .unwrap()
            .insert(external_id.to_string(), id.to_string());
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DestinationClient for ScriptedDestination {
    async fn post_activity(
        &self,
        destination: &str,
        access_token: &str,
        request: &UploadRequest,
    ) -> std::result::Result<String, DestinationError> {
        let n = {
            let mut posts = self.posts.lock().unwrap();
            posts.push(RecordedPost {
                destination: destination.to_string(),
                access_token: access_token.to_string(),
                external_id: request.external_id.clone(),
            });
            posts.len()
        };
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("{}-{}", destination, n)))
    }

    async fn find_existing(
        &self,
        _destination: &str,
        _access_token: &str,
        external_id: &str,
    ) -> std::result::Result<Option<String>, DestinationError> {
        Ok(self.known.lock().unwrap().get(external_id).cloned())
    }
}

/// Refresher that mints `access-N` tokens and counts calls.
#[derive(Default)]
pub struct CountingRefresher {
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl CountingRefresher {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self, _provider: &str, _refresh_token: &str) -> Result<TokenGrant> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenGrant {
            access_token: format!("access-{}", n),
            refresh_token: format!("refresh-{}", n),
            expires_at: Utc::now() + Duration::hours(6),
        })
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

/// Pipeline wired to in-memory store, blob store, bus and destination.
#[allow(dead_code)]
pub struct Harness {
    pub config: Config,
    pub store: MemoryStore,
    pub blobs: MemoryBlobStore,
    pub bus: MemoryBus,
    pub kms: KmsService,
    pub destination: Arc<ScriptedDestination>,
    pub refresher: Arc<CountingRefresher>,
    pub pipeline: PipelineService,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::test_default())
    }

    pub fn with_config(config: Config) -> Self {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        let bus = MemoryBus::new();
        let kms = KmsService::new_mock();
        let destination = Arc::new(ScriptedDestination::default());
        let refresher = Arc::new(CountingRefresher::default());

        let credentials =
            CredentialManager::new(Arc::new(store.clone()), kms.clone(), refresher.clone());
        let uploads = UploadOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(blobs.clone()),
            credentials,
            destination.clone(),
            config.dependency_timeout,
        );
        let pipeline = PipelineService::new(
            Arc::new(store.clone()),
            Arc::new(blobs.clone()),
            Arc::new(bus.clone()),
            uploads,
            config.execution_policy(),
            config.pipeline_settings(),
        );

        Self {
            config,
            store,
            blobs,
            bus,
            kms,
            destination,
            refresher,
            pipeline,
        }
    }

    /// A free user with a valid credential for `provider`.
    pub async fn seed_user(&self, user_id: &str, provider: &str) {
        self.store.put_user(UserRecord::new_free(user_id));
        self.seed_credential(user_id, provider, Utc::now() + Duration::hours(1))
            .await;
    }

    pub async fn seed_credential(&self, user_id: &str, provider: &str, expires_at: DateTime<Utc>) {
        let (access, refresh) =
            encrypt_tokens(&self.kms, "access-0", "refresh-0", user_id, provider)
                .await
                .unwrap();
        self.store.put_credential(StoredCredential {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            access_token_encrypted: access,
            refresh_token_encrypted: refresh,
            expires_at,
            version: 1,
            refreshed_at: Utc::now(),
        });
    }

    /// Router over this harness's pipeline.
    pub fn app(&self) -> (axum::Router, Arc<AppState>) {
        let state = Arc::new(AppState {
            pipeline: self.pipeline.clone(),
            push_verifier: None,
        });
        (create_router(state.clone()), state)
    }
}

/// Enrichment event with a few heart-rate samples from the provider.
#[allow(dead_code)]
pub fn enrichment_event(user_id: &str, activity_id: &str, destinations: &[&str]) -> EnrichmentEvent {
    let mut event: EnrichmentEvent = serde_json::from_value(serde_json::json!({
        "activityId": activity_id,
        "pipelineId": "pipe-1",
        "userId": user_id,
        "name": "Leg day",
        "description": "Squats and lunges",
        "activityType": "WEIGHT_TRAINING",
        "source": "hevy",
        "startTime": "2026-05-01T10:00:00Z",
        "destinations": destinations,
        "durationSecs": 600
    }))
    .unwrap();
    event.samples = (0..=10)
        .map(|i| Sample::new(i * 60, MetricKind::HeartRate, 100.0 + i as f64))
        .collect();
    event
}
