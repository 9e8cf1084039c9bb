// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper implementing [`PipelineStore`].
//!
//! Provides typed operations for:
//! - Executions (pipeline state machine, compare-and-set by version)
//! - Users (tier and monthly sync counter)
//! - Synchronized activities (destination → external ID map)
//! - Credentials (encrypted, versioned OAuth tokens)

use crate::db::{apply_sync_increment, collections, CasOutcome, PipelineStore};
use crate::error::{AppError, Result};
use crate::models::{PipelineExecution, StoredCredential, SynchronizedActivity, UserRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use firestore::errors::FirestoreError;
use firestore::{FirestoreConsistencySelector, FirestoreTransaction};

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

fn db_err(context: &str, e: FirestoreError) -> AppError {
    AppError::Transient(format!("{}: {}", context, e))
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self> {
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| db_err("Failed to connect to Firestore", e))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| db_err("Failed to connect to Firestore Emulator", e))?;

        tracing::info!(project = project_id, "Connected to Firestore (Emulator)");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create an offline client. Every operation fails with a transient error.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    fn get_client(&self) -> Result<&firestore::FirestoreDb> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Transient("Database not connected (offline mode)".to_string()))
    }

    async fn read<T>(&self, collection: &str, id: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de> + Send,
    {
        read_doc(self.get_client()?, collection, id).await
    }

    /// Conditionally replace a versioned document inside a transaction.
    ///
    /// The version is read through the transaction, so a concurrent writer
    /// makes one of the commits fail and that writer sees a conflict.
    async fn versioned_replace<T>(
        &self,
        collection: &str,
        doc_id: &str,
        new_value: &T,
        version_of: impl Fn(&T) -> u64,
        expected_version: u64,
    ) -> Result<CasOutcome>
    where
        T: serde::Serialize + for<'de> serde::Deserialize<'de> + Send + Sync,
    {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| db_err("Failed to begin transaction", e))?;

        let current: Option<T> =
            match read_in_transaction(client, &transaction, collection, doc_id).await {
                Ok(current) => current,
                Err(e) if is_contention(&e) => {
                    let _ = transaction.rollback().await;
                    return Ok(CasOutcome::Conflict);
                }
                Err(e) => {
                    let _ = transaction.rollback().await;
                    return Err(db_err(
                        &format!("Failed to read {}/{}", collection, doc_id),
                        e,
                    ));
                }
            };
        let matches = current
            .as_ref()
            .is_some_and(|c| version_of(c) == expected_version);

        if !matches {
            let _ = transaction.rollback().await;
            return Ok(CasOutcome::Conflict);
        }

        client
            .fluent()
            .update()
            .in_col(collection)
            .document_id(doc_id)
            .object(new_value)
            .add_to_transaction(&mut transaction)
            .map_err(|e| db_err("Failed to add write to transaction", e))?;

        match transaction.commit().await {
            Ok(_) => Ok(CasOutcome::Applied),
            Err(e) if is_contention(&e) => {
                tracing::debug!(collection, doc_id, error = %e, "Versioned write lost race");
                Ok(CasOutcome::Conflict)
            }
            Err(e) => Err(db_err("Transaction commit failed", e)),
        }
    }

    /// One read-modify-write attempt on the user record. Firestore errors from
    /// the transaction come back in the inner result so the caller can retry
    /// the ones caused by contention.
    async fn try_increment_sync_count(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<std::result::Result<u32, FirestoreError>> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| db_err("Failed to begin transaction", e))?;

        let user: Option<UserRecord> =
            match read_in_transaction(client, &transaction, collections::USERS, user_id).await {
                Ok(user) => user,
                Err(e) => {
                    let _ = transaction.rollback().await;
                    return Ok(Err(e));
                }
            };
        let Some(mut user) = user else {
            let _ = transaction.rollback().await;
            return Err(AppError::NotFound(format!("User {}", user_id)));
        };

        let count = apply_sync_increment(&mut user, now);

        client
            .fluent()
            .update()
            .in_col(collections::USERS)
            .document_id(user_id)
            .object(&user)
            .add_to_transaction(&mut transaction)
            .map_err(|e| db_err("Failed to add user to transaction", e))?;

        Ok(transaction.commit().await.map(|_| count))
    }

    /// One merge attempt on the synchronized activity document.
    async fn try_merge_activity(
        &self,
        doc_id: &str,
        activity: &SynchronizedActivity,
    ) -> Result<std::result::Result<usize, FirestoreError>> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| db_err("Failed to begin transaction", e))?;

        let existing: Option<SynchronizedActivity> = match read_in_transaction(
            client,
            &transaction,
            collections::SYNCHRONIZED_ACTIVITIES,
            doc_id,
        )
        .await
        {
            Ok(existing) => existing,
            Err(e) => {
                let _ = transaction.rollback().await;
                return Ok(Err(e));
            }
        };
        let merged = match existing {
            Some(mut existing) => {
                existing.merge_from(activity);
                existing
            }
            None => activity.clone(),
        };

        client
            .fluent()
            .update()
            .in_col(collections::SYNCHRONIZED_ACTIVITIES)
            .document_id(doc_id)
            .object(&merged)
            .add_to_transaction(&mut transaction)
            .map_err(|e| db_err("Failed to add activity to transaction", e))?;

        Ok(transaction
            .commit()
            .await
            .map(|_| merged.destinations.len()))
    }
}

/// Attempts per read-modify-write before giving up to redelivery.
const MAX_TRANSACTION_ATTEMPTS: usize = 5;

/// Read a document as part of `transaction`, so a concurrent commit to it
/// aborts one of the two transactions.
async fn read_in_transaction<T>(
    client: &firestore::FirestoreDb,
    transaction: &FirestoreTransaction<'_>,
    collection: &str,
    id: &str,
) -> std::result::Result<Option<T>, FirestoreError>
where
    T: for<'de> serde::Deserialize<'de> + Send,
{
    client
        .clone_with_consistency_selector(FirestoreConsistencySelector::Transaction(
            transaction.transaction_id().clone(),
        ))
        .fluent()
        .select()
        .by_id_in(collection)
        .obj()
        .one(id)
        .await
}

async fn read_doc<T>(db: &firestore::FirestoreDb, collection: &str, id: &str) -> Result<Option<T>>
where
    T: for<'de> serde::Deserialize<'de> + Send,
{
    db.fluent()
        .select()
        .by_id_in(collection)
        .obj()
        .one(id)
        .await
        .map_err(|e| db_err(&format!("Failed to read {}/{}", collection, id), e))
}

/// Aborted or conflicting commits: another transaction touched the document.
fn is_contention(e: &FirestoreError) -> bool {
    match e {
        FirestoreError::DataConflictError(_) => true,
        FirestoreError::DatabaseError(db) => db.retry_possible,
        _ => false,
    }
}

#[async_trait]
impl PipelineStore for FirestoreDb {
    // ─── Execution Operations ────────────────────────────────────

    async fn set_execution(&self, execution: &PipelineExecution) -> Result<CasOutcome> {
        let result: std::result::Result<PipelineExecution, FirestoreError> = self
            .get_client()?
            .fluent()
            .insert()
            .into(collections::EXECUTIONS)
            .document_id(&execution.key)
            .object(execution)
            .execute()
            .await;

        match result {
            Ok(_) => Ok(CasOutcome::Applied),
            Err(FirestoreError::DataConflictError(_)) => Ok(CasOutcome::Conflict),
            Err(e) => Err(db_err("Failed to create execution", e)),
        }
    }

    async fn update_execution(
        &self,
        execution: &PipelineExecution,
        expected_version: u64,
    ) -> Result<CasOutcome> {
        let mut next = execution.clone();
        next.version = expected_version + 1;
        self.versioned_replace(
            collections::EXECUTIONS,
            &execution.key,
            &next,
            |e: &PipelineExecution| e.version,
            expected_version,
        )
        .await
    }

    async fn get_execution(&self, key: &str) -> Result<Option<PipelineExecution>> {
        self.read(collections::EXECUTIONS, key).await
    }

    // ─── User Operations ─────────────────────────────────────────

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        self.read(collections::USERS, user_id).await
    }

    async fn increment_sync_count(&self, user_id: &str, now: DateTime<Utc>) -> Result<u32> {
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            match self.try_increment_sync_count(user_id, now).await? {
                Ok(count) => {
                    tracing::debug!(user_id, count, "Monthly sync count incremented");
                    return Ok(count);
                }
                Err(e) if is_contention(&e) => {
                    tracing::debug!(user_id, attempt, error = %e, "Sync counter contended, retrying");
                }
                Err(e) => return Err(db_err("Sync counter commit failed", e)),
            }
        }
        Err(AppError::Transient(format!(
            "Sync counter for {} stayed contended",
            user_id
        )))
    }

    // ─── Synchronized Activity Operations ────────────────────────

    async fn set_synchronized_activity(&self, activity: &SynchronizedActivity) -> Result<()> {
        let doc_id = SynchronizedActivity::doc_id(&activity.user_id, &activity.activity_id);

        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            match self.try_merge_activity(&doc_id, activity).await? {
                Ok(destinations) => {
                    tracing::info!(
                        user_id = %activity.user_id,
                        activity_id = %activity.activity_id,
                        destinations,
                        "Synchronized activity stored"
                    );
                    return Ok(());
                }
                Err(e) if is_contention(&e) => {
                    tracing::debug!(doc_id, attempt, error = %e, "Activity merge contended, retrying");
                }
                Err(e) => return Err(db_err("Synchronized activity commit failed", e)),
            }
        }
        Err(AppError::Transient(format!(
            "Synchronized activity {} stayed contended",
            doc_id
        )))
    }

    async fn get_synchronized_activity(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<Option<SynchronizedActivity>> {
        self.read(
            collections::SYNCHRONIZED_ACTIVITIES,
            &SynchronizedActivity::doc_id(user_id, activity_id),
        )
        .await
    }

    // ─── Credential Operations ───────────────────────────────────

    async fn get_credential(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<StoredCredential>> {
        self.read(
            collections::CREDENTIALS,
            &StoredCredential::doc_id(user_id, provider),
        )
        .await
    }

    async fn swap_credential(
        &self,
        credential: &StoredCredential,
        expected_version: u64,
    ) -> Result<CasOutcome> {
        self.versioned_replace(
            collections::CREDENTIALS,
            &StoredCredential::doc_id(&credential.user_id, &credential.provider),
            credential,
            |c: &StoredCredential| c.version,
            expected_version,
        )
        .await
    }
}
