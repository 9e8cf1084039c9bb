// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory [`PipelineStore`] for tests and local runs.

use crate::db::{apply_sync_increment, CasOutcome, PipelineStore};
use crate::error::{AppError, Result};
use crate::models::{PipelineExecution, StoredCredential, SynchronizedActivity, UserRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// DashMap-backed store with the same conditional-write semantics as Firestore.
#[derive(Clone, Default)]
pub struct MemoryStore {
    executions: Arc<DashMap<String, PipelineExecution>>,
    users: Arc<DashMap<String, UserRecord>>,
    activities: Arc<DashMap<String, SynchronizedActivity>>,
    credentials: Arc<DashMap<String, StoredCredential>>,
    fail_activity_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_user(&self, user: UserRecord) {
        self.users.insert(user.user_id.clone(), user);
    }

    pub fn put_credential(&self, credential: StoredCredential) {
        self.credentials.insert(
            StoredCredential::doc_id(&credential.user_id, &credential.provider),
            credential,
        );
    }

    /// Make `set_synchronized_activity` fail with a transient error.
    pub fn fail_activity_writes(&self, fail: bool) {
        self.fail_activity_writes.store(fail, Ordering::SeqCst);
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn set_execution(&self, execution: &PipelineExecution) -> Result<CasOutcome> {
        match self.executions.entry(execution.key.clone()) {
            Entry::Occupied(_) => Ok(CasOutcome::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                Ok(CasOutcome::Applied)
            }
        }
    }

    async fn update_execution(
        &self,
        execution: &PipelineExecution,
        expected_version: u64,
    ) -> Result<CasOutcome> {
        let Some(mut current) = self.executions.get_mut(&execution.key) else {
            return Ok(CasOutcome::Conflict);
        };
        if current.version != expected_version {
            return Ok(CasOutcome::Conflict);
        }
        let mut next = execution.clone();
        next.version = expected_version + 1;
        *current = next;
        Ok(CasOutcome::Applied)
    }

    async fn get_execution(&self, key: &str) -> Result<Option<PipelineExecution>> {
        Ok(self.executions.get(key).map(|e| e.clone()))
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn increment_sync_count(&self, user_id: &str, now: DateTime<Utc>) -> Result<u32> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| AppError::NotFound(format!("User {}", user_id)))?;
        Ok(apply_sync_increment(&mut user, now))
    }

    async fn set_synchronized_activity(&self, activity: &SynchronizedActivity) -> Result<()> {
        if self.fail_activity_writes.load(Ordering::SeqCst) {
            return Err(AppError::Transient(
                "synchronized activity write unavailable".to_string(),
            ));
        }
        let id = SynchronizedActivity::doc_id(&activity.user_id, &activity.activity_id);
        self.activities
            .entry(id)
            .and_modify(|existing| existing.merge_from(activity))
            .or_insert_with(|| activity.clone());
        Ok(())
    }

    async fn get_synchronized_activity(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<Option<SynchronizedActivity>> {
        Ok(self
            .activities
            .get(&SynchronizedActivity::doc_id(user_id, activity_id))
            .map(|a| a.clone()))
    }

    async fn get_credential(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<StoredCredential>> {
        Ok(self
            .credentials
            .get(&StoredCredential::doc_id(user_id, provider))
            .map(|c| c.clone()))
    }

    async fn swap_credential(
        &self,
        credential: &StoredCredential,
        expected_version: u64,
    ) -> Result<CasOutcome> {
        let id = StoredCredential::doc_id(&credential.user_id, &credential.provider);
        match self.credentials.entry(id) {
            Entry::Occupied(mut slot) => {
                if slot.get().version != expected_version {
                    return Ok(CasOutcome::Conflict);
                }
                slot.insert(credential.clone());
                Ok(CasOutcome::Applied)
            }
            Entry::Vacant(_) => Ok(CasOutcome::Conflict),
        }
    }
}
