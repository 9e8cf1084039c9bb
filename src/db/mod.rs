// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Database layer.
//!
//! [`PipelineStore`] is the narrow interface the pipeline needs from durable
//! storage. Firestore backs it in production; [`MemoryStore`] backs tests and
//! local runs.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::models::{PipelineExecution, StoredCredential, SynchronizedActivity, UserRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    pub const EXECUTIONS: &str = "executions";
    pub const SYNCHRONIZED_ACTIVITIES: &str = "synchronized_activities";
    pub const CREDENTIALS: &str = "credentials";
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The precondition did not hold; someone else wrote first.
    Conflict,
}

/// Durable storage used by the pipeline.
///
/// Every failure is reported as a retryable [`crate::error::AppError::Transient`].
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Create the execution record if no record exists for its key.
    async fn set_execution(&self, execution: &PipelineExecution) -> Result<CasOutcome>;

    /// Replace the execution record if its stored version equals `expected_version`.
    /// The stored version becomes `expected_version + 1`.
    async fn update_execution(
        &self,
        execution: &PipelineExecution,
        expected_version: u64,
    ) -> Result<CasOutcome>;

    async fn get_execution(&self, key: &str) -> Result<Option<PipelineExecution>>;

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>>;

    /// Atomically count one successful sync. A counter whose reset date is not
    /// in the month of `now` is reset first. Returns the new count.
    async fn increment_sync_count(&self, user_id: &str, now: DateTime<Utc>) -> Result<u32>;

    /// Merge `activity` into the stored record: destination entries accumulate
    /// and a replay for the same destination overwrites its own entry.
    async fn set_synchronized_activity(&self, activity: &SynchronizedActivity) -> Result<()>;

    async fn get_synchronized_activity(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<Option<SynchronizedActivity>>;

    async fn get_credential(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<StoredCredential>>;

    /// Store `credential` if the stored version equals `expected_version`.
    async fn swap_credential(
        &self,
        credential: &StoredCredential,
        expected_version: u64,
    ) -> Result<CasOutcome>;
}

/// Apply the monthly reset rule to a user record and count one sync.
pub(crate) fn apply_sync_increment(user: &mut UserRecord, now: DateTime<Utc>) -> u32 {
    if crate::services::tier::should_reset_sync_count(user, now) {
        user.sync_count_this_month = 0;
        user.sync_count_reset_at = Some(now);
    }
    user.sync_count_this_month = user.sync_count_this_month.saturating_add(1);
    user.sync_count_this_month
}
