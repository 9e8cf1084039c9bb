// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore integration tests.
//!
//! These tests require the Firestore emulator to be running
//! (`FIRESTORE_EMULATOR_HOST` set); without it they return early.

use chrono::{Duration, TimeZone, Utc};
use fitrelay::db::{collections, CasOutcome, PipelineStore};
use fitrelay::models::{PipelineExecution, StoredCredential, SynchronizedActivity, UserRecord};
use std::collections::BTreeMap;

mod common;
use common::{seed_doc, test_db};

/// Unique ID per test run so tests do not see each other's documents.
fn unique_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

fn execution(key: &str) -> PipelineExecution {
    PipelineExecution::received(
        key,
        "act-1",
        "pipe-1",
        "user-1",
        &["strava".to_string(), "trainingpeaks".to_string()],
        Utc::now(),
    )
}

fn synced(user_id: &str, destination: &str, id: &str) -> SynchronizedActivity {
    SynchronizedActivity {
        activity_id: "act-1".to_string(),
        user_id: user_id.to_string(),
        title: "Leg day".to_string(),
        activity_type: "WeightTraining".to_string(),
        source: "hevy".to_string(),
        start_time: Utc::now(),
        synced_at: Utc::now(),
        pipeline_execution_id: "exec-1".to_string(),
        destinations: BTreeMap::from([(destination.to_string(), id.to_string())]),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EXECUTION RECORDS
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_set_execution_is_insert_if_absent() {
    require_emulator!();

    let db = test_db().await;
    let key = unique_id("exec");
    let first = execution(&key);
    let second = execution(&key);

    assert_eq!(db.set_execution(&first).await.unwrap(), CasOutcome::Applied);
    assert_eq!(
        db.set_execution(&second).await.unwrap(),
        CasOutcome::Conflict
    );

    let stored = db.get_execution(&key).await.unwrap().unwrap();
    assert_eq!(stored.id, first.id, "first writer's record must survive");
}

#[tokio::test]
async fn test_update_execution_compares_version() {
    require_emulator!();

    let db = test_db().await;
    let key = unique_id("exec");
    let exec = execution(&key);
    db.set_execution(&exec).await.unwrap();

    let mut next = exec.clone();
    next.attempt_count = 2;
    assert_eq!(
        db.update_execution(&next, 0).await.unwrap(),
        CasOutcome::Applied
    );
    assert_eq!(
        db.update_execution(&next, 0).await.unwrap(),
        CasOutcome::Conflict
    );

    let stored = db.get_execution(&key).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.attempt_count, 2);
    assert_eq!(stored.destinations.len(), 2);
}

#[tokio::test]
async fn test_racing_updates_have_one_winner() {
    require_emulator!();

    let db = test_db().await;
    let key = unique_id("exec");
    let exec = execution(&key);
    db.set_execution(&exec).await.unwrap();

    let mut left = exec.clone();
    left.attempt_count = 2;
    left.last_error = Some("left".to_string());
    let mut right = exec.clone();
    right.attempt_count = 2;
    right.last_error = Some("right".to_string());

    let (a, b) = tokio::join!(db.update_execution(&left, 0), db.update_execution(&right, 0));
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == CasOutcome::Applied)
            .count(),
        1,
        "exactly one writer may apply at version 0: {:?}",
        outcomes
    );

    let stored = db.get_execution(&key).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    let winner = if outcomes[0] == CasOutcome::Applied {
        "left"
    } else {
        "right"
    };
    assert_eq!(stored.last_error.as_deref(), Some(winner));
}

#[tokio::test]
async fn test_missing_execution_is_none() {
    require_emulator!();

    let db = test_db().await;
    assert!(db
        .get_execution(&unique_id("nope"))
        .await
        .unwrap()
        .is_none());
}

// ═══════════════════════════════════════════════════════════════════════════
// USERS AND SYNC COUNTER
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_increment_sync_count_resets_each_month() {
    require_emulator!();

    let db = test_db().await;
    let user_id = unique_id("user");
    let mut user = UserRecord::new_free(&user_id);
    user.sync_count_this_month = 3;
    user.sync_count_reset_at = Some(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());
    seed_doc(collections::USERS, &user_id, &user).await;

    let march = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap();
    assert_eq!(db.increment_sync_count(&user_id, march).await.unwrap(), 4);

    let april = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 1).unwrap();
    assert_eq!(db.increment_sync_count(&user_id, april).await.unwrap(), 1);

    let stored = db.get_user(&user_id).await.unwrap().unwrap();
    assert_eq!(stored.sync_count_this_month, 1);
    assert_eq!(stored.sync_count_reset_at, Some(april));
}

#[tokio::test]
async fn test_concurrent_increments_are_not_lost() {
    require_emulator!();

    let db = test_db().await;
    let user_id = unique_id("user");
    let mut user = UserRecord::new_free(&user_id);
    user.sync_count_reset_at = Some(Utc::now());
    seed_doc(collections::USERS, &user_id, &user).await;

    let now = Utc::now();
    let (a, b, c) = tokio::join!(
        db.increment_sync_count(&user_id, now),
        db.increment_sync_count(&user_id, now),
        db.increment_sync_count(&user_id, now),
    );
    let mut counts = vec![a.unwrap(), b.unwrap(), c.unwrap()];
    counts.sort_unstable();
    assert_eq!(counts, vec![1, 2, 3]);

    let stored = db.get_user(&user_id).await.unwrap().unwrap();
    assert_eq!(stored.sync_count_this_month, 3);
}

#[tokio::test]
async fn test_increment_for_unknown_user_fails() {
    require_emulator!();

    let db = test_db().await;
    let err = db
        .increment_sync_count(&unique_id("ghost"), Utc::now())
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNCHRONIZED ACTIVITIES
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_synchronized_activity_merges_destinations() {
    require_emulator!();

    let db = test_db().await;
    let user_id = unique_id("user");

    db.set_synchronized_activity(&synced(&user_id, "strava", "111"))
        .await
        .unwrap();
    db.set_synchronized_activity(&synced(&user_id, "trainingpeaks", "tp-9"))
        .await
        .unwrap();
    // Replay for the same destination overwrites its own entry only.
    db.set_synchronized_activity(&synced(&user_id, "strava", "111"))
        .await
        .unwrap();

    let stored = db
        .get_synchronized_activity(&user_id, "act-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.destinations.len(), 2);
    assert_eq!(stored.destinations["strava"], "111");
    assert_eq!(stored.destinations["trainingpeaks"], "tp-9");
}

#[tokio::test]
async fn test_concurrent_destinations_both_survive() {
    require_emulator!();

    let db = test_db().await;
    let user_id = unique_id("user");

    let strava = synced(&user_id, "strava", "111");
    let tp = synced(&user_id, "trainingpeaks", "tp-9");
    let (a, b) = tokio::join!(
        db.set_synchronized_activity(&strava),
        db.set_synchronized_activity(&tp),
    );
    a.unwrap();
    b.unwrap();

    let stored = db
        .get_synchronized_activity(&user_id, "act-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.destinations,
        BTreeMap::from([
            ("strava".to_string(), "111".to_string()),
            ("trainingpeaks".to_string(), "tp-9".to_string()),
        ])
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// CREDENTIALS
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_swap_credential_single_winner() {
    require_emulator!();

    let db = test_db().await;
    let user_id = unique_id("user");
    let original = StoredCredential {
        user_id: user_id.clone(),
        provider: "strava".to_string(),
        access_token_encrypted: "enc-a0".to_string(),
        refresh_token_encrypted: "enc-r0".to_string(),
        expires_at: Utc::now() + Duration::hours(6),
        version: 1,
        refreshed_at: Utc::now(),
    };
    seed_doc(
        collections::CREDENTIALS,
        &StoredCredential::doc_id(&user_id, "strava"),
        &original,
    )
    .await;

    let winner = StoredCredential {
        access_token_encrypted: "enc-a1".to_string(),
        version: 2,
        ..original.clone()
    };
    let loser = StoredCredential {
        access_token_encrypted: "enc-a1-late".to_string(),
        version: 2,
        ..original.clone()
    };

    assert_eq!(
        db.swap_credential(&winner, 1).await.unwrap(),
        CasOutcome::Applied
    );
    assert_eq!(
        db.swap_credential(&loser, 1).await.unwrap(),
        CasOutcome::Conflict
    );

    let stored = db.get_credential(&user_id, "strava").await.unwrap().unwrap();
    assert_eq!(stored.access_token_encrypted, "enc-a1");
    assert_eq!(stored.version, 2);
}
