// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Synchronized activity model for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Local record of an activity that has been pushed to one or more destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizedActivity {
    /// Activity ID (document ID together with the user ID)
    pub activity_id: String,
    pub user_id: String,
    pub title: String,
    /// Destination display name of the activity type
    pub activity_type: String,
    /// Provider the activity came from
    pub source: String,
    pub start_time: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
    pub pipeline_execution_id: String,
    /// Destination name → ID assigned by that destination
    #[serde(default)]
    pub destinations: BTreeMap<String, String>,
}

impl SynchronizedActivity {
    /// Document ID used for the synchronized activities collection.
    pub fn doc_id(user_id: &str, activity_id: &str) -> String {
        format!(
            "{}:{}",
            urlencoding::encode(user_id),
            urlencoding::encode(activity_id)
        )
    }

    /// Fold `update` into `self`: destination entries accumulate, a destination
    /// already present is overwritten with the newer ID, everything else is
    /// taken from `update`.
    pub fn merge_from(&mut self, update: &SynchronizedActivity) {
        let mut destinations = std::mem::take(&mut self.destinations);
        for (destination, external_id) in &update.destinations {
            destinations.insert(destination.clone(), external_id.clone());
        }
        *self = update.clone();
        self.destinations = destinations;
    }
}
