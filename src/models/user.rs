// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User and credential models for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Subscription tier as stored on the user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
}

/// User record stored in Firestore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// User ID (also used as document ID)
    pub user_id: String,
    /// Stored tier; see `tier::effective_tier` for the tier actually applied
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub is_admin: bool,
    /// End of the free trial, if one was granted
    #[serde(default)]
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// Successful syncs counted in the month of `sync_count_reset_at`
    #[serde(default)]
    pub sync_count_this_month: u32,
    /// When the monthly counter was last reset
    #[serde(default)]
    pub sync_count_reset_at: Option<DateTime<Utc>>,
    /// Enrichers to run, keyed by source provider
    #[serde(default)]
    pub enrichments: BTreeMap<String, Vec<EnricherConfig>>,
}

/// One configured enricher and its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnricherConfig {
    pub name: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

impl UserRecord {
    /// A free-tier user with no usage.
    pub fn new_free(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tier: Tier::Free,
            is_admin: false,
            trial_ends_at: None,
            sync_count_this_month: 0,
            sync_count_reset_at: None,
            enrichments: BTreeMap::new(),
        }
    }

    /// Enrichers configured for activities from `source`, matched case-insensitively.
    pub fn enrichers_for(&self, source: &str) -> &[EnricherConfig] {
        self.enrichments
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(source))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }
}

/// OAuth credential for one (user, destination) pair, encrypted with KMS.
///
/// `version` increases by one on every refresh. Writers compare-and-swap on the
/// version they observed, so concurrent refreshers converge on a single winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub user_id: String,
    /// Destination or provider name, e.g. `strava`, `fitbit`
    pub provider: String,
    /// Encrypted access token (base64)
    pub access_token_encrypted: String,
    /// Encrypted refresh token (base64)
    pub refresh_token_encrypted: String,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
    pub refreshed_at: DateTime<Utc>,
}

impl StoredCredential {
    /// Document ID used for the credentials collection.
    pub fn doc_id(user_id: &str, provider: &str) -> String {
        format!(
            "{}:{}",
            urlencoding::encode(user_id),
            urlencoding::encode(provider)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrichers_are_looked_up_by_source_ignoring_case() {
        let user: UserRecord = serde_json::from_value(serde_json::json!({
            "user_id": "u1",
            "enrichments": {
                "HEVY": [
                    {"name": "branding", "inputs": {"message": "hi"}},
                    {"name": "source_link"}
                ]
            }
        }))
        .unwrap();

        let configs = user.enrichers_for("hevy");
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].inputs["message"], "hi");
        assert!(configs[1].inputs.is_empty());
        assert!(user.enrichers_for("strava").is_empty());
    }

    #[test]
    fn records_without_enrichments_still_load() {
        let user: UserRecord =
            serde_json::from_value(serde_json::json!({"user_id": "u1", "tier": "pro"})).unwrap();
        assert_eq!(user.tier, Tier::Pro);
        assert!(user.enrichments.is_empty());
    }
}
