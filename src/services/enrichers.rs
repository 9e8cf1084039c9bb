// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-user enrichers that rewrite activity metadata before upload.
//!
//! Each user configures, per source provider, an ordered list of enrichers
//! and their string inputs. The pipeline runs them in that order and folds
//! their results into one [`AppliedEnrichment`]. An enricher may also halt
//! the pipeline, in which case the activity is skipped rather than failed.

use crate::error::Result;
use crate::models::{ActivityType, AppliedEnrichment, EnrichmentEvent, UserRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What one enricher wants changed. Empty fields leave the activity alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentResult {
    /// Replaces the activity name
    pub name: Option<String>,
    /// Appended to the final name after every enricher has run
    pub name_suffix: Option<String>,
    /// Section appended to the description
    pub description: Option<String>,
    /// Replaces the activity type
    pub activity_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Stop the pipeline for this activity, with a reason
    pub halt: Option<String>,
}

#[async_trait]
pub trait Enricher: Send + Sync {
    /// Name users reference in their configuration, e.g. `branding`.
    fn name(&self) -> &str;

    async fn enrich(
        &self,
        activity: &EnrichmentEvent,
        user: &UserRecord,
        inputs: &HashMap<String, String>,
    ) -> Result<EnrichmentResult>;
}

/// Result of running a user's enrichers over one activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    Continue(AppliedEnrichment),
    Halted { enricher: String, reason: String },
}

/// Enrichers by name.
#[derive(Clone, Default)]
pub struct EnricherRegistry {
    providers: HashMap<String, Arc<dyn Enricher>>,
}

impl EnricherRegistry {
    /// Registry with every built-in enricher.
    pub fn builtin() -> Self {
        Self::default()
            .with(Arc::new(Branding))
            .with(Arc::new(SourceLink))
            .with(Arc::new(ActivityFilter))
    }

    pub fn with(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.providers.insert(enricher.name().to_string(), enricher);
        self
    }

    /// Run the enrichers `user` configured for the activity's source.
    pub async fn apply(
        &self,
        activity: &EnrichmentEvent,
        user: &UserRecord,
    ) -> Result<EnrichmentOutcome> {
        let mut applied = AppliedEnrichment {
            name: activity.name.clone(),
            description: activity.description.clone(),
            activity_type: activity.activity_type.clone(),
            ..AppliedEnrichment::default()
        };
        let mut suffixes = String::new();

        for config in user.enrichers_for(&activity.source) {
            let Some(enricher) = self.providers.get(&config.name) else {
                tracing::warn!(
                    user_id = %user.user_id,
                    enricher = %config.name,
                    "Unknown enricher configured, skipping"
                );
                continue;
            };

            let result = match enricher.enrich(activity, user, &config.inputs).await {
                Ok(result) => result,
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        user_id = %user.user_id,
                        activity_id = %activity.activity_id,
                        enricher = %config.name,
                        error = %e,
                        "Enricher failed, continuing without it"
                    );
                    continue;
                }
            };

            if let Some(reason) = result.halt {
                tracing::info!(
                    user_id = %user.user_id,
                    activity_id = %activity.activity_id,
                    enricher = %config.name,
                    reason = %reason,
                    "Enricher halted pipeline"
                );
                return Ok(EnrichmentOutcome::Halted {
                    enricher: config.name.clone(),
                    reason,
                });
            }

            if let Some(name) = result.name.filter(|n| !n.is_empty()) {
                applied.name = name;
            }
            if let Some(section) = result.description.filter(|d| !d.is_empty()) {
                if !applied.description.is_empty() {
                    applied.description.push_str("\n\n");
                }
                applied.description.push_str(&section);
            }
            if let Some(activity_type) = result.activity_type.filter(|t| !t.is_empty()) {
                applied.activity_type = activity_type;
            }
            if let Some(suffix) = result.name_suffix {
                suffixes.push_str(&suffix);
            }
            applied.metadata.extend(result.metadata);
            applied.applied.push(config.name.clone());
        }

        applied.name.push_str(&suffixes);
        Ok(EnrichmentOutcome::Continue(applied))
    }
}

// ─── Branding ────────────────────────────────────────────────────────────────

const DEFAULT_BRANDING: &str = "Posted via fitrelay";

/// Appends a short footer to the description.
pub struct Branding;

#[async_trait]
impl Enricher for Branding {
    fn name(&self) -> &str {
        "branding"
    }

    async fn enrich(
        &self,
        _activity: &EnrichmentEvent,
        _user: &UserRecord,
        inputs: &HashMap<String, String>,
    ) -> Result<EnrichmentResult> {
        let message = inputs
            .get("message")
            .filter(|m| !m.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_BRANDING.to_string());
        Ok(EnrichmentResult {
            description: Some(message.clone()),
            metadata: BTreeMap::from([("branding_message".to_string(), message)]),
            ..EnrichmentResult::default()
        })
    }
}

// ─── Source link ─────────────────────────────────────────────────────────────

/// Links back to the activity on the provider it came from.
pub struct SourceLink;

impl SourceLink {
    fn link(source: &str, activity_id: &str) -> Option<(&'static str, String)> {
        let id = urlencoding::encode(activity_id);
        match source.to_ascii_lowercase().as_str() {
            "hevy" => Some(("Hevy", format!("https://hevy.com/workout/{}", id))),
            "strava" => Some((
                "Strava",
                format!("https://www.strava.com/activities/{}", id),
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl Enricher for SourceLink {
    fn name(&self) -> &str {
        "source_link"
    }

    async fn enrich(
        &self,
        activity: &EnrichmentEvent,
        _user: &UserRecord,
        _inputs: &HashMap<String, String>,
    ) -> Result<EnrichmentResult> {
        let Some((label, url)) = Self::link(&activity.source, &activity.activity_id) else {
            return Ok(EnrichmentResult::default());
        };
        Ok(EnrichmentResult {
            description: Some(format!("View on {}: {}", label, url)),
            metadata: BTreeMap::from([("source_link".to_string(), url)]),
            ..EnrichmentResult::default()
        })
    }
}

// ─── Activity filter ─────────────────────────────────────────────────────────

/// Skips activities by type, title or description.
///
/// Inputs are comma-separated and case-insensitive:
/// `exclude_activity_types`, `exclude_title_contains`,
/// `exclude_description_contains` drop a matching activity, and when any of
/// `include_activity_types`, `include_title_contains`,
/// `include_description_contains` is set the activity must match one of them.
pub struct ActivityFilter;

fn list(inputs: &HashMap<String, String>, key: &str) -> Vec<String> {
    inputs
        .get(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn type_matches(activity_type: &str, wanted: &[String]) -> bool {
    let parsed = ActivityType::parse(activity_type);
    wanted.iter().any(|w| {
        w.eq_ignore_ascii_case(activity_type)
            || (parsed != ActivityType::Unspecified && ActivityType::parse(w) == parsed)
    })
}

fn text_matches(text: &str, needles: &[String]) -> bool {
    let text = text.to_lowercase();
    needles.iter().any(|n| text.contains(n.as_str()))
}

impl ActivityFilter {
    /// Reason to drop the activity, if any.
    fn verdict(activity: &EnrichmentEvent, inputs: &HashMap<String, String>) -> Option<String> {
        let exclude_types = list(inputs, "exclude_activity_types");
        if type_matches(&activity.activity_type, &exclude_types) {
            return Some(format!("activity type {} is excluded", activity.activity_type));
        }
        if text_matches(&activity.name, &list(inputs, "exclude_title_contains")) {
            return Some("title matches an exclude pattern".to_string());
        }
        if text_matches(
            &activity.description,
            &list(inputs, "exclude_description_contains"),
        ) {
            return Some("description matches an exclude pattern".to_string());
        }

        let include_types = list(inputs, "include_activity_types");
        let include_title = list(inputs, "include_title_contains");
        let include_description = list(inputs, "include_description_contains");
        if include_types.is_empty() && include_title.is_empty() && include_description.is_empty()
        {
            return None;
        }
        let included = type_matches(&activity.activity_type, &include_types)
            || text_matches(&activity.name, &include_title)
            || text_matches(&activity.description, &include_description);
        if included {
            None
        } else {
            Some("activity matches no include rule".to_string())
        }
    }
}

#[async_trait]
impl Enricher for ActivityFilter {
    fn name(&self) -> &str {
        "activity_filter"
    }

    async fn enrich(
        &self,
        activity: &EnrichmentEvent,
        _user: &UserRecord,
        inputs: &HashMap<String, String>,
    ) -> Result<EnrichmentResult> {
        Ok(match Self::verdict(activity, inputs) {
            Some(reason) => EnrichmentResult {
                metadata: BTreeMap::from([("filter_reason".to_string(), reason.clone())]),
                halt: Some(reason),
                ..EnrichmentResult::default()
            },
            None => EnrichmentResult::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::models::EnricherConfig;

    fn activity() -> EnrichmentEvent {
        serde_json::from_value(serde_json::json!({
            "activityId": "w-42",
            "pipelineId": "p1",
            "userId": "u1",
            "name": "Leg day",
            "description": "Squats",
            "activityType": "WEIGHT_TRAINING",
            "source": "hevy",
            "startTime": "2026-05-01T10:00:00Z",
            "destinations": ["strava"]
        }))
        .unwrap()
    }

    fn user(configs: Vec<EnricherConfig>) -> UserRecord {
        let mut user = UserRecord::new_free("u1");
        user.enrichments.insert("HEVY".to_string(), configs);
        user
    }

    fn config(name: &str, pairs: &[(&str, &str)]) -> EnricherConfig {
        EnricherConfig {
            name: name.to_string(),
            inputs: inputs(pairs),
        }
    }

    fn applied(outcome: EnrichmentOutcome) -> AppliedEnrichment {
        match outcome {
            EnrichmentOutcome::Continue(applied) => applied,
            other => panic!("expected enrichment, got {:?}", other),
        }
    }

    struct Renamer;

    #[async_trait]
    impl Enricher for Renamer {
        fn name(&self) -> &str {
            "renamer"
        }

        async fn enrich(
            &self,
            _activity: &EnrichmentEvent,
            _user: &UserRecord,
            inputs: &HashMap<String, String>,
        ) -> Result<EnrichmentResult> {
            Ok(EnrichmentResult {
                name: inputs.get("name").cloned(),
                name_suffix: Some(" (#3)".to_string()),
                activity_type: Some("RUN".to_string()),
                ..EnrichmentResult::default()
            })
        }
    }

    struct Flaky(bool);

    #[async_trait]
    impl Enricher for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn enrich(
            &self,
            _activity: &EnrichmentEvent,
            _user: &UserRecord,
            _inputs: &HashMap<String, String>,
        ) -> Result<EnrichmentResult> {
            if self.0 {
                Err(AppError::Transient("lookup timed out".into()))
            } else {
                Err(AppError::Validation("bad inputs".into()))
            }
        }
    }

    #[tokio::test]
    async fn no_configuration_leaves_activity_untouched() {
        let outcome = EnricherRegistry::builtin()
            .apply(&activity(), &UserRecord::new_free("u1"))
            .await
            .unwrap();
        let applied = applied(outcome);
        assert_eq!(applied.name, "Leg day");
        assert_eq!(applied.description, "Squats");
        assert_eq!(applied.activity_type, "WEIGHT_TRAINING");
        assert!(applied.applied.is_empty());
    }

    #[tokio::test]
    async fn enrichers_run_in_configured_order() {
        let registry = EnricherRegistry::builtin().with(Arc::new(Renamer));
        let user = user(vec![
            config("source_link", &[]),
            config("renamer", &[("name", "Morning lift")]),
            config("unknown_enricher", &[]),
            config("branding", &[("message", "Synced by me")]),
        ]);

        let applied = applied(registry.apply(&activity(), &user).await.unwrap());
        assert_eq!(applied.name, "Morning lift (#3)");
        assert_eq!(applied.activity_type, "RUN");
        assert_eq!(
            applied.description,
            "Squats\n\nView on Hevy: https://hevy.com/workout/w-42\n\nSynced by me"
        );
        assert_eq!(applied.applied, vec!["source_link", "renamer", "branding"]);
        assert_eq!(
            applied.metadata.get("source_link").map(String::as_str),
            Some("https://hevy.com/workout/w-42")
        );
        assert_eq!(
            applied.metadata.get("branding_message").map(String::as_str),
            Some("Synced by me")
        );
    }

    #[tokio::test]
    async fn branding_falls_back_to_default_message() {
        let user = user(vec![config("branding", &[("message", "  ")])]);
        let mut event = activity();
        event.description.clear();

        let applied = applied(EnricherRegistry::builtin().apply(&event, &user).await.unwrap());
        assert_eq!(applied.description, DEFAULT_BRANDING);
    }

    #[tokio::test]
    async fn source_link_ignores_unknown_providers() {
        let user = {
            let mut u = UserRecord::new_free("u1");
            u.enrichments
                .insert("garmin".into(), vec![config("source_link", &[])]);
            u
        };
        let mut event = activity();
        event.source = "garmin".into();

        let applied = applied(EnricherRegistry::builtin().apply(&event, &user).await.unwrap());
        assert_eq!(applied.description, "Squats");
        assert!(applied.metadata.is_empty());
        assert_eq!(applied.applied, vec!["source_link"]);
    }

    #[tokio::test]
    async fn filter_halts_on_excluded_type() {
        let user = user(vec![
            config("branding", &[]),
            config(
                "activity_filter",
                &[("exclude_activity_types", "walk, weight_training")],
            ),
        ]);
        let outcome = EnricherRegistry::builtin()
            .apply(&activity(), &user)
            .await
            .unwrap();
        match outcome {
            EnrichmentOutcome::Halted { enricher, reason } => {
                assert_eq!(enricher, "activity_filter");
                assert!(reason.contains("WEIGHT_TRAINING"));
            }
            other => panic!("expected halt, got {:?}", other),
        }
    }

    fn inputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn filter_rules() {
        let event = activity();

        assert_eq!(ActivityFilter::verdict(&event, &inputs(&[])), None);
        assert!(ActivityFilter::verdict(&event, &inputs(&[("exclude_title_contains", "LEG")]))
            .is_some());
        assert!(ActivityFilter::verdict(
            &event,
            &inputs(&[("exclude_description_contains", "bench,squat")])
        )
        .is_some());
        assert_eq!(
            ActivityFilter::verdict(&event, &inputs(&[("include_activity_types", "strength")])),
            None
        );
        assert_eq!(
            ActivityFilter::verdict(
                &event,
                &inputs(&[
                    ("include_activity_types", "run"),
                    ("include_title_contains", "leg")
                ])
            ),
            None
        );
        assert_eq!(
            ActivityFilter::verdict(&event, &inputs(&[("include_activity_types", "run,ride")])),
            Some("activity matches no include rule".to_string())
        );
    }

    #[tokio::test]
    async fn retryable_enricher_errors_propagate() {
        let user = user(vec![config("flaky", &[]), config("branding", &[])]);

        let broken = EnricherRegistry::builtin().with(Arc::new(Flaky(false)));
        let applied = applied(broken.apply(&activity(), &user).await.unwrap());
        assert_eq!(applied.applied, vec!["branding"]);

        let slow = EnricherRegistry::builtin().with(Arc::new(Flaky(true)));
        let err = slow.apply(&activity(), &user).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
