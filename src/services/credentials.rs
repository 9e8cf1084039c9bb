// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OAuth credential lifecycle for destinations and telemetry providers.
//!
//! Credentials are stored encrypted and versioned. A refresh writes version
//! `n + 1` with a compare-and-swap on `n`; a refresher that loses the race
//! re-reads the record and adopts the winner's token instead of failing.

use crate::db::{CasOutcome, PipelineStore};
use crate::error::{AppError, Result};
use crate::models::StoredCredential;
use crate::services::kms::{credential_aad, encrypt_tokens, KmsService};
use crate::services::secrets::SecretResolver;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Margin before token expiration when we proactively refresh (5 minutes).
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// A decrypted access token and the record version it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessCredential {
    pub access_token: String,
    pub version: u64,
    pub expires_at: DateTime<Utc>,
}

/// Result of exchanging a refresh token.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Exchanges refresh tokens with a provider's OAuth endpoint.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Errors: `AuthExpired` when the provider rejects the refresh token,
    /// `Transient` for rate limits and outages.
    async fn refresh(&self, provider: &str, refresh_token: &str) -> Result<TokenGrant>;
}

// ─── OAuth refresh over HTTP ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Some providers rotate the refresh token, others keep the old one
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Standard `refresh_token` grant against each provider's token endpoint.
/// Client credentials come from `{provider}_client_id` / `{provider}_client_secret`.
#[derive(Clone)]
pub struct OAuthRefresher {
    http: reqwest::Client,
    secrets: SecretResolver,
    token_urls: HashMap<String, String>,
}

impl OAuthRefresher {
    pub fn new(secrets: SecretResolver) -> Self {
        let token_urls = [
            ("strava", "https://www.strava.com/oauth/token"),
            ("fitbit", "https://api.fitbit.com/oauth2/token"),
        ]
        .into_iter()
        .map(|(p, u)| (p.to_string(), u.to_string()))
        .collect();

        Self {
            http: reqwest::Client::new(),
            secrets,
            token_urls,
        }
    }

    /// Point a provider at a different token endpoint.
    pub fn with_token_url(mut self, provider: &str, url: impl Into<String>) -> Self {
        self.token_urls.insert(provider.to_string(), url.into());
        self
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, provider: &str, refresh_token: &str) -> Result<TokenGrant> {
        let url = self
            .token_urls
            .get(provider)
            .ok_or_else(|| AppError::Validation(format!("unknown OAuth provider {}", provider)))?;

        let client_id = self.secrets.resolve(&format!("{}_client_id", provider)).await?;
        let client_secret = self
            .secrets
            .resolve(&format!("{}_client_secret", provider))
            .await?;

        // Fitbit wants client credentials as HTTP basic auth; Strava wants them in the form.
        let request = if provider == "fitbit" {
            self.http
                .post(url)
                .basic_auth(&client_id, Some(&client_secret))
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ])
        } else {
            self.http.post(url).form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
        };

        let response = request.send().await.map_err(|e| {
            AppError::Transient(format!("{} token refresh request failed: {}", provider, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(provider, status = status.as_u16(), body = %body, "Token refresh rejected");
            return Err(match status.as_u16() {
                400 | 401 => AppError::AuthExpired {
                    destination: provider.to_string(),
                },
                429 => AppError::Transient(format!("{} token endpoint rate limited", provider)),
                s if s >= 500 => {
                    AppError::Transient(format!("{} token endpoint HTTP {}", provider, s))
                }
                s => AppError::Rejected {
                    status: s,
                    details: body,
                },
            });
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| {
            AppError::Transient(format!("{} token response unreadable: {}", provider, e))
        })?;

        let expires_at = match (parsed.expires_at, parsed.expires_in) {
            (Some(at), _) => DateTime::from_timestamp(at, 0),
            (None, Some(secs)) => Some(Utc::now() + Duration::seconds(secs)),
            (None, None) => None,
        }
        .unwrap_or_else(|| Utc::now() + Duration::hours(1));

        Ok(TokenGrant {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at,
        })
    }
}

// ─── CredentialManager ───────────────────────────────────────────────────────

/// Hands out valid access tokens and coordinates refreshes across instances.
#[derive(Clone)]
pub struct CredentialManager {
    store: Arc<dyn PipelineStore>,
    kms: KmsService,
    refresher: Arc<dyn TokenRefresher>,
    /// Decrypted access tokens keyed by credential doc ID.
    cache: Arc<DashMap<String, AccessCredential>>,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        kms: KmsService,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            store,
            kms,
            refresher,
            cache: Arc::new(DashMap::new()),
        }
    }

    fn is_fresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) < expires_at
    }

    async fn load(&self, user_id: &str, provider: &str) -> Result<StoredCredential> {
        self.store
            .get_credential(user_id, provider)
            .await?
            .ok_or_else(|| {
                tracing::warn!(user_id, provider, "No stored credential");
                AppError::AuthExpired {
                    destination: provider.to_string(),
                }
            })
    }

    async fn adopt(&self, stored: &StoredCredential) -> Result<AccessCredential> {
        let aad = credential_aad(&stored.user_id, &stored.provider);
        let access_token = self.kms.decrypt(&stored.access_token_encrypted, &aad).await?;
        let credential = AccessCredential {
            access_token,
            version: stored.version,
            expires_at: stored.expires_at,
        };
        self.cache.insert(
            StoredCredential::doc_id(&stored.user_id, &stored.provider),
            credential.clone(),
        );
        Ok(credential)
    }

    /// A valid access token, refreshing proactively when it is about to expire.
    pub async fn current(&self, user_id: &str, provider: &str) -> Result<AccessCredential> {
        let now = Utc::now();
        let cache_key = StoredCredential::doc_id(user_id, provider);

        if let Some(cached) = self.cache.get(&cache_key) {
            if Self::is_fresh(cached.expires_at, now) {
                return Ok(cached.clone());
            }
        }

        let stored = self.load(user_id, provider).await?;
        if Self::is_fresh(stored.expires_at, now) {
            return self.adopt(&stored).await;
        }

        tracing::info!(user_id, provider, version = stored.version, "Access token expiring, refreshing");
        self.refresh_from(stored).await
    }

    /// Refresh after the destination rejected `stale`. If another worker has
    /// already written a newer version, that version is returned without a
    /// second refresh.
    pub async fn force_refresh(
        &self,
        user_id: &str,
        provider: &str,
        stale: &AccessCredential,
    ) -> Result<AccessCredential> {
        self.cache.remove(&StoredCredential::doc_id(user_id, provider));

        let stored = self.load(user_id, provider).await?;
        if stored.version > stale.version {
            tracing::info!(
                user_id,
                provider,
                version = stored.version,
                "Credential already refreshed elsewhere"
            );
            return self.adopt(&stored).await;
        }

        tracing::info!(user_id, provider, version = stored.version, "Forcing token refresh");
        self.refresh_from(stored).await
    }

    async fn refresh_from(&self, stored: StoredCredential) -> Result<AccessCredential> {
        let aad = credential_aad(&stored.user_id, &stored.provider);
        let refresh_token = self
            .kms
            .decrypt(&stored.refresh_token_encrypted, &aad)
            .await?;

        let grant = match self.refresher.refresh(&stored.provider, &refresh_token).await {
            Ok(grant) => grant,
            Err(AppError::AuthExpired { destination }) => {
                // A concurrent refresher may have rotated the refresh token.
                let latest = self.load(&stored.user_id, &stored.provider).await?;
                if latest.version > stored.version {
                    tracing::info!(
                        user_id = %stored.user_id,
                        provider = %stored.provider,
                        "Refresh token race lost, adopting winner"
                    );
                    return self.adopt(&latest).await;
                }
                return Err(AppError::AuthExpired { destination });
            }
            Err(e) => return Err(e),
        };

        let (access_token_encrypted, refresh_token_encrypted) = encrypt_tokens(
            &self.kms,
            &grant.access_token,
            &grant.refresh_token,
            &stored.user_id,
            &stored.provider,
        )
        .await?;

        let next = StoredCredential {
            access_token_encrypted,
            refresh_token_encrypted,
            expires_at: grant.expires_at,
            version: stored.version + 1,
            refreshed_at: Utc::now(),
            ..stored.clone()
        };

        match self.store.swap_credential(&next, stored.version).await? {
            CasOutcome::Applied => {
                let credential = AccessCredential {
                    access_token: grant.access_token,
                    version: next.version,
                    expires_at: next.expires_at,
                };
                self.cache.insert(
                    StoredCredential::doc_id(&next.user_id, &next.provider),
                    credential.clone(),
                );
                tracing::info!(
                    user_id = %next.user_id,
                    provider = %next.provider,
                    version = next.version,
                    "Token refreshed"
                );
                Ok(credential)
            }
            CasOutcome::Conflict => {
                let latest = self.load(&stored.user_id, &stored.provider).await?;
                tracing::info!(
                    user_id = %stored.user_id,
                    provider = %stored.provider,
                    version = latest.version,
                    "Credential write lost race, adopting winner"
                );
                self.adopt(&latest).await
            }
        }
    }
}
