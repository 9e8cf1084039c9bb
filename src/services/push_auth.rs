// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Verification of the OIDC tokens Pub/Sub attaches to push deliveries.
//!
//! A push subscription configured with a service account sends
//! `Authorization: Bearer <Google-signed ID token>` whose audience is the push
//! endpoint's base URL. Google's signing keys are fetched from the JWKS
//! endpoint and cached for the `max-age` the response advertises.

use axum::http::HeaderValue;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::header::CACHE_CONTROL;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const GOOGLE_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KEYS_TTL: Duration = Duration::from_secs(300);
const CLOCK_SKEW_SECS: u64 = 60;

/// Identity of a verified push sender.
#[derive(Debug, Clone)]
pub struct PushPrincipal {
    pub email: String,
    pub subject: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PushAuthError {
    /// Token missing, malformed, or issued to someone else.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Signing keys could not be fetched; the delivery should be retried.
    #[error("key lookup failed: {0}")]
    Transient(String),
}

enum KeySource {
    Jwks(String),
    Static {
        kid: String,
        key: Arc<DecodingKey>,
    },
}

struct CachedKeys {
    by_kid: HashMap<String, Arc<DecodingKey>>,
    expires_at: Instant,
}

pub struct PushVerifier {
    http: reqwest::Client,
    audience: String,
    service_account: String,
    source: KeySource,
    cache: RwLock<Option<CachedKeys>>,
    refresh_lock: Mutex<()>,
}

impl PushVerifier {
    /// Verifier that trusts Google's published signing keys.
    pub fn new(audience: &str, service_account: &str) -> anyhow::Result<Self> {
        Self::build(audience, service_account, KeySource::Jwks(GOOGLE_JWKS_URL.to_string()))
    }

    /// Verifier for a fixed RSA key, for local runs and tests.
    pub fn with_static_key(
        audience: &str,
        service_account: &str,
        kid: impl Into<String>,
        key: DecodingKey,
    ) -> anyhow::Result<Self> {
        let kid = kid.into();
        anyhow::ensure!(!kid.trim().is_empty(), "static key id must not be empty");
        Self::build(
            audience,
            service_account,
            KeySource::Static {
                kid,
                key: Arc::new(key),
            },
        )
    }

    fn build(audience: &str, service_account: &str, source: KeySource) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        tracing::info!(
            audience = %audience.trim_end_matches('/'),
            service_account,
            "Push OIDC verifier initialized"
        );
        Ok(Self {
            http,
            audience: audience.trim_end_matches('/').to_string(),
            service_account: service_account.to_string(),
            source,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Verify the bearer token of a push request.
    pub async fn verify(
        &self,
        authorization: Option<&HeaderValue>,
    ) -> Result<PushPrincipal, PushAuthError> {
        let token = bearer_token(authorization)?;

        let header = decode_header(token)
            .map_err(|e| PushAuthError::Forbidden(format!("invalid JWT header: {e}")))?;
        if header.alg != Algorithm::RS256 {
            return Err(PushAuthError::Forbidden(format!(
                "unexpected JWT alg: {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| PushAuthError::Forbidden("missing JWT kid".to_string()))?;
        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(&GOOGLE_ISSUERS);
        validation.set_audience(&[self.audience.as_str()]);
        validation.leeway = CLOCK_SKEW_SECS;

        let claims = decode::<PushClaims>(token, key.as_ref(), &validation)
            .map_err(|e| PushAuthError::Forbidden(format!("JWT validation failed: {e}")))?
            .claims;

        let email = claims
            .email
            .ok_or_else(|| PushAuthError::Forbidden("missing email claim".to_string()))?;
        if email != self.service_account {
            return Err(PushAuthError::Forbidden(format!(
                "unexpected service account: {email}"
            )));
        }
        if claims.email_verified != Some(true) {
            return Err(PushAuthError::Forbidden(
                "email_verified claim is not true".to_string(),
            ));
        }

        Ok(PushPrincipal {
            email,
            subject: claims.sub,
        })
    }

    async fn key_for(&self, kid: &str) -> Result<Arc<DecodingKey>, PushAuthError> {
        let jwks_url = match &self.source {
            KeySource::Static { kid: known, key } if known == kid => return Ok(key.clone()),
            KeySource::Static { .. } => {
                return Err(PushAuthError::Forbidden(format!("unknown JWT kid: {kid}")))
            }
            KeySource::Jwks(url) => url,
        };

        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }
        // Keys rotate; an unknown kid forces one refetch even if the cache is warm.
        for force in [false, true] {
            self.refresh_keys(jwks_url, force).await?;
            if let Some(key) = self.cached_key(kid).await {
                return Ok(key);
            }
        }
        Err(PushAuthError::Forbidden(format!(
            "JWT kid not found in JWKS: {kid}"
        )))
    }

    async fn cached_key(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        let now = Instant::now();
        self.cache
            .read()
            .await
            .as_ref()
            .filter(|c| c.expires_at > now)
            .and_then(|c| c.by_kid.get(kid).cloned())
    }

    async fn refresh_keys(&self, jwks_url: &str, force: bool) -> Result<(), PushAuthError> {
        let _guard = self.refresh_lock.lock().await;
        if !force
            && self
                .cache
                .read()
                .await
                .as_ref()
                .is_some_and(|c| c.expires_at > Instant::now())
        {
            return Ok(());
        }

        let response = self
            .http
            .get(jwks_url)
            .send()
            .await
            .map_err(|e| PushAuthError::Transient(format!("JWKS request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(PushAuthError::Transient(format!(
                "JWKS request returned {}",
                response.status()
            )));
        }

        let ttl = response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(max_age)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_KEYS_TTL);

        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| PushAuthError::Transient(format!("invalid JWKS JSON: {e}")))?;

        let by_kid: HashMap<_, _> = jwks
            .keys
            .into_iter()
            .filter(|k| k.kty == "RSA" && !k.kid.trim().is_empty())
            .filter(|k| k.alg.as_deref().is_none_or(|a| a == "RS256"))
            .filter_map(|k| match DecodingKey::from_rsa_components(&k.n, &k.e) {
                Ok(key) => Some((k.kid, Arc::new(key))),
                Err(e) => {
                    tracing::warn!(error = %e, kid = %k.kid, "Skipping unusable JWKS key");
                    None
                }
            })
            .collect();

        if by_kid.is_empty() {
            return Err(PushAuthError::Transient(
                "JWKS contained no usable RSA keys".to_string(),
            ));
        }

        tracing::debug!(keys = by_kid.len(), ttl_secs = ttl.as_secs(), "JWKS cache refreshed");
        *self.cache.write().await = Some(CachedKeys {
            by_kid,
            expires_at: Instant::now() + ttl,
        });
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    alg: Option<String>,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct PushClaims {
    sub: String,
    email: Option<String>,
    email_verified: Option<bool>,
}

fn bearer_token(authorization: Option<&HeaderValue>) -> Result<&str, PushAuthError> {
    let value = authorization
        .ok_or_else(|| PushAuthError::Forbidden("missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| PushAuthError::Forbidden("invalid Authorization header".to_string()))?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.is_empty() => Ok(token),
        _ => Err(PushAuthError::Forbidden(
            "Authorization header must carry a bearer token".to_string(),
        )),
    }
}

/// `max-age` from a Cache-Control header value.
fn max_age(value: &str) -> Option<u64> {
    value
        .split(',')
        .filter_map(|d| d.trim().strip_prefix("max-age="))
        .find_map(|raw| raw.trim_matches('"').parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_age_parsing() {
        assert_eq!(max_age("public, max-age=3600, must-revalidate"), Some(3600));
        assert_eq!(max_age("max-age=\"120\""), Some(120));
        assert_eq!(max_age("no-store"), None);
        assert_eq!(max_age("max-age=soon"), None);
    }

    #[test]
    fn bearer_token_requires_scheme_and_value() {
        assert!(bearer_token(None).is_err());
        assert!(bearer_token(Some(&HeaderValue::from_static("Basic abc"))).is_err());
        assert!(bearer_token(Some(&HeaderValue::from_static("Bearer "))).is_err());
        assert_eq!(
            bearer_token(Some(&HeaderValue::from_static("Bearer abc.def.ghi"))).unwrap(),
            "abc.def.ghi"
        );
    }
}
