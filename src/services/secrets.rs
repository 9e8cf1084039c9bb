// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Secret lookup with local overrides.
//!
//! A value with the same name in the local map or the process environment
//! always wins over Secret Manager, so local runs never reach GCP.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the latest version of `name` in `scope_id` (the GCP project).
    async fn get_secret(&self, scope_id: &str, name: &str) -> Result<String>;
}

// ─── Secret Manager ──────────────────────────────────────────────────────────

use google_cloud_secretmanager_v1::client::SecretManagerService;

/// Google Secret Manager backed [`SecretStore`].
pub struct SecretManagerStore {
    client: SecretManagerService,
}

impl SecretManagerStore {
    pub async fn new() -> Result<Self> {
        let client = SecretManagerService::builder().build().await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!(
                "Failed to create Secret Manager client: {}",
                e
            ))
        })?;
        Ok(Self { client })
    }
}

/// Compare a payload against the CRC32C Secret Manager reports for it.
fn verify_crc32c(name: &str, data: &[u8], expected: Option<i64>) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = i64::from(crc32c::crc32c(data));
    if actual != expected {
        tracing::error!(secret = name, "Secret payload failed CRC32C verification");
        return Err(AppError::ChecksumMismatch(format!(
            "secret {} payload corrupted",
            name
        )));
    }
    Ok(())
}

#[async_trait]
impl SecretStore for SecretManagerStore {
    async fn get_secret(&self, scope_id: &str, name: &str) -> Result<String> {
        let resource = format!("projects/{}/secrets/{}/versions/latest", scope_id, name);

        let response = self
            .client
            .access_secret_version()
            .set_name(resource)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("Secret {} fetch failed: {}", name, e)))?;

        let payload = response
            .payload
            .ok_or_else(|| AppError::NotFound(format!("Secret {} has no payload", name)))?;

        verify_crc32c(name, &payload.data, payload.data_crc32c)?;

        String::from_utf8(payload.data.to_vec())
            .map(|s| s.trim().to_string())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Secret {} is not UTF-8: {}", name, e)))
    }
}

// ─── Resolver ────────────────────────────────────────────────────────────────

/// Resolves secrets: local map, then environment, then the remote store.
/// Remote values are cached for the life of the process.
#[derive(Clone, Default)]
pub struct SecretResolver {
    scope_id: String,
    local: HashMap<String, String>,
    read_env: bool,
    remote: Option<Arc<dyn SecretStore>>,
    cache: Arc<DashMap<String, String>>,
}

impl SecretResolver {
    /// Resolver backed by a remote store, with environment overrides.
    pub fn new(scope_id: impl Into<String>, remote: Arc<dyn SecretStore>) -> Self {
        Self {
            scope_id: scope_id.into(),
            local: HashMap::new(),
            read_env: true,
            remote: Some(remote),
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Resolver that only knows the given values.
    pub fn local_only(values: HashMap<String, String>) -> Self {
        Self {
            local: values,
            ..Self::default()
        }
    }

    /// Resolver that reads the environment only.
    pub fn from_env() -> Self {
        Self {
            read_env: true,
            ..Self::default()
        }
    }

    pub fn with_local(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.local.insert(name.into(), value.into());
        self
    }

    fn local_override(&self, name: &str) -> Option<String> {
        if let Some(value) = self.local.get(name) {
            return Some(value.clone());
        }
        if !self.read_env {
            return None;
        }
        std::env::var(name)
            .or_else(|_| std::env::var(name.to_ascii_uppercase()))
            .ok()
            .map(|v| v.trim().to_string())
    }

    pub async fn resolve(&self, name: &str) -> Result<String> {
        if let Some(value) = self.local_override(name) {
            return Ok(value);
        }
        if let Some(value) = self.cache.get(name) {
            return Ok(value.clone());
        }
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| AppError::NotFound(format!("Secret {} is not configured", name)))?;

        let value = remote.get_secret(&self.scope_id, name).await?;
        self.cache.insert(name.to_string(), value.clone());
        tracing::debug!(secret = name, "Secret loaded from Secret Manager");
        Ok(value)
    }
}
