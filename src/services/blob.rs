// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Blob storage for encoded artifacts.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Reference to a stored object, written as `gs://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub bucket: String,
    pub key: String,
}

impl BlobRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Content-addressed location for a user's artifact.
    pub fn for_artifact(bucket: &str, user_id: &str, content_hash: &str) -> Self {
        Self::new(
            bucket,
            format!(
                "artifacts/{}/{}.frly",
                urlencoding::encode(user_id),
                content_hash
            ),
        )
    }

    pub fn parse(value: &str) -> Result<Self> {
        let rest = value
            .strip_prefix("gs://")
            .ok_or_else(|| AppError::Validation(format!("not a blob reference: {}", value)))?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::new(bucket, key))
            }
            _ => Err(AppError::Validation(format!(
                "blob reference missing bucket or key: {}",
                value
            ))),
        }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.key)
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(&self, blob: &BlobRef, bytes: Vec<u8>) -> Result<()>;
    async fn read(&self, blob: &BlobRef) -> Result<Vec<u8>>;
}

// ─── Cloud Storage ───────────────────────────────────────────────────────────

use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};

/// Google Cloud Storage backed [`BlobStore`].
#[derive(Clone)]
pub struct GcsBlobStore {
    client: Client,
}

impl GcsBlobStore {
    pub async fn new() -> Result<Self> {
        let config = ClientConfig::default().with_auth().await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to create GCS auth config: {}", e))
        })?;
        Ok(Self {
            client: Client::new(config),
        })
    }
}

fn gcs_err(context: &str, blob: &BlobRef, e: google_cloud_storage::http::Error) -> AppError {
    if let google_cloud_storage::http::Error::Response(ref response) = e {
        if response.code == 404 {
            return AppError::NotFound(format!("{}", blob));
        }
    }
    AppError::Transient(format!("{} {}: {}", context, blob, e))
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn write(&self, blob: &BlobRef, bytes: Vec<u8>) -> Result<()> {
        let size = bytes.len();
        let mut media = Media::new(blob.key.clone());
        media.content_type = "application/octet-stream".into();

        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: blob.bucket.clone(),
                    ..Default::default()
                },
                bytes,
                &UploadType::Simple(media),
            )
            .await
            .map_err(|e| gcs_err("Failed to write", blob, e))?;

        tracing::debug!(blob = %blob, size, "Blob written");
        Ok(())
    }

    async fn read(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        self.client
            .download_object(
                &GetObjectRequest {
                    bucket: blob.bucket.clone(),
                    object: blob.key.clone(),
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|e| gcs_err("Failed to read", blob, e))
    }
}

// ─── In-memory ───────────────────────────────────────────────────────────────

/// In-memory [`BlobStore`] for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Overwrite an object in place, e.g. to simulate corruption.
    pub fn put_raw(&self, blob: &BlobRef, bytes: Vec<u8>) {
        self.objects.insert(blob.to_string(), bytes);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn write(&self, blob: &BlobRef, bytes: Vec<u8>) -> Result<()> {
        self.objects.insert(blob.to_string(), bytes);
        Ok(())
    }

    async fn read(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        self.objects
            .get(&blob.to_string())
            .map(|b| b.clone())
            .ok_or_else(|| AppError::NotFound(blob.to_string()))
    }
}
