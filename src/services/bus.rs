// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Event bus used to hand work from one pipeline stage to the next.
//!
//! Delivery is at-least-once with no ordering across topics. Consumers must be
//! idempotent.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `data` and return the message ID assigned by the bus.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String>;
}

/// Serialize `event` as JSON and publish it.
pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn EventBus,
    topic: &str,
    event: &T,
) -> Result<String> {
    let data = serde_json::to_vec(event)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize event: {}", e)))?;
    bus.publish(topic, data).await
}

// ─── Cloud Pub/Sub ───────────────────────────────────────────────────────────

/// Cloud Pub/Sub backed [`EventBus`]. Publishers are created lazily per topic.
pub struct PubSubBus {
    client: Client,
    publishers: DashMap<String, Publisher>,
}

impl PubSubBus {
    pub async fn new() -> Result<Self> {
        let config = ClientConfig::default().with_auth().await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to create Pub/Sub auth config: {}", e))
        })?;
        let client = Client::new(config).await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to create Pub/Sub client: {}", e))
        })?;
        Ok(Self {
            client,
            publishers: DashMap::new(),
        })
    }

    fn publisher(&self, topic: &str) -> Publisher {
        self.publishers
            .entry(topic.to_string())
            .or_insert_with(|| self.client.topic(topic).new_publisher(None))
            .clone()
    }

    /// Flush and stop every publisher.
    pub async fn shutdown(&self) {
        let publishers: Vec<Publisher> = self.publishers.iter().map(|p| p.clone()).collect();
        self.publishers.clear();
        for mut publisher in publishers {
            publisher.shutdown().await;
        }
    }
}

#[async_trait]
impl EventBus for PubSubBus {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String> {
        let awaiter = self
            .publisher(topic)
            .publish(PubsubMessage {
                data,
                ..Default::default()
            })
            .await;

        let message_id = awaiter
            .get()
            .await
            .map_err(|status| AppError::Transient(format!("Publish to {} failed: {}", topic, status)))?;

        tracing::debug!(topic, message_id = %message_id, "Event published");
        Ok(message_id)
    }
}

// ─── In-memory ───────────────────────────────────────────────────────────────

/// A message captured by [`MemoryBus`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub message_id: String,
    pub data: Vec<u8>,
}

/// In-memory [`EventBus`] that records everything published.
#[derive(Clone, Default)]
pub struct MemoryBus {
    messages: Arc<Mutex<Vec<PublishedMessage>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn messages_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String> {
        let mut messages = self.messages.lock().await;
        let message_id = format!("mem-{}", messages.len() + 1);
        messages.push(PublishedMessage {
            topic: topic.to_string(),
            message_id: message_id.clone(),
            data,
        });
        Ok(message_id)
    }
}
