// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Time-series telemetry models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric carried by a sample. Declaration order is the canonical field order
/// used by the binary encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Watts
    Power,
    /// Beats per minute
    HeartRate,
    /// Revolutions or steps per minute
    Cadence,
    /// Metres per second
    Speed,
    /// Metres above sea level
    Altitude,
    /// Cumulative metres
    Distance,
}

impl MetricKind {
    pub const COUNT: usize = 6;

    pub const ALL: [MetricKind; Self::COUNT] = [
        MetricKind::Power,
        MetricKind::HeartRate,
        MetricKind::Cadence,
        MetricKind::Speed,
        MetricKind::Altitude,
        MetricKind::Distance,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit assigned to this metric in a record's presence mask.
    pub fn bit(self) -> u8 {
        1 << self.index()
    }
}

/// One raw reading from one provider. The offset is relative to the activity
/// start and may be negative when a wearable started recording early.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub offset_secs: i64,
    pub metric: MetricKind,
    pub value: f64,
}

impl Sample {
    pub fn new(offset_secs: i64, metric: MetricKind, value: f64) -> Self {
        Self {
            offset_secs,
            metric,
            value,
        }
    }
}

/// A raw series from a single source, e.g. a power meter or a wrist HR sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleStream {
    pub source: String,
    pub samples: Vec<Sample>,
}

impl SampleStream {
    pub fn new(source: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            source: source.into(),
            samples,
        }
    }

    /// Inclusive offset range covered by this stream.
    pub fn span(&self) -> Option<(i64, i64)> {
        let min = self.samples.iter().map(|s| s.offset_secs).min()?;
        let max = self.samples.iter().map(|s| s.offset_secs).max()?;
        Some((min, max))
    }
}

/// All metrics known at one offset. `None` means the metric was not observed,
/// which is different from an observed zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeSample {
    pub offset_secs: u32,
    pub values: [Option<f64>; MetricKind::COUNT],
}

impl CompositeSample {
    pub fn empty(offset_secs: u32) -> Self {
        Self {
            offset_secs,
            values: [None; MetricKind::COUNT],
        }
    }

    pub fn get(&self, metric: MetricKind) -> Option<f64> {
        self.values[metric.index()]
    }

    pub fn set(&mut self, metric: MetricKind, value: f64) {
        self.values[metric.index()] = Some(value);
    }

    pub fn with(mut self, metric: MetricKind, value: f64) -> Self {
        self.set(metric, value);
        self
    }

    /// Presence mask with one bit per observed metric.
    pub fn mask(&self) -> u8 {
        MetricKind::ALL
            .iter()
            .filter(|m| self.get(**m).is_some())
            .fold(0, |mask, m| mask | m.bit())
    }
}

/// Unified stream produced by the merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MergedStream {
    pub duration_secs: u32,
    pub samples: Vec<CompositeSample>,
}

impl MergedStream {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Header metadata written into an encoded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    pub start_time: DateTime<Utc>,
    pub duration_secs: u32,
}

/// Description of an artifact after it has been encoded and stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedArtifact {
    pub start_time: DateTime<Utc>,
    pub duration_secs: u32,
    pub sample_count: u32,
    /// Hex SHA-256 of the encoded bytes
    pub checksum: String,
}
