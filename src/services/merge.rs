// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Stream merge engine.
//!
//! Folds independent sample streams (provider metrics, wearable heart rate,
//! power meter, ...) into one [`MergedStream`] over an activity window:
//!
//! 1. Streams that do not overlap the window are dropped with a warning.
//! 2. Output offsets are the sorted, de-duplicated union of input offsets,
//!    rebased so the window starts at zero.
//! 3. A metric is only set at an offset where some stream observed it.
//!    Nothing is interpolated or zero-filled.
//! 4. Two sources reporting the same metric at the same offset are resolved
//!    by source priority.

use crate::error::{AppError, Result};
use crate::models::{CompositeSample, MergedStream, MetricKind, SampleStream};
use std::collections::BTreeMap;

/// Default slack between declared and observed duration before the observed
/// value wins.
pub const DEFAULT_DURATION_TOLERANCE_SECS: u32 = 5;

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Source names, highest priority first. Unlisted sources rank after all
    /// listed ones and are ordered by name among themselves.
    pub source_priority: Vec<String>,
    pub duration_tolerance_secs: u32,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            source_priority: Vec::new(),
            duration_tolerance_secs: DEFAULT_DURATION_TOLERANCE_SECS,
        }
    }
}

impl MergeOptions {
    pub fn with_priority<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_priority: sources.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    fn rank(&self, source: &str) -> usize {
        self.source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(usize::MAX)
    }
}

/// Which source currently owns a metric slot, for conflict resolution.
type Owner<'a> = Option<(usize, &'a str)>;

struct Row<'a> {
    sample: CompositeSample,
    owners: [Owner<'a>; MetricKind::COUNT],
}

/// Merge `streams` over the inclusive window `[window_start, window_end]`
/// (seconds relative to the activity start).
pub fn merge(
    streams: &[SampleStream],
    window_start: i64,
    window_end: i64,
    options: &MergeOptions,
) -> Result<MergedStream> {
    if window_end < window_start {
        return Err(AppError::Validation(format!(
            "merge window ends before it starts ({} > {})",
            window_start, window_end
        )));
    }
    let declared = u32::try_from(window_end - window_start)
        .map_err(|_| AppError::Validation("merge window too long".to_string()))?;

    let mut rows: BTreeMap<u32, Row<'_>> = BTreeMap::new();
    let mut non_finite = 0usize;

    for stream in streams {
        let Some((first, last)) = stream.span() else {
            tracing::debug!(source = %stream.source, "Skipping empty stream");
            continue;
        };
        if last < window_start || first > window_end {
            tracing::warn!(
                source = %stream.source,
                first_offset = first,
                last_offset = last,
                window_start,
                window_end,
                "Dropping stream that does not overlap the activity window"
            );
            continue;
        }

        let rank = options.rank(&stream.source);
        let source = stream.source.as_str();

        for sample in &stream.samples {
            if sample.offset_secs < window_start || sample.offset_secs > window_end {
                continue;
            }
            if !sample.value.is_finite() {
                non_finite += 1;
                continue;
            }
            // In range by the window check above.
            let offset = (sample.offset_secs - window_start) as u32;
            let row = rows.entry(offset).or_insert_with(|| Row {
                sample: CompositeSample::empty(offset),
                owners: [None; MetricKind::COUNT],
            });

            let slot = &mut row.owners[sample.metric.index()];
            let wins = match slot {
                None => true,
                Some(owner) => (rank, source) < *owner,
            };
            if wins {
                row.sample.set(sample.metric, sample.value);
                *slot = Some((rank, source));
            }
        }
    }

    if non_finite > 0 {
        tracing::warn!(count = non_finite, "Dropped non-finite sample values");
    }

    let samples: Vec<CompositeSample> = rows.into_values().map(|row| row.sample).collect();

    let duration_secs = match samples.last() {
        Some(last) if declared.abs_diff(last.offset_secs) > options.duration_tolerance_secs => {
            tracing::debug!(
                declared,
                observed = last.offset_secs,
                "Observed duration diverges from declared, using observed"
            );
            last.offset_secs
        }
        _ => declared,
    };

    Ok(MergedStream {
        duration_secs,
        samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sample;

    fn stream(source: &str, samples: &[(i64, MetricKind, f64)]) -> SampleStream {
        SampleStream::new(
            source,
            samples
                .iter()
                .map(|(o, m, v)| Sample::new(*o, *m, *v))
                .collect(),
        )
    }

    #[test]
    fn union_of_offsets_without_gap_filling() {
        let power = stream(
            "power",
            &[(0, MetricKind::Power, 100.0), (2, MetricKind::Power, 110.0)],
        );
        let hr = stream("hr", &[(1, MetricKind::HeartRate, 120.0)]);

        let merged = merge(&[power, hr], 0, 2, &MergeOptions::default()).unwrap();

        assert_eq!(
            merged.samples,
            vec![
                CompositeSample::empty(0).with(MetricKind::Power, 100.0),
                CompositeSample::empty(1).with(MetricKind::HeartRate, 120.0),
                CompositeSample::empty(2).with(MetricKind::Power, 110.0),
            ]
        );
        assert_eq!(merged.duration_secs, 2);
    }

    #[test]
    fn denser_stream_adds_offsets_the_sparser_one_lacks() {
        let power = stream(
            "power",
            &[(0, MetricKind::Power, 100.0), (2, MetricKind::Power, 120.0)],
        );
        let hr = stream(
            "hr",
            &[
                (0, MetricKind::HeartRate, 140.0),
                (1, MetricKind::HeartRate, 145.0),
                (2, MetricKind::HeartRate, 150.0),
            ],
        );

        let merged = merge(&[power, hr], 0, 2, &MergeOptions::default()).unwrap();

        let offsets: Vec<u32> = merged.samples.iter().map(|s| s.offset_secs).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(merged.samples[1].get(MetricKind::HeartRate), Some(145.0));
        assert_eq!(merged.samples[1].get(MetricKind::Power), None);
        assert_eq!(
            merged.samples,
            vec![
                CompositeSample::empty(0)
                    .with(MetricKind::Power, 100.0)
                    .with(MetricKind::HeartRate, 140.0),
                CompositeSample::empty(1).with(MetricKind::HeartRate, 145.0),
                CompositeSample::empty(2)
                    .with(MetricKind::Power, 120.0)
                    .with(MetricKind::HeartRate, 150.0),
            ]
        );
    }

    #[test]
    fn non_overlapping_stream_is_dropped_not_an_error() {
        let inside = stream("provider", &[(10, MetricKind::Cadence, 80.0)]);
        let outside = stream("wearable", &[(5000, MetricKind::HeartRate, 150.0)]);

        let merged = merge(&[inside, outside], 0, 20, &MergeOptions::default()).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.samples[0].get(MetricKind::HeartRate), None);
    }

    #[test]
    fn conflicts_follow_source_priority_regardless_of_input_order() {
        let wrist = stream("fitbit", &[(5, MetricKind::HeartRate, 140.0)]);
        let strap = stream("chest_strap", &[(5, MetricKind::HeartRate, 150.0)]);
        let options = MergeOptions::with_priority(["chest_strap", "fitbit"]);

        let a = merge(&[wrist.clone(), strap.clone()], 0, 10, &options).unwrap();
        let b = merge(&[strap, wrist], 0, 10, &options).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.samples[0].get(MetricKind::HeartRate), Some(150.0));
    }

    #[test]
    fn unlisted_sources_tie_break_by_name() {
        let b = stream("bravo", &[(0, MetricKind::Power, 2.0)]);
        let a = stream("alpha", &[(0, MetricKind::Power, 1.0)]);
        let merged = merge(&[b, a], 0, 0, &MergeOptions::default()).unwrap();
        assert_eq!(merged.samples[0].get(MetricKind::Power), Some(1.0));
    }

    #[test]
    fn window_is_rebased_and_clipped() {
        let s = stream(
            "provider",
            &[
                (-30, MetricKind::HeartRate, 90.0),
                (100, MetricKind::HeartRate, 130.0),
                (160, MetricKind::HeartRate, 131.0),
                (400, MetricKind::HeartRate, 100.0),
            ],
        );
        let merged = merge(&[s], 100, 160, &MergeOptions::default()).unwrap();
        let offsets: Vec<u32> = merged.samples.iter().map(|s| s.offset_secs).collect();
        assert_eq!(offsets, vec![0, 60]);
    }

    #[test]
    fn observed_duration_wins_when_far_from_declared() {
        let s = stream(
            "provider",
            &[(0, MetricKind::Speed, 3.0), (600, MetricKind::Speed, 3.1)],
        );
        let merged = merge(&[s.clone()], 0, 3600, &MergeOptions::default()).unwrap();
        assert_eq!(merged.duration_secs, 600);

        let merged = merge(&[s], 0, 603, &MergeOptions::default()).unwrap();
        assert_eq!(merged.duration_secs, 603);
    }

    #[test]
    fn observed_zero_is_kept() {
        let s = stream("power", &[(3, MetricKind::Power, 0.0)]);
        let merged = merge(&[s], 0, 3, &MergeOptions::default()).unwrap();
        assert_eq!(merged.samples[0].get(MetricKind::Power), Some(0.0));
    }

    #[test]
    fn empty_input_yields_empty_stream() {
        let merged = merge(&[], 0, 100, &MergeOptions::default()).unwrap();
        assert!(merged.is_empty());

        let merged = merge(
            &[SampleStream::new("x", vec![])],
            0,
            100,
            &MergeOptions::default(),
        )
        .unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn offsets_strictly_increase_within_duration() {
        let a = stream(
            "a",
            &[
                (7, MetricKind::Power, 1.0),
                (3, MetricKind::Power, 1.0),
                (7, MetricKind::Cadence, 90.0),
            ],
        );
        let b = stream("b", &[(3, MetricKind::HeartRate, 100.0), (9, MetricKind::HeartRate, 101.0)]);
        let merged = merge(&[a, b], 0, 9, &MergeOptions::default()).unwrap();

        assert!(merged
            .samples
            .windows(2)
            .all(|w| w[0].offset_secs < w[1].offset_secs));
        assert!(merged
            .samples
            .iter()
            .all(|s| s.offset_secs <= merged.duration_secs));
    }

    #[test]
    fn non_finite_values_are_dropped() {
        let s = stream(
            "p",
            &[(0, MetricKind::Power, f64::NAN), (1, MetricKind::Power, 5.0)],
        );
        let merged = merge(&[s], 0, 1, &MergeOptions::default()).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.samples[0].offset_secs, 1);
    }

    #[test]
    fn inverted_window_is_rejected() {
        assert!(merge(&[], 10, 0, &MergeOptions::default()).is_err());
    }
}
