// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Binary container for merged activity streams.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! magic         "FRLY"          4 bytes
//! version       u8              1 byte
//! start_time    i64 unix secs   8 bytes
//! start_nanos   u32             4 bytes
//! duration      u32 secs        4 bytes
//! record_count  u32             4 bytes
//! records       offset u32, presence mask u8, then one f64 per set bit
//!               in MetricKind order
//! checksum      SHA-256 of everything above, 32 bytes
//! ```
//!
//! Decoding checks the trailer before looking at anything else, so a flipped
//! byte anywhere (header, records or trailer) is reported as a checksum
//! mismatch rather than as garbage data.

use crate::error::AppError;
use crate::models::{ArtifactMeta, CompositeSample, MergedStream, MetricKind};
use chrono::DateTime;
use sha2::{Digest, Sha256};

pub const MAGIC: &[u8; 4] = b"FRLY";
pub const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 8 + 4 + 4 + 4;
const CHECKSUM_LEN: usize = 32;
const KNOWN_MASK_BITS: u8 = (1 << MetricKind::COUNT) - 1;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    #[error("artifact checksum does not match contents")]
    ChecksumMismatch,

    #[error("artifact shorter than minimum size ({0} bytes)")]
    Truncated(usize),

    #[error("not a recognized artifact (bad magic)")]
    UnknownFormat,

    #[error("unsupported artifact version {0}")]
    UnsupportedVersion(u8),

    #[error("offset {offset} does not follow previous offset {previous}")]
    NonIncreasingOffset { previous: u32, offset: u32 },

    #[error("offset {offset} exceeds duration {duration}")]
    OffsetBeyondDuration { offset: u32, duration: u32 },

    #[error("non-finite value for {metric:?} at offset {offset}")]
    NonFiniteValue { offset: u32, metric: MetricKind },

    #[error("record at offset {offset} has unknown mask bits {mask:#04x}")]
    UnknownMaskBits { offset: u32, mask: u8 },

    #[error("record section malformed: {0}")]
    Malformed(&'static str),

    #[error("too many records ({0})")]
    TooManyRecords(usize),

    #[error("artifact duration {meta}s differs from stream duration {stream}s")]
    DurationMismatch { meta: u32, stream: u32 },
}

impl From<CodecError> for AppError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ChecksumMismatch | CodecError::Truncated(_) => {
                AppError::ChecksumMismatch(err.to_string())
            }
            _ => AppError::EncodingContract(err.to_string()),
        }
    }
}

/// Hex SHA-256 of an encoded artifact, used as its content address.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Check the stream against the encoding contract without producing bytes.
pub fn validate(stream: &MergedStream) -> Result<(), CodecError> {
    let mut previous: Option<u32> = None;
    for sample in &stream.samples {
        if let Some(previous) = previous {
            if sample.offset_secs <= previous {
                return Err(CodecError::NonIncreasingOffset {
                    previous,
                    offset: sample.offset_secs,
                });
            }
        }
        if sample.offset_secs > stream.duration_secs {
            return Err(CodecError::OffsetBeyondDuration {
                offset: sample.offset_secs,
                duration: stream.duration_secs,
            });
        }
        for metric in MetricKind::ALL {
            if sample.get(metric).is_some_and(|v| !v.is_finite()) {
                return Err(CodecError::NonFiniteValue {
                    offset: sample.offset_secs,
                    metric,
                });
            }
        }
        previous = Some(sample.offset_secs);
    }
    Ok(())
}

/// Encode a merged stream. `meta` must describe the same duration as the stream.
pub fn encode(meta: &ArtifactMeta, stream: &MergedStream) -> Result<Vec<u8>, CodecError> {
    if meta.duration_secs != stream.duration_secs {
        return Err(CodecError::DurationMismatch {
            meta: meta.duration_secs,
            stream: stream.duration_secs,
        });
    }
    validate(stream)?;
    let record_count =
        u32::try_from(stream.len()).map_err(|_| CodecError::TooManyRecords(stream.len()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + stream.len() * 13 + CHECKSUM_LEN);
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&meta.start_time.timestamp().to_be_bytes());
    out.extend_from_slice(&meta.start_time.timestamp_subsec_nanos().to_be_bytes());
    out.extend_from_slice(&stream.duration_secs.to_be_bytes());
    out.extend_from_slice(&record_count.to_be_bytes());

    for sample in &stream.samples {
        out.extend_from_slice(&sample.offset_secs.to_be_bytes());
        out.push(sample.mask());
        for metric in MetricKind::ALL {
            if let Some(value) = sample.get(metric) {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
    }

    let checksum = Sha256::digest(&out);
    out.extend_from_slice(&checksum);
    Ok(out)
}

/// Decode an artifact produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<(ArtifactMeta, MergedStream), CodecError> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(CodecError::Truncated(HEADER_LEN + CHECKSUM_LEN));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != trailer {
        return Err(CodecError::ChecksumMismatch);
    }

    let mut reader = Reader::new(body);
    if reader.take(4)? != MAGIC {
        return Err(CodecError::UnknownFormat);
    }
    let version = reader.u8()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let start_secs = reader.i64()?;
    let start_nanos = reader.u32()?;
    let start_time = DateTime::from_timestamp(start_secs, start_nanos)
        .ok_or(CodecError::Malformed("start time out of range"))?;
    let duration_secs = reader.u32()?;
    let record_count = reader.u32()? as usize;

    let mut samples = Vec::with_capacity(record_count.min(reader.remaining() / 5));
    for _ in 0..record_count {
        let offset = reader.u32()?;
        let mask = reader.u8()?;
        if mask & !KNOWN_MASK_BITS != 0 {
            return Err(CodecError::UnknownMaskBits { offset, mask });
        }
        let mut sample = CompositeSample::empty(offset);
        for metric in MetricKind::ALL {
            if mask & metric.bit() != 0 {
                sample.set(metric, reader.f64()?);
            }
        }
        samples.push(sample);
    }
    if reader.remaining() != 0 {
        return Err(CodecError::Malformed("trailing bytes after records"));
    }

    let stream = MergedStream {
        duration_secs,
        samples,
    };
    validate(&stream)?;

    Ok((
        ArtifactMeta {
            start_time,
            duration_secs,
        },
        stream,
    ))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Malformed("record section ends early"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_be_bytes(self.array()?))
    }
}
