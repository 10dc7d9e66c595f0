//! Shared types for s3pipe
//!
//! This crate contains the data structures shared between the
//! transfer engine and the CLI: configuration, events and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// S3 rejects multipart uploads with more parts than this.
pub const DEFAULT_MAX_PARTS: u32 = 10_000;

const MIB: u64 = 1024 * 1024;

// ============================================================================
// Transfer Types
// ============================================================================

/// Which way the bytes flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// A bucket + key pair identifying one stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// How part size evolves over a long upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PartGrowth {
    /// Every part has the initial size
    Fixed,
    /// Multiply the size by `factor` every `grow_every` parts
    Multiplicative { factor: u64 },
    /// Add `step` bytes every `grow_every` parts
    Additive { step: u64 },
}

/// Part sizing rules for one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSizePolicy {
    /// Requested size of the first part in bytes
    pub initial: u64,
    /// Lower bound for every part except the last one
    pub min: u64,
    /// Upper bound for any part
    pub max: u64,
    pub growth: PartGrowth,
    /// Number of parts between two growth steps
    pub grow_every: u32,
    /// Backend ceiling on the number of parts in one upload
    pub max_parts: u32,
}

impl PartSizePolicy {
    /// A policy with the given initial size and default growth/limits
    pub fn with_initial(initial: u64) -> Self {
        Self {
            initial,
            ..Self::default()
        }
    }

    /// Size of the first part after applying the bounds
    pub fn first_part_size(&self) -> u64 {
        self.initial.max(self.min).min(self.max).max(1)
    }

    /// Target size of the part with the given 0-based sequence number
    pub fn size_for(&self, sequence: u64) -> u64 {
        let base = self.first_part_size();
        let steps = if self.grow_every == 0 {
            0
        } else {
            sequence / self.grow_every as u64
        };

        let grown = match self.growth {
            PartGrowth::Fixed => base,
            PartGrowth::Multiplicative { factor } => {
                let mut size = base;
                for _ in 0..steps {
                    size = size.saturating_mul(factor.max(1));
                    if size >= self.max {
                        break;
                    }
                }
                size
            }
            PartGrowth::Additive { step } => base.saturating_add(step.saturating_mul(steps)),
        };

        grown.min(self.max).max(1)
    }
}

impl Default for PartSizePolicy {
    fn default() -> Self {
        Self {
            initial: 20 * MIB,
            min: 5 * MIB,
            max: 5 * 1024 * MIB,
            growth: PartGrowth::Multiplicative { factor: 2 },
            grow_every: 1000,
            max_parts: DEFAULT_MAX_PARTS,
        }
    }
}

/// Retry behaviour for a single part's network operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Timeout applied to every single attempt
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

/// Everything the engine needs to know about one transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub direction: Direction,
    pub object: ObjectRef,
    /// Number of parts in flight at once
    pub concurrency: usize,
    pub part_size: PartSizePolicy,
    /// Record the MD5 side object on upload, verify it on download
    pub verify_checksum: bool,
    /// Extra headers sent when the upload is initiated
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Whole-transfer deadline
    #[serde(default)]
    pub deadline: Option<Duration>,
}

impl TransferConfig {
    pub fn new(direction: Direction, object: ObjectRef) -> Self {
        Self {
            direction,
            object,
            concurrency: 20,
            part_size: PartSizePolicy::default(),
            verify_checksum: true,
            headers: Vec::new(),
            retry: RetryPolicy::default(),
            deadline: None,
        }
    }

    pub fn upload(object: ObjectRef) -> Self {
        Self::new(Direction::Upload, object)
    }

    pub fn download(object: ObjectRef) -> Self {
        Self::new(Direction::Download, object)
    }
}

/// Lifecycle of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Initiated,
    Streaming,
    Finalizing,
    Committed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Committed | TransferState::Aborted)
    }
}

/// What happened to the content checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChecksumStatus {
    /// Side object written after upload
    Recorded,
    /// Upload committed but the side object could not be written
    RecordFailed { reason: String },
    /// Download matched the side object
    Verified,
    /// Checksum checking was disabled
    Skipped,
}

impl ChecksumStatus {
    /// The data is in place but cannot be verified later
    pub fn is_degraded(&self) -> bool {
        matches!(self, ChecksumStatus::RecordFailed { .. })
    }
}

/// Summary of a committed transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub direction: Direction,
    pub object: ObjectRef,
    pub bytes: u64,
    pub parts: u64,
    /// Lowercase hex MD5 of the transferred content
    pub digest: String,
    pub checksum: ChecksumStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TransferReport {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.direction, self.object)?;
        writeln!(f, "  Bytes:  {}", self.bytes)?;
        writeln!(f, "  Parts:  {}", self.parts)?;
        writeln!(f, "  MD5:    {}", self.digest)?;
        match &self.checksum {
            ChecksumStatus::Recorded => write!(f, "  Check:  recorded"),
            ChecksumStatus::RecordFailed { reason } => {
                write!(f, "  Check:  NOT recorded ({})", reason)
            }
            ChecksumStatus::Verified => write!(f, "  Check:  verified"),
            ChecksumStatus::Skipped => write!(f, "  Check:  skipped"),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine while a transfer runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferEvent {
    StateChanged {
        state: TransferState,
        error: Option<String>,
    },
    /// Total size became known (downloads only)
    SizeKnown {
        total: u64,
    },
    PartDispatched {
        sequence: u64,
        offset: u64,
        len: u64,
    },
    PartConfirmed {
        sequence: u64,
        len: u64,
    },
    PartRetrying {
        sequence: u64,
        attempt: u32,
        error: String,
    },
    /// The transfer succeeded but something non-fatal went wrong
    Degraded {
        reason: String,
    },
}

/// An event tagged with the transfer that produced it
///
/// One engine runs many transfers over a single channel; `transfer` is
/// unique per engine and `object` names the remote side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferUpdate {
    pub transfer: u64,
    pub object: ObjectRef,
    pub event: TransferEvent,
}
