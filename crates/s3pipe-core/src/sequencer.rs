//! Part sequencing
//!
//! [`PartSequencer`] cuts a non-seekable stream of unknown length into
//! numbered parts. [`RangePlan`] does the same for an object of known size.

use crate::error::TransferError;
use crate::store::ByteRange;
use bytes::Bytes;
use s3pipe_types::PartSizePolicy;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// One contiguous piece of the logical stream
#[derive(Debug, Clone)]
pub struct Part {
    /// 0-based, gapless within a transfer
    pub sequence: u64,
    pub offset: u64,
    pub data: Bytes,
}

impl Part {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lazily reads parts from a source, one at a time
pub struct PartSequencer<R> {
    source: R,
    policy: PartSizePolicy,
    next_sequence: u64,
    offset: u64,
    finished: bool,
}

impl<R: AsyncRead + Unpin> PartSequencer<R> {
    pub fn new(source: R, policy: PartSizePolicy) -> Self {
        Self {
            source,
            policy,
            next_sequence: 0,
            offset: 0,
            finished: false,
        }
    }

    /// Bytes read from the source so far
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    /// Number of parts produced so far
    pub fn parts_produced(&self) -> u64 {
        self.next_sequence
    }

    /// Read the next part, or `None` once the source is exhausted.
    ///
    /// Reads at most the target size of the part. An empty source still
    /// yields one empty part. A short read marks the end of the stream.
    pub async fn next_part(&mut self) -> Result<Option<Part>, TransferError> {
        if self.finished {
            return Ok(None);
        }

        let sequence = self.next_sequence;
        let target = self.policy.size_for(sequence);
        let mut buf = Vec::with_capacity(target as usize);
        (&mut self.source)
            .take(target)
            .read_to_end(&mut buf)
            .await
            .map_err(TransferError::SourceRead)?;

        if (buf.len() as u64) < target {
            self.finished = true;
            // The previous part ended exactly at EOF
            if buf.is_empty() && sequence > 0 {
                return Ok(None);
            }
        }

        if sequence >= self.policy.max_parts as u64 {
            return Err(TransferError::PartLimitExceeded {
                max_parts: self.policy.max_parts,
            });
        }

        let part = Part {
            sequence,
            offset: self.offset,
            data: Bytes::from(buf),
        };
        debug!(
            "Sequenced part {} ({} bytes at offset {})",
            part.sequence,
            part.len(),
            part.offset
        );

        self.next_sequence += 1;
        self.offset += part.len();
        Ok(Some(part))
    }
}

/// Fixed-size ranges covering an object of known size
#[derive(Debug, Clone)]
pub struct RangePlan {
    total: u64,
    part_size: u64,
}

impl RangePlan {
    pub fn new(total: u64, part_size: u64) -> Self {
        Self {
            total,
            part_size: part_size.max(1),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of ranges; zero for an empty object
    pub fn len(&self) -> u64 {
        self.total.div_ceil(self.part_size)
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Range of the part with the given sequence number
    pub fn range(&self, sequence: u64) -> Option<ByteRange> {
        if sequence >= self.len() {
            return None;
        }
        let start = sequence * self.part_size;
        let end = (start + self.part_size).min(self.total);
        Some(ByteRange { start, end })
    }
}
