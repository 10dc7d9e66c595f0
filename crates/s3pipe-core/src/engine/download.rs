//! Download task - parallel ranged GETs reassembled into one ordered stream
//!
//! Ranges complete in any order. They wait in a reorder buffer until every
//! earlier range has been written, so the output only ever sees a prefix of
//! the object. Dispatch never runs more than a fixed window ahead of the
//! write position, which bounds the buffer. A failure or an expired
//! deadline stops dispatch; ranges already requested still run out before
//! the error is returned.

use crate::checksum::{ChecksumAccumulator, ReorderBuffer};
use crate::engine::events::EventSink;
use crate::engine::part_worker::PartWorker;
use crate::engine::pool::WorkerPool;
use crate::engine::retry::{expired, is_expired, retry, with_deadline};
use crate::error::TransferError;
use crate::integrity::IntegrityVerifier;
use crate::sequencer::RangePlan;
use crate::store::{ObjectMeta, ObjectStore};
use bytes::Bytes;
use chrono::Utc;
use s3pipe_types::{ChecksumStatus, TransferConfig, TransferEvent, TransferReport, TransferState};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Ranges allowed in flight or buffered beyond the worker count
const LOOKAHEAD: u64 = 2;

/// Coordinates a single download
pub struct DownloadTask {
    store: Arc<dyn ObjectStore>,
    config: TransferConfig,
    events: EventSink,
}

impl DownloadTask {
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig, events: EventSink) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Run the download, writing the object to `output` in order.
    ///
    /// On a checksum mismatch everything has already been written; the
    /// caller must treat the output as invalid.
    pub async fn run<W: AsyncWrite + Unpin>(self, output: W) -> Result<TransferReport, TransferError> {
        let started_at = Utc::now();
        let deadline = self.config.deadline.map(|d| Instant::now() + d);
        let object = self.config.object.clone();

        info!(
            "Starting download of {} (concurrency={}, part size={})",
            object,
            self.config.concurrency,
            self.config.part_size.first_part_size()
        );

        match self.transfer(output, deadline).await {
            Ok((bytes, parts, digest, checksum)) => {
                self.events.state(TransferState::Committed, None);
                let report = TransferReport {
                    direction: self.config.direction,
                    object,
                    bytes,
                    parts,
                    digest,
                    checksum,
                    started_at,
                    finished_at: Utc::now(),
                };
                info!("Download of {} complete: {} bytes", report.object, report.bytes);
                Ok(report)
            }
            Err(e) => {
                error!("Download of {} failed: {}", object, e);
                self.events.state(TransferState::Aborted, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn head(&self) -> Result<ObjectMeta, TransferError> {
        let store = &self.store;
        let object = &self.config.object;
        retry(&self.config.retry, "Head object", |_, _| {}, || async move {
            store.head_object(object).await
        })
        .await
        .map_err(|exhausted| TransferError::Store(exhausted.error))
    }

    async fn transfer<W: AsyncWrite + Unpin>(
        &self,
        mut output: W,
        deadline: Option<Instant>,
    ) -> Result<(u64, u64, String, ChecksumStatus), TransferError> {
        let meta = with_deadline(deadline, self.head()).await?;
        self.events.state(TransferState::Initiated, None);
        self.events.emit(TransferEvent::SizeKnown { total: meta.size });
        debug!("{} is {} bytes", self.config.object, meta.size);

        // A missing or unreadable record fails before any byte is written
        let verifier = IntegrityVerifier::new(self.store.clone(), self.config.retry.clone());
        let expected = if self.config.verify_checksum {
            Some(with_deadline(deadline, verifier.expected(&self.config.object)).await?)
        } else {
            None
        };

        self.events.state(TransferState::Streaming, None);
        let plan = RangePlan::new(meta.size, self.config.part_size.first_part_size());
        let window = self.config.concurrency as u64 + LOOKAHEAD;
        let mut pool: WorkerPool<Bytes> = WorkerPool::new(self.config.concurrency);
        let mut reorder: ReorderBuffer<Bytes> = ReorderBuffer::new();
        let mut checksum = ChecksumAccumulator::new();
        let mut next_dispatch = 0u64;
        let mut written = 0u64;
        let mut failure: Option<TransferError> = None;

        loop {
            if failure.is_none() && is_expired(deadline) {
                warn!("Deadline passed with {} ranges in flight", pool.in_flight());
                failure = Some(TransferError::DeadlineExceeded);
            }

            while failure.is_none()
                && next_dispatch < plan.len()
                && pool.has_capacity()
                && next_dispatch < reorder.next_sequence() + window
            {
                let Some(range) = plan.range(next_dispatch) else {
                    break;
                };
                self.events.emit(TransferEvent::PartDispatched {
                    sequence: next_dispatch,
                    offset: range.start,
                    len: range.len(),
                });
                let worker = PartWorker::new(
                    self.store.clone(),
                    self.config.retry.clone(),
                    self.events.clone(),
                );
                pool.spawn(
                    next_dispatch,
                    worker.fetch(self.config.object.clone(), next_dispatch, range),
                );
                next_dispatch += 1;
            }

            // After a failure the pool only drains; ranges in flight are never dropped
            let done = if failure.is_none() {
                tokio::select! {
                    done = pool.next_completion() => done,
                    _ = expired(deadline) => continue,
                }
            } else {
                pool.next_completion().await
            };
            let Some(done) = done else {
                break;
            };

            match done {
                Ok((sequence, data)) => {
                    self.events.emit(TransferEvent::PartConfirmed {
                        sequence,
                        len: data.len() as u64,
                    });
                    if failure.is_some() {
                        continue;
                    }
                    reorder.insert(sequence, data);

                    while let Some(chunk) = reorder.pop_ready() {
                        checksum.append(written, &chunk);
                        if let Err(e) = output.write_all(&chunk).await {
                            error!("Writing output failed, no further ranges will be fetched: {}", e);
                            failure = Some(TransferError::OutputWrite(e));
                            break;
                        }
                        written += chunk.len() as u64;
                    }
                }
                Err(e) if failure.is_none() => {
                    error!("Range failed, no further ranges will be fetched: {}", e);
                    failure = Some(e);
                }
                Err(e) => warn!("Additional range failure: {}", e),
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        if written != meta.size || reorder.buffered() > 0 {
            return Err(TransferError::Internal(format!(
                "wrote {} of {} bytes",
                written, meta.size
            )));
        }
        output.flush().await.map_err(TransferError::OutputWrite)?;

        self.events.state(TransferState::Finalizing, None);
        let actual = checksum.finalize();
        let status = match expected {
            Some(expected) => {
                IntegrityVerifier::verify(&expected, &actual)?;
                debug!("Checksum verified: {}", actual);
                ChecksumStatus::Verified
            }
            None => ChecksumStatus::Skipped,
        };

        Ok((written, plan.len(), actual.to_hex(), status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::side_object_for;
    use crate::store::memory::MemoryStore;
    use md5::{Digest, Md5};
    use s3pipe_types::{ObjectRef, PartGrowth, PartSizePolicy, RetryPolicy};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn object() -> ObjectRef {
        ObjectRef::new("bucket", "data.bin")
    }

    fn config(part_size: u64, concurrency: usize) -> TransferConfig {
        let mut config = TransferConfig::download(object());
        config.concurrency = concurrency;
        config.part_size = PartSizePolicy {
            initial: part_size,
            min: 1,
            max: u64::MAX,
            growth: PartGrowth::Fixed,
            grow_every: 1000,
            max_parts: 10_000,
        };
        config.retry = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(5),
        };
        config
    }

    fn seeded(data: &[u8]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert(&object(), data.to_vec());
        store.insert(
            &side_object_for(&object()),
            hex::encode(Md5::digest(data)),
        );
        store
    }

    async fn download(
        store: &Arc<MemoryStore>,
        config: TransferConfig,
    ) -> (Result<TransferReport, TransferError>, Vec<u8>) {
        let (tx, _rx) = broadcast::channel(1024);
        let task = DownloadTask::new(store.clone(), config, EventSink::new(tx, 1, object()));
        let mut out = Vec::new();
        let result = task.run(&mut out).await;
        (result, out)
    }

    #[tokio::test]
    async fn test_download_matches_object() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let store = seeded(&data);

        let (result, out) = download(&store, config(64, 4)).await;
        let report = result.unwrap();
        assert_eq!(out, data);
        assert_eq!(report.parts, 16);
        assert_eq!(report.checksum, ChecksumStatus::Verified);
    }

    #[tokio::test]
    async fn test_out_of_order_completion() {
        let data: Vec<u8> = (0..40u8).collect();
        let store = seeded(&data);
        store.delay(0, Duration::from_millis(40));
        store.delay(10, Duration::from_millis(20));

        let (result, out) = download(&store, config(10, 4)).await;
        result.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_failed_range_is_retried() {
        let data = vec![5u8; 30];
        let store = seeded(&data);
        store.fail_range(20, 3, true);

        let (result, out) = download(&store, config(10, 2)).await;
        result.unwrap();
        assert_eq!(out, data);
        assert_eq!(store.range_calls.load(Ordering::SeqCst), 3 + 3);
    }

    #[tokio::test]
    async fn test_dispatch_stays_within_window() {
        let data = vec![1u8; 100];
        let store = seeded(&data);
        // The first range stalls; later ranges must not run far ahead of it
        store.delay(0, Duration::from_millis(50));

        let (tx, _rx) = broadcast::channel(1024);
        let mut rx = tx.subscribe();
        let task = DownloadTask::new(store.clone(), config(1, 2), EventSink::new(tx, 1, object()));
        let mut out = Vec::new();
        task.run(&mut out).await.unwrap();
        assert_eq!(out, data);

        let mut written_through = 0u64;
        let mut confirmed = std::collections::BTreeSet::new();
        while let Ok(update) = rx.try_recv() {
            match update.event {
                TransferEvent::PartConfirmed { sequence, .. } => {
                    confirmed.insert(sequence);
                    while confirmed.contains(&written_through) {
                        written_through += 1;
                    }
                }
                TransferEvent::PartDispatched { sequence, .. } => {
                    assert!(sequence < written_through + 2 + LOOKAHEAD);
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_missing_checksum_fails_before_writing() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&object(), b"unverifiable".to_vec());

        let (result, out) = download(&store, config(4, 2)).await;
        assert!(matches!(result, Err(TransferError::ChecksumMissing { .. })));
        assert!(out.is_empty());
        assert_eq!(store.range_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_checksum_can_be_disabled() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&object(), b"unverifiable".to_vec());
        let mut cfg = config(4, 2);
        cfg.verify_checksum = false;

        let (result, out) = download(&store, cfg).await;
        assert_eq!(result.unwrap().checksum, ChecksumStatus::Skipped);
        assert_eq!(out, b"unverifiable");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_output_invalid() {
        let store = seeded(b"original");
        store.insert(&object(), b"tampered".to_vec());

        let (result, out) = download(&store, config(3, 2)).await;
        let err = result.unwrap_err();
        assert!(err.output_invalid());
        assert_eq!(out, b"tampered");
    }

    #[tokio::test]
    async fn test_empty_object() {
        let store = seeded(b"");

        let (result, out) = download(&store, config(4, 2)).await;
        let report = result.unwrap();
        assert!(out.is_empty());
        assert_eq!(report.parts, 0);
        assert_eq!(report.digest, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(store.range_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = Arc::new(MemoryStore::new());
        let (result, _) = download(&store, config(4, 2)).await;
        assert!(matches!(
            result,
            Err(TransferError::Store(crate::error::StoreError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_permanent_range_failure() {
        let data = vec![2u8; 12];
        let store = seeded(&data);
        store.fail_range(4, 1, false);

        let (result, _) = download(&store, config(4, 2)).await;
        assert!(matches!(
            result,
            Err(TransferError::PartFailed { sequence: 1, attempts: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_range_finishes_after_failure() {
        let data = vec![6u8; 12];
        let store = seeded(&data);
        // Range 0 is still being fetched when range 1 fails for good
        store.delay(0, Duration::from_millis(200));
        store.fail_range(4, 1, false);

        let (result, out) = download(&store, config(4, 2)).await;
        assert!(matches!(
            result,
            Err(TransferError::PartFailed { sequence: 1, .. })
        ));
        assert_eq!(store.range_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.ranges_finished.load(Ordering::SeqCst), 2);
        // Nothing reaches the output once the transfer has failed
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_drains_ranges() {
        let data = vec![7u8; 12];
        let store = seeded(&data);
        store.delay(0, Duration::from_millis(200));
        store.delay(4, Duration::from_millis(200));
        let mut cfg = config(4, 2);
        cfg.deadline = Some(Duration::from_millis(50));

        let (result, out) = download(&store, cfg).await;
        assert!(matches!(result, Err(TransferError::DeadlineExceeded)));
        assert_eq!(store.range_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.ranges_finished.load(Ordering::SeqCst), 2);
        assert!(out.is_empty());
    }
}
