//! Upload task - streams a local source into a multipart upload
//!
//! Parts are read one at a time, hashed in stream order, and handed to the
//! worker pool. Reading stops while every slot is busy, so memory stays
//! bounded by `concurrency` parts. Any failure after the upload exists
//! stops dispatch, lets the parts already sent run out, and then aborts the
//! upload on the backend.

use crate::checksum::{ChecksumAccumulator, ContentDigest};
use crate::engine::events::EventSink;
use crate::engine::part_worker::{PartWorker, UploadedPart};
use crate::engine::pool::WorkerPool;
use crate::engine::retry::{expired, is_expired, retry, with_deadline};
use crate::error::TransferError;
use crate::integrity::IntegrityVerifier;
use crate::sequencer::PartSequencer;
use crate::store::{ObjectStore, PartId, UploadHandle};
use chrono::Utc;
use s3pipe_types::{
    ChecksumStatus, TransferConfig, TransferEvent, TransferReport, TransferState,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What the streaming phase produced
struct Streamed {
    bytes: u64,
    parts: u64,
    digest: ContentDigest,
}

/// Coordinates a single upload
pub struct UploadTask {
    store: Arc<dyn ObjectStore>,
    config: TransferConfig,
    events: EventSink,
}

impl UploadTask {
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig, events: EventSink) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    fn worker(&self) -> PartWorker {
        PartWorker::new(
            self.store.clone(),
            self.config.retry.clone(),
            self.events.clone(),
        )
    }

    /// Run the upload to completion
    pub async fn run<R: AsyncRead + Unpin>(self, source: R) -> Result<TransferReport, TransferError> {
        let started_at = Utc::now();
        let deadline = self.config.deadline.map(|d| Instant::now() + d);
        let object = self.config.object.clone();

        info!(
            "Starting upload to {} (concurrency={}, part size={})",
            object,
            self.config.concurrency,
            self.config.part_size.first_part_size()
        );

        let handle = match with_deadline(deadline, self.initiate()).await {
            Ok(handle) => handle,
            Err(e) => {
                // Nothing exists on the backend yet, so there is nothing to abort
                error!("Failed to initiate upload to {}: {}", object, e);
                self.events.state(TransferState::Aborted, Some(e.to_string()));
                return Err(e);
            }
        };
        self.events.state(TransferState::Initiated, None);
        debug!("Upload id for {}: {}", object, handle.upload_id);

        let streamed = match self.stream_and_complete(&handle, source, deadline).await {
            Ok(streamed) => streamed,
            Err(e) => {
                error!("Upload to {} failed: {}", object, e);
                self.abort(&handle).await;
                self.events.state(TransferState::Aborted, Some(e.to_string()));
                return Err(e);
            }
        };
        self.events.state(TransferState::Committed, None);

        let checksum = if self.config.verify_checksum {
            let verifier = IntegrityVerifier::new(self.store.clone(), self.config.retry.clone());
            let status = verifier.record(&object, &streamed.digest).await;
            if let ChecksumStatus::RecordFailed { reason } = &status {
                self.events.emit(TransferEvent::Degraded {
                    reason: format!("checksum not recorded: {}", reason),
                });
            }
            status
        } else {
            ChecksumStatus::Skipped
        };

        let report = TransferReport {
            direction: self.config.direction,
            object,
            bytes: streamed.bytes,
            parts: streamed.parts,
            digest: streamed.digest.to_hex(),
            checksum,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            "Upload to {} committed: {} bytes in {} parts",
            report.object, report.bytes, report.parts
        );
        Ok(report)
    }

    async fn initiate(&self) -> Result<UploadHandle, TransferError> {
        let store = &self.store;
        let object = &self.config.object;
        let headers = &self.config.headers;
        retry(&self.config.retry, "Initiate upload", |_, _| {}, || async move {
            store.initiate_upload(object, headers).await
        })
        .await
        .map_err(|exhausted| TransferError::Store(exhausted.error))
    }

    async fn stream_and_complete<R: AsyncRead + Unpin>(
        &self,
        handle: &UploadHandle,
        source: R,
        deadline: Option<Instant>,
    ) -> Result<Streamed, TransferError> {
        self.events.state(TransferState::Streaming, None);

        let mut sequencer = PartSequencer::new(source, self.config.part_size.clone());
        let mut checksum = ChecksumAccumulator::new();
        let mut pool: WorkerPool<UploadedPart> = WorkerPool::new(self.config.concurrency);
        let mut confirmed: BTreeMap<u64, PartId> = BTreeMap::new();
        let mut failure: Option<TransferError> = None;
        let mut source_done = false;

        while failure.is_none() && !source_done {
            // Backpressure: no new part is read until a slot frees up
            if !pool.has_capacity() {
                tokio::select! {
                    done = pool.next_completion() => {
                        if let Some(done) = done {
                            self.settle(done, &mut confirmed, &mut failure);
                        }
                    }
                    _ = expired(deadline) => {
                        warn!("Deadline passed with {} parts in flight", pool.in_flight());
                        failure = Some(TransferError::DeadlineExceeded);
                    }
                }
                continue;
            }

            let next = tokio::select! {
                next = sequencer.next_part() => next,
                _ = expired(deadline) => {
                    warn!("Deadline passed with {} parts in flight", pool.in_flight());
                    failure = Some(TransferError::DeadlineExceeded);
                    break;
                }
            };
            match next {
                Ok(Some(part)) => {
                    checksum.append(part.offset, &part.data);
                    self.events.emit(TransferEvent::PartDispatched {
                        sequence: part.sequence,
                        offset: part.offset,
                        len: part.len(),
                    });
                    pool.spawn(part.sequence, self.worker().upload(handle.clone(), part));
                }
                Ok(None) => source_done = true,
                Err(e) => failure = Some(e),
            }
        }

        // Parts already sent always run to their own end
        if failure.is_some() && !pool.is_idle() {
            debug!("Waiting for {} in-flight parts before aborting", pool.in_flight());
        }
        while let Some(done) = pool.next_completion().await {
            self.settle(done, &mut confirmed, &mut failure);
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if is_expired(deadline) {
            return Err(TransferError::DeadlineExceeded);
        }

        let produced = sequencer.parts_produced();
        if confirmed.keys().copied().ne(0..produced) {
            return Err(TransferError::Internal(format!(
                "{} parts produced but {} confirmed",
                produced,
                confirmed.len()
            )));
        }

        self.events.state(TransferState::Finalizing, None);
        let parts: Vec<PartId> = confirmed.into_values().collect();
        let store = &self.store;
        let parts_ref = &parts;
        let complete = async {
            retry(&self.config.retry, "Complete upload", |_, _| {}, || async move {
                store.complete_upload(handle, parts_ref).await
            })
            .await
            .map_err(|exhausted| TransferError::Store(exhausted.error))
        };
        with_deadline(deadline, complete).await?;

        Ok(Streamed {
            bytes: sequencer.bytes_read(),
            parts: produced,
            digest: checksum.finalize(),
        })
    }

    fn settle(
        &self,
        done: Result<(u64, UploadedPart), TransferError>,
        confirmed: &mut BTreeMap<u64, PartId>,
        failure: &mut Option<TransferError>,
    ) {
        match done {
            Ok((sequence, part)) => {
                self.events.emit(TransferEvent::PartConfirmed {
                    sequence,
                    len: part.len,
                });
                confirmed.insert(sequence, part.id);
            }
            Err(e) if failure.is_none() => {
                error!("Part failed, no further parts will be sent: {}", e);
                *failure = Some(e);
            }
            Err(e) => warn!("Additional part failure: {}", e),
        }
    }

    /// Best effort: the transfer has already failed
    async fn abort(&self, handle: &UploadHandle) {
        let attempt = tokio::time::timeout(
            self.config.retry.attempt_timeout,
            self.store.abort_upload(handle),
        )
        .await;
        match attempt {
            Ok(Ok(())) => info!("Aborted upload {}", handle.upload_id),
            Ok(Err(e)) => warn!("Failed to abort upload {}: {}", handle.upload_id, e),
            Err(_) => warn!("Timed out aborting upload {}", handle.upload_id),
        }
    }
}
