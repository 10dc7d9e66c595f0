//! Part worker - moves one part over the network
//!
//! A worker owns its part until the store confirms it, retrying transient
//! failures. Exhausted retries become [`TransferError::PartFailed`].

use crate::engine::events::EventSink;
use crate::engine::retry::retry;
use crate::error::{StoreError, TransferError};
use crate::sequencer::Part;
use crate::store::{ByteRange, ObjectStore, PartId, UploadHandle};
use bytes::Bytes;
use s3pipe_types::{ObjectRef, RetryPolicy, TransferEvent};
use std::sync::Arc;
use tracing::debug;

/// Confirmed upload of one part
#[derive(Debug, Clone)]
pub struct UploadedPart {
    pub id: PartId,
    pub len: u64,
}

/// Transfers a single part with retries
pub struct PartWorker {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    events: EventSink,
}

impl PartWorker {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy, events: EventSink) -> Self {
        Self {
            store,
            retry,
            events,
        }
    }

    fn on_retry(&self, sequence: u64) -> impl FnMut(u32, &StoreError) + '_ {
        move |attempt: u32, error: &StoreError| {
            self.events.emit(TransferEvent::PartRetrying {
                sequence,
                attempt,
                error: error.to_string(),
            })
        }
    }

    /// PUT one part of a multipart upload
    pub async fn upload(self, handle: UploadHandle, part: Part) -> Result<UploadedPart, TransferError> {
        let sequence = part.sequence;
        let len = part.len();
        let label = format!("Upload of part {}", sequence);

        let id = retry(&self.retry, &label, self.on_retry(sequence), || {
            self.store.upload_part(&handle, sequence, part.data.clone())
        })
        .await
        .map_err(|exhausted| TransferError::PartFailed {
            sequence,
            attempts: exhausted.attempts,
            source: exhausted.error,
        })?;

        debug!("Part {} confirmed ({} bytes, etag {})", sequence, len, id.etag);
        Ok(UploadedPart { id, len })
    }

    /// GET one byte range of an object
    pub async fn fetch(
        self,
        object: ObjectRef,
        sequence: u64,
        range: ByteRange,
    ) -> Result<Bytes, TransferError> {
        let label = format!("Fetch of range {} ({}-{})", sequence, range.start, range.end);

        let store = &self.store;
        let object = &object;
        let data = retry(&self.retry, &label, self.on_retry(sequence), || async move {
            let data = store.get_object_range(object, range).await?;
            if data.len() as u64 != range.len() {
                return Err(StoreError::Protocol(format!(
                    "range {}-{} returned {} bytes",
                    range.start,
                    range.end,
                    data.len()
                )));
            }
            Ok(data)
        })
        .await
        .map_err(|exhausted| TransferError::PartFailed {
            sequence,
            attempts: exhausted.attempts,
            source: exhausted.error,
        })?;

        debug!("Range {} fetched ({} bytes)", sequence, data.len());
        Ok(data)
    }
}
