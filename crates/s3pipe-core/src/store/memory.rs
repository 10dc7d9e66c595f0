//! In-memory object store with fault injection, used by the engine tests

use super::{ByteRange, ObjectMeta, ObjectStore, PartId, UploadHandle};
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use s3pipe_types::ObjectRef;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct PendingUpload {
    object: ObjectRef,
    parts: BTreeMap<u64, (String, Bytes)>,
}

/// A fault armed for a part sequence or range start
#[derive(Debug, Clone, Copy)]
struct Fault {
    remaining: u32,
    retryable: bool,
}

impl Fault {
    fn trip(&mut self) -> Option<StoreError> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(if self.retryable {
            StoreError::ServerError {
                status: 503,
                message: "injected SlowDown".to_string(),
            }
        } else {
            StoreError::ServerError {
                status: 403,
                message: "injected AccessDenied".to_string(),
            }
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<ObjectRef, Bytes>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    part_faults: Mutex<HashMap<u64, Fault>>,
    range_faults: Mutex<HashMap<u64, Fault>>,
    delays: Mutex<HashMap<u64, Duration>>,
    reject_side_objects: Mutex<bool>,
    next_upload: AtomicUsize,
    pub initiate_calls: AtomicUsize,
    pub part_calls: AtomicUsize,
    pub range_calls: AtomicUsize,
    pub complete_calls: AtomicUsize,
    pub abort_calls: AtomicUsize,
    /// Part uploads that ran to completion, successful or not
    pub parts_finished: AtomicUsize,
    /// Ranged GETs that ran to completion, successful or not
    pub ranges_finished: AtomicUsize,
    /// `parts_finished` as seen by the first abort
    pub parts_finished_at_abort: Mutex<Option<usize>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: &ObjectRef, data: impl Into<Bytes>) {
        self.objects.lock().insert(object.clone(), data.into());
    }

    pub fn object(&self, object: &ObjectRef) -> Option<Bytes> {
        self.objects.lock().get(object).cloned()
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    /// Make `upload_part` for `sequence` fail the next `times` calls
    pub fn fail_part(&self, sequence: u64, times: u32, retryable: bool) {
        self.part_faults.lock().insert(
            sequence,
            Fault {
                remaining: times,
                retryable,
            },
        );
    }

    /// Make ranged GETs starting at `start` fail the next `times` calls
    pub fn fail_range(&self, start: u64, times: u32, retryable: bool) {
        self.range_faults.lock().insert(
            start,
            Fault {
                remaining: times,
                retryable,
            },
        );
    }

    /// Delay part uploads with this sequence, or ranged GETs at this offset
    pub fn delay(&self, key: u64, delay: Duration) {
        self.delays.lock().insert(key, delay);
    }

    pub fn reject_side_objects(&self) {
        *self.reject_side_objects.lock() = true;
    }

    async fn enter(&self, key: u64) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::AcqRel);
        let delay = self.delays.lock().get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        guard
    }

    fn store_part(
        &self,
        handle: &UploadHandle,
        sequence: u64,
        data: Bytes,
    ) -> Result<PartId, StoreError> {
        if let Some(err) = self
            .part_faults
            .lock()
            .get_mut(&sequence)
            .and_then(Fault::trip)
        {
            return Err(err);
        }

        let tag = etag(&data);
        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get_mut(&handle.upload_id)
            .ok_or_else(|| StoreError::Protocol("NoSuchUpload".to_string()))?;
        upload.parts.insert(sequence, (tag.clone(), data));

        Ok(PartId {
            sequence,
            etag: tag,
        })
    }

    fn read_range(&self, object: &ObjectRef, range: ByteRange) -> Result<Bytes, StoreError> {
        if let Some(err) = self
            .range_faults
            .lock()
            .get_mut(&range.start)
            .and_then(Fault::trip)
        {
            return Err(err);
        }

        let data = self.object(object).ok_or_else(|| not_found(object))?;
        let end = (range.end as usize).min(data.len());
        let start = (range.start as usize).min(end);
        Ok(data.slice(start..end))
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn etag(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

fn not_found(object: &ObjectRef) -> StoreError {
    StoreError::NotFound {
        bucket: object.bucket.clone(),
        key: object.key.clone(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn initiate_upload(
        &self,
        object: &ObjectRef,
        _headers: &[(String, String)],
    ) -> Result<UploadHandle, StoreError> {
        self.initiate_calls.fetch_add(1, Ordering::AcqRel);
        let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::AcqRel));
        self.uploads.lock().insert(
            upload_id.clone(),
            PendingUpload {
                object: object.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(UploadHandle {
            object: object.clone(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        handle: &UploadHandle,
        sequence: u64,
        data: Bytes,
    ) -> Result<PartId, StoreError> {
        self.part_calls.fetch_add(1, Ordering::AcqRel);
        let _guard = self.enter(sequence).await;
        let result = self.store_part(handle, sequence, data);
        self.parts_finished.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: &[PartId],
    ) -> Result<(), StoreError> {
        self.complete_calls.fetch_add(1, Ordering::AcqRel);
        let upload = self
            .uploads
            .lock()
            .remove(&handle.upload_id)
            .ok_or_else(|| StoreError::Protocol("NoSuchUpload".to_string()))?;

        let mut body = BytesMut::new();
        for (expected, part) in parts.iter().enumerate() {
            if part.sequence != expected as u64 {
                return Err(StoreError::Protocol("InvalidPartOrder".to_string()));
            }
            let (tag, data) = upload
                .parts
                .get(&part.sequence)
                .ok_or_else(|| StoreError::Protocol("InvalidPart".to_string()))?;
            if *tag != part.etag {
                return Err(StoreError::Protocol("InvalidPart".to_string()));
            }
            body.extend_from_slice(data);
        }

        self.objects.lock().insert(upload.object, body.freeze());
        Ok(())
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> Result<(), StoreError> {
        self.abort_calls.fetch_add(1, Ordering::AcqRel);
        self.parts_finished_at_abort
            .lock()
            .get_or_insert(self.parts_finished.load(Ordering::Acquire));
        self.uploads.lock().remove(&handle.upload_id);
        Ok(())
    }

    async fn get_object_range(
        &self,
        object: &ObjectRef,
        range: ByteRange,
    ) -> Result<Bytes, StoreError> {
        self.range_calls.fetch_add(1, Ordering::AcqRel);
        let _guard = self.enter(range.start).await;
        let result = self.read_range(object, range);
        self.ranges_finished.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn head_object(&self, object: &ObjectRef) -> Result<ObjectMeta, StoreError> {
        let data = self.object(object).ok_or_else(|| not_found(object))?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            etag: Some(etag(&data)),
            content_type: None,
        })
    }

    async fn put_object(&self, object: &ObjectRef, data: Bytes) -> Result<(), StoreError> {
        if *self.reject_side_objects.lock() && object.bucket.ends_with(".md5") {
            return Err(StoreError::ServerError {
                status: 403,
                message: "injected AccessDenied".to_string(),
            });
        }
        self.insert(object, data);
        Ok(())
    }

    async fn get_object(&self, object: &ObjectRef) -> Result<Option<Bytes>, StoreError> {
        Ok(self.object(object))
    }
}
