//! Storage client seam
//!
//! The transfer engine only talks to storage through [`ObjectStore`].
//! `S3Store` is the HTTP implementation used by the CLI.

#[cfg(test)]
pub(crate) mod memory;
mod s3;
mod sign;

pub use s3::{S3Config, S3Store};
pub use sign::Credentials;

use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use s3pipe_types::ObjectRef;

/// Server-side handle of an in-progress multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandle {
    pub object: ObjectRef,
    pub upload_id: String,
}

/// Identifier the backend returns for an uploaded part (the ETag on S3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartId {
    /// 0-based sequence number of the part
    pub sequence: u64,
    pub etag: String,
}

/// Half-open byte range `[start, end)` of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Result of a HEAD request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
}

/// Primitive operations of an S3-compatible object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn initiate_upload(
        &self,
        object: &ObjectRef,
        headers: &[(String, String)],
    ) -> Result<UploadHandle, StoreError>;

    async fn upload_part(
        &self,
        handle: &UploadHandle,
        sequence: u64,
        data: Bytes,
    ) -> Result<PartId, StoreError>;

    /// `parts` must be sorted by sequence number and gapless
    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: &[PartId],
    ) -> Result<(), StoreError>;

    async fn abort_upload(&self, handle: &UploadHandle) -> Result<(), StoreError>;

    async fn get_object_range(
        &self,
        object: &ObjectRef,
        range: ByteRange,
    ) -> Result<Bytes, StoreError>;

    async fn head_object(&self, object: &ObjectRef) -> Result<ObjectMeta, StoreError>;

    async fn put_object(&self, object: &ObjectRef, data: Bytes) -> Result<(), StoreError>;

    /// `Ok(None)` when the object does not exist
    async fn get_object(&self, object: &ObjectRef) -> Result<Option<Bytes>, StoreError>;
}
