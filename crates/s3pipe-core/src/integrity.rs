//! Content integrity
//!
//! The MD5 of an uploaded stream is kept in a side object: bucket
//! `<bucket>.md5`, key `<key>.md5`, body the lowercase hex digest.

use crate::checksum::ContentDigest;
use crate::engine::retry::retry;
use crate::error::TransferError;
use crate::store::ObjectStore;
use bytes::Bytes;
use s3pipe_types::{ChecksumStatus, ObjectRef, RetryPolicy};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where the checksum of `object` is stored
pub fn side_object_for(object: &ObjectRef) -> ObjectRef {
    ObjectRef::new(format!("{}.md5", object.bucket), format!("{}.md5", object.key))
}

/// Records and checks content digests in side objects
pub struct IntegrityVerifier {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl IntegrityVerifier {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Write the digest of a committed upload.
    ///
    /// Never fails the transfer: the object is already in place, so a
    /// failed write is reported as [`ChecksumStatus::RecordFailed`].
    pub async fn record(&self, object: &ObjectRef, digest: &ContentDigest) -> ChecksumStatus {
        let side = side_object_for(object);
        let body = Bytes::from(digest.to_hex());
        let store = &self.store;
        let side_ref = &side;

        let result = retry(&self.retry, "Checksum record", |_, _| {}, || {
            let body = body.clone();
            async move { store.put_object(side_ref, body).await }
        })
        .await;

        match result {
            Ok(()) => {
                debug!("Recorded checksum {} at {}", digest, side);
                ChecksumStatus::Recorded
            }
            Err(exhausted) => {
                warn!(
                    "Upload of {} committed but checksum could not be recorded at {}: {}",
                    object, side, exhausted.error
                );
                ChecksumStatus::RecordFailed {
                    reason: exhausted.error.to_string(),
                }
            }
        }
    }

    /// Fetch the digest recorded for `object`
    pub async fn expected(&self, object: &ObjectRef) -> Result<ContentDigest, TransferError> {
        let side = side_object_for(object);
        let store = &self.store;
        let side_ref = &side;

        let body = retry(&self.retry, "Checksum fetch", |_, _| {}, || async move {
            store.get_object(side_ref).await
        })
        .await
        .map_err(|exhausted| TransferError::Store(exhausted.error))?;

        let body = body.ok_or_else(|| TransferError::ChecksumMissing {
            bucket: side.bucket.clone(),
            key: side.key.clone(),
        })?;

        let text = std::str::from_utf8(&body).map_err(|_| invalid_record(&side))?;
        ContentDigest::from_hex(text).ok_or_else(|| invalid_record(&side))
    }

    /// Compare a computed digest against the recorded one
    pub fn verify(expected: &ContentDigest, actual: &ContentDigest) -> Result<(), TransferError> {
        if expected == actual {
            Ok(())
        } else {
            Err(TransferError::ChecksumMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            })
        }
    }
}

fn invalid_record(side: &ObjectRef) -> TransferError {
    TransferError::InvalidChecksumRecord {
        bucket: side.bucket.clone(),
        key: side.key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumAccumulator;
    use crate::store::memory::MemoryStore;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn digest_of(data: &[u8]) -> ContentDigest {
        let mut acc = ChecksumAccumulator::new();
        acc.append(0, data);
        acc.finalize()
    }

    #[test]
    fn test_side_object_location() {
        let side = side_object_for(&ObjectRef::new("photos", "2024/cat.jpg"));
        assert_eq!(side, ObjectRef::new("photos.md5", "2024/cat.jpg.md5"));
    }

    #[tokio::test]
    async fn test_record_then_expected() {
        let store = Arc::new(MemoryStore::new());
        let verifier = IntegrityVerifier::new(store.clone(), fast_retry());
        let object = ObjectRef::new("b", "k");
        let digest = digest_of(b"hello world");

        assert_eq!(verifier.record(&object, &digest).await, ChecksumStatus::Recorded);
        let stored = store.object(&side_object_for(&object)).unwrap();
        assert_eq!(&stored[..], b"5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(verifier.expected(&object).await.unwrap(), digest);
    }

    #[tokio::test]
    async fn test_record_failure_is_degraded() {
        let store = Arc::new(MemoryStore::new());
        store.reject_side_objects();
        let verifier = IntegrityVerifier::new(store, fast_retry());

        let status = verifier
            .record(&ObjectRef::new("b", "k"), &digest_of(b""))
            .await;
        assert!(status.is_degraded());
    }

    #[tokio::test]
    async fn test_missing_and_malformed_records() {
        let store = Arc::new(MemoryStore::new());
        let verifier = IntegrityVerifier::new(store.clone(), fast_retry());
        let object = ObjectRef::new("b", "k");

        assert!(matches!(
            verifier.expected(&object).await,
            Err(TransferError::ChecksumMissing { .. })
        ));

        store.insert(&side_object_for(&object), "not a digest");
        assert!(matches!(
            verifier.expected(&object).await,
            Err(TransferError::InvalidChecksumRecord { .. })
        ));
    }

    #[test]
    fn test_verify() {
        let a = digest_of(b"a");
        let b = digest_of(b"b");
        assert!(IntegrityVerifier::verify(&a, &a).is_ok());
        assert!(matches!(
            IntegrityVerifier::verify(&a, &b),
            Err(TransferError::ChecksumMismatch { .. })
        ));
    }
}
