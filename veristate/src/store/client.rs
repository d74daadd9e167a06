//! Typed blob store client with deterministic keys and integrity tags.
//!
//! Writes land at keys derived from `(run_id, category, slot)`, so a
//! re-invoked stage overwrites its own previous output instead of
//! duplicating it; this is what gives the pipeline effectively-once write
//! semantics per slot. Every stored object gets an MD5 integrity tag that
//! is verified on read when the reference carries one.

use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::catalog::{object_key, Slot};
use crate::errors::{ErrorKind, Result, VeristateError};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::Reference;
use crate::store::BlobStore;

/// Typed read/write access to the blob store.
pub struct StateClient {
    store: Arc<dyn BlobStore>,
    bucket: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for StateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateClient")
            .field("bucket", &self.bucket)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Hex MD5 of `data`, used as the integrity tag.
#[must_use]
pub(crate) fn integrity_tag(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl StateClient {
    /// Creates a client against `store`, writing into `bucket`.
    #[must_use]
    pub fn new(store: Arc<dyn BlobStore>, bucket: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            retry,
        }
    }

    /// The configured state bucket.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Stores raw bytes at the deterministic key for `(run_id, slot)`.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` (with attribution) if the write is
    /// rejected after bounded retries.
    pub async fn put(&self, run_id: &str, slot: Slot, data: &[u8]) -> Result<Reference> {
        let key = object_key(run_id, slot);
        self.put_at(&key, data.to_vec(), "application/octet-stream")
            .await
            .map_err(|e| attribute(e, run_id, slot))
    }

    /// Serializes `value` to JSON and stores it at the deterministic key.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError` on serialization failure, `StoreUnavailable`
    /// on write failure; both carry attribution.
    pub async fn put_json<T: Serialize>(
        &self,
        run_id: &str,
        slot: Slot,
        value: &T,
    ) -> Result<Reference> {
        let data = serde_json::to_vec(value)
            .map_err(|e| VeristateError::schema("put_json", e.to_string()))
            .map_err(|e| attribute(e, run_id, slot))?;
        let key = object_key(run_id, slot);
        self.put_at(&key, data, "application/json")
            .await
            .map_err(|e| attribute(e, run_id, slot))
    }

    /// Stores bytes at an explicit key (used for date-partitioned variants).
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the write is rejected after bounded
    /// retries.
    pub async fn put_at(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<Reference> {
        let tag = integrity_tag(&data);
        let size = data.len() as u64;

        with_retry(&self.retry, || {
            let data = data.clone();
            async move { self.store.put(&self.bucket, key, data, content_type).await }
        })
        .await?;

        tracing::debug!(bucket = %self.bucket, key, size, "stored object");
        Ok(Reference::new(&self.bucket, key)
            .with_etag(tag)
            .with_size(size))
    }

    /// Retrieves the bytes a reference points to, verifying the integrity
    /// tag when present.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if absent, `Corrupt` on tag mismatch,
    /// `ReferenceError` if the reference itself is structurally invalid.
    pub async fn get(&self, reference: &Reference) -> Result<Vec<u8>> {
        if !reference.is_valid() {
            return Err(VeristateError::reference(
                "get",
                reference.key.clone(),
                "missing bucket or key",
            ));
        }

        let data = with_retry(&self.retry, || async {
            self.store.get(&reference.bucket, &reference.key).await
        })
        .await?;

        if let Some(ref expected) = reference.etag {
            let actual = integrity_tag(&data);
            if &actual != expected {
                return Err(VeristateError::corrupt(
                    "get",
                    reference.key.clone(),
                    expected.clone(),
                    actual,
                ));
            }
        }

        Ok(data)
    }

    /// Retrieves and deserializes the JSON a reference points to.
    ///
    /// Deserialization failure surfaces as `SchemaError`, never a silent
    /// default.
    ///
    /// # Errors
    ///
    /// As [`StateClient::get`], plus `SchemaError` on malformed JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, reference: &Reference) -> Result<T> {
        let data = self.get(reference).await?;
        serde_json::from_slice(&data).map_err(|e| {
            VeristateError::new(
                ErrorKind::Schema {
                    detail: e.to_string(),
                },
                "get_json",
            )
        })
    }
}

fn attribute(err: VeristateError, run_id: &str, slot: Slot) -> VeristateError {
    err.with_attribution(
        run_id,
        Some(slot.category().to_string()),
        Some(slot.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBlobStore;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    fn client_with_store() -> (Arc<InMemoryBlobStore>, StateClient) {
        let store = Arc::new(InMemoryBlobStore::new());
        let client = StateClient::new(
            store.clone(),
            "state",
            RetryPolicy::new().with_base_delay_ms(1),
        );
        (store, client)
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Analysis {
        verdict: String,
        discrepancies: u32,
    }

    #[tokio::test]
    async fn test_put_get_round_trip_with_integrity() {
        let (_store, client) = client_with_store();
        let reference = client
            .put("run-1", Slot::ReferenceBase64, b"image bytes")
            .await
            .unwrap();

        assert_eq!(reference.key, "run-1/images/referenceBase64");
        assert_eq!(reference.size, Some(11));
        assert!(reference.etag.is_some());

        let data = client.get(&reference).await.unwrap();
        assert_eq!(data, b"image bytes");
    }

    #[tokio::test]
    async fn test_put_json_get_json_round_trip() {
        let (_store, client) = client_with_store();
        let analysis = Analysis {
            verdict: "match".to_string(),
            discrepancies: 0,
        };

        let reference = client
            .put_json("run-1", Slot::Turn1Analysis, &analysis)
            .await
            .unwrap();
        let back: Analysis = client.get_json(&reference).await.unwrap();
        assert_eq!(back, analysis);
    }

    #[tokio::test]
    async fn test_reinvocation_overwrites_same_key() {
        let (store, client) = client_with_store();
        let first = client
            .put("run-1", Slot::CheckingBase64, b"attempt one")
            .await
            .unwrap();
        let second = client
            .put("run-1", Slot::CheckingBase64, b"attempt two")
            .await
            .unwrap();

        assert_eq!(first.key, second.key);
        assert_eq!(store.len(), 1);
        assert_eq!(client.get(&second).await.unwrap(), b"attempt two");
    }

    #[tokio::test]
    async fn test_identical_input_yields_identical_reference() {
        let (_store, client) = client_with_store();
        let a = client
            .put("run-1", Slot::Turn1Raw, b"same payload")
            .await
            .unwrap();
        let b = client
            .put("run-1", Slot::Turn1Raw, b"same payload")
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_corrupt_detection() {
        let (store, client) = client_with_store();
        let reference = client
            .put("run-1", Slot::Turn1Raw, b"original")
            .await
            .unwrap();

        // Tamper with the stored bytes behind the reference's back.
        store
            .put(
                "state",
                &reference.key,
                b"tampered".to_vec(),
                "application/octet-stream",
            )
            .await
            .unwrap();

        let err = client.get(&reference).await.unwrap_err();
        assert_eq!(err.code(), "CORRUPT");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_write_retries_through_transient_failure() {
        let (store, client) = client_with_store();
        store.fail_next(2);

        let reference = client
            .put("run-1", Slot::SystemPrompt, b"prompt")
            .await
            .unwrap();
        assert_eq!(client.get(&reference).await.unwrap(), b"prompt");
    }

    #[tokio::test]
    async fn test_failure_carries_attribution() {
        let (store, client) = client_with_store();
        store.fail_next(100);

        let err = client
            .put("run-1", Slot::SystemPrompt, b"prompt")
            .await
            .unwrap_err();
        let attribution = err.attribution.as_ref().unwrap();
        assert_eq!(attribution.run_id, "run-1");
        assert_eq!(attribution.category.as_deref(), Some("prompts"));
        assert_eq!(attribution.slot.as_deref(), Some("systemPrompt"));
    }

    #[tokio::test]
    async fn test_get_json_schema_error() {
        let (_store, client) = client_with_store();
        let reference = client
            .put("run-1", Slot::Turn1Analysis, b"not json at all")
            .await
            .unwrap();

        let err = client.get_json::<Analysis>(&reference).await.unwrap_err();
        assert_eq!(err.code(), "SCHEMA_ERROR");
    }

    #[tokio::test]
    async fn test_invalid_reference_rejected() {
        let (_store, client) = client_with_store();
        let err = client.get(&Reference::new("", "key")).await.unwrap_err();
        assert_eq!(err.code(), "REFERENCE_ERROR");
    }
}
