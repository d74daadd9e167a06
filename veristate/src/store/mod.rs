//! Durable store boundaries: blob store and table store traits.
//!
//! The crate owns only these traits plus in-memory backends for tests and
//! local runs; production bindings (object storage, a conditional-put
//! table) live outside and implement the same contracts.

mod client;

pub use client::StateClient;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::{Result, VeristateError};
use crate::status::{ErrorInfo, Stage, VerificationStatus};
use crate::utils::Timestamp;

/// Raw blob storage addressed by `(bucket, key)`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes `data` at `key`, overwriting any existing object.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the backing store rejects the write;
    /// data is never silently dropped.
    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>, content_type: &str)
        -> Result<()>;

    /// Reads the object at `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object is absent, `StoreUnavailable` on
    /// backend failure.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// In-memory blob store backend with failure injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
    failures_remaining: AtomicUsize,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` operations fail with `StoreUnavailable`.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// True when an object exists at `bucket`/`key`.
    #[must_use]
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects.contains_key(&compose(bucket, key))
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn compose(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> Result<()> {
        if self.take_failure() {
            return Err(VeristateError::store_unavailable(
                "put",
                "injected backend failure",
                1,
            ));
        }
        self.objects.insert(compose(bucket, key), data);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        if self.take_failure() {
            return Err(VeristateError::store_unavailable(
                "get",
                "injected backend failure",
                1,
            ));
        }
        self.objects
            .get(&compose(bucket, key))
            .map(|entry| entry.clone())
            .ok_or_else(|| VeristateError::not_found("get", bucket, key))
    }
}

/// The final/failed status record finalize stages persist, keyed by run id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    /// Run the record belongs to.
    pub run_id: String,
    /// Terminal (or failure-branch) status being persisted.
    pub status: VerificationStatus,
    /// Stage responsible, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Error report, present for failed runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// When the record was written.
    pub updated_at: Timestamp,
}

/// Conditional-put table keyed by run id.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Reads the record for `run_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` on backend failure.
    async fn get(&self, table: &str, run_id: &str) -> Result<Option<StatusRecord>>;

    /// Writes `record` only if the current status for its run id matches
    /// `expected` (`None` meaning no record exists). Returns whether the
    /// write was applied.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` on backend failure.
    async fn put_if(
        &self,
        table: &str,
        record: StatusRecord,
        expected: Option<VerificationStatus>,
    ) -> Result<bool>;
}

/// In-memory table store backend.
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    records: DashMap<String, StatusRecord>,
}

impl InMemoryTableStore {
    /// Creates an empty table store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn get(&self, table: &str, run_id: &str) -> Result<Option<StatusRecord>> {
        Ok(self
            .records
            .get(&compose(table, run_id))
            .map(|entry| entry.clone()))
    }

    async fn put_if(
        &self,
        table: &str,
        record: StatusRecord,
        expected: Option<VerificationStatus>,
    ) -> Result<bool> {
        let key = compose(table, &record.run_id);
        // The entry guard keeps check-and-set atomic per run id.
        let entry = self.records.entry(key);
        match (entry, expected) {
            (Entry::Vacant(slot), None) => {
                slot.insert(record);
                Ok(true)
            }
            (Entry::Vacant(_), Some(_)) => Ok(false),
            (Entry::Occupied(mut slot), Some(status)) => {
                if slot.get().status == status {
                    slot.insert(record);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            (Entry::Occupied(_), None) => Ok(false),
        }
    }
}

/// Persists `record` under the forward-only status rule.
///
/// The current record is read and the write applied only when the move is
/// legal, so a stale retry can never overwrite an already-`COMPLETED`
/// record with a failure. Returns whether the record was written.
///
/// # Errors
///
/// Returns backend errors from the table store.
pub async fn persist_status(
    store: &dyn TableStore,
    table: &str,
    record: StatusRecord,
) -> Result<bool> {
    loop {
        let current = store.get(table, &record.run_id).await?;
        let expected = match &current {
            Some(existing) => {
                if !existing.status.can_transition(record.status) {
                    tracing::warn!(
                        run_id = %record.run_id,
                        current = %existing.status,
                        requested = %record.status,
                        "refusing backward status write"
                    );
                    return Ok(false);
                }
                Some(existing.status)
            }
            None => None,
        };

        if store.put_if(table, record.clone(), expected).await? {
            return Ok(true);
        }
        // Conditional put lost a race; re-read and re-check.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;

    fn record(run_id: &str, status: VerificationStatus) -> StatusRecord {
        StatusRecord {
            run_id: run_id.to_string(),
            status,
            stage: None,
            error: None,
            updated_at: now_utc(),
        }
    }

    #[tokio::test]
    async fn test_blob_store_put_get() {
        let store = InMemoryBlobStore::new();
        store
            .put("b", "k", b"data".to_vec(), "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(store.get("b", "k").await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_blob_store_get_missing_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = store.get("b", "absent").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_blob_store_overwrites_same_key() {
        let store = InMemoryBlobStore::new();
        store
            .put("b", "k", b"v1".to_vec(), "application/json")
            .await
            .unwrap();
        store
            .put("b", "k", b"v2".to_vec(), "application/json")
            .await
            .unwrap();
        assert_eq!(store.get("b", "k").await.unwrap(), b"v2");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection_is_transient() {
        let store = InMemoryBlobStore::new();
        store.fail_next(1);
        let err = store
            .put("b", "k", b"data".to_vec(), "application/json")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
        assert!(err.is_retryable());
        // Next attempt succeeds.
        store
            .put("b", "k", b"data".to_vec(), "application/json")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_table_conditional_put() {
        let store = InMemoryTableStore::new();
        let first = record("run-1", VerificationStatus::Turn1Processed);

        assert!(store.put_if("t", first.clone(), None).await.unwrap());
        // Wrong expectation is refused.
        assert!(!store
            .put_if(
                "t",
                record("run-1", VerificationStatus::Completed),
                Some(VerificationStatus::Initialized),
            )
            .await
            .unwrap());
        // Matching expectation applies.
        assert!(store
            .put_if(
                "t",
                record("run-1", VerificationStatus::Completed),
                Some(VerificationStatus::Turn1Processed),
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_persist_status_refuses_completed_overwrite() {
        let store = InMemoryTableStore::new();
        persist_status(&store, "t", record("run-1", VerificationStatus::Completed))
            .await
            .unwrap();

        let applied = persist_status(
            &store,
            "t",
            record("run-1", VerificationStatus::VerificationFailed),
        )
        .await
        .unwrap();

        assert!(!applied);
        let current = store.get("t", "run-1").await.unwrap().unwrap();
        assert_eq!(current.status, VerificationStatus::Completed);
    }

    #[tokio::test]
    async fn test_persist_status_forward_move_applies() {
        let store = InMemoryTableStore::new();
        persist_status(&store, "t", record("run-2", VerificationStatus::FailedAtTurn1))
            .await
            .unwrap();

        let applied = persist_status(
            &store,
            "t",
            record("run-2", VerificationStatus::VerificationFailed),
        )
        .await
        .unwrap();

        assert!(applied);
        let current = store.get("t", "run-2").await.unwrap().unwrap();
        assert_eq!(current.status, VerificationStatus::VerificationFailed);
    }
}
