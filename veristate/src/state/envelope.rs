//! The envelope exchanged between pipeline stages, and its manager.
//!
//! Stages share no memory; the envelope is the message that travels
//! through the orchestrator, carrying the run's status, named slot
//! entries (inline payloads or references), and free-form summary
//! scalars. Every stage loads it, mutates it through [`EnvelopeManager`],
//! and returns the new version.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::catalog::{dated_object_key, Category, Slot};
use crate::errors::{Result, VeristateError};
use crate::state::codec::{HybridCodec, SlotEntry};
use crate::state::reference::Reference;
use crate::status::VerificationStatus;
use crate::store::StateClient;
use crate::utils::{now_utc, Timestamp};

/// The inter-stage message for one run.
///
/// Passed by value between stages; no stage retains a live handle to
/// another stage's copy. Reference names are unique; ordering is
/// irrelevant (a `BTreeMap` keeps serialization deterministic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "verificationId")]
    run_id: String,
    status: VerificationStatus,
    #[serde(default)]
    references: BTreeMap<String, SlotEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    summary: BTreeMap<String, serde_json::Value>,
    #[serde(default = "now_utc")]
    created_at: Timestamp,
    #[serde(default = "now_utc")]
    updated_at: Timestamp,
}

impl Envelope {
    /// Creates an envelope for a new run at `INITIALIZED` with an empty
    /// reference map.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = now_utc();
        Self {
            run_id: run_id.into(),
            status: VerificationStatus::Initialized,
            references: BTreeMap::new(),
            summary: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The run this envelope belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The run's current status.
    #[must_use]
    pub const fn status(&self) -> VerificationStatus {
        self.status
    }

    /// When the envelope was created.
    #[must_use]
    pub const fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// When the envelope last changed.
    #[must_use]
    pub const fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// Advances status under the forward-only rule. Re-entry onto the
    /// current status is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` on any backward or undefined move.
    pub fn set_status(&mut self, to: VerificationStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition(to) {
            return Err(VeristateError::illegal_transition(
                "set_status",
                self.status.to_string(),
                to.to_string(),
            )
            .with_attribution(self.run_id.clone(), None, None));
        }
        self.status = to;
        self.updated_at = now_utc();
        Ok(())
    }

    /// Registers a slot entry under its canonical name, replacing any
    /// previous entry for the same name (last writer wins).
    pub fn insert_entry(&mut self, name: impl Into<String>, entry: SlotEntry) {
        self.references.insert(name.into(), entry);
        self.updated_at = now_utc();
    }

    /// The entry registered under `name`, if any.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&SlotEntry> {
        self.references.get(name)
    }

    /// True when any entry (inline or stored) is registered under `name`.
    #[must_use]
    pub fn has_reference(&self, name: &str) -> bool {
        self.references.contains_key(name)
    }

    /// The reference registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns `ReferenceError` if the slot was never written or carries
    /// an inline payload instead of a reference.
    pub fn get_reference(&self, name: &str) -> Result<&Reference> {
        match self.references.get(name) {
            None => Err(VeristateError::reference(
                "get_reference",
                name,
                "slot has not been written",
            )
            .with_attribution(self.run_id.clone(), None, Some(name.to_string()))),
            Some(SlotEntry::Inline { .. }) => Err(VeristateError::reference(
                "get_reference",
                name,
                "slot is carried inline and has no reference",
            )
            .with_attribution(self.run_id.clone(), None, Some(name.to_string()))),
            Some(SlotEntry::Stored(reference)) => Ok(reference),
        }
    }

    /// Adds a scalar to the summary map, replacing any previous value.
    pub fn add_summary(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.summary.insert(key.into(), value.into());
        self.updated_at = now_utc();
    }

    /// The summary value under `key`, if any.
    #[must_use]
    pub fn summary(&self, key: &str) -> Option<&serde_json::Value> {
        self.summary.get(key)
    }

    /// All registered entry names, sorted.
    #[must_use]
    pub fn entry_names(&self) -> Vec<&str> {
        self.references.keys().map(String::as_str).collect()
    }

    /// Distinct category prefixes present in the reference map, sorted.
    /// Diagnostic helper; names not following `category_slot` are skipped.
    #[must_use]
    pub fn list_categories(&self) -> Vec<Category> {
        self.references
            .keys()
            .filter_map(|name| name.split('_').next())
            .filter_map(|prefix| prefix.parse().ok())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// References whose names carry the given category prefix.
    #[must_use]
    pub fn references_by_category(&self, category: Category) -> BTreeMap<&str, &Reference> {
        let prefix = format!("{category}_");
        self.references
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .filter_map(|(name, entry)| entry.reference().map(|r| (name.as_str(), r)))
            .collect()
    }

    /// Structural validation of the envelope.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty run id or any structurally
    /// invalid stored reference.
    pub fn validate(&self) -> Result<()> {
        if self.run_id.is_empty() {
            return Err(VeristateError::validation("validate", "run id is required"));
        }
        for (name, entry) in &self.references {
            if let Some(reference) = entry.reference() {
                if !reference.is_valid() {
                    return Err(VeristateError::reference(
                        "validate",
                        name,
                        "missing bucket or key",
                    )
                    .with_attribution(self.run_id.clone(), None, Some(name.clone())));
                }
            }
        }
        Ok(())
    }

    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError` on serialization failure.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| VeristateError::schema("to_json", e.to_string()))
    }

    /// Deserializes an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError` on malformed input.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| VeristateError::schema("from_json", e.to_string()))
    }
}

/// Manages one envelope for the duration of a single stage invocation.
///
/// Sub-operations against the blob store may run in parallel, but every
/// envelope mutation goes through one critical section so concurrent slot
/// writes never lose an update. The lock is never held across an await.
pub struct EnvelopeManager {
    client: Arc<StateClient>,
    codec: HybridCodec,
    envelope: Mutex<Envelope>,
}

impl std::fmt::Debug for EnvelopeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeManager")
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl EnvelopeManager {
    /// Wraps an existing envelope (the usual mid-pipeline case).
    #[must_use]
    pub fn new(client: Arc<StateClient>, codec: HybridCodec, envelope: Envelope) -> Self {
        Self {
            client,
            codec,
            envelope: Mutex::new(envelope),
        }
    }

    /// Creates a manager around a fresh envelope for a new run.
    #[must_use]
    pub fn create(client: Arc<StateClient>, codec: HybridCodec, run_id: impl Into<String>) -> Self {
        Self::new(client, codec, Envelope::new(run_id))
    }

    /// The run this manager's envelope belongs to.
    #[must_use]
    pub fn run_id(&self) -> String {
        self.envelope.lock().run_id().to_string()
    }

    /// A point-in-time copy of the envelope.
    #[must_use]
    pub fn snapshot(&self) -> Envelope {
        self.envelope.lock().clone()
    }

    /// Consumes the manager, returning the envelope to hand back to the
    /// orchestrator.
    #[must_use]
    pub fn into_envelope(self) -> Envelope {
        self.envelope.into_inner()
    }

    /// Saves a JSON value into `slot`, routing through the hybrid codec:
    /// small payloads are inlined in the envelope, large ones written to
    /// the store under the run's date-partitioned key with only the
    /// reference registered. The entry lands under the canonical
    /// `category_slot` name.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError` or `StoreUnavailable` with the failing
    /// `(run_id, category, slot)` attribution.
    pub async fn save_json<T: Serialize>(&self, slot: Slot, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)
            .map_err(|e| VeristateError::schema("save_json", e.to_string()))
            .map_err(|e| self.attribute(e, slot))?;
        self.save_encoded(slot, data, "application/json").await
    }

    /// Saves raw bytes into `slot` through the hybrid codec.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` with attribution on write failure.
    pub async fn save_bytes(&self, slot: Slot, data: Vec<u8>) -> Result<()> {
        self.save_encoded(slot, data, "application/octet-stream")
            .await
    }

    async fn save_encoded(&self, slot: Slot, data: Vec<u8>, content_type: &str) -> Result<()> {
        let name = slot.reference_name();

        let entry = if self.codec.should_inline(data.len()) {
            tracing::debug!(slot = %slot, size = data.len(), "inlining payload");
            SlotEntry::inline(&data)
        } else {
            let (run_id, date) = {
                let envelope = self.envelope.lock();
                (
                    envelope.run_id().to_string(),
                    envelope.created_at().date_naive(),
                )
            };
            let key = dated_object_key(date, &run_id, slot);
            let reference = self
                .client
                .put_at(&key, data, content_type)
                .await
                .map_err(|e| self.attribute(e, slot))?;
            SlotEntry::Stored(reference)
        };

        self.envelope.lock().insert_entry(name, entry);
        Ok(())
    }

    /// The reference registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns `ReferenceError` for unwritten or inline slots.
    pub fn get_reference(&self, name: &str) -> Result<Reference> {
        self.envelope.lock().get_reference(name).cloned()
    }

    /// Loads the payload bytes for `name`, inverting the codec decision:
    /// inline entries are decoded in place, stored entries fetched through
    /// the blob store client.
    ///
    /// # Errors
    ///
    /// Returns `ReferenceError` for unwritten slots, plus any store/
    /// integrity error for stored entries.
    pub async fn load_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let entry = {
            let envelope = self.envelope.lock();
            envelope.entry(name).cloned().ok_or_else(|| {
                VeristateError::reference("load_bytes", name, "slot has not been written")
                    .with_attribution(envelope.run_id(), None, Some(name.to_string()))
            })?
        };

        match entry {
            SlotEntry::Inline { .. } => entry.inline_bytes().map(|bytes| {
                bytes.unwrap_or_default() // inline variant always yields Some
            }),
            SlotEntry::Stored(reference) => self.client.get(&reference).await,
        }
    }

    /// Loads and deserializes the JSON payload for `name`.
    ///
    /// # Errors
    ///
    /// As [`EnvelopeManager::load_bytes`], plus `SchemaError` on malformed
    /// JSON.
    pub async fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let data = self.load_bytes(name).await?;
        serde_json::from_slice(&data)
            .map_err(|e| VeristateError::schema("load_json", e.to_string()))
    }

    /// Reads back arbitrary JSON through a reference (for references that
    /// arrived from outside this envelope).
    ///
    /// # Errors
    ///
    /// As [`StateClient::get_json`].
    pub async fn retrieve_json<T: DeserializeOwned>(&self, reference: &Reference) -> Result<T> {
        self.client.get_json(reference).await
    }

    /// Advances the envelope's status under the forward-only rule.
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` on a backward move.
    pub fn set_status(&self, to: VerificationStatus) -> Result<()> {
        self.envelope.lock().set_status(to)
    }

    /// Adds a scalar to the envelope's summary.
    pub fn add_summary(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.envelope.lock().add_summary(key, value);
    }

    /// Distinct categories present in the envelope's reference map.
    #[must_use]
    pub fn list_categories(&self) -> Vec<Category> {
        self.envelope.lock().list_categories()
    }

    fn attribute(&self, err: VeristateError, slot: Slot) -> VeristateError {
        err.with_attribution(
            self.run_id(),
            Some(slot.category().to_string()),
            Some(slot.to_string()),
        )
    }
}
