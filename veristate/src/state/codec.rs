//! Hybrid payload codec: inline small payloads, reference large ones.
//!
//! The orchestrator's message channel has a hard size ceiling, so binary
//! artifacts above the configured threshold are written through the blob
//! store and only their [`Reference`] travels in the envelope; small
//! payloads are inlined to skip the extra store round trip. A slot commits
//! to exactly one representation, never both.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, VeristateError};
use crate::state::reference::Reference;

/// Default inline/reference boundary: 2 MiB.
pub const DEFAULT_INLINE_THRESHOLD: usize = 2 * 1024 * 1024;

/// One envelope slot value: either the payload itself or a pointer to it.
///
/// Serialized untagged so a stored entry is indistinguishable on the wire
/// from a bare reference object (`{"bucket": ..., "key": ...}`), while an
/// inline entry carries a single `inline` field with the base64 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotEntry {
    /// Payload written through the blob store.
    Stored(Reference),
    /// Payload carried directly in the message.
    Inline {
        /// Base64-encoded payload bytes.
        inline: String,
    },
}

impl SlotEntry {
    /// Creates an inline entry from raw payload bytes.
    #[must_use]
    pub fn inline(payload: &[u8]) -> Self {
        Self::Inline {
            inline: BASE64.encode(payload),
        }
    }

    /// The reference, when the entry is stored externally.
    #[must_use]
    pub const fn reference(&self) -> Option<&Reference> {
        match self {
            Self::Stored(reference) => Some(reference),
            Self::Inline { .. } => None,
        }
    }

    /// Decodes the inline payload, when present.
    ///
    /// # Errors
    ///
    /// Returns a schema error if the inline base64 is malformed.
    pub fn inline_bytes(&self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Stored(_) => Ok(None),
            Self::Inline { inline } => BASE64
                .decode(inline)
                .map(Some)
                .map_err(|e| VeristateError::schema("decode_inline", e.to_string())),
        }
    }
}

/// The inline-vs-reference decision policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridCodec {
    /// Whether hybrid routing is enabled at all. Disabled means every
    /// payload is inlined regardless of size.
    pub enabled: bool,
    /// Payloads of at most this many bytes are inlined.
    pub threshold: usize,
}

impl Default for HybridCodec {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }
}

impl HybridCodec {
    /// Creates a codec with the given policy.
    #[must_use]
    pub const fn new(enabled: bool, threshold: usize) -> Self {
        Self { enabled, threshold }
    }

    /// Decides whether a payload of `len` bytes travels inline.
    #[must_use]
    pub const fn should_inline(&self, len: usize) -> bool {
        !self.enabled || len <= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_inline_round_trip() {
        let payload = b"verification payload".to_vec();
        let entry = SlotEntry::inline(&payload);
        assert_eq!(entry.inline_bytes().unwrap(), Some(payload));
        assert!(entry.reference().is_none());
    }

    #[test]
    fn test_threshold_boundary() {
        let codec = HybridCodec::new(true, 8);
        assert!(codec.should_inline(8));
        assert!(!codec.should_inline(9));
    }

    #[test]
    fn test_disabled_codec_always_inlines() {
        let codec = HybridCodec::new(false, 8);
        assert!(codec.should_inline(usize::MAX));
    }

    #[test]
    fn test_default_threshold() {
        let codec = HybridCodec::default();
        assert_eq!(codec.threshold, 2 * 1024 * 1024);
        assert!(codec.enabled);
    }

    #[test]
    fn test_stored_entry_serializes_as_bare_reference() {
        let entry = SlotEntry::Stored(Reference::new("b", "run-1/images/referenceBase64"));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"bucket": "b", "key": "run-1/images/referenceBase64"})
        );
    }

    #[test]
    fn test_untagged_wire_forms_are_distinguishable() {
        let stored: SlotEntry =
            serde_json::from_value(serde_json::json!({"bucket": "b", "key": "k"})).unwrap();
        assert!(matches!(stored, SlotEntry::Stored(_)));

        let inline: SlotEntry =
            serde_json::from_value(serde_json::json!({"inline": "aGk="})).unwrap();
        assert_eq!(inline.inline_bytes().unwrap(), Some(b"hi".to_vec()));
    }

    #[test]
    fn test_malformed_inline_is_schema_error() {
        let entry = SlotEntry::Inline {
            inline: "not base64!!".to_string(),
        };
        let err = entry.inline_bytes().unwrap_err();
        assert_eq!(err.code(), "SCHEMA_ERROR");
    }
}
