//! Immutable pointers to externally stored blobs.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::{parse_key, Category};

/// An immutable pointer to a stored blob.
///
/// A `Reference` is owned by the stage that wrote the blob and may be
/// pointed to by many envelope entries; it never changes once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    /// Bucket (container) holding the blob.
    pub bucket: String,
    /// Full key of the blob inside the bucket.
    pub key: String,
    /// Content integrity tag (hex MD5 of the stored bytes), when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Size of the stored bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Reference {
    /// Creates a reference to `bucket`/`key`.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            etag: None,
            size: None,
        }
    }

    /// Attaches an integrity tag.
    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Attaches the stored size.
    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// True when both addressing fields are present.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.bucket.is_empty() && !self.key.is_empty()
    }

    /// The category encoded in the key, if the key parses.
    #[must_use]
    pub fn category(&self) -> Option<Category> {
        parse_key(&self.key).ok().map(|parsed| parsed.category)
    }

    /// The run id encoded in the key, if the key parses.
    #[must_use]
    pub fn run_id(&self) -> Option<String> {
        parse_key(&self.key).ok().map(|parsed| parsed.run_id)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store://{}/{}", self.bucket, self.key)
    }
}
