//! Error taxonomy and classification for the state-envelope protocol.
//!
//! Every fault raised at the reference, blob, envelope, or status layer is
//! wrapped in a [`VeristateError`] carrying its [`ErrorKind`], the failing
//! operation, and (where known) the `(run_id, category, slot)` attribution
//! triple, so a mid-pipeline fault can always be traced to the exact
//! artifact involved. Classification maps each kind to exactly one
//! [`ErrorCategory`] which decides retryability and backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::utils::{now_utc, Timestamp};

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, VeristateError>;

/// The closed set of fault categories.
///
/// Each externally raised fault maps to exactly one category; the category
/// alone decides whether a retry is advised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Caller's fault; never retried.
    Validation,
    /// Resource-level (not found / conflict); never retried.
    Client,
    /// Throttling or rate limiting; retried with jittered backoff.
    Capacity,
    /// Timeout or transient conflict; retried with exponential backoff.
    Transient,
    /// Server-side or unrecoverable; surfaced as pipeline failure.
    Permanent,
}

impl ErrorCategory {
    /// Returns true if faults in this category are worth retrying.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Capacity | Self::Transient)
    }
}

/// The specific fault that occurred.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErrorKind {
    /// A payload failed to serialize or deserialize.
    #[error("schema error: {detail}")]
    Schema {
        /// What went wrong during (de)serialization.
        detail: String,
    },

    /// A named reference is missing from the envelope or structurally invalid.
    #[error("reference error for '{name}': {reason}")]
    Reference {
        /// The reference name looked up.
        name: String,
        /// Why the lookup failed.
        reason: String,
    },

    /// The addressed blob does not exist.
    #[error("object not found: {bucket}/{key}")]
    NotFound {
        /// Bucket that was queried.
        bucket: String,
        /// Key that was queried.
        key: String,
    },

    /// The blob's integrity tag did not match its content.
    #[error("corrupt object at '{key}': expected tag {expected}, got {actual}")]
    Corrupt {
        /// Key of the corrupt object.
        key: String,
        /// Integrity tag recorded in the reference.
        expected: String,
        /// Integrity tag computed from the retrieved bytes.
        actual: String,
    },

    /// The backing store rejected the operation.
    #[error("store unavailable after {attempts} attempt(s): {detail}")]
    StoreUnavailable {
        /// Underlying store failure.
        detail: String,
        /// Attempts made before giving up.
        attempts: usize,
    },

    /// Input failed validation.
    #[error("validation error: {message}")]
    Validation {
        /// What was invalid.
        message: String,
    },

    /// The downstream service throttled the request.
    #[error("capacity error: {detail}")]
    Capacity {
        /// Throttling detail.
        detail: String,
    },

    /// A timeout or transient conflict occurred.
    #[error("transient error: {detail}")]
    Transient {
        /// Transient failure detail.
        detail: String,
    },

    /// An unrecoverable server-side failure.
    #[error("permanent error: {detail}")]
    Permanent {
        /// Permanent failure detail.
        detail: String,
    },

    /// A status change violated the forward-only transition table.
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition {
        /// Status before the attempted change.
        from: String,
        /// Status that was requested.
        to: String,
    },

    /// Startup configuration is invalid.
    #[error("config error: {message}")]
    Config {
        /// What was misconfigured.
        message: String,
    },
}

impl ErrorKind {
    /// Maps the kind to its single [`ErrorCategory`].
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Schema { .. }
            | Self::Validation { .. }
            | Self::IllegalTransition { .. }
            | Self::Config { .. } => ErrorCategory::Validation,
            Self::Reference { .. } | Self::NotFound { .. } => ErrorCategory::Client,
            Self::Capacity { .. } => ErrorCategory::Capacity,
            Self::StoreUnavailable { .. } | Self::Transient { .. } => ErrorCategory::Transient,
            Self::Corrupt { .. } | Self::Permanent { .. } => ErrorCategory::Permanent,
        }
    }

    /// Stable machine-readable code for the kind.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "SCHEMA_ERROR",
            Self::Reference { .. } => "REFERENCE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Corrupt { .. } => "CORRUPT",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Capacity { .. } => "CAPACITY_ERROR",
            Self::Transient { .. } => "TRANSIENT_ERROR",
            Self::Permanent { .. } => "PERMANENT_ERROR",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::Config { .. } => "CONFIG_ERROR",
        }
    }
}

/// The `(run_id, category, slot)` triple identifying the artifact a fault
/// relates to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    /// Run the fault belongs to.
    pub run_id: String,
    /// Category of the artifact involved, if any.
    pub category: Option<String>,
    /// Slot of the artifact involved, if any.
    pub slot: Option<String>,
}

/// A classified error with attribution and attempted-delay history.
#[derive(Debug, Clone, Error)]
pub struct VeristateError {
    /// The specific fault.
    pub kind: ErrorKind,
    /// The operation that failed (e.g. `put_json`, `set_status`).
    pub operation: String,
    /// Artifact attribution, when known.
    pub attribution: Option<Attribution>,
    /// When the fault was classified.
    pub timestamp: Timestamp,
    /// Every delay attempted against this fault, preserved through
    /// exhaustion for diagnosis.
    pub attempted_delays: Vec<Duration>,
}

impl std::fmt::Display for VeristateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.kind)?;
        if let Some(ref attr) = self.attribution {
            write!(f, " [run={}", attr.run_id)?;
            if let Some(ref category) = attr.category {
                write!(f, ", category={category}")?;
            }
            if let Some(ref slot) = attr.slot {
                write!(f, ", slot={slot}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl VeristateError {
    /// Creates a new classified error for `operation`.
    #[must_use]
    pub fn new(kind: ErrorKind, operation: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            attribution: None,
            timestamp: now_utc(),
            attempted_delays: Vec::new(),
        }
    }

    /// Attaches the failing `(run_id, category, slot)` triple.
    #[must_use]
    pub fn with_attribution(
        mut self,
        run_id: impl Into<String>,
        category: Option<String>,
        slot: Option<String>,
    ) -> Self {
        self.attribution = Some(Attribution {
            run_id: run_id.into(),
            category,
            slot,
        });
        self
    }

    /// The fault's category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Whether the classifier advises a retry. The classifier never loops
    /// itself; whole-stage retry belongs to the orchestrator.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Advises the delay before the next attempt, given a base unit.
    ///
    /// `Capacity` faults get full-jittered exponential backoff, `Transient`
    /// faults plain exponential backoff. Non-retryable categories return
    /// `None`. The exponent is the number of delays already attempted.
    #[must_use]
    pub fn next_delay(&self, base: Duration) -> Option<Duration> {
        let attempt = u32::try_from(self.attempted_delays.len()).unwrap_or(u32::MAX);
        let exponential = base.saturating_mul(2u32.saturating_pow(attempt));

        match self.category() {
            ErrorCategory::Transient => Some(exponential),
            ErrorCategory::Capacity => {
                let cap = exponential.as_millis().min(u128::from(u64::MAX)) as u64;
                if cap == 0 {
                    return Some(Duration::ZERO);
                }
                let jittered = rand::thread_rng().gen_range(0..=cap);
                Some(Duration::from_millis(jittered))
            }
            _ => None,
        }
    }

    /// Records a delay that was attempted against this fault.
    pub fn record_delay(&mut self, delay: Duration) {
        self.attempted_delays.push(delay);
    }

    // Factory constructors.

    /// Deserialization / serialization failure.
    #[must_use]
    pub fn schema(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Schema {
                detail: detail.into(),
            },
            operation,
        )
    }

    /// Missing or invalid envelope reference.
    #[must_use]
    pub fn reference(
        operation: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Reference {
                name: name.into(),
                reason: reason.into(),
            },
            operation,
        )
    }

    /// Blob absent from the store.
    #[must_use]
    pub fn not_found(
        operation: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::NotFound {
                bucket: bucket.into(),
                key: key.into(),
            },
            operation,
        )
    }

    /// Integrity tag mismatch on retrieval.
    #[must_use]
    pub fn corrupt(
        operation: impl Into<String>,
        key: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Corrupt {
                key: key.into(),
                expected: expected.into(),
                actual: actual.into(),
            },
            operation,
        )
    }

    /// Backing store rejected the operation.
    #[must_use]
    pub fn store_unavailable(
        operation: impl Into<String>,
        detail: impl Into<String>,
        attempts: usize,
    ) -> Self {
        Self::new(
            ErrorKind::StoreUnavailable {
                detail: detail.into(),
                attempts,
            },
            operation,
        )
    }

    /// Caller-side input validation failure.
    #[must_use]
    pub fn validation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Validation {
                message: message.into(),
            },
            operation,
        )
    }

    /// Throttling by a downstream service.
    #[must_use]
    pub fn capacity(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Capacity {
                detail: detail.into(),
            },
            operation,
        )
    }

    /// Timeout or transient conflict.
    #[must_use]
    pub fn transient(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Transient {
                detail: detail.into(),
            },
            operation,
        )
    }

    /// Deadline expiry, surfaced as a retryable transient fault.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, budget: Duration) -> Self {
        let operation = operation.into();
        Self::new(
            ErrorKind::Transient {
                detail: format!("operation '{operation}' timed out after {budget:?}"),
            },
            operation,
        )
    }

    /// Unrecoverable server-side failure.
    #[must_use]
    pub fn permanent(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Permanent {
                detail: detail.into(),
            },
            operation,
        )
    }

    /// Forward-only status rule violation.
    #[must_use]
    pub fn illegal_transition(
        operation: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::IllegalTransition {
                from: from.into(),
                to: to.into(),
            },
            operation,
        )
    }

    /// Invalid startup configuration.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Config {
                message: message.into(),
            },
            "load_config",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_maps_to_one_category() {
        assert_eq!(
            VeristateError::schema("op", "bad json").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            VeristateError::not_found("op", "b", "k").category(),
            ErrorCategory::Client
        );
        assert_eq!(
            VeristateError::capacity("op", "throttled").category(),
            ErrorCategory::Capacity
        );
        assert_eq!(
            VeristateError::transient("op", "timeout").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            VeristateError::permanent("op", "boom").category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn test_retryability_by_category() {
        assert!(VeristateError::capacity("op", "throttled").is_retryable());
        assert!(VeristateError::transient("op", "timeout").is_retryable());
        assert!(!VeristateError::validation("op", "bad input").is_retryable());
        assert!(!VeristateError::not_found("op", "b", "k").is_retryable());
        assert!(!VeristateError::permanent("op", "boom").is_retryable());
    }

    #[test]
    fn test_next_delay_transient_is_exponential() {
        let mut err = VeristateError::transient("op", "timeout");
        let base = Duration::from_millis(100);

        let d0 = err.next_delay(base).unwrap();
        assert_eq!(d0, Duration::from_millis(100));
        err.record_delay(d0);

        let d1 = err.next_delay(base).unwrap();
        assert_eq!(d1, Duration::from_millis(200));
        err.record_delay(d1);

        let d2 = err.next_delay(base).unwrap();
        assert_eq!(d2, Duration::from_millis(400));
    }

    #[test]
    fn test_next_delay_capacity_is_jitter_bounded() {
        let mut err = VeristateError::capacity("op", "throttled");
        let base = Duration::from_millis(100);

        for attempt in 0..4u32 {
            let bound = base * 2u32.pow(attempt);
            let delay = err.next_delay(base).unwrap();
            assert!(delay <= bound, "delay {delay:?} above bound {bound:?}");
            err.record_delay(delay);
        }
        assert_eq!(err.attempted_delays.len(), 4);
    }

    #[test]
    fn test_next_delay_none_for_non_retryable() {
        let err = VeristateError::validation("op", "bad");
        assert_eq!(err.next_delay(Duration::from_millis(100)), None);
    }

    #[test]
    fn test_display_includes_attribution() {
        let err = VeristateError::not_found("get", "bucket", "key").with_attribution(
            "run-1",
            Some("images".to_string()),
            Some("referenceBase64".to_string()),
        );
        let text = err.to_string();
        assert!(text.contains("run=run-1"));
        assert!(text.contains("category=images"));
        assert!(text.contains("slot=referenceBase64"));
    }

    #[test]
    fn test_timeout_is_transient_and_retryable() {
        let err = VeristateError::timeout("fetch_images", Duration::from_secs(5));
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_retryable());
        assert_eq!(err.code(), "TRANSIENT_ERROR");
    }
}
