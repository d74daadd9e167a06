//! Decoding at the orchestrator boundary.
//!
//! Orchestrators are sloppy about shapes: the envelope may arrive as a
//! bare object, wrapped under an `envelope` field, or double-encoded as a
//! JSON string; fault causes arrive as structured runtime reports or as
//! plain text. Everything here normalizes those inputs before the typed
//! core ever sees them.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, VeristateError};
use crate::state::{Envelope, Reference};
use crate::status::{ErrorInfo, Stage, VerificationStatus};
use crate::utils::Timestamp;

/// Decodes an envelope from whatever shape the orchestrator handed over.
///
/// Accepted forms, tried in order: a bare envelope object, an object
/// wrapping the envelope under `envelope`, and a JSON string containing
/// either of the above.
///
/// # Errors
///
/// Returns `SchemaError` if no form matches.
pub fn decode_envelope(value: &serde_json::Value) -> Result<Envelope> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(inner) = map.get("envelope") {
                return decode_envelope(inner);
            }
            serde_json::from_value(value.clone())
                .map_err(|e| VeristateError::schema("decode_envelope", e.to_string()))
        }
        serde_json::Value::String(text) => {
            let inner: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| VeristateError::schema("decode_envelope", e.to_string()))?;
            decode_envelope(&inner)
        }
        other => Err(VeristateError::schema(
            "decode_envelope",
            format!("expected object or string, got {other}"),
        )),
    }
}

/// Decodes an envelope from raw input bytes.
///
/// # Errors
///
/// As [`decode_envelope`].
pub fn decode_envelope_bytes(data: &[u8]) -> Result<Envelope> {
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| VeristateError::schema("decode_envelope", e.to_string()))?;
    decode_envelope(&value)
}

/// A fault cause as reported by the orchestrator's error channel.
///
/// Structured runtime reports carry `errorType`/`errorMessage`; anything
/// unparseable is kept verbatim as the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultCause {
    /// Runtime error type name, when the cause was structured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Human-readable failure message.
    #[serde(rename = "errorMessage")]
    pub message: String,
}

impl FaultCause {
    /// Parses a raw cause payload, falling back to the verbatim text when
    /// it is not a structured report.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self {
            error_type: None,
            message: raw.to_string(),
        })
    }

    /// A placeholder cause for invocations that arrived with none.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            error_type: None,
            message: "unknown failure (no cause reported)".to_string(),
        }
    }
}

/// Infers the failing stage from a fault message when the orchestrator did
/// not name one. Substring heuristics over the lowercased message; anything
/// unrecognized maps to [`Stage::Unknown`].
#[must_use]
pub fn infer_stage(message: &str) -> Stage {
    let text = message.to_lowercase();
    if text.contains("turn2") || text.contains("turn 2") {
        Stage::Turn2
    } else if text.contains("turn1") || text.contains("turn 1") {
        Stage::Turn1
    } else if text.contains("initializ") {
        Stage::Initialization
    } else if text.contains("image") && text.contains("fetch") {
        Stage::ImageFetch
    } else if text.contains("finaliz") {
        Stage::Finalization
    } else {
        Stage::Unknown
    }
}

/// Input to the finalize-on-error sink.
///
/// Only `verificationId` is required; everything else is best-effort
/// context salvaged from the failed execution.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFinalizationRequest {
    /// Run being finalized.
    #[serde(alias = "runId")]
    pub verification_id: String,
    /// Failing stage, when the orchestrator named it.
    #[serde(default)]
    pub stage: Option<Stage>,
    /// Runtime error name from the orchestrator's error channel.
    #[serde(default)]
    pub error: Option<String>,
    /// Raw cause payload from the orchestrator's error channel.
    #[serde(default)]
    pub cause: Option<String>,
    /// Partial envelope, when one survived the failure.
    #[serde(default)]
    pub envelope: Option<Envelope>,
}

impl ErrorFinalizationRequest {
    /// A minimal request carrying only the run id.
    #[must_use]
    pub fn minimal(run_id: impl Into<String>) -> Self {
        Self {
            verification_id: run_id.into(),
            stage: None,
            error: None,
            cause: None,
            envelope: None,
        }
    }

    /// The parsed fault cause, or a placeholder when none was reported.
    #[must_use]
    pub fn fault(&self) -> FaultCause {
        self.cause
            .as_deref()
            .map_or_else(FaultCause::unknown, FaultCause::parse)
    }

    /// Resolves the failing stage: the explicitly named one wins, otherwise
    /// it is inferred from the fault message.
    #[must_use]
    pub fn failed_stage(&self) -> Stage {
        self.stage
            .unwrap_or_else(|| infer_stage(&self.fault().message))
    }
}

/// The report the finalize-on-error sink hands back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    /// Run that failed.
    pub verification_id: String,
    /// Always the terminal failure status.
    pub status: VerificationStatus,
    /// Stage held responsible.
    pub failed_stage: Stage,
    /// The standardized error report.
    pub error: ErrorInfo,
    /// Where the full error artifact was persisted, when the write
    /// succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reference: Option<Reference>,
    /// When finalization completed.
    pub completed_at: Timestamp,
}
