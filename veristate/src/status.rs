//! Run status state machine and verification context.
//!
//! Status is a closed enumeration with an exhaustively checked transition
//! table: a run only ever moves forward along
//! `INITIALIZED -> IMAGES_FETCHED -> TURN1_PROCESSED -> TURN2_PROCESSED ->
//! COMPLETED`, may branch from any non-terminal state to a stage-specific
//! `FAILED_AT_<STAGE>` state, and reaches the terminal
//! `VERIFICATION_FAILED` only through the finalize-on-error sink.
//! Re-entry onto the current status is an idempotent no-op; any backward
//! move is an illegal transition.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, VeristateError};
use crate::utils::{now_utc, Timestamp};

/// The kind of verification a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationType {
    /// Compare a planogram layout against a checking image.
    LayoutVsChecking,
    /// Compare a previous verification's image against the current one.
    PreviousVsCurrent,
}

/// The pipeline stages, in invocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Run creation and context initialization.
    Initialization,
    /// Fetching and encoding the image pair.
    ImageFetch,
    /// First model turn and its analysis.
    Turn1,
    /// Second model turn and its analysis.
    Turn2,
    /// Result assembly and persistence.
    Finalization,
    /// Stage could not be determined from the fault report.
    Unknown,
}

impl Stage {
    /// Status a run lands on when this stage succeeds.
    #[must_use]
    pub const fn on_success(self) -> VerificationStatus {
        match self {
            Self::Initialization => VerificationStatus::Initialized,
            Self::ImageFetch => VerificationStatus::ImagesFetched,
            Self::Turn1 => VerificationStatus::Turn1Processed,
            Self::Turn2 => VerificationStatus::Turn2Processed,
            Self::Finalization | Self::Unknown => VerificationStatus::Completed,
        }
    }

    /// Stage-specific failure branch for this stage.
    #[must_use]
    pub const fn on_failure(self) -> VerificationStatus {
        match self {
            Self::Initialization => VerificationStatus::FailedAtInitialization,
            Self::ImageFetch => VerificationStatus::FailedAtImageFetch,
            Self::Turn1 => VerificationStatus::FailedAtTurn1,
            Self::Turn2 => VerificationStatus::FailedAtTurn2,
            Self::Finalization => VerificationStatus::FailedAtFinalization,
            Self::Unknown => VerificationStatus::FailedAtUnknown,
        }
    }
}

/// Outcome of one stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage completed all its slot writes.
    Success,
    /// The stage faulted.
    Failure,
}

/// Computes the status a run moves to after `stage` finishes with `outcome`.
#[must_use]
pub const fn next_status(stage: Stage, outcome: StageOutcome) -> VerificationStatus {
    match outcome {
        StageOutcome::Success => stage.on_success(),
        StageOutcome::Failure => stage.on_failure(),
    }
}

/// Legal states of a run. Terminal states are [`Completed`] and
/// [`VerificationFailed`].
///
/// [`Completed`]: VerificationStatus::Completed
/// [`VerificationFailed`]: VerificationStatus::VerificationFailed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    /// Run created, envelope exists, nothing fetched yet.
    Initialized,
    /// Both images fetched and stored.
    ImagesFetched,
    /// Turn 1 executed and analyzed.
    Turn1Processed,
    /// Turn 2 executed and analyzed.
    Turn2Processed,
    /// Terminal success.
    Completed,
    /// Initialization stage faulted.
    FailedAtInitialization,
    /// Image fetch stage faulted.
    FailedAtImageFetch,
    /// Turn 1 stage faulted.
    FailedAtTurn1,
    /// Turn 2 stage faulted.
    FailedAtTurn2,
    /// Finalization stage faulted.
    FailedAtFinalization,
    /// A fault was reported without an identifiable stage.
    FailedAtUnknown,
    /// Terminal failure, produced only by the finalize-on-error sink.
    VerificationFailed,
}

impl VerificationStatus {
    /// True for the two terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::VerificationFailed)
    }

    /// True for the stage-specific failure branches.
    #[must_use]
    pub const fn is_failure_branch(self) -> bool {
        matches!(
            self,
            Self::FailedAtInitialization
                | Self::FailedAtImageFetch
                | Self::FailedAtTurn1
                | Self::FailedAtTurn2
                | Self::FailedAtFinalization
                | Self::FailedAtUnknown
        )
    }

    /// Position along the happy path, if the status is on it.
    #[must_use]
    pub const fn rank(self) -> Option<u8> {
        match self {
            Self::Initialized => Some(0),
            Self::ImagesFetched => Some(1),
            Self::Turn1Processed => Some(2),
            Self::Turn2Processed => Some(3),
            Self::Completed => Some(4),
            _ => None,
        }
    }

    /// The exhaustive transition table.
    ///
    /// Legal moves: idempotent re-entry, strictly forward along the happy
    /// path, any non-terminal state to a failure branch, and any
    /// non-`Completed` state to the terminal `VerificationFailed`.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        if self == to {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if self.is_failure_branch() {
            return to == Self::VerificationFailed;
        }
        // self is a non-terminal happy-path state here.
        match (self.rank(), to.rank()) {
            (Some(from_rank), Some(to_rank)) => to_rank > from_rank,
            _ => to.is_failure_branch() || to == Self::VerificationFailed,
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initialized => "INITIALIZED",
            Self::ImagesFetched => "IMAGES_FETCHED",
            Self::Turn1Processed => "TURN1_PROCESSED",
            Self::Turn2Processed => "TURN2_PROCESSED",
            Self::Completed => "COMPLETED",
            Self::FailedAtInitialization => "FAILED_AT_INITIALIZATION",
            Self::FailedAtImageFetch => "FAILED_AT_IMAGE_FETCH",
            Self::FailedAtTurn1 => "FAILED_AT_TURN1",
            Self::FailedAtTurn2 => "FAILED_AT_TURN2",
            Self::FailedAtFinalization => "FAILED_AT_FINALIZATION",
            Self::FailedAtUnknown => "FAILED_AT_UNKNOWN",
            Self::VerificationFailed => "VERIFICATION_FAILED",
        };
        f.write_str(name)
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    /// Status the run moved to.
    pub status: VerificationStatus,
    /// When the move was recorded.
    pub timestamp: Timestamp,
}

/// Append-only, ordered history of a run's status changes.
///
/// Entries only grow; the history is never reordered or truncated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusHistory {
    entries: Vec<StatusEntry>,
}

impl StatusHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a status change.
    pub fn record(&mut self, status: VerificationStatus) {
        self.entries.push(StatusEntry {
            status,
            timestamp: now_utc(),
        });
    }

    /// The recorded entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> &[StatusEntry] {
        &self.entries
    }

    /// The most recently recorded status.
    #[must_use]
    pub fn latest(&self) -> Option<VerificationStatus> {
        self.entries.last().map(|e| e.status)
    }

    /// True if every adjacent pair of entries is a legal transition.
    #[must_use]
    pub fn is_forward_only(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].status.can_transition(pair[1].status))
    }
}

/// Standardized error report attached to a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured detail map.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
    /// When the error occurred.
    pub timestamp: Timestamp,
}

impl From<&VeristateError> for ErrorInfo {
    fn from(err: &VeristateError) -> Self {
        let mut details = serde_json::Map::new();
        details.insert(
            "operation".to_string(),
            serde_json::Value::String(err.operation.clone()),
        );
        if let Some(ref attr) = err.attribution {
            details.insert(
                "runId".to_string(),
                serde_json::Value::String(attr.run_id.clone()),
            );
            if let Some(ref category) = attr.category {
                details.insert(
                    "category".to_string(),
                    serde_json::Value::String(category.clone()),
                );
            }
            if let Some(ref slot) = attr.slot {
                details.insert("slot".to_string(), serde_json::Value::String(slot.clone()));
            }
        }
        Self {
            code: err.code().to_string(),
            message: err.kind.to_string(),
            details,
            timestamp: err.timestamp,
        }
    }
}

/// Error accumulation for a run. Once `has_errors` latches true it never
/// reverts for the lifetime of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTracking {
    /// Latched true by the first recorded error.
    pub has_errors: bool,
    /// The most recent error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_error: Option<ErrorInfo>,
    /// Every error recorded, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_history: Vec<ErrorInfo>,
    /// When the most recent error was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<Timestamp>,
}

impl ErrorTracking {
    /// Records an error, latching `has_errors`.
    pub fn record(&mut self, error: ErrorInfo) {
        self.has_errors = true;
        self.last_error_at = Some(error.timestamp);
        self.error_history.push(error.clone());
        self.current_error = Some(error);
    }
}

/// The per-run verification context persisted by finalize stages.
///
/// Status is one logical field; it is serialized under both `status` and
/// `currentStatus` so records written in the original persisted format stay
/// readable, and the two never diverge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationContext {
    /// Run identifier.
    pub run_id: String,
    /// What kind of verification this run performs, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_type: Option<VerificationType>,
    status: VerificationStatus,
    current_status: VerificationStatus,
    /// When the context last changed.
    pub last_updated_at: Timestamp,
    /// Error report, present once the run has faulted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Error accumulation, present once the run has faulted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_tracking: Option<ErrorTracking>,
    status_history: StatusHistory,
}

impl VerificationContext {
    /// Creates a context for a new run at `INITIALIZED`.
    #[must_use]
    pub fn new(run_id: impl Into<String>, verification_type: VerificationType) -> Self {
        let mut history = StatusHistory::new();
        history.record(VerificationStatus::Initialized);
        Self {
            run_id: run_id.into(),
            verification_type: Some(verification_type),
            status: VerificationStatus::Initialized,
            current_status: VerificationStatus::Initialized,
            last_updated_at: now_utc(),
            error: None,
            error_tracking: None,
            status_history: history,
        }
    }

    /// Synthesizes a minimal context from only a run id and the reported
    /// failing stage, for finalize-on-error invocations where no envelope
    /// was ever persisted.
    #[must_use]
    pub fn synthesized(run_id: impl Into<String>, failed_stage: Stage) -> Self {
        let status = failed_stage.on_failure();
        let mut history = StatusHistory::new();
        history.record(status);
        Self {
            run_id: run_id.into(),
            verification_type: None,
            status,
            current_status: status,
            last_updated_at: now_utc(),
            error: None,
            error_tracking: None,
            status_history: history,
        }
    }

    /// The run's current status.
    #[must_use]
    pub const fn status(&self) -> VerificationStatus {
        self.status
    }

    /// The append-only status history.
    #[must_use]
    pub const fn status_history(&self) -> &StatusHistory {
        &self.status_history
    }

    /// Advances the run to `to`, enforcing the forward-only rule.
    ///
    /// Re-entry onto the current status is a no-op success so re-invoked
    /// stages never fail on their own previous progress.
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` if the move is not in the table.
    pub fn advance(&mut self, to: VerificationStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition(to) {
            return Err(VeristateError::illegal_transition(
                "advance",
                self.status.to_string(),
                to.to_string(),
            )
            .with_attribution(self.run_id.clone(), None, None));
        }
        self.status = to;
        self.current_status = to;
        self.status_history.record(to);
        self.last_updated_at = now_utc();
        Ok(())
    }

    /// Records an error on the context, latching error tracking.
    pub fn record_error(&mut self, error: ErrorInfo) {
        self.error_tracking
            .get_or_insert_with(ErrorTracking::default)
            .record(error.clone());
        self.error = Some(error);
        self.last_updated_at = now_utc();
    }
}

// Deserialization accepts records carrying either or both of `status` and
// `currentStatus`, normalizing onto the single logical field.
impl<'de> Deserialize<'de> for VerificationContext {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire {
            run_id: String,
            #[serde(default)]
            verification_type: Option<VerificationType>,
            #[serde(default)]
            status: Option<VerificationStatus>,
            #[serde(default)]
            current_status: Option<VerificationStatus>,
            last_updated_at: Timestamp,
            #[serde(default)]
            error: Option<ErrorInfo>,
            #[serde(default)]
            error_tracking: Option<ErrorTracking>,
            #[serde(default)]
            status_history: StatusHistory,
        }

        let wire = Wire::deserialize(deserializer)?;
        let status = wire
            .status
            .or(wire.current_status)
            .ok_or_else(|| serde::de::Error::missing_field("status"))?;

        Ok(Self {
            run_id: wire.run_id,
            verification_type: wire.verification_type,
            status,
            current_status: status,
            last_updated_at: wire.last_updated_at,
            error: wire.error,
            error_tracking: wire.error_tracking,
            status_history: wire.status_history,
        })
    }
}
