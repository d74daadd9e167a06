//! The finalize-on-error sink.
//!
//! Every failure path in the pipeline converges here. The sink is
//! deliberately infallible at its boundary: whatever state the failed run
//! left behind, it classifies the fault, persists what it can, and always
//! hands the orchestrator a well-formed terminal failure report. A sink
//! that can itself fail would leave runs stuck without a terminal status.

use std::sync::Arc;

use crate::boundary::{ErrorFinalizationRequest, FailureReport, FaultCause};
use crate::catalog::{dated_object_key, Slot};
use crate::config::Config;
use crate::errors::VeristateError;
use crate::state::Reference;
use crate::status::{ErrorInfo, Stage, VerificationContext, VerificationStatus};
use crate::store::{persist_status, StateClient, StatusRecord, TableStore};
use crate::utils::now_utc;

/// Classifies a fault cause into the error taxonomy.
///
/// The orchestrator's error channel loses the original classification, so
/// it is re-derived from the message; anything unrecognized is permanent.
#[must_use]
pub fn classify_fault(fault: &FaultCause) -> VeristateError {
    let operation = "finalize_error";
    let text = fault.message.to_lowercase();

    if text.contains("throttl") || text.contains("rate limit") {
        VeristateError::capacity(operation, &fault.message)
    } else if text.contains("timed out") || text.contains("timeout") {
        VeristateError::transient(operation, &fault.message)
    } else {
        VeristateError::permanent(operation, &fault.message)
    }
}

/// Terminal sink that turns any failed run into a `VERIFICATION_FAILED`
/// record and report.
pub struct ErrorFinalizer {
    client: Arc<StateClient>,
    table: Arc<dyn TableStore>,
    config: Config,
}

impl std::fmt::Debug for ErrorFinalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorFinalizer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ErrorFinalizer {
    /// Creates a finalizer over the given stores.
    #[must_use]
    pub fn new(client: Arc<StateClient>, table: Arc<dyn TableStore>, config: Config) -> Self {
        Self {
            client,
            table,
            config,
        }
    }

    /// Finalizes a failed run. Never fails: partial persistence is logged
    /// and the report returned regardless.
    pub async fn finalize(&self, request: ErrorFinalizationRequest) -> FailureReport {
        let run_id = request.verification_id.clone();
        let fault = request.fault();
        let stage = request.failed_stage();

        tracing::info!(%run_id, ?stage, message = %fault.message, "finalizing failed run");

        let classified = classify_fault(&fault).with_attribution(run_id.clone(), None, None);
        let error_info = ErrorInfo::from(&classified);

        let mut context = self.recover_context(&request, stage).await;
        context.record_error(error_info.clone());
        drive_to_terminal(&mut context, stage);

        let error_reference = self
            .persist_error_artifact(&run_id, &context, &fault, stage)
            .await;
        self.persist_terminal_status(&run_id, stage, &error_info)
            .await;

        FailureReport {
            verification_id: run_id,
            status: VerificationStatus::VerificationFailed,
            failed_stage: stage,
            error: error_info,
            error_reference,
            completed_at: now_utc(),
        }
    }

    /// Recovers the run's context from the request's envelope when one
    /// survived, otherwise synthesizes a minimal context from the run id
    /// and failing stage alone.
    async fn recover_context(
        &self,
        request: &ErrorFinalizationRequest,
        stage: Stage,
    ) -> VerificationContext {
        let Some(envelope) = &request.envelope else {
            return VerificationContext::synthesized(&request.verification_id, stage);
        };

        // The initialization stage persists the full context; use it when
        // it is still reachable.
        if let Ok(reference) = envelope.get_reference(&Slot::Initialization.reference_name()) {
            match self.client.get_json::<VerificationContext>(reference).await {
                Ok(context) => return context,
                Err(err) => {
                    tracing::warn!(
                        run_id = %request.verification_id,
                        error = %err,
                        "could not recover persisted context, synthesizing"
                    );
                }
            }
        }

        VerificationContext::synthesized(&request.verification_id, stage)
    }

    async fn persist_error_artifact(
        &self,
        run_id: &str,
        context: &VerificationContext,
        fault: &FaultCause,
        stage: Stage,
    ) -> Option<Reference> {
        let artifact = serde_json::json!({
            "context": context,
            "fault": fault,
            "failedStage": stage,
            "finalizedAt": crate::utils::iso_timestamp(),
        });
        let data = match serde_json::to_vec(&artifact) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(%run_id, error = %err, "error artifact did not serialize");
                return None;
            }
        };

        let key = dated_object_key(now_utc().date_naive(), run_id, Slot::ErrorDetails);
        match self.client.put_at(&key, data, "application/json").await {
            Ok(reference) => Some(reference),
            Err(err) => {
                tracing::warn!(%run_id, error = %err, "error artifact write failed, continuing");
                None
            }
        }
    }

    async fn persist_terminal_status(&self, run_id: &str, stage: Stage, error: &ErrorInfo) {
        let record = StatusRecord {
            run_id: run_id.to_string(),
            status: VerificationStatus::VerificationFailed,
            stage: Some(stage),
            error: Some(error.clone()),
            updated_at: now_utc(),
        };

        match persist_status(self.table.as_ref(), &self.config.results_table, record).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(%run_id, "terminal status refused by forward-only rule");
            }
            Err(err) => {
                tracing::warn!(%run_id, error = %err, "terminal status write failed, continuing");
            }
        }
    }
}

/// Moves the context onto the failure branch and then to the terminal
/// status. Illegal moves (e.g. an already-completed run) are logged,
/// never raised.
fn drive_to_terminal(context: &mut VerificationContext, stage: Stage) {
    for to in [stage.on_failure(), VerificationStatus::VerificationFailed] {
        if let Err(err) = context.advance(to) {
            tracing::warn!(
                run_id = %context.run_id,
                current = %context.status(),
                requested = %to,
                error = %err,
                "skipping illegal status move during finalization"
            );
        }
    }
}
