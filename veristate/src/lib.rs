//! # Veristate
//!
//! State-envelope and reference management for a multi-turn, AI-assisted
//! image-verification pipeline running as stateless orchestrated stages.
//!
//! The crate provides:
//!
//! - **Envelope protocol**: the inter-stage message carrying run status,
//!   slot entries, and summary scalars
//! - **Hybrid payload codec**: small payloads travel inline, large ones as
//!   references into a blob store
//! - **Deterministic keys**: every artifact lands at a key derived from
//!   `(run_id, category, slot)`, making re-invocation overwrite-safe
//! - **Forward-only status**: an exhaustively checked transition table a
//!   run can never move backward through
//! - **Finalize-on-error sink**: every failure path converges into an
//!   infallible terminal `VERIFICATION_FAILED` report
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use veristate::prelude::*;
//!
//! let client = Arc::new(StateClient::new(store, "state-bucket", RetryPolicy::default()));
//! let manager = EnvelopeManager::create(client, HybridCodec::default(), generate_run_id());
//!
//! manager.save_bytes(Slot::ReferenceBase64, image_bytes).await?;
//! manager.set_status(VerificationStatus::ImagesFetched)?;
//! let envelope = manager.into_envelope();
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod boundary;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod finalize;
pub mod retry;
pub mod state;
pub mod status;
pub mod store;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::boundary::{
        decode_envelope, decode_envelope_bytes, infer_stage, ErrorFinalizationRequest,
        FailureReport, FaultCause,
    };
    pub use crate::catalog::{
        dated_object_key, object_key, parse_key, Category, ParsedKey, Slot,
    };
    pub use crate::config::Config;
    pub use crate::errors::{
        Attribution, ErrorCategory, ErrorKind, Result, VeristateError,
    };
    pub use crate::finalize::ErrorFinalizer;
    pub use crate::retry::{
        with_deadline, with_retry, BackoffStrategy, JitterStrategy, RetryPolicy,
    };
    pub use crate::state::{
        Envelope, EnvelopeManager, HybridCodec, Reference, SlotEntry,
    };
    pub use crate::status::{
        next_status, ErrorInfo, ErrorTracking, Stage, StageOutcome, StatusHistory,
        VerificationContext, VerificationStatus, VerificationType,
    };
    pub use crate::store::{
        persist_status, BlobStore, InMemoryBlobStore, InMemoryTableStore, StateClient,
        StatusRecord, TableStore,
    };
    pub use crate::utils::{generate_run_id, iso_timestamp, now_utc, Timestamp};
}
