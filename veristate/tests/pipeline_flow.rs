//! End-to-end pipeline flows: a full run through every stage, re-invoked
//! stages, and failure paths converging into the finalize-on-error sink.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use veristate::prelude::*;

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn make_client(store: &Arc<InMemoryBlobStore>) -> Arc<StateClient> {
    init_tracing();
    Arc::new(StateClient::new(
        store.clone(),
        "state",
        RetryPolicy::new().with_base_delay_ms(1),
    ))
}

#[tokio::test]
async fn test_full_run_walks_forward_to_completed() {
    let store = Arc::new(InMemoryBlobStore::new());
    let client = make_client(&store);
    let codec = HybridCodec::new(true, 2 * 1024 * 1024);
    let run_id = generate_run_id();

    // Stage 1: image fetch. A 3 MiB image must go through the store.
    let manager = EnvelopeManager::create(client.clone(), codec, run_id.clone());
    let image = vec![0xA5u8; 3 * 1024 * 1024];
    manager.save_bytes(Slot::ReferenceBase64, image).await.unwrap();
    manager.save_bytes(Slot::CheckingBase64, vec![0x5Au8; 64]).await.unwrap();
    manager.add_summary("imagesProcessed", 2);
    manager.set_status(VerificationStatus::ImagesFetched).unwrap();
    let envelope = manager.into_envelope();

    // Large payload landed as a reference, small one inline.
    let reference = envelope.get_reference("images_referenceBase64").unwrap();
    assert_eq!(reference.size, Some(3 * 1024 * 1024));
    assert!(envelope
        .get_reference("images_checkingBase64")
        .is_err(), "small payload must stay inline");

    // The envelope crosses the orchestrator as JSON, sometimes wrapped.
    let wire = serde_json::json!({ "envelope": envelope });
    let envelope = decode_envelope(&wire).unwrap();
    assert_eq!(envelope.status(), VerificationStatus::ImagesFetched);

    // Stage 2: turn 1 reads the image back and writes its analysis.
    let manager = EnvelopeManager::new(client.clone(), codec, envelope);
    let image = manager.load_bytes("images_referenceBase64").await.unwrap();
    assert_eq!(image.len(), 3 * 1024 * 1024);
    manager
        .save_json(
            Slot::Turn1Analysis,
            &serde_json::json!({"verdict": "structures match"}),
        )
        .await
        .unwrap();
    manager.set_status(VerificationStatus::Turn1Processed).unwrap();
    let envelope = manager.into_envelope();

    // Remaining stages advance to the terminal success.
    let manager = EnvelopeManager::new(client, codec, envelope);
    manager.set_status(VerificationStatus::Turn2Processed).unwrap();
    manager.set_status(VerificationStatus::Completed).unwrap();
    let envelope = manager.into_envelope();

    assert_eq!(envelope.status(), VerificationStatus::Completed);
    assert_eq!(
        envelope.list_categories(),
        vec![Category::Images, Category::Processing]
    );
    envelope.validate().unwrap();
}

#[tokio::test]
async fn test_reinvoked_stage_is_effectively_once() {
    let store = Arc::new(InMemoryBlobStore::new());
    let client = make_client(&store);
    let codec = HybridCodec::new(true, 16);
    let payload = vec![7u8; 128];

    // The same stage runs twice against the same run with identical input,
    // as happens under orchestrator retry.
    let run = |envelope: Envelope| {
        let client = client.clone();
        let payload = payload.clone();
        async move {
            let manager = EnvelopeManager::new(client, codec, envelope);
            manager.save_bytes(Slot::ReferenceBase64, payload).await.unwrap();
            manager.set_status(VerificationStatus::ImagesFetched).unwrap();
            manager.into_envelope()
        }
    };

    let first = run(Envelope::new("run-retry")).await;
    let second = run(first.clone()).await;

    // Byte-identical reference, no duplicate objects, no status complaint.
    assert_eq!(
        first.get_reference("images_referenceBase64").unwrap(),
        second.get_reference("images_referenceBase64").unwrap()
    );
    assert_eq!(store.len(), 1);
    assert_eq!(second.status(), VerificationStatus::ImagesFetched);
}

#[test]
fn test_random_transition_walks_never_go_backward() {
    let all = [
        VerificationStatus::Initialized,
        VerificationStatus::ImagesFetched,
        VerificationStatus::Turn1Processed,
        VerificationStatus::Turn2Processed,
        VerificationStatus::Completed,
        VerificationStatus::FailedAtInitialization,
        VerificationStatus::FailedAtImageFetch,
        VerificationStatus::FailedAtTurn1,
        VerificationStatus::FailedAtTurn2,
        VerificationStatus::FailedAtFinalization,
        VerificationStatus::FailedAtUnknown,
        VerificationStatus::VerificationFailed,
    ];
    let mut rng = rand::thread_rng();

    for _ in 0..200 {
        let mut ctx =
            VerificationContext::new(generate_run_id(), VerificationType::LayoutVsChecking);
        let steps = rng.gen_range(1..20);
        for _ in 0..steps {
            let target = *all.choose(&mut rng).unwrap();
            let before = ctx.status();
            match ctx.advance(target) {
                Ok(()) => assert!(before.can_transition(target)),
                Err(err) => {
                    assert_eq!(err.code(), "ILLEGAL_TRANSITION");
                    assert_eq!(ctx.status(), before, "rejected move must not change state");
                }
            }
        }
        assert!(ctx.status_history().is_forward_only());
        // A terminal status, once reached, is where the walk stays.
        if ctx.status() == VerificationStatus::Completed {
            assert!(!ctx.status().can_transition(VerificationStatus::VerificationFailed));
        }
    }
}

#[tokio::test]
async fn test_store_outage_exhausts_retries_with_history() {
    let store = Arc::new(InMemoryBlobStore::new());
    store.fail_next(1000);
    let client = Arc::new(StateClient::new(
        store,
        "state",
        RetryPolicy::new().with_max_attempts(4).with_base_delay_ms(1),
    ));

    let err = client
        .put("run-1", Slot::Turn1Raw, b"payload")
        .await
        .unwrap_err();

    assert_eq!(err.code(), "STORE_UNAVAILABLE");
    assert!(err.is_retryable());
    // 4 attempts means 3 delays, preserved in order for diagnosis.
    assert_eq!(err.attempted_delays.len(), 3);
    let mut previous = std::time::Duration::ZERO;
    for delay in &err.attempted_delays {
        assert!(*delay >= previous);
        previous = *delay;
    }
}

#[tokio::test]
async fn test_failure_path_converges_to_verification_failed() {
    let store = Arc::new(InMemoryBlobStore::new());
    let table = Arc::new(InMemoryTableStore::new());
    let client = make_client(&store);
    let codec = HybridCodec::default();

    // A run gets partway through before turn 1 faults.
    let manager = EnvelopeManager::create(client, codec, "run-fault");
    manager.save_bytes(Slot::ReferenceBase64, vec![1u8; 32]).await.unwrap();
    manager.set_status(VerificationStatus::ImagesFetched).unwrap();
    let envelope = manager.into_envelope();

    let request: ErrorFinalizationRequest = serde_json::from_value(serde_json::json!({
        "verificationId": "run-fault",
        "cause": r#"{"errorMessage": "turn1 model invocation throttled", "errorType": "ThrottlingException"}"#,
        "envelope": envelope,
    }))
    .unwrap();

    let finalizer = make_finalizer(&store, &table);
    let report = finalizer.finalize(request).await;

    assert_eq!(report.status, VerificationStatus::VerificationFailed);
    assert_eq!(report.failed_stage, Stage::Turn1);
    assert_eq!(report.error.code, "CAPACITY_ERROR");
    assert!(report.error_reference.is_some());

    let record = table.get("results", "run-fault").await.unwrap().unwrap();
    assert_eq!(record.status, VerificationStatus::VerificationFailed);
    assert_eq!(record.stage, Some(Stage::Turn1));
}

fn make_finalizer(
    store: &Arc<InMemoryBlobStore>,
    table: &Arc<InMemoryTableStore>,
) -> ErrorFinalizer {
    ErrorFinalizer::new(
        make_client(store),
        table.clone(),
        Config::new("state", "results"),
    )
}

#[tokio::test]
async fn test_finalize_on_run_with_no_prior_state() {
    let store = Arc::new(InMemoryBlobStore::new());
    let table = Arc::new(InMemoryTableStore::new());
    let finalizer = make_finalizer(&store, &table);

    // Nothing was ever written for this run; the sink still produces a
    // complete terminal report.
    let report = finalizer
        .finalize(ErrorFinalizationRequest::minimal("run-never-started"))
        .await;

    assert_eq!(report.verification_id, "run-never-started");
    assert_eq!(report.status, VerificationStatus::VerificationFailed);
    assert_eq!(report.failed_stage, Stage::Unknown);
    assert!(!report.error.message.is_empty());
}
