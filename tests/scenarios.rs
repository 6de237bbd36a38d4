use std::collections::HashSet;

use aimitsu_dispatch::configuration::SendMode;
use aimitsu_dispatch::configuration::Settings;
use aimitsu_dispatch::configuration::WorkflowMode;
use aimitsu_dispatch::domain::DecisionTrace;
use aimitsu_dispatch::domain::MessageIdSource;
use aimitsu_dispatch::domain::OverrideKind;
use aimitsu_dispatch::domain::ProductRequest;
use aimitsu_dispatch::domain::RecipientRecord;
use aimitsu_dispatch::hmac_hasher::build_idempotency_token;
use aimitsu_dispatch::hmac_hasher::HmacHasher;
use aimitsu_dispatch::hmac_hasher::RECIPIENT_HASH_SALT_NAME;
use aimitsu_dispatch::ledger::OverrideRecord;
use aimitsu_dispatch::ledger::SendLedger;
use aimitsu_dispatch::normalize;
use aimitsu_dispatch::orchestrator::BatchRequest;
use aimitsu_dispatch::orchestrator::SendOrchestrator;
use aimitsu_dispatch::template::PlaceholderRenderer;
use aimitsu_dispatch::transport::mock::matched_header;
use aimitsu_dispatch::transport::mock::MockTransport;
use aimitsu_dispatch::vault::FileKeyVault;
use aimitsu_dispatch::vault::KeyVault;
use aimitsu_dispatch::workflow::HearingInput;
use aimitsu_dispatch::workflow::WorkflowArbiter;
use aimitsu_dispatch::workflow::WorkflowRequest;
use aimitsu_dispatch::workflow::WorkflowState;
use chrono::Utc;
use claims::assert_ok;
use secrecy::Secret;

const SERVICE: &str = "aimitsu-dispatch";

fn test_settings() -> Settings {
    serde_json::from_str("{}").unwrap()
}

fn product() -> ProductRequest {
    ProductRequest {
        maker_code: "CODE-1".to_string(),
        product_url: "https://example.com/item?utm_source=a&b=2&a=1".to_string(),
        quantity: "1".to_string(),
        subject: "Quote request".to_string(),
        body_template: "Please quote {{quantity}} units.".to_string(),
    }
}

async fn harness() -> (tempfile::TempDir, SendLedger, FileKeyVault, Settings) {
    let dir = tempfile::tempdir().unwrap();
    let ledger = SendLedger::connect(&dir.path().join("ledger.sqlite3"), 1000, 5).await.unwrap();
    let vault = FileKeyVault::new(dir.path().join("vault.json"));
    vault.set_secret(SERVICE, RECIPIENT_HASH_SALT_NAME, &Secret::new("salt".to_string())).unwrap();
    vault.set_secret(SERVICE, "idempotency_secret_v1", &Secret::new("idem-secret".to_string())).unwrap();
    let settings = test_settings();
    (dir, ledger, vault, settings)
}

fn bare_request(run_id: &str, recipients: Vec<RecipientRecord>) -> BatchRequest {
    BatchRequest {
        run_id: run_id.to_string(),
        product: product(),
        recipients,
        confirm_bulk: false,
        confirm_rerun: HashSet::new(),
        confirm_unknown_sent: HashSet::new(),
    }
}

// S1: two distinct recipients, canonical url dedupes tracking params, each
// gets a distinct request_key and both are delivered.
#[tokio::test]
async fn s1_happy_path_two_distinct_recipients() {
    let (dir, ledger, vault, settings) = harness().await;
    let hmac = HmacHasher::new(&vault, SERVICE, dir.path(), 90);
    let transport = MockTransport::new();
    let renderer = PlaceholderRenderer;
    let orchestrator = SendOrchestrator::new(&ledger, &transport, &vault, &hmac, &renderer, &settings);

    let canonical = normalize::canonical_input_url(&product().product_url);
    assert_eq!(canonical, "https://example.com/item?a=1&b=2");

    let recipients = vec![
        RecipientRecord { email: "a@x.test".to_string(), company_name: "A Co".to_string() },
        RecipientRecord { email: "b@x.test".to_string(), company_name: "B Co".to_string() },
    ];
    let result = assert_ok!(orchestrator.run_batch(&bare_request("run-1", recipients)).await);

    assert_eq!(result.sent_count, 2);
    assert!(result.success());
    assert_eq!(transport.send_count(), 2);
    let keys: HashSet<_> = result.outcomes.iter().map(|o| o.request_key.clone()).collect();
    assert_eq!(keys.len(), 2);
}

// S2: the same recipient appearing twice in one batch is sent exactly once.
#[tokio::test]
async fn s2_duplicate_in_run_sends_once() {
    let (dir, ledger, vault, settings) = harness().await;
    let hmac = HmacHasher::new(&vault, SERVICE, dir.path(), 90);
    let transport = MockTransport::new();
    let renderer = PlaceholderRenderer;
    let orchestrator = SendOrchestrator::new(&ledger, &transport, &vault, &hmac, &renderer, &settings);

    let recipients = vec![
        RecipientRecord { email: "dup@example.com".to_string(), company_name: "Dup Co".to_string() },
        RecipientRecord { email: "dup@example.com".to_string(), company_name: "Dup Co".to_string() },
    ];
    let result = assert_ok!(orchestrator.run_batch(&bare_request("run-1", recipients)).await);

    assert_eq!(transport.send_count(), 1);
    assert_eq!(result.sent_count, 1);
    assert_eq!(result.skipped_count, 1);
}

// S3: a recent SENT event blocks an auto_skip rerun within the policy window.
#[tokio::test]
async fn s3_rerun_within_window_is_auto_skipped() {
    let (dir, ledger, vault, settings) = harness().await;
    let hmac = HmacHasher::new(&vault, SERVICE, dir.path(), 90);
    let transport = MockTransport::new();
    let renderer = PlaceholderRenderer;
    let orchestrator = SendOrchestrator::new(&ledger, &transport, &vault, &hmac, &renderer, &settings);

    let recipients = vec![RecipientRecord { email: "again@example.com".to_string(), company_name: "Co".to_string() }];
    assert_ok!(orchestrator.run_batch(&bare_request("run-1", recipients.clone())).await);
    assert_eq!(transport.send_count(), 1);

    let result2 = assert_ok!(orchestrator.run_batch(&bare_request("run-2", recipients)).await);
    assert_eq!(transport.send_count(), 1);
    assert_eq!(result2.skipped_count, 1);
    assert!(result2.outcomes[0].decision_trace.contains(&"rerun_auto_skip".to_string()));
}

// S4: an ambiguous commit parks the recipient as confirmation-required until a
// matching reconcile clears it, with no additional transport send attempted.
#[tokio::test]
async fn s4_ambiguous_commit_then_reconciled() {
    let (dir, ledger, vault, settings) = harness().await;
    let hmac = HmacHasher::new(&vault, SERVICE, dir.path(), 90);
    let transport = MockTransport::new();
    let renderer = PlaceholderRenderer;
    let orchestrator = SendOrchestrator::new(&ledger, &transport, &vault, &hmac, &renderer, &settings);

    let recipient = RecipientRecord { email: "ambiguous@example.com".to_string(), company_name: "Co".to_string() };
    let request_key = normalize::request_key(&settings.dedupe_key_version, &recipient.email, "CODE-1", &product().product_url, "1");
    let recipient_hash = hmac.hash_recipient(&normalize::email_norm(&recipient.email), &Secret::new("salt".to_string()));
    let idempotency_token = build_idempotency_token(&request_key, &Secret::new("idem-secret".to_string())).unwrap();

    ledger.reserve_send(&request_key, None, "v2", "mk", "run-0", &recipient_hash, 300).await.unwrap();
    ledger
        .mark_unknown_sent(&request_key, None, "v2", "mk", "run-0", &recipient_hash, "MID-1", MessageIdSource::Direct, None, 1800, &DecisionTrace::new())
        .await
        .unwrap();

    let result = assert_ok!(orchestrator.run_batch(&bare_request("run-1", vec![recipient.clone()])).await);
    assert_eq!(result.confirmation_required_count, 1);
    assert_eq!(transport.send_count(), 0);
    assert!(!result.success());

    transport.stage_reconcile(&idempotency_token, matched_header("MID-1"));
    let result2 = assert_ok!(orchestrator.run_batch(&bare_request("run-2", vec![recipient])).await);
    assert_eq!(result2.sent_count, 1);
    assert_eq!(transport.send_count(), 0);
    assert!(result2.outcomes[0].decision_trace.contains(&"skip_reconciled_sent".to_string()));
}

// S5: a request_key override takes precedence over a recipient override when
// both are active for the same pair.
#[tokio::test]
async fn s5_override_precedence_prefers_request_key() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = SendLedger::connect(&dir.path().join("ledger.sqlite3"), 1000, 5).await.unwrap();

    ledger
        .add_override(&OverrideRecord {
            kind: OverrideKind::Recipient,
            target_hash: "hash-d".to_string(),
            ttl_minutes: 10,
            reason: "operator requested".to_string(),
            operator: "alice".to_string(),
            host: "host-1".to_string(),
            command_summary_redacted: "rerun_override --allow-recipient ***".to_string(),
        })
        .await
        .unwrap();
    ledger
        .add_override(&OverrideRecord {
            kind: OverrideKind::RequestKey,
            target_hash: "rq:v2:d".to_string(),
            ttl_minutes: 10,
            reason: "operator requested".to_string(),
            operator: "alice".to_string(),
            host: "host-1".to_string(),
            command_summary_redacted: "rerun_override --allow-key ***".to_string(),
        })
        .await
        .unwrap();

    let decision = ledger.evaluate_override("rq:v2:d", "hash-d").await.unwrap();
    assert!(decision.allowed);
    assert!(decision.trace.contains(&"override_check:request_key=matched_active".to_string()));
    assert!(decision.trace.contains(&"override_applied:request_key".to_string()));
}

// S6: manual send mode completes once matching manual-send evidence is found
// on disk for every recipient in the request.
#[tokio::test]
async fn s6_manual_mode_completes_with_valid_evidence() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = SendLedger::connect(&dir.path().join("ledger.sqlite3"), 1000, 5).await.unwrap();
    let vault = FileKeyVault::new(dir.path().join("vault.json"));
    vault.set_secret(SERVICE, RECIPIENT_HASH_SALT_NAME, &Secret::new("salt".to_string())).unwrap();
    let hmac = HmacHasher::new(&vault, SERVICE, dir.path(), 90);
    let settings = test_settings();
    let arbiter = WorkflowArbiter::new(&ledger, &hmac, &vault, &settings, dir.path());

    let recipients = vec![RecipientRecord { email: "a@x.test".to_string(), company_name: "A".to_string() }];
    let request = WorkflowRequest {
        request_id: "req-1".to_string(),
        run_id: "run-1".to_string(),
        workflow_mode: WorkflowMode::Legacy,
        send_mode: SendMode::Manual,
        hearing_input: None::<HearingInput>,
        user_approved: false,
        product_name: "Widget".to_string(),
        maker_code: "CODE-1".to_string(),
        product_url: "https://example.com/item".to_string(),
        quantity: "1".to_string(),
        recipients,
        operator: "alice".to_string(),
    };

    let evidence_dir = dir.path().join("outputs").join("manual_evidence").join("req-1");
    std::fs::create_dir_all(&evidence_dir).unwrap();
    let evidence = serde_json::json!({
        "request_id": "req-1",
        "run_id": "run-1",
        "operator": "alice",
        "confirmed_at": Utc::now().to_rfc3339(),
        "recipients": [{"email": "a@x.test", "message_id": "MID-1"}],
    });
    std::fs::write(evidence_dir.join("manual_send_evidence_run-1.json"), evidence.to_string()).unwrap();

    let outcome = arbiter.finalize(&request, "draft body").await.unwrap();
    assert_eq!(outcome.state, WorkflowState::Completed);
    assert!(outcome.history_path.exists());
}
