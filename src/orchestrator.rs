//! Per-batch execution: key derivation, duplicate/rerun/override decisions,
//! reservation, transport call, commit-or-unknown, reconciliation. This is
//! the sequential seven-step pipeline that `run-workflow` and `send` both
//! ultimately drive, the one place the at-most-once guarantee is enforced.

use std::collections::HashSet;

use secrecy::Secret;

use crate::configuration::RerunPolicy;
use crate::configuration::RerunScope;
use crate::configuration::Settings;
use crate::domain::BatchResult;
use crate::domain::DecisionTrace;
use crate::domain::MessageIdSource;
use crate::domain::ProductRequest;
use crate::domain::RecipientOutcome;
use crate::domain::RecipientRecord;
use crate::domain::SendStatus;
use crate::errors::CoreError;
use crate::hmac_hasher::build_idempotency_token;
use crate::hmac_hasher::HmacHasher;
use crate::hmac_hasher::RECIPIENT_HASH_SALT_NAME;
use crate::ledger::SendLedger;
use crate::normalize;
use crate::template::TemplateRenderer;
use crate::transport::body_marker;
use crate::transport::OutboundMessage;
use crate::transport::OutlookTransport;
use crate::vault::KeyVault;

fn idempotency_secret_name(version: &str) -> String { format!("idempotency_secret_{version}") }

/// One orchestrator call's worth of input. `confirm_bulk`, `confirm_rerun`,
/// and `confirm_unknown_sent` stand in for the interactive confirmation
/// prompts of an attended run: a non-interactive caller (the CLI, or a test)
/// supplies these pre-resolved rather than blocking on a callback.
pub struct BatchRequest {
    pub run_id: String,
    pub product: ProductRequest,
    pub recipients: Vec<RecipientRecord>,
    pub confirm_bulk: bool,
    pub confirm_rerun: HashSet<String>,
    pub confirm_unknown_sent: HashSet<String>,
}

pub struct SendOrchestrator<'a> {
    ledger: &'a SendLedger,
    transport: &'a dyn OutlookTransport,
    vault: &'a dyn KeyVault,
    hmac: &'a HmacHasher<'a>,
    renderer: &'a dyn TemplateRenderer,
    settings: &'a Settings,
}

impl<'a> SendOrchestrator<'a> {
    pub fn new(
        ledger: &'a SendLedger,
        transport: &'a dyn OutlookTransport,
        vault: &'a dyn KeyVault,
        hmac: &'a HmacHasher<'a>,
        renderer: &'a dyn TemplateRenderer,
        settings: &'a Settings,
    ) -> Self {
        Self { ledger, transport, vault, hmac, renderer, settings }
    }

    fn recipient_salt(&self) -> Result<Secret<String>, CoreError> {
        self.vault
            .get_secret(&self.settings.credential_target_name, RECIPIENT_HASH_SALT_NAME)?
            .ok_or_else(|| CoreError::KeyNotFound(RECIPIENT_HASH_SALT_NAME.to_string()))
    }

    fn idempotency_secret(&self) -> Result<Secret<String>, CoreError> {
        let name = idempotency_secret_name(&self.settings.idempotency_secret_version);
        self.vault
            .get_secret(&self.settings.credential_target_name, &name)?
            .ok_or_else(|| CoreError::KeyNotFound(name))
    }

    #[tracing::instrument(skip(self, request), fields(run_id = %request.run_id, recipients = request.recipients.len()))]
    pub async fn run_batch(&self, request: &BatchRequest) -> Result<BatchResult, CoreError> {
        if request.product.maker_code.trim().is_empty() || request.product.product_url.trim().is_empty() {
            return Err(CoreError::InvalidInput("maker_code and product_url are required".to_string()));
        }
        if request.recipients.len() > self.settings.max_recipients {
            return Err(CoreError::InvalidInput(format!(
                "batch of {} recipients exceeds max_recipients={}",
                request.recipients.len(),
                self.settings.max_recipients
            )));
        }
        if request.recipients.len() >= self.settings.confirmation_threshold && !request.confirm_bulk {
            return Err(CoreError::ConfirmationRequired {
                reason: format!("batch of {} recipients requires bulk confirmation", request.recipients.len()),
            });
        }

        self.ledger
            .cleanup_on_batch_start(self.settings.log_retention_days, self.settings.rerun_window_hours, self.settings.unknown_sent_hold_sec)
            .await?;

        let canonical_url = normalize::canonical_input_url(&request.product.product_url);
        let final_host = url::Url::parse(&canonical_url).ok().and_then(|u| u.host_str().map(str::to_string));
        self.ledger.record_url_alias(&canonical_url, Some(&canonical_url), final_host.as_deref(), 0, None, "input_only").await?;

        let salt = self.recipient_salt()?;
        let idem_secret = self.idempotency_secret()?;

        let mut outcomes = Vec::with_capacity(request.recipients.len());
        let mut seen_request_keys: HashSet<String> = HashSet::new();
        let mut sent_count = 0usize;
        let mut failure_count = 0usize;
        let mut confirmation_required_count = 0usize;
        let mut skipped_count = 0usize;

        for recipient in &request.recipients {
            let rendered = self.renderer.render(&request.product, recipient)?;
            let email_n = normalize::email_norm(&recipient.email);
            let request_key = normalize::request_key(
                &self.settings.dedupe_key_version,
                &recipient.email,
                &request.product.maker_code,
                &request.product.product_url,
                &request.product.quantity,
            );
            let mail_key = normalize::mail_key(&recipient.email, &rendered.subject, &rendered.body);
            let v1_key = normalize::v1_key(&recipient.email, &request.product.subject, &request.product.body_template);
            let recipient_hash = self.hmac.hash_recipient(&email_n, &salt);
            let idempotency_token = build_idempotency_token(&request_key, &idem_secret)?;
            let marker = body_marker(&idempotency_token);

            let mut trace = DecisionTrace::new();

            if !seen_request_keys.insert(request_key.clone()) {
                trace.push("duplicate_in_run");
                self.ledger
                    .record_skip(
                        &request_key,
                        Some(&v1_key),
                        &self.settings.dedupe_key_version,
                        &mail_key,
                        &request.run_id,
                        &recipient_hash,
                        SendStatus::SkippedDuplicateInRun,
                        &trace,
                    )
                    .await?;
                skipped_count += 1;
                outcomes.push(skip_outcome(recipient, &request_key, &mail_key, "skipped_duplicate_in_run", trace, None));
                continue;
            }

            let override_decision = self.ledger.evaluate_override(&request_key, &recipient_hash).await?;
            trace.0.extend(override_decision.trace.clone());

            if let Some(lock) = self.ledger.get_lock(&request_key).await? {
                if lock.status == "UNKNOWN_SENT" {
                    let reconcile = self
                        .transport
                        .reconcile(&idempotency_token, &marker, lock.last_message_id.as_deref(), &normalize::subject_norm(&rendered.subject), &recipient.email)
                        .await?;
                    if reconcile.matched {
                        let message_id = reconcile.message_id.clone().unwrap_or_else(|| lock.last_message_id.clone().unwrap_or_default());
                        let source = match reconcile.method {
                            Some(crate::transport::ReconcileMethod::Header) => MessageIdSource::ReconcileHeader,
                            Some(crate::transport::ReconcileMethod::Body) => MessageIdSource::ReconcileBody,
                            None => MessageIdSource::ReconcileHeader,
                        };
                        trace.push("skip_reconciled_sent");
                        self.ledger
                            .mark_reconciled_sent(&lock, &request.run_id, &message_id, source, &idempotency_token, &self.settings.idempotency_secret_version, &trace)
                            .await?;
                        sent_count += 1;
                        outcomes.push(skip_outcome(recipient, &request_key, &mail_key, "skip_reconciled_sent", trace, Some(message_id)));
                        continue;
                    }
                    if !request.confirm_unknown_sent.contains(&request_key) {
                        trace.push("unknown_sent_unconfirmed");
                        self.ledger
                            .record_skip(
                                &request_key,
                                Some(&v1_key),
                                &self.settings.dedupe_key_version,
                                &mail_key,
                                &request.run_id,
                                &recipient_hash,
                                SendStatus::SkippedConfirmRequired,
                                &trace,
                            )
                            .await?;
                        confirmation_required_count += 1;
                        outcomes.push(skip_outcome(recipient, &request_key, &mail_key, "skipped_confirm_required", trace, None));
                        continue;
                    }
                    trace.push("unknown_sent_confirmed_cleared");
                    self.ledger.clear_lock(&request_key).await?;
                }
            }

            if !override_decision.allowed {
                let scope = match self.settings.rerun_scope {
                    RerunScope::SameRun => Some(request.run_id.as_str()),
                    RerunScope::Global => None,
                };
                let recent = self.ledger.find_recent_sent(&request_key, Some(&v1_key), self.settings.rerun_window_hours, scope).await?;
                if recent.is_some() {
                    match self.settings.rerun_policy_default {
                        RerunPolicy::AutoSkip => {
                            trace.push("rerun_auto_skip");
                            self.ledger
                                .record_skip(
                                    &request_key,
                                    Some(&v1_key),
                                    &self.settings.dedupe_key_version,
                                    &mail_key,
                                    &request.run_id,
                                    &recipient_hash,
                                    SendStatus::SkippedAuto,
                                    &trace,
                                )
                                .await?;
                            skipped_count += 1;
                            outcomes.push(skip_outcome(recipient, &request_key, &mail_key, "skipped_auto", trace, None));
                            continue;
                        }
                        RerunPolicy::Confirm => {
                            if !request.confirm_rerun.contains(&request_key) {
                                trace.push("rerun_confirm_required");
                                self.ledger
                                    .record_skip(
                                        &request_key,
                                        Some(&v1_key),
                                        &self.settings.dedupe_key_version,
                                        &mail_key,
                                        &request.run_id,
                                        &recipient_hash,
                                        SendStatus::SkippedConfirmRequired,
                                        &trace,
                                    )
                                    .await?;
                                confirmation_required_count += 1;
                                outcomes.push(skip_outcome(recipient, &request_key, &mail_key, "skipped_confirm_required", trace, None));
                                continue;
                            }
                            trace.push("rerun_confirmed");
                        }
                    }
                }
            }

            let reserve_outcome = self
                .ledger
                .reserve_send(&request_key, Some(&v1_key), &self.settings.dedupe_key_version, &mail_key, &request.run_id, &recipient_hash, self.settings.dedupe_in_progress_ttl_sec)
                .await?;
            if !reserve_outcome.acquired() {
                trace.push(format!("reserve:{}", reserve_outcome.reason_tag()));
                self.ledger
                    .record_skip(
                        &request_key,
                        Some(&v1_key),
                        &self.settings.dedupe_key_version,
                        &mail_key,
                        &request.run_id,
                        &recipient_hash,
                        SendStatus::SkippedConfirmRequired,
                        &trace,
                    )
                    .await?;
                confirmation_required_count += 1;
                outcomes.push(skip_outcome(recipient, &request_key, &mail_key, "skipped_confirm_required", trace, None));
                continue;
            }
            trace.push("reserved");

            self.ledger.heartbeat(&request_key, self.settings.dedupe_heartbeat_sec).await?;

            let body_with_marker = format!("{}\n\n{}", rendered.body, marker);
            let outbound = OutboundMessage { to: recipient.email.clone(), subject: rendered.subject.clone(), body: body_with_marker };

            match self.transport.send(&outbound, &idempotency_token).await {
                Ok(send_result) => {
                    let commit = self
                        .ledger
                        .mark_sent(
                            &request_key,
                            Some(&v1_key),
                            &self.settings.dedupe_key_version,
                            &mail_key,
                            &request.run_id,
                            &recipient_hash,
                            &send_result.message_id,
                            send_result.message_id_source,
                            &idempotency_token,
                            &self.settings.idempotency_secret_version,
                            &normalize::subject_norm(&rendered.subject),
                            &trace,
                        )
                        .await;
                    match commit {
                        Ok(()) => {
                            trace.push("sent");
                            sent_count += 1;
                            outcomes.push(skip_outcome(recipient, &request_key, &mail_key, "sent", trace, Some(send_result.message_id)));
                        }
                        Err(_) => {
                            trace.push("ledger_commit_ambiguous");
                            self.ledger
                                .mark_unknown_sent(
                                    &request_key,
                                    Some(&v1_key),
                                    &self.settings.dedupe_key_version,
                                    &mail_key,
                                    &request.run_id,
                                    &recipient_hash,
                                    &send_result.message_id,
                                    send_result.message_id_source,
                                    None,
                                    self.settings.unknown_sent_hold_sec,
                                    &trace,
                                )
                                .await?;
                            confirmation_required_count += 1;
                            outcomes.push(skip_outcome(recipient, &request_key, &mail_key, "confirmation_required", trace, Some(send_result.message_id)));
                        }
                    }
                }
                Err(err) => {
                    trace.push("transport_failed");
                    let message = err.to_string();
                    self.ledger.mark_failed_pre_send(&request_key, &request.run_id, &recipient_hash, &message, &trace).await?;
                    failure_count += 1;
                    let mut outcome = skip_outcome(recipient, &request_key, &mail_key, "failed_pre_send", trace, None);
                    outcome.error = Some(message);
                    outcomes.push(outcome);
                }
            }
        }

        let batch = BatchResult { run_id: request.run_id.clone(), outcomes, sent_count, failure_count, confirmation_required_count, skipped_count };
        if !batch.success() {
            tracing::warn!(run_id = %batch.run_id, failures = batch.failure_count, confirm_required = batch.confirmation_required_count, "batch completed with unresolved outcomes");
        }
        Ok(batch)
    }
}

fn skip_outcome(
    recipient: &RecipientRecord,
    request_key: &str,
    mail_key: &str,
    action: &str,
    trace: DecisionTrace,
    message_id: Option<String>,
) -> RecipientOutcome {
    RecipientOutcome {
        email: recipient.email.clone(),
        company_name: recipient.company_name.clone(),
        request_key: request_key.to_string(),
        mail_key: mail_key.to_string(),
        action: action.to_string(),
        decision_trace: trace.0,
        message_id_source: None,
        message_id,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use claims::assert_ok;
    use secrecy::Secret;

    use super::*;
    use crate::hmac_hasher::HmacHasher;
    use crate::ledger::SendLedger;
    use crate::template::PlaceholderRenderer;
    use crate::transport::mock::matched_header;
    use crate::transport::mock::MockTransport;
    use crate::vault::MemoryKeyVault;

    async fn harness() -> (tempfile::TempDir, SendLedger, MemoryKeyVault, Settings) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SendLedger::connect(&dir.path().join("ledger.sqlite3"), 1000, 5).await.unwrap();
        let vault = MemoryKeyVault::new();
        vault.set_secret("aimitsu-dispatch", RECIPIENT_HASH_SALT_NAME, &Secret::new("salt".to_string())).unwrap();
        vault.set_secret("aimitsu-dispatch", &idempotency_secret_name("v1"), &Secret::new("idem-secret".to_string())).unwrap();
        let settings = test_settings();
        (dir, ledger, vault, settings)
    }

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

    // S1: two distinct recipients both send, with distinct request keys.
    #[tokio::test]
    async fn happy_path_two_distinct_recipients() {
        let (_dir, ledger, vault, settings) = harness().await;
        let hmac = HmacHasher::new(&vault, "aimitsu-dispatch", _dir.path(), 90);
        let transport = MockTransport::new();
        let renderer = PlaceholderRenderer;
        let orchestrator = SendOrchestrator::new(&ledger, &transport, &vault, &hmac, &renderer, &settings);

        let recipients = vec![
            RecipientRecord { email: "a@x.test".to_string(), company_name: "A Co".to_string() },
            RecipientRecord { email: "b@x.test".to_string(), company_name: "B Co".to_string() },
        ];
        let request = BatchRequest {
            run_id: "run-1".to_string(),
            product: product(),
            recipients,
            confirm_bulk: false,
            confirm_rerun: HashSet::new(),
            confirm_unknown_sent: HashSet::new(),
        };
        let result = assert_ok!(orchestrator.run_batch(&request).await);
        assert_eq!(result.sent_count, 2);
        assert!(result.success());
        assert_eq!(transport.send_count(), 2);
        let keys: HashSet<_> = result.outcomes.iter().map(|o| o.request_key.clone()).collect();
        assert_eq!(keys.len(), 2);
    }

    // S2: duplicate recipient in one batch sends exactly once.
    #[tokio::test]
    async fn duplicate_in_run_sends_once() {
        let (_dir, ledger, vault, settings) = harness().await;
        let hmac = HmacHasher::new(&vault, "aimitsu-dispatch", _dir.path(), 90);
        let transport = MockTransport::new();
        let renderer = PlaceholderRenderer;
        let orchestrator = SendOrchestrator::new(&ledger, &transport, &vault, &hmac, &renderer, &settings);

        let recipients = vec![
            RecipientRecord { email: "dup@example.com".to_string(), company_name: "Dup Co".to_string() },
            RecipientRecord { email: "dup@example.com".to_string(), company_name: "Dup Co".to_string() },
        ];
        let request = BatchRequest {
            run_id: "run-1".to_string(),
            product: product(),
            recipients,
            confirm_bulk: false,
            confirm_rerun: HashSet::new(),
            confirm_unknown_sent: HashSet::new(),
        };
        let result = assert_ok!(orchestrator.run_batch(&request).await);
        assert_eq!(transport.send_count(), 1);
        assert_eq!(result.sent_count, 1);
        assert_eq!(result.skipped_count, 1);
    }

    // S3: a recent SENT event blocks a rerun under auto_skip.
    #[tokio::test]
    async fn rerun_within_window_is_auto_skipped() {
        let (_dir, ledger, vault, settings) = harness().await;
        let hmac = HmacHasher::new(&vault, "aimitsu-dispatch", _dir.path(), 90);
        let transport = MockTransport::new();
        let renderer = PlaceholderRenderer;
        let orchestrator = SendOrchestrator::new(&ledger, &transport, &vault, &hmac, &renderer, &settings);

        let recipients = vec![RecipientRecord { email: "again@example.com".to_string(), company_name: "Co".to_string() }];
        let request = BatchRequest {
            run_id: "run-1".to_string(),
            product: product(),
            recipients: recipients.clone(),
            confirm_bulk: false,
            confirm_rerun: HashSet::new(),
            confirm_unknown_sent: HashSet::new(),
        };
        assert_ok!(orchestrator.run_batch(&request).await);
        assert_eq!(transport.send_count(), 1);

        let request2 = BatchRequest { run_id: "run-2".to_string(), ..request_with(recipients) };
        let result2 = assert_ok!(orchestrator.run_batch(&request2).await);
        assert_eq!(transport.send_count(), 1);
        assert_eq!(result2.skipped_count, 1);
        assert!(result2.outcomes[0].decision_trace.contains(&"rerun_auto_skip".to_string()));
    }

    fn request_with(recipients: Vec<RecipientRecord>) -> BatchRequest {
        BatchRequest { run_id: "placeholder".to_string(), product: product(), recipients, confirm_bulk: false, confirm_rerun: HashSet::new(), confirm_unknown_sent: HashSet::new() }
    }

    // S4: ambiguous commit transitions to UNKNOWN_SENT; an unresolved reconcile
    // leaves the recipient confirmation-required, a matched reconcile clears it
    // with zero new transport sends.
    #[tokio::test]
    async fn ambiguous_commit_then_reconciled() {
        let (_dir, ledger, vault, settings) = harness().await;
        let hmac = HmacHasher::new(&vault, "aimitsu-dispatch", _dir.path(), 90);
        let transport = MockTransport::new();
        let renderer = PlaceholderRenderer;
        let orchestrator = SendOrchestrator::new(&ledger, &transport, &vault, &hmac, &renderer, &settings);

        let recipient = RecipientRecord { email: "ambiguous@example.com".to_string(), company_name: "Co".to_string() };
        let request_key = normalize::request_key(&settings.dedupe_key_version, &recipient.email, "CODE-1", &product().product_url, "1");
        let recipient_hash = hmac.hash_recipient(&normalize::email_norm(&recipient.email), &Secret::new("salt".to_string()));
        let idem_secret = Secret::new("idem-secret".to_string());
        let idempotency_token = build_idempotency_token(&request_key, &idem_secret).unwrap();

        // simulate a prior ambiguous commit directly on the ledger.
        ledger.reserve_send(&request_key, None, "v2", "mk", "run-0", &recipient_hash, 300).await.unwrap();
        ledger
            .mark_unknown_sent(&request_key, None, "v2", "mk", "run-0", &recipient_hash, "MID-1", MessageIdSource::Direct, None, 1800, &DecisionTrace::new())
            .await
            .unwrap();

        let request = BatchRequest {
            run_id: "run-1".to_string(),
            product: product(),
            recipients: vec![recipient.clone()],
            confirm_bulk: false,
            confirm_rerun: HashSet::new(),
            confirm_unknown_sent: HashSet::new(),
        };

        // no reconcile staged: stays confirmation-required, no new send attempted.
        let result = assert_ok!(orchestrator.run_batch(&request).await);
        assert_eq!(result.confirmation_required_count, 1);
        assert_eq!(transport.send_count(), 0);
        assert!(!result.success());

        // stage a matching reconcile and rerun: promotes to SENT, still zero sends.
        transport.stage_reconcile(&idempotency_token, matched_header("MID-1"));
        let request2 = BatchRequest { run_id: "run-2".to_string(), ..request };
        let result2 = assert_ok!(orchestrator.run_batch(&request2).await);
        assert_eq!(result2.sent_count, 1);
        assert_eq!(transport.send_count(), 0);
        assert!(result2.outcomes[0].decision_trace.contains(&"skip_reconciled_sent".to_string()));
    }
}
