//! Thin arbiter that sits above the orchestrator: chooses among
//! `auto | manual | draft_only` send modes, re-evaluates safety gates when an
//! enhanced hearing changed the recipient set, renders/routes draft
//! markdown, and writes the write-once request-history record.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::FixedOffset;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::configuration::SendMode;
use crate::configuration::Settings;
use crate::configuration::WorkflowMode;
use crate::domain::RecipientRecord;
use crate::domain::VerificationStatus;
use crate::errors::CoreError;
use crate::hmac_hasher::HmacHasher;
use crate::hmac_hasher::RECIPIENT_HASH_SALT_NAME;
use crate::ledger::SendLedger;
use crate::normalize;
use crate::normalize::email_norm;
use crate::utils::sanitize_filename_component;
use crate::vault::KeyVault;

const JST_OFFSET_SECONDS: i32 = 9 * 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct HearingInput {
    #[serde(default)]
    pub recipients_changed: bool,
    #[serde(default)]
    pub final_recipients: Vec<RecipientRecord>,
    pub send_mode: SendMode,
    #[serde(default)]
    pub other_requests: Vec<String>,
    #[serde(default)]
    pub user_approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Completed,
    Blocked,
    Error,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Completed => "completed",
            WorkflowState::Blocked => "blocked",
            WorkflowState::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestHistoryRecord {
    pub request_id: String,
    pub run_id: String,
    pub workflow_mode: String,
    pub send_mode: String,
    pub state: WorkflowState,
    pub final_recipients: Vec<String>,
    pub recipient_hashes: Vec<String>,
    pub blocked_reasons: Vec<String>,
    pub hmac_key_version: String,
    pub verification_status: VerificationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualEvidenceRecipient {
    pub email: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualEvidence {
    pub request_id: String,
    pub run_id: String,
    pub operator: String,
    pub confirmed_at: DateTime<Utc>,
    pub recipients: Vec<ManualEvidenceRecipient>,
}

pub fn manual_evidence_filename(run_id: &str) -> String { format!("manual_send_evidence_{run_id}.json") }

/// Validates the evidence payload against §4.6/invariant 10: exact filename,
/// matching ids, a non-empty recipient list with unique `message_id`s, and a
/// normalized recipient set equal to the expected final set.
pub fn validate_manual_evidence(
    evidence_path: &Path,
    evidence: &ManualEvidence,
    expected_request_id: &str,
    expected_run_id: &str,
    expected_recipients: &[RecipientRecord],
) -> Result<(), String> {
    let expected_name = manual_evidence_filename(expected_run_id);
    let actual_name = evidence_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if actual_name != expected_name {
        return Err(format!("evidence filename {actual_name} does not match expected {expected_name}"));
    }
    if evidence.request_id != expected_request_id || evidence.run_id != expected_run_id {
        return Err("evidence ids do not match the requested run".to_string());
    }
    if evidence.recipients.is_empty() {
        return Err("evidence recipients must be non-empty".to_string());
    }
    let mut message_ids = HashSet::new();
    for r in &evidence.recipients {
        if !message_ids.insert(r.message_id.clone()) {
            return Err(format!("duplicate message_id in evidence: {}", r.message_id));
        }
    }
    let evidence_set: HashSet<String> = evidence.recipients.iter().map(|r| email_norm(&r.email)).collect();
    let expected_set: HashSet<String> = expected_recipients.iter().map(|r| email_norm(&r.email)).collect();
    if evidence_set != expected_set {
        return Err("recipient mismatch".to_string());
    }
    Ok(())
}

/// Replaces `records` with `final_recipients` when the hearing reports a
/// change, preserving original attributes where the normalized email still
/// matches an existing record; otherwise returns `records` unchanged.
pub fn resolve_recipients(records: &[RecipientRecord], hearing: &HearingInput) -> Vec<RecipientRecord> {
    if !hearing.recipients_changed {
        return records.to_vec();
    }
    let by_email: std::collections::HashMap<String, &RecipientRecord> =
        records.iter().map(|r| (email_norm(&r.email), r)).collect();
    hearing
        .final_recipients
        .iter()
        .map(|wanted| match by_email.get(&email_norm(&wanted.email)) {
            Some(existing) => (*existing).clone(),
            None => wanted.clone(),
        })
        .collect()
}

pub fn domain_allowed(email: &str, whitelist: &[String], blacklist: &[String]) -> bool {
    let domain = email_norm(email).split_once('@').map(|(_, d)| d.to_string()).unwrap_or_default();
    if blacklist.iter().any(|d| d.eq_ignore_ascii_case(&domain)) {
        return false;
    }
    if whitelist.is_empty() {
        return true;
    }
    whitelist.iter().any(|d| d.eq_ignore_ascii_case(&domain))
}

/// `{YYMMDD_JST}_{sanitized_product<=40}_{sha256(request_id)[:12]}_{sha256(run_id)[:12]}.md`
pub fn draft_filename(now: DateTime<Utc>, product_name: &str, request_id: &str, run_id: &str) -> String {
    let jst = now.with_timezone(&FixedOffset::east_opt(JST_OFFSET_SECONDS).expect("valid fixed offset"));
    let date = jst.format("%y%m%d");
    let sanitized: String = sanitize_filename_component(product_name).chars().take(40).collect();
    let req_hash = crate::audit::sha256_prefix(request_id, 12);
    let run_hash = crate::audit::sha256_prefix(run_id, 12);
    format!("{date}_{sanitized}_{req_hash}_{run_hash}.md")
}

/// Appends `_v{n}` when `base` already exists in `dir`, starting at `v2` and
/// incrementing until a free name is found. Never overwrites a prior draft.
pub fn versioned_path(dir: &Path, base_filename: &str) -> PathBuf {
    let candidate = dir.join(base_filename);
    if !candidate.exists() {
        return candidate;
    }
    let stem = base_filename.strip_suffix(".md").unwrap_or(base_filename);
    let mut n = 2;
    loop {
        let versioned = dir.join(format!("{stem}_v{n}.md"));
        if !versioned.exists() {
            return versioned;
        }
        n += 1;
    }
}

pub struct WorkflowArbiter<'a> {
    ledger: &'a SendLedger,
    hmac: &'a HmacHasher<'a>,
    vault: &'a dyn KeyVault,
    settings: &'a Settings,
    base_dir: PathBuf,
}

pub struct WorkflowRequest {
    pub request_id: String,
    pub run_id: String,
    pub workflow_mode: WorkflowMode,
    pub send_mode: SendMode,
    pub hearing_input: Option<HearingInput>,
    pub user_approved: bool,
    pub product_name: String,
    pub maker_code: String,
    pub product_url: String,
    pub quantity: String,
    pub recipients: Vec<RecipientRecord>,
    pub operator: String,
}

pub struct WorkflowOutcome {
    pub state: WorkflowState,
    pub draft_path: Option<PathBuf>,
    pub history_path: PathBuf,
    pub blocked_reasons: Vec<String>,
}

impl<'a> WorkflowArbiter<'a> {
    pub fn new(
        ledger: &'a SendLedger,
        hmac: &'a HmacHasher<'a>,
        vault: &'a dyn KeyVault,
        settings: &'a Settings,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { ledger, hmac, vault, settings, base_dir: base_dir.into() }
    }

    fn recipient_salt(&self) -> Result<secrecy::Secret<String>, CoreError> {
        self.vault
            .get_secret(&self.settings.credential_target_name, RECIPIENT_HASH_SALT_NAME)?
            .ok_or_else(|| CoreError::KeyNotFound(RECIPIENT_HASH_SALT_NAME.to_string()))
    }

    fn outputs_dir(&self, sub: &str) -> PathBuf { self.base_dir.join("outputs").join(sub) }

    async fn run_safety_gates(&self, recipients: &[RecipientRecord], request: &WorkflowRequest) -> Result<Vec<String>, CoreError> {
        let mut reasons = Vec::new();
        for r in recipients {
            if !domain_allowed(&r.email, &self.settings.domain_whitelist, &self.settings.domain_blacklist) {
                reasons.push(format!("domain_blocked:{}", email_norm(&r.email).split_once('@').map(|(_, d)| d).unwrap_or("")));
                continue;
            }
            let request_key = normalize::request_key(
                &self.settings.dedupe_key_version,
                &r.email,
                &request.maker_code,
                &request.product_url,
                &request.quantity,
            );
            if let Some(lock) = self.ledger.get_lock(&request_key).await? {
                if lock.status == "IN_PROGRESS" {
                    reasons.push(format!("send_in_progress:{request_key}"));
                }
            }
        }
        Ok(reasons)
    }

    pub fn write_draft(&self, content: &str, now: DateTime<Utc>, request: &WorkflowRequest) -> Result<PathBuf, CoreError> {
        let dir = self.outputs_dir("drafts");
        std::fs::create_dir_all(&dir)?;
        let filename = draft_filename(now, &request.product_name, &request.request_id, &request.run_id);
        let path = versioned_path(&dir, &filename);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn route_draft(&self, draft_path: &Path, to: &str) -> Result<PathBuf, CoreError> {
        let dest_dir = self.outputs_dir(to);
        std::fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(draft_path.file_name().expect("draft path has a filename"));
        std::fs::rename(draft_path, &dest)?;
        Ok(dest)
    }

    fn manual_evidence_path(&self, request_id: &str, run_id: &str) -> PathBuf {
        self.base_dir.join("outputs").join("manual_evidence").join(request_id).join(manual_evidence_filename(run_id))
    }

    fn verification_status(&self) -> VerificationStatus {
        match self.hmac.ensure_active_key(Utc::now()) {
            Ok(version) => self.hmac.verification_status_for_version(&version),
            Err(_) => VerificationStatus::LegacyUnverifiable,
        }
    }

    pub fn write_request_history(&self, record: &RequestHistoryRecord) -> Result<PathBuf, CoreError> {
        let dir = self.base_dir.join("logs").join("request_history").join(&record.request_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", record.run_id));
        if path.exists() {
            return Err(CoreError::InvalidInput(format!("request history already exists at {}", path.display())));
        }
        std::fs::write(&path, serde_json::to_string_pretty(record)?)?;
        Ok(path)
    }

    /// Drives one `run-workflow` invocation end to end: resolves the
    /// recipient set, re-runs safety gates if it changed, arbitrates the
    /// configured send mode, writes the draft and request-history records,
    /// and returns the resulting state.
    pub async fn finalize(&self, request: &WorkflowRequest, draft_body: &str) -> Result<WorkflowOutcome, CoreError> {
        if request.workflow_mode == WorkflowMode::Enhanced && request.hearing_input.is_none() {
            return Err(CoreError::InvalidInput("enhanced workflow mode requires --hearing-input".to_string()));
        }

        let mut blocked_reasons = Vec::new();
        let recipients = match &request.hearing_input {
            Some(hearing) => {
                let resolved = resolve_recipients(&request.recipients, hearing);
                if hearing.recipients_changed {
                    blocked_reasons.extend(self.run_safety_gates(&resolved, request).await?);
                }
                resolved
            }
            None => request.recipients.clone(),
        };

        let now = Utc::now();
        let is_blocked = !blocked_reasons.is_empty();

        let state = if is_blocked {
            WorkflowState::Blocked
        } else {
            match request.send_mode {
                SendMode::Auto => {
                    let summary = self.ledger.summarize_run(&request.run_id).await?;
                    let success = summary.failed_pre_send == 0 && summary.confirm_required == 0;
                    if request.user_approved && success {
                        WorkflowState::Completed
                    } else {
                        WorkflowState::Error
                    }
                }
                SendMode::Manual => {
                    let evidence_path = self.manual_evidence_path(&request.request_id, &request.run_id);
                    match std::fs::read_to_string(&evidence_path) {
                        Ok(raw) => match serde_json::from_str::<ManualEvidence>(&raw) {
                            Ok(evidence) => {
                                match validate_manual_evidence(&evidence_path, &evidence, &request.request_id, &request.run_id, &recipients) {
                                    Ok(()) => WorkflowState::Completed,
                                    Err(reason) => {
                                        blocked_reasons.push(reason);
                                        WorkflowState::Blocked
                                    }
                                }
                            }
                            Err(e) => {
                                blocked_reasons.push(format!("malformed_evidence:{e}"));
                                WorkflowState::Blocked
                            }
                        },
                        Err(_) => {
                            blocked_reasons.push("evidence_missing".to_string());
                            WorkflowState::Pending
                        }
                    }
                }
                SendMode::DraftOnly => {
                    if request.user_approved {
                        WorkflowState::Completed
                    } else {
                        WorkflowState::Pending
                    }
                }
            }
        };

        let draft_path = if matches!(request.send_mode, SendMode::DraftOnly | SendMode::Manual) || state != WorkflowState::Completed {
            let path = self.write_draft(draft_body, now, request)?;
            let routed = match state {
                WorkflowState::Completed => self.route_draft(&path, "completed")?,
                WorkflowState::Blocked | WorkflowState::Error => self.route_draft(&path, "error")?,
                WorkflowState::Pending => path,
            };
            Some(routed)
        } else {
            None
        };

        let active_version = self.hmac.ensure_active_key(now).unwrap_or_default();
        let salt = self.recipient_salt()?;
        let history = RequestHistoryRecord {
            request_id: request.request_id.clone(),
            run_id: request.run_id.clone(),
            workflow_mode: format!("{:?}", request.workflow_mode).to_lowercase(),
            send_mode: format!("{:?}", request.send_mode).to_lowercase(),
            state,
            final_recipients: recipients.iter().map(|r| email_norm(&r.email)).collect(),
            recipient_hashes: recipients.iter().map(|r| self.hmac.hash_recipient(&email_norm(&r.email), &salt)).collect(),
            blocked_reasons: blocked_reasons.clone(),
            hmac_key_version: active_version,
            verification_status: self.verification_status(),
            created_at: now,
        };
        let history_path = self.write_request_history(&history)?;

        Ok(WorkflowOutcome { state, draft_path, history_path, blocked_reasons })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemoryKeyVault;

    #[test]
    fn draft_filename_matches_shape() {
        let now = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let name = draft_filename(now, "Widget Pro", "req-1", "run-1");
        assert!(name.starts_with("240601_Widget Pro_"));
        assert!(name.ends_with(".md"));
    }

    #[test]
    fn versioned_path_avoids_collision() {
        let dir = tempfile::tempdir().unwrap();
        let base = "240601_widget_abc123456789_def123456789.md";
        std::fs::write(dir.path().join(base), "v1").unwrap();
        let path = versioned_path(dir.path(), base);
        assert!(path.file_name().unwrap().to_str().unwrap().contains("_v2"));
    }

    #[test]
    fn manual_evidence_rejects_recipient_mismatch() {
        let evidence = ManualEvidence {
            request_id: "req-1".to_string(),
            run_id: "run-1".to_string(),
            operator: "alice".to_string(),
            confirmed_at: Utc::now(),
            recipients: vec![ManualEvidenceRecipient { email: "a@x.test".to_string(), message_id: "MID-1".to_string() }],
        };
        let expected = vec![
            RecipientRecord { email: "a@x.test".to_string(), company_name: "A".to_string() },
            RecipientRecord { email: "b@x.test".to_string(), company_name: "B".to_string() },
        ];
        let path = PathBuf::from("manual_send_evidence_run-1.json");
        let result = validate_manual_evidence(&path, &evidence, "req-1", "run-1", &expected);
        assert_eq!(result, Err("recipient mismatch".to_string()));
    }

    #[test]
    fn manual_evidence_rejects_duplicate_message_ids() {
        let evidence = ManualEvidence {
            request_id: "req-1".to_string(),
            run_id: "run-1".to_string(),
            operator: "alice".to_string(),
            confirmed_at: Utc::now(),
            recipients: vec![
                ManualEvidenceRecipient { email: "a@x.test".to_string(), message_id: "MID-1".to_string() },
                ManualEvidenceRecipient { email: "b@x.test".to_string(), message_id: "MID-1".to_string() },
            ],
        };
        let expected = vec![
            RecipientRecord { email: "a@x.test".to_string(), company_name: "A".to_string() },
            RecipientRecord { email: "b@x.test".to_string(), company_name: "B".to_string() },
        ];
        let path = PathBuf::from("manual_send_evidence_run-1.json");
        let result = validate_manual_evidence(&path, &evidence, "req-1", "run-1", &expected);
        assert!(result.unwrap_err().contains("duplicate message_id"));
    }

    // S6: manual mode completes with a valid evidence file.
    #[tokio::test]
    async fn manual_mode_completes_with_valid_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SendLedger::connect(&dir.path().join("ledger.sqlite3"), 1000, 5).await.unwrap();
        let vault = MemoryKeyVault::new();
        vault.set_secret("aimitsu-dispatch", RECIPIENT_HASH_SALT_NAME, &secrecy::Secret::new("salt".to_string())).unwrap();
        let hmac = HmacHasher::new(&vault, "aimitsu-dispatch", dir.path(), 90);
        let settings: Settings = serde_json::from_str("{}").unwrap();
        let arbiter = WorkflowArbiter::new(&ledger, &hmac, &vault, &settings, dir.path());

        let recipients = vec![RecipientRecord { email: "a@x.test".to_string(), company_name: "A".to_string() }];
        let request = WorkflowRequest {
            request_id: "req-1".to_string(),
            run_id: "run-1".to_string(),
            workflow_mode: WorkflowMode::Legacy,
            send_mode: SendMode::Manual,
            hearing_input: None,
            user_approved: false,
            product_name: "Widget".to_string(),
            maker_code: "CODE-1".to_string(),
            product_url: "https://example.com/item".to_string(),
            quantity: "1".to_string(),
            recipients: recipients.clone(),
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
}
