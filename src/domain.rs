//! Shared entity and enum types that cross module boundaries: SQLite rows,
//! JSON records, and the plain structs the orchestrator passes around.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// One line of intended outbound mail, as supplied by the (out-of-scope)
/// contact-list ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub email: String,
    pub company_name: String,
}

/// The product-request fields shared by every recipient in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRequest {
    pub maker_code: String,
    pub product_url: String,
    pub quantity: String,
    pub subject: String,
    /// Un-rendered template body; the Template collaborator (out of scope,
    /// see SPEC_FULL.md PURPOSE & SCOPE) substitutes this into the per-recipient
    /// body. Also the `template_content` half of the legacy `v1_key`.
    #[serde(default)]
    pub body_template: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    InProgress,
    Sent,
    FailedPreSend,
    UnknownSent,
    SkippedConfirmRequired,
    SkippedAuto,
    SkippedDuplicateInRun,
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendStatus::InProgress => "IN_PROGRESS",
            SendStatus::Sent => "SENT",
            SendStatus::FailedPreSend => "FAILED_PRE_SEND",
            SendStatus::UnknownSent => "UNKNOWN_SENT",
            SendStatus::SkippedConfirmRequired => "SKIPPED_CONFIRM_REQUIRED",
            SendStatus::SkippedAuto => "SKIPPED_AUTO",
            SendStatus::SkippedDuplicateInRun => "SKIPPED_DUPLICATE_IN_RUN",
        };
        f.write_str(s)
    }
}

impl FromStr for SendStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "IN_PROGRESS" => SendStatus::InProgress,
            "SENT" => SendStatus::Sent,
            "FAILED_PRE_SEND" => SendStatus::FailedPreSend,
            "UNKNOWN_SENT" => SendStatus::UnknownSent,
            "SKIPPED_CONFIRM_REQUIRED" => SendStatus::SkippedConfirmRequired,
            "SKIPPED_AUTO" => SendStatus::SkippedAuto,
            "SKIPPED_DUPLICATE_IN_RUN" => SendStatus::SkippedDuplicateInRun,
            other => return Err(format!("unknown send status: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageIdSource {
    Direct,
    SentItems,
    Fallback,
    ReconcileHeader,
    ReconcileBody,
    LegacyAppendEntry,
    DryRun,
}

impl fmt::Display for MessageIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageIdSource::Direct => "direct",
            MessageIdSource::SentItems => "sent_items",
            MessageIdSource::Fallback => "fallback",
            MessageIdSource::ReconcileHeader => "reconcile:header",
            MessageIdSource::ReconcileBody => "reconcile:body",
            MessageIdSource::LegacyAppendEntry => "legacy_append_entry",
            MessageIdSource::DryRun => "dry_run",
        };
        f.write_str(s)
    }
}

impl std::error::Error for MessageIdSource {}

impl FromStr for MessageIdSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "direct" => MessageIdSource::Direct,
            "sent_items" => MessageIdSource::SentItems,
            "fallback" => MessageIdSource::Fallback,
            "reconcile:header" => MessageIdSource::ReconcileHeader,
            "reconcile:body" => MessageIdSource::ReconcileBody,
            "legacy_append_entry" => MessageIdSource::LegacyAppendEntry,
            "dry_run" => MessageIdSource::DryRun,
            other => return Err(format!("unknown message id source: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStatus {
    Valid,
    Invalid,
    InputOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    RequestKey,
    Recipient,
}

impl fmt::Display for OverrideKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverrideKind::RequestKey => "request_key",
            OverrideKind::Recipient => "recipient",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verifiable,
    LegacyUnverifiable,
}

/// An append-only row of `send_events`. Immutable once written.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SendEvent {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub request_key: String,
    pub v1_key: Option<String>,
    pub key_version: String,
    pub mail_key: String,
    pub run_id: String,
    pub status: String,
    pub recipient_hash: String,
    pub message_id: Option<String>,
    pub message_id_source: Option<String>,
    pub idempotency_token: Option<String>,
    pub idempotency_secret_version: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub subject_norm: Option<String>,
    pub decision_trace: String,
    pub error: Option<String>,
}

/// At most one row per `request_key` while a send is outstanding.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SendLock {
    pub request_key: String,
    pub v1_key: Option<String>,
    pub key_version: String,
    pub mail_key: String,
    pub run_id: String,
    pub status: String,
    pub recipient_hash: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_id: Option<String>,
    pub last_message_id_source: Option<String>,
    pub last_error: Option<String>,
}

/// An ordered list of short tags explaining every skip/commit decision, so
/// the audit record is self-explanatory without cross-referencing logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionTrace(pub Vec<String>);

impl DecisionTrace {
    pub fn new() -> Self { Self(Vec::new()) }
    pub fn push(&mut self, tag: impl Into<String>) { self.0.push(tag.into()); }
    pub fn to_json(&self) -> String { serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string()) }
    pub fn from_json(s: &str) -> Self { Self(serde_json::from_str(s).unwrap_or_default()) }
}

/// Result of evaluating `rerun_overrides` for one recipient.
#[derive(Debug, Clone)]
pub struct OverrideDecision {
    pub allowed: bool,
    pub applied_kind: Option<OverrideKind>,
    pub trace: Vec<String>,
}

/// What the orchestrator decided for one recipient, independent of whether
/// the transport was ever invoked.
#[derive(Debug, Clone, Serialize)]
pub struct RecipientOutcome {
    pub email: String,
    pub company_name: String,
    pub request_key: String,
    pub mail_key: String,
    pub action: String,
    pub decision_trace: Vec<String>,
    pub message_id: Option<String>,
    pub message_id_source: Option<String>,
    pub error: Option<String>,
}

/// Aggregate result of one orchestrator batch call.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub run_id: String,
    pub outcomes: Vec<RecipientOutcome>,
    pub sent_count: usize,
    pub failure_count: usize,
    pub confirmation_required_count: usize,
    pub skipped_count: usize,
}

impl BatchResult {
    pub fn success(&self) -> bool { self.failure_count == 0 && self.confirmation_required_count == 0 }
}
