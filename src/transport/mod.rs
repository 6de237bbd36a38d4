//! The `OutlookTransport` contract: deliver a message, then acquire a
//! server-assigned Message-ID through a poll-then-scan-then-fallback
//! protocol so the orchestrator never blocks indefinitely on a slow mail
//! server and never silently loses the fact that a send happened.

pub mod mock;
pub mod smtp;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use sha2::Digest;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::domain::MessageIdSource;
use crate::errors::CoreError;

/// Substrings that mark a transport failure as transient and therefore
/// worth an in-process retry, carried over verbatim from the prior
/// implementation's classifier.
pub const TRANSIENT_ERROR_SUBSTRINGS: &[&str] = &["timeout", "timed out", "connection", "temporary", "busy"];

pub fn is_transient_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_ERROR_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct SendResult {
    pub success: bool,
    pub email: String,
    pub company_name: String,
    pub message_id: String,
    pub is_fallback_id: bool,
    pub message_id_source: MessageIdSource,
    pub sent_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ReconcileMethod {
    Header,
    Body,
}

#[derive(Debug, Clone)]
pub struct ReconcileResult {
    pub matched: bool,
    pub method: Option<ReconcileMethod>,
    pub message_id: Option<String>,
}

#[async_trait]
pub trait OutlookTransport: Send + Sync {
    /// Submits `msg` and drives the full poll-then-scan-then-fallback
    /// Message-ID acquisition layering before returning.
    async fn send(&self, msg: &OutboundMessage, idempotency_token: &str) -> Result<SendResult, CoreError>;

    /// Attempts to match a prior ambiguous send using the idempotency
    /// token, the body marker, a previously observed message id hint, the
    /// normalized subject, and the recipient address.
    async fn reconcile(
        &self,
        idempotency_token: &str,
        body_marker: &str,
        message_id_hint: Option<&str>,
        subject_norm: &str,
        recipient: &str,
    ) -> Result<ReconcileResult, CoreError>;

    /// Whether this transport is running in dry-run mode, where sends are
    /// recorded but never actually submitted.
    fn is_dry_run(&self) -> bool { false }
}

/// `"[IDEMP:" + token[:24] + "]"`, embedded in the outgoing body so a later
/// scan can reconcile an ambiguous send by content even without a
/// recipient-header or subject match.
pub fn body_marker(idempotency_token: &str) -> String {
    let truncated: String = idempotency_token.chars().take(24).collect();
    format!("[IDEMP:{truncated}]")
}

/// `"FALLBACK:" + UUIDv4 + ":" + unix_seconds + ":" + sha256(subject)[:8]`
pub fn fallback_message_id(subject: &str, now: DateTime<Utc>) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(subject.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("FALLBACK:{}:{}:{}", Uuid::new_v4(), now.timestamp(), &digest[..8])
}

pub fn dry_run_message_id() -> String { format!("DRYRUN:{}", Uuid::new_v4()) }

/// NFKC-normalized equality, matching `subject_norm`'s fold so a subject
/// that round-trips through the transport still compares equal.
pub fn subjects_match(a: &str, b: &str) -> bool { a.nfkc().collect::<String>() == b.nfkc().collect::<String>() }

/// Splits on `,`/`;`, extracts tokens containing `@`, lowercases, and
/// returns whether the two recipient sets intersect.
pub fn recipients_intersect(a: &str, b: &str) -> bool {
    let set_a = extract_email_tokens(a);
    let set_b = extract_email_tokens(b);
    set_a.intersection(&set_b).next().is_some()
}

fn extract_email_tokens(raw: &str) -> std::collections::HashSet<String> {
    raw.split([',', ';'])
        .map(|tok| tok.trim().to_lowercase())
        .filter(|tok| tok.contains('@'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors_by_substring() {
        assert!(is_transient_error("Connection reset by peer"));
        assert!(is_transient_error("operation TIMED OUT"));
        assert!(!is_transient_error("mailbox does not exist"));
    }

    #[test]
    fn fallback_id_has_expected_shape() {
        let id = fallback_message_id("Quote request", Utc::now());
        assert!(id.starts_with("FALLBACK:"));
        assert_eq!(id.split(':').count(), 4);
    }

    #[test]
    fn recipient_sets_intersect_case_insensitively() {
        assert!(recipients_intersect("John@Example.com, other@x.test", "someone@y.test; john@example.com"));
        assert!(!recipients_intersect("a@x.test", "b@x.test"));
    }

    #[test]
    fn body_marker_truncates_token() {
        let token = "0123456789abcdef0123456789abcdef";
        assert_eq!(body_marker(token), "[IDEMP:0123456789abcdef01234567]");
    }
}
