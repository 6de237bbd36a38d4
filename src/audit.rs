//! JSON audit log plus CSV sent/unsent lists for one batch. Recipient emails
//! are encrypted at rest (`email_enc`) when a `CryptoBox` is available,
//! masked to `***@domain` otherwise; error payloads are always masked,
//! recursively, regardless of encryption availability.

use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::Digest;

use crate::crypto::CryptoBox;
use crate::domain::BatchResult;
use crate::domain::ProductRequest;
use crate::errors::CoreError;
use crate::utils::mask_email_for_screen;
use crate::utils::mask_emails_in_text;

#[derive(Debug, Clone, Serialize)]
pub struct AuditDetail {
    pub email_enc: String,
    pub company_name: String,
    pub request_key: String,
    pub mail_key: String,
    pub dedupe_key_version: String,
    pub decision_trace: Vec<String>,
    pub action: String,
    pub message_id: Option<String>,
    pub message_id_source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditErrorDetail {
    pub email_masked: String,
    pub request_key: String,
    pub error: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditTotals {
    pub recipients: usize,
    pub sent: usize,
    pub failed: usize,
    pub confirmation_required: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub operator: String,
    pub input_file: String,
    pub product_maker_code: String,
    pub product_url: String,
    pub totals: AuditTotals,
    pub details: Vec<AuditDetail>,
    pub errors: Vec<AuditErrorDetail>,
}

pub struct AuditWriter<'a> {
    base_dir: PathBuf,
    crypto: Option<&'a CryptoBox<'a>>,
}

impl<'a> AuditWriter<'a> {
    pub fn new(base_dir: impl Into<PathBuf>, crypto: Option<&'a CryptoBox<'a>>) -> Self {
        Self { base_dir: base_dir.into(), crypto }
    }

    fn encrypt_or_mask(&self, email: &str) -> String {
        match self.crypto {
            Some(c) => c.encrypt(email).unwrap_or_else(|_| mask_email_for_screen(email)),
            None => mask_email_for_screen(email),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_record(
        &self,
        batch: &BatchResult,
        product: &ProductRequest,
        dedupe_key_version: &str,
        execution_id: &str,
        operator: &str,
        input_file: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> AuditRecord {
        let mut details = Vec::with_capacity(batch.outcomes.len());
        let mut errors = Vec::new();

        for outcome in &batch.outcomes {
            details.push(AuditDetail {
                email_enc: self.encrypt_or_mask(&outcome.email),
                company_name: outcome.company_name.clone(),
                request_key: outcome.request_key.clone(),
                mail_key: outcome.mail_key.clone(),
                dedupe_key_version: dedupe_key_version.to_string(),
                decision_trace: outcome.decision_trace.clone(),
                action: outcome.action.clone(),
                message_id: outcome.message_id.clone(),
                message_id_source: outcome.message_id_source.clone(),
            });

            if let Some(error) = &outcome.error {
                errors.push(AuditErrorDetail {
                    email_masked: crate::utils::mask_email_for_error(&outcome.email),
                    request_key: outcome.request_key.clone(),
                    error: mask_error_value(&Value::String(error.clone())),
                });
            }
        }

        AuditRecord {
            execution_id: execution_id.to_string(),
            started_at,
            finished_at,
            operator: operator.to_string(),
            input_file: input_file.to_string(),
            product_maker_code: product.maker_code.clone(),
            product_url: product.product_url.clone(),
            totals: AuditTotals {
                recipients: batch.outcomes.len(),
                sent: batch.sent_count,
                failed: batch.failure_count,
                confirmation_required: batch.confirmation_required_count,
                skipped: batch.skipped_count,
            },
            details,
            errors,
        }
    }

    pub fn write_audit_json(&self, record: &AuditRecord) -> Result<PathBuf, CoreError> {
        let ts = record.finished_at.format("%Y%m%d_%H%M%S");
        let exec8: String = record.execution_id.chars().take(8).collect();
        let dir = self.base_dir.join("logs");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("audit_{ts}_{exec8}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(record)?)?;
        Ok(path)
    }

    pub fn write_sent_list(&self, record: &AuditRecord, sent_at: &[(String, Option<String>)]) -> Result<PathBuf, CoreError> {
        let ts = record.finished_at.format("%Y%m%d_%H%M%S");
        let dir = self.base_dir.join("logs");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("sent_list_{ts}.csv"));
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["email_enc", "company_name", "sent_at", "message_id"])?;
        let sent_lookup: std::collections::HashMap<&str, &Option<String>> =
            sent_at.iter().map(|(rk, ts)| (rk.as_str(), ts)).collect();
        for detail in record.details.iter().filter(|d| d.action == "sent" || d.action == "skip_reconciled_sent") {
            let sent_ts = sent_lookup.get(detail.request_key.as_str()).and_then(|t| (*t).clone()).unwrap_or_default();
            writer.write_record([&detail.email_enc, &detail.company_name, &sent_ts, detail.message_id.as_deref().unwrap_or("")])?;
        }
        writer.flush()?;
        Ok(path)
    }

    pub fn write_unsent_list(&self, record: &AuditRecord) -> Result<PathBuf, CoreError> {
        let ts = record.finished_at.format("%Y%m%d_%H%M%S");
        let dir = self.base_dir.join("logs");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("unsent_list_{ts}.csv"));
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["email_enc", "company_name", "error"])?;
        for error in &record.errors {
            let detail = record.details.iter().find(|d| d.request_key == error.request_key);
            let company = detail.map(|d| d.company_name.as_str()).unwrap_or("");
            let error_text = error.error.as_str().unwrap_or("").to_string();
            writer.write_record([&error.email_masked, company, &error_text])?;
        }
        writer.flush()?;
        Ok(path)
    }
}

/// Masks every email-shaped substring found anywhere in a JSON value,
/// recursing through objects and arrays so a structured error payload never
/// leaks a recipient address through a nested field.
pub fn mask_error_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(mask_emails_in_text(s)),
        Value::Array(items) => Value::Array(items.iter().map(mask_error_value).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), mask_error_value(v))).collect()),
        other => other.clone(),
    }
}

pub fn sha256_prefix(input: &str, len: usize) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest.chars().take(len).collect()
}

pub fn default_audit_dir(base_dir: &Path) -> PathBuf { base_dir.join("logs") }
