//! The non-Windows `OutlookTransport` realized over `lettre`'s async SMTP
//! client. A bare SMTP relay has no server-side "Sent Items" folder to scan,
//! so `ScanSent`/`Reconcile` operate over a local append-only "sent log"
//! table that this transport maintains itself — the poll-then-scan-then-
//! fallback layering stays intact end to end while staying truthful about
//! what an SMTP response can actually expose (most servers echo nothing
//! beyond a queue acknowledgement, not a real `Message-ID`).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration as ChronoDuration;
use chrono::Utc;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::AsyncSmtpTransport;
use lettre::AsyncTransport;
use lettre::Message;
use lettre::Tokio1Executor;
use secrecy::ExposeSecret;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::body_marker;
use super::fallback_message_id;
use super::is_transient_error;
use super::recipients_intersect;
use super::subjects_match;
use super::OutboundMessage;
use super::OutlookTransport;
use super::ReconcileMethod;
use super::ReconcileResult;
use super::SendResult;
use crate::configuration::Settings;
use crate::domain::MessageIdSource;
use crate::errors::CoreError;
use crate::vault::KeyVault;

const POLL_DEADLINE_SEC: f64 = 5.0;
const POLL_STEP_SEC: f64 = 0.5;
const SCAN_WINDOW_BEFORE_SEC: i64 = 360;
const SCAN_WINDOW_AFTER_SEC: i64 = 180;
const MAX_SCAN: i64 = 200;
const SEND_RETRY_ATTEMPTS: u32 = 3;
const SEND_RETRY_SLEEP_MS: u64 = 500;

fn require_secret(vault: &dyn KeyVault, service: &str, name: &str) -> Result<String, CoreError> {
    vault
        .get_secret(service, name)?
        .map(|s| s.expose_secret().clone())
        .ok_or_else(|| CoreError::InvalidInput(format!("missing vault secret {name} under service {service}")))
}

pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    sent_log: SqlitePool,
    dry_run: bool,
    send_interval: Duration,
    last_send: Mutex<Option<Instant>>,
}

impl SmtpTransport {
    /// Reads `smtp_host`/`smtp_port`/`smtp_username`/`smtp_password`/
    /// `smtp_from` from the vault under `settings.credential_target_name`,
    /// the same scoping convention the HMAC and crypto secrets use.
    pub async fn connect(vault: &dyn KeyVault, settings: &Settings, base_dir: &Path, dry_run: bool) -> Result<Self, CoreError> {
        let service = &settings.credential_target_name;
        let host = require_secret(vault, service, "smtp_host")?;
        let port: u16 = require_secret(vault, service, "smtp_port")?
            .parse()
            .map_err(|_| CoreError::InvalidInput("smtp_port is not a valid port number".to_string()))?;
        let username = require_secret(vault, service, "smtp_username")?;
        let password = require_secret(vault, service, "smtp_password")?;
        let from_address = require_secret(vault, service, "smtp_from")?;

        let from: Mailbox = from_address
            .parse()
            .map_err(|e| CoreError::InvalidInput(format!("invalid smtp_from address: {e}")))?;

        let creds = Credentials::new(username, password);
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .map_err(|e| CoreError::InvalidInput(format!("invalid smtp_host: {e}")))?
            .port(port)
            .credentials(creds)
            .build();

        let log_dir = base_dir.join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let sent_log = SqlitePool::connect_with(
            SqliteConnectOptions::new().filename(log_dir.join("smtp_sent_log.sqlite3")).create_if_missing(true),
        )
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sent_log (
                idempotency_token TEXT PRIMARY KEY,
                body_marker TEXT NOT NULL,
                message_id_hint TEXT,
                subject_norm TEXT NOT NULL,
                recipient TEXT NOT NULL,
                message_id TEXT NOT NULL,
                sent_at TEXT NOT NULL
            )",
        )
        .execute(&sent_log)
        .await?;

        Ok(Self {
            mailer,
            from,
            sent_log,
            dry_run,
            send_interval: Duration::from_secs_f64(settings.send_interval_sec.max(0.0)),
            last_send: Mutex::new(None),
        })
    }

    async fn enforce_pacing(&self) {
        let mut last = self.last_send.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.send_interval {
                tokio::time::sleep(self.send_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// `msg.body` already carries the idempotency marker appended by the
    /// orchestrator; this only assembles the envelope around it.
    fn build_message(&self, msg: &OutboundMessage) -> Result<Message, CoreError> {
        let to: Mailbox = msg.to.parse().map_err(|e| CoreError::InvalidInput(format!("invalid recipient address: {e}")))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(msg.subject.clone())
            .body(msg.body.clone())
            .map_err(|e| CoreError::InvalidInput(format!("could not build message: {e}")))
    }

    /// The SMTP response is the only thing there is to "poll": a relay's
    /// final acknowledgement either echoes a `Message-Id:` line or it
    /// doesn't. `POLL_DEADLINE_SEC`/`POLL_STEP_SEC` describe the generic
    /// suspension point (see SPEC_FULL.md §5); a bare SMTP submission has
    /// nothing further to wait on once the response line is in hand.
    fn extract_message_id(response_lines: &[String]) -> Option<String> {
        response_lines.iter().find_map(|line| {
            let lower = line.to_lowercase();
            lower.strip_prefix("message-id:").or_else(|| lower.strip_prefix("message-id")).map(|_| {
                line.splitn(2, ':').nth(1).unwrap_or(line).trim().to_string()
            })
        })
    }

    async fn record_sent(
        &self,
        idempotency_token: &str,
        body_marker: &str,
        subject_norm: &str,
        recipient: &str,
        message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO sent_log (idempotency_token, body_marker, message_id_hint, subject_norm, recipient, message_id, sent_at)
             VALUES (?, ?, NULL, ?, ?, ?, ?)",
        )
        .bind(idempotency_token)
        .bind(body_marker)
        .bind(subject_norm)
        .bind(recipient.to_lowercase())
        .bind(message_id)
        .bind(sent_at.to_rfc3339())
        .execute(&self.sent_log)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OutlookTransport for SmtpTransport {
    async fn send(&self, msg: &OutboundMessage, idempotency_token: &str) -> Result<SendResult, CoreError> {
        let now = Utc::now();
        let marker = body_marker(idempotency_token);

        if self.dry_run {
            let message_id = super::dry_run_message_id();
            self.record_sent(idempotency_token, &marker, &msg.subject, &msg.to, &message_id, now).await?;
            return Ok(SendResult {
                success: true,
                email: msg.to.clone(),
                company_name: String::new(),
                message_id,
                is_fallback_id: false,
                message_id_source: MessageIdSource::DryRun,
                sent_at: now,
                error: None,
            });
        }

        self.enforce_pacing().await;
        let message = self.build_message(msg)?;

        let mut attempt = 0;
        let response = loop {
            match self.mailer.send(message.clone()).await {
                Ok(response) => break response,
                Err(e) => {
                    let text = e.to_string();
                    attempt += 1;
                    if is_transient_error(&text) && attempt < SEND_RETRY_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(SEND_RETRY_SLEEP_MS)).await;
                        continue;
                    }
                    if is_transient_error(&text) {
                        return Err(CoreError::TransportTransient(text));
                    }
                    return Err(CoreError::TransportPermanent(text));
                }
            }
        };

        let response_lines: Vec<String> = response.message().map(str::to_string).collect();
        let (message_id, is_fallback, source) = match Self::extract_message_id(&response_lines) {
            Some(id) => (id, false, MessageIdSource::Direct),
            None => (fallback_message_id(&msg.subject, now), true, MessageIdSource::Fallback),
        };

        self.record_sent(idempotency_token, &marker, &msg.subject, &msg.to, &message_id, now).await?;

        Ok(SendResult {
            success: true,
            email: msg.to.clone(),
            company_name: String::new(),
            message_id,
            is_fallback_id: is_fallback,
            message_id_source: source,
            sent_at: now,
            error: None,
        })
    }

    async fn reconcile(
        &self,
        idempotency_token: &str,
        body_marker: &str,
        message_id_hint: Option<&str>,
        subject_norm: &str,
        recipient: &str,
    ) -> Result<ReconcileResult, CoreError> {
        if let Some(row) = sqlx::query_as::<_, (String,)>("SELECT message_id FROM sent_log WHERE idempotency_token = ?")
            .bind(idempotency_token)
            .fetch_optional(&self.sent_log)
            .await?
        {
            return Ok(ReconcileResult { matched: true, method: Some(ReconcileMethod::Header), message_id: Some(row.0) });
        }

        let now = Utc::now();
        let window_start = (now - ChronoDuration::seconds(SCAN_WINDOW_BEFORE_SEC)).to_rfc3339();
        let window_end = (now + ChronoDuration::seconds(SCAN_WINDOW_AFTER_SEC)).to_rfc3339();
        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT body_marker, subject_norm, recipient, message_id FROM sent_log
             WHERE sent_at >= ? AND sent_at <= ? LIMIT ?",
        )
        .bind(window_start)
        .bind(window_end)
        .bind(MAX_SCAN)
        .fetch_all(&self.sent_log)
        .await?;

        for (row_marker, _row_subject, _row_recipient, row_message_id) in &rows {
            if row_marker == body_marker {
                return Ok(ReconcileResult { matched: true, method: Some(ReconcileMethod::Body), message_id: Some(row_message_id.clone()) });
            }
        }
        if let Some(hint) = message_id_hint {
            if let Some((_, _, _, row_message_id)) = rows.iter().find(|(_, _, _, mid)| mid == hint) {
                return Ok(ReconcileResult { matched: true, method: Some(ReconcileMethod::Body), message_id: Some(row_message_id.clone()) });
            }
        }
        for (_, row_subject, row_recipient, row_message_id) in &rows {
            if subjects_match(row_subject, subject_norm) && recipients_intersect(row_recipient, recipient) {
                return Ok(ReconcileResult { matched: true, method: Some(ReconcileMethod::Body), message_id: Some(row_message_id.clone()) });
            }
        }

        Ok(ReconcileResult { matched: false, method: None, message_id: None })
    }

    fn is_dry_run(&self) -> bool { self.dry_run }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemoryKeyVault;

    fn seeded_vault() -> MemoryKeyVault {
        let vault = MemoryKeyVault::new();
        vault.set_secret("aimitsu-dispatch", "smtp_host", &secrecy::Secret::new("localhost".to_string())).unwrap();
        vault.set_secret("aimitsu-dispatch", "smtp_port", &secrecy::Secret::new("2525".to_string())).unwrap();
        vault.set_secret("aimitsu-dispatch", "smtp_username", &secrecy::Secret::new("user".to_string())).unwrap();
        vault.set_secret("aimitsu-dispatch", "smtp_password", &secrecy::Secret::new("pass".to_string())).unwrap();
        vault.set_secret("aimitsu-dispatch", "smtp_from", &secrecy::Secret::new("sender@example.com".to_string())).unwrap();
        vault
    }

    #[tokio::test]
    async fn dry_run_records_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let vault = seeded_vault();
        let settings: Settings = serde_json::from_str("{}").unwrap();
        let transport = SmtpTransport::connect(&vault, &settings, dir.path(), true).await.unwrap();

        let msg = OutboundMessage { to: "buyer@example.com".to_string(), subject: "Quote".to_string(), body: "Please quote.".to_string() };
        let result = transport.send(&msg, "token-abc").await.unwrap();
        assert!(result.message_id.starts_with("DRYRUN:"));
        assert_eq!(result.message_id_source, MessageIdSource::DryRun);

        let reconciled = transport.reconcile("token-abc", &body_marker("token-abc"), None, "Quote", "buyer@example.com").await.unwrap();
        assert!(reconciled.matched);
        assert_eq!(reconciled.message_id.unwrap(), result.message_id);
    }

    #[tokio::test]
    async fn reconcile_misses_unknown_token() {
        let dir = tempfile::tempdir().unwrap();
        let vault = seeded_vault();
        let settings: Settings = serde_json::from_str("{}").unwrap();
        let transport = SmtpTransport::connect(&vault, &settings, dir.path(), true).await.unwrap();
        let result = transport.reconcile("never-sent", "marker", None, "Quote", "buyer@example.com").await.unwrap();
        assert!(!result.matched);
    }
}
