//! Durable SQLite-backed store for send state: `send_events` (append-only
//! log), `send_locks` (current per-request state), `url_alias`, and
//! `rerun_overrides`.
//!
//! Two connections to the same database file give the store two durability
//! tiers: `main` (`synchronous=NORMAL`) for lock bookkeeping that can be
//! safely replayed from the event log, and `sent` (`synchronous=FULL`),
//! reserved for the one write that must never be lost — committing `SENT`.

mod overrides;
mod queries;
mod retry;

use std::path::Path;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqliteSynchronous;
use sqlx::SqlitePool;

pub use overrides::OverrideRecord;
pub use queries::ReserveOutcome;
pub use queries::RunSummary;

use crate::domain::DecisionTrace;
use crate::domain::MessageIdSource;
use crate::domain::OverrideDecision;
use crate::domain::SendEvent;
use crate::domain::SendLock;
use crate::domain::SendStatus;
use crate::errors::CoreError;

pub struct SendLedger {
    main: SqlitePool,
    sent: SqlitePool,
    busy_timeout: Duration,
    retry_attempts: u32,
}

impl SendLedger {
    /// Opens (creating if absent) the ledger file at `path` and runs
    /// embedded migrations. `busy_timeout_ms`/`retry_attempts` bound the
    /// exponential-backoff-with-jitter retry wrapped around every write (see
    /// `retry::with_busy_retry`).
    pub async fn connect(path: &Path, busy_timeout_ms: u64, retry_attempts: u32) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let busy_timeout = Duration::from_millis(busy_timeout_ms);

        let main = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(busy_timeout),
        )
        .await?;

        sqlx::migrate!("./migrations").run(&main).await.map_err(|e| CoreError::Ledger(sqlx::Error::Migrate(Box::new(e))))?;

        let sent = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Full)
                .busy_timeout(busy_timeout),
        )
        .await?;

        Ok(Self { main, sent, busy_timeout: busy_timeout, retry_attempts })
    }

    /// Deletes expired events, locks, and overrides. Called once at the top
    /// of every batch. Each table group is cleaned inside its own
    /// transaction so a mid-sweep failure never leaves a table half-swept
    /// alongside a fully-swept one in a way that matters: each delete is
    /// independently idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_on_batch_start(
        &self,
        retention_days: i64,
        rerun_window_h: i64,
        unknown_hold_s: i64,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let event_cutoff = now - chrono::Duration::days(retention_days);
        let in_progress_cutoff = now - chrono::Duration::hours(rerun_window_h.max(24));
        let unknown_cutoff = now - chrono::Duration::seconds(unknown_hold_s.max(1800));

        retry::with_busy_retry(self.retry_attempts, || async {
            sqlx::query("DELETE FROM send_events WHERE created_at < ?")
                .bind(event_cutoff)
                .execute(&self.main)
                .await
        })
        .await?;

        retry::with_busy_retry(self.retry_attempts, || async {
            sqlx::query("DELETE FROM send_locks WHERE status = 'IN_PROGRESS' AND expires_at < ?")
                .bind(in_progress_cutoff)
                .execute(&self.main)
                .await
        })
        .await?;

        retry::with_busy_retry(self.retry_attempts, || async {
            sqlx::query("DELETE FROM send_locks WHERE status = 'UNKNOWN_SENT' AND expires_at < ?")
                .bind(unknown_cutoff)
                .execute(&self.main)
                .await
        })
        .await?;

        retry::with_busy_retry(self.retry_attempts, || async {
            sqlx::query("DELETE FROM rerun_overrides WHERE expires_at < ?").bind(now).execute(&self.main).await
        })
        .await?;

        Ok(())
    }

    pub async fn reserve_send(
        &self,
        request_key: &str,
        v1_key: Option<&str>,
        key_version: &str,
        mail_key: &str,
        run_id: &str,
        recipient_hash: &str,
        ttl_s: i64,
    ) -> Result<ReserveOutcome, CoreError> {
        queries::reserve_send(&self.main, self.retry_attempts, request_key, v1_key, key_version, mail_key, run_id, recipient_hash, ttl_s)
            .await
    }

    pub async fn heartbeat(&self, request_key: &str, ttl_s: i64) -> Result<(), CoreError> {
        queries::heartbeat(&self.main, self.retry_attempts, request_key, ttl_s).await
    }

    /// The commit point. Runs on the `sent` (fsync-on-every-write)
    /// connection because this is the one row that must never be lost.
    #[tracing::instrument(skip(self, decision_trace))]
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_sent(
        &self,
        request_key: &str,
        v1_key: Option<&str>,
        key_version: &str,
        mail_key: &str,
        run_id: &str,
        recipient_hash: &str,
        message_id: &str,
        message_id_source: MessageIdSource,
        idempotency_token: &str,
        idempotency_secret_version: &str,
        subject_norm: &str,
        decision_trace: &DecisionTrace,
    ) -> Result<(), CoreError> {
        queries::mark_sent(
            &self.sent,
            self.retry_attempts,
            request_key,
            v1_key,
            key_version,
            mail_key,
            run_id,
            recipient_hash,
            message_id,
            message_id_source,
            idempotency_token,
            idempotency_secret_version,
            subject_norm,
            decision_trace,
        )
        .await
    }

    pub async fn mark_failed_pre_send(
        &self,
        request_key: &str,
        run_id: &str,
        recipient_hash: &str,
        error: &str,
        decision_trace: &DecisionTrace,
    ) -> Result<(), CoreError> {
        queries::mark_failed_pre_send(&self.main, self.retry_attempts, request_key, run_id, recipient_hash, error, decision_trace).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mark_unknown_sent(
        &self,
        request_key: &str,
        v1_key: Option<&str>,
        key_version: &str,
        mail_key: &str,
        run_id: &str,
        recipient_hash: &str,
        message_id: &str,
        message_id_source: MessageIdSource,
        error: Option<&str>,
        hold_s: i64,
        decision_trace: &DecisionTrace,
    ) -> Result<(), CoreError> {
        queries::mark_unknown_sent(
            &self.main,
            self.retry_attempts,
            request_key,
            v1_key,
            key_version,
            mail_key,
            run_id,
            recipient_hash,
            message_id,
            message_id_source,
            error,
            hold_s,
            decision_trace,
        )
        .await
    }

    /// Promotes an existing `UNKNOWN_SENT` lock to `SENT` once reconciliation
    /// finds a matching sent item.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_reconciled_sent(
        &self,
        lock: &SendLock,
        run_id: &str,
        message_id: &str,
        source: MessageIdSource,
        idempotency_token: &str,
        idempotency_secret_version: &str,
        decision_trace: &DecisionTrace,
    ) -> Result<(), CoreError> {
        self.mark_sent(
            &lock.request_key,
            lock.v1_key.as_deref(),
            &lock.key_version,
            &lock.mail_key,
            run_id,
            &lock.recipient_hash,
            message_id,
            source,
            idempotency_token,
            idempotency_secret_version,
            "",
            decision_trace,
        )
        .await
    }

    pub async fn get_lock(&self, request_key: &str) -> Result<Option<SendLock>, CoreError> {
        queries::get_lock(&self.main, request_key).await
    }

    /// Deletes a lock outright without writing an event, used to clear a
    /// `UNKNOWN_SENT` hold once an operator has explicitly confirmed a
    /// resend.
    pub async fn clear_lock(&self, request_key: &str) -> Result<(), CoreError> {
        queries::clear_lock(&self.main, self.retry_attempts, request_key).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_skip(
        &self,
        request_key: &str,
        v1_key: Option<&str>,
        key_version: &str,
        mail_key: &str,
        run_id: &str,
        recipient_hash: &str,
        status: SendStatus,
        decision_trace: &DecisionTrace,
    ) -> Result<(), CoreError> {
        queries::record_skip_event(&self.main, self.retry_attempts, request_key, v1_key, key_version, mail_key, run_id, recipient_hash, status, decision_trace)
            .await
    }

    /// Per-status event counts for a `run_id`; lets the workflow arbiter
    /// reconstruct batch success without a live `BatchResult`.
    pub async fn summarize_run(&self, run_id: &str) -> Result<RunSummary, CoreError> {
        queries::summarize_run(&self.main, run_id).await
    }

    pub async fn find_recent_sent(
        &self,
        request_key: &str,
        v1_key: Option<&str>,
        window_h: i64,
        run_scope: Option<&str>,
    ) -> Result<Option<SendEvent>, CoreError> {
        queries::find_recent_sent(&self.main, request_key, v1_key, window_h, run_scope).await
    }

    pub async fn record_url_alias(
        &self,
        canonical: &str,
        last_final_url: Option<&str>,
        final_host: Option<&str>,
        redirect_hops: i64,
        final_url_fingerprint: Option<&str>,
        resolve_status: &str,
    ) -> Result<(), CoreError> {
        queries::record_url_alias(&self.main, self.retry_attempts, canonical, last_final_url, final_host, redirect_hops, final_url_fingerprint, resolve_status)
            .await
    }

    pub async fn add_override(&self, record: &OverrideRecord) -> Result<(), CoreError> {
        overrides::add_override(&self.main, self.retry_attempts, record).await
    }

    pub async fn clear_overrides(&self, kind: &str, target_hash: &str) -> Result<u64, CoreError> {
        overrides::clear_overrides(&self.main, kind, target_hash).await
    }

    pub async fn override_status(&self, kind: &str, target_hash: &str) -> Result<Option<bool>, CoreError> {
        overrides::override_status(&self.main, kind, target_hash).await
    }

    /// Request-key overrides take precedence over recipient overrides; both
    /// outcomes append a `decision_trace` tag regardless of whether they end
    /// up allowing the send.
    pub async fn evaluate_override(&self, request_key: &str, recipient_hash: &str) -> Result<OverrideDecision, CoreError> {
        overrides::evaluate_override(&self.main, request_key, recipient_hash).await
    }

    pub fn busy_timeout(&self) -> Duration { self.busy_timeout }
}

pub(crate) fn status_from_row(s: &str) -> SendStatus { s.parse().unwrap_or(SendStatus::FailedPreSend) }

pub(crate) fn now_utc() -> DateTime<Utc> { Utc::now() }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OverrideKind;

    async fn open_ledger() -> (tempfile::TempDir, SendLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SendLedger::connect(&dir.path().join("ledger.sqlite3"), 1000, 5).await.unwrap();
        (dir, ledger)
    }

    #[tokio::test]
    async fn reserve_is_exclusive_per_request_key() {
        let (_dir, ledger) = open_ledger().await;
        let outcome = ledger.reserve_send("rq:v2:a", None, "v2", "mk:v2:a", "run-1", "hash-a", 300).await.unwrap();
        assert_eq!(outcome, ReserveOutcome::Acquired);

        let conflict = ledger.reserve_send("rq:v2:a", None, "v2", "mk:v2:a", "run-2", "hash-a", 300).await.unwrap();
        assert_eq!(conflict, ReserveOutcome::InProgressActive);
    }

    #[tokio::test]
    async fn mark_sent_releases_lock_and_appends_event() {
        let (_dir, ledger) = open_ledger().await;
        ledger.reserve_send("rq:v2:b", None, "v2", "mk:v2:b", "run-1", "hash-b", 300).await.unwrap();

        ledger
            .mark_sent(
                "rq:v2:b",
                None,
                "v2",
                "mk:v2:b",
                "run-1",
                "hash-b",
                "MID-1",
                MessageIdSource::Direct,
                "token-1",
                "v1",
                "subject",
                &DecisionTrace::new(),
            )
            .await
            .unwrap();

        assert!(ledger.get_lock("rq:v2:b").await.unwrap().is_none());
        let recent = ledger.find_recent_sent("rq:v2:b", None, 24, None).await.unwrap();
        assert!(recent.is_some());
        assert_eq!(recent.unwrap().message_id.as_deref(), Some("MID-1"));
    }

    #[tokio::test]
    async fn unknown_sent_then_reconciled_produces_exactly_one_sent_event() {
        let (_dir, ledger) = open_ledger().await;
        ledger.reserve_send("rq:v2:c", None, "v2", "mk:v2:c", "run-1", "hash-c", 300).await.unwrap();
        ledger
            .mark_unknown_sent("rq:v2:c", None, "v2", "mk:v2:c", "run-1", "hash-c", "MID-2", MessageIdSource::Direct, None, 1800, &DecisionTrace::new())
            .await
            .unwrap();

        let lock = ledger.get_lock("rq:v2:c").await.unwrap().unwrap();
        assert_eq!(lock.status, "UNKNOWN_SENT");
        assert_eq!(lock.last_message_id.as_deref(), Some("MID-2"));

        ledger
            .mark_reconciled_sent(&lock, "run-2", "MID-2", MessageIdSource::ReconcileHeader, "token-c", "v1", &DecisionTrace::new())
            .await
            .unwrap();

        assert!(ledger.get_lock("rq:v2:c").await.unwrap().is_none());
        let recent = ledger.find_recent_sent("rq:v2:c", None, 24, None).await.unwrap();
        assert_eq!(recent.unwrap().message_id.as_deref(), Some("MID-2"));
    }

    // Invariant 6 / S5: request_key override takes precedence over a
    // recipient override active for the same underlying person.
    #[tokio::test]
    async fn override_precedence_prefers_request_key() {
        let (_dir, ledger) = open_ledger().await;
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

    #[tokio::test]
    async fn cleanup_does_not_sweep_unknown_sent_lock_still_within_hold() {
        let (_dir, ledger) = open_ledger().await;
        ledger.reserve_send("rq:v2:e", None, "v2", "mk:v2:e", "run-1", "hash-e", 300).await.unwrap();
        ledger
            .mark_unknown_sent("rq:v2:e", None, "v2", "mk:v2:e", "run-1", "hash-e", "MID-3", MessageIdSource::Direct, None, 1800, &DecisionTrace::new())
            .await
            .unwrap();
        // the hold window has not elapsed yet, so the sweep must leave it alone
        ledger.cleanup_on_batch_start(90, 24, 1800).await.unwrap();
        assert!(ledger.get_lock("rq:v2:e").await.unwrap().is_some());
    }
}
