use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use sqlx::SqlitePool;

use super::now_utc;
use super::retry::with_busy_retry;
use crate::domain::DecisionTrace;
use crate::domain::MessageIdSource;
use crate::domain::SendEvent;
use crate::domain::SendLock;
use crate::domain::SendStatus;
use crate::errors::CoreError;

/// Per-status event counts for one `run_id`, used by the workflow arbiter to
/// reconstruct whether a prior `send` invocation succeeded without needing a
/// live `BatchResult` handed across process boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub sent: i64,
    pub failed_pre_send: i64,
    pub unknown_sent: i64,
    pub confirm_required: i64,
    pub skipped: i64,
}

pub async fn summarize_run(pool: &SqlitePool, run_id: &str) -> Result<RunSummary, CoreError> {
    let rows = sqlx::query("SELECT status, COUNT(*) as n FROM send_events WHERE run_id = ? GROUP BY status")
        .bind(run_id)
        .fetch_all(pool)
        .await?;
    let mut summary = RunSummary::default();
    for row in rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        match status.as_str() {
            "SENT" => summary.sent += n,
            "FAILED_PRE_SEND" => summary.failed_pre_send += n,
            "UNKNOWN_SENT" => summary.unknown_sent += n,
            "SKIPPED_CONFIRM_REQUIRED" => summary.confirm_required += n,
            "SKIPPED_AUTO" | "SKIPPED_DUPLICATE_IN_RUN" => summary.skipped += n,
            _ => {}
        }
    }
    Ok(summary)
}

pub async fn clear_lock(pool: &SqlitePool, retry_attempts: u32, request_key: &str) -> Result<(), CoreError> {
    with_busy_retry(retry_attempts, || async {
        sqlx::query("DELETE FROM send_locks WHERE request_key = ?").bind(request_key).execute(pool).await
    })
    .await?;
    Ok(())
}

/// Appends a terminal-but-lockless event: the three `SKIPPED_*` statuses
/// never hold a `send_locks` row, so this only ever inserts into
/// `send_events`.
#[allow(clippy::too_many_arguments)]
pub async fn record_skip_event(
    pool: &SqlitePool,
    retry_attempts: u32,
    request_key: &str,
    v1_key: Option<&str>,
    key_version: &str,
    mail_key: &str,
    run_id: &str,
    recipient_hash: &str,
    status: SendStatus,
    decision_trace: &DecisionTrace,
) -> Result<(), CoreError> {
    let now = now_utc();
    let trace_json = decision_trace.to_json();
    let status_str = status.to_string();
    with_busy_retry(retry_attempts, || async {
        sqlx::query(
            "INSERT INTO send_events
                (created_at, request_key, v1_key, key_version, mail_key, run_id, status, recipient_hash, decision_trace)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(now)
        .bind(request_key)
        .bind(v1_key)
        .bind(key_version)
        .bind(mail_key)
        .bind(run_id)
        .bind(&status_str)
        .bind(recipient_hash)
        .bind(&trace_json)
        .execute(pool)
        .await
    })
    .await?;
    Ok(())
}

/// Why `reserve_send` did or did not acquire the lock. Mirrors the reason
/// vocabulary in SPEC_FULL.md §4.2 so the orchestrator can fold it directly
/// into a `decision_trace` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Acquired,
    InProgressActive,
    InProgressExpired,
    UnknownSentHoldActive,
    UnknownSentHoldExpired,
    LockConflict,
}

impl ReserveOutcome {
    pub fn acquired(&self) -> bool { matches!(self, ReserveOutcome::Acquired) }

    pub fn reason_tag(&self) -> &'static str {
        match self {
            ReserveOutcome::Acquired => "acquired",
            ReserveOutcome::InProgressActive => "in_progress_active",
            ReserveOutcome::InProgressExpired => "in_progress_expired",
            ReserveOutcome::UnknownSentHoldActive => "unknown_sent_hold_active",
            ReserveOutcome::UnknownSentHoldExpired => "unknown_sent_hold_expired",
            ReserveOutcome::LockConflict => "lock_conflict",
        }
    }
}

/// Inside a `BEGIN IMMEDIATE` transaction: checks for an existing lock row
/// and either fails with a classified reason or inserts a fresh
/// `IN_PROGRESS` lock plus a matching event. `BEGIN IMMEDIATE` acquires the
/// write lock up front so two processes racing on the same `request_key`
/// serialize here rather than deadlocking on a later upgrade.
#[allow(clippy::too_many_arguments)]
pub async fn reserve_send(
    pool: &SqlitePool,
    retry_attempts: u32,
    request_key: &str,
    v1_key: Option<&str>,
    key_version: &str,
    mail_key: &str,
    run_id: &str,
    recipient_hash: &str,
    ttl_s: i64,
) -> Result<ReserveOutcome, CoreError> {
    with_busy_retry(retry_attempts, || async {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let existing = sqlx::query(
            "SELECT status, expires_at FROM send_locks WHERE request_key = ?",
        )
        .bind(request_key)
        .fetch_optional(&mut *conn)
        .await?;

        let now = now_utc();

        if let Some(row) = existing {
            let status: String = row.get("status");
            let expires_at: DateTime<Utc> = row.get("expires_at");
            let expired = expires_at < now;

            let outcome = match (status.as_str(), expired) {
                ("IN_PROGRESS", false) => ReserveOutcome::InProgressActive,
                ("IN_PROGRESS", true) => ReserveOutcome::InProgressExpired,
                ("UNKNOWN_SENT", false) => ReserveOutcome::UnknownSentHoldActive,
                ("UNKNOWN_SENT", true) => ReserveOutcome::UnknownSentHoldExpired,
                _ => ReserveOutcome::LockConflict,
            };
            sqlx::query("ROLLBACK").execute(&mut *conn).await?;
            return Ok(outcome);
        }

        let expires_at = now + chrono::Duration::seconds(ttl_s.max(60));

        sqlx::query(
            "INSERT INTO send_locks
                (request_key, v1_key, key_version, mail_key, run_id, status, recipient_hash, expires_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'IN_PROGRESS', ?, ?, ?)",
        )
        .bind(request_key)
        .bind(v1_key)
        .bind(key_version)
        .bind(mail_key)
        .bind(run_id)
        .bind(recipient_hash)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO send_events
                (created_at, request_key, v1_key, key_version, mail_key, run_id, status, recipient_hash, decision_trace)
             VALUES (?, ?, ?, ?, ?, ?, 'IN_PROGRESS', ?, '[]')",
        )
        .bind(now)
        .bind(request_key)
        .bind(v1_key)
        .bind(key_version)
        .bind(mail_key)
        .bind(run_id)
        .bind(recipient_hash)
        .execute(&mut *conn)
        .await?;

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(ReserveOutcome::Acquired)
    })
    .await
}

pub async fn heartbeat(pool: &SqlitePool, retry_attempts: u32, request_key: &str, ttl_s: i64) -> Result<(), CoreError> {
    let now = now_utc();
    let expires_at = now + chrono::Duration::seconds(ttl_s.max(60));
    with_busy_retry(retry_attempts, || async {
        sqlx::query("UPDATE send_locks SET expires_at = ?, updated_at = ? WHERE request_key = ? AND status = 'IN_PROGRESS'")
            .bind(expires_at)
            .bind(now)
            .bind(request_key)
            .execute(pool)
            .await
    })
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn mark_sent(
    pool: &SqlitePool,
    retry_attempts: u32,
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
    let now = now_utc();
    let trace_json = decision_trace.to_json();
    let source = message_id_source.to_string();
    with_busy_retry(retry_attempts, || async {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        sqlx::query("DELETE FROM send_locks WHERE request_key = ?").bind(request_key).execute(&mut *conn).await?;
        sqlx::query(
            "INSERT INTO send_events
                (created_at, request_key, v1_key, key_version, mail_key, run_id, status, recipient_hash,
                 message_id, message_id_source, idempotency_token, idempotency_secret_version, sent_at,
                 subject_norm, decision_trace)
             VALUES (?, ?, ?, ?, ?, ?, 'SENT', ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(now)
        .bind(request_key)
        .bind(v1_key)
        .bind(key_version)
        .bind(mail_key)
        .bind(run_id)
        .bind(recipient_hash)
        .bind(message_id)
        .bind(&source)
        .bind(idempotency_token)
        .bind(idempotency_secret_version)
        .bind(now)
        .bind(subject_norm)
        .bind(&trace_json)
        .execute(&mut *conn)
        .await?;
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(())
    })
    .await
}

pub async fn mark_failed_pre_send(
    pool: &SqlitePool,
    retry_attempts: u32,
    request_key: &str,
    run_id: &str,
    recipient_hash: &str,
    error: &str,
    decision_trace: &DecisionTrace,
) -> Result<(), CoreError> {
    let now = now_utc();
    let trace_json = decision_trace.to_json();
    with_busy_retry(retry_attempts, || async {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        sqlx::query("DELETE FROM send_locks WHERE request_key = ?").bind(request_key).execute(&mut *conn).await?;
        sqlx::query(
            "INSERT INTO send_events
                (created_at, request_key, key_version, mail_key, run_id, status, recipient_hash, error, decision_trace)
             VALUES (?, ?, '', '', ?, 'FAILED_PRE_SEND', ?, ?, ?)",
        )
        .bind(now)
        .bind(request_key)
        .bind(run_id)
        .bind(recipient_hash)
        .bind(error)
        .bind(&trace_json)
        .execute(&mut *conn)
        .await?;
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(())
    })
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn mark_unknown_sent(
    pool: &SqlitePool,
    retry_attempts: u32,
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
    let now = now_utc();
    let expires_at = now + chrono::Duration::seconds(hold_s.max(300));
    let trace_json = decision_trace.to_json();
    let source = message_id_source.to_string();
    with_busy_retry(retry_attempts, || async {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        sqlx::query(
            "INSERT INTO send_locks
                (request_key, v1_key, key_version, mail_key, run_id, status, recipient_hash, expires_at, updated_at,
                 last_message_id, last_message_id_source, last_error)
             VALUES (?, ?, ?, ?, ?, 'UNKNOWN_SENT', ?, ?, ?, ?, ?, ?)
             ON CONFLICT(request_key) DO UPDATE SET
                status = 'UNKNOWN_SENT', expires_at = excluded.expires_at, updated_at = excluded.updated_at,
                last_message_id = excluded.last_message_id, last_message_id_source = excluded.last_message_id_source,
                last_error = excluded.last_error",
        )
        .bind(request_key)
        .bind(v1_key)
        .bind(key_version)
        .bind(mail_key)
        .bind(run_id)
        .bind(recipient_hash)
        .bind(expires_at)
        .bind(now)
        .bind(message_id)
        .bind(&source)
        .bind(error)
        .execute(&mut *conn)
        .await?;
        sqlx::query(
            "INSERT INTO send_events
                (created_at, request_key, v1_key, key_version, mail_key, run_id, status, recipient_hash,
                 message_id, message_id_source, error, decision_trace)
             VALUES (?, ?, ?, ?, ?, ?, 'UNKNOWN_SENT', ?, ?, ?, ?, ?)",
        )
        .bind(now)
        .bind(request_key)
        .bind(v1_key)
        .bind(key_version)
        .bind(mail_key)
        .bind(run_id)
        .bind(recipient_hash)
        .bind(message_id)
        .bind(&source)
        .bind(error)
        .bind(&trace_json)
        .execute(&mut *conn)
        .await?;
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(())
    })
    .await
}

pub async fn get_lock(pool: &SqlitePool, request_key: &str) -> Result<Option<SendLock>, CoreError> {
    let row = sqlx::query_as::<_, SendLock>("SELECT * FROM send_locks WHERE request_key = ?")
        .bind(request_key)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Most recent `SENT` event in `[now - window_h, now]` matching
/// `request_key` **or** `v1_key` (legacy equivalence), optionally scoped to
/// one `run_id`.
pub async fn find_recent_sent(
    pool: &SqlitePool,
    request_key: &str,
    v1_key: Option<&str>,
    window_h: i64,
    run_scope: Option<&str>,
) -> Result<Option<SendEvent>, CoreError> {
    let cutoff = now_utc() - chrono::Duration::hours(window_h);
    let row = match run_scope {
        Some(run_id) => {
            sqlx::query_as::<_, SendEvent>(
                "SELECT * FROM send_events
                 WHERE status = 'SENT' AND created_at >= ? AND run_id = ?
                   AND (request_key = ? OR (v1_key IS NOT NULL AND v1_key = ?))
                 ORDER BY created_at DESC, id DESC LIMIT 1",
            )
            .bind(cutoff)
            .bind(run_id)
            .bind(request_key)
            .bind(v1_key.unwrap_or(""))
            .fetch_optional(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, SendEvent>(
                "SELECT * FROM send_events
                 WHERE status = 'SENT' AND created_at >= ?
                   AND (request_key = ? OR (v1_key IS NOT NULL AND v1_key = ?))
                 ORDER BY created_at DESC, id DESC LIMIT 1",
            )
            .bind(cutoff)
            .bind(request_key)
            .bind(v1_key.unwrap_or(""))
            .fetch_optional(pool)
            .await?
        }
    };
    Ok(row)
}

#[allow(clippy::too_many_arguments)]
pub async fn record_url_alias(
    pool: &SqlitePool,
    retry_attempts: u32,
    canonical: &str,
    last_final_url: Option<&str>,
    final_host: Option<&str>,
    redirect_hops: i64,
    final_url_fingerprint: Option<&str>,
    resolve_status: &str,
) -> Result<(), CoreError> {
    let now = now_utc();
    with_busy_retry(retry_attempts, || async {
        sqlx::query(
            "INSERT INTO url_alias
                (canonical_input_url, last_final_url, final_host, redirect_hops, final_url_fingerprint, resolve_status, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(canonical_input_url) DO UPDATE SET
                last_final_url = excluded.last_final_url, final_host = excluded.final_host,
                redirect_hops = excluded.redirect_hops, final_url_fingerprint = excluded.final_url_fingerprint,
                resolve_status = excluded.resolve_status, resolved_at = excluded.resolved_at",
        )
        .bind(canonical)
        .bind(last_final_url)
        .bind(final_host)
        .bind(redirect_hops)
        .bind(final_url_fingerprint)
        .bind(resolve_status)
        .bind(now)
        .execute(pool)
        .await
    })
    .await?;
    Ok(())
}
