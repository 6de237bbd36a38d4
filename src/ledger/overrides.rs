use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use sqlx::SqlitePool;

use super::now_utc;
use super::retry::with_busy_retry;
use crate::domain::OverrideDecision;
use crate::domain::OverrideKind;
use crate::errors::CoreError;

/// An administrator-created scoped exemption from the rerun/duplicate
/// guards. Never created implicitly by the orchestrator itself.
pub struct OverrideRecord {
    pub kind: OverrideKind,
    pub target_hash: String,
    pub ttl_minutes: i64,
    pub reason: String,
    pub operator: String,
    pub host: String,
    pub command_summary_redacted: String,
}

pub async fn add_override(pool: &SqlitePool, retry_attempts: u32, record: &OverrideRecord) -> Result<(), CoreError> {
    let ttl = record.ttl_minutes.clamp(1, 30);
    let now = now_utc();
    let expires_at = now + chrono::Duration::minutes(ttl);
    with_busy_retry(retry_attempts, || async {
        sqlx::query(
            "INSERT INTO rerun_overrides
                (created_at, expires_at, kind, target_hash, reason, operator, host, command_summary_redacted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(now)
        .bind(expires_at)
        .bind(record.kind.to_string())
        .bind(&record.target_hash)
        .bind(&record.reason)
        .bind(&record.operator)
        .bind(&record.host)
        .bind(&record.command_summary_redacted)
        .execute(pool)
        .await
    })
    .await?;
    Ok(())
}

pub async fn clear_overrides(pool: &SqlitePool, kind: &str, target_hash: &str) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM rerun_overrides WHERE kind = ? AND target_hash = ?")
        .bind(kind)
        .bind(target_hash)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Whether an override row exists for `(kind, target_hash)` and, if so,
/// whether it is still within its TTL. `None` means no such row was ever
/// created.
pub async fn override_status(pool: &SqlitePool, kind: &str, target_hash: &str) -> Result<Option<bool>, CoreError> {
    active_override(pool, kind, target_hash).await
}

async fn active_override(pool: &SqlitePool, kind: &str, target_hash: &str) -> Result<Option<bool>, CoreError> {
    let now = now_utc();
    let row = sqlx::query("SELECT expires_at FROM rerun_overrides WHERE kind = ? AND target_hash = ? ORDER BY created_at DESC LIMIT 1")
        .bind(kind)
        .bind(target_hash)
        .fetch_optional(pool)
        .await?;
    match row {
        None => Ok(None),
        Some(r) => {
            let expires_at: DateTime<Utc> = r.get("expires_at");
            Ok(Some(expires_at >= now))
        }
    }
}

/// `request_key` overrides take precedence over `recipient` overrides. Both
/// checks always append a trace tag, whether or not they end up allowing
/// the send, so the audit record explains every path taken.
pub async fn evaluate_override(pool: &SqlitePool, request_key: &str, recipient_hash: &str) -> Result<OverrideDecision, CoreError> {
    let mut trace = Vec::new();

    match active_override(pool, "request_key", request_key).await? {
        Some(true) => {
            trace.push("override_check:request_key=matched_active".to_string());
            trace.push("override_applied:request_key".to_string());
            return Ok(OverrideDecision { allowed: true, applied_kind: Some(OverrideKind::RequestKey), trace });
        }
        Some(false) => trace.push("override_check:request_key=expired_or_inactive".to_string()),
        None => trace.push("override_check:request_key=not_found".to_string()),
    }

    match active_override(pool, "recipient", recipient_hash).await? {
        Some(true) => {
            trace.push("override_check:recipient=matched_active".to_string());
            trace.push("override_applied:recipient".to_string());
            Ok(OverrideDecision { allowed: true, applied_kind: Some(OverrideKind::Recipient), trace })
        }
        Some(false) => {
            trace.push("override_check:recipient=expired_or_inactive".to_string());
            Ok(OverrideDecision { allowed: false, applied_kind: None, trace })
        }
        None => {
            trace.push("override_check:recipient=not_found".to_string());
            Ok(OverrideDecision { allowed: false, applied_kind: None, trace })
        }
    }
}
