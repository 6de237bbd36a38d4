//! Exponential-backoff-with-jitter retry around writes that may collide with
//! another process holding the same SQLite file, per SPEC_FULL.md §4.2.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::errors::CoreError;

fn is_busy_or_locked(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("busy")
        }
        _ => false,
    }
}

/// Retries `op` up to `attempts` times with exponential backoff (base 20ms,
/// doubling) plus up to 50% jitter, but only when the underlying SQLite
/// error is `SQLITE_BUSY`/`SQLITE_LOCKED`. Any other error is returned
/// immediately.
pub async fn with_busy_retry<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy_or_locked(&err) && attempt + 1 < attempts.max(1) => {
                let base_ms = 20u64 * (1u64 << attempt.min(10));
                let jitter_ms: u64 = rand::thread_rng().gen_range(0..=(base_ms / 2).max(1));
                tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
                attempt += 1;
            }
            Err(err) => return Err(CoreError::Ledger(err)),
        }
    }
}
