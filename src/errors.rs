//! Single error currency for the library half of the crate. `main.rs` is the
//! only place that turns one of these into a process exit code; everywhere
//! else propagates with `?`.

use thiserror::Error;

use crate::domain::MessageIdSource;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Exit code 4. Raised before any send attempt; only `url_alias` may
    /// already have been upserted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Exit code 3 at the batch level when any recipient is left in this
    /// state with no callback resolving it.
    #[error("confirmation required: {reason}")]
    ConfirmationRequired { reason: String },

    /// Matched by the transient-error substring heuristics; retried inside
    /// `Transport::send` before ever reaching the orchestrator.
    #[error("transient transport error: {0}")]
    TransportTransient(String),

    /// Recorded as `FAILED_PRE_SEND`; the reservation lock is released.
    #[error("permanent transport error: {0}")]
    TransportPermanent(String),

    /// The transport reported success but the ledger could not confirm the
    /// commit. Never fabricates a `SENT` event; the lock becomes
    /// `UNKNOWN_SENT` carrying the id below for later reconciliation.
    #[error("ledger commit ambiguous after transport success (message_id={message_id}, source={source})")]
    LedgerCommitAmbiguity { message_id: String, source: MessageIdSource },

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error(transparent)]
    Ledger(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl CoreError {
    /// Maps a terminal error to the process exit code documented in the
    /// external-interfaces contract. Non-terminal per-recipient outcomes
    /// (confirmation-required, transient-retried) are folded into the batch
    /// summary before reaching this point; this is only consulted for
    /// errors that abort the whole run.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::InvalidInput(_) => 4,
            CoreError::ConfirmationRequired { .. } => 3,
            _ => 1,
        }
    }
}
