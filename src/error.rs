// src/error.rs
// Error types shared across the relay.

use thiserror::Error;

/// Failures talking to the payment processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("processor request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("processor returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl ProcessorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProcessorError::Api { status: 404, .. })
    }
}

/// Failures in the identity/charge store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Failures delivering a message over a chat channel.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("channel request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("channel rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("{0} channel not configured")]
    Unconfigured(&'static str),
}

/// Top-level taxonomy used by the orchestrator and chat dispatch.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("transfer not committed by the ledger")]
    TransferNotCommitted,

    #[error("transfer queue closed")]
    QueueClosed,
}
