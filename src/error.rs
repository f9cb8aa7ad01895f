//! Typed error taxonomy for the gateway core.
//!
//! Internal plumbing (codec, session, store) propagates these variants with
//! `?`; the API layer is the only place that maps them onto HTTP status
//! codes and stable string codes for clients.

use thiserror::Error;

/// The eight error kinds called out for the core: transport, decode,
/// decrypt, store, validation, auth, conflict, timeout.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("decrypt error: {0}")]
    Decrypt(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("auth error")]
    Auth,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

impl CoreError {
    /// Stable machine-readable code, independent of the Display message.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Transport(_) => "transport",
            CoreError::Decode(_) => "decode",
            CoreError::Decrypt(_) => "decrypt",
            CoreError::Store(_) => "store",
            CoreError::Validation(_) => "validation",
            CoreError::Auth => "auth",
            CoreError::Conflict(_) => "conflict",
            CoreError::Timeout(_) => "timeout",
        }
    }

    /// Whether this kind is ever fatal to the session. Transport/decode/
    /// decrypt are never fatal per the error handling policy; transport
    /// does trigger a reconnect, but the process keeps running.
    pub fn is_fatal(&self) -> bool {
        false
    }
}

/// Store-specific failures, narrower than `CoreError` so the writer task can
/// distinguish "retry once" conditions from permanent ones.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration {0} failed: {1}")]
    Migration(i64, String),

    #[error("writer channel closed")]
    WriterGone,

    #[error("not found")]
    NotFound,

    #[error("write failed: {0}")]
    WriteFailed(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
