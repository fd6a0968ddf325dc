use thiserror::Error;

use crate::types::{ParticipantId, SourceId, Xid};

/// Convenience alias for `Result<T, ShardgateError>`.
pub type ShardgateResult<T> = Result<T, ShardgateError>;

/// MySQL error number for "XAER_NOTA: Unknown XID".
pub const ER_XAER_NOTA: u16 = 1397;
/// MySQL error number used for errors without a more specific code.
pub const ER_UNKNOWN_ERROR: u16 = 1105;
/// MySQL error number for "Query execution was interrupted".
pub const ER_QUERY_INTERRUPTED: u16 = 1317;
/// MySQL error number for "XAER_RMERR" (resource manager failure).
pub const ER_XA_RMERR: u16 = 1401;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`  : bad input or a request the current state does not allow
/// - `Retryable`  : backend refused or lost the command; caller SHOULD retry
/// - `Transient`  : timeout, interruption, backpressure; caller MAY retry after back-off
/// - `InternalBug`: should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum ShardgateError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("XA error: {0}")]
    Xa(#[from] XaError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Transient resource/backpressure error.
    #[error("Transient: {reason} (retry after {retry_after_ms}ms)")]
    Transient { reason: String, retry_after_ms: u64 },

    /// Internal bug. Always carries a unique `error_code` and `debug_context`.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Durable storage errors (transaction log backing store).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted log at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result-merge errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("Merge interrupted: queue closed")]
    Interrupted,

    #[error("Merge cancelled: {0}")]
    Cancelled(String),

    #[error("Backend {source_id} error {code}: {message}")]
    Backend {
        source_id: SourceId,
        code: u16,
        message: String,
    },

    #[error("Field description from {source_id} has {actual} columns, expected {expected}")]
    SchemaMismatch {
        source_id: SourceId,
        expected: usize,
        actual: usize,
    },

    #[error("Downstream sink failed: {0}")]
    Sink(String),

    #[error("All {0} sources failed")]
    AllSourcesFailed(usize),
}

/// Distributed (XA) transaction errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum XaError {
    #[error("Unknown transaction {0}")]
    UnknownTransaction(Xid),

    #[error("Transaction {xid} is in stage {stage}, cannot {op}")]
    InvalidState {
        xid: Xid,
        stage: String,
        op: &'static str,
    },

    #[error("Transaction {xid} log write failed: {reason}")]
    LogFailure { xid: Xid, reason: String },

    #[error("Transaction {xid} backend {participant} failed: {message}")]
    Backend {
        xid: Xid,
        participant: ParticipantId,
        message: String,
    },

    #[error("Transaction {xid} is frozen after a failed XA END ({code}: {message}); issue ROLLBACK")]
    Frozen { xid: Xid, code: u16, message: String },
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(String),
}

impl ShardgateError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShardgateError::Merge(MergeError::SchemaMismatch { .. }) => ErrorKind::UserError,
            ShardgateError::Xa(XaError::UnknownTransaction(_)) => ErrorKind::UserError,
            ShardgateError::Xa(XaError::InvalidState { .. }) => ErrorKind::UserError,
            ShardgateError::Xa(XaError::Frozen { .. }) => ErrorKind::UserError,
            ShardgateError::Config(_) => ErrorKind::UserError,

            ShardgateError::Merge(MergeError::Backend { .. }) => ErrorKind::Retryable,
            ShardgateError::Merge(MergeError::AllSourcesFailed(_)) => ErrorKind::Retryable,
            ShardgateError::Xa(XaError::Backend { .. }) => ErrorKind::Retryable,

            ShardgateError::Transient { .. } => ErrorKind::Transient,
            ShardgateError::Merge(MergeError::Interrupted) => ErrorKind::Transient,
            ShardgateError::Merge(MergeError::Cancelled(_)) => ErrorKind::Transient,
            ShardgateError::Merge(MergeError::Sink(_)) => ErrorKind::Transient,
            ShardgateError::Storage(StorageError::Unavailable(_)) => ErrorKind::Transient,

            ShardgateError::InternalBug { .. } => ErrorKind::InternalBug,
            _ => ErrorKind::InternalBug,
        }
    }

    /// Returns true if the caller should retry this operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if this is a transient resource/backpressure error.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Suggested retry delay in milliseconds (0 = retry immediately).
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            ShardgateError::Transient { retry_after_ms, .. } => *retry_after_ms,
            ShardgateError::Storage(StorageError::Unavailable(_)) => 100,
            _ => 0,
        }
    }

    /// Map to the MySQL error number reported to the client.
    pub fn mysql_errno(&self) -> u16 {
        match self {
            ShardgateError::Merge(MergeError::Backend { code, .. }) => *code,
            ShardgateError::Xa(XaError::Frozen { code, .. }) => *code,
            ShardgateError::Merge(MergeError::Interrupted) => ER_QUERY_INTERRUPTED,
            ShardgateError::Merge(MergeError::Cancelled(_)) => ER_QUERY_INTERRUPTED,
            ShardgateError::Xa(XaError::UnknownTransaction(_)) => ER_XAER_NOTA,
            ShardgateError::Xa(XaError::LogFailure { .. }) => ER_XA_RMERR,
            ShardgateError::Xa(XaError::Backend { .. }) => ER_XA_RMERR,
            _ => ER_UNKNOWN_ERROR,
        }
    }

    /// Construct a transient backpressure error.
    pub fn transient(reason: impl Into<String>, retry_after_ms: u64) -> Self {
        ShardgateError::Transient {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    /// Construct an internal bug error with error code and context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        ShardgateError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Add context string to an error, preserving classification where the
    /// variant has a free-form message. Other variants are wrapped as `Internal`.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            ShardgateError::Internal(msg) => ShardgateError::Internal(format!("{ctx}: {msg}")),
            ShardgateError::Transient {
                reason,
                retry_after_ms,
            } => ShardgateError::Transient {
                reason: format!("{ctx}: {reason}"),
                retry_after_ms,
            },
            ShardgateError::InternalBug {
                error_code,
                message,
                debug_context,
            } => ShardgateError::InternalBug {
                error_code,
                message,
                debug_context: format!("{ctx}; {debug_context}"),
            },
            other => ShardgateError::Internal(format!("{ctx}: {other}")),
        }
    }
}
