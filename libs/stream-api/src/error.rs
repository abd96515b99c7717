use std::fmt;

use crate::log::{LogOffset, LogPartition};

/// Failure to turn bytes back into a value (or, rarely, a value into bytes).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated input: {0}")]
    Truncated(&'static str),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Error returned by log stores, appenders, tailers and the log manager.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("log '{0}' not found")]
    NotFound(String),

    #[error("{0} is closed")]
    Closed(String),

    #[error("partition {partition} out of range for log '{name}' of size {size}")]
    InvalidPartition {
        name: String,
        partition: u32,
        size: u32,
    },

    #[error("{partition} is already assigned to a tailer of group '{group}'")]
    AlreadyAssigned {
        group: String,
        partition: LogPartition,
    },

    #[error("{0} is not assigned to this tailer")]
    NotAssigned(LogPartition),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cannot decode record at {offset}: {source}")]
    Decode {
        offset: LogOffset,
        #[source]
        source: CodecError,
    },

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("store: {0}")]
    Store(String),
}

impl StreamError {
    /// Add context to the error.
    ///
    /// Only message-carrying variants are rewritten, structured variants are
    /// returned untouched so callers can still match on them.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        match self {
            StreamError::InvalidArgument(msg) => StreamError::InvalidArgument(format!("{ctx}: {msg}")),
            StreamError::Store(msg) => StreamError::Store(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

/// Category of a computation failure. The driver dispatches on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Transient: retry without advancing the offset.
    Retryable,
    /// The computation cannot make progress: halt the partition, no checkpoint.
    Fatal,
    /// Drop the input and carry on.
    Skip,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Retryable => f.write_str("retryable"),
            FailureKind::Fatal => f.write_str("fatal"),
            FailureKind::Skip => f.write_str("skip"),
        }
    }
}

/// Error returned by computation callbacks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputationError {
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("skip: {0}")]
    Skip(String),
}

impl ComputationError {
    pub fn retryable(cause: impl fmt::Display) -> Self {
        Self::Retryable(cause.to_string())
    }

    pub fn fatal(cause: impl fmt::Display) -> Self {
        Self::Fatal(cause.to_string())
    }

    pub fn skip(cause: impl fmt::Display) -> Self {
        Self::Skip(cause.to_string())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ComputationError::Retryable(_) => FailureKind::Retryable,
            ComputationError::Fatal(_) => FailureKind::Fatal,
            ComputationError::Skip(_) => FailureKind::Skip,
        }
    }

    pub fn cause(&self) -> &str {
        match self {
            ComputationError::Retryable(c) | ComputationError::Fatal(c) | ComputationError::Skip(c) => c,
        }
    }

    /// Add context to the error, preserving the kind.
    ///
    /// Produces: `"context: original cause"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        match self {
            ComputationError::Retryable(c) => ComputationError::Retryable(format!("{ctx}: {c}")),
            ComputationError::Fatal(c) => ComputationError::Fatal(format!("{ctx}: {c}")),
            ComputationError::Skip(c) => ComputationError::Skip(format!("{ctx}: {c}")),
        }
    }

    /// Escalate to fatal, keeping the cause.
    pub fn into_fatal(self) -> Self {
        match self {
            ComputationError::Fatal(_) => self,
            other => ComputationError::Fatal(other.cause().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computation_error_keeps_kind_through_context() {
        let err = ComputationError::retryable("connection reset").with_context("flush");
        assert_eq!(err.kind(), FailureKind::Retryable);
        assert_eq!(err.cause(), "flush: connection reset");

        let fatal = err.into_fatal();
        assert_eq!(fatal.kind(), FailureKind::Fatal);
        assert_eq!(fatal.cause(), "flush: connection reset");
    }

    #[test]
    fn stream_error_context_only_touches_messages() {
        let err = StreamError::Store("disk full".into()).with_context("append");
        assert_eq!(err.to_string(), "store: append: disk full");

        let err = StreamError::NotFound("s1".into()).with_context("append");
        assert!(matches!(err, StreamError::NotFound(name) if name == "s1"));
    }
}
