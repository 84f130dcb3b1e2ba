//! Error taxonomy for the conversion engine.
//!
//! Errors carry enough context (operation, transaction, stream) for an
//! operator to locate the failing step. The exit-code mapping is the
//! contract the CLI relies on: 1 for configuration/external-client
//! failures, 2 for a clean interruption, 3 for a violated invariant.

use crate::model::{StreamId, TxId};

/// Result type for conversion operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source client exited non-zero (after any retries).
    #[error("source command failed ({operation}): {stderr}")]
    Source { operation: String, stderr: String },

    /// The source returned ill-formed XML.
    #[error("malformed source XML ({context}): {message}")]
    Parse { context: String, message: String },

    /// The target store rejected an operation. Fatal: prior ref updates
    /// are atomic, so state remains consistent and resumable.
    #[error("target store error ({operation}): {message}")]
    Target { operation: String, message: String },

    /// A core invariant no longer holds.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Bad or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The cooperative stop flag was raised between transactions.
    #[error("interrupted; re-run to resume")]
    Interrupted,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn source(operation: impl Into<String>, stderr: impl Into<String>) -> Self {
        Error::Source {
            operation: operation.into(),
            stderr: stderr.into(),
        }
    }

    pub fn parse(context: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Parse {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn target(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Target {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Attach transaction/stream context to an invariant violation.
    pub fn invariant_at(stream: StreamId, tx: TxId, message: impl Into<String>) -> Self {
        Error::Invariant(format!(
            "stream {} transaction {}: {}",
            stream,
            tx,
            message.into()
        ))
    }

    /// Process exit code for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Interrupted => 2,
            Error::Invariant(_) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Config("x".into()).exit_code(), 1);
        assert_eq!(Error::source("hist", "boom").exit_code(), 1);
        assert_eq!(Error::Interrupted.exit_code(), 2);
        assert_eq!(Error::Invariant("x".into()).exit_code(), 3);
    }

    #[test]
    fn test_invariant_context() {
        let err = Error::invariant_at(3, 50, "info ahead of data");
        assert!(err.to_string().contains("stream 3"));
        assert!(err.to_string().contains("transaction 50"));
    }
}
