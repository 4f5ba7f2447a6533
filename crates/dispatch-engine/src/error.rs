//! Dispatch error types.

use dispatch_database::{DatabaseError, EventFailure};
use std::error::Error as _;
use thiserror::Error;

/// Dispatch error type.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Store-level failure not originating in SQLite
    #[error("Store error: {0}")]
    Store(String),

    /// Operation handler failure
    #[error("Handler error: {0}")]
    Handler(String),

    /// Transactional claim ran past its budget
    #[error("Claim transaction timed out after {0}ms")]
    ClaimTimeout(u64),
}

impl DispatchError {
    /// Stable code stored as `reason_code` on a failed event.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Database(DatabaseError::TransactionTimeout(_)) | Self::ClaimTimeout(_) => {
                "CLAIM_TIMEOUT"
            }
            Self::Database(DatabaseError::Json(_)) | Self::Database(DatabaseError::InvalidData(_)) => {
                "INVALID_DATA"
            }
            Self::Database(DatabaseError::NotFound(_)) => "NOT_FOUND",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Handler(_) => "HANDLER_ERROR",
        }
    }

    /// Variant name, stored as `error_class`.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Database(_) => "Database",
            Self::Store(_) => "Store",
            Self::Handler(_) => "Handler",
            Self::ClaimTimeout(_) => "ClaimTimeout",
        }
    }

    /// The error and its `source()` chain, one cause per line.
    pub fn error_stack(&self) -> String {
        let mut stack = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            stack.push_str("\ncaused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }
        stack
    }

    pub fn to_failure(&self) -> EventFailure {
        EventFailure {
            reason_code: self.reason_code().to_string(),
            error_class: self.error_class().to_string(),
            error_stack: Some(self.error_stack()),
        }
    }
}

/// Result type alias using DispatchError.
pub type DispatchResult<T> = Result<T, DispatchError>;
