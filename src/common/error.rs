//! Common Error Types for the zkpay orchestrator
//!
//! Provides unified error handling across all modules.

use thiserror::Error;

use crate::accumulator::AccumulatorError;
use crate::storage::StorageError;
use crate::withdraw::ledger::LedgerError;
use crate::withdraw::service::ServiceError;
use crate::withdraw::stage::StageError;

/// Root error type
#[derive(Debug, Error)]
pub enum ZkPayError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    /// Commitment / nullifier input errors
    #[error("accumulator error: {0}")]
    Accumulator(#[from] AccumulatorError),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Allocation ledger errors
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Stage coordinator errors
    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    /// Caller API errors
    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    /// Validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZkPayError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            ZkPayError::Storage(e) => matches!(
                e,
                StorageError::Conflict(_) | StorageError::Connection(_) | StorageError::Database(_)
            ),
            ZkPayError::Stage(e) => e.is_retryable(),
            ZkPayError::Io(_) => true,
            _ => false,
        }
    }

    /// Get a stable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            ZkPayError::Config(_) => "CONFIG_ERROR",
            ZkPayError::Logging(_) => "LOGGING_ERROR",
            ZkPayError::Accumulator(_) => "ACCUMULATOR_ERROR",
            ZkPayError::Storage(_) => "STORAGE_ERROR",
            ZkPayError::Ledger(_) => "LEDGER_ERROR",
            ZkPayError::Stage(_) => "STAGE_ERROR",
            ZkPayError::Service(_) => "SERVICE_ERROR",
            ZkPayError::Validation(_) => "VALIDATION_ERROR",
            ZkPayError::Internal(_) => "INTERNAL_ERROR",
            ZkPayError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias using ZkPayError
pub type Result<T> = std::result::Result<T, ZkPayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ZkPayError::validation("empty allocation list");
        assert!(err.to_string().contains("empty allocation list"));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ZkPayError::from(StorageError::Conflict("wr_1".into())).is_retryable());
        assert!(!ZkPayError::from(StorageError::NotFound("wr_1".into())).is_retryable());
        assert!(!ZkPayError::from(AccumulatorError::NoAllocations).is_retryable());
        assert_eq!(
            ZkPayError::from(AccumulatorError::DuplicateSeq(1)).error_code(),
            "ACCUMULATOR_ERROR"
        );
    }
}
