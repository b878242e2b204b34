//! Common Infrastructure Module
//!
//! Shared utilities and configuration for the orchestrator.
//!
//! This module contains:
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - Common error types

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{ConfigError, Network, OrchestratorConfig, ZkPayConfig, MEMORY_DATABASE};
pub use error::{Result, ZkPayError};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_chain_event, log_ledger_event,
    log_stage_event, log_status_transition, parse_level, status_transition_event, ErrorDetails,
    EventCategory, LogEvent, LoggingError,
};
