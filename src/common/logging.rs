//! Structured Logging for the zkpay orchestrator
//!
//! Besides ordinary `tracing` output, request-level facts are written as one
//! JSON object per line so audits can replay a request's history:
//! - main-status transitions
//! - calls into stage collaborators, with latency
//! - allocation ledger changes
//! - applied and skipped chain events
//!
//! Every record of a request carries its id as `correlation_id`.
//!
//! ```rust,ignore
//! use zkpay::common::logging::init_logging;
//!
//! init_logging(tracing::Level::INFO, true)?;
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::types::checkbook::AllocationId;
use crate::types::task::Stage;
use crate::types::withdraw::{MainStatus, WithdrawRequest};

/// Parse a configured level name; unknown names mean `info`
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

// ============================================================================
// Audit records
// ============================================================================

/// Which part of the pipeline a record is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Request lifecycle
    Withdraw,
    Allocation,
    Proof,
    Execute,
    Payout,
    Hook,
    /// Chain events seen by the ingester
    Event,
}

impl From<Stage> for EventCategory {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Proof => EventCategory::Proof,
            Stage::Execute | Stage::Confirm => EventCategory::Execute,
            Stage::Payout | Stage::PayoutPoll => EventCategory::Payout,
            Stage::Hook => EventCategory::Hook,
        }
    }
}

/// One audit line
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// RFC 3339
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: Level, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.to_string(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn for_request(mut self, request_id: Option<&str>) -> Self {
        self.correlation_id = request_id.map(str::to_string);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn took(mut self, duration_ms: Option<u64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Attach an error; a record without one is a success
    pub fn failed(mut self, code: &str, message: Option<&str>) -> Self {
        self.error = message.map(|m| ErrorDetails {
            code: code.to_string(),
            message: m.to_string(),
        });
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"message\":{:?},\"serialize_error\":{:?}}}", self.message, e.to_string())
        })
    }

    /// Write the record through `tracing` at its own level
    fn emit(&self) {
        let line = self.to_json();
        match self.level.as_str() {
            "ERROR" => tracing::error!(target: "zkpay::audit", "{}", line),
            "WARN" => tracing::warn!(target: "zkpay::audit", "{}", line),
            _ => tracing::info!(target: "zkpay::audit", "{}", line),
        }
    }
}

/// Audit record of a main-status change, carrying the failure class when
/// the request is failing; `None` when the status did not move
pub fn status_transition_event(request: &WithdrawRequest, from: MainStatus) -> Option<LogEvent> {
    let to = request.status;
    if from == to {
        return None;
    }
    let level = if to == MainStatus::FailedPermanent {
        Level::WARN
    } else {
        Level::INFO
    };
    Some(
        LogEvent::new(level, EventCategory::Withdraw, format!("{} -> {}", from, to))
            .for_request(Some(&request.id))
            .with_data(serde_json::json!({
                "from": from.as_str(),
                "to": to.as_str(),
                "error_class": request.error_class(),
            })),
    )
}

pub fn log_status_transition(request: &WithdrawRequest, from: MainStatus) {
    if let Some(event) = status_transition_event(request, from) {
        event.emit();
    }
}

/// Outcome of a call into a stage collaborator
pub fn log_stage_event(
    stage: Stage,
    request_id: &str,
    action: &str,
    duration_ms: Option<u64>,
    error: Option<&str>,
) {
    let level = if error.is_some() { Level::WARN } else { Level::INFO };
    LogEvent::new(level, stage.into(), format!("{} {}", stage, action))
        .for_request(Some(request_id))
        .with_data(serde_json::json!({ "stage": stage.to_string(), "action": action }))
        .took(duration_ms)
        .failed("STAGE_ERROR", error)
        .emit();
}

/// Allocation lock, release or consumption
pub fn log_ledger_event(
    action: &str,
    request_id: Option<&str>,
    allocations: &[AllocationId],
    error: Option<&str>,
) {
    let level = if error.is_some() { Level::ERROR } else { Level::INFO };
    let ids: Vec<String> = allocations.iter().map(|id| id.to_string()).collect();
    LogEvent::new(level, EventCategory::Allocation, action)
        .for_request(request_id)
        .with_data(serde_json::json!({ "allocations": ids }))
        .failed("LEDGER_ERROR", error)
        .emit();
}

/// Chain event handled by the ingester
pub fn log_chain_event(kind: &str, key: &str, request_id: Option<&str>, applied: bool) {
    LogEvent::new(Level::INFO, EventCategory::Event, kind)
        .for_request(request_id)
        .with_data(serde_json::json!({ "event_key": key, "applied": applied }))
        .emit();
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global subscriber. `RUST_LOG` overrides `level` when set.
pub fn init_logging(level: Level, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("zkpay={}", level.as_str().to_lowercase())));

    let output = if json_format {
        fmt::layer()
            .json()
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .map_err(|e| LoggingError::InitFailed(e.to_string()))
}

pub fn init_from_config(config: &super::config::ZkPayConfig) -> Result<(), LoggingError> {
    init_logging(parse_level(&config.log_level), config.log_json)
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Id tying together log lines of work that has no request id, such as
/// one orchestrator session
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
