//! Scheduler Task Types
//!
//! Stage work is persisted as tasks keyed by (request id, stage) so queued
//! work and retry backoff survive restarts.

use serde::{Deserialize, Serialize};

use super::now_secs;

/// Unit of work the scheduler can dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Generate the proof
    Proof,
    /// Submit the stage-2 transaction
    Execute,
    /// Wait for the stage-2 confirmation
    Confirm,
    /// Quote and start the bridge transfer
    Payout,
    /// Poll the bridge transfer
    PayoutPoll,
    /// Run the hook purchase
    Hook,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Proof => "proof",
            Self::Execute => "execute",
            Self::Confirm => "confirm",
            Self::Payout => "payout",
            Self::PayoutPoll => "payout_poll",
            Self::Hook => "hook",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proof" => Ok(Self::Proof),
            "execute" => Ok(Self::Execute),
            "confirm" => Ok(Self::Confirm),
            "payout" => Ok(Self::Payout),
            "payout_poll" => Ok(Self::PayoutPoll),
            "hook" => Ok(Self::Hook),
            _ => Err(format!("unknown stage: {}", s)),
        }
    }
}

/// A queued unit of stage work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryTask {
    pub request_id: String,
    pub stage: Stage,
    /// Failed attempts so far
    pub attempt: u32,
    /// Unix seconds before which the task must not run
    pub next_eligible_at: u64,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RetryTask {
    pub fn new(request_id: impl Into<String>, stage: Stage, next_eligible_at: u64) -> Self {
        let now = now_secs();
        Self {
            request_id: request_id.into(),
            stage,
            attempt: 0,
            next_eligible_at,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.next_eligible_at <= now
    }
}
