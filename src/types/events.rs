//! Chain Event Types
//!
//! Events observed on-chain and delivered at least once by the event bus.
//! Each event is identified by where it was emitted, which is also its
//! de-duplication key.

use serde::{Deserialize, Serialize};

use crate::accumulator::Nullifier;

/// Natural identity of a log entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub chain_id: u32,
    pub tx_hash: String,
    pub log_index: u32,
}

impl EventKey {
    pub fn new(chain_id: u32, tx_hash: impl Into<String>, log_index: u32) -> Self {
        Self {
            chain_id,
            tx_hash: tx_hash.into().to_lowercase(),
            log_index,
        }
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.tx_hash, self.log_index)
    }
}

/// What happened. Withdraw-side events reference the on-chain request id
/// (the first nullifier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    DepositRecorded {
        checkbook_id: String,
    },
    WithdrawExecuted {
        request_id: Nullifier,
        nullifiers: Vec<Nullifier>,
    },
    WithdrawReverted {
        request_id: Nullifier,
        reason: String,
    },
    PayoutExecuted {
        request_id: Nullifier,
    },
    PayoutFailed {
        request_id: Nullifier,
        reason: String,
    },
    HookExecuted {
        request_id: Nullifier,
    },
    HookFailed {
        request_id: Nullifier,
        reason: String,
    },
    FallbackTransferred {
        request_id: Nullifier,
    },
    FallbackFailed {
        request_id: Nullifier,
        reason: String,
    },
    /// Beneficiary claimed the payout on the source chain after the
    /// bridge route failed
    TimeoutClaimed {
        request_id: Nullifier,
    },
    ManuallyResolved {
        request_id: Nullifier,
        note: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DepositRecorded { .. } => "deposit_recorded",
            Self::WithdrawExecuted { .. } => "withdraw_executed",
            Self::WithdrawReverted { .. } => "withdraw_reverted",
            Self::PayoutExecuted { .. } => "payout_executed",
            Self::PayoutFailed { .. } => "payout_failed",
            Self::HookExecuted { .. } => "hook_executed",
            Self::HookFailed { .. } => "hook_failed",
            Self::FallbackTransferred { .. } => "fallback_transferred",
            Self::FallbackFailed { .. } => "fallback_failed",
            Self::TimeoutClaimed { .. } => "timeout_claimed",
            Self::ManuallyResolved { .. } => "manually_resolved",
        }
    }

    /// On-chain request id for withdraw-side events
    pub fn request_id(&self) -> Option<&Nullifier> {
        match self {
            Self::DepositRecorded { .. } => None,
            Self::WithdrawExecuted { request_id, .. }
            | Self::WithdrawReverted { request_id, .. }
            | Self::PayoutExecuted { request_id }
            | Self::PayoutFailed { request_id, .. }
            | Self::HookExecuted { request_id }
            | Self::HookFailed { request_id, .. }
            | Self::FallbackTransferred { request_id }
            | Self::FallbackFailed { request_id, .. }
            | Self::TimeoutClaimed { request_id }
            | Self::ManuallyResolved { request_id, .. } => Some(request_id),
        }
    }
}

/// An observed chain event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub key: EventKey,
    pub kind: EventKind,
}

impl ChainEvent {
    pub fn new(key: EventKey, kind: EventKind) -> Self {
        Self { key, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::primitives::Bytes32;

    #[test]
    fn test_event_key_normalizes_hash() {
        let a = EventKey::new(714, "0xABCDEF", 3);
        let b = EventKey::new(714, "0xabcdef", 3);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "714:0xabcdef:3");
    }

    #[test]
    fn test_event_json_shape() {
        let event = ChainEvent::new(
            EventKey::new(60, "0x01", 0),
            EventKind::PayoutFailed {
                request_id: Bytes32([1u8; 32]),
                reason: "slippage".to_string(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["event"], "payout_failed");
        assert_eq!(event.kind.name(), "payout_failed");
        assert!(event.kind.request_id().is_some());
    }
}
