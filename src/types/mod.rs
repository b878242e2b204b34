//! Shared Types Module
//!
//! Data types shared across the withdraw orchestration core.

pub mod checkbook;
pub mod events;
pub mod primitives;
pub mod task;
pub mod units;
pub mod withdraw;

// Re-exports for convenience
pub use checkbook::{Allocation, AllocationId, AllocationStatus, Checkbook, CheckbookStatus};
pub use events::{ChainEvent, EventKey, EventKind};
pub use primitives::{Bytes32, UniversalAddress};
pub use task::{RetryTask, Stage};
pub use units::{format_units, parse_units, TokenAmount, DEFAULT_DECIMALS};
pub use withdraw::{
    ExecuteStatus, HookStatus, Intent, MainStatus, PayoutStatus, ProofArtifact, ProofStatus,
    WithdrawRequest, WithdrawStats,
};

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
