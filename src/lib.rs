//! zkpay - Withdraw Orchestration Core
//!
//! Server-side engine of a privacy pool's withdraw path. A deposit becomes a
//! checkbook whose amount is split into allocations; a withdraw request
//! spends one or more allocations and is driven through four stages:
//!
//! 1. **Proof** - zero-knowledge proof of the spent allocations
//! 2. **Execute** - on-chain transaction consuming the nullifiers
//! 3. **Payout** - cross-chain transfer to the beneficiary
//! 4. **Hook** - optional purchase of a yield asset with the payout
//!
//! The stage collaborators (prover, chain, bridge, hook service) are traits
//! in [`withdraw::clients`]; bindings live outside this crate.

pub mod accumulator;
pub mod common;
pub mod demo;
pub mod storage;
pub mod types;
pub mod withdraw;

// Re-exports: commitments
pub use accumulator::{AccumulatorError, Commitment, Nullifier};

// Re-exports: ambient stack
pub use common::{ConfigError, OrchestratorConfig, ZkPayConfig, ZkPayError};

// Re-exports: storage
pub use storage::{MemoryWithdrawStore, SqliteWithdrawStore, StorageError, WithdrawStore};

// Re-exports: domain types
pub use types::{
    Allocation, AllocationId, AllocationStatus, ChainEvent, Checkbook, CheckbookStatus, EventKey,
    EventKind, Intent, MainStatus, TokenAmount, UniversalAddress, WithdrawRequest, WithdrawStats,
};

// Re-exports: orchestration
pub use withdraw::{
    Collaborators, IngestOutcome, ServiceError, TickResult, WithdrawService,
};
