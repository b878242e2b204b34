//! Storage Trait Definitions
//!
//! Defines the persistence interface of the withdraw core.
//! Implementations can use SQLite (production) or in-memory (testing).
//!
//! Every method that touches more than one row is a single atomic unit:
//! either all named allocations and the request change, or none do.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::accumulator::Nullifier;
use crate::types::checkbook::{Allocation, AllocationId, AllocationStatus, Checkbook};
use crate::types::events::EventKey;
use crate::types::task::{RetryTask, Stage};
use crate::types::withdraw::{MainStatus, WithdrawRequest};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Concurrent modification of {0}")]
    Conflict(String),

    #[error("Allocation {id} is {actual}, expected {expected}")]
    AllocationState {
        id: String,
        actual: AllocationStatus,
        expected: AllocationStatus,
    },

    #[error("Allocation {0} already consumed with a different nullifier")]
    NullifierMismatch(String),

    #[error("Allocation {id} is owned by {owner}")]
    WrongOwner { id: String, owner: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence for checkbooks, allocations, withdraw requests, processed
/// events, and scheduler tasks.
///
/// Implementations:
/// - `SqliteWithdrawStore` - Production storage with SQLite
/// - `MemoryWithdrawStore` - In-memory storage for testing
#[async_trait]
pub trait WithdrawStore: Send + Sync {
    // --- Checkbooks ---

    /// Insert a checkbook together with its allocations
    async fn insert_checkbook(
        &self,
        checkbook: &Checkbook,
        allocations: &[Allocation],
    ) -> StorageResult<()>;

    async fn get_checkbook(&self, id: &str) -> StorageResult<Option<Checkbook>>;

    async fn update_checkbook(&self, checkbook: &Checkbook) -> StorageResult<()>;

    // --- Allocations ---

    /// Fetch allocations in the order given; `NotFound` if any is missing
    async fn get_allocations(&self, ids: &[AllocationId]) -> StorageResult<Vec<Allocation>>;

    /// All allocations of a checkbook, ascending seq
    async fn get_allocations_by_checkbook(&self, checkbook_id: &str)
        -> StorageResult<Vec<Allocation>>;

    /// Allocations stamped with a request, ascending seq
    async fn get_allocations_by_request(&self, request_id: &str) -> StorageResult<Vec<Allocation>>;

    /// idle → pending for every id, or nothing
    async fn lock_allocations(&self, ids: &[AllocationId], request_id: &str) -> StorageResult<()>;

    /// pending → idle for every id, or nothing. Already idle allocations are
    /// skipped; returns how many changed.
    async fn release_allocations(&self, ids: &[AllocationId]) -> StorageResult<usize>;

    /// pending → used with the given nullifiers, or nothing. Allocations
    /// already used with the same nullifier are skipped; returns how many
    /// changed.
    async fn consume_allocations(
        &self,
        consumptions: &[(AllocationId, Nullifier)],
    ) -> StorageResult<usize>;

    // --- Withdraw requests ---

    /// Lock the allocations and insert the request in one transaction
    async fn insert_request(
        &self,
        request: &WithdrawRequest,
        allocation_ids: &[AllocationId],
    ) -> StorageResult<()>;

    async fn get_request(&self, id: &str) -> StorageResult<Option<WithdrawRequest>>;

    /// The live request holding an on-chain id, else the latest cancelled one.
    /// Cancelled requests release their on-chain id for re-submission.
    async fn get_request_by_onchain_id(
        &self,
        onchain_request_id: &Nullifier,
    ) -> StorageResult<Option<WithdrawRequest>>;

    /// Compare-and-swap on `version`; bumps `request.version` on success
    async fn update_request(&self, request: &mut WithdrawRequest) -> StorageResult<()>;

    /// Consume the allocations and write the request in one transaction
    async fn commit_execution(
        &self,
        request: &mut WithdrawRequest,
        consumptions: &[(AllocationId, Nullifier)],
    ) -> StorageResult<usize>;

    /// Release the allocations and write the request in one transaction
    async fn commit_cancellation(
        &self,
        request: &mut WithdrawRequest,
        allocation_ids: &[AllocationId],
    ) -> StorageResult<usize>;

    async fn get_requests_by_status(&self, status: MainStatus)
        -> StorageResult<Vec<WithdrawRequest>>;

    /// Count requests per main status
    async fn count_by_status(&self) -> StorageResult<HashMap<String, u64>>;

    // --- Processed events ---

    async fn is_event_processed(&self, key: &EventKey) -> StorageResult<bool>;

    /// Record an applied event; false if it was already recorded
    async fn mark_event_processed(&self, key: &EventKey, kind: &str) -> StorageResult<bool>;

    // --- Scheduler tasks ---

    /// Insert or replace the task for (request_id, stage)
    async fn upsert_task(&self, task: &RetryTask) -> StorageResult<()>;

    async fn get_task(&self, request_id: &str, stage: Stage) -> StorageResult<Option<RetryTask>>;

    /// Return up to `limit` due tasks and push their eligibility `lease_secs`
    /// into the future so no other worker picks them up meanwhile.
    async fn claim_due_tasks(
        &self,
        now: u64,
        lease_secs: u64,
        limit: usize,
    ) -> StorageResult<Vec<RetryTask>>;

    /// Move an existing task's eligibility; never creates a task. False if
    /// there was none.
    async fn reschedule_task(
        &self,
        request_id: &str,
        stage: Stage,
        next_eligible_at: u64,
    ) -> StorageResult<bool>;

    async fn remove_task(&self, request_id: &str, stage: Stage) -> StorageResult<bool>;

    async fn get_tasks_for_request(&self, request_id: &str) -> StorageResult<Vec<RetryTask>>;
}

// Row-level allocation rules shared by the implementations.

pub(crate) fn apply_lock(allocation: &mut Allocation, request_id: &str) -> StorageResult<()> {
    if allocation.status != AllocationStatus::Idle {
        return Err(StorageError::AllocationState {
            id: allocation.id().to_string(),
            actual: allocation.status,
            expected: AllocationStatus::Idle,
        });
    }
    allocation.mark_pending(request_id);
    Ok(())
}

pub(crate) fn apply_release(allocation: &mut Allocation) -> StorageResult<bool> {
    match allocation.status {
        AllocationStatus::Idle => Ok(false),
        AllocationStatus::Pending => {
            allocation.mark_idle();
            Ok(true)
        }
        AllocationStatus::Used => Err(StorageError::AllocationState {
            id: allocation.id().to_string(),
            actual: AllocationStatus::Used,
            expected: AllocationStatus::Pending,
        }),
    }
}

pub(crate) fn apply_consume(allocation: &mut Allocation, nullifier: &Nullifier) -> StorageResult<bool> {
    match allocation.status {
        AllocationStatus::Used => {
            if allocation.nullifier.as_ref() == Some(nullifier) {
                Ok(false)
            } else {
                Err(StorageError::NullifierMismatch(allocation.id().to_string()))
            }
        }
        AllocationStatus::Pending => {
            allocation.mark_used(*nullifier);
            Ok(true)
        }
        AllocationStatus::Idle => Err(StorageError::AllocationState {
            id: allocation.id().to_string(),
            actual: AllocationStatus::Idle,
            expected: AllocationStatus::Pending,
        }),
    }
}

/// Consumptions of a request may only touch allocations it owns
pub(crate) fn check_owner(allocation: &Allocation, request_id: &str) -> StorageResult<()> {
    match allocation.withdraw_request_id.as_deref() {
        Some(owner) if owner == request_id => Ok(()),
        Some(owner) => Err(StorageError::WrongOwner {
            id: allocation.id().to_string(),
            owner: owner.to_string(),
        }),
        None => Err(StorageError::WrongOwner {
            id: allocation.id().to_string(),
            owner: "nobody".to_string(),
        }),
    }
}
