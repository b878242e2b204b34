//! Shared plumbing of the stage coordinators

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::accumulator::{AccumulatorError, Commitment};
use crate::common::config::OrchestratorConfig;
use crate::common::logging::log_status_transition;
use crate::storage::{StorageError, WithdrawStore};
use crate::types::checkbook::{Allocation, Checkbook};
use crate::types::withdraw::{MainStatus, WithdrawRequest, WithdrawStats};
use crate::withdraw::ledger::{allocation_ids, AllocationLedger, LedgerError};
use crate::withdraw::locks::RequestLocks;
use crate::withdraw::scheduler::RetryScheduler;

/// Answer of a coordinator's `start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted,
    Rejected(String),
}

impl StartOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StartOutcome::Accepted)
    }
}

/// Stage coordinator errors
#[derive(Debug, Error)]
pub enum StageError {
    #[error("request not found: {0}")]
    NotFound(String),

    #[error("request {id} is missing {what}")]
    MissingData { id: String, what: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("accumulator error: {0}")]
    Accumulator(#[from] AccumulatorError),
}

impl StageError {
    /// Whether re-running the stage may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Storage(e) | StageError::Ledger(LedgerError::Storage(e)) => matches!(
                e,
                StorageError::Conflict(_) | StorageError::Connection(_) | StorageError::Database(_)
            ),
            _ => false,
        }
    }
}

/// Everything a coordinator needs besides its collaborator
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn WithdrawStore>,
    pub ledger: AllocationLedger,
    pub locks: RequestLocks,
    pub scheduler: RetryScheduler,
    pub config: OrchestratorConfig,
    pub stats: Arc<RwLock<WithdrawStats>>,
}

impl StageContext {
    pub fn new(store: Arc<dyn WithdrawStore>, config: OrchestratorConfig) -> Self {
        Self {
            ledger: AllocationLedger::new(store.clone()),
            locks: RequestLocks::new(),
            scheduler: RetryScheduler::new(store.clone(), &config),
            store,
            config,
            stats: Arc::new(RwLock::new(WithdrawStats::default())),
        }
    }

    /// Bump process-local counters
    pub async fn record(&self, update: impl FnOnce(&mut WithdrawStats)) {
        update(&mut *self.stats.write().await);
    }

    pub async fn load(&self, request_id: &str) -> Result<WithdrawRequest, StageError> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or_else(|| StageError::NotFound(request_id.to_string()))
    }

    /// Write a request and log its main-status change
    pub async fn persist(
        &self,
        request: &mut WithdrawRequest,
        before: MainStatus,
    ) -> Result<(), StageError> {
        self.store.update_request(request).await?;
        log_status_transition(request, before);
        Ok(())
    }

    /// Checkbook, commitment and spent allocations (ascending seq) of a request
    pub async fn load_spend(
        &self,
        request: &WithdrawRequest,
    ) -> Result<(Checkbook, Commitment, Vec<Allocation>), StageError> {
        let checkbook = self
            .store
            .get_checkbook(&request.checkbook_id)
            .await?
            .ok_or_else(|| missing(&request.id, "checkbook"))?;
        let commitment = checkbook
            .commitment
            .ok_or_else(|| missing(&request.id, "commitment"))?;

        let mut allocations = self.store.get_allocations(&allocation_ids(request)).await?;
        allocations.sort_by_key(|a| a.seq);

        Ok((checkbook, commitment, allocations))
    }
}

pub(crate) fn missing(id: &str, what: &str) -> StageError {
    StageError::MissingData {
        id: id.to_string(),
        what: what.to_string(),
    }
}

/// Milliseconds since `start`, for stage logs
pub(crate) fn elapsed_ms(start: std::time::Instant) -> Option<u64> {
    Some(start.elapsed().as_millis() as u64)
}
