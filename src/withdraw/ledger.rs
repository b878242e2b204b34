//! Allocation Ledger
//!
//! Owns the allocation lifecycle `idle → pending → used` (and `pending →
//! idle` before the irreversibility boundary). All multi-allocation
//! operations are one store transaction.

use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

use crate::accumulator::{self, Commitment, Nullifier};
use crate::common::logging::log_ledger_event;
use crate::storage::{StorageError, WithdrawStore};
use crate::types::checkbook::{Allocation, AllocationId, AllocationStatus, Checkbook};
use crate::types::withdraw::WithdrawRequest;
use crate::withdraw::state::past_irreversibility_boundary;

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("allocation {0} is not idle")]
    AlreadyLocked(String),

    #[error("request {0} is past the irreversibility boundary")]
    PastIrreversibilityBoundary(String),

    #[error("allocation {0} was consumed with a different nullifier")]
    NullifierMismatch(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("allocation {id} does not belong to checkbook {checkbook_id}")]
    WrongCheckbook { id: String, checkbook_id: String },

    #[error("checkbook {0} is not finalized")]
    NotFinalized(String),

    #[error("invalid allocation set: {0}")]
    InvalidSet(String),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for LedgerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::AllocationState {
                id,
                expected: AllocationStatus::Idle,
                ..
            } => LedgerError::AlreadyLocked(id),
            StorageError::NullifierMismatch(id) => LedgerError::NullifierMismatch(id),
            StorageError::NotFound(what) => LedgerError::NotFound(what),
            other => LedgerError::Storage(other),
        }
    }
}

/// Allocation ledger over a withdraw store
#[derive(Clone)]
pub struct AllocationLedger {
    store: Arc<dyn WithdrawStore>,
}

impl AllocationLedger {
    pub fn new(store: Arc<dyn WithdrawStore>) -> Self {
        Self { store }
    }

    /// Check that a set of allocations can back a new withdraw request:
    /// non-empty, no duplicates, all in `checkbook_id`, the checkbook is
    /// finalized, and every allocation is idle. Allocations of one checkbook
    /// share its owner. Returns the checkbook and the allocations by seq.
    pub async fn validate_for_withdraw(
        &self,
        checkbook_id: &str,
        ids: &[AllocationId],
    ) -> Result<(Checkbook, Vec<Allocation>), LedgerError> {
        if ids.is_empty() {
            return Err(LedgerError::InvalidSet("no allocations".to_string()));
        }

        let unique: BTreeSet<&AllocationId> = ids.iter().collect();
        if unique.len() != ids.len() {
            return Err(LedgerError::InvalidSet("duplicate allocation".to_string()));
        }

        if let Some(foreign) = ids.iter().find(|id| id.checkbook_id != checkbook_id) {
            return Err(LedgerError::WrongCheckbook {
                id: foreign.to_string(),
                checkbook_id: checkbook_id.to_string(),
            });
        }

        let checkbook = self
            .store
            .get_checkbook(checkbook_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("checkbook {}", checkbook_id)))?;
        if !checkbook.is_finalized() {
            return Err(LedgerError::NotFinalized(checkbook_id.to_string()));
        }

        let mut allocations = self.store.get_allocations(ids).await?;
        if let Some(busy) = allocations.iter().find(|a| !a.is_idle()) {
            return Err(LedgerError::AlreadyLocked(busy.id().to_string()));
        }

        allocations.sort_by_key(|a| a.seq);
        Ok((checkbook, allocations))
    }

    /// idle → pending for all ids, or none
    pub async fn lock(&self, ids: &[AllocationId], request_id: &str) -> Result<(), LedgerError> {
        match self.store.lock_allocations(ids, request_id).await {
            Ok(()) => {
                log_ledger_event("allocations_locked", Some(request_id), ids, None);
                Ok(())
            }
            Err(e) => {
                let err = LedgerError::from(e);
                log_ledger_event("allocations_lock_failed", Some(request_id), ids, Some(&err.to_string()));
                Err(err)
            }
        }
    }

    /// pending → idle for all ids, or none. Refused while any owning
    /// request has execute = submitted or success.
    pub async fn release(&self, ids: &[AllocationId]) -> Result<usize, LedgerError> {
        let allocations = self.store.get_allocations(ids).await?;

        let owners: BTreeSet<&str> = allocations
            .iter()
            .filter_map(|a| a.withdraw_request_id.as_deref())
            .collect();
        for owner in owners {
            if let Some(request) = self.store.get_request(owner).await? {
                if past_irreversibility_boundary(request.execute_status) {
                    return Err(LedgerError::PastIrreversibilityBoundary(owner.to_string()));
                }
            }
        }

        let released = self.store.release_allocations(ids).await?;
        log_ledger_event("allocations_released", None, ids, None);
        Ok(released)
    }

    /// pending → used with the given nullifiers. Repeating a consumption with
    /// the same nullifiers is a no-op.
    pub async fn consume(
        &self,
        consumptions: &[(AllocationId, Nullifier)],
    ) -> Result<usize, LedgerError> {
        let ids: Vec<AllocationId> = consumptions.iter().map(|(id, _)| id.clone()).collect();
        match self.store.consume_allocations(consumptions).await {
            Ok(changed) => {
                if changed > 0 {
                    log_ledger_event("allocations_consumed", None, &ids, None);
                }
                Ok(changed)
            }
            Err(e) => {
                let err = LedgerError::from(e);
                log_ledger_event("allocations_consume_failed", None, &ids, Some(&err.to_string()));
                Err(err)
            }
        }
    }

    /// Consume the request's allocations and persist the request (already
    /// stamped `execute = success`) in one transaction
    pub async fn commit_execution(
        &self,
        request: &mut WithdrawRequest,
        consumptions: &[(AllocationId, Nullifier)],
    ) -> Result<usize, LedgerError> {
        let ids: Vec<AllocationId> = consumptions.iter().map(|(id, _)| id.clone()).collect();
        let changed = self.store.commit_execution(request, consumptions).await.map_err(|e| {
            let err = LedgerError::from(e);
            log_ledger_event("allocations_consume_failed", Some(&request.id), &ids, Some(&err.to_string()));
            err
        })?;

        if changed > 0 {
            log_ledger_event("allocations_consumed", Some(&request.id), &ids, None);
        }
        Ok(changed)
    }

    /// Release the request's allocations and persist the request (already
    /// stamped cancelled) in one transaction
    pub async fn commit_cancellation(
        &self,
        request: &mut WithdrawRequest,
    ) -> Result<usize, LedgerError> {
        if past_irreversibility_boundary(request.execute_status) {
            return Err(LedgerError::PastIrreversibilityBoundary(request.id.clone()));
        }

        let ids = allocation_ids(request);
        let released = self.store.commit_cancellation(request, &ids).await?;
        log_ledger_event("allocations_released", Some(&request.id), &ids, None);
        Ok(released)
    }
}

/// Allocation ids a request spends
pub fn allocation_ids(request: &WithdrawRequest) -> Vec<AllocationId> {
    request
        .allocation_seqs
        .iter()
        .map(|seq| AllocationId::new(request.checkbook_id.clone(), *seq))
        .collect()
}

/// Nullifiers of the given allocations under a commitment, ascending seq
pub fn derive_nullifiers(
    commitment: &Commitment,
    allocations: &[Allocation],
) -> Vec<(AllocationId, Nullifier)> {
    let mut sorted: Vec<&Allocation> = allocations.iter().collect();
    sorted.sort_by_key(|a| a.seq);
    sorted
        .into_iter()
        .map(|a| (a.id(), accumulator::nullifier(commitment, a.seq, a.amount)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{fixture_checkbook, fixture_request};
    use crate::storage::MemoryWithdrawStore;

    async fn seeded() -> (AllocationLedger, Arc<dyn WithdrawStore>) {
        let store: Arc<dyn WithdrawStore> = Arc::new(MemoryWithdrawStore::new());
        let (cb, allocations) = fixture_checkbook("cb_1", 3);
        store.insert_checkbook(&cb, &allocations).await.unwrap();
        (AllocationLedger::new(store.clone()), store)
    }

    fn ids(seqs: &[u8]) -> Vec<AllocationId> {
        seqs.iter().map(|s| AllocationId::new("cb_1", *s)).collect()
    }

    #[tokio::test]
    async fn test_validate_for_withdraw() {
        let (ledger, _) = seeded().await;

        let (cb, allocations) = ledger.validate_for_withdraw("cb_1", &ids(&[2, 0])).await.unwrap();
        assert_eq!(cb.id, "cb_1");
        assert_eq!(allocations.iter().map(|a| a.seq).collect::<Vec<_>>(), vec![0, 2]);

        assert!(matches!(
            ledger.validate_for_withdraw("cb_1", &[]).await,
            Err(LedgerError::InvalidSet(_))
        ));
        assert!(matches!(
            ledger.validate_for_withdraw("cb_1", &ids(&[1, 1])).await,
            Err(LedgerError::InvalidSet(_))
        ));
        assert!(matches!(
            ledger.validate_for_withdraw("cb_1", &[AllocationId::new("cb_2", 0)]).await,
            Err(LedgerError::WrongCheckbook { .. })
        ));
        assert!(matches!(
            ledger.validate_for_withdraw("cb_1", &ids(&[7])).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_conflict_maps_to_already_locked() {
        let (ledger, _) = seeded().await;
        ledger.lock(&ids(&[0, 1]), "wr_a").await.unwrap();

        let err = ledger.lock(&ids(&[1, 2]), "wr_b").await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyLocked(_)));

        // all-or-nothing: seq 2 stayed idle
        assert!(matches!(
            ledger.validate_for_withdraw("cb_1", &ids(&[2])).await,
            Ok(_)
        ));
    }

    #[tokio::test]
    async fn test_release_refused_past_boundary() {
        let (ledger, store) = seeded().await;
        let mut request = fixture_request("cb_1", vec![0]);
        store.insert_request(&request, &ids(&[0])).await.unwrap();

        request.mark_execute_submitted("0xfeed".to_string());
        store.update_request(&mut request).await.unwrap();

        assert!(matches!(
            ledger.release(&ids(&[0])).await,
            Err(LedgerError::PastIrreversibilityBoundary(_))
        ));
    }

    #[tokio::test]
    async fn test_consume_is_idempotent_and_monotonic() {
        let (ledger, store) = seeded().await;
        let request = fixture_request("cb_1", vec![0, 1]);
        store.insert_request(&request, &ids(&[0, 1])).await.unwrap();

        let cb = store.get_checkbook("cb_1").await.unwrap().unwrap();
        let allocations = store.get_allocations(&ids(&[0, 1])).await.unwrap();
        let consumptions = derive_nullifiers(&cb.commitment.unwrap(), &allocations);

        assert_eq!(ledger.consume(&consumptions).await.unwrap(), 2);
        assert_eq!(ledger.consume(&consumptions).await.unwrap(), 0);

        let forged = vec![(ids(&[0])[0].clone(), crate::types::Bytes32([9u8; 32]))];
        assert!(matches!(
            ledger.consume(&forged).await,
            Err(LedgerError::NullifierMismatch(_))
        ));

        // used never goes back
        assert!(ledger.release(&ids(&[0])).await.is_err());
    }
}
