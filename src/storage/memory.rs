//! In-Memory Storage Implementation
//!
//! Provides in-memory storage for testing and development.
//! Data is lost when the service restarts.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{
    apply_consume, apply_lock, apply_release, check_owner, StorageError, StorageResult,
    WithdrawStore,
};
use crate::accumulator::Nullifier;
use crate::types::checkbook::{Allocation, AllocationId, Checkbook};
use crate::types::events::EventKey;
use crate::types::task::{RetryTask, Stage};
use crate::types::withdraw::{MainStatus, WithdrawRequest};

#[derive(Default)]
struct Tables {
    checkbooks: HashMap<String, Checkbook>,
    allocations: HashMap<AllocationId, Allocation>,
    requests: HashMap<String, WithdrawRequest>,
    /// Index: on-chain request id -> request ID
    by_onchain_id: HashMap<Nullifier, String>,
    events: HashSet<EventKey>,
    tasks: HashMap<(String, Stage), RetryTask>,
}

impl Tables {
    /// Clone the named allocations, failing if any is missing
    fn load(&self, ids: &[AllocationId]) -> StorageResult<Vec<Allocation>> {
        ids.iter()
            .map(|id| {
                self.allocations
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StorageError::NotFound(format!("allocation {}", id)))
            })
            .collect()
    }

    fn store(&mut self, allocations: Vec<Allocation>) {
        for allocation in allocations {
            self.allocations.insert(allocation.id(), allocation);
        }
    }

    fn check_version(&self, request: &WithdrawRequest) -> StorageResult<()> {
        match self.requests.get(&request.id) {
            None => Err(StorageError::NotFound(request.id.clone())),
            Some(stored) if stored.version != request.version => {
                Err(StorageError::Conflict(request.id.clone()))
            }
            Some(_) => Ok(()),
        }
    }

    fn write_request(&mut self, request: &mut WithdrawRequest) {
        request.version += 1;
        self.requests.insert(request.id.clone(), request.clone());
    }
}

/// In-memory withdraw store
///
/// All tables sit behind one lock so multi-row operations are atomic.
#[derive(Clone, Default)]
pub struct MemoryWithdrawStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryWithdrawStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WithdrawStore for MemoryWithdrawStore {
    async fn insert_checkbook(
        &self,
        checkbook: &Checkbook,
        allocations: &[Allocation],
    ) -> StorageResult<()> {
        let mut tables = self.tables.write().await;

        if tables.checkbooks.contains_key(&checkbook.id) {
            return Err(StorageError::Duplicate(format!("checkbook {}", checkbook.id)));
        }
        for allocation in allocations {
            if tables.allocations.contains_key(&allocation.id()) {
                return Err(StorageError::Duplicate(format!("allocation {}", allocation.id())));
            }
        }

        tables.checkbooks.insert(checkbook.id.clone(), checkbook.clone());
        tables.store(allocations.to_vec());
        Ok(())
    }

    async fn get_checkbook(&self, id: &str) -> StorageResult<Option<Checkbook>> {
        Ok(self.tables.read().await.checkbooks.get(id).cloned())
    }

    async fn update_checkbook(&self, checkbook: &Checkbook) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.checkbooks.contains_key(&checkbook.id) {
            return Err(StorageError::NotFound(checkbook.id.clone()));
        }
        tables.checkbooks.insert(checkbook.id.clone(), checkbook.clone());
        Ok(())
    }

    async fn get_allocations(&self, ids: &[AllocationId]) -> StorageResult<Vec<Allocation>> {
        self.tables.read().await.load(ids)
    }

    async fn get_allocations_by_checkbook(
        &self,
        checkbook_id: &str,
    ) -> StorageResult<Vec<Allocation>> {
        let tables = self.tables.read().await;
        let mut out: Vec<Allocation> = tables
            .allocations
            .values()
            .filter(|a| a.checkbook_id == checkbook_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.seq);
        Ok(out)
    }

    async fn get_allocations_by_request(&self, request_id: &str) -> StorageResult<Vec<Allocation>> {
        let tables = self.tables.read().await;
        let mut out: Vec<Allocation> = tables
            .allocations
            .values()
            .filter(|a| a.withdraw_request_id.as_deref() == Some(request_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.checkbook_id, a.seq).cmp(&(&b.checkbook_id, b.seq)));
        Ok(out)
    }

    async fn lock_allocations(&self, ids: &[AllocationId], request_id: &str) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let mut loaded = tables.load(ids)?;
        for allocation in loaded.iter_mut() {
            apply_lock(allocation, request_id)?;
        }
        tables.store(loaded);
        Ok(())
    }

    async fn release_allocations(&self, ids: &[AllocationId]) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;
        let mut loaded = tables.load(ids)?;
        let mut changed = 0;
        for allocation in loaded.iter_mut() {
            if apply_release(allocation)? {
                changed += 1;
            }
        }
        tables.store(loaded);
        Ok(changed)
    }

    async fn consume_allocations(
        &self,
        consumptions: &[(AllocationId, Nullifier)],
    ) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;
        let ids: Vec<AllocationId> = consumptions.iter().map(|(id, _)| id.clone()).collect();
        let mut loaded = tables.load(&ids)?;
        let mut changed = 0;
        for (allocation, (_, nullifier)) in loaded.iter_mut().zip(consumptions) {
            if apply_consume(allocation, nullifier)? {
                changed += 1;
            }
        }
        tables.store(loaded);
        Ok(changed)
    }

    async fn insert_request(
        &self,
        request: &WithdrawRequest,
        allocation_ids: &[AllocationId],
    ) -> StorageResult<()> {
        let mut tables = self.tables.write().await;

        if tables.requests.contains_key(&request.id) {
            return Err(StorageError::Duplicate(format!("request {}", request.id)));
        }
        // A cancelled request gives up its on-chain id
        let live_holder = tables
            .by_onchain_id
            .get(&request.onchain_request_id)
            .and_then(|id| tables.requests.get(id))
            .map_or(false, |holder| holder.status != MainStatus::Cancelled);
        if live_holder {
            return Err(StorageError::Duplicate(format!(
                "on-chain request id {}",
                request.onchain_request_id
            )));
        }

        let mut loaded = tables.load(allocation_ids)?;
        for allocation in loaded.iter_mut() {
            apply_lock(allocation, &request.id)?;
        }
        tables.store(loaded);
        tables
            .by_onchain_id
            .insert(request.onchain_request_id, request.id.clone());
        tables.requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn get_request(&self, id: &str) -> StorageResult<Option<WithdrawRequest>> {
        Ok(self.tables.read().await.requests.get(id).cloned())
    }

    async fn get_request_by_onchain_id(
        &self,
        onchain_request_id: &Nullifier,
    ) -> StorageResult<Option<WithdrawRequest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_onchain_id
            .get(onchain_request_id)
            .and_then(|id| tables.requests.get(id))
            .cloned())
    }

    async fn update_request(&self, request: &mut WithdrawRequest) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables.check_version(request)?;
        tables.write_request(request);
        Ok(())
    }

    async fn commit_execution(
        &self,
        request: &mut WithdrawRequest,
        consumptions: &[(AllocationId, Nullifier)],
    ) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;
        tables.check_version(request)?;

        let ids: Vec<AllocationId> = consumptions.iter().map(|(id, _)| id.clone()).collect();
        let mut loaded = tables.load(&ids)?;
        let mut changed = 0;
        for (allocation, (_, nullifier)) in loaded.iter_mut().zip(consumptions) {
            check_owner(allocation, &request.id)?;
            if apply_consume(allocation, nullifier)? {
                changed += 1;
            }
        }

        tables.store(loaded);
        tables.write_request(request);
        Ok(changed)
    }

    async fn commit_cancellation(
        &self,
        request: &mut WithdrawRequest,
        allocation_ids: &[AllocationId],
    ) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;
        tables.check_version(request)?;

        let mut loaded = tables.load(allocation_ids)?;
        let mut changed = 0;
        for allocation in loaded.iter_mut() {
            if allocation.withdraw_request_id.is_some() {
                check_owner(allocation, &request.id)?;
            }
            if apply_release(allocation)? {
                changed += 1;
            }
        }

        tables.store(loaded);
        tables.write_request(request);
        Ok(changed)
    }

    async fn get_requests_by_status(
        &self,
        status: MainStatus,
    ) -> StorageResult<Vec<WithdrawRequest>> {
        let tables = self.tables.read().await;
        let mut out: Vec<WithdrawRequest> = tables
            .requests
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn count_by_status(&self) -> StorageResult<HashMap<String, u64>> {
        let tables = self.tables.read().await;
        let mut counts = HashMap::new();
        for request in tables.requests.values() {
            *counts.entry(request.status.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn is_event_processed(&self, key: &EventKey) -> StorageResult<bool> {
        Ok(self.tables.read().await.events.contains(key))
    }

    async fn mark_event_processed(&self, key: &EventKey, _kind: &str) -> StorageResult<bool> {
        Ok(self.tables.write().await.events.insert(key.clone()))
    }

    async fn upsert_task(&self, task: &RetryTask) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .tasks
            .insert((task.request_id.clone(), task.stage), task.clone());
        Ok(())
    }

    async fn get_task(&self, request_id: &str, stage: Stage) -> StorageResult<Option<RetryTask>> {
        let tables = self.tables.read().await;
        Ok(tables.tasks.get(&(request_id.to_string(), stage)).cloned())
    }

    async fn claim_due_tasks(
        &self,
        now: u64,
        lease_secs: u64,
        limit: usize,
    ) -> StorageResult<Vec<RetryTask>> {
        let mut tables = self.tables.write().await;

        let mut due: Vec<RetryTask> = tables
            .tasks
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (a.next_eligible_at, &a.request_id, a.stage).cmp(&(b.next_eligible_at, &b.request_id, b.stage))
        });
        due.truncate(limit);

        for task in &due {
            if let Some(stored) = tables.tasks.get_mut(&(task.request_id.clone(), task.stage)) {
                stored.next_eligible_at = now + lease_secs;
            }
        }

        Ok(due)
    }

    async fn reschedule_task(
        &self,
        request_id: &str,
        stage: Stage,
        next_eligible_at: u64,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.tasks.get_mut(&(request_id.to_string(), stage)) {
            Some(task) => {
                task.next_eligible_at = next_eligible_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_task(&self, request_id: &str, stage: Stage) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.tasks.remove(&(request_id.to_string(), stage)).is_some())
    }

    async fn get_tasks_for_request(&self, request_id: &str) -> StorageResult<Vec<RetryTask>> {
        let tables = self.tables.read().await;
        let mut out: Vec<RetryTask> = tables
            .tasks
            .values()
            .filter(|t| t.request_id == request_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.stage);
        Ok(out)
    }
}
