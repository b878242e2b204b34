//! Retry Scheduler
//!
//! Stage work lives in the store as `RetryTask` rows keyed by
//! (request id, stage). A task stays in the store while its stage is
//! outstanding; the handler removes it once the outcome is persisted, so a
//! crash mid-call re-runs the stage after the claim lease expires.

use std::sync::Arc;

use crate::common::config::OrchestratorConfig;
use crate::storage::{StorageResult, WithdrawStore};
use crate::types::now_secs;
use crate::types::task::{RetryTask, Stage};

/// Persistent task queue with exponential backoff
#[derive(Clone)]
pub struct RetryScheduler {
    store: Arc<dyn WithdrawStore>,
    backoff_base_secs: u64,
    lease_secs: u64,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn WithdrawStore>, config: &OrchestratorConfig) -> Self {
        Self {
            store,
            backoff_base_secs: config.payout_backoff_base_secs,
            lease_secs: config.task_lease_secs,
        }
    }

    /// Delay before retry number `retry` (1-based): base · 2^(retry-1)
    pub fn backoff_delay(&self, retry: u32) -> u64 {
        let exponent = retry.saturating_sub(1).min(32);
        self.backoff_base_secs.saturating_mul(1u64 << exponent)
    }

    /// Queue a stage to run as soon as possible
    pub async fn enqueue(&self, request_id: &str, stage: Stage) -> StorageResult<()> {
        self.enqueue_after(request_id, stage, 0).await
    }

    /// Queue a stage to run after `delay_secs`
    pub async fn enqueue_after(
        &self,
        request_id: &str,
        stage: Stage,
        delay_secs: u64,
    ) -> StorageResult<()> {
        let task = RetryTask::new(request_id, stage, now_secs() + delay_secs);
        tracing::debug!(request_id = %request_id, stage = %stage, delay_secs, "task queued");
        self.store.upsert_task(&task).await
    }

    /// Queue retry number `retry` of a stage with backoff; returns the delay
    pub async fn schedule_retry(
        &self,
        request_id: &str,
        stage: Stage,
        retry: u32,
        error: &str,
    ) -> StorageResult<u64> {
        let delay = self.backoff_delay(retry);
        let mut task = RetryTask::new(request_id, stage, now_secs() + delay);
        task.attempt = retry;
        task.last_error = Some(error.to_string());
        self.store.upsert_task(&task).await?;

        tracing::info!(
            request_id = %request_id,
            stage = %stage,
            retry,
            delay_secs = delay,
            "retry scheduled"
        );
        Ok(delay)
    }

    /// Lease up to `limit` due tasks
    pub async fn claim(&self, now: u64, limit: usize) -> StorageResult<Vec<RetryTask>> {
        self.store.claim_due_tasks(now, self.lease_secs, limit).await
    }

    /// Hand back the lease of a claimed task that was not run; a task
    /// removed since the claim stays removed
    pub async fn release(&self, task: &RetryTask) -> StorageResult<bool> {
        self.store
            .reschedule_task(&task.request_id, task.stage, task.next_eligible_at)
            .await
    }

    /// Drop the task for a finished stage
    pub async fn complete(&self, request_id: &str, stage: Stage) -> StorageResult<bool> {
        self.store.remove_task(request_id, stage).await
    }

    pub async fn pending(&self, request_id: &str, stage: Stage) -> StorageResult<Option<RetryTask>> {
        self.store.get_task(request_id, stage).await
    }

    /// Drop every task of a request
    pub async fn cancel_all(&self, request_id: &str) -> StorageResult<usize> {
        let mut removed = 0;
        for task in self.store.get_tasks_for_request(request_id).await? {
            if self.store.remove_task(request_id, task.stage).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
