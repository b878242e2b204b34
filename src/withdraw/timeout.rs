//! Timeout Sweeper
//!
//! Runs at the start of every tick:
//! - proofs `in_progress` past the proof timeout become `failed`
//! - executions `submitted` past the submit timeout get a fresh confirmation
//!   task; they are never failed since the nullifiers may be spent
//! - live requests whose next stage has no queued task get one back

use crate::types::task::Stage;
use crate::types::withdraw::{
    ExecuteStatus, HookStatus, MainStatus, PayoutStatus, ProofStatus, WithdrawRequest,
};
use crate::withdraw::stage::{StageContext, StageError};

/// Counters of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub proofs_timed_out: usize,
    pub confirmations_requeued: usize,
    pub tasks_restored: usize,
}

impl SweepResult {
    pub fn has_activity(&self) -> bool {
        self.proofs_timed_out > 0 || self.confirmations_requeued > 0 || self.tasks_restored > 0
    }
}

/// Main statuses scanned for lost tasks; `next_stage` decides from the
/// sub-statuses. A status with no matching derivation rule keeps its old
/// value, so a hook retry out of `failed_permanent` still reads as such.
const RESTORABLE: [MainStatus; 6] = [
    MainStatus::Created,
    MainStatus::ProofGenerated,
    MainStatus::WaitingForPayout,
    MainStatus::PayoutProcessing,
    MainStatus::HookProcessing,
    MainStatus::FailedPermanent,
];

pub struct TimeoutSweeper {
    ctx: StageContext,
}

impl TimeoutSweeper {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    pub async fn sweep(&self, now: u64) -> Result<SweepResult, StageError> {
        let mut result = SweepResult::default();

        for request in self.ctx.store.get_requests_by_status(MainStatus::Proving).await? {
            if self.expire_proof(&request.id, now).await? {
                result.proofs_timed_out += 1;
            }
        }

        for request in self.ctx.store.get_requests_by_status(MainStatus::Submitting).await? {
            let overdue = request
                .execute_submitted_at
                .map(|at| at + self.ctx.config.submit_timeout_secs <= now)
                .unwrap_or(true);
            if overdue && self.ctx.scheduler.pending(&request.id, Stage::Confirm).await?.is_none() {
                tracing::warn!(request_id = %request.id, "confirmation overdue, rechecking");
                self.ctx.scheduler.enqueue(&request.id, Stage::Confirm).await?;
                result.confirmations_requeued += 1;
            }
        }

        for status in RESTORABLE {
            for request in self.ctx.store.get_requests_by_status(status).await? {
                let Some(stage) = next_stage(&request) else {
                    continue;
                };
                if self.ctx.scheduler.pending(&request.id, stage).await?.is_none() {
                    tracing::info!(request_id = %request.id, stage = %stage, "restoring missing task");
                    self.ctx.scheduler.enqueue(&request.id, stage).await?;
                    result.tasks_restored += 1;
                }
            }
        }

        Ok(result)
    }

    async fn expire_proof(&self, request_id: &str, now: u64) -> Result<bool, StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let mut request = self.ctx.load(request_id).await?;

        let expired = request.proof_status == ProofStatus::InProgress
            && request
                .proof_started_at
                .map(|at| at + self.ctx.config.proof_timeout_secs <= now)
                .unwrap_or(true);
        if request.is_closed() || !expired {
            return Ok(false);
        }

        let before = request.status;
        request.mark_proof_failed("proof generation timeout".to_string());
        self.ctx.persist(&mut request, before).await?;
        self.ctx.scheduler.complete(request_id, Stage::Proof).await?;
        Ok(true)
    }
}

/// Stage that must be queued for a request to make progress on its own
fn next_stage(request: &WithdrawRequest) -> Option<Stage> {
    if request.is_closed() {
        return None;
    }
    match (request.proof_status, request.execute_status, request.payout_status) {
        (ProofStatus::Pending, _, _) => Some(Stage::Proof),
        (ProofStatus::Completed, ExecuteStatus::Pending, _) => Some(Stage::Execute),
        (_, ExecuteStatus::Success, PayoutStatus::Pending) => Some(Stage::Payout),
        (_, ExecuteStatus::Success, PayoutStatus::Processing) => Some(Stage::PayoutPoll),
        (_, ExecuteStatus::Success, PayoutStatus::Completed)
            if request.intent.requires_hook()
                && matches!(request.hook_status, HookStatus::Pending | HookStatus::Processing) =>
        {
            Some(Stage::Hook)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_secs;
    use crate::withdraw::test_support::{artifact, save, seeded_context};

    #[tokio::test]
    async fn test_stuck_proof_times_out() {
        let (ctx, mut request) = seeded_context(false).await;
        request.mark_proof_in_progress();
        request.proof_started_at = Some(now_secs() - 1_000);
        save(&ctx, &mut request).await;

        let sweeper = TimeoutSweeper::new(ctx.clone());
        let result = sweeper.sweep(now_secs()).await.unwrap();
        assert_eq!(result.proofs_timed_out, 1);

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.status, MainStatus::ProofFailed);
        assert_eq!(stored.proof_error.as_deref(), Some("proof generation timeout"));
    }

    #[tokio::test]
    async fn test_fresh_proof_is_left_alone() {
        let (ctx, mut request) = seeded_context(false).await;
        request.mark_proof_in_progress();
        save(&ctx, &mut request).await;

        let result = TimeoutSweeper::new(ctx.clone()).sweep(now_secs()).await.unwrap();
        assert!(!result.has_activity());
        assert_eq!(ctx.load(&request.id).await.unwrap().status, MainStatus::Proving);
    }

    #[tokio::test]
    async fn test_overdue_submission_is_rechecked_not_failed() {
        let (ctx, mut request) = seeded_context(false).await;
        request.mark_proof_completed(artifact());
        request.mark_execute_submitted("0xexec".to_string());
        request.execute_submitted_at = Some(now_secs() - 1_000);
        save(&ctx, &mut request).await;

        let sweeper = TimeoutSweeper::new(ctx.clone());
        assert_eq!(sweeper.sweep(now_secs()).await.unwrap().confirmations_requeued, 1);
        assert_eq!(ctx.load(&request.id).await.unwrap().status, MainStatus::Submitting);
        assert!(ctx.scheduler.pending(&request.id, Stage::Confirm).await.unwrap().is_some());

        // already queued
        assert_eq!(sweeper.sweep(now_secs()).await.unwrap().confirmations_requeued, 0);
    }

    #[tokio::test]
    async fn test_missing_task_is_restored_once() {
        let (ctx, request) = seeded_context(false).await;
        let sweeper = TimeoutSweeper::new(ctx.clone());

        assert_eq!(sweeper.sweep(now_secs()).await.unwrap().tasks_restored, 1);
        assert!(ctx.scheduler.pending(&request.id, Stage::Proof).await.unwrap().is_some());
        assert_eq!(sweeper.sweep(now_secs()).await.unwrap().tasks_restored, 0);
    }

    #[tokio::test]
    async fn test_lost_hook_retry_is_restored_from_failed_permanent() {
        let (ctx, mut request) = seeded_context(true).await;
        request.mark_proof_completed(artifact());
        request.mark_execute_success(None);
        request.mark_payout_completed(None);
        request.mark_hook_processing();
        request.mark_hook_failed("pool paused".to_string());
        request.mark_fallback_failed("relayer offline".to_string());
        request.mark_hook_retry_requested();
        save(&ctx, &mut request).await;
        assert_eq!(request.status, MainStatus::FailedPermanent);

        let sweeper = TimeoutSweeper::new(ctx.clone());
        assert_eq!(sweeper.sweep(now_secs()).await.unwrap().tasks_restored, 1);
        assert!(ctx.scheduler.pending(&request.id, Stage::Hook).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dead_end_failures_get_no_task() {
        let (ctx, mut request) = seeded_context(false).await;
        request.mark_proof_completed(artifact());
        request.mark_execute_verify_failed("reverted: bad root".to_string());
        save(&ctx, &mut request).await;

        let result = TimeoutSweeper::new(ctx.clone()).sweep(now_secs()).await.unwrap();
        assert_eq!(result.tasks_restored, 0);
        assert!(ctx.store.get_tasks_for_request(&request.id).await.unwrap().is_empty());
    }

    #[test]
    fn test_next_stage_follows_sub_statuses() {
        let mut request = crate::storage::test_support::fixture_request("cb_1", vec![0]);
        assert_eq!(next_stage(&request), Some(Stage::Proof));
        request.mark_proof_completed(artifact());
        assert_eq!(next_stage(&request), Some(Stage::Execute));
        request.mark_execute_success(None);
        assert_eq!(next_stage(&request), Some(Stage::Payout));
        request.mark_payout_processing("br".to_string());
        assert_eq!(next_stage(&request), Some(Stage::PayoutPoll));
        request.mark_payout_completed(None);
        assert_eq!(next_stage(&request), None);
        request.mark_cancelled();
        assert_eq!(next_stage(&request), None);
    }
}
