//! Stage 4: hook purchase
//!
//! Runs only for asset intents once the payout completed. A failed purchase
//! is followed right away by a fallback transfer of the raw payout.

use std::sync::Arc;
use std::time::Instant;

use crate::common::logging::log_stage_event;
use crate::types::task::Stage;
use crate::types::withdraw::{HookStatus, Intent, PayoutStatus, WithdrawRequest};
use crate::withdraw::clients::{HookError, HookOrder, HookService};
use crate::withdraw::stage::{elapsed_ms, missing, StageContext, StageError, StartOutcome};

pub struct HookExecutor {
    ctx: StageContext,
    hooks: Arc<dyn HookService>,
}

impl HookExecutor {
    pub fn new(ctx: StageContext, hooks: Arc<dyn HookService>) -> Self {
        Self { ctx, hooks }
    }

    /// Move `hook` to `processing`. A request already processing (crash
    /// mid-purchase) or failed without fallback is accepted as is. A rejected
    /// request loses its hook task while the lock is still held.
    pub async fn start(&self, request_id: &str) -> Result<StartOutcome, StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let mut request = self.ctx.load(request_id).await?;

        let outcome = match hook_gate(&request) {
            Some(reason) => StartOutcome::Rejected(reason),
            None if request.hook_status == HookStatus::Pending => {
                let before = request.status;
                request.mark_hook_processing();
                self.ctx.persist(&mut request, before).await?;
                StartOutcome::Accepted
            }
            None => StartOutcome::Accepted,
        };

        if let StartOutcome::Rejected(reason) = &outcome {
            tracing::debug!(request_id = %request_id, reason = %reason, "hook stage skipped");
            self.ctx.scheduler.complete(request_id, Stage::Hook).await?;
        }
        Ok(outcome)
    }

    pub async fn process(&self, request_id: &str) -> Result<StartOutcome, StageError> {
        let outcome = self.start(request_id).await?;
        if !outcome.is_accepted() {
            return Ok(outcome);
        }

        let request = self.ctx.load(request_id).await?;
        let order = hook_order(&request)?;

        let needs_fallback = match request.hook_status {
            HookStatus::Processing => {
                let started = Instant::now();
                let result = self.hooks.purchase(&order).await;
                let error = result.as_ref().err().map(|e| e.to_string());
                log_stage_event(Stage::Hook, request_id, "purchase", elapsed_ms(started), error.as_deref());
                self.on_purchase_result(request_id, result).await?
            }
            _ => true,
        };

        if needs_fallback {
            let started = Instant::now();
            let result = self.hooks.fallback_transfer(&order).await;
            let error = result.as_ref().err().map(|e| e.to_string());
            log_stage_event(Stage::Hook, request_id, "fallback_transfer", elapsed_ms(started), error.as_deref());
            self.on_fallback_result(request_id, result).await?;
        }

        Ok(outcome)
    }

    /// Apply the purchase outcome; true when a fallback transfer is due.
    /// The hook task is dropped only when this attempt settled the stage; a
    /// request that moved on meanwhile keeps whatever task it has.
    pub async fn on_purchase_result(
        &self,
        request_id: &str,
        result: Result<String, HookError>,
    ) -> Result<bool, StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let mut request = self.ctx.load(request_id).await?;

        if request.is_closed() || request.hook_status != HookStatus::Processing {
            tracing::debug!(request_id = %request_id, hook = %request.hook_status, "stale purchase result dropped");
            return Ok(false);
        }

        let before = request.status;
        match result {
            Ok(tx_hash) => {
                request.mark_hook_completed(Some(tx_hash));
                self.ctx.persist(&mut request, before).await?;
                self.ctx.scheduler.complete(request_id, Stage::Hook).await?;
                self.ctx.record(|s| s.hooks_completed += 1).await;
                Ok(false)
            }
            Err(e) => {
                request.mark_hook_failed(e.to_string());
                self.ctx.persist(&mut request, before).await?;
                Ok(true)
            }
        }
    }

    pub async fn on_fallback_result(
        &self,
        request_id: &str,
        result: Result<String, HookError>,
    ) -> Result<(), StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let mut request = self.ctx.load(request_id).await?;

        if request.is_closed()
            || request.hook_status != HookStatus::Failed
            || request.fallback_transferred
        {
            // e.g. a purchase retry was requested while the transfer ran
            if let Ok(tx_hash) = &result {
                tracing::warn!(
                    request_id = %request_id,
                    hook = %request.hook_status,
                    tx_hash = %tx_hash,
                    "fallback transfer landed after the request moved on"
                );
            }
            return Ok(());
        }

        let before = request.status;
        match result {
            Ok(tx_hash) => {
                request.mark_fallback_transferred(Some(tx_hash));
                self.ctx.persist(&mut request, before).await?;
                self.ctx.record(|s| s.fallbacks += 1).await;
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "fallback transfer failed");
                request.mark_fallback_failed(e.to_string());
                self.ctx.persist(&mut request, before).await?;
                self.ctx.record(|s| s.failed_permanent += 1).await;
            }
        }
        self.ctx.scheduler.complete(request_id, Stage::Hook).await?;
        Ok(())
    }
}

/// Why the hook stage cannot run for a request, if it cannot
fn hook_gate(request: &WithdrawRequest) -> Option<String> {
    if request.is_closed() {
        return Some(format!("request is {}", request.status));
    }
    if request.payout_status != PayoutStatus::Completed {
        return Some(format!("payout is {}", request.payout_status));
    }
    if !request.intent.requires_hook() {
        return Some("intent needs no hook".to_string());
    }
    match request.hook_status {
        HookStatus::Pending | HookStatus::Processing => None,
        HookStatus::Failed if !request.fallback_transferred => None,
        other => Some(format!("hook is {}", other)),
    }
}

fn hook_order(request: &WithdrawRequest) -> Result<HookOrder, StageError> {
    match &request.intent {
        Intent::AssetToken {
            asset_id,
            beneficiary,
            asset_token_symbol,
        } => Ok(HookOrder {
            request_id: request.id.clone(),
            asset_id: asset_id.clone(),
            beneficiary: *beneficiary,
            token_symbol: asset_token_symbol.clone(),
            amount: request.amount,
        }),
        Intent::RawToken { .. } => Err(missing(&request.id, "asset intent")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::withdraw::MainStatus;
    use crate::withdraw::clients::MockHookService;
    use crate::withdraw::test_support::{artifact, save, seeded_context};

    async fn paid(asset: bool) -> (StageContext, WithdrawRequest) {
        let (ctx, mut request) = seeded_context(asset).await;
        request.mark_proof_completed(artifact());
        request.mark_execute_success(Some("0xexec".to_string()));
        request.mark_payout_completed(Some("0xpaid".to_string()));
        save(&ctx, &mut request).await;
        (ctx, request)
    }

    #[tokio::test]
    async fn test_purchase_completes_request() {
        let (ctx, request) = paid(true).await;
        ctx.scheduler.enqueue(&request.id, Stage::Hook).await.unwrap();

        let mut hooks = MockHookService::new();
        hooks
            .expect_purchase()
            .withf(|order| order.asset_id == "aave-v3-usdt" && order.token_symbol == "aUSDT")
            .times(1)
            .returning(|_| Ok("0xhook".to_string()));
        hooks.expect_fallback_transfer().times(0);

        let executor = HookExecutor::new(ctx.clone(), Arc::new(hooks));
        assert!(executor.process(&request.id).await.unwrap().is_accepted());

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.status, MainStatus::Completed);
        assert_eq!(stored.hook_tx_hash.as_deref(), Some("0xhook"));
        assert!(ctx.scheduler.pending(&request.id, Stage::Hook).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_purchase_falls_back() {
        let (ctx, request) = paid(true).await;

        let mut hooks = MockHookService::new();
        hooks
            .expect_purchase()
            .times(1)
            .returning(|_| Err(HookError::Failed("pool paused".to_string())));
        hooks
            .expect_fallback_transfer()
            .times(1)
            .returning(|_| Ok("0xraw".to_string()));

        let executor = HookExecutor::new(ctx.clone(), Arc::new(hooks));
        executor.process(&request.id).await.unwrap();

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.hook_status, HookStatus::Failed);
        assert!(stored.fallback_transferred);
        assert_eq!(stored.status, MainStatus::Completed);
        // payout is untouched by the hook stage
        assert_eq!(stored.payout_status, PayoutStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_fallback_is_permanent_until_retried() {
        let (ctx, request) = paid(true).await;

        let mut hooks = MockHookService::new();
        hooks
            .expect_purchase()
            .times(1)
            .returning(|_| Err(HookError::Failed("pool paused".to_string())));
        hooks
            .expect_fallback_transfer()
            .times(1)
            .returning(|_| Err(HookError::Unavailable("relayer down".to_string())));

        let executor = HookExecutor::new(ctx.clone(), Arc::new(hooks));
        executor.process(&request.id).await.unwrap();

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.status, MainStatus::FailedPermanent);
        assert!(stored.fallback_error.is_some());
        assert!(stored.can_retry_hook());
    }

    #[tokio::test]
    async fn test_purchase_retry_during_fallback_keeps_its_task() {
        let (ctx, mut request) = paid(true).await;
        request.mark_hook_processing();
        request.mark_hook_failed("pool paused".to_string());
        save(&ctx, &mut request).await;
        ctx.scheduler.enqueue(&request.id, Stage::Hook).await.unwrap();

        // user asks for another purchase while the fallback is out
        request.mark_hook_retry_requested();
        save(&ctx, &mut request).await;
        ctx.scheduler.enqueue(&request.id, Stage::Hook).await.unwrap();

        let executor = HookExecutor::new(ctx.clone(), Arc::new(MockHookService::new()));
        executor
            .on_fallback_result(&request.id, Ok("0xraw".to_string()))
            .await
            .unwrap();

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.hook_status, HookStatus::Pending);
        assert!(!stored.fallback_transferred);
        assert!(ctx.scheduler.pending(&request.id, Stage::Hook).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_purchase_result_leaves_task() {
        let (ctx, request) = paid(true).await;
        ctx.scheduler.enqueue(&request.id, Stage::Hook).await.unwrap();

        let executor = HookExecutor::new(ctx.clone(), Arc::new(MockHookService::new()));
        // hook is still pending, not processing
        let fallback_due = executor
            .on_purchase_result(&request.id, Ok("0xhook".to_string()))
            .await
            .unwrap();
        assert!(!fallback_due);
        assert!(ctx.scheduler.pending(&request.id, Stage::Hook).await.unwrap().is_some());
        assert_eq!(ctx.load(&request.id).await.unwrap().hook_status, HookStatus::Pending);
    }

    #[tokio::test]
    async fn test_raw_intent_is_rejected() {
        let (ctx, request) = paid(false).await;
        ctx.scheduler.enqueue(&request.id, Stage::Hook).await.unwrap();
        let executor = HookExecutor::new(ctx.clone(), Arc::new(MockHookService::new()));
        assert!(!executor.start(&request.id).await.unwrap().is_accepted());
        assert!(ctx.scheduler.pending(&request.id, Stage::Hook).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unpaid_request_is_rejected() {
        let (ctx, mut request) = seeded_context(true).await;
        request.mark_proof_completed(artifact());
        save(&ctx, &mut request).await;

        let executor = HookExecutor::new(ctx.clone(), Arc::new(MockHookService::new()));
        assert!(!executor.start(&request.id).await.unwrap().is_accepted());
        assert_eq!(ctx.load(&request.id).await.unwrap().hook_status, HookStatus::Pending);
    }
}
