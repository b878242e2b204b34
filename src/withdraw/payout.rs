//! Stage 3: cross-chain payout
//!
//! Owns `payout_status`. Failed or unreachable transfers are retried with
//! exponential backoff; `payout` goes back to `pending` while a retry is
//! queued and becomes `failed` once the retry budget is spent.

use std::sync::Arc;
use std::time::Instant;

use crate::common::logging::log_stage_event;
use crate::types::task::Stage;
use crate::types::withdraw::{ExecuteStatus, HookStatus, PayoutStatus, WithdrawRequest};
use crate::withdraw::clients::{BridgeAggregator, BridgeError, BridgeStatus, Route};
use crate::withdraw::stage::{elapsed_ms, missing, StageContext, StageError, StartOutcome};

pub struct PayoutCoordinator {
    ctx: StageContext,
    bridge: Arc<dyn BridgeAggregator>,
}

impl PayoutCoordinator {
    pub fn new(ctx: StageContext, bridge: Arc<dyn BridgeAggregator>) -> Self {
        Self { ctx, bridge }
    }

    pub async fn start(&self, request_id: &str) -> Result<StartOutcome, StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let request = self.ctx.load(request_id).await?;
        Ok(payout_gate(&request))
    }

    /// Quote the route and start the bridge transfer
    pub async fn process(&self, request_id: &str) -> Result<StartOutcome, StageError> {
        let outcome = self.start(request_id).await?;
        if let StartOutcome::Rejected(reason) = &outcome {
            tracing::debug!(request_id = %request_id, reason = %reason, "payout stage skipped");
            self.ctx.scheduler.complete(request_id, Stage::Payout).await?;
            return Ok(outcome);
        }

        let request = self.ctx.load(request_id).await?;
        let route = self.build_route(&request).await?;

        let started = Instant::now();
        let result = match self.bridge.quote(&route).await {
            Ok(quote) => {
                tracing::info!(
                    request_id = %request_id,
                    provider = %quote.provider,
                    amount_out = %quote.amount_out,
                    fee = %quote.fee,
                    "bridge quote"
                );
                self.bridge.execute(&route).await
            }
            Err(e) => Err(e),
        };
        let error = result.as_ref().err().map(|e| e.to_string());
        log_stage_event(Stage::Payout, request_id, "bridge_execute", elapsed_ms(started), error.as_deref());

        self.on_execute_result(request_id, result).await?;
        Ok(outcome)
    }

    /// Apply the outcome of starting the transfer
    pub async fn on_execute_result(
        &self,
        request_id: &str,
        result: Result<String, BridgeError>,
    ) -> Result<(), StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let mut request = self.ctx.load(request_id).await?;

        if let StartOutcome::Rejected(reason) = payout_gate(&request) {
            tracing::debug!(request_id = %request_id, reason = %reason, "stale payout result dropped");
            self.ctx.scheduler.complete(request_id, Stage::Payout).await?;
            return Ok(());
        }

        match result {
            Ok(bridge_tx_id) => {
                let before = request.status;
                request.mark_payout_processing(bridge_tx_id);
                self.ctx.persist(&mut request, before).await?;
                self.ctx.scheduler.complete(request_id, Stage::Payout).await?;
                self.ctx
                    .scheduler
                    .enqueue_after(request_id, Stage::PayoutPoll, self.ctx.config.payout_poll_secs)
                    .await?;
            }
            Err(e) => record_payout_failure(&self.ctx, &mut request, &e).await?,
        }
        Ok(())
    }

    /// Check on a running bridge transfer
    pub async fn poll(&self, request_id: &str) -> Result<StartOutcome, StageError> {
        let bridge_tx_id = {
            let _guard = self.ctx.locks.acquire(request_id).await;
            let request = self.ctx.load(request_id).await?;
            if request.is_closed() || request.payout_status != PayoutStatus::Processing {
                self.ctx.scheduler.complete(request_id, Stage::PayoutPoll).await?;
                return Ok(StartOutcome::Rejected(format!("payout is {}", request.payout_status)));
            }
            request
                .bridge_tx_id
                .clone()
                .ok_or_else(|| missing(request_id, "bridge tx id"))?
        };

        let result = self.bridge.status(&bridge_tx_id).await;
        self.on_status(request_id, &bridge_tx_id, result).await?;
        Ok(StartOutcome::Accepted)
    }

    /// Apply a bridge status report for `bridge_tx_id`
    pub async fn on_status(
        &self,
        request_id: &str,
        bridge_tx_id: &str,
        result: Result<BridgeStatus, BridgeError>,
    ) -> Result<(), StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let mut request = self.ctx.load(request_id).await?;

        if request.is_closed()
            || request.payout_status != PayoutStatus::Processing
            || request.bridge_tx_id.as_deref() != Some(bridge_tx_id)
        {
            self.ctx.scheduler.complete(request_id, Stage::PayoutPoll).await?;
            return Ok(());
        }

        match result {
            Ok(BridgeStatus::Pending) => self.repoll(request_id).await?,
            Ok(BridgeStatus::Completed { tx_hash }) => {
                log_stage_event(Stage::PayoutPoll, request_id, "bridge_completed", None, None);
                record_payout_completed(&self.ctx, &mut request, tx_hash).await?;
            }
            Ok(BridgeStatus::Failed { reason }) => {
                log_stage_event(Stage::PayoutPoll, request_id, "bridge_failed", None, Some(&reason));
                record_payout_failure(&self.ctx, &mut request, &BridgeError::Failed(reason)).await?;
            }
            Err(BridgeError::Transient(e)) => {
                tracing::warn!(request_id = %request_id, error = %e, "bridge status unavailable");
                self.repoll(request_id).await?;
            }
            Err(e) => record_payout_failure(&self.ctx, &mut request, &e).await?,
        }
        Ok(())
    }

    async fn repoll(&self, request_id: &str) -> Result<(), StageError> {
        self.ctx
            .scheduler
            .enqueue_after(request_id, Stage::PayoutPoll, self.ctx.config.payout_poll_secs)
            .await?;
        Ok(())
    }

    async fn build_route(&self, request: &WithdrawRequest) -> Result<Route, StageError> {
        let checkbook = self
            .ctx
            .store
            .get_checkbook(&request.checkbook_id)
            .await?
            .ok_or_else(|| missing(&request.id, "checkbook"))?;
        let beneficiary = *request.intent.beneficiary();

        Ok(Route {
            request_id: request.id.clone(),
            source_chain_id: checkbook.chain_id,
            target_chain_id: beneficiary.chain_id,
            token_key: request.token_key.clone(),
            payout_token: request.intent.payout_token().to_string(),
            amount: request.amount,
            beneficiary,
        })
    }
}

fn payout_gate(request: &WithdrawRequest) -> StartOutcome {
    if request.is_closed() {
        return StartOutcome::Rejected(format!("request is {}", request.status));
    }
    if request.execute_status != ExecuteStatus::Success {
        return StartOutcome::Rejected(format!("execute is {}", request.execute_status));
    }
    if request.payout_status != PayoutStatus::Pending {
        return StartOutcome::Rejected(format!("payout is {}", request.payout_status));
    }
    StartOutcome::Accepted
}

/// Record a failed payout attempt: queue a backoff retry while the budget
/// lasts, otherwise stamp `payout = failed`. The caller holds the request lock.
pub(crate) async fn record_payout_failure(
    ctx: &StageContext,
    request: &mut WithdrawRequest,
    error: &BridgeError,
) -> Result<(), StageError> {
    let before = request.status;
    let message = error.to_string();

    if error.is_retryable() && request.payout_retry_count < ctx.config.payout_max_retries {
        request.mark_payout_retry_scheduled(message.clone());
        ctx.persist(request, before).await?;
        ctx.scheduler.complete(&request.id, Stage::PayoutPoll).await?;
        ctx.scheduler
            .schedule_retry(&request.id, Stage::Payout, request.payout_retry_count, &message)
            .await?;
        return Ok(());
    }

    tracing::error!(
        request_id = %request.id,
        retries = request.payout_retry_count,
        error = %message,
        "payout failed permanently"
    );
    request.mark_payout_failed(message);
    ctx.persist(request, before).await?;
    ctx.scheduler.complete(&request.id, Stage::Payout).await?;
    ctx.scheduler.complete(&request.id, Stage::PayoutPoll).await?;
    ctx.record(|s| s.failed_permanent += 1).await;
    Ok(())
}

/// Stamp `payout = completed` and queue the hook for asset intents. Also
/// reached from `failed` when the beneficiary claimed the funds on timeout.
pub(crate) async fn record_payout_completed(
    ctx: &StageContext,
    request: &mut WithdrawRequest,
    tx_hash: Option<String>,
) -> Result<(), StageError> {
    let before = request.status;
    request.mark_payout_completed(tx_hash);
    ctx.persist(request, before).await?;
    ctx.scheduler.complete(&request.id, Stage::Payout).await?;
    ctx.scheduler.complete(&request.id, Stage::PayoutPoll).await?;
    ctx.record(|s| s.payouts_completed += 1).await;

    if request.intent.requires_hook() && request.hook_status == HookStatus::Pending {
        ctx.scheduler.enqueue(&request.id, Stage::Hook).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_secs;
    use crate::types::units::TokenAmount;
    use crate::types::withdraw::MainStatus;
    use crate::withdraw::clients::{MockBridgeAggregator, Quote};
    use crate::withdraw::test_support::{artifact, save, seeded_context};

    async fn executed(asset: bool) -> (StageContext, WithdrawRequest) {
        let (ctx, mut request) = seeded_context(asset).await;
        request.mark_proof_completed(artifact());
        request.mark_execute_submitted("0xexec".to_string());
        request.mark_execute_success(None);
        save(&ctx, &mut request).await;
        (ctx, request)
    }

    fn quote() -> Quote {
        Quote {
            provider: "relay".to_string(),
            amount_out: TokenAmount(2_990),
            fee: TokenAmount(10),
        }
    }

    #[tokio::test]
    async fn test_transfer_completes_after_poll() {
        let (ctx, request) = executed(false).await;

        let mut bridge = MockBridgeAggregator::new();
        bridge.expect_quote().times(1).returning(|_| Ok(quote()));
        bridge
            .expect_execute()
            .withf(|route| route.source_chain_id == 714 && route.payout_token == "USDT")
            .times(1)
            .returning(|_| Ok("br-1".to_string()));
        bridge
            .expect_status()
            .times(2)
            .returning({
                let mut calls = 0;
                move |_| {
                    calls += 1;
                    if calls == 1 {
                        Ok(BridgeStatus::Pending)
                    } else {
                        Ok(BridgeStatus::Completed { tx_hash: Some("0xpaid".to_string()) })
                    }
                }
            });

        let coordinator = PayoutCoordinator::new(ctx.clone(), Arc::new(bridge));
        coordinator.process(&request.id).await.unwrap();

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.status, MainStatus::PayoutProcessing);
        assert_eq!(stored.bridge_tx_id.as_deref(), Some("br-1"));
        assert!(ctx.scheduler.pending(&request.id, Stage::PayoutPoll).await.unwrap().is_some());

        coordinator.poll(&request.id).await.unwrap();
        assert_eq!(ctx.load(&request.id).await.unwrap().status, MainStatus::PayoutProcessing);

        coordinator.poll(&request.id).await.unwrap();
        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.status, MainStatus::Completed);
        assert_eq!(stored.payout_tx_hash.as_deref(), Some("0xpaid"));
        assert!(ctx.scheduler.pending(&request.id, Stage::PayoutPoll).await.unwrap().is_none());
        assert!(ctx.scheduler.pending(&request.id, Stage::Hook).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_asset_intent_queues_hook() {
        let (ctx, mut request) = executed(true).await;
        request.mark_payout_processing("br-9".to_string());
        save(&ctx, &mut request).await;

        let coordinator = PayoutCoordinator::new(ctx.clone(), Arc::new(MockBridgeAggregator::new()));
        coordinator
            .on_status(&request.id, "br-9", Ok(BridgeStatus::Completed { tx_hash: None }))
            .await
            .unwrap();

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.payout_status, PayoutStatus::Completed);
        assert!(ctx.scheduler.pending(&request.id, Stage::Hook).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_backoff_until_exhausted() {
        let (ctx, request) = executed(false).await;

        let mut bridge = MockBridgeAggregator::new();
        bridge.expect_quote().times(6).returning(|_| Ok(quote()));
        bridge
            .expect_execute()
            .times(6)
            .returning(|_| Err(BridgeError::Transient("503".to_string())));
        let coordinator = PayoutCoordinator::new(ctx.clone(), Arc::new(bridge));

        for (retry, delay) in [(1u32, 30u64), (2, 60), (3, 120), (4, 240), (5, 480)] {
            let before = now_secs();
            coordinator.process(&request.id).await.unwrap();

            let stored = ctx.load(&request.id).await.unwrap();
            assert_eq!(stored.payout_status, PayoutStatus::Pending);
            assert_eq!(stored.payout_retry_count, retry);
            let task = ctx.scheduler.pending(&request.id, Stage::Payout).await.unwrap().unwrap();
            assert_eq!(task.attempt, retry);
            assert!(task.next_eligible_at >= before + delay);
        }

        coordinator.process(&request.id).await.unwrap();
        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.payout_status, PayoutStatus::Failed);
        assert_eq!(stored.status, MainStatus::FailedPermanent);
        assert!(!stored.can_retry_payout(ctx.config.payout_max_retries));
        assert!(ctx.scheduler.pending(&request.id, Stage::Payout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_route_fails_at_once() {
        let (ctx, request) = executed(false).await;

        let mut bridge = MockBridgeAggregator::new();
        bridge
            .expect_quote()
            .times(1)
            .returning(|_| Err(BridgeError::Rejected("no route".to_string())));
        bridge.expect_execute().times(0);
        let coordinator = PayoutCoordinator::new(ctx.clone(), Arc::new(bridge));
        coordinator.process(&request.id).await.unwrap();

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.payout_status, PayoutStatus::Failed);
        assert_eq!(stored.payout_retry_count, 0);
    }

    #[tokio::test]
    async fn test_bridge_reported_failure_schedules_retry() {
        let (ctx, mut request) = executed(false).await;
        request.mark_payout_processing("br-2".to_string());
        save(&ctx, &mut request).await;

        let coordinator = PayoutCoordinator::new(ctx.clone(), Arc::new(MockBridgeAggregator::new()));
        coordinator
            .on_status(&request.id, "br-2", Ok(BridgeStatus::Failed { reason: "slippage".to_string() }))
            .await
            .unwrap();

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.payout_status, PayoutStatus::Pending);
        assert_eq!(stored.payout_retry_count, 1);
        assert!(stored.bridge_tx_id.is_none());
        assert!(ctx.scheduler.pending(&request.id, Stage::Payout).await.unwrap().is_some());
    }
}
