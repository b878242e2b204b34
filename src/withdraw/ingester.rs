//! Chain Event Ingester
//!
//! Applies events delivered at least once by the event bus. An event is
//! recorded as processed only after its transition is persisted, so a crash
//! in between replays it; the transitions themselves ignore events the
//! request has already moved past.

use crate::common::logging::log_chain_event;
use crate::types::checkbook::CheckbookStatus;
use crate::types::events::{ChainEvent, EventKind};
use crate::types::task::Stage;
use crate::types::withdraw::{ExecuteStatus, HookStatus, PayoutStatus};
use crate::withdraw::clients::BridgeError;
use crate::withdraw::payout::{record_payout_completed, record_payout_failure};
use crate::withdraw::stage::{StageContext, StageError};
use crate::withdraw::submitter::record_execution_success;

/// What `ingest` did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Transition applied and event recorded
    Applied,
    /// Event key seen before; nothing done
    Duplicate,
    /// Event recorded but the target had moved past it
    Ignored(String),
    /// No checkbook or request matches; not recorded so a redelivery can
    /// still apply it
    Unmatched(String),
}

impl IngestOutcome {
    fn should_record(&self) -> bool {
        matches!(self, IngestOutcome::Applied | IngestOutcome::Ignored(_))
    }
}

pub struct EventIngester {
    ctx: StageContext,
}

impl EventIngester {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    pub async fn ingest(&self, event: &ChainEvent) -> Result<IngestOutcome, StageError> {
        let key = event.key.to_string();
        let kind = event.kind.name();

        if self.ctx.store.is_event_processed(&event.key).await? {
            log_chain_event(kind, &key, None, false);
            return Ok(IngestOutcome::Duplicate);
        }

        let (outcome, request_id) = match &event.kind {
            EventKind::DepositRecorded { checkbook_id } => {
                (self.apply_deposit(checkbook_id).await?, None)
            }
            withdraw_kind => self.apply_withdraw_event(event, withdraw_kind).await?,
        };

        if outcome.should_record() {
            self.ctx.store.mark_event_processed(&event.key, kind).await?;
        }

        log_chain_event(kind, &key, request_id.as_deref(), outcome == IngestOutcome::Applied);
        if let IngestOutcome::Ignored(reason) | IngestOutcome::Unmatched(reason) = &outcome {
            tracing::debug!(event = %key, kind, reason = %reason, "chain event not applied");
        }
        Ok(outcome)
    }

    async fn apply_deposit(&self, checkbook_id: &str) -> Result<IngestOutcome, StageError> {
        let Some(mut checkbook) = self.ctx.store.get_checkbook(checkbook_id).await? else {
            return Ok(IngestOutcome::Unmatched(format!("unknown checkbook {}", checkbook_id)));
        };

        if !checkbook.advance_status(CheckbookStatus::ReadyForCommitment) {
            return Ok(IngestOutcome::Ignored(format!("checkbook is {}", checkbook.status)));
        }
        self.ctx.store.update_checkbook(&checkbook).await?;
        Ok(IngestOutcome::Applied)
    }

    async fn apply_withdraw_event(
        &self,
        event: &ChainEvent,
        kind: &EventKind,
    ) -> Result<(IngestOutcome, Option<String>), StageError> {
        let Some(onchain_id) = kind.request_id() else {
            return Ok((IngestOutcome::Unmatched("event carries no request id".to_string()), None));
        };
        let Some(found) = self.ctx.store.get_request_by_onchain_id(onchain_id).await? else {
            return Ok((
                IngestOutcome::Unmatched(format!("unknown on-chain request {}", onchain_id)),
                None,
            ));
        };

        let request_id = found.id;
        let _guard = self.ctx.locks.acquire(&request_id).await;
        let mut request = self.ctx.load(&request_id).await?;

        if request.is_closed() {
            let reason = format!("request is {}", request.status);
            return Ok((IngestOutcome::Ignored(reason), Some(request_id)));
        }

        let tx_hash = Some(event.key.tx_hash.clone());
        let before = request.status;
        let ctx = &self.ctx;

        let outcome = match kind {
            EventKind::WithdrawExecuted { nullifiers, .. } => match request.execute_status {
                ExecuteStatus::Pending | ExecuteStatus::Submitted | ExecuteStatus::SubmitFailed => {
                    record_execution_success(ctx, &mut request, tx_hash, nullifiers).await?;
                    ctx.scheduler.complete(&request_id, Stage::Execute).await?;
                    ctx.scheduler.complete(&request_id, Stage::Confirm).await?;
                    IngestOutcome::Applied
                }
                other => IngestOutcome::Ignored(format!("execute is {}", other)),
            },

            EventKind::WithdrawReverted { reason, .. } => {
                if request.execute_status == ExecuteStatus::Submitted {
                    request.mark_execute_verify_failed(format!("reverted: {}", reason));
                    ctx.persist(&mut request, before).await?;
                    ctx.scheduler.complete(&request_id, Stage::Confirm).await?;
                    ctx.record(|s| s.failed_permanent += 1).await;
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Ignored(format!("execute is {}", request.execute_status))
                }
            }

            EventKind::PayoutExecuted { .. } => {
                if request.execute_status == ExecuteStatus::Success
                    && matches!(request.payout_status, PayoutStatus::Pending | PayoutStatus::Processing)
                {
                    record_payout_completed(ctx, &mut request, tx_hash).await?;
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Ignored(format!("payout is {}", request.payout_status))
                }
            }

            EventKind::PayoutFailed { reason, .. } => {
                if request.payout_status == PayoutStatus::Processing {
                    record_payout_failure(ctx, &mut request, &BridgeError::Failed(reason.clone())).await?;
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Ignored(format!("payout is {}", request.payout_status))
                }
            }

            EventKind::TimeoutClaimed { .. } => {
                if request.execute_status == ExecuteStatus::Success
                    && request.payout_status != PayoutStatus::Completed
                {
                    record_payout_completed(ctx, &mut request, tx_hash).await?;
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Ignored(format!("payout is {}", request.payout_status))
                }
            }

            EventKind::HookExecuted { .. } => {
                if request.payout_status == PayoutStatus::Completed
                    && matches!(request.hook_status, HookStatus::Pending | HookStatus::Processing)
                {
                    request.mark_hook_completed(tx_hash);
                    ctx.persist(&mut request, before).await?;
                    ctx.scheduler.complete(&request_id, Stage::Hook).await?;
                    ctx.record(|s| s.hooks_completed += 1).await;
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Ignored(format!("hook is {}", request.hook_status))
                }
            }

            EventKind::HookFailed { reason, .. } => {
                if request.hook_status == HookStatus::Processing {
                    request.mark_hook_failed(reason.clone());
                    ctx.persist(&mut request, before).await?;
                    // the hook task runs the fallback transfer
                    ctx.scheduler.enqueue(&request_id, Stage::Hook).await?;
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Ignored(format!("hook is {}", request.hook_status))
                }
            }

            EventKind::FallbackTransferred { .. } => {
                if request.hook_status == HookStatus::Failed && !request.fallback_transferred {
                    request.mark_fallback_transferred(tx_hash);
                    ctx.persist(&mut request, before).await?;
                    ctx.scheduler.complete(&request_id, Stage::Hook).await?;
                    ctx.record(|s| s.fallbacks += 1).await;
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Ignored(format!("hook is {}", request.hook_status))
                }
            }

            EventKind::FallbackFailed { reason, .. } => {
                if request.hook_status == HookStatus::Failed && !request.fallback_transferred {
                    request.mark_fallback_failed(reason.clone());
                    ctx.persist(&mut request, before).await?;
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Ignored(format!("hook is {}", request.hook_status))
                }
            }

            EventKind::ManuallyResolved { note, .. } => {
                request.mark_manually_resolved(note.clone());
                ctx.persist(&mut request, before).await?;
                ctx.scheduler.cancel_all(&request_id).await?;
                IngestOutcome::Applied
            }

            EventKind::DepositRecorded { .. } => {
                IngestOutcome::Unmatched("deposit event routed as withdraw event".to_string())
            }
        };

        Ok((outcome, Some(request_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::fixture_checkbook;
    use crate::types::events::EventKey;
    use crate::types::primitives::Bytes32;
    use crate::types::withdraw::{MainStatus, WithdrawRequest};
    use crate::withdraw::test_support::{artifact, save, seeded_context};

    fn event(tx: &str, kind: EventKind) -> ChainEvent {
        ChainEvent::new(EventKey::new(714, tx, 0), kind)
    }

    async fn submitted() -> (StageContext, WithdrawRequest) {
        let (ctx, mut request) = seeded_context(true).await;
        request.mark_proof_completed(artifact());
        request.mark_execute_submitted("0xexec".to_string());
        save(&ctx, &mut request).await;
        (ctx, request)
    }

    #[tokio::test]
    async fn test_executed_event_is_applied_once() {
        let (ctx, request) = submitted().await;
        let ingester = EventIngester::new(ctx.clone());
        let executed = event(
            "0xEXEC",
            EventKind::WithdrawExecuted {
                request_id: request.onchain_request_id,
                nullifiers: vec![],
            },
        );

        assert_eq!(ingester.ingest(&executed).await.unwrap(), IngestOutcome::Applied);
        assert_eq!(ingester.ingest(&executed).await.unwrap(), IngestOutcome::Duplicate);

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.status, MainStatus::WaitingForPayout);
        assert_eq!(stored.execute_tx_hash.as_deref(), Some("0xexec"));
        let allocations = ctx.store.get_allocations_by_request(&request.id).await.unwrap();
        assert!(allocations.iter().all(|a| a.is_used()));
        assert!(ctx.scheduler.pending(&request.id, Stage::Payout).await.unwrap().is_some());

        // a second delivery under a new key finds the request already executed
        let replay = ChainEvent::new(EventKey::new(714, "0xexec", 1), executed.kind.clone());
        assert!(matches!(ingester.ingest(&replay).await.unwrap(), IngestOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn test_unknown_request_is_not_recorded() {
        let (ctx, _) = seeded_context(false).await;
        let ingester = EventIngester::new(ctx.clone());
        let orphan = event("0x01", EventKind::PayoutExecuted { request_id: Bytes32([0xab; 32]) });

        assert!(matches!(ingester.ingest(&orphan).await.unwrap(), IngestOutcome::Unmatched(_)));
        assert!(!ctx.store.is_event_processed(&orphan.key).await.unwrap());
    }

    #[tokio::test]
    async fn test_deposit_recorded_advances_checkbook() {
        let (ctx, _) = seeded_context(false).await;
        let (mut cb, allocations) = fixture_checkbook("cb_new", 1);
        cb.commitment = None;
        cb.status = CheckbookStatus::Pending;
        ctx.store.insert_checkbook(&cb, &allocations).await.unwrap();

        let ingester = EventIngester::new(ctx.clone());
        let recorded = event(
            "0x02",
            EventKind::DepositRecorded { checkbook_id: "cb_new".to_string() },
        );
        assert_eq!(ingester.ingest(&recorded).await.unwrap(), IngestOutcome::Applied);

        let stored = ctx.store.get_checkbook("cb_new").await.unwrap().unwrap();
        assert_eq!(stored.status, CheckbookStatus::ReadyForCommitment);
    }

    #[tokio::test]
    async fn test_hook_failure_event_queues_fallback() {
        let (ctx, mut request) = submitted().await;
        request.mark_execute_success(None);
        request.mark_payout_completed(None);
        request.mark_hook_processing();
        save(&ctx, &mut request).await;

        let ingester = EventIngester::new(ctx.clone());
        let failed = event(
            "0x03",
            EventKind::HookFailed {
                request_id: request.onchain_request_id,
                reason: "slippage".to_string(),
            },
        );
        assert_eq!(ingester.ingest(&failed).await.unwrap(), IngestOutcome::Applied);

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.status, MainStatus::FailedPermanent);
        assert!(ctx.scheduler.pending(&request.id, Stage::Hook).await.unwrap().is_some());

        let fallback = event(
            "0x04",
            EventKind::FallbackTransferred { request_id: request.onchain_request_id },
        );
        assert_eq!(ingester.ingest(&fallback).await.unwrap(), IngestOutcome::Applied);
        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.status, MainStatus::Completed);
        assert!(ctx.scheduler.pending(&request.id, Stage::Hook).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timeout_claim_recovers_failed_payout() {
        let (ctx, mut request) = submitted().await;
        request.intent = crate::types::withdraw::Intent::RawToken {
            beneficiary: *request.intent.beneficiary(),
            token_symbol: "USDT".to_string(),
        };
        request.hook_status = HookStatus::NotRequired;
        request.mark_execute_success(None);
        request.mark_payout_failed("route closed".to_string());
        save(&ctx, &mut request).await;
        assert_eq!(request.status, MainStatus::FailedPermanent);

        let ingester = EventIngester::new(ctx.clone());
        let claimed = event("0x05", EventKind::TimeoutClaimed { request_id: request.onchain_request_id });
        assert_eq!(ingester.ingest(&claimed).await.unwrap(), IngestOutcome::Applied);

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.status, MainStatus::Completed);
        assert_eq!(stored.payout_tx_hash.as_deref(), Some("0x05"));
    }

    #[tokio::test]
    async fn test_manual_resolution_closes_request() {
        let (ctx, request) = submitted().await;
        ctx.scheduler.enqueue(&request.id, Stage::Confirm).await.unwrap();

        let ingester = EventIngester::new(ctx.clone());
        let resolved = event(
            "0x06",
            EventKind::ManuallyResolved {
                request_id: request.onchain_request_id,
                note: "refunded off-band".to_string(),
            },
        );
        assert_eq!(ingester.ingest(&resolved).await.unwrap(), IngestOutcome::Applied);

        let stored = ctx.load(&request.id).await.unwrap();
        assert_eq!(stored.status, MainStatus::ManuallyResolved);
        assert_eq!(stored.resolution_note.as_deref(), Some("refunded off-band"));
        assert!(ctx.scheduler.pending(&request.id, Stage::Confirm).await.unwrap().is_none());

        // closed requests ignore later events
        let late = event("0x07", EventKind::PayoutExecuted { request_id: request.onchain_request_id });
        assert!(matches!(ingester.ingest(&late).await.unwrap(), IngestOutcome::Ignored(_)));
    }
}
