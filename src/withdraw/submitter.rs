//! Stage 2: on-chain execution
//!
//! Owns `execute_status`. Submission and confirmation are separate tasks so a
//! restart between them only re-runs the confirmation wait. The confirmation
//! consumes the allocations in the same store transaction that stamps
//! `execute = success`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::accumulator::Nullifier;
use crate::common::logging::{log_stage_event, log_status_transition};
use crate::types::task::Stage;
use crate::types::withdraw::{ExecuteStatus, ProofStatus, WithdrawRequest};
use crate::withdraw::clients::{ChainClient, ChainError, Confirmation, ExecuteTx};
use crate::withdraw::ledger::derive_nullifiers;
use crate::withdraw::stage::{elapsed_ms, missing, StageContext, StageError, StartOutcome};

pub struct ChainSubmitter {
    ctx: StageContext,
    chain: Arc<dyn ChainClient>,
}

impl ChainSubmitter {
    pub fn new(ctx: StageContext, chain: Arc<dyn ChainClient>) -> Self {
        Self { ctx, chain }
    }

    /// Check that the request has a proof and nothing on chain yet
    pub async fn start(&self, request_id: &str) -> Result<StartOutcome, StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let request = self.ctx.load(request_id).await?;
        Ok(submit_gate(&request))
    }

    /// Build and broadcast the stage-2 transaction
    pub async fn process(&self, request_id: &str) -> Result<StartOutcome, StageError> {
        let outcome = self.start(request_id).await?;
        if let StartOutcome::Rejected(reason) = &outcome {
            tracing::debug!(request_id = %request_id, reason = %reason, "execute stage skipped");
            self.ctx.scheduler.complete(request_id, Stage::Execute).await?;
            return Ok(outcome);
        }

        let request = self.ctx.load(request_id).await?;
        let tx = self.build_tx(&request).await?;

        let started = Instant::now();
        let result = self.chain.submit(&tx).await;
        let error = result.as_ref().err().map(|e| e.to_string());
        log_stage_event(Stage::Execute, request_id, "submit", elapsed_ms(started), error.as_deref());

        self.on_submit_result(request_id, result).await?;
        Ok(outcome)
    }

    /// Apply the broadcast outcome
    pub async fn on_submit_result(
        &self,
        request_id: &str,
        result: Result<String, ChainError>,
    ) -> Result<(), StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let mut request = self.ctx.load(request_id).await?;

        if let StartOutcome::Rejected(reason) = submit_gate(&request) {
            if result.is_ok() {
                tracing::warn!(
                    request_id = %request_id,
                    reason = %reason,
                    "transaction broadcast for a request that moved on"
                );
            }
            self.ctx.scheduler.complete(request_id, Stage::Execute).await?;
            return Ok(());
        }

        let before = request.status;
        match result {
            Ok(tx_hash) => {
                request.mark_execute_submitted(tx_hash);
                self.ctx.persist(&mut request, before).await?;
                self.ctx.scheduler.enqueue(request_id, Stage::Confirm).await?;
            }
            Err(e) if e.is_transient() => {
                request.mark_execute_submit_failed(e.to_string());
                self.ctx.persist(&mut request, before).await?;
            }
            Err(e) => {
                request.mark_execute_verify_failed(e.to_string());
                self.ctx.persist(&mut request, before).await?;
                self.ctx.record(|s| s.failed_permanent += 1).await;
            }
        }

        self.ctx.scheduler.complete(request_id, Stage::Execute).await?;
        Ok(())
    }

    /// Wait for the submitted transaction to become final
    pub async fn confirm(&self, request_id: &str) -> Result<StartOutcome, StageError> {
        let tx_hash = {
            let _guard = self.ctx.locks.acquire(request_id).await;
            let request = self.ctx.load(request_id).await?;
            if request.is_closed() || request.execute_status != ExecuteStatus::Submitted {
                self.ctx.scheduler.complete(request_id, Stage::Confirm).await?;
                return Ok(StartOutcome::Rejected(format!("execute is {}", request.execute_status)));
            }
            request
                .execute_tx_hash
                .clone()
                .ok_or_else(|| missing(request_id, "execute tx hash"))?
        };

        let started = Instant::now();
        let result = self.chain.await_confirmation(&tx_hash).await;
        let error = result.as_ref().err().map(|e| e.to_string());
        log_stage_event(Stage::Confirm, request_id, "await_confirmation", elapsed_ms(started), error.as_deref());

        self.on_confirmation(request_id, &tx_hash, result).await?;
        Ok(StartOutcome::Accepted)
    }

    /// Apply the confirmation of `tx_hash`
    pub async fn on_confirmation(
        &self,
        request_id: &str,
        tx_hash: &str,
        result: Result<Confirmation, ChainError>,
    ) -> Result<(), StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let mut request = self.ctx.load(request_id).await?;

        if request.is_closed() || request.execute_status != ExecuteStatus::Submitted {
            self.ctx.scheduler.complete(request_id, Stage::Confirm).await?;
            return Ok(());
        }

        match result {
            Ok(Confirmation::Success { nullifiers }) => {
                record_execution_success(&self.ctx, &mut request, Some(tx_hash.to_string()), &nullifiers)
                    .await?;
            }
            Ok(Confirmation::Reverted { reason }) => {
                let before = request.status;
                request.mark_execute_verify_failed(format!("reverted: {}", reason));
                self.ctx.persist(&mut request, before).await?;
                self.ctx.record(|s| s.failed_permanent += 1).await;
            }
            Err(e) => {
                // The nullifiers may already be spent; keep waiting
                tracing::warn!(request_id = %request_id, error = %e, "confirmation unavailable, rechecking");
                self.ctx
                    .scheduler
                    .enqueue_after(request_id, Stage::Confirm, self.ctx.config.payout_poll_secs)
                    .await?;
                return Ok(());
            }
        }

        self.ctx.scheduler.complete(request_id, Stage::Confirm).await?;
        Ok(())
    }

    async fn build_tx(&self, request: &WithdrawRequest) -> Result<ExecuteTx, StageError> {
        let (checkbook, commitment, allocations) = self.ctx.load_spend(request).await?;
        let proof = request
            .proof
            .clone()
            .ok_or_else(|| missing(&request.id, "proof"))?;

        Ok(ExecuteTx {
            request_id: request.id.clone(),
            chain_id: checkbook.chain_id,
            onchain_request_id: request.onchain_request_id,
            commitment,
            nullifiers: derive_nullifiers(&commitment, &allocations)
                .into_iter()
                .map(|(_, n)| n)
                .collect(),
            proof,
            amount: request.amount,
            token_key: request.token_key.clone(),
            beneficiary: *request.intent.beneficiary(),
        })
    }
}

fn submit_gate(request: &WithdrawRequest) -> StartOutcome {
    if request.is_closed() {
        return StartOutcome::Rejected(format!("request is {}", request.status));
    }
    if request.proof_status != ProofStatus::Completed {
        return StartOutcome::Rejected(format!("proof is {}", request.proof_status));
    }
    match request.execute_status {
        ExecuteStatus::Pending | ExecuteStatus::SubmitFailed => StartOutcome::Accepted,
        other => StartOutcome::Rejected(format!("execute is {}", other)),
    }
}

/// Stamp `execute = success` and consume the allocations in one store
/// transaction, then queue the payout. The caller holds the request lock.
///
/// A non-empty `reported` set must equal the nullifiers derived from the
/// commitment; a mismatch is a verification failure and consumes nothing.
/// An empty set cannot be checked and is logged; the derived nullifiers are
/// consumed. Returns whether the execution was recorded.
pub(crate) async fn record_execution_success(
    ctx: &StageContext,
    request: &mut WithdrawRequest,
    tx_hash: Option<String>,
    reported: &[Nullifier],
) -> Result<bool, StageError> {
    let (_, commitment, allocations) = ctx.load_spend(request).await?;
    let consumptions = derive_nullifiers(&commitment, &allocations);

    if reported.is_empty() {
        tracing::warn!(
            request_id = %request.id,
            tx_hash = tx_hash.as_deref().unwrap_or("-"),
            expected = consumptions.len(),
            "execution reported without nullifiers; consuming the derived set unchecked"
        );
    } else {
        let expected: BTreeSet<&Nullifier> = consumptions.iter().map(|(_, n)| n).collect();
        let seen: BTreeSet<&Nullifier> = reported.iter().collect();
        if expected != seen {
            tracing::error!(
                request_id = %request.id,
                expected = expected.len(),
                reported = seen.len(),
                "confirmed nullifiers do not match the commitment"
            );
            let before = request.status;
            request.mark_execute_verify_failed("nullifier mismatch".to_string());
            ctx.persist(request, before).await?;
            ctx.record(|s| s.failed_permanent += 1).await;
            return Ok(false);
        }
    }

    let before = request.status;
    request.mark_execute_success(tx_hash);
    ctx.ledger.commit_execution(request, &consumptions).await?;
    log_status_transition(request, before);

    ctx.scheduler.enqueue(&request.id, Stage::Payout).await?;
    ctx.record(|s| s.executions_confirmed += 1).await;
    Ok(true)
}
