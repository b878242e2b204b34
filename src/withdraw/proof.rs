//! Stage 1: proof generation
//!
//! Owns `proof_status`. A proof may be retried any number of times while it
//! is `failed`; success queues stage 2.

use std::sync::Arc;
use std::time::Instant;

use crate::common::logging::log_stage_event;
use crate::types::task::Stage;
use crate::types::withdraw::{ProofArtifact, ProofStatus, WithdrawRequest};
use crate::withdraw::clients::{ProofError, ProofRequest, ProofService};
use crate::withdraw::ledger::derive_nullifiers;
use crate::withdraw::stage::{elapsed_ms, StageContext, StageError, StartOutcome};

pub struct ProofCoordinator {
    ctx: StageContext,
    prover: Arc<dyn ProofService>,
}

impl ProofCoordinator {
    pub fn new(ctx: StageContext, prover: Arc<dyn ProofService>) -> Self {
        Self { ctx, prover }
    }

    /// Stamp `proof = in_progress` if the request may (re)generate its proof
    pub async fn start(&self, request_id: &str) -> Result<StartOutcome, StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let mut request = self.ctx.load(request_id).await?;

        if request.is_closed() {
            return Ok(StartOutcome::Rejected(format!("request is {}", request.status)));
        }
        if !matches!(request.proof_status, ProofStatus::Pending | ProofStatus::Failed) {
            return Ok(StartOutcome::Rejected(format!("proof is {}", request.proof_status)));
        }

        let before = request.status;
        request.mark_proof_in_progress();
        self.ctx.persist(&mut request, before).await?;
        Ok(StartOutcome::Accepted)
    }

    /// Run the stage for a queued task
    pub async fn process(&self, request_id: &str) -> Result<StartOutcome, StageError> {
        let outcome = self.start(request_id).await?;
        if let StartOutcome::Rejected(reason) = &outcome {
            tracing::debug!(request_id = %request_id, reason = %reason, "proof stage skipped");
            self.ctx.scheduler.complete(request_id, Stage::Proof).await?;
            return Ok(outcome);
        }

        let request = self.ctx.load(request_id).await?;
        let started = Instant::now();
        let result = match self.build_request(&request).await {
            Ok(proof_request) => self.prover.generate_proof(&proof_request).await,
            Err(e) => Err(ProofError::Failed(format!("cannot assemble proof inputs: {}", e))),
        };

        let error = result.as_ref().err().map(|e| e.to_string());
        log_stage_event(Stage::Proof, request_id, "generate_proof", elapsed_ms(started), error.as_deref());

        self.on_result(request_id, result).await?;
        Ok(outcome)
    }

    /// Apply the proof service's answer. Results for a request that is no
    /// longer `in_progress` (timed out, cancelled) are dropped.
    pub async fn on_result(
        &self,
        request_id: &str,
        result: Result<ProofArtifact, ProofError>,
    ) -> Result<(), StageError> {
        let _guard = self.ctx.locks.acquire(request_id).await;
        let mut request = self.ctx.load(request_id).await?;

        if request.is_closed() || request.proof_status != ProofStatus::InProgress {
            tracing::debug!(
                request_id = %request_id,
                proof_status = %request.proof_status,
                "stale proof result dropped"
            );
            self.ctx.scheduler.complete(request_id, Stage::Proof).await?;
            return Ok(());
        }

        let before = request.status;
        match result {
            Ok(artifact) => {
                request.mark_proof_completed(artifact);
                self.ctx.persist(&mut request, before).await?;
                self.ctx.scheduler.enqueue(request_id, Stage::Execute).await?;
                self.ctx.record(|s| s.proofs_completed += 1).await;
            }
            Err(e) => {
                request.mark_proof_failed(e.to_string());
                self.ctx.persist(&mut request, before).await?;
            }
        }

        self.ctx.scheduler.complete(request_id, Stage::Proof).await?;
        Ok(())
    }

    async fn build_request(&self, request: &WithdrawRequest) -> Result<ProofRequest, StageError> {
        let (checkbook, commitment, allocations) = self.ctx.load_spend(request).await?;
        let nullifiers = derive_nullifiers(&commitment, &allocations);

        Ok(ProofRequest {
            request_id: request.id.clone(),
            checkbook_id: checkbook.id.clone(),
            deposit: checkbook.deposit_metadata(),
            commitment,
            allocations: allocations.iter().map(|a| a.leaf()).collect(),
            nullifiers: nullifiers.into_iter().map(|(_, n)| n).collect(),
            onchain_request_id: request.onchain_request_id,
            amount: request.amount,
            intent: request.intent.clone(),
        })
    }
}
