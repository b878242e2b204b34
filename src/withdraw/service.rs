//! Withdraw Service
//!
//! Caller-facing API of the orchestration core plus the scheduler loop that
//! drives queued stage work.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::accumulator::{self, AccumulatorError};
use crate::common::config::OrchestratorConfig;
use crate::common::logging::{log_ledger_event, log_status_transition};
use crate::storage::{StorageError, WithdrawStore};
use crate::types::checkbook::{Allocation, AllocationId, Checkbook};
use crate::types::events::ChainEvent;
use crate::types::now_secs;
use crate::types::primitives::UniversalAddress;
use crate::types::task::{RetryTask, Stage};
use crate::types::units::TokenAmount;
use crate::types::withdraw::{HookStatus, Intent, PayoutStatus, WithdrawRequest, WithdrawStats};
use crate::withdraw::clients::{BridgeAggregator, ChainClient, HookService, ProofService};
use crate::withdraw::hook::HookExecutor;
use crate::withdraw::ingester::{EventIngester, IngestOutcome};
use crate::withdraw::ledger::{allocation_ids, derive_nullifiers, LedgerError};
use crate::withdraw::payout::PayoutCoordinator;
use crate::withdraw::proof::ProofCoordinator;
use crate::withdraw::stage::{StageContext, StageError, StartOutcome};
use crate::withdraw::submitter::ChainSubmitter;
use crate::withdraw::timeout::TimeoutSweeper;

/// External systems the stages call into
#[derive(Clone)]
pub struct Collaborators {
    pub prover: Arc<dyn ProofService>,
    pub chain: Arc<dyn ChainClient>,
    pub bridge: Arc<dyn BridgeAggregator>,
    pub hooks: Arc<dyn HookService>,
}

/// One coordinator per stage, shareable across spawned tasks
#[derive(Clone)]
pub struct StageWorkers {
    proof: Arc<ProofCoordinator>,
    submitter: Arc<ChainSubmitter>,
    payout: Arc<PayoutCoordinator>,
    hook: Arc<HookExecutor>,
}

impl StageWorkers {
    pub fn new(ctx: &StageContext, collaborators: Collaborators) -> Self {
        Self {
            proof: Arc::new(ProofCoordinator::new(ctx.clone(), collaborators.prover)),
            submitter: Arc::new(ChainSubmitter::new(ctx.clone(), collaborators.chain)),
            payout: Arc::new(PayoutCoordinator::new(ctx.clone(), collaborators.bridge)),
            hook: Arc::new(HookExecutor::new(ctx.clone(), collaborators.hooks)),
        }
    }

    /// Run the stage a task names
    pub async fn dispatch(&self, task: &RetryTask) -> Result<StartOutcome, StageError> {
        let id = task.request_id.as_str();
        match task.stage {
            Stage::Proof => self.proof.process(id).await,
            Stage::Execute => self.submitter.process(id).await,
            Stage::Confirm => self.submitter.confirm(id).await,
            Stage::Payout => self.payout.process(id).await,
            Stage::PayoutPoll => self.payout.poll(id).await,
            Stage::Hook => self.hook.process(id).await,
        }
    }
}

/// Result of a scheduler tick.
///
/// `tasks_claimed` counts tasks started by this tick; the accepted, skipped
/// and failed counters cover tasks that finished since the previous report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickResult {
    pub tasks_claimed: usize,
    pub tasks_accepted: usize,
    pub tasks_skipped: usize,
    pub tasks_failed: usize,
    /// Still running when the tick returned
    pub tasks_in_flight: usize,
    pub proofs_timed_out: usize,
    pub confirmations_requeued: usize,
    pub tasks_restored: usize,
}

impl TickResult {
    pub fn has_activity(&self) -> bool {
        self.tasks_claimed > 0
            || self.tasks_finished() > 0
            || self.proofs_timed_out > 0
            || self.confirmations_requeued > 0
            || self.tasks_restored > 0
    }

    pub fn tasks_finished(&self) -> usize {
        self.tasks_accepted + self.tasks_skipped + self.tasks_failed
    }
}

impl std::fmt::Display for TickResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tasks: {} claimed, {} in flight | finished: {} run, {} skipped, {} failed | timeouts: {} proofs, {} confirmations | restored: {}",
            self.tasks_claimed,
            self.tasks_in_flight,
            self.tasks_accepted,
            self.tasks_skipped,
            self.tasks_failed,
            self.proofs_timed_out,
            self.confirmations_requeued,
            self.tasks_restored
        )
    }
}

/// A dispatched task and its spawned run
struct InFlight {
    task: RetryTask,
    handle: JoinHandle<Result<StartOutcome, StageError>>,
}

impl InFlight {
    fn runs(&self, task: &RetryTask) -> bool {
        self.task.stage == task.stage && self.task.request_id == task.request_id
    }
}

/// Service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request {id} cannot be retried in status {status}")]
    RetryNotAllowed { id: String, status: String },

    #[error("request {id} cannot be cancelled: {reason}")]
    CancelNotAllowed { id: String, reason: String },

    #[error("hook action not allowed on {id}: {reason}")]
    HookActionNotAllowed { id: String, reason: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),
}

/// Withdraw orchestration service
pub struct WithdrawService {
    ctx: StageContext,
    workers: StageWorkers,
    ingester: EventIngester,
    sweeper: TimeoutSweeper,
    in_flight: Mutex<Vec<InFlight>>,
    running: Arc<RwLock<bool>>,
}

impl WithdrawService {
    pub fn new(
        store: Arc<dyn WithdrawStore>,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Self {
        let ctx = StageContext::new(store, config);
        Self {
            workers: StageWorkers::new(&ctx, collaborators),
            ingester: EventIngester::new(ctx.clone()),
            sweeper: TimeoutSweeper::new(ctx.clone()),
            in_flight: Mutex::new(Vec::new()),
            running: Arc::new(RwLock::new(false)),
            ctx,
        }
    }

    pub fn store(&self) -> Arc<dyn WithdrawStore> {
        self.ctx.store.clone()
    }

    // ------------------------------------------------------------------
    // Checkbooks
    // ------------------------------------------------------------------

    /// Record a deposit whose commitment is confirmed, split into
    /// allocations with seq 0, 1, ...
    pub async fn register_checkbook(
        &self,
        deposit_id: u64,
        chain_id: u32,
        token_key: &str,
        owner: UniversalAddress,
        gross_amount: TokenAmount,
        amounts: &[TokenAmount],
    ) -> Result<Checkbook, ServiceError> {
        if amounts.is_empty() || amounts.len() > usize::from(u8::MAX) + 1 {
            return Err(ServiceError::InvalidRequest(format!(
                "a checkbook holds 1 to 256 allocations, got {}",
                amounts.len()
            )));
        }
        if amounts.iter().any(|a| a.is_zero()) {
            return Err(ServiceError::InvalidRequest("zero allocation amount".to_string()));
        }
        let allocatable = TokenAmount::sum(amounts.iter().copied())
            .filter(|total| *total <= gross_amount)
            .ok_or_else(|| ServiceError::InvalidRequest("allocations exceed the deposit".to_string()))?;

        let id = format!("cb_{}", uuid::Uuid::new_v4().simple());
        let mut checkbook = Checkbook::new(
            id.clone(),
            deposit_id,
            chain_id,
            token_key.to_string(),
            owner,
            gross_amount,
            allocatable,
        );
        let allocations: Vec<Allocation> = amounts
            .iter()
            .enumerate()
            .map(|(seq, amount)| Allocation::new(id.clone(), seq as u8, *amount))
            .collect();

        let leaves: Vec<_> = allocations.iter().map(|a| a.leaf()).collect();
        let commitment = accumulator::commitment(&checkbook.deposit_metadata(), &leaves)?;
        checkbook.finalize(commitment);

        self.ctx.store.insert_checkbook(&checkbook, &allocations).await?;
        tracing::info!(
            checkbook_id = %checkbook.id,
            deposit_id,
            allocations = allocations.len(),
            commitment = %commitment,
            "checkbook registered"
        );
        Ok(checkbook)
    }

    pub async fn get_checkbook(&self, id: &str) -> Result<Checkbook, ServiceError> {
        self.ctx
            .store
            .get_checkbook(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    pub async fn allocations(&self, checkbook_id: &str) -> Result<Vec<Allocation>, ServiceError> {
        Ok(self.ctx.store.get_allocations_by_checkbook(checkbook_id).await?)
    }

    // ------------------------------------------------------------------
    // Withdraw requests
    // ------------------------------------------------------------------

    /// Lock the allocations and create a withdraw request; returns its id
    pub async fn submit(
        &self,
        checkbook_id: &str,
        allocation_ids: &[AllocationId],
        intent: Intent,
    ) -> Result<String, ServiceError> {
        validate_intent(&intent)?;

        let (checkbook, allocations) = self
            .ctx
            .ledger
            .validate_for_withdraw(checkbook_id, allocation_ids)
            .await?;
        let commitment = checkbook
            .commitment
            .ok_or_else(|| LedgerError::NotFinalized(checkbook_id.to_string()))?;

        let amount = TokenAmount::sum(allocations.iter().map(|a| a.amount))
            .ok_or_else(|| ServiceError::InvalidRequest("amount overflow".to_string()))?;
        let onchain_request_id = derive_nullifiers(&commitment, &allocations)
            .first()
            .map(|(_, n)| *n)
            .ok_or_else(|| LedgerError::InvalidSet("no allocations".to_string()))?;

        let request = WithdrawRequest::new(
            checkbook.id.clone(),
            allocations.iter().map(|a| a.seq).collect(),
            checkbook.owner,
            checkbook.token_key.clone(),
            amount,
            intent,
            onchain_request_id,
        );
        let ids = self::allocation_ids(&request);

        if let Err(e) = self.ctx.store.insert_request(&request, &ids).await {
            let err = LedgerError::from(e);
            log_ledger_event("allocations_lock_failed", Some(&request.id), &ids, Some(&err.to_string()));
            return Err(err.into());
        }
        log_ledger_event("allocations_locked", Some(&request.id), &ids, None);

        self.ctx.scheduler.enqueue(&request.id, Stage::Proof).await?;
        self.ctx.record(|s| s.submitted += 1).await;

        tracing::info!(
            request_id = %request.id,
            checkbook_id = %checkbook.id,
            amount = %request.amount,
            onchain_request_id = %request.onchain_request_id,
            "withdraw request submitted"
        );
        Ok(request.id)
    }

    pub async fn get(&self, id: &str) -> Result<WithdrawRequest, ServiceError> {
        self.ctx
            .store
            .get_request(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// Re-queue the failed stage: proof, submission, or a payout with budget
    /// left. Returns the stage queued.
    pub async fn retry(&self, id: &str) -> Result<Stage, ServiceError> {
        let _guard = self.ctx.locks.acquire(id).await;
        let mut request = self.get(id).await?;

        let stage = if request.can_retry_proof() {
            Stage::Proof
        } else if !request.is_closed() && request.can_retry_execute() {
            Stage::Execute
        } else if request.can_retry_payout(self.ctx.config.payout_max_retries) {
            let before = request.status;
            let reason = request
                .payout_error
                .clone()
                .unwrap_or_else(|| "manual retry".to_string());
            request.mark_payout_retry_scheduled(reason);
            self.ctx.persist(&mut request, before).await?;
            Stage::Payout
        } else {
            return Err(ServiceError::RetryNotAllowed {
                id: id.to_string(),
                status: request.status.to_string(),
            });
        };

        self.ctx.scheduler.enqueue(id, stage).await?;
        tracing::info!(request_id = %id, stage = %stage, "retry requested");
        Ok(stage)
    }

    /// Cancel a request that has not reached the chain and release its
    /// allocations
    pub async fn cancel(&self, id: &str) -> Result<(), ServiceError> {
        let _guard = self.ctx.locks.acquire(id).await;
        let mut request = self.get(id).await?;

        if !request.can_cancel() {
            return Err(ServiceError::CancelNotAllowed {
                id: id.to_string(),
                reason: format!("status {}, execute {}", request.status, request.execute_status),
            });
        }

        let allocations = self.ctx.store.get_allocations(&allocation_ids(&request)).await?;
        if allocations.iter().any(|a| a.is_used()) {
            return Err(ServiceError::CancelNotAllowed {
                id: id.to_string(),
                reason: "allocations already consumed".to_string(),
            });
        }

        let before = request.status;
        request.mark_cancelled();
        self.ctx.ledger.commit_cancellation(&mut request).await?;
        log_status_transition(&request, before);

        self.ctx.scheduler.cancel_all(id).await?;
        self.ctx.record(|s| s.cancelled += 1).await;
        Ok(())
    }

    /// Try the hook purchase again after a failure without fallback
    pub async fn request_hook_purchase(&self, id: &str) -> Result<(), ServiceError> {
        let _guard = self.ctx.locks.acquire(id).await;
        let mut request = self.get(id).await?;

        if !request.can_retry_hook() {
            return Err(ServiceError::HookActionNotAllowed {
                id: id.to_string(),
                reason: format!("hook is {}", request.hook_status),
            });
        }

        let before = request.status;
        request.mark_hook_retry_requested();
        self.ctx.persist(&mut request, before).await?;
        self.ctx.scheduler.enqueue(id, Stage::Hook).await?;
        Ok(())
    }

    /// Give up on the hook; the beneficiary keeps the raw payout
    pub async fn withdraw_original_tokens(&self, id: &str) -> Result<(), ServiceError> {
        let _guard = self.ctx.locks.acquire(id).await;
        let mut request = self.get(id).await?;

        let allowed = !request.is_closed()
            && request.payout_status == PayoutStatus::Completed
            && request.hook_status == HookStatus::Failed
            && !request.fallback_transferred;
        if !allowed {
            return Err(ServiceError::HookActionNotAllowed {
                id: id.to_string(),
                reason: format!("hook is {}", request.hook_status),
            });
        }

        let before = request.status;
        request.mark_hook_abandoned();
        self.ctx.persist(&mut request, before).await?;
        self.ctx.scheduler.complete(id, Stage::Hook).await?;
        Ok(())
    }

    /// Operator override; freezes the request
    pub async fn mark_manually_resolved(&self, id: &str, note: &str) -> Result<(), ServiceError> {
        let _guard = self.ctx.locks.acquire(id).await;
        let mut request = self.get(id).await?;

        if request.is_closed() {
            return Err(ServiceError::InvalidRequest(format!(
                "request {} is already {}",
                id, request.status
            )));
        }

        let before = request.status;
        request.mark_manually_resolved(note.to_string());
        self.ctx.persist(&mut request, before).await?;
        self.ctx.scheduler.cancel_all(id).await?;
        Ok(())
    }

    /// Apply a chain event delivered by the event bus
    pub async fn ingest(&self, event: &ChainEvent) -> Result<IngestOutcome, ServiceError> {
        Ok(self.ingester.ingest(event).await?)
    }

    pub async fn status_counts(&self) -> Result<HashMap<String, u64>, ServiceError> {
        Ok(self.ctx.store.count_by_status().await?)
    }

    // ------------------------------------------------------------------
    // Scheduler loop
    // ------------------------------------------------------------------

    /// Sweep timeouts, collect finished stage runs and start every due
    /// task. Never waits for a stage's external call; a task still running
    /// from an earlier tick is not started twice.
    pub async fn tick(&self) -> Result<TickResult, ServiceError> {
        let now = now_secs();
        let mut result = TickResult::default();

        let sweep = self.sweeper.sweep(now).await?;
        result.proofs_timed_out = sweep.proofs_timed_out;
        result.confirmations_requeued = sweep.confirmations_requeued;
        result.tasks_restored = sweep.tasks_restored;

        let mut in_flight = self.in_flight.lock().await;
        let (finished, running): (Vec<_>, Vec<_>) =
            in_flight.drain(..).partition(|run| run.handle.is_finished());
        *in_flight = running;
        for run in finished {
            self.settle_run(run, &mut result).await;
        }

        let tasks = self
            .ctx
            .scheduler
            .claim(now, self.ctx.config.max_tasks_per_tick)
            .await?;
        for task in tasks {
            if in_flight.iter().any(|run| run.runs(&task)) {
                // requeued while its previous run is out; due again next tick
                self.ctx.scheduler.release(&task).await?;
                continue;
            }
            let workers = self.workers.clone();
            let spawned = task.clone();
            let handle = tokio::spawn(async move { workers.dispatch(&spawned).await });
            in_flight.push(InFlight { task, handle });
            result.tasks_claimed += 1;
        }
        result.tasks_in_flight = in_flight.len();
        drop(in_flight);

        self.ctx.locks.prune().await;
        Ok(result)
    }

    /// Wait for every running stage task and report how they finished
    pub async fn settle(&self) -> Result<TickResult, ServiceError> {
        let runs: Vec<InFlight> = self.in_flight.lock().await.drain(..).collect();
        let mut result = TickResult::default();
        for run in runs {
            self.settle_run(run, &mut result).await;
        }
        Ok(result)
    }

    async fn settle_run(&self, run: InFlight, result: &mut TickResult) {
        let task = run.task;
        match run.handle.await {
            Ok(Ok(StartOutcome::Accepted)) => result.tasks_accepted += 1,
            Ok(Ok(StartOutcome::Rejected(_))) => result.tasks_skipped += 1,
            Ok(Err(StageError::NotFound(id))) => {
                tracing::warn!(request_id = %id, stage = %task.stage, "task for unknown request dropped");
                if let Err(e) = self.ctx.scheduler.complete(&task.request_id, task.stage).await {
                    tracing::error!(request_id = %id, stage = %task.stage, error = %e, "dropping task failed");
                }
                result.tasks_skipped += 1;
            }
            Ok(Err(e)) => {
                // left leased; runs again once the lease expires
                tracing::error!(
                    request_id = %task.request_id,
                    stage = %task.stage,
                    retryable = e.is_retryable(),
                    error = %e,
                    "stage task failed"
                );
                result.tasks_failed += 1;
            }
            Err(e) => {
                tracing::error!(request_id = %task.request_id, stage = %task.stage, error = %e, "stage task panicked");
                result.tasks_failed += 1;
            }
        }
    }

    /// Run the scheduler loop until `stop` is called
    pub async fn run(&self) -> Result<(), ServiceError> {
        {
            let mut running = self.running.write().await;
            *running = true;
        }

        tracing::info!(
            tick_interval_secs = self.ctx.config.tick_interval_secs,
            max_tasks_per_tick = self.ctx.config.max_tasks_per_tick,
            "withdraw orchestrator started"
        );

        loop {
            {
                let running = self.running.read().await;
                if !*running {
                    break;
                }
            }

            match self.tick().await {
                Ok(result) => {
                    if result.has_activity() {
                        tracing::info!("[tick] {}", result);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "tick failed");
                }
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(
                self.ctx.config.tick_interval_secs,
            ))
            .await;
        }

        match self.settle().await {
            Ok(result) if result.has_activity() => tracing::info!("[drain] {}", result),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "draining stage tasks failed"),
        }
        tracing::info!("withdraw orchestrator stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    pub async fn stats(&self) -> WithdrawStats {
        self.ctx.stats.read().await.clone()
    }
}

fn validate_intent(intent: &Intent) -> Result<(), ServiceError> {
    let missing = match intent {
        Intent::RawToken { token_symbol, .. } if token_symbol.is_empty() => Some("token symbol"),
        Intent::AssetToken { asset_id, .. } if asset_id.is_empty() => Some("asset id"),
        Intent::AssetToken {
            asset_token_symbol, ..
        } if asset_token_symbol.is_empty() => Some("asset token symbol"),
        _ => None,
    };
    match missing {
        Some(what) => Err(ServiceError::InvalidRequest(format!("intent is missing its {}", what))),
        None => Ok(()),
    }
}
