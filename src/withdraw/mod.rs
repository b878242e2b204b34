//! Withdraw Orchestration
//!
//! Drives a withdraw request through four stages:
//!
//! ```text
//! submit ─► [1 proof] ─► [2 execute] ─► confirm ─► [3 payout] ─► poll ─► [4 hook]
//!              │              │             │            │                  │
//!           ProofService  ChainClient   ChainClient  BridgeAggregator   HookService
//! ```
//!
//! Each stage owns one sub-status of the request; the main status is
//! derived from the four sub-statuses (`state`). Allocations backing the
//! request are locked at submit and consumed atomically with the stage-2
//! confirmation (`ledger`). Stage work is queued as persistent tasks
//! (`scheduler`) and started by `WithdrawService::tick`, which never waits on
//! a stage's external call. Chain events enter through the `ingester` and
//! apply the same transitions idempotently.

pub mod clients;
pub mod hook;
pub mod ingester;
pub mod ledger;
pub mod locks;
pub mod payout;
pub mod proof;
pub mod scheduler;
pub mod service;
pub mod stage;
pub mod state;
pub mod submitter;
pub mod timeout;

// Re-exports for convenience
pub use clients::{
    BridgeAggregator, BridgeError, BridgeStatus, ChainClient, ChainError, Confirmation, ExecuteTx,
    HookError, HookOrder, HookService, ProofError, ProofRequest, ProofService, Quote, Route,
};
pub use hook::HookExecutor;
pub use ingester::{EventIngester, IngestOutcome};
pub use ledger::{AllocationLedger, LedgerError};
pub use locks::RequestLocks;
pub use payout::PayoutCoordinator;
pub use proof::ProofCoordinator;
pub use scheduler::RetryScheduler;
pub use service::{Collaborators, ServiceError, StageWorkers, TickResult, WithdrawService};
pub use stage::{StageContext, StageError, StartOutcome};
pub use state::{derive_main_status, ErrorClass, SubStatuses};
pub use submitter::ChainSubmitter;
pub use timeout::{SweepResult, TimeoutSweeper};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::common::config::OrchestratorConfig;
    use crate::storage::test_support::{fixture_checkbook, fixture_request, owner};
    use crate::storage::{MemoryWithdrawStore, WithdrawStore};
    use crate::types::withdraw::{HookStatus, Intent, ProofArtifact, WithdrawRequest};
    use crate::withdraw::ledger::allocation_ids;
    use crate::withdraw::stage::StageContext;

    pub fn artifact() -> ProofArtifact {
        ProofArtifact {
            proof: "0x5eed".to_string(),
            public_values: "0xfeed".to_string(),
        }
    }

    pub fn asset_intent() -> Intent {
        Intent::AssetToken {
            asset_id: "aave-v3-usdt".to_string(),
            beneficiary: owner(),
            asset_token_symbol: "aUSDT".to_string(),
        }
    }

    /// Memory-backed context with checkbook `cb_1` (two allocations) and one
    /// request over both, optionally with an asset intent
    pub async fn seeded_context(asset: bool) -> (StageContext, WithdrawRequest) {
        let store: Arc<dyn WithdrawStore> = Arc::new(MemoryWithdrawStore::new());
        let (cb, allocations) = fixture_checkbook("cb_1", 2);
        store.insert_checkbook(&cb, &allocations).await.unwrap();

        let mut request = fixture_request("cb_1", vec![0, 1]);
        if asset {
            request.intent = asset_intent();
            request.hook_status = HookStatus::Pending;
        }
        store
            .insert_request(&request, &allocation_ids(&request))
            .await
            .unwrap();

        (StageContext::new(store, OrchestratorConfig::default()), request)
    }

    /// Write through the store, keeping the caller's copy's version current
    pub async fn save(ctx: &StageContext, request: &mut WithdrawRequest) {
        ctx.store.update_request(request).await.unwrap();
    }
}
