//! In-process Demo
//!
//! Simulated collaborators that always succeed, and a walk-through of one
//! withdraw request from submit to completion on the in-memory store.

use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::accumulator::Nullifier;
use crate::common::config::OrchestratorConfig;
use crate::storage::MemoryWithdrawStore;
use crate::types::checkbook::AllocationId;
use crate::types::primitives::UniversalAddress;
use crate::types::units::{format_units, TokenAmount, DEFAULT_DECIMALS};
use crate::types::withdraw::{Intent, ProofArtifact};
use crate::withdraw::clients::{
    BridgeAggregator, BridgeError, BridgeStatus, ChainClient, ChainError, Confirmation, ExecuteTx,
    HookError, HookOrder, HookService, ProofError, ProofRequest, ProofService, Quote, Route,
};
use crate::withdraw::service::{Collaborators, ServiceError, WithdrawService};

fn digest_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// Proves anything instantly
pub struct SimulatedProver;

#[async_trait]
impl ProofService for SimulatedProver {
    async fn generate_proof(&self, request: &ProofRequest) -> Result<ProofArtifact, ProofError> {
        let nullifiers: Vec<&[u8]> = request.nullifiers.iter().map(|n| &n.0[..]).collect();
        Ok(ProofArtifact {
            proof: digest_hex(&nullifiers),
            public_values: request.onchain_request_id.to_hex(),
        })
    }
}

/// Confirms every submitted transaction with the nullifiers it carried
#[derive(Default)]
pub struct SimulatedChain {
    submitted: Mutex<HashMap<String, Vec<Nullifier>>>,
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn submit(&self, tx: &ExecuteTx) -> Result<String, ChainError> {
        let hash = digest_hex(&[tx.request_id.as_bytes(), &tx.onchain_request_id.0[..]]);
        self.submitted
            .lock()
            .await
            .insert(hash.clone(), tx.nullifiers.clone());
        Ok(hash)
    }

    async fn await_confirmation(&self, tx_hash: &str) -> Result<Confirmation, ChainError> {
        match self.submitted.lock().await.get(tx_hash) {
            Some(nullifiers) => Ok(Confirmation::Success {
                nullifiers: nullifiers.clone(),
            }),
            None => Err(ChainError::Other(format!("unknown transaction {}", tx_hash))),
        }
    }
}

/// Fee-free bridge that settles immediately
pub struct SimulatedBridge;

#[async_trait]
impl BridgeAggregator for SimulatedBridge {
    async fn quote(&self, route: &Route) -> Result<Quote, BridgeError> {
        Ok(Quote {
            provider: "simulated".to_string(),
            amount_out: route.amount,
            fee: TokenAmount::ZERO,
        })
    }

    async fn execute(&self, route: &Route) -> Result<String, BridgeError> {
        Ok(format!("bridge-{}", route.request_id))
    }

    async fn status(&self, bridge_tx_id: &str) -> Result<BridgeStatus, BridgeError> {
        Ok(BridgeStatus::Completed {
            tx_hash: Some(digest_hex(&[bridge_tx_id.as_bytes()])),
        })
    }
}

pub struct SimulatedHooks;

#[async_trait]
impl HookService for SimulatedHooks {
    async fn purchase(&self, order: &HookOrder) -> Result<String, HookError> {
        Ok(digest_hex(&[&b"purchase"[..], order.request_id.as_bytes()]))
    }

    async fn fallback_transfer(&self, order: &HookOrder) -> Result<String, HookError> {
        Ok(digest_hex(&[&b"fallback"[..], order.request_id.as_bytes()]))
    }
}

pub fn simulated_collaborators() -> Collaborators {
    Collaborators {
        prover: Arc::new(SimulatedProver),
        chain: Arc::new(SimulatedChain::default()),
        bridge: Arc::new(SimulatedBridge),
        hooks: Arc::new(SimulatedHooks),
    }
}

/// Walk one asset-intent withdraw through all four stages
pub async fn run_demo() -> Result<(), ServiceError> {
    println!("\n=== zkpay Withdraw Demo ===\n");

    // no waiting between bridge polls
    let config = OrchestratorConfig {
        payout_poll_secs: 0,
        ..OrchestratorConfig::default()
    };
    let service = WithdrawService::new(
        Arc::new(MemoryWithdrawStore::new()),
        simulated_collaborators(),
        config,
    );

    let owner = UniversalAddress::parse(714, "0x6f3995e2e40ca58adcbd47a2edad192e43d98638")
        .map_err(ServiceError::InvalidRequest)?;
    let amounts = [
        TokenAmount(30_435_041_032_216_557_361),
        TokenAmount(39_354_092_267_981_923_175),
    ];
    let gross = TokenAmount(69_789_133_300_198_480_536);

    let checkbook = service
        .register_checkbook(18_323_600, 714, "USDT", owner, gross, &amounts)
        .await?;
    println!("Checkbook:  {}", checkbook.id);
    println!("Deposit:    {} USDT", format_units(gross, DEFAULT_DECIMALS));
    if let Some(commitment) = checkbook.commitment {
        println!("Commitment: {}", commitment);
    }
    println!();

    let intent = Intent::AssetToken {
        asset_id: "aave-v3-usdt".to_string(),
        beneficiary: UniversalAddress::new(60, owner.data),
        asset_token_symbol: "aUSDT".to_string(),
    };
    let ids = [
        AllocationId::new(checkbook.id.clone(), 0),
        AllocationId::new(checkbook.id.clone(), 1),
    ];
    let id = service.submit(&checkbook.id, &ids, intent).await?;
    let request = service.get(&id).await?;
    println!("Request:    {}", id);
    println!("On-chain:   {}", request.onchain_request_id);
    println!("Amount:     {} USDT", format_units(request.amount, DEFAULT_DECIMALS));
    println!();

    for n in 1..=12 {
        service.tick().await?;
        let result = service.settle().await?;
        let request = service.get(&id).await?;
        println!("[tick {:>2}] {:<20} {}", n, request.status.as_str(), result);
        if request.status.is_terminal() {
            break;
        }
    }
    println!();

    for allocation in service.allocations(&checkbook.id).await? {
        println!("Allocation #{}: {}", allocation.seq, allocation.status);
    }

    match service.cancel(&id).await {
        Ok(()) => println!("Cancel: accepted (unexpected)"),
        Err(e) => println!("Cancel: {}", e),
    }

    println!();
    println!("{}", service.stats().await);
    println!("\n=== Demo Complete ===");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::withdraw::MainStatus;

    #[tokio::test]
    async fn test_simulated_chain_confirms_what_it_saw() {
        let chain = SimulatedChain::default();
        assert!(chain.await_confirmation("0xnope").await.is_err());
    }

    #[tokio::test]
    async fn test_demo_request_completes() {
        let config = OrchestratorConfig {
            payout_poll_secs: 0,
            ..OrchestratorConfig::default()
        };
        let service = WithdrawService::new(
            Arc::new(MemoryWithdrawStore::new()),
            simulated_collaborators(),
            config,
        );
        let owner = crate::storage::test_support::owner();
        let cb = service
            .register_checkbook(7, 714, "USDT", owner, TokenAmount(10), &[TokenAmount(10)])
            .await
            .unwrap();
        let intent = Intent::RawToken {
            beneficiary: owner,
            token_symbol: "USDT".to_string(),
        };
        let id = service
            .submit(&cb.id, &[AllocationId::new(cb.id.clone(), 0)], intent)
            .await
            .unwrap();

        for _ in 0..10 {
            service.tick().await.unwrap();
            service.settle().await.unwrap();
        }
        assert_eq!(service.get(&id).await.unwrap().status, MainStatus::Completed);
    }
}
