//! Collaborator interfaces
//!
//! The orchestrator drives four external systems: a proof service, the
//! settlement chain, a bridge aggregator, and the hook (asset purchase)
//! service. Concrete bindings live outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accumulator::{AllocationLeaf, Commitment, DepositMetadata, Nullifier};
use crate::types::primitives::UniversalAddress;
use crate::types::units::TokenAmount;
use crate::types::withdraw::{Intent, ProofArtifact};

// ============================================================================
// Stage 1: proof
// ============================================================================

/// Inputs of the withdraw proof
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRequest {
    pub request_id: String,
    pub checkbook_id: String,
    pub deposit: DepositMetadata,
    pub commitment: Commitment,
    /// Spent allocations, ascending seq
    pub allocations: Vec<AllocationLeaf>,
    /// Nullifiers of `allocations`, same order
    pub nullifiers: Vec<Nullifier>,
    pub onchain_request_id: Nullifier,
    pub amount: TokenAmount,
    pub intent: Intent,
}

#[derive(Debug, Clone, Error)]
pub enum ProofError {
    #[error("proof generation failed: {0}")]
    Failed(String),

    #[error("proof service unavailable: {0}")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProofService: Send + Sync {
    async fn generate_proof(&self, request: &ProofRequest) -> Result<ProofArtifact, ProofError>;
}

// ============================================================================
// Stage 2: execute on chain
// ============================================================================

/// The on-chain withdraw transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteTx {
    pub request_id: String,
    pub chain_id: u32,
    pub onchain_request_id: Nullifier,
    pub commitment: Commitment,
    pub nullifiers: Vec<Nullifier>,
    pub proof: ProofArtifact,
    pub amount: TokenAmount,
    pub token_key: String,
    pub beneficiary: UniversalAddress,
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// Network trouble, nonce races; the submission may be retried
    #[error("transient chain error: {0}")]
    Transient(String),

    /// The verifier or contract refused the transaction
    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("chain error: {0}")]
    Other(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

/// Final outcome of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// Included; the nullifiers the contract recorded
    Success { nullifiers: Vec<Nullifier> },
    /// Included but reverted
    Reverted { reason: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Broadcast and return the transaction hash
    async fn submit(&self, tx: &ExecuteTx) -> Result<String, ChainError>;

    /// Wait until the transaction is final
    async fn await_confirmation(&self, tx_hash: &str) -> Result<Confirmation, ChainError>;
}

// ============================================================================
// Stage 3: cross-chain payout
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub request_id: String,
    pub source_chain_id: u32,
    pub target_chain_id: u32,
    pub token_key: String,
    /// Token delivered on the target chain
    pub payout_token: String,
    pub amount: TokenAmount,
    pub beneficiary: UniversalAddress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub provider: String,
    pub amount_out: TokenAmount,
    pub fee: TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    Pending,
    Completed { tx_hash: Option<String> },
    Failed { reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("transient bridge error: {0}")]
    Transient(String),

    /// The bridge accepted and then failed the transfer
    #[error("bridge transfer failed: {0}")]
    Failed(String),

    /// The route is not serviceable
    #[error("bridge rejected route: {0}")]
    Rejected(String),

    #[error("bridge error: {0}")]
    Other(String),
}

impl BridgeError {
    /// Rejected and unclassified errors are permanent
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Transient(_) | BridgeError::Failed(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeAggregator: Send + Sync {
    async fn quote(&self, route: &Route) -> Result<Quote, BridgeError>;

    /// Start the transfer; returns the bridge transfer id
    async fn execute(&self, route: &Route) -> Result<String, BridgeError>;

    async fn status(&self, bridge_tx_id: &str) -> Result<BridgeStatus, BridgeError>;
}

// ============================================================================
// Stage 4: hook
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookOrder {
    pub request_id: String,
    pub asset_id: String,
    pub beneficiary: UniversalAddress,
    pub token_symbol: String,
    pub amount: TokenAmount,
}

#[derive(Debug, Clone, Error)]
pub enum HookError {
    #[error("hook failed: {0}")]
    Failed(String),

    #[error("hook service unavailable: {0}")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HookService: Send + Sync {
    /// Buy the target asset for the beneficiary; returns the tx hash
    async fn purchase(&self, order: &HookOrder) -> Result<String, HookError>;

    /// Send the raw payout to the beneficiary instead
    async fn fallback_transfer(&self, order: &HookOrder) -> Result<String, HookError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ChainError::Transient("nonce".into()).is_transient());
        assert!(!ChainError::Rejected("bad proof".into()).is_transient());
        assert!(!ChainError::Other("?".into()).is_transient());

        assert!(BridgeError::Transient("503".into()).is_retryable());
        assert!(BridgeError::Failed("slippage".into()).is_retryable());
        assert!(!BridgeError::Rejected("no route".into()).is_retryable());
        assert!(!BridgeError::Other("?".into()).is_retryable());
    }
}
