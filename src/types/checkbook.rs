//! Checkbook and Allocation Types
//!
//! A checkbook records one inbound deposit; its allocatable amount is split
//! into allocations (checks) keyed by sequence number:
//! pending → ready_for_commitment → generating_proof → commitment_pending → with_checkbook

use serde::{Deserialize, Serialize};

use crate::accumulator::{AllocationLeaf, Commitment, DepositMetadata, Nullifier};
use crate::types::primitives::UniversalAddress;
use crate::types::units::TokenAmount;

use super::now_secs;

/// Lifecycle of a deposit through the commitment pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckbookStatus {
    /// Deposit seen, not yet recorded on-chain
    Pending,
    /// Deposit recorded, allocations may be proposed
    ReadyForCommitment,
    /// Commitment proof being generated
    GeneratingProof,
    /// Commitment submitted, awaiting confirmation
    CommitmentPending,
    /// Commitment confirmed; allocations are spendable
    WithCheckbook,
    /// Commitment proof failed
    ProofFailed,
    /// Commitment submission failed
    SubmissionFailed,
}

impl Default for CheckbookStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl CheckbookStatus {
    /// Position in the forward pipeline; failure states share the slot of
    /// the step they failed at.
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::ReadyForCommitment => 1,
            Self::GeneratingProof | Self::ProofFailed => 2,
            Self::CommitmentPending | Self::SubmissionFailed => 3,
            Self::WithCheckbook => 4,
        }
    }
}

impl std::fmt::Display for CheckbookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::ReadyForCommitment => "ready_for_commitment",
            Self::GeneratingProof => "generating_proof",
            Self::CommitmentPending => "commitment_pending",
            Self::WithCheckbook => "with_checkbook",
            Self::ProofFailed => "proof_failed",
            Self::SubmissionFailed => "submission_failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CheckbookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready_for_commitment" => Ok(Self::ReadyForCommitment),
            "generating_proof" => Ok(Self::GeneratingProof),
            "commitment_pending" => Ok(Self::CommitmentPending),
            "with_checkbook" => Ok(Self::WithCheckbook),
            "proof_failed" => Ok(Self::ProofFailed),
            "submission_failed" => Ok(Self::SubmissionFailed),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// One inbound deposit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkbook {
    /// Unique checkbook ID
    pub id: String,
    /// On-chain deposit id
    pub deposit_id: u64,
    /// SLIP-44 id of the deposit chain
    pub chain_id: u32,
    /// Token identifier, e.g. "USDT"
    pub token_key: String,
    /// Depositor
    pub owner: UniversalAddress,
    /// Amount received
    pub gross_amount: TokenAmount,
    /// Amount left after fees, split across allocations
    pub allocatable_amount: TokenAmount,
    /// Current status
    pub status: CheckbookStatus,
    /// Commitment over this deposit and its allocations
    pub commitment: Option<Commitment>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Checkbook {
    pub fn new(
        id: String,
        deposit_id: u64,
        chain_id: u32,
        token_key: String,
        owner: UniversalAddress,
        gross_amount: TokenAmount,
        allocatable_amount: TokenAmount,
    ) -> Self {
        let now = now_secs();
        Self {
            id,
            deposit_id,
            chain_id,
            token_key,
            owner,
            gross_amount,
            allocatable_amount,
            status: CheckbookStatus::Pending,
            commitment: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fields the accumulator binds into the commitment
    pub fn deposit_metadata(&self) -> DepositMetadata {
        DepositMetadata {
            deposit_id: self.deposit_id,
            chain_id: self.chain_id,
            token_key: self.token_key.clone(),
            owner: self.owner,
        }
    }

    /// Finalized checkbooks are immutable and their allocations spendable
    pub fn is_finalized(&self) -> bool {
        self.status == CheckbookStatus::WithCheckbook && self.commitment.is_some()
    }

    /// Move forward in the pipeline. Returns false (and leaves the record
    /// untouched) for regressions and for any change once finalized.
    pub fn advance_status(&mut self, next: CheckbookStatus) -> bool {
        if self.status == CheckbookStatus::WithCheckbook || next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        self.touch();
        true
    }

    /// Seal with a commitment and finalize
    pub fn finalize(&mut self, commitment: Commitment) {
        self.commitment = Some(commitment);
        self.status = CheckbookStatus::WithCheckbook;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}

/// Status of a single allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// Spendable
    Idle,
    /// Locked by a withdraw request
    Pending,
    /// Nullifier consumed on-chain; terminal
    Used,
}

impl Default for AllocationStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Pending => write!(f, "pending"),
            Self::Used => write!(f, "used"),
        }
    }
}

impl std::str::FromStr for AllocationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "pending" => Ok(Self::Pending),
            "used" => Ok(Self::Used),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// Allocation key: (checkbook, sequence number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId {
    pub checkbook_id: String,
    pub seq: u8,
}

impl AllocationId {
    pub fn new(checkbook_id: impl Into<String>, seq: u8) -> Self {
        Self {
            checkbook_id: checkbook_id.into(),
            seq,
        }
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.checkbook_id, self.seq)
    }
}

/// A spendable slice of a checkbook (a.k.a. check)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub checkbook_id: String,
    pub seq: u8,
    pub amount: TokenAmount,
    pub status: AllocationStatus,
    /// Stamped once consumed
    pub nullifier: Option<Nullifier>,
    /// Owning withdraw request while pending (kept after consumption)
    pub withdraw_request_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Allocation {
    pub fn new(checkbook_id: impl Into<String>, seq: u8, amount: TokenAmount) -> Self {
        let now = now_secs();
        Self {
            checkbook_id: checkbook_id.into(),
            seq,
            amount,
            status: AllocationStatus::Idle,
            nullifier: None,
            withdraw_request_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> AllocationId {
        AllocationId::new(self.checkbook_id.clone(), self.seq)
    }

    pub fn leaf(&self) -> AllocationLeaf {
        AllocationLeaf::new(self.seq, self.amount)
    }

    pub fn is_idle(&self) -> bool {
        self.status == AllocationStatus::Idle
    }

    pub fn is_used(&self) -> bool {
        self.status == AllocationStatus::Used
    }

    /// idle → pending, owned by `request_id`
    pub fn mark_pending(&mut self, request_id: &str) {
        self.status = AllocationStatus::Pending;
        self.withdraw_request_id = Some(request_id.to_string());
        self.touch();
    }

    /// pending → idle
    pub fn mark_idle(&mut self) {
        self.status = AllocationStatus::Idle;
        self.withdraw_request_id = None;
        self.touch();
    }

    /// pending → used
    pub fn mark_used(&mut self, nullifier: Nullifier) {
        self.status = AllocationStatus::Used;
        self.nullifier = Some(nullifier);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::primitives::Bytes32;

    fn checkbook() -> Checkbook {
        Checkbook::new(
            "cb_1".to_string(),
            18_323_600,
            714,
            "USDT".to_string(),
            UniversalAddress::new(714, Bytes32([7u8; 32])),
            TokenAmount(100),
            TokenAmount(99),
        )
    }

    #[test]
    fn test_checkbook_status_is_monotonic() {
        let mut cb = checkbook();
        assert!(cb.advance_status(CheckbookStatus::ReadyForCommitment));
        assert!(!cb.advance_status(CheckbookStatus::Pending));
        assert!(cb.advance_status(CheckbookStatus::CommitmentPending));
        cb.finalize(Bytes32([1u8; 32]));
        assert!(cb.is_finalized());
        assert!(!cb.advance_status(CheckbookStatus::SubmissionFailed));
        assert_eq!(cb.status, CheckbookStatus::WithCheckbook);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            CheckbookStatus::Pending,
            CheckbookStatus::ReadyForCommitment,
            CheckbookStatus::WithCheckbook,
            CheckbookStatus::SubmissionFailed,
        ] {
            assert_eq!(status.to_string().parse::<CheckbookStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<AllocationStatus>().is_err());
    }

    #[test]
    fn test_allocation_lifecycle() {
        let mut a = Allocation::new("cb_1", 0, TokenAmount(5));
        assert!(a.is_idle());
        a.mark_pending("wr_1");
        assert_eq!(a.withdraw_request_id.as_deref(), Some("wr_1"));
        a.mark_used(Bytes32([9u8; 32]));
        assert!(a.is_used());
        assert_eq!(a.id().to_string(), "cb_1#0");
    }
}
