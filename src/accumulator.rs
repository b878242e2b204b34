//! Commitment Accumulator
//!
//! Builds the one-time-use chain commitment → allocation → nullifier.
//!
//! ```text
//! hash_allocation(seq, amount) = keccak(seq_u8 ‖ amount_be256)
//!
//! commitment = keccak(
//!     deposit_id_be256 ‖ chain_id_be32 ‖ keccak(token_key) ‖
//!     owner_chain_id_be32 ‖ owner_address_be256 ‖
//!     hash_allocation(a) for a in allocations sorted by seq
//! )
//!
//! nullifier(C, seq, amount) = keccak(C ‖ seq_u8 ‖ amount_be256)
//! ```
//!
//! Byte widths and field order must match the on-chain verifier exactly;
//! any drift yields a different commitment without an error.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::types::primitives::{Bytes32, UniversalAddress};
use crate::types::units::TokenAmount;

/// Commitment over a checkbook's deposit and allocations
pub type Commitment = Bytes32;

/// Spend marker of a single allocation
pub type Nullifier = Bytes32;

/// Accumulator errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccumulatorError {
    #[error("commitment requires at least one allocation")]
    NoAllocations,

    #[error("duplicate allocation sequence number: {0}")]
    DuplicateSeq(u8),
}

/// Deposit fields bound into a commitment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositMetadata {
    pub deposit_id: u64,
    pub chain_id: u32,
    pub token_key: String,
    pub owner: UniversalAddress,
}

/// One allocation as seen by the accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLeaf {
    pub seq: u8,
    pub amount: TokenAmount,
}

impl AllocationLeaf {
    pub fn new(seq: u8, amount: TokenAmount) -> Self {
        Self { seq, amount }
    }
}

fn keccak(data: &[u8]) -> Bytes32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Bytes32(hasher.finalize().into())
}

fn u64_be256(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&value.to_be_bytes());
    out
}

/// `keccak(seq ‖ amount_be256)`
pub fn hash_allocation(seq: u8, amount: TokenAmount) -> Bytes32 {
    let mut hasher = Keccak256::new();
    hasher.update([seq]);
    hasher.update(amount.to_be256());
    Bytes32(hasher.finalize().into())
}

/// Compute the commitment; allocation order in the input does not matter.
pub fn commitment(
    deposit: &DepositMetadata,
    allocations: &[AllocationLeaf],
) -> Result<Commitment, AccumulatorError> {
    if allocations.is_empty() {
        return Err(AccumulatorError::NoAllocations);
    }

    let mut sorted = allocations.to_vec();
    sorted.sort_by_key(|a| a.seq);
    for pair in sorted.windows(2) {
        if pair[0].seq == pair[1].seq {
            return Err(AccumulatorError::DuplicateSeq(pair[0].seq));
        }
    }

    let mut hasher = Keccak256::new();
    hasher.update(u64_be256(deposit.deposit_id));
    hasher.update(deposit.chain_id.to_be_bytes());
    hasher.update(keccak(deposit.token_key.as_bytes()).0);
    hasher.update(deposit.owner.chain_id.to_be_bytes());
    hasher.update(deposit.owner.data.0);
    for leaf in &sorted {
        hasher.update(hash_allocation(leaf.seq, leaf.amount).0);
    }

    Ok(Bytes32(hasher.finalize().into()))
}

/// `keccak(C ‖ seq ‖ amount_be256)`
pub fn nullifier(commitment: &Commitment, seq: u8, amount: TokenAmount) -> Nullifier {
    let mut hasher = Keccak256::new();
    hasher.update(commitment.0);
    hasher.update([seq]);
    hasher.update(amount.to_be256());
    Bytes32(hasher.finalize().into())
}

/// Nullifiers for a set of allocations, in ascending seq order
pub fn nullifiers(commitment: &Commitment, allocations: &[AllocationLeaf]) -> Vec<(u8, Nullifier)> {
    let mut sorted = allocations.to_vec();
    sorted.sort_by_key(|a| a.seq);
    sorted
        .iter()
        .map(|leaf| (leaf.seq, nullifier(commitment, leaf.seq, leaf.amount)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bsc_owner() -> UniversalAddress {
        UniversalAddress::parse(714, "0x6f3995e2e40ca58adcbd47a2edad192e43d98638").unwrap()
    }

    fn usdt_deposit(deposit_id: u64) -> DepositMetadata {
        DepositMetadata {
            deposit_id,
            chain_id: 714,
            token_key: "USDT".to_string(),
            owner: bsc_owner(),
        }
    }

    #[test]
    fn test_nullifier_vector() {
        let c = Bytes32::from_hex(
            "0xa8c67f5fd8466da0f75415c42ad9fa15bb2daf0d4a9923da4042954f979ed366",
        )
        .unwrap();
        let n = nullifier(&c, 1, TokenAmount(339_300_000_000_000_000));
        assert_eq!(
            n.to_hex(),
            "0x4b8c0d497db9f6b0b9cedbcd7499c49c46bcfe49b4469aa34e90b24df230753e"
        );
    }

    #[test]
    fn test_hash_allocation_vector() {
        let h = hash_allocation(1, TokenAmount(339_300_000_000_000_000));
        assert_eq!(
            h.to_hex(),
            "0x13a065a015abdd2aa82e6b7ea0e6d28a5898064420d517cd3dbbeaa09222668e"
        );
    }

    #[test]
    fn test_two_allocation_commitment_vector() {
        let leaves = [
            AllocationLeaf::new(0, TokenAmount(30_435_041_032_216_557_361)),
            AllocationLeaf::new(1, TokenAmount(39_354_092_267_981_923_175)),
        ];
        let c = commitment(&usdt_deposit(18_323_600), &leaves).unwrap();
        assert_eq!(
            c.to_hex(),
            "0xede6549b3705ace19d71231073c304e4144f78688d403c8679370047cdd93609"
        );

        let ns = nullifiers(&c, &leaves);
        assert_eq!(
            ns[0].1.to_hex(),
            "0x9788b1857e09a05fd6dfa51d77cdcf4e781632d1d8ea081c580b98ee2b73e805"
        );
        assert_eq!(
            ns[1].1.to_hex(),
            "0x4c4603accccb37030812b7cafdd3cca2c146cf7e764f05d3b35e71a0654d9ea4"
        );
    }

    #[test]
    fn test_three_allocation_commitment_vector() {
        let leaves = [
            AllocationLeaf::new(0, TokenAmount(187_500_000_000_000_000)),
            AllocationLeaf::new(1, TokenAmount(1_044_400_000_000_000_000)),
            AllocationLeaf::new(2, TokenAmount(728_100_000_000_000_000)),
        ];
        let c = commitment(&usdt_deposit(0x117981c), &leaves).unwrap();
        assert_eq!(
            c.to_hex(),
            "0xafdbc96635f3aabf06c62b21b4fe1c5cf0337a78275108456cc8d95d505a9d71"
        );
        assert_eq!(
            nullifier(&c, 2, leaves[2].amount).to_hex(),
            "0x572fd31d0b721b502872abc5c60634e6843e85377cdd169d51cb5af87ce82c09"
        );
    }

    #[test]
    fn test_commitment_ignores_input_order() {
        let mut leaves = vec![
            AllocationLeaf::new(2, TokenAmount(728_100_000_000_000_000)),
            AllocationLeaf::new(0, TokenAmount(187_500_000_000_000_000)),
            AllocationLeaf::new(1, TokenAmount(1_044_400_000_000_000_000)),
        ];
        let a = commitment(&usdt_deposit(0x117981c), &leaves).unwrap();
        leaves.reverse();
        let b = commitment(&usdt_deposit(0x117981c), &leaves).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_commitment_binds_every_field() {
        let leaves = [AllocationLeaf::new(0, TokenAmount(1))];
        let base = commitment(&usdt_deposit(1), &leaves).unwrap();

        let mut other = usdt_deposit(1);
        other.token_key = "USDC".to_string();
        assert_ne!(commitment(&other, &leaves).unwrap(), base);

        let mut other = usdt_deposit(1);
        other.owner.chain_id = 60;
        assert_ne!(commitment(&other, &leaves).unwrap(), base);

        assert_ne!(commitment(&usdt_deposit(2), &leaves).unwrap(), base);
        assert_ne!(
            commitment(&usdt_deposit(1), &[AllocationLeaf::new(1, TokenAmount(1))]).unwrap(),
            base
        );
    }

    #[test]
    fn test_commitment_rejects_bad_input() {
        assert_eq!(
            commitment(&usdt_deposit(1), &[]),
            Err(AccumulatorError::NoAllocations)
        );
        let dup = [
            AllocationLeaf::new(3, TokenAmount(1)),
            AllocationLeaf::new(3, TokenAmount(2)),
        ];
        assert_eq!(
            commitment(&usdt_deposit(1), &dup),
            Err(AccumulatorError::DuplicateSeq(3))
        );
    }
}
