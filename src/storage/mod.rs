//! Storage Layer Module
//!
//! Provides persistence for checkbooks, allocations, withdraw requests,
//! processed chain events and scheduler tasks.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for testing

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemoryWithdrawStore;
pub use sqlite::SqliteWithdrawStore;
pub use traits::{StorageError, StorageResult, WithdrawStore};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::accumulator;
    use crate::types::checkbook::{Allocation, Checkbook};
    use crate::types::primitives::{Bytes32, UniversalAddress};
    use crate::types::units::TokenAmount;
    use crate::types::withdraw::{Intent, WithdrawRequest};

    pub fn owner() -> UniversalAddress {
        UniversalAddress::parse(714, "0x6f3995e2e40ca58adcbd47a2edad192e43d98638").unwrap()
    }

    /// Finalized checkbook with `n` allocations of 1000, 2000, ... units
    pub fn fixture_checkbook(id: &str, n: u8) -> (Checkbook, Vec<Allocation>) {
        let allocations: Vec<Allocation> = (0..n)
            .map(|seq| Allocation::new(id, seq, TokenAmount::new((seq as u128 + 1) * 1000)))
            .collect();
        let total = TokenAmount::sum(allocations.iter().map(|a| a.amount)).unwrap();

        let mut checkbook = Checkbook::new(
            id.to_string(),
            18_323_600,
            714,
            "USDT".to_string(),
            owner(),
            total,
            total,
        );
        let leaves: Vec<_> = allocations.iter().map(|a| a.leaf()).collect();
        let commitment = accumulator::commitment(&checkbook.deposit_metadata(), &leaves).unwrap();
        checkbook.finalize(commitment);

        (checkbook, allocations)
    }

    /// Request over the given seqs with a random on-chain id
    pub fn fixture_request(checkbook_id: &str, seqs: Vec<u8>) -> WithdrawRequest {
        let mut onchain = [0u8; 32];
        onchain[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());

        let amount = seqs
            .iter()
            .map(|s| TokenAmount::new((*s as u128 + 1) * 1000))
            .fold(TokenAmount::ZERO, |acc, a| acc.checked_add(a).unwrap());

        WithdrawRequest::new(
            checkbook_id.to_string(),
            seqs,
            owner(),
            "USDT".to_string(),
            amount,
            Intent::RawToken {
                beneficiary: owner(),
                token_symbol: "USDT".to_string(),
            },
            Bytes32(onchain),
        )
    }
}
