//! Withdraw Request Types
//!
//! A withdraw request spends one or more allocations and moves through four
//! independently tracked stages:
//!
//! ```text
//! proof (stage 1) → execute (stage 2, irreversible) → payout (stage 3) → hook (stage 4, optional)
//! ```
//!
//! The main `status` is never written directly; every `mark_*` transition
//! re-derives it from the sub-statuses via [`derive_main_status`].

use serde::{Deserialize, Serialize};

use crate::accumulator::Nullifier;
use crate::types::primitives::UniversalAddress;
use crate::types::units::TokenAmount;
use crate::withdraw::state::{self, derive_main_status, ErrorClass, SubStatuses};

use super::now_secs;

/// Stage 1: zero-knowledge proof generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl Default for ProofStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ProofStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ProofStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// Stage 2: on-chain execution that consumes the nullifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    Pending,
    /// Transaction broadcast, not yet confirmed
    Submitted,
    /// Confirmed; nullifiers consumed
    Success,
    /// Transmission failed; safe to resubmit
    SubmitFailed,
    /// Proof or signature rejected by the chain; never retried
    VerifyFailed,
}

impl Default for ExecuteStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ExecuteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Success => "success",
            Self::SubmitFailed => "submit_failed",
            Self::VerifyFailed => "verify_failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ExecuteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted),
            "success" => Ok(Self::Success),
            "submit_failed" => Ok(Self::SubmitFailed),
            "verify_failed" => Ok(Self::VerifyFailed),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// Stage 3: cross-chain payout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Default for PayoutStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for PayoutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// Stage 4: optional yield-asset purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    NotRequired,
    Pending,
    Processing,
    Completed,
    Failed,
    /// User gave up on the hook and kept the raw payout
    Abandoned,
}

impl Default for HookStatus {
    fn default() -> Self {
        Self::NotRequired
    }
}

impl std::fmt::Display for HookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotRequired => "not_required",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for HookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_required" => Ok(Self::NotRequired),
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// Derived, persisted status of a withdraw request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MainStatus {
    Created,
    Proving,
    ProofGenerated,
    ProofFailed,
    Submitting,
    SubmitFailed,
    WaitingForPayout,
    PayoutProcessing,
    HookProcessing,
    Completed,
    CompletedWithHookFailed,
    FailedPermanent,
    ManuallyResolved,
    Cancelled,
}

impl Default for MainStatus {
    fn default() -> Self {
        Self::Created
    }
}

impl MainStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::CompletedWithHookFailed
                | Self::FailedPermanent
                | Self::ManuallyResolved
                | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Proving => "proving",
            Self::ProofGenerated => "proof_generated",
            Self::ProofFailed => "proof_failed",
            Self::Submitting => "submitting",
            Self::SubmitFailed => "submit_failed",
            Self::WaitingForPayout => "waiting_for_payout",
            Self::PayoutProcessing => "payout_processing",
            Self::HookProcessing => "hook_processing",
            Self::Completed => "completed",
            Self::CompletedWithHookFailed => "completed_with_hook_failed",
            Self::FailedPermanent => "failed_permanent",
            Self::ManuallyResolved => "manually_resolved",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for MainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "proving" => Ok(Self::Proving),
            "proof_generated" => Ok(Self::ProofGenerated),
            "proof_failed" => Ok(Self::ProofFailed),
            "submitting" => Ok(Self::Submitting),
            "submit_failed" => Ok(Self::SubmitFailed),
            "waiting_for_payout" => Ok(Self::WaitingForPayout),
            "payout_processing" => Ok(Self::PayoutProcessing),
            "hook_processing" => Ok(Self::HookProcessing),
            "completed" => Ok(Self::Completed),
            "completed_with_hook_failed" => Ok(Self::CompletedWithHookFailed),
            "failed_permanent" => Ok(Self::FailedPermanent),
            "manually_resolved" => Ok(Self::ManuallyResolved),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// What the beneficiary receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    /// Plain transfer of the withdrawn token
    RawToken {
        beneficiary: UniversalAddress,
        token_symbol: String,
    },
    /// Payout converted into a yield-bearing asset by the hook stage
    AssetToken {
        asset_id: String,
        beneficiary: UniversalAddress,
        asset_token_symbol: String,
    },
}

impl Intent {
    pub fn beneficiary(&self) -> &UniversalAddress {
        match self {
            Intent::RawToken { beneficiary, .. } => beneficiary,
            Intent::AssetToken { beneficiary, .. } => beneficiary,
        }
    }

    pub fn requires_hook(&self) -> bool {
        match self {
            Intent::RawToken { .. } => false,
            Intent::AssetToken { .. } => true,
        }
    }

    /// Token the bridge delivers on the target chain
    pub fn payout_token(&self) -> &str {
        match self {
            Intent::RawToken { token_symbol, .. } => token_symbol,
            Intent::AssetToken {
                asset_token_symbol, ..
            } => asset_token_symbol,
        }
    }
}

/// Output of the proof service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofArtifact {
    /// Hex-encoded proof bytes
    pub proof: String,
    /// Hex-encoded public values
    pub public_values: String,
}

/// A withdraw request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    /// Unique request ID
    pub id: String,
    /// Checkbook the allocations belong to
    pub checkbook_id: String,
    /// Spent allocations, ascending seq
    pub allocation_seqs: Vec<u8>,
    /// Depositor
    pub owner: UniversalAddress,
    /// Deposited token
    pub token_key: String,
    /// Sum of the allocations
    pub amount: TokenAmount,
    pub intent: Intent,
    /// Nullifier of the lowest-seq allocation; identifies the request on-chain
    pub onchain_request_id: Nullifier,

    pub proof_status: ProofStatus,
    pub execute_status: ExecuteStatus,
    pub payout_status: PayoutStatus,
    pub hook_status: HookStatus,
    /// Derived from the four sub-statuses
    pub status: MainStatus,

    // Stage 1
    pub proof: Option<ProofArtifact>,
    pub proof_error: Option<String>,
    pub proof_attempts: u32,
    pub proof_started_at: Option<u64>,

    // Stage 2
    pub execute_tx_hash: Option<String>,
    pub execute_error: Option<String>,
    pub execute_attempts: u32,
    pub execute_submitted_at: Option<u64>,

    // Stage 3
    pub bridge_tx_id: Option<String>,
    pub payout_tx_hash: Option<String>,
    pub payout_error: Option<String>,
    pub payout_retry_count: u32,

    // Stage 4
    pub hook_tx_hash: Option<String>,
    pub hook_error: Option<String>,
    pub fallback_transferred: bool,
    pub fallback_tx_hash: Option<String>,
    pub fallback_error: Option<String>,

    /// Operator note for manual resolution
    pub resolution_note: Option<String>,

    pub created_at: u64,
    pub updated_at: u64,
    /// Optimistic concurrency token, bumped by the store on every write
    pub version: u64,
}

impl WithdrawRequest {
    /// Create a new request in `created`
    pub fn new(
        checkbook_id: String,
        allocation_seqs: Vec<u8>,
        owner: UniversalAddress,
        token_key: String,
        amount: TokenAmount,
        intent: Intent,
        onchain_request_id: Nullifier,
    ) -> Self {
        let now = now_secs();
        let hook_status = if intent.requires_hook() {
            HookStatus::Pending
        } else {
            HookStatus::NotRequired
        };

        let mut seqs = allocation_seqs;
        seqs.sort_unstable();

        Self {
            id: format!("wr_{}", uuid::Uuid::new_v4().simple()),
            checkbook_id,
            allocation_seqs: seqs,
            owner,
            token_key,
            amount,
            intent,
            onchain_request_id,
            proof_status: ProofStatus::Pending,
            execute_status: ExecuteStatus::Pending,
            payout_status: PayoutStatus::Pending,
            hook_status,
            status: MainStatus::Created,
            proof: None,
            proof_error: None,
            proof_attempts: 0,
            proof_started_at: None,
            execute_tx_hash: None,
            execute_error: None,
            execute_attempts: 0,
            execute_submitted_at: None,
            bridge_tx_id: None,
            payout_tx_hash: None,
            payout_error: None,
            payout_retry_count: 0,
            hook_tx_hash: None,
            hook_error: None,
            fallback_transferred: false,
            fallback_tx_hash: None,
            fallback_error: None,
            resolution_note: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn sub_statuses(&self) -> SubStatuses {
        SubStatuses {
            proof: self.proof_status,
            execute: self.execute_status,
            payout: self.payout_status,
            hook: self.hook_status,
        }
    }

    pub fn can_cancel(&self) -> bool {
        !self.is_closed() && state::can_cancel(self.execute_status)
    }

    pub fn can_retry_execute(&self) -> bool {
        state::can_retry_execute(self.execute_status)
    }

    pub fn can_retry_proof(&self) -> bool {
        !self.is_closed() && self.proof_status == ProofStatus::Failed
    }

    /// False for good once the retry budget is spent
    pub fn can_retry_payout(&self, max_retries: u32) -> bool {
        !self.is_closed()
            && self.payout_status == PayoutStatus::Failed
            && self.payout_retry_count < max_retries
    }

    /// A failed hook may be re-attempted until a fallback transfer happened
    pub fn can_retry_hook(&self) -> bool {
        !self.is_closed()
            && self.intent.requires_hook()
            && self.hook_status == HookStatus::Failed
            && !self.fallback_transferred
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Operator overrides freeze the request
    pub fn is_closed(&self) -> bool {
        matches!(self.status, MainStatus::Cancelled | MainStatus::ManuallyResolved)
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        state::classify(&self.sub_statuses(), self.fallback_transferred)
    }

    // Stage 1 transitions

    pub fn mark_proof_in_progress(&mut self) {
        self.proof_status = ProofStatus::InProgress;
        self.proof_error = None;
        self.proof_attempts += 1;
        self.proof_started_at = Some(now_secs());
        self.refresh();
    }

    pub fn mark_proof_completed(&mut self, artifact: ProofArtifact) {
        self.proof = Some(artifact);
        self.proof_status = ProofStatus::Completed;
        self.proof_error = None;
        self.refresh();
    }

    pub fn mark_proof_failed(&mut self, error: String) {
        self.proof_status = ProofStatus::Failed;
        self.proof_error = Some(error);
        self.refresh();
    }

    // Stage 2 transitions

    pub fn mark_execute_submitted(&mut self, tx_hash: String) {
        self.execute_tx_hash = Some(tx_hash);
        self.execute_status = ExecuteStatus::Submitted;
        self.execute_error = None;
        self.execute_attempts += 1;
        self.execute_submitted_at = Some(now_secs());
        self.refresh();
    }

    /// Only valid together with consuming the allocations in the same store
    /// transaction (`WithdrawStore::commit_execution`).
    pub fn mark_execute_success(&mut self, tx_hash: Option<String>) {
        if tx_hash.is_some() {
            self.execute_tx_hash = tx_hash;
        }
        self.execute_status = ExecuteStatus::Success;
        self.execute_error = None;
        self.refresh();
    }

    pub fn mark_execute_submit_failed(&mut self, error: String) {
        self.execute_status = ExecuteStatus::SubmitFailed;
        self.execute_error = Some(error);
        self.execute_attempts += 1;
        self.refresh();
    }

    pub fn mark_execute_verify_failed(&mut self, error: String) {
        self.execute_status = ExecuteStatus::VerifyFailed;
        self.execute_error = Some(error);
        self.refresh();
    }

    // Stage 3 transitions

    pub fn mark_payout_processing(&mut self, bridge_tx_id: String) {
        self.bridge_tx_id = Some(bridge_tx_id);
        self.payout_status = PayoutStatus::Processing;
        self.refresh();
    }

    /// Failed attempt with retries left: back to pending until the retry fires
    pub fn mark_payout_retry_scheduled(&mut self, error: String) {
        self.payout_status = PayoutStatus::Pending;
        self.payout_error = Some(error);
        self.payout_retry_count += 1;
        self.bridge_tx_id = None;
        self.refresh();
    }

    pub fn mark_payout_completed(&mut self, tx_hash: Option<String>) {
        if tx_hash.is_some() {
            self.payout_tx_hash = tx_hash;
        }
        self.payout_status = PayoutStatus::Completed;
        self.payout_error = None;
        self.refresh();
    }

    pub fn mark_payout_failed(&mut self, error: String) {
        self.payout_status = PayoutStatus::Failed;
        self.payout_error = Some(error);
        self.refresh();
    }

    // Stage 4 transitions

    pub fn mark_hook_processing(&mut self) {
        self.hook_status = HookStatus::Processing;
        self.hook_error = None;
        self.refresh();
    }

    pub fn mark_hook_completed(&mut self, tx_hash: Option<String>) {
        if tx_hash.is_some() {
            self.hook_tx_hash = tx_hash;
        }
        self.hook_status = HookStatus::Completed;
        self.hook_error = None;
        self.refresh();
    }

    pub fn mark_hook_failed(&mut self, error: String) {
        self.hook_status = HookStatus::Failed;
        self.hook_error = Some(error);
        self.refresh();
    }

    /// Queue another purchase attempt after a failure
    pub fn mark_hook_retry_requested(&mut self) {
        self.hook_status = HookStatus::Pending;
        self.hook_error = None;
        self.fallback_error = None;
        self.refresh();
    }

    pub fn mark_hook_abandoned(&mut self) {
        self.hook_status = HookStatus::Abandoned;
        self.refresh();
    }

    pub fn mark_fallback_transferred(&mut self, tx_hash: Option<String>) {
        self.fallback_transferred = true;
        if tx_hash.is_some() {
            self.fallback_tx_hash = tx_hash;
        }
        self.fallback_error = None;
        self.refresh();
    }

    pub fn mark_fallback_failed(&mut self, error: String) {
        self.fallback_error = Some(error);
        self.refresh();
    }

    // Operator overrides

    pub fn mark_cancelled(&mut self) {
        self.status = MainStatus::Cancelled;
        self.touch();
    }

    pub fn mark_manually_resolved(&mut self, note: String) {
        self.status = MainStatus::ManuallyResolved;
        self.resolution_note = Some(note);
        self.touch();
    }

    fn refresh(&mut self) {
        if !self.is_closed() {
            if let Some(status) = derive_main_status(&self.sub_statuses(), self.fallback_transferred) {
                self.status = status;
            }
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}

/// Withdraw statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WithdrawStats {
    pub submitted: u64,
    pub proofs_completed: u64,
    pub executions_confirmed: u64,
    pub payouts_completed: u64,
    pub hooks_completed: u64,
    pub fallbacks: u64,
    pub failed_permanent: u64,
    pub cancelled: u64,
}

impl std::fmt::Display for WithdrawStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Withdrawals: {} submitted | {} proved | {} executed | {} paid out | {} hooked | {} failed | {} cancelled",
            self.submitted,
            self.proofs_completed,
            self.executions_confirmed,
            self.payouts_completed,
            self.hooks_completed,
            self.failed_permanent,
            self.cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::primitives::Bytes32;

    fn raw_intent() -> Intent {
        Intent::RawToken {
            beneficiary: UniversalAddress::new(60, Bytes32([2u8; 32])),
            token_symbol: "USDT".to_string(),
        }
    }

    fn request(intent: Intent) -> WithdrawRequest {
        WithdrawRequest::new(
            "cb_1".to_string(),
            vec![1, 0],
            UniversalAddress::new(714, Bytes32([1u8; 32])),
            "USDT".to_string(),
            TokenAmount(10),
            intent,
            Bytes32([3u8; 32]),
        )
    }

    #[test]
    fn test_new_request_defaults() {
        let req = request(raw_intent());
        assert!(req.id.starts_with("wr_"));
        assert_eq!(req.allocation_seqs, vec![0, 1]);
        assert_eq!(req.status, MainStatus::Created);
        assert_eq!(req.hook_status, HookStatus::NotRequired);
        assert!(req.can_cancel());
    }

    #[test]
    fn test_asset_intent_requires_hook() {
        let req = request(Intent::AssetToken {
            asset_id: "aave-usdt".to_string(),
            beneficiary: UniversalAddress::new(60, Bytes32([2u8; 32])),
            asset_token_symbol: "aUSDT".to_string(),
        });
        assert_eq!(req.hook_status, HookStatus::Pending);
        assert_eq!(req.intent.payout_token(), "aUSDT");
    }

    #[test]
    fn test_transitions_rederive_status() {
        let mut req = request(raw_intent());
        req.mark_proof_in_progress();
        assert_eq!(req.status, MainStatus::Proving);
        req.mark_proof_completed(ProofArtifact {
            proof: "0x01".to_string(),
            public_values: "0x02".to_string(),
        });
        assert_eq!(req.status, MainStatus::ProofGenerated);
        req.mark_execute_submitted("0xabc".to_string());
        assert_eq!(req.status, MainStatus::Submitting);
        assert!(!req.can_cancel());
        req.mark_execute_success(None);
        assert_eq!(req.status, MainStatus::WaitingForPayout);
        req.mark_payout_processing("bridge-1".to_string());
        assert_eq!(req.status, MainStatus::PayoutProcessing);
        req.mark_payout_completed(Some("0xdef".to_string()));
        assert_eq!(req.status, MainStatus::Completed);
        assert!(req.is_terminal());
    }

    #[test]
    fn test_cancelled_is_sticky() {
        let mut req = request(raw_intent());
        req.mark_cancelled();
        req.mark_proof_completed(ProofArtifact {
            proof: String::new(),
            public_values: String::new(),
        });
        assert_eq!(req.status, MainStatus::Cancelled);
        assert!(!req.can_cancel());
    }

    #[test]
    fn test_payout_and_hook_retry_guards() {
        let mut req = request(Intent::AssetToken {
            asset_id: "aave-usdt".to_string(),
            beneficiary: UniversalAddress::new(60, Bytes32([2u8; 32])),
            asset_token_symbol: "aUSDT".to_string(),
        });
        req.mark_proof_completed(ProofArtifact {
            proof: "0x01".to_string(),
            public_values: "0x02".to_string(),
        });
        req.mark_execute_success(None);
        req.mark_payout_failed("no route".to_string());
        assert!(req.can_retry_payout(5));
        req.payout_retry_count = 5;
        assert!(!req.can_retry_payout(5));

        req.mark_payout_completed(None);
        req.mark_hook_failed("pool paused".to_string());
        assert_eq!(req.status, MainStatus::FailedPermanent);
        assert!(req.can_retry_hook());

        req.mark_hook_retry_requested();
        assert_eq!(req.hook_status, HookStatus::Pending);
        // no derivation row for (completed, pending): status is kept
        assert_eq!(req.status, MainStatus::FailedPermanent);
        req.mark_hook_processing();
        assert_eq!(req.status, MainStatus::HookProcessing);

        req.mark_hook_failed("pool paused".to_string());
        req.mark_fallback_transferred(Some("0xfb".to_string()));
        assert_eq!(req.status, MainStatus::Completed);
        assert!(!req.can_retry_hook());
    }

    #[test]
    fn test_intent_serde_is_tagged() {
        let json = serde_json::to_value(raw_intent()).unwrap();
        assert_eq!(json["type"], "raw_token");
        assert_eq!(json["token_symbol"], "USDT");
    }
}
