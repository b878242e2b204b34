//! Withdraw Request State Machine
//!
//! The main status is a pure function of the four sub-statuses, evaluated in
//! stage order. The first matching rule wins; later stages are not consulted.
//!
//! | Stage | Condition                                              | Main status                  |
//! |-------|--------------------------------------------------------|------------------------------|
//! | 1     | proof = pending                                        | created                      |
//! | 1     | proof = in_progress                                    | proving                      |
//! | 1     | proof = failed                                         | proof_failed                 |
//! | 1     | proof = completed ∧ execute = pending                  | proof_generated              |
//! | 2     | execute = verify_failed                                | failed_permanent             |
//! | 2     | execute = submit_failed                                | submit_failed                |
//! | 2     | execute = submitted                                    | submitting                   |
//! | 2     | execute = success ∧ payout = pending                   | waiting_for_payout           |
//! | 3     | payout = processing                                    | payout_processing            |
//! | 3     | payout = failed                                        | failed_permanent             |
//! | 4     | payout = completed ∧ hook ∈ {not_required, completed}  | completed                    |
//! | 4     | payout = completed ∧ hook = processing                 | hook_processing              |
//! | 4     | payout = completed ∧ hook = failed ∧ fallback          | completed                    |
//! | 4     | payout = completed ∧ hook = failed ∧ ¬fallback         | failed_permanent             |
//! | 4     | payout = completed ∧ hook = abandoned                  | completed_with_hook_failed   |
//!
//! No match leaves the stored status unchanged.

use serde::Serialize;

use crate::types::withdraw::{ExecuteStatus, HookStatus, MainStatus, PayoutStatus, ProofStatus};

/// Snapshot of the four stage statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubStatuses {
    pub proof: ProofStatus,
    pub execute: ExecuteStatus,
    pub payout: PayoutStatus,
    pub hook: HookStatus,
}

/// Derive the main status, or `None` when no rule matches.
pub fn derive_main_status(s: &SubStatuses, fallback_transferred: bool) -> Option<MainStatus> {
    // Stage 1
    match s.proof {
        ProofStatus::Pending => return Some(MainStatus::Created),
        ProofStatus::InProgress => return Some(MainStatus::Proving),
        ProofStatus::Failed => return Some(MainStatus::ProofFailed),
        ProofStatus::Completed => {
            if s.execute == ExecuteStatus::Pending {
                return Some(MainStatus::ProofGenerated);
            }
        }
    }

    // Stage 2
    match s.execute {
        ExecuteStatus::VerifyFailed => return Some(MainStatus::FailedPermanent),
        ExecuteStatus::SubmitFailed => return Some(MainStatus::SubmitFailed),
        ExecuteStatus::Submitted => return Some(MainStatus::Submitting),
        ExecuteStatus::Success if s.payout == PayoutStatus::Pending => {
            return Some(MainStatus::WaitingForPayout)
        }
        _ => {}
    }

    // Stage 3
    match s.payout {
        PayoutStatus::Processing => return Some(MainStatus::PayoutProcessing),
        PayoutStatus::Failed => return Some(MainStatus::FailedPermanent),
        PayoutStatus::Completed => {}
        PayoutStatus::Pending => return None,
    }

    // Stage 4, payout completed
    match s.hook {
        HookStatus::NotRequired | HookStatus::Completed => Some(MainStatus::Completed),
        HookStatus::Processing => Some(MainStatus::HookProcessing),
        HookStatus::Failed if fallback_transferred => Some(MainStatus::Completed),
        HookStatus::Failed => Some(MainStatus::FailedPermanent),
        HookStatus::Abandoned => Some(MainStatus::CompletedWithHookFailed),
        HookStatus::Pending => None,
    }
}

/// Cancellation is refused once the stage-2 transaction may have consumed
/// the nullifiers.
pub fn can_cancel(execute: ExecuteStatus) -> bool {
    !matches!(execute, ExecuteStatus::Success | ExecuteStatus::Submitted)
}

/// Only transmission failures are resubmitted; `verify_failed` never is.
pub fn can_retry_execute(execute: ExecuteStatus) -> bool {
    execute == ExecuteStatus::SubmitFailed
}

/// True once the stage-2 transaction may be on-chain
pub fn past_irreversibility_boundary(execute: ExecuteStatus) -> bool {
    !can_cancel(execute)
}

/// How a failure surfaces to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// proof_failed, submit_failed
    RecoverableByRetry,
    /// hook failed but the fallback transfer went through
    RecoverableByFallback,
    /// verify_failed, payout failed after exhaustion, hook failed without fallback
    Permanent,
}

/// Classify the current failure, if any
pub fn classify(s: &SubStatuses, fallback_transferred: bool) -> Option<ErrorClass> {
    if s.execute == ExecuteStatus::VerifyFailed || s.payout == PayoutStatus::Failed {
        return Some(ErrorClass::Permanent);
    }
    if s.proof == ProofStatus::Failed || s.execute == ExecuteStatus::SubmitFailed {
        return Some(ErrorClass::RecoverableByRetry);
    }
    if s.hook == HookStatus::Failed {
        return Some(if fallback_transferred {
            ErrorClass::RecoverableByFallback
        } else {
            ErrorClass::Permanent
        });
    }
    None
}
