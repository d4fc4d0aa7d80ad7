use thiserror::Error;

use crate::store::StoreError;

/// Rejections raised by the work-item state machine.
///
/// Guard violations are distinguishable by [`code`](TransitionError::code) so
/// callers can treat them as "someone else already handled it" instead of
/// retrying blindly.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The item already left `pending_payment`. Pollers treat this as success.
    #[error("work item is already paid")]
    AlreadyPaid,

    /// The ledger transaction is already recorded against another item.
    #[error("transaction is already recorded against another work item")]
    DuplicateTransaction,

    #[error("work item is not claimable")]
    NotClaimable,

    #[error("work item is not in processing status")]
    NotProcessing,

    #[error("only items pending payment can be canceled")]
    NotCancelable,

    #[error("work item {0} not found")]
    NotFound(i64),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl TransitionError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TransitionError::AlreadyPaid => "already_paid",
            TransitionError::DuplicateTransaction => "duplicate_transaction",
            TransitionError::NotClaimable => "not_claimable",
            TransitionError::NotProcessing => "not_processing",
            TransitionError::NotCancelable => "not_cancelable",
            TransitionError::NotFound(_) => "not_found",
            TransitionError::Store(_) => "store_error",
        }
    }

    /// True for rejections caused by the item's current state rather than
    /// by infrastructure.
    pub fn is_guard_violation(&self) -> bool {
        !matches!(self, TransitionError::Store(_) | TransitionError::NotFound(_))
    }
}
