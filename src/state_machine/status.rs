use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The five states of a work item.
///
/// Each item flows through: PENDING_PAYMENT → PAID → PROCESSING → {COMPLETED | FAILED}.
/// A pending item may also leave the store entirely through cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    PendingPayment,
    Paid,
    Processing,
    Completed,
    Failed,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 5] = [
        WorkStatus::PendingPayment,
        WorkStatus::Paid,
        WorkStatus::Processing,
        WorkStatus::Completed,
        WorkStatus::Failed,
    ];

    /// Column value stored in `work_items.status`.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::PendingPayment => "pending_payment",
            WorkStatus::Paid => "paid",
            WorkStatus::Processing => "processing",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Failed)
    }

    /// True once a payment has been recorded against the item.
    pub fn is_paid(&self) -> bool {
        !matches!(self, WorkStatus::PendingPayment)
    }

    /// Position along the lifecycle. Both terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            WorkStatus::PendingPayment => 0,
            WorkStatus::Paid => 1,
            WorkStatus::Processing => 2,
            WorkStatus::Completed | WorkStatus::Failed => 3,
        }
    }

    /// Whether `self → next` is a legal edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: WorkStatus) -> bool {
        matches!(
            (self, next),
            (WorkStatus::PendingPayment, WorkStatus::Paid)
                | (WorkStatus::Paid, WorkStatus::Processing)
                | (WorkStatus::Processing, WorkStatus::Completed)
                | (WorkStatus::Processing, WorkStatus::Failed)
        )
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown work status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for WorkStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
