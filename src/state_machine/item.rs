use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::WorkStatus;

/// Terminal value produced by an execution, stored as an opaque JSON blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// A failed result with no output, used when the process never ran.
    pub fn not_started(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Request facts for a fresh item. Immutable once written.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub user_id: Option<i64>,
    pub email: String,
    pub max_minutes: u32,
    pub task_description: String,
    pub cost_fiat: f64,
    pub payment_address: String,
}

/// Side effects of `pending_payment → paid`.
#[derive(Debug, Clone, PartialEq)]
pub struct PaidFields {
    pub transaction_id: String,
    pub amount: f64,
    pub paid_at: DateTime<Utc>,
}

impl PaidFields {
    pub fn now(transaction_id: impl Into<String>, amount: f64) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            amount,
            paid_at: Utc::now(),
        }
    }
}

/// Side effects of `paid → processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimFields {
    pub started_at: DateTime<Utc>,
}

impl ClaimFields {
    pub fn now() -> Self {
        Self {
            started_at: Utc::now(),
        }
    }
}

/// Side effects of `processing → completed | failed`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedFields {
    pub result: ExecutionResult,
    pub completed_at: DateTime<Utc>,
}

impl CompletedFields {
    pub fn now(result: ExecutionResult) -> Self {
        Self {
            result,
            completed_at: Utc::now(),
        }
    }

    /// Status the item lands in.
    pub fn status(&self) -> WorkStatus {
        if self.result.success {
            WorkStatus::Completed
        } else {
            WorkStatus::Failed
        }
    }
}

/// One paid task submission and its full lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub user_id: Option<i64>,
    pub email: String,
    pub max_minutes: u32,
    pub task_description: String,
    pub cost_fiat: f64,
    pub expected_amount: Option<f64>,
    pub payment_address: String,
    pub transaction_id: Option<String>,
    pub received_amount: Option<f64>,
    pub status: WorkStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ExecutionResult>,
}

impl WorkItem {
    /// Checks that the timestamps present match what the status implies.
    pub fn timestamps_consistent(&self) -> bool {
        let rank = self.status.rank();
        let ordered = |earlier: Option<DateTime<Utc>>, later: Option<DateTime<Utc>>| match (
            earlier, later,
        ) {
            (Some(a), Some(b)) => a <= b,
            (None, Some(_)) => false,
            _ => true,
        };

        self.paid_at.is_some() == (rank >= 1)
            && self.started_at.is_some() == (rank >= 2)
            && self.completed_at.is_some() == (rank >= 3)
            && ordered(self.paid_at, self.started_at)
            && ordered(self.started_at, self.completed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(status: WorkStatus) -> WorkItem {
        WorkItem {
            id: 1,
            user_id: Some(7),
            email: "dev@example.com".into(),
            max_minutes: 10,
            task_description: "Write a CLI".into(),
            cost_fiat: 1.0,
            expected_amount: None,
            payment_address: "wallet".into(),
            transaction_id: None,
            received_amount: None,
            status,
            created_at: Utc::now(),
            paid_at: None,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    #[test]
    fn fresh_pending_item_is_consistent() {
        assert!(sample(WorkStatus::PendingPayment).timestamps_consistent());
    }

    #[test]
    fn paid_item_without_paid_at_is_inconsistent() {
        assert!(!sample(WorkStatus::Paid).timestamps_consistent());
    }

    #[test]
    fn out_of_order_timestamps_are_inconsistent() {
        let mut item = sample(WorkStatus::Processing);
        let now = Utc::now();
        item.paid_at = Some(now);
        item.started_at = Some(now - Duration::seconds(5));
        assert!(!item.timestamps_consistent());

        item.started_at = Some(now + Duration::seconds(5));
        assert!(item.timestamps_consistent());
    }

    #[test]
    fn completed_fields_pick_status_from_success() {
        let ok = CompletedFields::now(ExecutionResult {
            success: true,
            output: "done".into(),
            error: None,
        });
        assert_eq!(ok.status(), WorkStatus::Completed);

        let failed = CompletedFields::now(ExecutionResult::not_started("missing binary"));
        assert_eq!(failed.status(), WorkStatus::Failed);
    }

    #[test]
    fn execution_result_omits_empty_error() {
        let result = ExecutionResult {
            success: true,
            output: "hi".into(),
            error: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("error"));
        let back: ExecutionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
