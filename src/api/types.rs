//! JSON bodies of the HTTP API, shared by the server and the worker client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::{ExecutionResult, WorkItem, WorkStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub minutes: Option<i64>,
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub work_item_id: i64,
    pub cost_fiat: f64,
    pub expected_amount: f64,
    pub payment_address: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_auth: bool,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            requires_auth: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPaymentResponse {
    pub paid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl AckResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Public view of one item, without contact details or result text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub id: i64,
    pub status: WorkStatus,
    pub max_minutes: u32,
    pub cost_fiat: f64,
    pub expected_amount: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub has_result: bool,
}

impl From<&WorkItem> for TaskStatusResponse {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id,
            status: item.status,
            max_minutes: item.max_minutes,
            cost_fiat: item.cost_fiat,
            expected_amount: item.expected_amount,
            created_at: item.created_at,
            paid_at: item.paid_at,
            started_at: item.started_at,
            completed_at: item.completed_at,
            has_result: item.result.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: i64,
    pub status: WorkStatus,
    pub max_minutes: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    pub wallet_balance: f64,
    pub queue_length: usize,
    pub items: Vec<QueueEntry>,
}

/// A task as handed to a worker: everything needed to run and report it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTask {
    pub id: i64,
    pub email: String,
    pub max_minutes: u32,
    pub task_description: String,
    pub cost_fiat: f64,
    #[serde(default)]
    pub expected_amount: Option<f64>,
    pub status: WorkStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl From<&WorkItem> for PendingTask {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id,
            email: item.email.clone(),
            max_minutes: item.max_minutes,
            task_description: item.task_description.clone(),
            cost_fiat: item.cost_fiat,
            expected_amount: item.expected_amount,
            status: item.status,
            created_at: item.created_at,
            paid_at: item.paid_at,
            started_at: item.started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingList {
    pub items: Vec<PendingTask>,
}

/// Body of `POST /api/worker/complete/:id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<CompleteRequest> for ExecutionResult {
    fn from(req: CompleteRequest) -> Self {
        Self {
            success: req.success,
            output: req.output,
            error: req.error,
        }
    }
}

impl From<&ExecutionResult> for CompleteRequest {
    fn from(result: &ExecutionResult) -> Self {
        Self {
            success: result.success,
            output: result.output.clone(),
            error: result.error.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    /// Fixed timestamps so two fixtures for the same id compare equal.
    pub(crate) fn pending_task(id: i64) -> PendingTask {
        let created = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        PendingTask {
            id,
            email: "dev@example.com".into(),
            max_minutes: 10,
            task_description: "Build a landing page".into(),
            cost_fiat: 1.0,
            expected_amount: Some(0.005_000_007),
            status: WorkStatus::Processing,
            created_at: created,
            paid_at: Some(created + chrono::Duration::minutes(2)),
            started_at: Some(created + chrono::Duration::minutes(3)),
        }
    }

    #[test]
    fn fixture_is_stable_across_calls() {
        assert_eq!(pending_task(7), pending_task(7));
    }

    #[test]
    fn pending_task_uses_camel_case() {
        let value = serde_json::to_value(pending_task(3)).unwrap();
        assert_eq!(value["maxMinutes"], 10);
        assert_eq!(value["taskDescription"], "Build a landing page");
        assert_eq!(value["status"], "processing");
        assert!(value.get("max_minutes").is_none());
    }

    #[test]
    fn error_body_omits_requires_auth_unless_set() {
        let plain = serde_json::to_value(ErrorBody::new("nope")).unwrap();
        assert_eq!(plain, json!({ "success": false, "error": "nope" }));

        let auth = ErrorBody {
            requires_auth: true,
            ..ErrorBody::new("Authentication required")
        };
        assert_eq!(serde_json::to_value(auth).unwrap()["requiresAuth"], true);
    }

    #[test]
    fn complete_request_tolerates_missing_fields() {
        let req: CompleteRequest = serde_json::from_value(json!({ "success": false })).unwrap();
        let result = ExecutionResult::from(req);
        assert!(!result.success);
        assert!(result.output.is_empty());
        assert!(result.error.is_none());
    }
}
