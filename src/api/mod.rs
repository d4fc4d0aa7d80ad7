//! HTTP surface of the broker: client submission and payment polling, plus
//! the bearer-authenticated worker endpoints.

pub mod auth;
pub mod types;

use std::collections::HashSet;
use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use self::auth::{SessionAuthenticator, UserIdentity, worker_authorized};
use self::types::{
    AckResponse, CheckPaymentResponse, CompleteRequest, ErrorBody, PendingList, PendingTask,
    QueueEntry, QueueStatusResponse, SubmitRequest, SubmitResponse, TaskStatusResponse,
};
use crate::config::{LedgerConfig, ServerConfig};
use crate::error::TransitionError;
use crate::oracle::PriceOracle;
use crate::payment::{
    Ledger, PaymentMatcher, compute_expected_amount, from_lamports, to_lamports,
};
use crate::state_machine::{CompletedFields, NewWorkItem, PaidFields, WorkItem, WorkItemLifecycle};
use crate::store::{SqlBackend, StoreError};

/// Reply to a rejected transition; callers only learn someone got there first.
const NOT_AVAILABLE: &str = "Task not available";

/// Amount recorded by the test payment endpoint.
const TEST_PAYMENT_AMOUNT: f64 = 0.001;

/// Everything the handlers share.
pub struct AppState<B, L> {
    pub lifecycle: WorkItemLifecycle<B>,
    pub sessions: SessionAuthenticator<B>,
    pub oracle: PriceOracle,
    pub matcher: PaymentMatcher<L>,
    pub server: ServerConfig,
    pub offset_scale: f64,
}

impl<B: SqlBackend + Clone, L: Ledger> AppState<B, L> {
    pub fn new(
        lifecycle: WorkItemLifecycle<B>,
        oracle: PriceOracle,
        ledger: L,
        server: ServerConfig,
        ledger_config: &LedgerConfig,
    ) -> Self {
        let sessions = SessionAuthenticator::new(lifecycle.store().backend().clone());
        Self {
            lifecycle,
            sessions,
            oracle,
            matcher: PaymentMatcher::new(ledger, ledger_config),
            server,
            offset_scale: ledger_config.offset_scale,
        }
    }
}

/// Failure of a request, rendered as `{success: false, error}`.
#[derive(Debug)]
pub enum ApiError {
    /// No valid session; the client should log in.
    Unauthenticated,
    /// Missing or wrong worker token.
    Unauthorized,
    Forbidden(String),
    BadRequest(String),
    NotFound(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    requires_auth: true,
                    ..ErrorBody::new("Please log in to submit tasks")
                },
            ),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, ErrorBody::new("Unauthorized")),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, ErrorBody::new(msg)),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorBody::new(msg)),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorBody::new(msg)),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new("Internal server error"),
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<TransitionError> for ApiError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::NotFound(_) => ApiError::NotFound("Task not found".into()),
            TransitionError::Store(e) => e.into(),
            guard => {
                debug!(code = guard.code(), "transition rejected");
                ApiError::BadRequest(NOT_AVAILABLE.into())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "store failure while handling request");
        ApiError::Internal
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router<B, L>(state: Arc<AppState<B, L>>) -> Router
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let mut worker = Router::new()
        .route("/api/worker/pending", get(worker_pending::<B, L>))
        .route("/api/worker/claim/:id", post(worker_claim::<B, L>))
        .route("/api/worker/complete/:id", post(worker_complete::<B, L>))
        .route("/api/worker/task/:id", get(worker_task::<B, L>));
    if state.server.allow_test_payments {
        worker = worker.route("/api/test/mark-paid/:id", post(test_mark_paid::<B, L>));
    }
    let worker = worker.route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_worker::<B, L>,
    ));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/submit", post(submit::<B, L>))
        .route("/api/check-payment/:id", get(check_payment::<B, L>))
        .route(
            "/api/task/:id",
            get(task_status::<B, L>).delete(delete_task::<B, L>),
        )
        .route("/api/status", get(queue_status::<B, L>))
        .merge(worker)
        .with_state(state)
}

async fn require_worker<B, L>(
    State(state): State<Arc<AppState<B, L>>>,
    request: Request,
    next: Next,
) -> Response
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    if !worker_authorized(request.headers(), &state.server.worker_api_key) {
        warn!(path = %request.uri().path(), "rejected worker request");
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

async fn signed_in<B: SqlBackend, L>(
    state: &AppState<B, L>,
    headers: &HeaderMap,
) -> Result<UserIdentity, ApiError> {
    state
        .sessions
        .current_user(headers)
        .await?
        .ok_or(ApiError::Unauthenticated)
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

async fn submit<B, L>(
    State(state): State<Arc<AppState<B, L>>>,
    headers: HeaderMap,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<SubmitResponse>
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let user = signed_in(&state, &headers).await?;
    let Json(request) = body?;

    let task = request.task.as_deref().map(str::trim).unwrap_or_default();
    let (Some(minutes), false) = (request.minutes, task.is_empty()) else {
        return Err(ApiError::BadRequest("Minutes and task are required".into()));
    };
    let (min, max) = (state.server.min_minutes, state.server.max_minutes);
    let minutes = u32::try_from(minutes)
        .ok()
        .filter(|m| (min..=max).contains(m))
        .ok_or_else(|| ApiError::BadRequest(format!("Minutes must be between {min} and {max}")))?;

    let cost_fiat = round_cents(f64::from(minutes) * state.server.rate_per_minute);
    let item = state
        .lifecycle
        .create(&NewWorkItem {
            user_id: Some(user.id),
            email: user.email,
            max_minutes: minutes,
            task_description: task.to_string(),
            cost_fiat,
            payment_address: state.matcher.address().to_string(),
        })
        .await?;

    let expected_amount =
        compute_expected_amount(&state.oracle, item.id, cost_fiat, state.offset_scale).await;
    state
        .lifecycle
        .store()
        .record_expected_amount(item.id, expected_amount)
        .await?;

    Ok(Json(SubmitResponse {
        success: true,
        work_item_id: item.id,
        cost_fiat,
        expected_amount,
        payment_address: item.payment_address.clone(),
        message: format!(
            "Send exactly {expected_amount:.9} SOL to {} to start the task",
            item.payment_address
        ),
    }))
}

/// The persisted expected amount, deriving and recording it for rows that
/// predate it.
async fn expected_amount_for<B: SqlBackend + Clone, L>(
    state: &AppState<B, L>,
    item: &WorkItem,
) -> Result<f64, ApiError> {
    if let Some(amount) = item.expected_amount {
        return Ok(amount);
    }
    let amount =
        compute_expected_amount(&state.oracle, item.id, item.cost_fiat, state.offset_scale).await;
    match state
        .lifecycle
        .store()
        .record_expected_amount(item.id, amount)
        .await?
    {
        Some(updated) => Ok(updated.expected_amount.unwrap_or(amount)),
        None => {
            // Another poll recorded it first.
            let current = state.lifecycle.get(item.id).await?;
            Ok(current.expected_amount.unwrap_or(amount))
        }
    }
}

async fn check_payment<B, L>(
    State(state): State<Arc<AppState<B, L>>>,
    Path(id): Path<i64>,
) -> ApiResult<CheckPaymentResponse>
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let item = state.lifecycle.get(id).await?;
    if item.status.is_paid() {
        return Ok(Json(paid(item.transaction_id)));
    }

    let expected = expected_amount_for(&state, &item).await?;
    let own = to_lamports(expected);
    // A transfer of exactly another pending item's amount belongs to that item.
    let reserved: HashSet<i64> = state
        .lifecycle
        .store()
        .pending_amounts_except(&item.payment_address, id)
        .await?
        .into_iter()
        .map(to_lamports)
        .filter(|lamports| *lamports != own)
        .collect();

    for candidate in state.matcher.candidates(expected, item.created_at).await {
        if reserved.contains(&to_lamports(candidate.amount)) {
            debug!(item_id = id, tx = %candidate.transaction_id, "candidate pays another pending item");
            continue;
        }
        if state
            .lifecycle
            .store()
            .transaction_used(&candidate.transaction_id)
            .await?
        {
            debug!(item_id = id, tx = %candidate.transaction_id, "candidate already credited");
            continue;
        }
        let fields = PaidFields::now(candidate.transaction_id.clone(), candidate.amount);
        match state.lifecycle.mark_paid(id, fields).await {
            Ok(_) => return Ok(Json(paid(Some(candidate.transaction_id)))),
            Err(TransitionError::AlreadyPaid) => {
                let current = state.lifecycle.get(id).await?;
                return Ok(Json(paid(current.transaction_id)));
            }
            Err(TransitionError::DuplicateTransaction) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Json(CheckPaymentResponse {
        paid: false,
        signature: None,
        error: None,
    }))
}

fn paid(signature: Option<String>) -> CheckPaymentResponse {
    CheckPaymentResponse {
        paid: true,
        signature,
        error: None,
    }
}

async fn task_status<B, L>(
    State(state): State<Arc<AppState<B, L>>>,
    Path(id): Path<i64>,
) -> ApiResult<TaskStatusResponse>
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let item = state.lifecycle.get(id).await?;
    Ok(Json(TaskStatusResponse::from(&item)))
}

async fn delete_task<B, L>(
    State(state): State<Arc<AppState<B, L>>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<AckResponse>
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let user = signed_in(&state, &headers).await?;
    let item = state.lifecycle.get(id).await?;
    if item.user_id != Some(user.id) {
        return Err(ApiError::Forbidden("Not authorized to delete this task".into()));
    }
    match state.lifecycle.cancel(id).await {
        Ok(()) => Ok(Json(AckResponse::ok("Task deleted"))),
        Err(TransitionError::NotCancelable) => Err(ApiError::BadRequest(
            "Can only delete tasks pending payment".into(),
        )),
        Err(e) => Err(e.into()),
    }
}

async fn queue_status<B, L>(State(state): State<Arc<AppState<B, L>>>) -> ApiResult<QueueStatusResponse>
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let queue = state.lifecycle.store().list_paid().await?;
    let address = state.matcher.address();
    let wallet_balance = if address.is_empty() {
        0.0
    } else {
        match state.matcher.ledger().balance(address).await {
            Ok(lamports) => from_lamports(i64::try_from(lamports).unwrap_or(i64::MAX)),
            Err(e) => {
                warn!(error = %e, "wallet balance unavailable");
                0.0
            }
        }
    };

    Ok(Json(QueueStatusResponse {
        wallet_balance,
        queue_length: queue.len(),
        items: queue
            .iter()
            .map(|item| QueueEntry {
                id: item.id,
                status: item.status,
                max_minutes: item.max_minutes,
                created_at: item.created_at,
            })
            .collect(),
    }))
}

async fn worker_pending<B, L>(State(state): State<Arc<AppState<B, L>>>) -> ApiResult<PendingList>
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let items = state.lifecycle.store().list_paid().await?;
    Ok(Json(PendingList {
        items: items.iter().map(PendingTask::from).collect(),
    }))
}

async fn worker_claim<B, L>(
    State(state): State<Arc<AppState<B, L>>>,
    Path(id): Path<i64>,
) -> ApiResult<PendingTask>
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let item = state.lifecycle.claim(id).await?;
    Ok(Json(PendingTask::from(&item)))
}

async fn worker_complete<B, L>(
    State(state): State<Arc<AppState<B, L>>>,
    Path(id): Path<i64>,
    body: Result<Json<CompleteRequest>, JsonRejection>,
) -> ApiResult<AckResponse>
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let Json(request) = body?;
    let item = state
        .lifecycle
        .complete(id, CompletedFields::now(request.into()))
        .await?;
    Ok(Json(AckResponse::ok(format!("Task {}", item.status))))
}

async fn worker_task<B, L>(
    State(state): State<Arc<AppState<B, L>>>,
    Path(id): Path<i64>,
) -> ApiResult<PendingTask>
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let item = state.lifecycle.get(id).await?;
    Ok(Json(PendingTask::from(&item)))
}

async fn test_mark_paid<B, L>(
    State(state): State<Arc<AppState<B, L>>>,
    Path(id): Path<i64>,
) -> ApiResult<CheckPaymentResponse>
where
    B: SqlBackend + Clone + 'static,
    L: Ledger + 'static,
{
    let transaction_id = format!("TEST-{}", Utc::now().timestamp_millis());
    let fields = PaidFields::now(transaction_id.clone(), TEST_PAYMENT_AMOUNT);
    state.lifecycle.mark_paid(id, fields).await?;
    info!(item_id = id, tx = %transaction_id, "test payment recorded");
    Ok(Json(paid(Some(transaction_id))))
}
