//! The worker: polls for paid items, runs them, reports and delivers.
//!
//! One item at a time. Per item the order is fixed: claim, run under the
//! budget, report the result, then deliver it to the requester. A claim lost
//! to another worker is skipped silently, and a result the broker rejects
//! is not delivered. A report that keeps failing is retried with backoff and
//! then delivered anyway, since the work is already done and paid for.

mod client;
mod error;

pub use client::BrokerClient;
pub use error::QueueError;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::api::types::PendingTask;
use crate::config::WorkerConfig;
use crate::delivery::{DeliveryPipeline, Mailer};
use crate::error::TransitionError;
use crate::state_machine::{CompletedFields, ExecutionResult, WorkItemLifecycle};
use crate::store::SqlBackend;
use crate::supervisor::ExecutionSupervisor;
use crate::ui::ExecutionProgress;

/// Source of paid items and sink for their results.
pub trait WorkQueue: Send + Sync {
    /// Paid items, oldest payment first.
    fn pending(&self) -> impl Future<Output = Result<Vec<PendingTask>, QueueError>> + Send;

    /// `None` when another worker got there first.
    fn claim(&self, id: i64)
    -> impl Future<Output = Result<Option<PendingTask>, QueueError>> + Send;

    /// `false` when the item was no longer processing and the result was
    /// not recorded.
    fn complete(
        &self,
        id: i64,
        result: &ExecutionResult,
    ) -> impl Future<Output = Result<bool, QueueError>> + Send;
}

/// Local mode: the worker drives the store directly.
impl<B: SqlBackend> WorkQueue for WorkItemLifecycle<B> {
    async fn pending(&self) -> Result<Vec<PendingTask>, QueueError> {
        let items = self
            .store()
            .list_paid()
            .await
            .map_err(TransitionError::from)?;
        Ok(items.iter().map(PendingTask::from).collect())
    }

    async fn claim(&self, id: i64) -> Result<Option<PendingTask>, QueueError> {
        match WorkItemLifecycle::claim(self, id).await {
            Ok(item) => Ok(Some(PendingTask::from(&item))),
            Err(TransitionError::NotClaimable | TransitionError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn complete(&self, id: i64, result: &ExecutionResult) -> Result<bool, QueueError> {
        match WorkItemLifecycle::complete(self, id, CompletedFields::now(result.clone())).await {
            Ok(_) => Ok(true),
            Err(TransitionError::NotProcessing | TransitionError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// What happened to one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Claimed by someone else.
    Skipped,
    Finished {
        success: bool,
        /// The broker recorded the result.
        accepted: bool,
        /// Reached the requester (even if the report never got through).
        delivered: bool,
    },
}

pub struct Worker<Q, M> {
    queue: Q,
    supervisor: ExecutionSupervisor,
    delivery: DeliveryPipeline<M>,
    tasks_dir: PathBuf,
    poll_interval: Duration,
    error_backoff: Duration,
    report_attempts: u32,
    report_backoff: Duration,
    show_progress: bool,
}

impl<Q: WorkQueue, M: Mailer> Worker<Q, M> {
    pub fn new(
        queue: Q,
        supervisor: ExecutionSupervisor,
        delivery: DeliveryPipeline<M>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            supervisor,
            delivery,
            tasks_dir: config.tasks_dir.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            error_backoff: Duration::from_secs(config.error_backoff_secs),
            report_attempts: config.report_attempts.max(1),
            report_backoff: Duration::from_millis(config.report_backoff_ms),
            show_progress: false,
        }
    }

    /// Shows a terminal spinner while items run.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn task_dir(&self, id: i64) -> PathBuf {
        self.tasks_dir
            .join(format!("task-{id}-{}", Utc::now().timestamp_millis()))
    }

    pub async fn process_item(&self, task: &PendingTask) -> Result<ItemOutcome, QueueError> {
        let Some(claimed) = self.queue.claim(task.id).await? else {
            info!(item_id = task.id, "item already claimed elsewhere, skipping");
            return Ok(ItemOutcome::Skipped);
        };

        let dir = self.task_dir(claimed.id);
        let (result, artifacts) = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => (self.execute(&claimed, &dir).await, Some(dir.as_path())),
            Err(e) => {
                error!(item_id = claimed.id, dir = %dir.display(), error = %e, "cannot create task directory");
                (
                    ExecutionResult::not_started(format!("could not create task directory: {e}")),
                    None,
                )
            }
        };

        let accepted = match self.report(claimed.id, &result).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(item_id = claimed.id, "result rejected, item is no longer processing");
                return Ok(ItemOutcome::Finished {
                    success: result.success,
                    accepted: false,
                    delivered: false,
                });
            }
            Err(e) => {
                error!(
                    item_id = claimed.id,
                    attempts = self.report_attempts,
                    error = %e,
                    "could not report result, delivering anyway"
                );
                false
            }
        };

        let delivered = self.delivery.deliver(&claimed, &result, artifacts).await;
        Ok(ItemOutcome::Finished {
            success: result.success,
            accepted,
            delivered,
        })
    }

    /// Reports the result, retrying transient failures with doubling delays.
    async fn report(&self, id: i64, result: &ExecutionResult) -> Result<bool, QueueError> {
        let mut delay = self.report_backoff;
        let mut attempt = 1;
        loop {
            match self.queue.complete(id, result).await {
                Err(e) if e.is_transient() && attempt < self.report_attempts => {
                    warn!(item_id = id, attempt, error = %e, "reporting result failed, retrying");
                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn execute(&self, task: &PendingTask, dir: &Path) -> ExecutionResult {
        info!(item_id = task.id, minutes = task.max_minutes, dir = %dir.display(), "executing item");
        let progress = self
            .show_progress
            .then(|| ExecutionProgress::start(task.id, task.max_minutes));

        let result = self
            .supervisor
            .run_with_events(
                &task.task_description,
                f64::from(task.max_minutes),
                dir,
                |event| {
                    if let Some(progress) = &progress {
                        progress.event(event);
                    }
                },
            )
            .await;

        if let Some(progress) = &progress {
            progress.finish(&result);
        }
        info!(item_id = task.id, success = result.success, "execution finished");
        result
    }

    /// One poll: runs the oldest pending item this worker manages to claim.
    /// Returns whether an item ran.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let pending = self.queue.pending().await?;
        if pending.is_empty() {
            debug!("no paid items waiting");
            return Ok(false);
        }
        info!(count = pending.len(), "paid items waiting");

        for task in &pending {
            if let ItemOutcome::Finished { .. } = self.process_item(task).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Polls until `shutdown` flips to true. The item in flight always runs
    /// to completion first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_secs = self.poll_interval.as_secs(),
            tasks_dir = %self.tasks_dir.display(),
            "worker started"
        );
        while !*shutdown.borrow() {
            let delay = match self.run_once().await {
                // More may be waiting.
                Ok(true) => Duration::ZERO,
                Ok(false) => self.poll_interval,
                Err(e) => {
                    error!(error = %e, "poll failed, backing off");
                    self.error_backoff
                }
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep(delay) => {}
            }
        }
        info!("worker stopped");
    }
}

/// A receiver that flips to true on the first Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, finishing current item"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
        let _ = tx.send(true);
    });
    rx
}
