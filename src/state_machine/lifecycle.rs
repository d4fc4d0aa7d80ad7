use chrono::Utc;
use tracing::{debug, info, warn};

use super::item::{ClaimFields, CompletedFields, NewWorkItem, PaidFields, WorkItem};
use crate::error::TransitionError;
use crate::store::{SqlBackend, StoreError, WorkItemStore};

/// Drives work items through their lifecycle against the store.
///
/// Each transition is a single conditional write; when it affects no row,
/// the item is re-read only to pick the right rejection. The re-read never
/// decides whether the transition happened.
#[derive(Clone)]
pub struct WorkItemLifecycle<B> {
    store: WorkItemStore<B>,
}

impl<B: SqlBackend> WorkItemLifecycle<B> {
    pub fn new(store: WorkItemStore<B>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &WorkItemStore<B> {
        &self.store
    }

    /// New item in `pending_payment`, every payment and execution fact null.
    pub async fn create(&self, new: &NewWorkItem) -> Result<WorkItem, TransitionError> {
        let item = self.store.create(new, Utc::now()).await?;
        info!(item_id = item.id, minutes = item.max_minutes, "work item created");
        Ok(item)
    }

    pub async fn get(&self, id: i64) -> Result<WorkItem, TransitionError> {
        self.store
            .get(id)
            .await?
            .ok_or(TransitionError::NotFound(id))
    }

    /// `pending_payment → paid`.
    pub async fn mark_paid(&self, id: i64, fields: PaidFields) -> Result<WorkItem, TransitionError> {
        match self.store.update_paid(id, &fields).await {
            Ok(Some(item)) => {
                info!(item_id = id, tx = %fields.transaction_id, amount = fields.amount, "payment recorded");
                Ok(item)
            }
            Ok(None) => {
                self.get(id).await?;
                debug!(item_id = id, "mark_paid on an item that is no longer pending");
                Err(TransitionError::AlreadyPaid)
            }
            Err(StoreError::UniqueViolation(_)) => {
                warn!(
                    item_id = id,
                    tx = %fields.transaction_id,
                    "transaction already credited to another work item"
                );
                Err(TransitionError::DuplicateTransaction)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `paid → processing`. Exactly one of any number of racing claims wins.
    pub async fn claim(&self, id: i64) -> Result<WorkItem, TransitionError> {
        match self.store.update_claimed(id, &ClaimFields::now()).await? {
            Some(item) => {
                info!(item_id = id, "work item claimed");
                Ok(item)
            }
            None => {
                self.get(id).await?;
                Err(TransitionError::NotClaimable)
            }
        }
    }

    /// `processing → completed | failed`, recording the result.
    pub async fn complete(
        &self,
        id: i64,
        fields: CompletedFields,
    ) -> Result<WorkItem, TransitionError> {
        match self.store.update_completed(id, &fields).await? {
            Some(item) => {
                info!(item_id = id, status = %item.status, "work item finished");
                Ok(item)
            }
            None => {
                self.get(id).await?;
                Err(TransitionError::NotProcessing)
            }
        }
    }

    /// Deletes an item that is still awaiting payment.
    pub async fn cancel(&self, id: i64) -> Result<(), TransitionError> {
        if self.store.delete_pending(id).await? {
            info!(item_id = id, "work item canceled");
            return Ok(());
        }
        self.get(id).await?;
        Err(TransitionError::NotCancelable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{ExecutionResult, WorkStatus};
    use crate::store::tests::{memory_store, new_item};
    use crate::store::SqliteBackend;

    async fn lifecycle() -> WorkItemLifecycle<SqliteBackend> {
        WorkItemLifecycle::new(memory_store().await)
    }

    fn ok_result() -> ExecutionResult {
        ExecutionResult {
            success: true,
            output: "all done".into(),
            error: None,
        }
    }

    #[tokio::test]
    async fn happy_path_walks_all_states() {
        let lc = lifecycle().await;
        let item = lc.create(&new_item(Some(1), 10)).await.unwrap();
        let mut seen = vec![item.status];

        let item = lc.mark_paid(item.id, PaidFields::now("sig", 0.01)).await.unwrap();
        seen.push(item.status);
        let item = lc.claim(item.id).await.unwrap();
        seen.push(item.status);
        let item = lc.complete(item.id, CompletedFields::now(ok_result())).await.unwrap();
        seen.push(item.status);

        assert_eq!(
            seen,
            vec![
                WorkStatus::PendingPayment,
                WorkStatus::Paid,
                WorkStatus::Processing,
                WorkStatus::Completed
            ]
        );
        assert!(item.timestamps_consistent());
        assert_eq!(item.result, Some(ok_result()));
    }

    #[tokio::test]
    async fn failed_execution_lands_in_failed() {
        let lc = lifecycle().await;
        let item = lc.create(&new_item(None, 1)).await.unwrap();
        lc.mark_paid(item.id, PaidFields::now("s", 1.0)).await.unwrap();
        lc.claim(item.id).await.unwrap();
        let done = lc
            .complete(item.id, CompletedFields::now(ExecutionResult::not_started("boom")))
            .await
            .unwrap();
        assert_eq!(done.status, WorkStatus::Failed);
    }

    #[tokio::test]
    async fn mark_paid_twice_is_already_paid() {
        let lc = lifecycle().await;
        let item = lc.create(&new_item(None, 1)).await.unwrap();
        lc.mark_paid(item.id, PaidFields::now("s1", 1.0)).await.unwrap();

        let err = lc.mark_paid(item.id, PaidFields::now("s2", 1.0)).await.unwrap_err();
        assert!(matches!(err, TransitionError::AlreadyPaid));
        let stored = lc.get(item.id).await.unwrap();
        assert_eq!(stored.transaction_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn same_transaction_on_second_item_is_rejected() {
        let lc = lifecycle().await;
        let first = lc.create(&new_item(None, 10)).await.unwrap();
        let second = lc.create(&new_item(None, 10)).await.unwrap();

        lc.mark_paid(first.id, PaidFields::now("dup", 0.5)).await.unwrap();
        let err = lc.mark_paid(second.id, PaidFields::now("dup", 0.5)).await.unwrap_err();
        assert!(matches!(err, TransitionError::DuplicateTransaction));

        let first = lc.get(first.id).await.unwrap();
        assert_eq!(first.status, WorkStatus::Paid);
        assert_eq!(first.transaction_id.as_deref(), Some("dup"));
        let second = lc.get(second.id).await.unwrap();
        assert_eq!(second.status, WorkStatus::PendingPayment);
        assert!(second.transaction_id.is_none());
    }

    #[tokio::test]
    async fn claim_on_pending_item_is_not_claimable() {
        let lc = lifecycle().await;
        let item = lc.create(&new_item(None, 1)).await.unwrap();

        let err = lc.claim(item.id).await.unwrap_err();
        assert!(matches!(err, TransitionError::NotClaimable));
        assert_eq!(lc.get(item.id).await.unwrap().status, WorkStatus::PendingPayment);
    }

    #[tokio::test]
    async fn second_claim_is_not_claimable() {
        let lc = lifecycle().await;
        let item = lc.create(&new_item(None, 1)).await.unwrap();
        lc.mark_paid(item.id, PaidFields::now("s", 1.0)).await.unwrap();

        let first = lc.claim(item.id).await.unwrap();
        let err = lc.claim(item.id).await.unwrap_err();
        assert!(matches!(err, TransitionError::NotClaimable));
        assert_eq!(lc.get(item.id).await.unwrap().started_at, first.started_at);
    }

    #[tokio::test]
    async fn complete_requires_processing() {
        let lc = lifecycle().await;
        let item = lc.create(&new_item(None, 1)).await.unwrap();
        lc.mark_paid(item.id, PaidFields::now("s", 1.0)).await.unwrap();

        let err = lc.complete(item.id, CompletedFields::now(ok_result())).await.unwrap_err();
        assert!(matches!(err, TransitionError::NotProcessing));

        lc.claim(item.id).await.unwrap();
        lc.complete(item.id, CompletedFields::now(ok_result())).await.unwrap();
        let err = lc.complete(item.id, CompletedFields::now(ok_result())).await.unwrap_err();
        assert!(matches!(err, TransitionError::NotProcessing));
    }

    #[tokio::test]
    async fn cancel_only_while_pending() {
        let lc = lifecycle().await;
        let pending = lc.create(&new_item(None, 1)).await.unwrap();
        lc.cancel(pending.id).await.unwrap();
        assert!(matches!(
            lc.get(pending.id).await.unwrap_err(),
            TransitionError::NotFound(_)
        ));

        let paid = lc.create(&new_item(None, 1)).await.unwrap();
        lc.mark_paid(paid.id, PaidFields::now("s", 1.0)).await.unwrap();
        let err = lc.cancel(paid.id).await.unwrap_err();
        assert!(matches!(err, TransitionError::NotCancelable));
        assert_eq!(lc.get(paid.id).await.unwrap().status, WorkStatus::Paid);
    }

    #[tokio::test]
    async fn transitions_on_missing_item_are_not_found() {
        let lc = lifecycle().await;
        assert!(matches!(lc.claim(404).await.unwrap_err(), TransitionError::NotFound(404)));
        assert!(matches!(
            lc.mark_paid(404, PaidFields::now("s", 1.0)).await.unwrap_err(),
            TransitionError::NotFound(404)
        ));
        assert!(matches!(lc.cancel(404).await.unwrap_err(), TransitionError::NotFound(404)));
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("race.db")).await.unwrap();
        let store = WorkItemStore::new(backend);
        store.bootstrap().await.unwrap();
        let lc = WorkItemLifecycle::new(store);

        for round in 0..10 {
            let item = lc.create(&new_item(None, 1)).await.unwrap();
            lc.mark_paid(item.id, PaidFields::now(format!("race-{round}"), 1.0))
                .await
                .unwrap();

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let lc = lc.clone();
                    tokio::spawn(async move { lc.claim(item.id).await })
                })
                .collect();

            let mut wins = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(_) => wins += 1,
                    Err(TransitionError::NotClaimable) => {}
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }
            assert_eq!(wins, 1, "round {round}");
        }
    }

    #[tokio::test]
    async fn observed_statuses_never_move_backwards() {
        let lc = lifecycle().await;
        let item = lc.create(&new_item(None, 1)).await.unwrap();
        let mut last = item.status.rank();

        for step in 0..8 {
            let _ = match step % 4 {
                0 => lc.claim(item.id).await.map(|_| ()),
                1 => lc.mark_paid(item.id, PaidFields::now("m", 1.0)).await.map(|_| ()),
                2 => lc.complete(item.id, CompletedFields::now(ok_result())).await.map(|_| ()),
                _ => lc.cancel(item.id).await,
            };
            let now = lc.get(item.id).await.unwrap();
            assert!(now.status.rank() >= last);
            assert!(now.timestamps_consistent());
            last = now.status.rank();
        }
        assert_eq!(lc.get(item.id).await.unwrap().status, WorkStatus::Completed);
    }
}
