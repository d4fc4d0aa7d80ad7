//! Durable work-item records.
//!
//! [`WorkItemStore`] is the single source of truth for item state. Every
//! state-changing method is one conditional statement (`UPDATE … WHERE
//! status = ? RETURNING …`), so the guard and the write are atomic against
//! the database: `None` means the guard did not hold at write time.

mod backend;
mod error;
mod remote;
mod sqlite;

pub use backend::{AnyBackend, FromSql, SqlBackend, SqlRow, SqlValue};
pub use error::StoreError;
pub use remote::RemoteBackend;
pub use sqlite::SqliteBackend;

use chrono::{DateTime, Utc};

use crate::state_machine::{
    ClaimFields, CompletedFields, ExecutionResult, NewWorkItem, PaidFields, WorkItem, WorkStatus,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT UNIQUE NOT NULL,
        password_hash TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id),
        expires_at TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS work_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER,
        email TEXT NOT NULL,
        max_minutes INTEGER NOT NULL CHECK (max_minutes > 0),
        task_description TEXT NOT NULL,
        cost_fiat REAL NOT NULL,
        expected_amount REAL,
        payment_address TEXT NOT NULL,
        transaction_id TEXT UNIQUE,
        received_amount REAL,
        status TEXT NOT NULL DEFAULT 'pending_payment'
            CHECK (status IN ('pending_payment', 'paid', 'processing', 'completed', 'failed')),
        created_at TEXT NOT NULL,
        paid_at TEXT,
        started_at TEXT,
        completed_at TEXT,
        result TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status)",
    "CREATE INDEX IF NOT EXISTS idx_work_items_payment ON work_items(payment_address, status)",
    "CREATE INDEX IF NOT EXISTS idx_work_items_user ON work_items(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
];

const COLUMNS: &str = "id, user_id, email, max_minutes, task_description, cost_fiat, \
    expected_amount, payment_address, transaction_id, received_amount, status, \
    created_at, paid_at, started_at, completed_at, result";

#[derive(Clone)]
pub struct WorkItemStore<B> {
    backend: B,
}

impl<B: SqlBackend> WorkItemStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Creates tables and indexes if they do not exist yet.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            self.backend.execute(statement, &[]).await?;
        }
        Ok(())
    }

    pub async fn create(
        &self,
        new: &NewWorkItem,
        created_at: DateTime<Utc>,
    ) -> Result<WorkItem, StoreError> {
        let sql = format!(
            "INSERT INTO work_items (user_id, email, max_minutes, task_description, cost_fiat, \
             payment_address, status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
        );
        let rows = self
            .backend
            .execute(
                &sql,
                &[
                    new.user_id.into(),
                    new.email.as_str().into(),
                    new.max_minutes.into(),
                    new.task_description.as_str().into(),
                    new.cost_fiat.into(),
                    new.payment_address.as_str().into(),
                    WorkStatus::PendingPayment.as_str().into(),
                    created_at.into(),
                ],
            )
            .await?;
        single(rows)?.ok_or_else(|| StoreError::Decode("insert returned no row".into()))
    }

    pub async fn get(&self, id: i64) -> Result<Option<WorkItem>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM work_items WHERE id = ?");
        single(self.backend.execute(&sql, &[id.into()]).await?)
    }

    /// Newest first.
    pub async fn list_by_user(&self, user_id: i64) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM work_items WHERE user_id = ? ORDER BY created_at DESC, id DESC"
        );
        many(self.backend.execute(&sql, &[user_id.into()]).await?)
    }

    pub async fn list_by_user_and_statuses(
        &self,
        user_id: i64,
        statuses: &[WorkStatus],
    ) -> Result<Vec<WorkItem>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {COLUMNS} FROM work_items WHERE user_id = ? AND status IN ({placeholders}) \
             ORDER BY created_at DESC, id DESC"
        );
        let mut params: Vec<SqlValue> = vec![user_id.into()];
        params.extend(statuses.iter().map(|s| SqlValue::from(s.as_str())));
        many(self.backend.execute(&sql, &params).await?)
    }

    /// The work queue: paid items, oldest payment first.
    pub async fn list_paid(&self) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM work_items WHERE status = ? ORDER BY paid_at ASC, id ASC"
        );
        many(
            self.backend
                .execute(&sql, &[WorkStatus::Paid.as_str().into()])
                .await?,
        )
    }

    /// Locked amounts of the other items still waiting for payment at
    /// `payment_address`.
    pub async fn pending_amounts_except(
        &self,
        payment_address: &str,
        id: i64,
    ) -> Result<Vec<f64>, StoreError> {
        let rows = self
            .backend
            .execute(
                "SELECT expected_amount FROM work_items \
                 WHERE payment_address = ? AND status = ? AND id <> ? \
                 AND expected_amount IS NOT NULL",
                &[
                    payment_address.into(),
                    WorkStatus::PendingPayment.as_str().into(),
                    id.into(),
                ],
            )
            .await?;
        rows.iter().map(|row| row.get("expected_amount")).collect()
    }

    pub async fn transaction_used(&self, transaction_id: &str) -> Result<bool, StoreError> {
        let rows = self
            .backend
            .execute(
                "SELECT id FROM work_items WHERE transaction_id = ?",
                &[transaction_id.into()],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Write-once: returns `None` if the amount was already recorded.
    pub async fn record_expected_amount(
        &self,
        id: i64,
        amount: f64,
    ) -> Result<Option<WorkItem>, StoreError> {
        let sql = format!(
            "UPDATE work_items SET expected_amount = ? \
             WHERE id = ? AND expected_amount IS NULL RETURNING {COLUMNS}"
        );
        single(self.backend.execute(&sql, &[amount.into(), id.into()]).await?)
    }

    /// `pending_payment → paid`. A transaction id already recorded on any
    /// item fails with [`StoreError::UniqueViolation`].
    pub async fn update_paid(
        &self,
        id: i64,
        fields: &PaidFields,
    ) -> Result<Option<WorkItem>, StoreError> {
        let sql = format!(
            "UPDATE work_items SET status = ?, transaction_id = ?, received_amount = ?, paid_at = ? \
             WHERE id = ? AND status = ? RETURNING {COLUMNS}"
        );
        let rows = self
            .backend
            .execute(
                &sql,
                &[
                    WorkStatus::Paid.as_str().into(),
                    fields.transaction_id.as_str().into(),
                    fields.amount.into(),
                    fields.paid_at.into(),
                    id.into(),
                    WorkStatus::PendingPayment.as_str().into(),
                ],
            )
            .await?;
        single(rows)
    }

    /// `paid → processing`.
    pub async fn update_claimed(
        &self,
        id: i64,
        fields: &ClaimFields,
    ) -> Result<Option<WorkItem>, StoreError> {
        let sql = format!(
            "UPDATE work_items SET status = ?, started_at = ? \
             WHERE id = ? AND status = ? RETURNING {COLUMNS}"
        );
        let rows = self
            .backend
            .execute(
                &sql,
                &[
                    WorkStatus::Processing.as_str().into(),
                    fields.started_at.into(),
                    id.into(),
                    WorkStatus::Paid.as_str().into(),
                ],
            )
            .await?;
        single(rows)
    }

    /// `processing → completed | failed`.
    pub async fn update_completed(
        &self,
        id: i64,
        fields: &CompletedFields,
    ) -> Result<Option<WorkItem>, StoreError> {
        let blob = serde_json::to_string(&fields.result)?;
        let sql = format!(
            "UPDATE work_items SET status = ?, completed_at = ?, result = ? \
             WHERE id = ? AND status = ? RETURNING {COLUMNS}"
        );
        let rows = self
            .backend
            .execute(
                &sql,
                &[
                    fields.status().as_str().into(),
                    fields.completed_at.into(),
                    blob.into(),
                    id.into(),
                    WorkStatus::Processing.as_str().into(),
                ],
            )
            .await?;
        single(rows)
    }

    /// Removes the item only while it is still `pending_payment`.
    pub async fn delete_pending(&self, id: i64) -> Result<bool, StoreError> {
        let rows = self
            .backend
            .execute(
                "DELETE FROM work_items WHERE id = ? AND status = ? RETURNING id",
                &[id.into(), WorkStatus::PendingPayment.as_str().into()],
            )
            .await?;
        Ok(!rows.is_empty())
    }
}

fn item_from_row(row: &SqlRow) -> Result<WorkItem, StoreError> {
    let status: String = row.get("status")?;
    let result = row
        .get::<Option<String>>("result")?
        .map(|blob| serde_json::from_str::<ExecutionResult>(&blob))
        .transpose()?;

    Ok(WorkItem {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        email: row.get("email")?,
        max_minutes: row.get("max_minutes")?,
        task_description: row.get("task_description")?,
        cost_fiat: row.get("cost_fiat")?,
        expected_amount: row.get("expected_amount")?,
        payment_address: row.get("payment_address")?,
        transaction_id: row.get("transaction_id")?,
        received_amount: row.get("received_amount")?,
        status: status
            .parse()
            .map_err(|e| StoreError::Decode(format!("{e}")))?,
        created_at: row.get("created_at")?,
        paid_at: row.get("paid_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        result,
    })
}

fn single(rows: Vec<SqlRow>) -> Result<Option<WorkItem>, StoreError> {
    rows.first().map(item_from_row).transpose()
}

fn many(rows: Vec<SqlRow>) -> Result<Vec<WorkItem>, StoreError> {
    rows.iter().map(item_from_row).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) async fn memory_store() -> WorkItemStore<SqliteBackend> {
        let store = WorkItemStore::new(SqliteBackend::in_memory().await.unwrap());
        store.bootstrap().await.unwrap();
        store
    }

    pub(crate) fn new_item(user_id: Option<i64>, minutes: u32) -> NewWorkItem {
        NewWorkItem {
            user_id,
            email: "dev@example.com".into(),
            max_minutes: minutes,
            task_description: "Build a todo app".into(),
            cost_fiat: f64::from(minutes) * 0.10,
            payment_address: "WaLLet111".into(),
        }
    }

    #[tokio::test]
    async fn create_starts_pending_with_null_facts() {
        let store = memory_store().await;
        let item = store.create(&new_item(Some(1), 10), Utc::now()).await.unwrap();

        assert_eq!(item.status, WorkStatus::PendingPayment);
        assert_eq!(item.max_minutes, 10);
        assert!((item.cost_fiat - 1.0).abs() < 1e-9);
        assert!(item.transaction_id.is_none());
        assert!(item.expected_amount.is_none());
        assert!(item.paid_at.is_none() && item.started_at.is_none() && item.completed_at.is_none());
        assert!(item.result.is_none());
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_not_reused() {
        let store = memory_store().await;
        let a = store.create(&new_item(None, 1), Utc::now()).await.unwrap();
        assert!(store.delete_pending(a.id).await.unwrap());
        let b = store.create(&new_item(None, 1), Utc::now()).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let store = memory_store().await;
        store.bootstrap().await.unwrap();
    }

    #[tokio::test]
    async fn expected_amount_is_write_once() {
        let store = memory_store().await;
        let item = store.create(&new_item(None, 5), Utc::now()).await.unwrap();

        let first = store.record_expected_amount(item.id, 0.0051).await.unwrap();
        assert_eq!(first.unwrap().expected_amount, Some(0.0051));

        let second = store.record_expected_amount(item.id, 0.9).await.unwrap();
        assert!(second.is_none());
        let stored = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.expected_amount, Some(0.0051));
    }

    #[tokio::test]
    async fn conditional_updates_only_fire_from_the_guarded_status() {
        let store = memory_store().await;
        let item = store.create(&new_item(None, 5), Utc::now()).await.unwrap();

        assert!(store.update_claimed(item.id, &ClaimFields::now()).await.unwrap().is_none());
        let paid = store
            .update_paid(item.id, &PaidFields::now("sig-1", 0.5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paid.status, WorkStatus::Paid);
        assert_eq!(paid.transaction_id.as_deref(), Some("sig-1"));
        assert_eq!(paid.received_amount, Some(0.5));

        assert!(store
            .update_paid(item.id, &PaidFields::now("sig-2", 0.5))
            .await
            .unwrap()
            .is_none());
        assert!(!store.delete_pending(item.id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_transaction_hits_unique_constraint() {
        let store = memory_store().await;
        let a = store.create(&new_item(None, 5), Utc::now()).await.unwrap();
        let b = store.create(&new_item(None, 5), Utc::now()).await.unwrap();

        store.update_paid(a.id, &PaidFields::now("sig", 0.5)).await.unwrap();
        let err = store
            .update_paid(b.id, &PaidFields::now("sig", 0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
        assert!(store.transaction_used("sig").await.unwrap());
        assert!(!store.transaction_used("other").await.unwrap());
    }

    #[tokio::test]
    async fn result_blob_round_trips() {
        let store = memory_store().await;
        let item = store.create(&new_item(None, 5), Utc::now()).await.unwrap();
        store.update_paid(item.id, &PaidFields::now("s", 1.0)).await.unwrap();
        store.update_claimed(item.id, &ClaimFields::now()).await.unwrap();

        let result = ExecutionResult {
            success: false,
            output: "partial".into(),
            error: Some("killed".into()),
        };
        let done = store
            .update_completed(item.id, &CompletedFields::now(result.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, WorkStatus::Failed);
        assert_eq!(done.result, Some(result));
        assert!(done.timestamps_consistent());
    }

    #[tokio::test]
    async fn listing_filters_and_orders() {
        let store = memory_store().await;
        let base = Utc::now();
        let older = store.create(&new_item(Some(1), 1), base).await.unwrap();
        let newer = store
            .create(&new_item(Some(1), 2), base + Duration::seconds(5))
            .await
            .unwrap();
        store.create(&new_item(Some(2), 3), base).await.unwrap();

        let mine = store.list_by_user(1).await.unwrap();
        assert_eq!(
            mine.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![newer.id, older.id]
        );

        store.update_paid(older.id, &PaidFields::now("x", 1.0)).await.unwrap();
        let paid = store
            .list_by_user_and_statuses(1, &[WorkStatus::Paid, WorkStatus::Processing])
            .await
            .unwrap();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].id, older.id);
        assert!(store.list_by_user_and_statuses(1, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_amounts_cover_other_unpaid_items_only() {
        let store = memory_store().await;
        let me = store.create(&new_item(None, 1), Utc::now()).await.unwrap();
        let other = store.create(&new_item(None, 1), Utc::now()).await.unwrap();
        let paid = store.create(&new_item(None, 1), Utc::now()).await.unwrap();
        let unquoted = store.create(&new_item(None, 1), Utc::now()).await.unwrap();
        for (item, amount) in [(&me, 0.1), (&other, 0.2), (&paid, 0.3)] {
            store.record_expected_amount(item.id, amount).await.unwrap();
        }
        store
            .update_paid(paid.id, &PaidFields { transaction_id: "p".into(), amount: 0.3, paid_at: Utc::now() })
            .await
            .unwrap();

        let amounts = store.pending_amounts_except("WaLLet111", me.id).await.unwrap();
        assert_eq!(amounts, vec![0.2]);
        assert!(store.pending_amounts_except("Elsewhere", me.id).await.unwrap().is_empty());
        assert!(store.get(unquoted.id).await.unwrap().unwrap().expected_amount.is_none());
    }

    #[tokio::test]
    async fn paid_queue_is_oldest_payment_first() {
        let store = memory_store().await;
        let a = store.create(&new_item(None, 1), Utc::now()).await.unwrap();
        let b = store.create(&new_item(None, 1), Utc::now()).await.unwrap();
        let now = Utc::now();
        store
            .update_paid(b.id, &PaidFields { transaction_id: "b".into(), amount: 1.0, paid_at: now })
            .await
            .unwrap();
        store
            .update_paid(
                a.id,
                &PaidFields {
                    transaction_id: "a".into(),
                    amount: 1.0,
                    paid_at: now + Duration::seconds(1),
                },
            )
            .await
            .unwrap();

        let queue = store.list_paid().await.unwrap();
        assert_eq!(queue.iter().map(|i| i.id).collect::<Vec<_>>(), vec![b.id, a.id]);
    }
}
