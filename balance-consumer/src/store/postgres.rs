use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use super::{BalanceStore, BalanceTransaction, MessagePosition};
use crate::error::StoreError;

/// Balances kept in the `balances` table of a PostgreSQL database.
///
/// Transactions run at the default READ COMMITTED isolation level; serializability per account
/// comes from row locks: balances are read with `FOR UPDATE` and updated relative to the locked
/// value, and new accounts go through `ON CONFLICT DO NOTHING`.
#[derive(Clone)]
pub struct PgBalanceStore {
    pool: PgPool,
}

impl PgBalanceStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl BalanceStore for PgBalanceStore {
    async fn begin(&self) -> Result<Box<dyn BalanceTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgBalanceTransaction { tx }))
    }

    async fn balance(&self, account_id: &str) -> Result<Option<i64>, StoreError> {
        let balance = sqlx::query_scalar("SELECT balance FROM balances WHERE id_account = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance)
    }
}

struct PgBalanceTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BalanceTransaction for PgBalanceTransaction {
    async fn lock_balance(&mut self, account_id: &str) -> Result<Option<i64>, StoreError> {
        let balance = sqlx::query_scalar(
            "SELECT balance FROM balances WHERE id_account = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(balance)
    }

    async fn adjust_balance(
        &mut self,
        account_id: &str,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        let balance = sqlx::query_scalar(
            r#"
UPDATE balances
SET balance = balance + $2
WHERE id_account = $1
RETURNING balance
            "#,
        )
        .bind(account_id)
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(balance)
    }

    async fn insert_balance(
        &mut self,
        account_id: &str,
        balance: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
INSERT INTO balances (id_account, balance)
VALUES ($1, $2)
ON CONFLICT (id_account) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(balance)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_position(&mut self, position: &MessagePosition) -> Result<bool, StoreError> {
        // The upsert only touches the row when the offset moves forward, so an already applied
        // position reports zero affected rows.
        let result = sqlx::query(
            r#"
INSERT INTO applied_offsets (topic, kafka_partition, last_offset)
VALUES ($1, $2, $3)
ON CONFLICT (topic, kafka_partition) DO UPDATE
SET last_offset = EXCLUDED.last_offset
WHERE applied_offsets.last_offset < EXCLUDED.last_offset
            "#,
        )
        .bind(&position.topic)
        .bind(position.partition)
        .bind(position.offset)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
