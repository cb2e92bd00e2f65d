//! Durable account balances.
//!
//! Every balance transition runs inside one [`BalanceTransaction`]. Implementations must make
//! transactions touching the same account serializable: partitions are consumed concurrently
//! and nothing routes an account's events to a single partition, so the store is the only
//! thing preventing lost updates. Dropping a transaction without committing rolls it back.

use async_trait::async_trait;

use crate::error::StoreError;

mod memory;
mod postgres;

pub use memory::MemoryBalanceStore;
pub use postgres::PgBalanceStore;

/// Where a message sits in the broker log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessagePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait BalanceStore: Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn BalanceTransaction>, StoreError>;

    /// Committed balance of an account, outside of any transaction.
    async fn balance(&self, account_id: &str) -> Result<Option<i64>, StoreError>;
}

#[async_trait]
pub trait BalanceTransaction: Send {
    /// Read a balance and hold the account for update until the transaction ends.
    async fn lock_balance(&mut self, account_id: &str) -> Result<Option<i64>, StoreError>;

    /// Add `delta` to an existing balance, returning the new value, or `None` if the account
    /// doesn't exist.
    async fn adjust_balance(
        &mut self,
        account_id: &str,
        delta: i64,
    ) -> Result<Option<i64>, StoreError>;

    /// Insert a new account. Returns false, writing nothing, if the account already exists.
    async fn insert_balance(&mut self, account_id: &str, balance: i64)
        -> Result<bool, StoreError>;

    /// Record `position` as the newest applied message of its partition. Returns false if an
    /// equal or later offset was already recorded.
    async fn claim_position(&mut self, position: &MessagePosition) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
