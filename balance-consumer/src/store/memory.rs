use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{BalanceStore, BalanceTransaction, MessagePosition};
use crate::error::StoreError;

#[derive(Default)]
struct State {
    balances: HashMap<String, i64>,
    positions: HashMap<(String, i32), i64>,
}

/// Process-local store. A transaction holds the whole store for its lifetime, so concurrent
/// transactions are applied one after another.
#[derive(Clone, Default)]
pub struct MemoryBalanceStore {
    state: Arc<Mutex<State>>,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balances<I, K>(balances: I) -> Self
    where
        I: IntoIterator<Item = (K, i64)>,
        K: Into<String>,
    {
        let state = State {
            balances: balances.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            positions: HashMap::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Number of accounts currently stored.
    pub async fn len(&self) -> usize {
        self.state.lock().await.balances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn begin(&self) -> Result<Box<dyn BalanceTransaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            balances: HashMap::new(),
            positions: HashMap::new(),
        }))
    }

    async fn balance(&self, account_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.state.lock().await.balances.get(account_id).copied())
    }
}

/// Writes are staged next to the held state and only folded in on commit.
struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    balances: HashMap<String, i64>,
    positions: HashMap<(String, i32), i64>,
}

impl MemoryTransaction {
    fn current(&self, account_id: &str) -> Option<i64> {
        self.balances
            .get(account_id)
            .or_else(|| self.guard.balances.get(account_id))
            .copied()
    }
}

#[async_trait]
impl BalanceTransaction for MemoryTransaction {
    async fn lock_balance(&mut self, account_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.current(account_id))
    }

    async fn adjust_balance(
        &mut self,
        account_id: &str,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        let Some(balance) = self.current(account_id) else {
            return Ok(None);
        };
        let updated = balance.saturating_add(delta);
        self.balances.insert(account_id.to_owned(), updated);
        Ok(Some(updated))
    }

    async fn insert_balance(
        &mut self,
        account_id: &str,
        balance: i64,
    ) -> Result<bool, StoreError> {
        if self.current(account_id).is_some() {
            return Ok(false);
        }
        self.balances.insert(account_id.to_owned(), balance);
        Ok(true)
    }

    async fn claim_position(&mut self, position: &MessagePosition) -> Result<bool, StoreError> {
        let key = (position.topic.clone(), position.partition);
        let recorded = self
            .positions
            .get(&key)
            .or_else(|| self.guard.positions.get(&key))
            .copied();
        if recorded.is_some_and(|last| last >= position.offset) {
            return Ok(false);
        }
        self.positions.insert(key, position.offset);
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut guard,
            balances,
            positions,
        } = *self;
        guard.balances.extend(balances);
        guard.positions.extend(positions);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
