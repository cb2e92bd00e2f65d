use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use balance_consumer::error::{ApplyError, StoreError};
use balance_consumer::events::{BalanceEvent, InitialBalanceEvent, TransferEvent};
use balance_consumer::processor::{Applied, BalanceProcessor};
use balance_consumer::retry::RetryPolicy;
use balance_consumer::store::{
    BalanceStore, BalanceTransaction, MemoryBalanceStore, MessagePosition,
};

fn processor(store: &MemoryBalanceStore) -> BalanceProcessor {
    BalanceProcessor::new(Arc::new(store.clone()), RetryPolicy::no_retries())
}

fn transfer(from: &str, to: &str, amount: i64) -> TransferEvent {
    TransferEvent {
        from_account_id: from.to_string(),
        to_account_id: to.to_string(),
        amount,
    }
}

fn initial_balance(id: &str, balance: i64) -> InitialBalanceEvent {
    InitialBalanceEvent {
        account_id: id.to_string(),
        initial_balance: balance,
    }
}

fn position(offset: i64) -> MessagePosition {
    MessagePosition {
        topic: "transaction_ledger".to_string(),
        partition: 0,
        offset,
    }
}

async fn balance(store: &MemoryBalanceStore, id: &str) -> Option<i64> {
    store.balance(id).await.unwrap()
}

#[tokio::test]
async fn test_transfer_moves_funds() {
    let store = MemoryBalanceStore::new();
    let processor = processor(&store);

    processor
        .apply_initial_balance(&initial_balance("A", 500))
        .await
        .unwrap();
    processor
        .apply_initial_balance(&initial_balance("B", 0))
        .await
        .unwrap();

    let applied = processor.apply_transfer(&transfer("A", "B", 200)).await.unwrap();

    assert_eq!(
        applied,
        Applied::Transferred {
            from_balance: 300,
            to_balance: 200
        }
    );
    assert_eq!(balance(&store, "A").await, Some(300));
    assert_eq!(balance(&store, "B").await, Some(200));

    let err = processor
        .apply_transfer(&transfer("A", "B", 1_000))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::InsufficientFunds { .. }));
    assert_eq!(balance(&store, "A").await, Some(300));
    assert_eq!(balance(&store, "B").await, Some(200));
}

#[tokio::test]
async fn test_transfers_conserve_the_total() {
    let store = MemoryBalanceStore::with_balances([("a", 1_000), ("b", 250), ("c", 0)]);
    let processor = processor(&store);

    let transfers = [
        transfer("a", "b", 300),
        transfer("b", "c", 500),
        transfer("c", "a", 1),
        transfer("c", "missing", 1),
        transfer("b", "a", 10_000),
    ];
    for event in &transfers {
        // Rejections are part of the scenario
        if let Err(e) = processor.apply_transfer(event).await {
            assert!(e.is_rejection());
        }
    }

    let total: i64 = [
        balance(&store, "a").await.unwrap(),
        balance(&store, "b").await.unwrap(),
        balance(&store, "c").await.unwrap(),
    ]
    .iter()
    .sum();
    assert_eq!(total, 1_250);
    assert_eq!(balance(&store, "missing").await, None);
}

#[tokio::test]
async fn test_insufficient_funds_changes_nothing() {
    let store = MemoryBalanceStore::with_balances([("A", 100), ("B", 0)]);
    let processor = processor(&store);

    let err = processor
        .apply_transfer(&transfer("A", "B", 150))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ApplyError::InsufficientFunds {
            balance: 100,
            amount: 150,
            ..
        }
    ));
    assert!(err.is_rejection());
    assert_eq!(balance(&store, "A").await, Some(100));
    assert_eq!(balance(&store, "B").await, Some(0));
}

#[tokio::test]
async fn test_transfer_to_missing_account_keeps_sender_balance() {
    let store = MemoryBalanceStore::with_balances([("A", 100)]);
    let processor = processor(&store);

    let err = processor
        .apply_transfer(&transfer("A", "Z", 50))
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::AccountNotFound(ref id) if id == "Z"));
    assert_eq!(balance(&store, "A").await, Some(100));
    assert_eq!(balance(&store, "Z").await, None);
}

#[tokio::test]
async fn test_transfer_from_missing_account_is_rejected() {
    let store = MemoryBalanceStore::with_balances([("B", 7)]);
    let processor = processor(&store);

    let err = processor
        .apply_transfer(&transfer("Z", "B", 1))
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::AccountNotFound(ref id) if id == "Z"));
    assert_eq!(balance(&store, "B").await, Some(7));
}

#[tokio::test]
async fn test_non_positive_amounts_are_rejected() {
    let store = MemoryBalanceStore::with_balances([("A", 100), ("B", 100)]);
    let processor = processor(&store);

    for amount in [0, -50] {
        let err = processor
            .apply_transfer(&transfer("A", "B", amount))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::InvalidAmount(a) if a == amount));
    }
    assert_eq!(balance(&store, "A").await, Some(100));
    assert_eq!(balance(&store, "B").await, Some(100));
}

#[tokio::test]
async fn test_credit_overflow_is_rejected() {
    let store = MemoryBalanceStore::with_balances([("A", 10), ("B", i64::MAX - 5)]);
    let processor = processor(&store);

    let err = processor
        .apply_transfer(&transfer("A", "B", 10))
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::BalanceOverflow { .. }));
    assert_eq!(balance(&store, "A").await, Some(10));
    assert_eq!(balance(&store, "B").await, Some(i64::MAX - 5));
}

#[tokio::test]
async fn test_transfer_to_self_is_neutral() {
    let store = MemoryBalanceStore::with_balances([("A", 100)]);
    let processor = processor(&store);

    processor.apply_transfer(&transfer("A", "A", 60)).await.unwrap();
    assert_eq!(balance(&store, "A").await, Some(100));

    // Still bounded by the balance
    let err = processor
        .apply_transfer(&transfer("A", "A", 101))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::InsufficientFunds { .. }));
}

#[tokio::test]
async fn test_initial_balance_is_applied_once() {
    let store = MemoryBalanceStore::new();
    let processor = processor(&store);

    let applied = processor
        .apply_initial_balance(&initial_balance("C", 1_000))
        .await
        .unwrap();
    assert_eq!(applied, Applied::Initialized { balance: 1_000 });

    let err = processor
        .apply_initial_balance(&initial_balance("C", 5))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::DuplicateAccount(ref id) if id == "C"));
    assert_eq!(balance(&store, "C").await, Some(1_000));
}

#[tokio::test]
async fn test_negative_initial_balance_is_rejected() {
    let store = MemoryBalanceStore::new();
    let processor = processor(&store);

    let err = processor
        .apply_initial_balance(&initial_balance("D", -10))
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::InvalidBalance { balance: -10, .. }));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_zero_initial_balance_is_allowed() {
    let store = MemoryBalanceStore::new();
    let processor = processor(&store);

    processor
        .apply_initial_balance(&initial_balance("E", 0))
        .await
        .unwrap();
    assert_eq!(balance(&store, "E").await, Some(0));
}

#[tokio::test]
async fn test_replayed_position_is_skipped() {
    let store = MemoryBalanceStore::with_balances([("A", 500), ("B", 0)]);
    let processor = processor(&store);
    let event = BalanceEvent::Transfer(transfer("A", "B", 200));

    let first = processor.apply(&event, Some(&position(4))).await.unwrap();
    assert!(matches!(first, Applied::Transferred { .. }));

    // Redelivered, or an older offset of the same partition
    for offset in [4, 3] {
        let replay = processor
            .apply(&event, Some(&position(offset)))
            .await
            .unwrap();
        assert_eq!(replay, Applied::Replayed);
    }
    assert_eq!(balance(&store, "A").await, Some(300));

    // Without a position, the same event moves money again
    processor.apply(&event, None).await.unwrap();
    assert_eq!(balance(&store, "A").await, Some(100));
}

#[tokio::test]
async fn test_rejected_position_is_not_evaluated_again() {
    let store = MemoryBalanceStore::with_balances([("A", 100), ("B", 0)]);
    let processor = processor(&store);
    let event = BalanceEvent::Transfer(transfer("A", "B", 150));

    let err = processor
        .apply(&event, Some(&position(0)))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::InsufficientFunds { .. }));

    // Funds arrive later, but the rejected message stays rejected on replay
    let mut tx = store.begin().await.unwrap();
    tx.adjust_balance("A", 100).await.unwrap();
    tx.commit().await.unwrap();

    let replay = processor.apply(&event, Some(&position(0))).await.unwrap();
    assert_eq!(replay, Applied::Replayed);
    assert_eq!(balance(&store, "A").await, Some(200));
    assert_eq!(balance(&store, "B").await, Some(0));
}

/// Fails the first `failures` transactions before handing out real ones.
struct FlakyStore {
    inner: MemoryBalanceStore,
    failures: u32,
    attempts: AtomicU32,
}

impl FlakyStore {
    fn new(inner: MemoryBalanceStore, failures: u32) -> Self {
        Self {
            inner,
            failures,
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl BalanceStore for FlakyStore {
    async fn begin(&self) -> Result<Box<dyn BalanceTransaction>, StoreError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut));
        }
        self.inner.begin().await
    }

    async fn balance(&self, account_id: &str) -> Result<Option<i64>, StoreError> {
        self.inner.balance(account_id).await
    }
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        2,
        Duration::from_millis(1),
        Some(Duration::from_millis(5)),
        max_attempts,
    )
}

#[tokio::test]
async fn test_unavailable_store_is_retried() {
    let store = MemoryBalanceStore::with_balances([("A", 500), ("B", 0)]);
    let flaky = Arc::new(FlakyStore::new(store.clone(), 2));
    let processor = BalanceProcessor::new(flaky.clone(), fast_retries(3));

    processor.apply_transfer(&transfer("A", "B", 200)).await.unwrap();

    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(balance(&store, "B").await, Some(200));
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let store = MemoryBalanceStore::with_balances([("A", 500), ("B", 0)]);
    let flaky = Arc::new(FlakyStore::new(store.clone(), 10));
    let processor = BalanceProcessor::new(flaky.clone(), fast_retries(3));

    let err = processor
        .apply_transfer(&transfer("A", "B", 200))
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::StoreUnavailable(_)));
    assert!(!err.is_rejection());
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(balance(&store, "A").await, Some(500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opposing_transfers_conserve_funds() {
    let store = MemoryBalanceStore::with_balances([("A", 1_000), ("B", 1_000)]);
    let processor = Arc::new(processor(&store));

    let mut handles = Vec::new();
    for i in 0..200 {
        let processor = processor.clone();
        let event = if i % 2 == 0 {
            transfer("A", "B", 7)
        } else {
            transfer("B", "A", 11)
        };
        handles.push(tokio::spawn(async move {
            processor.apply_transfer(&event).await
        }));
    }
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) | Err(ApplyError::InsufficientFunds { .. }) => {}
            Err(e) => panic!("unexpected failure: {e}"),
        }
    }

    let a = balance(&store, "A").await.unwrap();
    let b = balance(&store, "B").await.unwrap();
    assert!(a >= 0 && b >= 0);
    assert_eq!(a + b, 2_000);
}
