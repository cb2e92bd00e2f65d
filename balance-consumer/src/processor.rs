//! Balance transitions: the business rules applied to each decoded event.
//!
//! Each transition runs as one store transaction. Every check happens before the first write,
//! so a rejected transition leaves nothing behind, and a failed commit leaves the previous
//! state untouched. Outcomes are derived from the current store state, never from the event
//! itself: re-applying an initialization is rejected as a duplicate, but re-applying a transfer
//! moves the money again unless the caller passes the message position (see
//! [`BalanceProcessor::apply`]).

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::ApplyError;
use crate::events::{BalanceEvent, InitialBalanceEvent, TransferEvent};
use crate::metrics_consts::{STORE_RETRIES, TRANSITION_TIME};
use crate::retry::RetryPolicy;
use crate::store::{BalanceStore, BalanceTransaction, MessagePosition};

/// A committed transition, or a message that had already been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Transferred { from_balance: i64, to_balance: i64 },
    Initialized { balance: i64 },
    Replayed,
}

#[derive(Clone, Copy)]
enum Transition<'a> {
    Transfer(&'a TransferEvent),
    Initialize(&'a InitialBalanceEvent),
}

impl Transition<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Transition::Transfer(_) => "transfer",
            Transition::Initialize(_) => "initial_balance",
        }
    }
}

pub struct BalanceProcessor {
    store: Arc<dyn BalanceStore>,
    retry_policy: RetryPolicy,
}

impl BalanceProcessor {
    pub fn new(store: Arc<dyn BalanceStore>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            retry_policy,
        }
    }

    /// Move `event.amount` from one account to the other, or change nothing.
    pub async fn apply_transfer(&self, event: &TransferEvent) -> Result<Applied, ApplyError> {
        self.run(Transition::Transfer(event), None).await
    }

    /// Create an account with its opening balance, or change nothing.
    pub async fn apply_initial_balance(
        &self,
        event: &InitialBalanceEvent,
    ) -> Result<Applied, ApplyError> {
        self.run(Transition::Initialize(event), None).await
    }

    /// Apply a decoded event. With a `position`, the store records it in the same transaction
    /// as the balance change, and a position that was already recorded is skipped with
    /// [`Applied::Replayed`] instead of being applied twice.
    pub async fn apply(
        &self,
        event: &BalanceEvent,
        position: Option<&MessagePosition>,
    ) -> Result<Applied, ApplyError> {
        let transition = match event {
            BalanceEvent::Transfer(e) => Transition::Transfer(e),
            BalanceEvent::InitialBalance(e) => Transition::Initialize(e),
        };
        self.run(transition, position).await
    }

    async fn run(
        &self,
        transition: Transition<'_>,
        position: Option<&MessagePosition>,
    ) -> Result<Applied, ApplyError> {
        let start = Instant::now();
        let mut attempt = 0;
        let result = loop {
            match self.attempt(transition, position).await {
                Err(ApplyError::StoreUnavailable(e)) if self.retry_policy.should_retry(attempt) => {
                    let wait = self.retry_policy.time_until_next_retry(attempt);
                    warn!(
                        attempt,
                        "Balance store unavailable: {}, retrying in {:?}", e, wait
                    );
                    metrics::counter!(STORE_RETRIES).increment(1);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                other => break other,
            }
        };
        metrics::histogram!(TRANSITION_TIME, "kind" => transition.kind())
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn attempt(
        &self,
        transition: Transition<'_>,
        position: Option<&MessagePosition>,
    ) -> Result<Applied, ApplyError> {
        let mut tx = self.store.begin().await?;

        if let Some(position) = position {
            if !tx.claim_position(position).await? {
                discard(tx).await;
                return Ok(Applied::Replayed);
            }
        }

        let result = match transition {
            Transition::Transfer(event) => transfer(tx.as_mut(), event).await,
            Transition::Initialize(event) => initialize(tx.as_mut(), event).await,
        };

        match result {
            Ok(applied) => {
                tx.commit().await?;
                Ok(applied)
            }
            Err(e) => {
                discard(tx).await;
                match position {
                    Some(position) if e.is_rejection() => self.record_rejected(position).await,
                    _ => {}
                }
                Err(e)
            }
        }
    }

    // A rejection is final for its message, so the position is recorded on its own once the
    // rejected transaction is gone. If this fails the message is simply evaluated again on
    // replay.
    async fn record_rejected(&self, position: &MessagePosition) {
        let recorded = async {
            let mut tx = self.store.begin().await?;
            tx.claim_position(position).await?;
            tx.commit().await
        };
        if let Err(e) = recorded.await {
            warn!(
                topic = position.topic.as_str(),
                partition = position.partition,
                offset = position.offset,
                "Failed to record position of rejected message: {}",
                e
            );
        }
    }
}

async fn discard(tx: Box<dyn BalanceTransaction>) {
    if let Err(e) = tx.rollback().await {
        // The connection drops the transaction anyway
        debug!("Rollback failed: {}", e);
    }
}

async fn transfer(
    tx: &mut dyn BalanceTransaction,
    event: &TransferEvent,
) -> Result<Applied, ApplyError> {
    let from_id = event.from_account_id.as_str();
    let to_id = event.to_account_id.as_str();

    if event.amount <= 0 {
        return Err(ApplyError::InvalidAmount(event.amount));
    }

    // Both rows are locked in id order, so two opposing transfers can't deadlock each other.
    let (from, to) = if from_id <= to_id {
        let from = tx.lock_balance(from_id).await?;
        let to = tx.lock_balance(to_id).await?;
        (from, to)
    } else {
        let to = tx.lock_balance(to_id).await?;
        let from = tx.lock_balance(from_id).await?;
        (from, to)
    };

    let from = from.ok_or_else(|| ApplyError::AccountNotFound(from_id.to_owned()))?;
    if from < event.amount {
        return Err(ApplyError::InsufficientFunds {
            account_id: from_id.to_owned(),
            balance: from,
            amount: event.amount,
        });
    }
    let to = to.ok_or_else(|| ApplyError::AccountNotFound(to_id.to_owned()))?;
    if from_id != to_id && to.checked_add(event.amount).is_none() {
        return Err(ApplyError::BalanceOverflow {
            account_id: to_id.to_owned(),
            amount: event.amount,
        });
    }

    // Relative updates keep a transfer to the same account balance neutral.
    let from_balance = tx
        .adjust_balance(from_id, -event.amount)
        .await?
        .ok_or_else(|| ApplyError::AccountNotFound(from_id.to_owned()))?;
    let to_balance = tx
        .adjust_balance(to_id, event.amount)
        .await?
        .ok_or_else(|| ApplyError::AccountNotFound(to_id.to_owned()))?;

    Ok(Applied::Transferred {
        from_balance,
        to_balance,
    })
}

async fn initialize(
    tx: &mut dyn BalanceTransaction,
    event: &InitialBalanceEvent,
) -> Result<Applied, ApplyError> {
    let account_id = event.account_id.as_str();

    if tx.lock_balance(account_id).await?.is_some() {
        return Err(ApplyError::DuplicateAccount(account_id.to_owned()));
    }

    if event.initial_balance < 0 {
        return Err(ApplyError::InvalidBalance {
            account_id: account_id.to_owned(),
            balance: event.initial_balance,
        });
    }

    // A concurrent initialization may have inserted the row since the check above.
    if !tx.insert_balance(account_id, event.initial_balance).await? {
        return Err(ApplyError::DuplicateAccount(account_id.to_owned()));
    }

    Ok(Applied::Initialized {
        balance: event.initial_balance,
    })
}
