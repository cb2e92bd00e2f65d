use thiserror::Error;

/// A payload that cannot be turned into a balance event. The message is skipped.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no decoder for topic {0}")]
    UnknownTopic(String),
    #[error("message on {0} has an empty payload")]
    EmptyPayload(String),
    #[error("malformed {topic} payload: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::UnknownTopic(_) => "unknown_topic",
            DecodeError::EmptyPayload(_) => "empty_payload",
            DecodeError::Malformed { .. } => "malformed",
        }
    }
}

/// Infrastructure failures of the balance store. These are transient by assumption.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("balance store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Why a balance transition did not commit.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("account {0} does not exist")]
    AccountNotFound(String),
    #[error("insufficient funds in account {account_id}: balance {balance}, required {amount}")]
    InsufficientFunds {
        account_id: String,
        balance: i64,
        amount: i64,
    },
    #[error("account {0} is already initialized")]
    DuplicateAccount(String),
    #[error("account {account_id} cannot start with negative balance {balance}")]
    InvalidBalance { account_id: String, balance: i64 },
    #[error("transfer amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("crediting {amount} would overflow the balance of account {account_id}")]
    BalanceOverflow { account_id: String, amount: i64 },
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl ApplyError {
    /// Business-rule rejections are final for a message: retrying against the same state
    /// yields the same answer. Everything else is an infrastructure failure.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, ApplyError::StoreUnavailable(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ApplyError::AccountNotFound(_) => "account_not_found",
            ApplyError::InsufficientFunds { .. } => "insufficient_funds",
            ApplyError::DuplicateAccount(_) => "duplicate_account",
            ApplyError::InvalidBalance { .. } => "invalid_balance",
            ApplyError::InvalidAmount(_) => "invalid_amount",
            ApplyError::BalanceOverflow { .. } => "balance_overflow",
            ApplyError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_failures_are_retryable() {
        assert!(ApplyError::AccountNotFound("7".to_string()).is_rejection());
        assert!(ApplyError::DuplicateAccount("7".to_string()).is_rejection());
        assert!(ApplyError::InsufficientFunds {
            account_id: "7".to_string(),
            balance: 100,
            amount: 150,
        }
        .is_rejection());

        let unavailable = ApplyError::from(StoreError::from(sqlx::Error::PoolTimedOut));
        assert!(!unavailable.is_rejection());
        assert_eq!(unavailable.reason(), "store_unavailable");
    }
}
