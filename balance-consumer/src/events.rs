//! Balance events as they appear on the wire, and the topic-driven decoder that produces them.

use serde::{Deserialize, Deserializer};

use crate::error::DecodeError;

pub const TRANSACTION_LEDGER_TOPIC: &str = "transaction_ledger";
pub const INITIAL_BALANCE_TOPIC: &str = "initial_balance";

/// Topics this service consumes, in the order partitions are discovered.
pub const CONSUMED_TOPICS: [&str; 2] = [TRANSACTION_LEDGER_TOPIC, INITIAL_BALANCE_TOPIC];

/// Moves `amount` fixed-point units from one existing account to another.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferEvent {
    #[serde(rename = "from_id", deserialize_with = "account_id")]
    pub from_account_id: String,
    #[serde(rename = "to_id", deserialize_with = "account_id")]
    pub to_account_id: String,
    pub amount: i64,
}

/// Creates an account with its opening balance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitialBalanceEvent {
    #[serde(rename = "id", deserialize_with = "account_id")]
    pub account_id: String,
    pub initial_balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceEvent {
    Transfer(TransferEvent),
    InitialBalance(InitialBalanceEvent),
}

impl BalanceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BalanceEvent::Transfer(_) => "transfer",
            BalanceEvent::InitialBalance(_) => "initial_balance",
        }
    }
}

/// Decode a raw payload according to the topic it was read from.
pub fn decode(topic: &str, payload: &[u8]) -> Result<BalanceEvent, DecodeError> {
    let malformed = |source| DecodeError::Malformed {
        topic: topic.to_owned(),
        source,
    };

    match topic {
        TRANSACTION_LEDGER_TOPIC | INITIAL_BALANCE_TOPIC if payload.is_empty() => {
            Err(DecodeError::EmptyPayload(topic.to_owned()))
        }
        TRANSACTION_LEDGER_TOPIC => serde_json::from_slice(payload)
            .map(BalanceEvent::Transfer)
            .map_err(malformed),
        INITIAL_BALANCE_TOPIC => serde_json::from_slice(payload)
            .map(BalanceEvent::InitialBalance)
            .map_err(malformed),
        unknown => Err(DecodeError::UnknownTopic(unknown.to_owned())),
    }
}

// Producers publish account ids either as strings or as numeric primary keys; both are
// stored as text.
fn account_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAccountId {
        Number(i64),
        Text(String),
    }

    match RawAccountId::deserialize(deserializer)? {
        RawAccountId::Number(id) => Ok(id.to_string()),
        RawAccountId::Text(id) => Ok(id),
    }
}
