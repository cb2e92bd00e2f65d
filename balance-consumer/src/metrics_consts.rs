pub const MESSAGES_RECEIVED: &str = "balance_consumer_messages_received";
pub const DECODE_FAILED: &str = "balance_consumer_decode_failed";
pub const TRANSITIONS_APPLIED: &str = "balance_consumer_transitions_applied";
pub const TRANSITIONS_REJECTED: &str = "balance_consumer_transitions_rejected";
pub const TRANSITIONS_REPLAYED: &str = "balance_consumer_transitions_replayed";
pub const STORE_FAILED: &str = "balance_consumer_store_failed";
pub const STORE_RETRIES: &str = "balance_consumer_store_retries";
pub const TRANSPORT_ERRORS: &str = "balance_consumer_transport_errors";
pub const RUNNING_WORKERS: &str = "balance_consumer_running_workers";
pub const SKIPPED_TOPICS: &str = "balance_consumer_skipped_topics";
pub const TRANSITION_TIME: &str = "balance_consumer_transition_seconds";
