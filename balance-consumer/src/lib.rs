pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod metrics;
pub mod metrics_consts;
pub mod processor;
pub mod retry;
pub mod store;
pub mod worker;
