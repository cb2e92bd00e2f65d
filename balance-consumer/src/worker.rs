//! Partition Worker - owns one partition subscription and applies its messages in order.
//!
//! The worker waits on either the next delivery (message or transport error) or the shutdown
//! token. Shutdown is only observed between messages: once a message is pulled, it is decoded
//! and applied to completion before the token is checked again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common_kafka::partition_consumer::{Delivery, PartitionSubscription, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, DecodeError};
use crate::events::decode;
use crate::metrics_consts::{
    DECODE_FAILED, MESSAGES_RECEIVED, STORE_FAILED, TRANSITIONS_APPLIED, TRANSITIONS_REJECTED,
    TRANSITIONS_REPLAYED, TRANSPORT_ERRORS,
};
use crate::processor::{Applied, BalanceProcessor};
use crate::store::MessagePosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// What happened to a single delivered message.
#[derive(Debug)]
pub enum MessageOutcome {
    Applied(Applied),
    Rejected(ApplyError),
    Undecodable(DecodeError),
    Failed(ApplyError),
}

/// `messages` counts every delivery pulled; the other counters split it by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageCounts {
    pub messages: u64,
    pub applied: u64,
    pub rejected: u64,
    pub undecodable: u64,
    pub failed: u64,
}

impl MessageCounts {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Applied(_) => self.applied += 1,
            MessageOutcome::Rejected(_) => self.rejected += 1,
            MessageOutcome::Undecodable(_) => self.undecodable += 1,
            MessageOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Handed back to the coordinator when a worker stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub topic: String,
    pub partition: i32,
    pub state: WorkerState,
    pub counts: MessageCounts,
}

pub struct PartitionWorker<S> {
    topic: String,
    partition: i32,
    subscription: S,
    processor: Arc<BalanceProcessor>,
    shutdown: CancellationToken,
    processed: Arc<AtomicU64>,
    track_positions: bool,
    state: WorkerState,
    counts: MessageCounts,
}

impl<S: PartitionSubscription> PartitionWorker<S> {
    /// `processed` is shared by every worker of the group and counts all messages pulled.
    pub fn new(
        topic: &str,
        partition: i32,
        subscription: S,
        processor: Arc<BalanceProcessor>,
        shutdown: CancellationToken,
        processed: Arc<AtomicU64>,
    ) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            subscription,
            processor,
            shutdown,
            processed,
            track_positions: false,
            state: WorkerState::Starting,
            counts: MessageCounts::default(),
        }
    }

    /// Pass message positions to the processor so replayed messages are skipped.
    pub fn with_position_tracking(mut self, enabled: bool) -> Self {
        self.track_positions = enabled;
        self
    }

    /// Consume until shutdown is signalled or the subscription ends.
    pub async fn run(mut self) -> WorkerReport {
        self.transition(WorkerState::Running);

        loop {
            // Shutdown wins over a ready message, so nothing new is dispatched once it's set
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.subscription.recv() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let outcome = self.handle(delivery).await;
                    self.counts.record(&outcome);
                }
                Some(Err(e)) => self.transport_error(e),
                None => {
                    warn!(
                        topic = self.topic.as_str(),
                        partition = self.partition,
                        "Subscription closed by the transport"
                    );
                    break;
                }
            }
        }

        self.transition(WorkerState::Stopping);
        let PartitionWorker {
            topic,
            partition,
            subscription,
            counts,
            ..
        } = self;
        subscription.close();

        info!(
            topic = topic.as_str(),
            partition,
            messages = counts.messages,
            applied = counts.applied,
            rejected = counts.rejected,
            "Partition worker stopped"
        );
        WorkerReport {
            topic,
            partition,
            state: WorkerState::Stopped,
            counts,
        }
    }

    /// Decode and apply one message, recording the outcome. Never fails the worker.
    pub async fn handle(&mut self, delivery: Delivery) -> MessageOutcome {
        let total = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        self.counts.messages += 1;
        metrics::counter!(MESSAGES_RECEIVED, "topic" => self.topic.clone()).increment(1);
        debug!(
            topic = delivery.topic.as_str(),
            partition = delivery.partition,
            offset = delivery.offset,
            total,
            "Received message"
        );

        let payload = delivery.payload.as_deref().unwrap_or_default();
        let event = match decode(&delivery.topic, payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    topic = delivery.topic.as_str(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Skipping undecodable message: {}",
                    e
                );
                metrics::counter!(DECODE_FAILED, "reason" => e.reason()).increment(1);
                return MessageOutcome::Undecodable(e);
            }
        };

        let position = self.track_positions.then(|| MessagePosition {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
        });

        match self.processor.apply(&event, position.as_ref()).await {
            Ok(Applied::Replayed) => {
                debug!(
                    topic = delivery.topic.as_str(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Message already applied, skipping"
                );
                metrics::counter!(TRANSITIONS_REPLAYED, "kind" => event.kind()).increment(1);
                MessageOutcome::Applied(Applied::Replayed)
            }
            Ok(applied) => {
                debug!(
                    topic = delivery.topic.as_str(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Applied {}: {:?}",
                    event.kind(),
                    applied
                );
                metrics::counter!(TRANSITIONS_APPLIED, "kind" => event.kind()).increment(1);
                MessageOutcome::Applied(applied)
            }
            // TODO: publish rejections back to the producer once it listens for outcomes
            Err(e) if e.is_rejection() => {
                warn!(
                    topic = delivery.topic.as_str(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Rejected {}: {}",
                    event.kind(),
                    e
                );
                metrics::counter!(TRANSITIONS_REJECTED, "reason" => e.reason()).increment(1);
                MessageOutcome::Rejected(e)
            }
            Err(e) => {
                error!(
                    topic = delivery.topic.as_str(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Failed to apply {}, dropping message: {}",
                    event.kind(),
                    e
                );
                metrics::counter!(STORE_FAILED, "kind" => event.kind()).increment(1);
                MessageOutcome::Failed(e)
            }
        }
    }

    fn transport_error(&self, e: TransportError) {
        warn!(
            topic = self.topic.as_str(),
            partition = self.partition,
            "Transport error: {}",
            e
        );
        metrics::counter!(TRANSPORT_ERRORS, "topic" => self.topic.clone()).increment(1);
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(
            topic = self.topic.as_str(),
            partition = self.partition,
            "Worker {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}
