//! Consumer Group Coordinator - one partition worker per (topic, partition), and the shutdown
//! protocol that stops them all.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common_kafka::partition_consumer::PartitionSource;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics_consts::{RUNNING_WORKERS, SKIPPED_TOPICS};
use crate::processor::BalanceProcessor;
use crate::worker::{PartitionWorker, WorkerReport};

/// Result of a completed shutdown. `processed` is read after every worker has been joined.
#[derive(Debug, Default)]
pub struct ShutdownSummary {
    pub stopped: Vec<WorkerReport>,
    pub aborted: usize,
    pub processed: u64,
}

pub struct Coordinator<P: PartitionSource> {
    source: Arc<P>,
    processor: Arc<BalanceProcessor>,
    topics: Vec<String>,
    shutdown_token: CancellationToken,
    processed: Arc<AtomicU64>,
    workers: JoinSet<WorkerReport>,
    track_positions: bool,
    shutdown_timeout: Option<Duration>,
}

impl<P: PartitionSource> Coordinator<P> {
    pub fn new<I, T>(source: Arc<P>, processor: Arc<BalanceProcessor>, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            source,
            processor,
            topics: topics.into_iter().map(Into::into).collect(),
            shutdown_token: CancellationToken::new(),
            processed: Arc::new(AtomicU64::new(0)),
            workers: JoinSet::new(),
            track_positions: false,
            shutdown_timeout: None,
        }
    }

    pub fn with_position_tracking(mut self, enabled: bool) -> Self {
        self.track_positions = enabled;
        self
    }

    /// Bound how long shutdown waits for workers; the rest are aborted.
    pub fn with_shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Cancelling this token stops every worker, like [`Coordinator::shutdown`] does.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn running_workers(&self) -> usize {
        self.workers.len()
    }

    /// Discover partitions and spawn a worker for each one. A topic whose partitions can't be
    /// listed, or a partition that can't be subscribed, is skipped. Returns the number of
    /// workers started.
    pub async fn start(&mut self) -> usize {
        let mut started = 0;

        for topic in self.topics.clone() {
            info!("Processing topic: {}", topic);
            let partitions = match self.source.partitions(&topic).await {
                Ok(partitions) => partitions,
                Err(e) => {
                    error!("Failed to get partitions for topic {}: {}", topic, e);
                    metrics::counter!(SKIPPED_TOPICS, "topic" => topic.clone()).increment(1);
                    continue;
                }
            };
            info!("Found {} partitions for topic: {}", partitions.len(), topic);

            for partition in partitions {
                let subscription = match self.source.subscribe(&topic, partition).await {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        error!(
                            "Failed to start consumer for topic {}, partition {}: {}",
                            topic, partition, e
                        );
                        continue;
                    }
                };
                self.spawn_worker(&topic, partition, subscription);
                started += 1;
            }
        }

        metrics::gauge!(RUNNING_WORKERS).set(self.workers.len() as f64);
        started
    }

    fn spawn_worker(&mut self, topic: &str, partition: i32, subscription: P::Subscription) {
        let worker = PartitionWorker::new(
            topic,
            partition,
            subscription,
            self.processor.clone(),
            self.shutdown_token.clone(),
            self.processed.clone(),
        )
        .with_position_tracking(self.track_positions);

        info!("Started consuming topic {}, partition {}", topic, partition);
        self.workers.spawn(worker.run());
    }

    /// Start the workers, wait for `signal`, then shut down.
    pub async fn run_until<F>(mut self, signal: F) -> ShutdownSummary
    where
        F: Future<Output = ()>,
    {
        let started = self.start().await;
        if started == 0 {
            warn!("No partition workers could be started");
        }
        tokio::select! {
            _ = signal => info!("Interrupt detected. Shutting down..."),
            _ = self.shutdown_token.cancelled() => info!("Shutdown requested. Shutting down..."),
        }
        self.shutdown().await
    }

    /// Signal every worker at once, wait until all have stopped, then close the shared broker
    /// connection.
    pub async fn shutdown(mut self) -> ShutdownSummary {
        self.shutdown_token.cancel();

        let mut summary = ShutdownSummary::default();
        let joined = match self.shutdown_timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, join_all(&mut self.workers, &mut summary))
                    .await
                    .is_ok()
            }
            None => {
                join_all(&mut self.workers, &mut summary).await;
                true
            }
        };

        if !joined {
            summary.aborted = self.workers.len();
            error!(
                "{} partition workers did not stop in time, aborting them",
                summary.aborted
            );
            self.workers.shutdown().await;
        }
        metrics::gauge!(RUNNING_WORKERS).set(0.0);

        self.source.close().await;

        summary.processed = self.processed.load(Ordering::SeqCst);
        info!("Processed {} messages", summary.processed);
        summary
    }
}

async fn join_all(workers: &mut JoinSet<WorkerReport>, summary: &mut ShutdownSummary) {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(report) => summary.stopped.push(report),
            Err(e) => error!("Partition worker panicked: {}", e),
        }
    }
}
