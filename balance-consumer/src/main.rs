use std::sync::Arc;

use anyhow::Context;
use balance_consumer::{
    config::Config,
    coordinator::Coordinator,
    events::CONSUMED_TOPICS,
    metrics::{serve, setup_metrics_router},
    processor::BalanceProcessor,
    store::PgBalanceStore,
};
use common_kafka::partition_consumer::KafkaPartitionSource;
use envconfig::Envconfig;
use tokio::signal::unix::SignalKind;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to install SIGTERM handler, only SIGINT stops the consumer: {}", e);
            if let Err(e) = ctrl_c.await {
                error!("Failed to listen for SIGINT: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().context("failed to load configuration from env")?;

    let store = PgBalanceStore::connect(&config.database_url, config.max_pg_connections)
        .await
        .context("failed to connect to the balance database")?;
    if config.run_migrations {
        store
            .migrate()
            .await
            .context("failed to run balance migrations")?;
    }

    let source = KafkaPartitionSource::new(&config.kafka, &config.consumer)
        .context("failed to connect to kafka")?;

    let router = setup_metrics_router().context("failed to install metrics recorder")?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve metrics on {}: {}", bind, e);
        }
    });

    let processor = BalanceProcessor::new(Arc::new(store), config.retry_policy());
    let coordinator = Coordinator::new(Arc::new(source), Arc::new(processor), CONSUMED_TOPICS)
        .with_position_tracking(config.track_applied_offsets)
        .with_shutdown_timeout(config.shutdown_timeout.map(|d| d.0));

    let summary = coordinator.run_until(wait_for_shutdown_signal()).await;
    info!(
        "Stopped {} partition workers ({} aborted) after {} messages",
        summary.stopped.len(),
        summary.aborted,
        summary.processed
    );

    Ok(())
}
