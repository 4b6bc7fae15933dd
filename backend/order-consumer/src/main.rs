//! Order consumer service
//!
//! Consumes `OrderCreated` events with commit-on-success semantics. Kafka
//! connection settings come from `KAFKA_*` environment variables.

mod orders;

use anyhow::Context;
use group_consumer::{ConsumerMetrics, GroupConsumer};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let group_id =
        std::env::var("ORDER_CONSUMER_GROUP_ID").unwrap_or_else(|_| "order-consumer".to_string());
    let topics: Vec<String> = std::env::var("ORDER_CONSUMER_TOPICS")
        .unwrap_or_else(|_| "orders.created".to_string())
        .split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
        .collect();

    info!(group_id = %group_id, topics = ?topics, "Starting order consumer");

    let mut consumer = GroupConsumer::from_env("KAFKA_", group_id, topics, orders::order_handler())
        .context("Failed to create group consumer")?
        .with_metrics(ConsumerMetrics::new("order-consumer"));

    let shutdown = CancellationToken::new();
    consumer.start(&shutdown);

    shutdown_signal().await;
    info!("Shutdown signal received, closing consumer");

    consumer
        .close()
        .await
        .context("Failed to close group consumer")?;

    info!("Order consumer stopped");
    Ok(())
}
