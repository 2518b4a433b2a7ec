use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use notify_mq::env::Config;
use notify_mq::mailer::LogMailer;
use notify_mq::notification::NotificationService;
use notify_mq::rabbitmq::{
    AmqpBroker, Broker, ConnectionManager, Consumer, InMemoryBroker, Publisher, TokioScheduler,
};

fn build_broker(config: &Config) -> Arc<dyn Broker> {
    if config.rabbitmq_url.starts_with("memory://") {
        info!("Using in-process broker");
        Arc::new(InMemoryBroker::new())
    } else {
        Arc::new(AmqpBroker::new(&config.connection_name))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load().context("Failed to load configuration")?;

    let connection_manager = ConnectionManager::with_reconnect_policy(
        &config.rabbitmq_url,
        build_broker(&config),
        Arc::new(TokioScheduler::current()),
        config.reconnect_policy(),
    );
    connection_manager
        .acquire()
        .await
        .context("Failed to connect to RabbitMQ")?;

    let mailer = LogMailer::new().context("Failed to set up mailer")?;
    let service = Arc::new(
        NotificationService::new(Publisher::new(connection_manager.clone()), mailer)
            .with_queue(config.notification_queue.clone()),
    );
    let worker = tokio::spawn(
        service
            .clone()
            .run_worker(Consumer::new(connection_manager.clone())),
    );
    info!(queue = %service.queue(), "Notification worker started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    if let Err(e) = connection_manager.close().await {
        error!("Failed to close RabbitMQ connection: {}", e);
    }
    if let Err(e) = worker.await {
        error!("Notification worker panicked: {}", e);
    }
    Ok(())
}
