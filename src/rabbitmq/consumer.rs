use std::future::Future;

use async_trait::async_trait;
use futures_lite::StreamExt;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{Incoming, QueueArguments};
use super::connection::ConnectionManager;
use super::errors::Result;

/// One unacknowledged delivery per subscription.
pub const PREFETCH_COUNT: u16 = 1;

/// Processes decoded messages. Returning an error rejects the message.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, message: T) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: T) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// How a delivery ended up. `Unsettled` means the broker never confirmed the
/// ack or reject and may redeliver the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Acked,
    Rejected,
    Unsettled,
}

#[derive(Debug, Default)]
struct Tally {
    acked: u64,
    rejected: u64,
    unsettled: u64,
}

impl Tally {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Acked => self.acked += 1,
            Disposition::Rejected => self.rejected += 1,
            Disposition::Unsettled => self.unsettled += 1,
        }
    }
}

#[derive(Clone)]
pub struct Consumer {
    connection_manager: ConnectionManager,
}

impl Consumer {
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Consumer { connection_manager }
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connection_manager
    }

    /// Subscribe to `queue` and feed every message to `handler`, one at a time.
    ///
    /// Runs until the subscription ends. Setup failures are returned; failures
    /// while handling a message are logged and the message is rejected without
    /// requeue.
    pub async fn consume<T, H>(&self, queue: &str, handler: H) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let connection = self.connection_manager.acquire().await?;
        let channel = connection.create_channel().await?;

        channel.declare_queue(queue, &QueueArguments::default()).await?;
        channel.set_prefetch(PREFETCH_COUNT).await?;

        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let mut deliveries = channel.consume(queue, &consumer_tag).await?;
        info!(queue, consumer_tag = %consumer_tag, "Started consuming");

        let mut tally = Tally::default();
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(delivery) => {
                    let tag = delivery.delivery_tag;
                    let disposition = process(queue, &handler, delivery).await;
                    debug!(queue, delivery_tag = tag, ?disposition, "Delivery finished");
                    tally.record(disposition);
                }
                Err(e) => {
                    error!(queue, "Error receiving message: {}", e);
                    break;
                }
            }
        }

        warn!(
            queue,
            consumer_tag = %consumer_tag,
            acked = tally.acked,
            rejected = tally.rejected,
            unsettled = tally.unsettled,
            "Subscription ended"
        );
        if let Err(e) = channel.close().await {
            debug!(queue, "Channel already gone: {}", e);
        }
        Ok(())
    }
}

async fn process<T, H>(queue: &str, handler: &H, delivery: Incoming) -> Disposition
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    let outcome = match serde_json::from_slice::<T>(&delivery.data) {
        Ok(message) => handler.handle(message).await,
        Err(e) => Err(anyhow::anyhow!("Failed to deserialize message: {}", e)),
    };

    let tag = delivery.delivery_tag;
    match outcome {
        Ok(()) => match delivery.ack().await {
            Ok(()) => Disposition::Acked,
            Err(e) => {
                error!(queue, delivery_tag = tag, "Message left unsettled, ack failed: {}", e);
                Disposition::Unsettled
            }
        },
        Err(e) => {
            error!(queue, "Failed to process message: {:#}", e);
            match delivery.reject().await {
                Ok(()) => Disposition::Rejected,
                Err(e) => {
                    error!(queue, delivery_tag = tag, "Message left unsettled, reject failed: {}", e);
                    Disposition::Unsettled
                }
            }
        }
    }
}
