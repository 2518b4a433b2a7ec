use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::broker::{BrokerChannel, MessageProperties, QueueArguments};
use super::connection::ConnectionManager;
use super::errors::Result;

/// Direct exchange declared for delayed delivery.
pub const DELAY_EXCHANGE: &str = "delayed_exchange";

/// Name of the queue holding delayed messages bound for `queue`.
pub fn holding_queue_name(queue: &str) -> String {
    format!("delayed_{}", queue)
}

/// Publishes JSON messages, optionally delayed through a dead-lettering
/// holding queue.
#[derive(Clone)]
pub struct Publisher {
    connection_manager: ConnectionManager,
}

impl Publisher {
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Publisher { connection_manager }
    }

    /// Publish `payload` to `queue`.
    ///
    /// With a non-zero `delay` (in whole milliseconds) the message waits in
    /// the holding queue until its expiration moves it to `queue`. Returning
    /// `Ok` means the broker accepted the message, nothing more.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        delay: Duration,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload)?;

        let connection = self.connection_manager.acquire().await?;
        let channel = connection.create_channel().await?;

        let outcome = send(channel.as_ref(), queue, &body, delay).await;

        if let Err(e) = channel.close().await {
            warn!(queue, "Failed to close publish channel: {}", e);
        }
        outcome
    }
}

async fn send(channel: &dyn BrokerChannel, queue: &str, body: &[u8], delay: Duration) -> Result<()> {
    channel.declare_queue(queue, &QueueArguments::default()).await?;

    if delay.as_millis() == 0 {
        channel
            .send_to_queue(queue, body, &MessageProperties::persistent())
            .await?;
        debug!(queue, "Published message");
        return Ok(());
    }

    let holding_queue = holding_queue_name(queue);
    channel.declare_direct_exchange(DELAY_EXCHANGE).await?;
    channel
        .declare_queue(&holding_queue, &QueueArguments::dead_letter("", queue))
        .await?;

    channel
        .send_to_queue(
            &holding_queue,
            body,
            &MessageProperties::persistent().with_expiration(delay),
        )
        .await?;

    info!(
        queue,
        holding_queue = %holding_queue,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        "Published delayed message"
    );
    Ok(())
}
