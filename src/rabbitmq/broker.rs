// src/rabbitmq/broker.rs
// Broker abstraction shared by the AMQP client and the in-memory broker

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::Stream;
use uuid::Uuid;

use super::errors::Result;

/// Callback fired once when the broker or the network closes a connection.
/// Carries the close reason when one is known.
pub type CloseObserver = Box<dyn FnOnce(Option<String>) + Send + 'static>;

/// Stream of deliveries produced by a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Incoming>> + Send>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// One logical session with the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Register a passive observer for unexpected closure. Closing the
    /// connection through `close` does not fire it.
    fn on_close(&self, observer: CloseObserver);

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// A multiplexed session opened from a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue. Idempotent when the arguments match.
    async fn declare_queue(&self, queue: &str, arguments: &QueueArguments) -> Result<()>;

    /// Declare a durable direct exchange.
    async fn declare_direct_exchange(&self, exchange: &str) -> Result<()>;

    /// Publish through the default exchange straight into `queue`.
    async fn send_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()>;

    /// Limit the number of unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

/// Optional `x-` arguments of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueArguments {
    /// Arguments routing expired or rejected messages through `exchange`
    /// with `routing_key`.
    pub fn dead_letter(exchange: &str, routing_key: &str) -> Self {
        Self {
            dead_letter_exchange: Some(exchange.to_string()),
            dead_letter_routing_key: Some(routing_key.to_string()),
        }
    }
}

/// Delivery metadata attached to a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: String,
    pub content_type: String,
    pub persistent: bool,
    pub expiration: Option<Duration>,
}

impl MessageProperties {
    /// Persistent JSON message with a fresh message id.
    pub fn persistent() -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            content_type: "application/json".to_string(),
            persistent: true,
            expiration: None,
        }
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// The `expiration` property as AMQP carries it: whole milliseconds as a string.
    pub fn expiration_ms(&self) -> Option<String> {
        self.expiration.map(|ttl| ttl.as_millis().to_string())
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Reject without requeue.
    async fn reject(&self) -> Result<()>;
}

/// A delivered message waiting to be acknowledged or rejected.
pub struct Incoming {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Incoming {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        data: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            data,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self) -> Result<()> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.data.len())
            .finish()
    }
}
