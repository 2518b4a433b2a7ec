// src/rabbitmq/amqp_client.rs

use std::sync::Arc;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    message::Delivery,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::debug;

use super::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, CloseObserver, DeliveryStream,
    Incoming, MessageProperties, QueueArguments,
};
use super::errors::{RabbitMQError, Result};

const REPLY_SUCCESS: u16 = 200;

/// AMQP 0-9-1 broker reached through lapin.
pub struct AmqpBroker {
    connection_name: String,
}

impl AmqpBroker {
    pub fn new(connection_name: &str) -> Self {
        Self {
            connection_name: connection_name.to_string(),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.connection_name.clone().into());

        let connection = Connection::connect(uri, properties)
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))?;

        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    fn on_close(&self, observer: CloseObserver) {
        // lapin reports broker- and network-initiated closure through on_error
        let mut observer = Some(observer);
        self.connection.on_error(move |err| {
            if let Some(observer) = observer.take() {
                observer(Some(err.to_string()));
            }
        });
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;

        debug!(channel_id = channel.id(), "Opened channel");
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn queue_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.clone().into()),
        );
    }
    table
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let delivery_mode = if properties.persistent { 2 } else { 1 };
    let mut basic = BasicProperties::default()
        .with_message_id(properties.message_id.clone().into())
        .with_content_type(properties.content_type.clone().into())
        .with_delivery_mode(delivery_mode)
        .with_timestamp(chrono::Utc::now().timestamp() as u64);

    if let Some(expiration) = properties.expiration_ms() {
        basic = basic.with_expiration(expiration.into());
    }
    basic
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str, arguments: &QueueArguments) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(arguments),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!("Failed to declare queue '{}': {}", queue, e))
            })?;
        Ok(())
    }

    async fn declare_direct_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!(
                    "Failed to declare exchange '{}': {}",
                    exchange, e
                ))
            })
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        // No confirm mode: the returned confirm is not awaited
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                basic_properties(properties),
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(incoming)
                .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
        });
        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}

fn incoming(mut delivery: Delivery) -> Incoming {
    let data = std::mem::take(&mut delivery.data);
    Incoming::new(
        delivery.delivery_tag,
        delivery.redelivered,
        data,
        Box::new(AmqpAcker { delivery }),
    )
}

struct AmqpAcker {
    delivery: Delivery,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn reject(&self) -> Result<()> {
        self.delivery
            .nack(BasicNackOptions {
                requeue: false,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}
