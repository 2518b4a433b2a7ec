// src/rabbitmq/mod.rs
// Connection lifecycle, delayed publishing and acknowledged consumption

// RabbitMQ-specific errors
pub mod errors;
pub mod broker;
pub mod connection;
pub mod scheduler;
pub mod memory;

mod amqp_client;
mod consumer;
mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::AmqpBroker;
pub use broker::{Broker, BrokerChannel, BrokerConnection, Incoming, MessageProperties, QueueArguments};
pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy, MAX_RECONNECT_ATTEMPTS};
pub use consumer::{Consumer, MessageHandler, PREFETCH_COUNT};
pub use errors::{RabbitMQError, Result};
pub use memory::InMemoryBroker;
pub use publisher::{holding_queue_name, Publisher, DELAY_EXCHANGE};
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};
