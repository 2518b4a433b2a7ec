// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ topology error: {0}")]
    TopologyError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// True when the failure comes from the connection being down rather than
    /// from the operation itself.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_) | RabbitMQError::ConnectionUnavailable(_)
        )
    }
}
