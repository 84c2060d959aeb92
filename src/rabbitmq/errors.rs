// src/rabbitmq/errors.rs

use std::time::Duration;

use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    /// The retry budget was exhausted without reaching the broker.
    #[error("could not connect to RabbitMQ after {attempts} attempts: {reason}")]
    Connection { attempts: u32, reason: String },

    /// A single connection attempt failed. Only the retry loop sees this.
    #[error("RabbitMQ unreachable: {0}")]
    Unreachable(String),

    #[error("RabbitMQ channel error: {0}")]
    Channel(String),

    #[error("RabbitMQ publish error: {0}")]
    Publish(String),

    #[error("RabbitMQ consume error: {0}")]
    Consume(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    Ack(String),

    #[error("RPC call timed out after {0:?}")]
    RpcTimeout(Duration),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("Message decode error: {0}")]
    Decode(#[source] SerdeError),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("payload must be a JSON object, got {0}")]
    InvalidPayload(String),

    #[error("remote handler failed: {0}")]
    Remote(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("background worker failed: {0}")]
    Worker(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, MessagingError>;

impl MessagingError {
    /// Errors after which the held connection can no longer be trusted.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection { .. }
                | MessagingError::Unreachable(_)
                | MessagingError::Channel(_)
                | MessagingError::Publish(_)
                | MessagingError::Consume(_)
                | MessagingError::Ack(_)
        )
    }

    pub(crate) fn decode(error: SerdeError) -> Self {
        MessagingError::Decode(error)
    }
}

impl From<tokio::task::JoinError> for MessagingError {
    fn from(err: tokio::task::JoinError) -> Self {
        MessagingError::Worker(err.to_string())
    }
}
