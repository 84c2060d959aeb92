// src/rabbitmq/transport.rs
//! The broker operations the messaging components rely on.
//!
//! `Connector` opens a connection; a `Session` is one connection plus one
//! channel. The lapin implementation lives in `amqp_client`, an in-process
//! one in `memory`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

use super::errors::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Stream of inbound messages for one consumer. It ends (or yields an error)
/// when the underlying channel is lost.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Makes a single connection attempt.
    async fn open(&self) -> Result<Arc<dyn Session>>;

    /// Where this connector points, for logs. Never includes credentials.
    fn endpoint(&self) -> String;
}

#[async_trait]
pub trait Session: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Declares a durable topic exchange. Idempotent.
    async fn declare_topic_exchange(&self, name: &str) -> Result<()>;

    /// Declares a queue and returns its name (generated for anonymous queues).
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limits unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publishes to `exchange`; the empty name is the default exchange, which
    /// routes straight to the queue named by `routing_key`.
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage)
        -> Result<()>;

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Empty asks the broker to generate a name.
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Anonymous queue private to one connection, removed when it closes.
    pub fn exclusive_reply() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// A JSON message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub persistent: bool,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self {
            body: serde_json::to_vec(value)?,
            persistent: false,
            correlation_id: None,
            reply_to: None,
        })
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Deliveries consumed with `auto_ack` are already settled.
pub struct AutoAcked;

#[async_trait]
impl Acknowledge for AutoAcked {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, routing_key: impl Into<String>, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            correlation_id: None,
            reply_to: None,
            redelivered: false,
            acker,
        }
    }

    pub fn with_properties(
        mut self,
        correlation_id: Option<String>,
        reply_to: Option<String>,
        redelivered: bool,
    ) -> Self {
        self.correlation_id = correlation_id;
        self.reply_to = reply_to;
        self.redelivered = redelivered;
        self
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.body.len())
            .finish()
    }
}
