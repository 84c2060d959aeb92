// src/rabbitmq/rpc_client.rs
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::amqp_client::AmqpConnector;
use super::connection::{ConnectionManager, RetryPolicy};
use super::errors::{MessagingError, Result};
use super::message::{Payload, RpcReply};
use super::transport::{Connector, DeliveryStream, OutboundMessage, QueueSpec};
use crate::config::BrokerConfig;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Reply queue and consumer bound to one connection generation.
struct ReplyChannel {
    queue: String,
    deliveries: DeliveryStream,
    generation: u64,
}

/// Request/reply over the broker.
///
/// Each client owns one exclusive reply queue and has at most one call in
/// flight: `call` takes `&mut self`, so concurrent callers need their own
/// clients.
pub struct RpcClient {
    connection: ConnectionManager,
    queue_name: String,
    replies: Option<ReplyChannel>,
}

impl RpcClient {
    /// Connects and creates the reply queue.
    pub async fn new(connector: Arc<dyn Connector>, queue_name: impl Into<String>) -> Result<Self> {
        Self::with_retry_policy(connector, queue_name, RetryPolicy::default()).await
    }

    pub async fn with_retry_policy(
        connector: Arc<dyn Connector>,
        queue_name: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let mut client = RpcClient {
            connection: ConnectionManager::new(connector).with_retry_policy(policy),
            queue_name: queue_name.into(),
            replies: None,
        };
        client.ensure_reply_channel().await?;
        Ok(client)
    }

    pub async fn from_config(config: &BrokerConfig, queue_name: impl Into<String>) -> Result<Self> {
        Self::with_retry_policy(
            Arc::new(AmqpConnector::new(config)),
            queue_name,
            RetryPolicy::from(config),
        )
        .await
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Name of the private reply queue, if currently connected.
    pub fn callback_queue(&self) -> Option<&str> {
        self.replies.as_ref().map(|r| r.queue.as_str())
    }

    /// Sends `payload` and waits up to `timeout` for the matching reply.
    ///
    /// Replies carrying any other correlation id are discarded. A transport
    /// failure drops the connection; the request is not retried.
    pub async fn call(&mut self, payload: &Payload, timeout: Duration) -> Result<RpcReply> {
        let result = self.try_call(payload, timeout).await;
        if let Err(err) = &result {
            error!(queue = %self.queue_name, error = %err, "RPC call failed");
            if err.is_transport() {
                self.replies = None;
                self.connection.invalidate();
            }
        }
        result
    }

    async fn try_call(&mut self, payload: &Payload, timeout: Duration) -> Result<RpcReply> {
        self.ensure_reply_channel().await?;
        let session = self.connection.ensure_connected().await?;

        let correlation_id = Uuid::new_v4();

        let reply_to = match &self.replies {
            Some(replies) => replies.queue.clone(),
            None => return Err(MessagingError::Consume("reply queue unavailable".to_string())),
        };
        let message = OutboundMessage::json(payload)?
            .correlation_id(correlation_id.to_string())
            .reply_to(reply_to);
        session.publish("", &self.queue_name, message).await?;
        debug!(queue = %self.queue_name, %correlation_id, "RPC request sent");

        match tokio::time::timeout(timeout, self.wait_for(correlation_id)).await {
            Ok(reply) => reply,
            Err(_) => {
                error!(
                    queue = %self.queue_name,
                    %correlation_id,
                    "RPC call timeout after {:?}",
                    timeout
                );
                Err(MessagingError::RpcTimeout(timeout))
            }
        }
    }

    async fn wait_for(&mut self, correlation_id: Uuid) -> Result<RpcReply> {
        let expected = correlation_id.to_string();
        let replies = self
            .replies
            .as_mut()
            .ok_or_else(|| MessagingError::Consume("reply queue unavailable".to_string()))?;

        loop {
            let delivery = match replies.deliveries.next().await {
                Some(delivery) => delivery?,
                None => {
                    return Err(MessagingError::Consume(
                        "reply stream closed by broker".to_string(),
                    ))
                }
            };

            if delivery.correlation_id.as_deref() == Some(expected.as_str()) {
                return RpcReply::from_body(&delivery.body);
            }
            debug!(
                expected = %expected,
                received = ?delivery.correlation_id,
                "Discarding reply for another call"
            );
        }
    }

    /// (Re)creates the reply queue and its consumer whenever the connection
    /// was rebuilt since they were made.
    async fn ensure_reply_channel(&mut self) -> Result<()> {
        let session = self.connection.ensure_connected().await?;
        let generation = self.connection.generation();
        if matches!(&self.replies, Some(r) if r.generation == generation) {
            return Ok(());
        }

        let queue = session.declare_queue(&QueueSpec::exclusive_reply()).await?;
        let deliveries = session.consume(&queue, true).await?;
        info!(queue = %self.queue_name, reply_queue = %queue, "RPC client ready");

        self.replies = Some(ReplyChannel {
            queue,
            deliveries,
            generation,
        });
        Ok(())
    }

    pub async fn close(&mut self) {
        self.replies = None;
        self.connection.close().await;
    }
}
