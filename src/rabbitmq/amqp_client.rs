// src/rabbitmq/amqp_client.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::{MessagingError, Result};
use super::transport::{
    Acknowledge, Connector, Delivery, DeliveryStream, OutboundMessage, QueueSpec, Session,
    JSON_CONTENT_TYPE,
};
use crate::config::{BrokerConfig, BLOCKED_CONNECTION_TIMEOUT};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Opens lapin connections to a RabbitMQ broker.
pub struct AmqpConnector {
    uri: AMQPUri,
    endpoint: String,
    blocked_timeout: Duration,
}

impl AmqpConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            uri: config.amqp_uri(),
            endpoint: config.endpoint(),
            blocked_timeout: BLOCKED_CONNECTION_TIMEOUT,
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn open(&self) -> Result<Arc<dyn Session>> {
        let connection = Connection::connect_uri(self.uri.clone(), ConnectionProperties::default())
            .await
            .map_err(|e| MessagingError::Unreachable(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::Channel(format!("Failed to create channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| MessagingError::Channel(format!("Failed to enable confirms: {}", e)))?;

        debug!(endpoint = %self.endpoint, channel_id = channel.id(), "Opened AMQP channel");

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
            blocked_timeout: self.blocked_timeout,
        }))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// One lapin connection and the single channel used on it.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    blocked_timeout: Duration,
}

#[async_trait]
impl Session for AmqpSession {
    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_topic_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Channel(format!("Failed to declare exchange: {}", e)))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Channel(format!("Failed to declare queue: {}", e)))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Channel(format!("Failed to bind queue: {}", e)))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::Channel(format!("Failed to set QoS: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        let mut properties = BasicProperties::default().with_content_type(JSON_CONTENT_TYPE.into());
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        if let Some(correlation_id) = message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }
        if let Some(reply_to) = message.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }

        let publish = async {
            self.channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &message.body,
                    properties,
                )
                .await?
                .await
        };

        match tokio::time::timeout(self.blocked_timeout, publish).await {
            Ok(Ok(confirmation)) => confirmed(confirmation),
            Ok(Err(e)) => Err(MessagingError::Publish(e.to_string())),
            Err(_) => {
                warn!(
                    exchange,
                    routing_key,
                    timeout_secs = self.blocked_timeout.as_secs(),
                    "Connection blocked past the allowed window"
                );
                Err(MessagingError::Publish(format!(
                    "connection blocked for more than {:?}",
                    self.blocked_timeout
                )))
            }
        }
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &format!("{}-{}", queue, Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Consume(e.to_string()))?;

        let stream = consumer.map(|delivery| -> Result<Delivery> {
            let delivery = delivery.map_err(|e| MessagingError::Consume(e.to_string()))?;
            let correlation_id = delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_string());
            let reply_to = delivery
                .properties
                .reply_to()
                .as_ref()
                .map(|queue| queue.as_str().to_string());

            Ok(Delivery::new(
                delivery.data,
                delivery.routing_key.as_str(),
                Box::new(LapinAcker(delivery.acker)),
            )
            .with_properties(correlation_id, reply_to, delivery.redelivered))
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "Closing channel")
                .await
                .map_err(|e| MessagingError::Channel(e.to_string()))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "Closing connection")
                .await
                .map_err(|e| MessagingError::Channel(e.to_string()))?;
        }
        Ok(())
    }
}

/// Publishes count as done only once the broker has taken responsibility.
fn confirmed(confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(MessagingError::Publish(
            "broker rejected the message".to_string(),
        )),
        Confirmation::NotRequested => Err(MessagingError::Publish(
            "publisher confirms are not enabled on this channel".to_string(),
        )),
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| MessagingError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_an_acked_publish_counts_as_done() {
        assert!(confirmed(Confirmation::Ack(None)).is_ok());

        let rejected = confirmed(Confirmation::Nack(None)).unwrap_err();
        assert!(matches!(rejected, MessagingError::Publish(_)));
        assert!(rejected.is_transport());

        assert!(confirmed(Confirmation::NotRequested).is_err());
    }
}
