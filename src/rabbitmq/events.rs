// src/rabbitmq/events.rs
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use super::amqp_client::AmqpConnector;
use super::connection::{ConnectionManager, RetryPolicy};
use super::errors::{MessagingError, Result};
use super::handler::{EventHandler, EventRouter};
use super::message::{EventEnvelope, Payload};
use super::transport::{Connector, Delivery, OutboundMessage, QueueSpec, Session};
use super::worker::Worker;
use crate::config::BrokerConfig;

/// Topic exchange shared by every service.
pub const EVENTS_EXCHANGE: &str = "microservices_events";

/// What happens to an event whose handler fails (or that cannot be decoded).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Nack without requeue: the event is gone after one failed attempt.
    #[default]
    Drop,
    /// Nack with requeue: the broker delivers it again.
    Requeue,
}

/// Publishes domain events and consumes this service's subscriptions.
pub struct EventBroker {
    connection: ConnectionManager,
    service: String,
    failure_policy: FailurePolicy,
}

impl EventBroker {
    /// Connects lazily, on first publish or consume.
    pub fn new(connector: Arc<dyn Connector>, service: impl Into<String>) -> Self {
        EventBroker {
            connection: ConnectionManager::new(connector),
            service: service.into(),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(Arc::new(AmqpConnector::new(config)), config.service_name.clone())
            .with_retry_policy(RetryPolicy::from(config))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.connection = self.connection.with_retry_policy(policy);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// The durable queue this service's subscriptions are bound to.
    pub fn queue_name(&self) -> String {
        format!("{}_events", self.service)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Publishes `data` as an event of `event_type`. Fails without retrying
    /// the message; a broken connection is dropped first.
    pub async fn publish(&mut self, event_type: &str, data: Payload) -> Result<()> {
        let envelope = EventEnvelope::new(event_type, data, self.service.clone());
        let result = self.publish_envelope(&envelope).await;

        match &result {
            Ok(()) => info!(event_type, service = %self.service, "Published event"),
            Err(err) => {
                error!(event_type, error = %err, "Failed to publish event");
                self.drop_connection_on(err);
            }
        }
        result
    }

    async fn publish_envelope(&mut self, envelope: &EventEnvelope) -> Result<()> {
        let session = self.connection.ensure_connected().await?;
        session.declare_topic_exchange(EVENTS_EXCHANGE).await?;

        let message = OutboundMessage::json(envelope)?.persistent();
        session
            .publish(EVENTS_EXCHANGE, &envelope.event_type, message)
            .await
    }

    /// Declares the exchange and this service's queue, and binds the queue
    /// once per event type. Safe to repeat.
    pub async fn subscribe<S: AsRef<str>>(&mut self, event_types: &[S]) -> Result<()> {
        let result = self.declare_subscriptions(event_types).await;
        if let Err(err) = &result {
            error!(error = %err, "Failed to set up event subscriptions");
            self.drop_connection_on(err);
        }
        result.map(|_| ())
    }

    async fn declare_subscriptions<S: AsRef<str>>(
        &mut self,
        event_types: &[S],
    ) -> Result<Arc<dyn Session>> {
        let session = self.connection.ensure_connected().await?;
        session.declare_topic_exchange(EVENTS_EXCHANGE).await?;

        let queue = session.declare_queue(&QueueSpec::durable(self.queue_name())).await?;
        for event_type in event_types {
            session
                .bind_queue(&queue, EVENTS_EXCHANGE, event_type.as_ref())
                .await?;
        }
        Ok(session)
    }

    /// Consumes events of `event_types` until the connection fails.
    pub async fn consume<S, H>(&mut self, event_types: &[S], handler: H) -> Result<()>
    where
        S: AsRef<str>,
        H: EventHandler,
    {
        self.consume_until(event_types, handler, std::future::pending())
            .await
    }

    /// Like `consume`, returning `Ok(())` once `shutdown` resolves.
    pub async fn consume_until<S, H, F>(
        &mut self,
        event_types: &[S],
        handler: H,
        shutdown: F,
    ) -> Result<()>
    where
        S: AsRef<str>,
        H: EventHandler,
        F: Future<Output = ()>,
    {
        let result = self.run_consumer(event_types, &handler, shutdown).await;
        if let Err(err) = &result {
            error!(error = %err, "Failed to consume events");
            self.drop_connection_on(err);
        }
        result
    }

    async fn run_consumer<S, H, F>(
        &mut self,
        event_types: &[S],
        handler: &H,
        shutdown: F,
    ) -> Result<()>
    where
        S: AsRef<str>,
        H: EventHandler,
        F: Future<Output = ()>,
    {
        let session = self.declare_subscriptions(event_types).await?;
        let queue = self.queue_name();
        let mut deliveries = session.consume(&queue, false).await?;

        let types: Vec<&str> = event_types.iter().map(AsRef::as_ref).collect();
        info!(queue = %queue, event_types = ?types, "Started consuming events");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(queue = %queue, "Event consumer stopping");
                    return Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.process(delivery, handler).await?,
                    Some(Err(err)) => return Err(err),
                    None => {
                        return Err(MessagingError::Consume(
                            "delivery stream closed by broker".to_string(),
                        ))
                    }
                },
            }
        }
    }

    /// Runs the handler for one delivery and settles it. Only transport
    /// errors escape; handler and decode failures become a nack.
    async fn process<H: EventHandler>(&self, delivery: Delivery, handler: &H) -> Result<()> {
        let outcome = match serde_json::from_slice::<EventEnvelope>(&delivery.body) {
            Ok(event) => {
                debug!(
                    event_type = %event.event_type,
                    from = %event.service,
                    redelivered = delivery.redelivered,
                    "Received event"
                );
                handler
                    .handle(event)
                    .await
                    .map_err(|e| MessagingError::Handler(format!("{:#}", e)))
            }
            Err(err) => Err(MessagingError::decode(err)),
        };

        match outcome {
            Ok(()) => delivery.ack().await,
            Err(err) => {
                let requeue = self.failure_policy == FailurePolicy::Requeue;
                warn!(
                    routing_key = %delivery.routing_key,
                    error = %err,
                    requeue,
                    "Error processing message"
                );
                delivery.nack(requeue).await
            }
        }
    }

    /// Moves the broker onto its own task, consuming until shutdown.
    pub fn spawn_consumer<H>(mut self, event_types: Vec<String>, handler: H) -> Worker
    where
        H: EventHandler + 'static,
    {
        let name = self.queue_name();
        Worker::spawn(name, move |shutdown| async move {
            let result = self
                .consume_until(&event_types, handler, shutdown.recv())
                .await;
            self.close().await;
            result
        })
    }

    /// Consumes with a router, binding exactly the event types it handles.
    pub fn spawn_router(self, router: EventRouter) -> Worker {
        let event_types = router.event_types();
        self.spawn_consumer(event_types, router)
    }

    pub async fn close(&mut self) {
        self.connection.close().await;
    }

    fn drop_connection_on(&mut self, err: &MessagingError) {
        if err.is_transport() {
            self.connection.invalidate();
        }
    }
}
