// src/rabbitmq/handler.rs
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::message::{EventEnvelope, Payload};

/// Processes one inbound domain event. An error rejects the message.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: EventEnvelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: EventEnvelope) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// Answers one RPC request. An error is sent back to the caller as
/// `{"error": "<message>"}`.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: Payload) -> anyhow::Result<Payload>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Payload>> + Send,
{
    async fn handle(&self, request: Payload) -> anyhow::Result<Payload> {
        (self)(request).await
    }
}

/// Dispatches events to a handler per event type.
///
/// The registered types double as the binding keys when the router is
/// passed to `EventBroker::consume`.
#[derive(Default, Clone)]
pub struct EventRouter {
    routes: BTreeMap<String, Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<H>(mut self, event_type: impl Into<String>, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.routes.insert(event_type.into(), Arc::new(handler));
        self
    }

    pub fn event_types(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }
}

#[async_trait]
impl EventHandler for EventRouter {
    async fn handle(&self, event: EventEnvelope) -> anyhow::Result<()> {
        match self.routes.get(&event.event_type) {
            Some(handler) => handler.handle(event).await,
            None => {
                warn!(event_type = %event.event_type, "No handler registered for event");
                Ok(())
            }
        }
    }
}
