// src/rabbitmq/rpc_server.rs
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use super::amqp_client::AmqpConnector;
use super::connection::{ConnectionManager, RetryPolicy};
use super::errors::{MessagingError, Result};
use super::handler::RpcHandler;
use super::message::{Payload, RpcReply};
use super::transport::{Connector, Delivery, OutboundMessage, QueueSpec, Session};
use super::worker::Worker;
use crate::config::BrokerConfig;

/// Serves requests from one durable queue, strictly one at a time.
pub struct RpcServer {
    connection: ConnectionManager,
    queue_name: String,
}

impl RpcServer {
    /// Connects and declares the request queue.
    pub async fn new(connector: Arc<dyn Connector>, queue_name: impl Into<String>) -> Result<Self> {
        Self::with_retry_policy(connector, queue_name, RetryPolicy::default()).await
    }

    pub async fn with_retry_policy(
        connector: Arc<dyn Connector>,
        queue_name: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let mut server = RpcServer {
            connection: ConnectionManager::new(connector).with_retry_policy(policy),
            queue_name: queue_name.into(),
        };
        server.declare_queue().await?;
        Ok(server)
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

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    async fn declare_queue(&mut self) -> Result<Arc<dyn Session>> {
        let session = self.connection.ensure_connected().await?;
        session
            .declare_queue(&QueueSpec::durable(self.queue_name.clone()))
            .await?;
        Ok(session)
    }

    /// Answers requests until the connection fails. Never returns `Ok`.
    pub async fn serve<H: RpcHandler>(&mut self, handler: H) -> Result<()> {
        self.serve_until(handler, std::future::pending()).await
    }

    /// Like `serve`, returning `Ok(())` once `shutdown` resolves. A request
    /// being processed at that point is finished first.
    pub async fn serve_until<H, F>(&mut self, handler: H, shutdown: F) -> Result<()>
    where
        H: RpcHandler,
        F: Future<Output = ()>,
    {
        let result = self.run(&handler, shutdown).await;
        if let Err(err) = &result {
            error!(queue = %self.queue_name, error = %err, "RPC server stopped");
            if err.is_transport() {
                self.connection.invalidate();
            }
        }
        result
    }

    async fn run<H, F>(&mut self, handler: &H, shutdown: F) -> Result<()>
    where
        H: RpcHandler,
        F: Future<Output = ()>,
    {
        let session = self.declare_queue().await?;
        session.set_prefetch(1).await?;
        let mut requests = session.consume(&self.queue_name, false).await?;
        info!(queue = %self.queue_name, "RPC server started");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(queue = %self.queue_name, "RPC server stopping");
                    return Ok(());
                }
                next = requests.next() => match next {
                    Some(Ok(delivery)) => self.answer(session.as_ref(), delivery, handler).await?,
                    Some(Err(err)) => return Err(err),
                    None => {
                        return Err(MessagingError::Consume(
                            "request stream closed by broker".to_string(),
                        ))
                    }
                },
            }
        }
    }

    /// Handles one request. Only transport errors are returned.
    async fn answer<H: RpcHandler>(
        &self,
        session: &dyn Session,
        delivery: Delivery,
        handler: &H,
    ) -> Result<()> {
        let Some(reply_to) = delivery.reply_to.clone() else {
            warn!(queue = %self.queue_name, "Received RPC request without reply_to, rejecting");
            return delivery.nack(false).await;
        };
        let correlation_id = delivery.correlation_id.clone();
        debug!(queue = %self.queue_name, correlation_id = ?correlation_id, "Received RPC request");

        let outcome = match serde_json::from_slice::<Payload>(&delivery.body) {
            Ok(request) => handler.handle(request).await.map_err(|e| format!("{:#}", e)),
            Err(err) => Err(format!("invalid request: {}", err)),
        };

        match outcome {
            Ok(response) => {
                reply(session, &reply_to, correlation_id.as_deref(), &response).await?;
                delivery.ack().await
            }
            Err(message) => {
                warn!(
                    queue = %self.queue_name,
                    correlation_id = ?correlation_id,
                    error = %message,
                    "Error processing RPC request"
                );
                let body = RpcReply::error_body(message);
                let sent = reply(session, &reply_to, correlation_id.as_deref(), &body).await;
                if let Err(err) = sent {
                    warn!(error = %err, "Could not send error reply");
                }
                delivery.nack(false).await
            }
        }
    }

    /// Moves the server onto its own task, serving until shutdown.
    pub fn spawn_server<H>(mut self, handler: H) -> Worker
    where
        H: RpcHandler + 'static,
    {
        let name = self.queue_name.clone();
        Worker::spawn(name, move |shutdown| async move {
            let result = self.serve_until(handler, shutdown.recv()).await;
            self.close().await;
            result
        })
    }

    pub async fn close(&mut self) {
        self.connection.close().await;
    }
}

async fn reply(
    session: &dyn Session,
    reply_to: &str,
    correlation_id: Option<&str>,
    body: &Payload,
) -> Result<()> {
    let mut message = OutboundMessage::json(body)?;
    if let Some(id) = correlation_id {
        message = message.correlation_id(id);
    }
    session.publish("", reply_to, message).await
}
