// src/rabbitmq/mod.rs
// Messaging over RabbitMQ: domain events on a topic exchange and
// request/reply RPC over named queues.

pub mod errors;
pub mod connection;
pub mod transport;
pub mod message;
pub mod handler;
pub mod events;
pub mod rpc_client;
pub mod rpc_server;
pub mod worker;
pub mod memory;

mod amqp_client;

pub use amqp_client::{AmqpConnector, AmqpSession};
pub use connection::{ConnectionManager, ConnectionState, RetryPolicy};
pub use errors::{MessagingError, Result};
pub use events::{EventBroker, FailurePolicy, EVENTS_EXCHANGE};
pub use handler::{EventHandler, EventRouter, RpcHandler};
pub use memory::MemoryBroker;
pub use message::{to_payload, EventEnvelope, Payload, RpcReply};
pub use rpc_client::{RpcClient, DEFAULT_RPC_TIMEOUT};
pub use rpc_server::RpcServer;
pub use transport::{Connector, Delivery, DeliveryStream, OutboundMessage, QueueSpec, Session};
pub use worker::{ShutdownSignal, Worker};
