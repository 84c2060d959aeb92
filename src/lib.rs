pub mod config;
pub mod rabbitmq;

pub use config::BrokerConfig;
pub use rabbitmq::{
    to_payload, EventBroker, EventEnvelope, EventHandler, EventRouter, FailurePolicy,
    MessagingError, Payload, RpcClient, RpcHandler, RpcReply, RpcServer, Worker,
};
