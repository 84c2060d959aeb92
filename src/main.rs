use std::time::Duration;

use anyhow::{bail, Context};
use rabbitmq_bridge::config::BrokerConfig;
use rabbitmq_bridge::rabbitmq::{
    to_payload, EventBroker, EventEnvelope, Payload, RpcClient, RpcReply, RpcServer,
    DEFAULT_RPC_TIMEOUT,
};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  rabbitmq-bridge publish <event_type> <json-object>
  rabbitmq-bridge consume <event_type>...
  rabbitmq-bridge serve <queue>
  rabbitmq-bridge call <queue> <json-object> [timeout_secs]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        bail!(USAGE);
    };

    let config = BrokerConfig::load().context("invalid broker configuration")?;
    info!(endpoint = %config.endpoint(), service = %config.service_name, "Loaded configuration");

    match (command.as_str(), rest) {
        ("publish", [event_type, json]) => publish(&config, event_type, json).await,
        ("consume", types) if !types.is_empty() => consume(&config, types).await,
        ("serve", [queue]) => serve(&config, queue).await,
        ("call", [queue, json]) => call(&config, queue, json, DEFAULT_RPC_TIMEOUT).await,
        ("call", [queue, json, secs]) => {
            let secs: u64 = secs.parse().context("timeout_secs must be a whole number")?;
            call(&config, queue, json, Duration::from_secs(secs)).await
        }
        _ => bail!(USAGE),
    }
}

fn parse_payload(json: &str) -> anyhow::Result<Payload> {
    let value: Value = serde_json::from_str(json).context("payload is not valid JSON")?;
    Ok(to_payload(&value)?)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received, shutting down"),
        Err(err) => warn!(error = %err, "Could not listen for Ctrl-C, shutting down"),
    }
}

async fn publish(config: &BrokerConfig, event_type: &str, json: &str) -> anyhow::Result<()> {
    let data = parse_payload(json)?;
    let mut broker = EventBroker::from_config(config);
    let result = broker.publish(event_type, data).await;
    broker.close().await;
    Ok(result?)
}

async fn consume(config: &BrokerConfig, event_types: &[String]) -> anyhow::Result<()> {
    let mut broker = EventBroker::from_config(config);
    let handler = |event: EventEnvelope| async move {
        info!(
            event_type = %event.event_type,
            from = %event.service,
            timestamp = %event.timestamp,
            data = ?event.data,
            "Event"
        );
        Ok::<_, anyhow::Error>(())
    };
    let result = broker
        .consume_until(event_types, handler, shutdown_signal())
        .await;
    broker.close().await;
    Ok(result?)
}

async fn serve(config: &BrokerConfig, queue: &str) -> anyhow::Result<()> {
    let mut server = RpcServer::from_config(config, queue).await?;
    let echo = |request: Payload| async move { Ok::<_, anyhow::Error>(request) };
    let result = server.serve_until(echo, shutdown_signal()).await;
    server.close().await;
    Ok(result?)
}

async fn call(
    config: &BrokerConfig,
    queue: &str,
    json: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let payload = parse_payload(json)?;
    let mut client = RpcClient::from_config(config, queue).await?;
    let result = client.call(&payload, timeout).await;
    client.close().await;

    let body = match result? {
        RpcReply::Payload(payload) => payload,
        RpcReply::Error(message) => RpcReply::error_body(message),
    };
    println!("{}", serde_json::to_string_pretty(&Value::Object(body))?);
    Ok(())
}
