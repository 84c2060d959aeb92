mod common;

use std::time::Duration;

use rabbitmq_bridge::rabbitmq::{
    EventBroker, MemoryBroker, MessagingError, Payload, RpcClient, RpcServer,
};
use tokio::time::Instant;

use common::{connector, quick_retries};

#[tokio::test(start_paused = true)]
async fn publish_waits_out_a_short_outage() {
    let memory = MemoryBroker::new();
    memory.fail_next_connects(2);
    let mut broker = EventBroker::new(connector(&memory), "order_service")
        .with_retry_policy(quick_retries(5));

    let started = Instant::now();
    broker.publish("order.created", Payload::new()).await.unwrap();

    assert_eq!(memory.connect_attempts(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn rpc_client_construction_gives_up_after_max_retries() {
    let memory = MemoryBroker::new();
    memory.set_reachable(false);

    let started = Instant::now();
    let result =
        RpcClient::with_retry_policy(connector(&memory), "any_queue", quick_retries(3)).await;

    assert!(matches!(
        result,
        Err(MessagingError::Connection { attempts: 3, .. })
    ));
    assert_eq!(memory.connect_attempts(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn event_broker_reconnects_after_the_connection_is_severed() {
    let memory = MemoryBroker::new();
    let mut broker = EventBroker::new(connector(&memory), "order_service")
        .with_retry_policy(quick_retries(3));
    broker.publish("order.created", Payload::new()).await.unwrap();

    memory.sever_connections();
    broker.publish("order.created", Payload::new()).await.unwrap();

    assert_eq!(memory.connect_attempts(), 2);
    assert!(broker.connection().is_connected());
    assert_eq!(broker.connection().generation(), 2);
}

#[tokio::test(start_paused = true)]
async fn server_can_serve_again_after_a_transport_failure() {
    let memory = MemoryBroker::new();
    let mut server =
        RpcServer::with_retry_policy(connector(&memory), "echo_queue", quick_retries(3))
            .await
            .unwrap();
    let echo = |request: Payload| async move { Ok::<_, anyhow::Error>(request) };

    let severing = {
        let memory = memory.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            memory.sever_connections();
        }
    };
    let (served, ()) = tokio::join!(server.serve(echo), severing);
    assert!(served.unwrap_err().is_transport());
    assert!(!server.connection().is_connected());

    // A supervisor restarts the loop; it reconnects and redeclares.
    let worker = server.spawn_server(echo);
    let mut client = RpcClient::new(connector(&memory), "echo_queue").await.unwrap();
    let mut request = Payload::new();
    request.insert("ping".to_string(), serde_json::json!(true));
    let reply = client.call(&request, Duration::from_secs(5)).await.unwrap();

    assert_eq!(reply.into_result().unwrap(), request);
    worker.shutdown().await.unwrap();
}
