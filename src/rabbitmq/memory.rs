// src/rabbitmq/memory.rs
//! In-process broker with the routing, acknowledgement and prefetch rules of
//! RabbitMQ that the messaging components depend on.
//!
//! Used by the test suite and for running services without a broker. Faults
//! can be injected: refuse connections, fail the next N attempts, or sever
//! every live connection at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use tracing::debug;

use super::errors::{MessagingError, Result};
use super::transport::{
    Acknowledge, AutoAcked, Connector, Delivery, DeliveryStream, OutboundMessage, QueueSpec,
    Session,
};

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    reachable: bool,
    failures_pending: u32,
    connect_attempts: u32,
    next_session: u64,
    next_consumer: u64,
    next_tag: u64,
    next_anonymous: u64,
    /// Live sessions and their prefetch limit (0 = unlimited).
    sessions: HashMap<u64, u16>,
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, Unacked>,
    discarded: usize,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    pattern: String,
}

struct Queue {
    spec: QueueSpec,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    cursor: usize,
    owner: Option<u64>,
}

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    routing_key: String,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    persistent: bool,
    redelivered: bool,
}

struct Consumer {
    id: u64,
    session: u64,
    tx: UnboundedSender<Result<Delivery>>,
    auto_ack: bool,
    unacked: usize,
}

struct Unacked {
    queue: String,
    consumer: u64,
    session: u64,
    message: StoredMessage,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                failures_pending: 0,
                connect_attempts: 0,
                next_session: 0,
                next_consumer: 0,
                next_tag: 0,
                next_anonymous: 0,
                sessions: HashMap::new(),
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                unacked: HashMap::new(),
                discarded: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While unreachable every connection attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failures_pending = count;
    }

    /// Drops every live connection, as a network partition would. Consumer
    /// streams end and unacknowledged messages return to their queues.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let sessions: Vec<u64> = state.sessions.keys().copied().collect();
        for session in sessions {
            state.end_session(session, self);
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn live_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Messages waiting in `queue`, excluding those delivered but unacked.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// How `queue` was declared, with the generated name filled in.
    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.lock().queues.get(queue).map(|q| q.spec.clone())
    }

    /// Delivery mode of each message waiting in `queue`, head first.
    pub fn persistent_flags(&self, queue: &str) -> Vec<bool> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.persistent).collect())
            .unwrap_or_default()
    }

    /// Routing keys `queue` is bound with on `exchange`.
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| b.queue == queue)
                    .map(|b| b.pattern.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Messages negatively acknowledged without requeue.
    pub fn discarded(&self) -> usize {
        self.lock().discarded
    }

    fn settle(&self, tag: u64, session: u64, outcome: Settle) -> Result<()> {
        let mut state = self.lock();
        if !state.sessions.contains_key(&session) {
            return Err(MessagingError::Ack("channel closed".to_string()));
        }
        let entry = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| MessagingError::Ack(format!("unknown delivery tag {}", tag)))?;

        if let Some(queue) = state.queues.get_mut(&entry.queue) {
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == entry.consumer) {
                consumer.unacked = consumer.unacked.saturating_sub(1);
            }
            if let Settle::Requeue = outcome {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
        if let Settle::Discard = outcome {
            state.discarded += 1;
        }
        state.dispatch(&entry.queue, self);
        Ok(())
    }
}

enum Settle {
    Ack,
    Requeue,
    Discard,
}

impl BrokerState {
    fn ensure_live(&self, session: u64, err: fn(String) -> MessagingError) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(err("channel closed".to_string()))
        }
    }

    fn declare_queue(&mut self, session: u64, spec: &QueueSpec) -> Result<String> {
        self.ensure_live(session, MessagingError::Channel)?;
        let name = if spec.name.is_empty() {
            self.next_anonymous += 1;
            format!("amq.gen-{}", self.next_anonymous)
        } else {
            spec.name.clone()
        };

        match self.queues.get(&name) {
            Some(queue) => check_owner(queue, &name, session)?,
            None => {
                let queue = Queue {
                    spec: QueueSpec {
                        name: name.clone(),
                        ..spec.clone()
                    },
                    messages: VecDeque::new(),
                    consumers: Vec::new(),
                    cursor: 0,
                    owner: spec.exclusive.then_some(session),
                };
                self.queues.insert(name.clone(), queue);
            }
        }
        Ok(name)
    }

    fn bind(&mut self, session: u64, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_live(session, MessagingError::Channel)?;
        if !self.queues.contains_key(queue) {
            return Err(MessagingError::Channel(format!("no queue '{}'", queue)));
        }
        let bindings = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| MessagingError::Channel(format!("no exchange '{}'", exchange)))?;
        let binding = Binding {
            queue: queue.to_string(),
            pattern: routing_key.to_string(),
        };
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    fn publish(
        &mut self,
        session: u64,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
        handle: &MemoryBroker,
    ) -> Result<()> {
        self.ensure_live(session, MessagingError::Publish)?;

        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let bindings = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| MessagingError::Publish(format!("no exchange '{}'", exchange)))?;
            let mut seen = HashSet::new();
            bindings
                .iter()
                .filter(|b| topic_matches(&b.pattern, routing_key))
                .filter(|b| seen.insert(b.queue.clone()))
                .map(|b| b.queue.clone())
                .collect()
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "Message unroutable, dropped");
        }

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.messages.push_back(StoredMessage {
                    body: message.body.clone(),
                    routing_key: routing_key.to_string(),
                    correlation_id: message.correlation_id.clone(),
                    reply_to: message.reply_to.clone(),
                    persistent: message.persistent,
                    redelivered: false,
                });
            }
            self.dispatch(&target, handle);
        }
        Ok(())
    }

    fn consume(
        &mut self,
        session: u64,
        queue_name: &str,
        auto_ack: bool,
        handle: &MemoryBroker,
    ) -> Result<DeliveryStream> {
        self.ensure_live(session, MessagingError::Consume)?;
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::Consume(format!("no queue '{}'", queue_name)))?;
        check_owner(queue, queue_name, session)?;

        self.next_consumer += 1;
        let (tx, rx) = mpsc::unbounded();
        queue.consumers.push(Consumer {
            id: self.next_consumer,
            session,
            tx,
            auto_ack,
            unacked: 0,
        });
        self.dispatch(queue_name, handle);
        Ok(rx.boxed())
    }

    /// Hands ready messages to consumers with spare prefetch capacity,
    /// round-robin.
    fn dispatch(&mut self, queue_name: &str, handle: &MemoryBroker) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            queue.consumers.retain(|c| !c.tx.is_closed());
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&idx| {
                    let consumer = &queue.consumers[idx];
                    let prefetch = self.sessions.get(&consumer.session).copied().unwrap_or(0);
                    consumer.auto_ack || prefetch == 0 || consumer.unacked < usize::from(prefetch)
                });
            let Some(idx) = chosen else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            queue.cursor = idx + 1;

            let consumer = &mut queue.consumers[idx];
            let mut tag = None;
            let acker: Box<dyn Acknowledge> = if consumer.auto_ack {
                Box::new(AutoAcked)
            } else {
                self.next_tag += 1;
                tag = Some(self.next_tag);
                consumer.unacked += 1;
                self.unacked.insert(
                    self.next_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        consumer: consumer.id,
                        session: consumer.session,
                        message: message.clone(),
                    },
                );
                Box::new(MemoryAcker {
                    broker: handle.clone(),
                    tag: self.next_tag,
                    session: consumer.session,
                })
            };

            let delivery = Delivery::new(message.body.clone(), message.routing_key.clone(), acker)
                .with_properties(
                    message.correlation_id.clone(),
                    message.reply_to.clone(),
                    message.redelivered,
                );

            if consumer.tx.unbounded_send(Ok(delivery)).is_err() {
                if let Some(tag) = tag {
                    self.unacked.remove(&tag);
                }
                queue.consumers.remove(idx);
                queue.messages.push_front(message);
            }
        }
    }

    fn end_session(&mut self, session: u64, handle: &MemoryBroker) {
        if self.sessions.remove(&session).is_none() {
            return;
        }

        let mut orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        // Requeue in original delivery order.
        orphaned.sort_unstable_by(|a, b| b.cmp(a));
        for tag in orphaned {
            if let Some(entry) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.messages.push_front(message);
                }
            }
        }

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.session != session);
        }
        self.queues.retain(|_, queue| queue.owner != Some(session));
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|b| self.queues.contains_key(&b.queue));
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name, handle);
        }
    }
}

fn check_owner(queue: &Queue, name: &str, session: u64) -> Result<()> {
    match queue.owner {
        Some(owner) if owner != session => Err(MessagingError::Channel(format!(
            "queue '{}' is exclusive to another connection",
            name
        ))),
        _ => Ok(()),
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self) -> Result<Arc<dyn Session>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(MessagingError::Unreachable("connection refused".to_string()));
        }
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(MessagingError::Unreachable("connection reset".to_string()));
        }

        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(id, 0);
        Ok(Arc::new(MemorySession {
            broker: self.clone(),
            id,
        }))
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

pub struct MemorySession {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl Session for MemorySession {
    fn is_connected(&self) -> bool {
        self.broker.lock().sessions.contains_key(&self.id)
    }

    async fn declare_topic_exchange(&self, name: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_live(self.id, MessagingError::Channel)?;
        state.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        self.broker.lock().declare_queue(self.id, spec)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.broker.lock().bind(self.id, queue, exchange, routing_key)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_live(self.id, MessagingError::Channel)?;
        state.sessions.insert(self.id, count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        self.broker
            .lock()
            .publish(self.id, exchange, routing_key, message, &self.broker)
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream> {
        self.broker
            .lock()
            .consume(self.id, queue, auto_ack, &self.broker)
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().end_session(self.id, &self.broker);
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.broker.lock().end_session(self.id, &self.broker);
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    tag: u64,
    session: u64,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(self.tag, self.session, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let outcome = if requeue { Settle::Requeue } else { Settle::Discard };
        self.broker.settle(self.tag, self.session, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        stream.next().await.unwrap().unwrap()
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(!topic_matches("order.created", "order.updated"));
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("*.created", "created"));
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let session = broker.open().await.unwrap();
        session.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();

        let message = OutboundMessage::json(&json!({"n": 1})).unwrap();
        session.publish("", "jobs", message.clone()).await.unwrap();
        session.publish("", "missing", message).await.unwrap();

        assert_eq!(broker.queue_depth("jobs"), 1);
        assert!(!broker.has_queue("missing"));
    }

    #[tokio::test]
    async fn topic_exchange_delivers_once_per_queue() {
        let broker = MemoryBroker::new();
        let session = broker.open().await.unwrap();
        session.declare_topic_exchange("events").await.unwrap();
        session.declare_queue(&QueueSpec::durable("audit")).await.unwrap();
        session.bind_queue("audit", "events", "order.*").await.unwrap();
        session.bind_queue("audit", "events", "#").await.unwrap();

        let message = OutboundMessage::json(&json!({})).unwrap();
        session.publish("events", "order.created", message).await.unwrap();

        assert_eq!(broker.queue_depth("audit"), 1);
    }

    #[tokio::test]
    async fn prefetch_holds_back_until_ack() {
        let broker = MemoryBroker::new();
        let session = broker.open().await.unwrap();
        session.declare_queue(&QueueSpec::durable("work")).await.unwrap();
        session.set_prefetch(1).await.unwrap();
        for n in 0..2 {
            let message = OutboundMessage::json(&json!({ "n": n })).unwrap();
            session.publish("", "work", message).await.unwrap();
        }

        let mut stream = session.consume("work", false).await.unwrap();
        let first = next(&mut stream).await;
        assert_eq!(broker.queue_depth("work"), 1);
        assert_eq!(broker.unacked(), 1);

        first.ack().await.unwrap();
        let second = next(&mut stream).await;
        assert_eq!(second.body, br#"{"n":1}"#.to_vec());
        assert_eq!(broker.queue_depth("work"), 0);
    }

    #[tokio::test]
    async fn nack_requeue_redelivers_first() {
        let broker = MemoryBroker::new();
        let session = broker.open().await.unwrap();
        session.declare_queue(&QueueSpec::durable("work")).await.unwrap();
        session.set_prefetch(1).await.unwrap();
        let mut stream = session.consume("work", false).await.unwrap();

        let message = OutboundMessage::json(&json!({"n": 0})).unwrap();
        session.publish("", "work", message).await.unwrap();
        let first = next(&mut stream).await;
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let again = next(&mut stream).await;
        assert!(again.redelivered);
        again.nack(false).await.unwrap();
        assert_eq!(broker.discarded(), 1);
        assert_eq!(broker.queue_depth("work"), 0);
    }

    #[tokio::test]
    async fn severed_session_ends_streams_and_drops_exclusive_queues() {
        let broker = MemoryBroker::new();
        let session = broker.open().await.unwrap();
        let reply_queue = session
            .declare_queue(&QueueSpec::exclusive_reply())
            .await
            .unwrap();
        assert!(reply_queue.starts_with("amq.gen-"));
        session.declare_queue(&QueueSpec::durable("work")).await.unwrap();
        let message = OutboundMessage::json(&json!({})).unwrap();
        session.publish("", "work", message).await.unwrap();
        let mut stream = session.consume("work", false).await.unwrap();
        let _unacked = next(&mut stream).await;

        broker.sever_connections();

        assert!(!session.is_connected());
        assert!(stream.next().await.is_none());
        assert!(!broker.has_queue(&reply_queue));
        assert_eq!(broker.queue_depth("work"), 1);
        assert!(session
            .publish("", "work", OutboundMessage::json(&json!({})).unwrap())
            .await
            .unwrap_err()
            .is_transport());
    }

    #[tokio::test]
    async fn dropped_session_behaves_like_a_closed_connection() {
        let broker = MemoryBroker::new();
        let session = broker.open().await.unwrap();
        let reply_queue = session
            .declare_queue(&QueueSpec::exclusive_reply())
            .await
            .unwrap();
        session.declare_queue(&QueueSpec::durable("work")).await.unwrap();
        let message = OutboundMessage::json(&json!({})).unwrap();
        session.publish("", "work", message).await.unwrap();
        let mut stream = session.consume("work", false).await.unwrap();
        let _unacked = next(&mut stream).await;
        assert_eq!(broker.unacked(), 1);

        drop(session);

        assert_eq!(broker.live_sessions(), 0);
        assert_eq!(broker.unacked(), 0);
        assert_eq!(broker.queue_depth("work"), 1);
        assert!(!broker.has_queue(&reply_queue));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn declarations_and_delivery_mode_are_recorded() {
        let broker = MemoryBroker::new();
        let session = broker.open().await.unwrap();
        session.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
        let anonymous = session
            .declare_queue(&QueueSpec::exclusive_reply())
            .await
            .unwrap();

        let durable = broker.queue_spec("jobs").unwrap();
        assert!(durable.durable && !durable.auto_delete);
        let reply = broker.queue_spec(&anonymous).unwrap();
        assert_eq!(reply.name, anonymous);
        assert!(reply.exclusive && reply.auto_delete && !reply.durable);

        let message = OutboundMessage::json(&json!({})).unwrap();
        session.publish("", "jobs", message.clone().persistent()).await.unwrap();
        session.publish("", "jobs", message).await.unwrap();
        assert_eq!(broker.persistent_flags("jobs"), vec![true, false]);
    }

    #[tokio::test]
    async fn exclusive_queue_rejects_other_sessions() {
        let broker = MemoryBroker::new();
        let owner = broker.open().await.unwrap();
        let other = broker.open().await.unwrap();
        let name = owner
            .declare_queue(&QueueSpec::exclusive_reply())
            .await
            .unwrap();

        assert!(other.consume(&name, true).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_broker_counts_attempts() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        assert!(broker.open().await.is_err());
        broker.set_reachable(true);
        broker.fail_next_connects(1);
        assert!(broker.open().await.is_err());
        assert!(broker.open().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }
}
