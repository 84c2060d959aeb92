// src/rabbitmq/connection.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::errors::{MessagingError, Result};
use super::transport::{Connector, Session};
use crate::config::BrokerConfig;

/// How many times to try reaching the broker and how long to wait between
/// attempts. The delay is fixed, not exponential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl From<&BrokerConfig> for RetryPolicy {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected(Arc<dyn Session>),
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Connecting { attempt } => write!(f, "Connecting({})", attempt),
            ConnectionState::Connected(_) => f.write_str("Connected"),
        }
    }
}

/// Owns the broker connection of exactly one component.
///
/// A connection that fails during use is dropped, never repaired: the next
/// `ensure_connected` starts over from `Disconnected`.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    state: ConnectionState,
    generation: u64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        ConnectionManager {
            connector,
            policy: RetryPolicy::default(),
            state: ConnectionState::Disconnected,
            generation: 0,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(&self.state, ConnectionState::Connected(session) if session.is_connected())
    }

    /// Bumped on every successful connect. Components compare it to know when
    /// their queues and consumers need declaring again.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(
            endpoint = %self.connector.endpoint(),
            from = ?self.state,
            to = ?next,
            "Connection state change"
        );
        self.state = next;
    }

    /// Returns the live session, connecting with the configured policy if
    /// there is none.
    pub async fn ensure_connected(&mut self) -> Result<Arc<dyn Session>> {
        if let ConnectionState::Connected(session) = &self.state {
            if session.is_connected() {
                return Ok(session.clone());
            }
            warn!(endpoint = %self.connector.endpoint(), "Connection lost, reconnecting");
        }
        let RetryPolicy {
            max_retries,
            retry_delay,
        } = self.policy;
        self.connect(max_retries, retry_delay).await
    }

    /// Tries up to `max_retries` times, sleeping `retry_delay` between
    /// attempts. Exhaustion yields `MessagingError::Connection`.
    pub async fn connect(
        &mut self,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Arc<dyn Session>> {
        let max_retries = max_retries.max(1);
        let endpoint = self.connector.endpoint();

        for attempt in 1..=max_retries {
            self.transition(ConnectionState::Connecting { attempt });
            info!(
                endpoint = %endpoint,
                attempt,
                max_retries,
                "Attempting to connect to RabbitMQ"
            );

            match self.connector.open().await {
                Ok(session) => {
                    self.generation += 1;
                    self.transition(ConnectionState::Connected(session.clone()));
                    info!(endpoint = %endpoint, "Successfully connected to RabbitMQ");
                    return Ok(session);
                }
                Err(err) if attempt < max_retries => {
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        max_retries,
                        error = %err,
                        "Failed to connect to RabbitMQ, retrying in {:?}",
                        retry_delay
                    );
                    sleep(retry_delay).await;
                }
                Err(err) => {
                    error!(
                        endpoint = %endpoint,
                        max_retries,
                        error = %err,
                        "Max retries exceeded. Could not connect to RabbitMQ"
                    );
                    self.transition(ConnectionState::Disconnected);
                    return Err(MessagingError::Connection {
                        attempts: max_retries,
                        reason: err.to_string(),
                    });
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
        Err(MessagingError::Connection {
            attempts: max_retries,
            reason: "no attempt made".to_string(),
        })
    }

    /// Forgets the current connection after a transport failure.
    pub fn invalidate(&mut self) {
        if !matches!(self.state, ConnectionState::Disconnected) {
            warn!(endpoint = %self.connector.endpoint(), "Dropping broken connection");
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// Closes the connection gracefully. Errors while closing are logged, not
    /// returned; the manager ends up `Disconnected` either way.
    pub async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Disconnected);
        if let ConnectionState::Connected(session) = previous {
            match session.close().await {
                Ok(()) => info!(endpoint = %self.connector.endpoint(), "RabbitMQ connection closed"),
                Err(err) => warn!(error = %err, "Error closing RabbitMQ connection"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::MemoryBroker;
    use tokio::time::Instant;

    fn manager(broker: &MemoryBroker, max_retries: u32, delay_secs: u64) -> ConnectionManager {
        ConnectionManager::new(Arc::new(broker.clone())).with_retry_policy(RetryPolicy {
            max_retries,
            retry_delay: Duration::from_secs(delay_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exactly_max_times_with_fixed_delay() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let mut connection = manager(&broker, 4, 2);

        let started = Instant::now();
        let Err(err) = connection.ensure_connected().await else { panic!("expected connection error") };

        assert!(matches!(err, MessagingError::Connection { attempts: 4, .. }));
        assert_eq!(broker.connect_attempts(), 4);
        // Three sleeps between four attempts, none after the last.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert!(matches!(connection.state(), ConnectionState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_broker_comes_back_within_budget() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let mut connection = manager(&broker, 5, 1);

        connection.ensure_connected().await.unwrap();

        assert_eq!(broker.connect_attempts(), 3);
        assert!(connection.is_connected());
        assert_eq!(connection.generation(), 1);
    }

    #[tokio::test]
    async fn ensure_connected_is_idempotent() {
        let broker = MemoryBroker::new();
        let mut connection = manager(&broker, 3, 1);

        connection.ensure_connected().await.unwrap();
        connection.ensure_connected().await.unwrap();

        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(connection.generation(), 1);
    }

    #[tokio::test]
    async fn rebuilds_after_connection_loss() {
        let broker = MemoryBroker::new();
        let mut connection = manager(&broker, 3, 1);
        connection.ensure_connected().await.unwrap();

        broker.sever_connections();
        assert!(!connection.is_connected());

        connection.ensure_connected().await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(connection.generation(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_connection() {
        let broker = MemoryBroker::new();
        let mut connection = manager(&broker, 3, 1);
        connection.ensure_connected().await.unwrap();

        connection.invalidate();
        assert!(matches!(connection.state(), ConnectionState::Disconnected));
        assert_eq!(broker.live_sessions(), 0);

        connection.ensure_connected().await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn close_releases_the_session() {
        let broker = MemoryBroker::new();
        let mut connection = manager(&broker, 3, 1);
        connection.ensure_connected().await.unwrap();
        assert_eq!(broker.live_sessions(), 1);

        connection.close().await;

        assert_eq!(broker.live_sessions(), 0);
        assert!(!connection.is_connected());
    }
}
