// src/config.rs
use std::env;
use std::time::Duration;

use dotenv::dotenv;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};

use crate::rabbitmq::{MessagingError, Result};

/// Heartbeat negotiated with the broker. Long enough that slow handlers are
/// not disconnected mid-message.
pub const HEARTBEAT: Duration = Duration::from_secs(600);

/// How long a publish may stay blocked (broker resource alarm) before the
/// connection is considered broken.
pub const BLOCKED_CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Broker connection settings, sourced from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub service_name: String,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
}

fn default_host() -> String {
    "rabbitmq".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_username() -> String {
    "myuser".to_string()
}

fn default_password() -> String {
    "mypassword".to_string()
}

fn default_service_name() -> String {
    "service".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_seconds() -> u64 {
    2
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            vhost: default_vhost(),
            username: default_username(),
            password: default_password(),
            service_name: default_service_name(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

impl BrokerConfig {
    /// Reads `.env` (if present) and then the process environment.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset keys fall back to
    /// the local-development defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: fn() -> String| lookup(key).unwrap_or_else(default);

        Ok(BrokerConfig {
            host: string("RABBITMQ_HOST", default_host),
            port: match lookup("RABBITMQ_PORT") {
                Some(val) => parse_var("RABBITMQ_PORT", &val)?,
                None => default_port(),
            },
            vhost: string("RABBITMQ_VHOST", default_vhost),
            username: string("RABBITMQ_DEFAULT_USER", default_username),
            password: string("RABBITMQ_DEFAULT_PASS", default_password),
            service_name: string("SERVICE_NAME", default_service_name),
            max_retries: match lookup("RABBITMQ_CONNECT_RETRIES") {
                Some(val) => parse_var("RABBITMQ_CONNECT_RETRIES", &val)?,
                None => default_max_retries(),
            },
            retry_delay_seconds: match lookup("RABBITMQ_RETRY_DELAY_SECONDS") {
                Some(val) => parse_var("RABBITMQ_RETRY_DELAY_SECONDS", &val)?,
                None => default_retry_delay_seconds(),
            },
        })
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    /// Connection parameters for lapin. Built field by field so the vhost and
    /// credentials never need percent-encoding.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(HEARTBEAT.as_secs() as u16),
                ..AMQPQueryString::default()
            },
        }
    }

    /// `host:port/vhost`, safe to log.
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, display_vhost(&self.vhost))
    }
}

fn display_vhost(vhost: &str) -> String {
    if vhost.starts_with('/') {
        vhost.to_string()
    } else {
        format!("/{}", vhost)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| MessagingError::Config(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = BrokerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.host, "rabbitmq");
        assert_eq!(config.port, 5672);
        assert_eq!(config.vhost, "/");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_config_overrides() {
        let config = BrokerConfig::from_lookup(lookup(&[
            ("RABBITMQ_HOST", "broker.internal"),
            ("RABBITMQ_PORT", "5673"),
            ("RABBITMQ_VHOST", "orders"),
            ("RABBITMQ_DEFAULT_USER", "svc"),
            ("RABBITMQ_DEFAULT_PASS", "s3cret"),
            ("SERVICE_NAME", "order_service"),
            ("RABBITMQ_CONNECT_RETRIES", "3"),
            ("RABBITMQ_RETRY_DELAY_SECONDS", "1"),
        ]))
        .unwrap();

        assert_eq!(config.host, "broker.internal");
        assert_eq!(config.port, 5673);
        assert_eq!(config.service_name, "order_service");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.endpoint(), "broker.internal:5673/orders");
    }

    #[test]
    fn test_config_rejects_bad_port() {
        let err = BrokerConfig::from_lookup(lookup(&[("RABBITMQ_PORT", "amqp")])).unwrap_err();
        assert!(matches!(err, MessagingError::Config(msg) if msg.contains("RABBITMQ_PORT")));
    }

    #[test]
    fn test_amqp_uri_carries_heartbeat_and_credentials() {
        let config = BrokerConfig::default();
        let uri = config.amqp_uri();
        assert_eq!(uri.authority.host, "rabbitmq");
        assert_eq!(uri.authority.userinfo.username, "myuser");
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.query.heartbeat, Some(600));
        assert_eq!(config.endpoint(), "rabbitmq:5672/");
    }
}
