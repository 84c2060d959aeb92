// src/rabbitmq/message.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{MessagingError, Result};

/// JSON object carried by events and RPC messages.
pub type Payload = Map<String, Value>;

/// Converts any serializable value into a `Payload`, rejecting values that
/// are not JSON objects.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Payload> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(MessagingError::InvalidPayload(json_kind(&other).to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A domain event as it travels over the topic exchange. `event_type` is
/// also the routing key.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct EventEnvelope {
    pub event_type: String,
    pub data: Payload,
    pub timestamp: DateTime<Utc>,
    pub service: String,
}

impl EventEnvelope {
    /// Creates an envelope stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: Payload, service: impl Into<String>) -> Self {
        EventEnvelope {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            service: service.into(),
        }
    }

    /// Checks if the event is of a specific type.
    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

/// What an RPC caller gets back: the handler's payload, or the structured
/// error the server sends when the handler fails.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcReply {
    Payload(Payload),
    Error(String),
}

impl RpcReply {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let payload: Payload = serde_json::from_slice(body).map_err(MessagingError::decode)?;
        Ok(Self::from_payload(payload))
    }

    /// An object whose only key is a string `error` is the error form.
    pub fn from_payload(payload: Payload) -> Self {
        if payload.len() == 1 {
            if let Some(Value::String(message)) = payload.get("error") {
                return RpcReply::Error(message.clone());
            }
        }
        RpcReply::Payload(payload)
    }

    pub fn error_body(message: impl Into<String>) -> Payload {
        let mut body = Payload::new();
        body.insert("error".to_string(), Value::String(message.into()));
        body
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RpcReply::Error(_))
    }

    pub fn into_result(self) -> Result<Payload> {
        match self {
            RpcReply::Payload(payload) => Ok(payload),
            RpcReply::Error(message) => Err(MessagingError::Remote(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_format() {
        let data = to_payload(&json!({"order_number": "ABC123"})).unwrap();
        let envelope = EventEnvelope::new("order.created", data, "order_service");

        let wire: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["event_type"], "order.created");
        assert_eq!(wire["data"]["order_number"], "ABC123");
        assert_eq!(wire["service"], "order_service");
        let timestamp = wire["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());

        let back: EventEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back, envelope);
        assert!(back.is_type("order.created"));
    }

    #[test]
    fn to_payload_rejects_non_objects() {
        let err = to_payload(&json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, MessagingError::InvalidPayload(kind) if kind == "an array"));
    }

    #[test]
    fn reply_with_lone_error_key_is_an_error() {
        let reply = RpcReply::from_body(br#"{"error": "Product not found"}"#).unwrap();
        assert_eq!(reply, RpcReply::Error("Product not found".into()));
        assert!(matches!(reply.into_result(), Err(MessagingError::Remote(m)) if m == "Product not found"));
    }

    #[test]
    fn reply_mentioning_error_among_other_fields_is_a_payload() {
        let reply =
            RpcReply::from_body(br#"{"available": false, "error": "out of stock"}"#).unwrap();
        assert!(!reply.is_error());
    }

    #[test]
    fn reply_body_must_be_an_object() {
        assert!(matches!(
            RpcReply::from_body(b"not json"),
            Err(MessagingError::Decode(_))
        ));
        assert!(matches!(
            RpcReply::from_body(b"[1]"),
            Err(MessagingError::Decode(_))
        ));
    }
}
