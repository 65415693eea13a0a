//! The wire envelope carried by every bus message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use switchyard_core::SwitchyardResult;
use uuid::Uuid;

/// Communication pattern a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Broadcast,
    Task,
    Result,
    Error,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Broadcast => "broadcast",
            MessageType::Task => "task",
            MessageType::Result => "result",
            MessageType::Error => "error",
            MessageType::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message priority. Serialized as its integer value (1-4).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Critical),
            other => Err(format!("invalid priority {other}, expected 1-4")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as u8
    }
}

fn default_max_retries() -> u32 {
    3
}

/// Envelope for every message on the bus.
///
/// The JSON form is the contract between processes: enum fields use their
/// string/integer values and timestamps are RFC 3339 strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub message_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub message_type: MessageType,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    /// Logical subject (event type, task type, ...), not necessarily the routing subject.
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Number of earlier deliveries of this message to the current handler.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl MessageContent {
    /// A fresh envelope with a new id and default settings.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            message_type,
            sender_id: None,
            recipient_id: None,
            subject: String::new(),
            payload: Map::new(),
            priority: Priority::Normal,
            expires_at: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            created_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set the payload. Objects are used as-is, `null` becomes an empty
    /// payload, and any other value is wrapped as `{"value": ...}`.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = into_payload(payload);
        self
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Expire the message `ttl` from now.
    pub fn expires_in(mut self, ttl: std::time::Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() > at)
    }

    /// A `response` envelope answering this message (same correlation id).
    pub fn response_to(&self, payload: Value) -> Self {
        let mut response = Self::new(MessageType::Response)
            .with_subject(self.subject.clone())
            .with_payload(payload)
            .with_priority(self.priority);
        response.correlation_id = self.correlation_id.clone();
        response.recipient_id = self.sender_id.clone();
        response
    }

    /// Canonical JSON bytes.
    pub fn to_wire(&self) -> SwitchyardResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> SwitchyardResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Coerce an arbitrary JSON value into an envelope payload.
pub fn into_payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_wire_roundtrip_is_lossless() {
        let message = MessageContent::new(MessageType::Task)
            .with_subject("lint")
            .with_payload(json!({"file": "main.rs", "lines": [1, 2, 3]}))
            .with_sender("producer")
            .with_recipient("agent-7")
            .with_priority(Priority::Critical)
            .with_correlation_id("corr-1")
            .expires_in(Duration::from_secs(60));

        let decoded = MessageContent::from_wire(&message.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_wire_shape() {
        let message = MessageContent::new(MessageType::Heartbeat).with_priority(Priority::High);
        let json: Value = serde_json::from_slice(&message.to_wire().unwrap()).unwrap();
        assert_eq!(json["message_type"], "heartbeat");
        assert_eq!(json["priority"], 3);
        assert_eq!(json["max_retries"], 3);
        assert!(json["correlation_id"].is_null());
        assert!(json["created_at"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_minimal_envelope_gets_defaults() {
        let raw = json!({
            "message_id": "m-1",
            "message_type": "event",
            "created_at": "2024-05-01T12:00:00Z",
        });
        let message: MessageContent = serde_json::from_value(raw).unwrap();
        assert_eq!(message.priority, Priority::Normal);
        assert_eq!(message.max_retries, 3);
        assert_eq!(message.subject, "");
        assert!(message.payload.is_empty());
    }

    #[test]
    fn test_invalid_priority_rejected() {
        let raw = json!({
            "message_id": "m-1",
            "message_type": "event",
            "priority": 9,
            "created_at": "2024-05-01T12:00:00Z",
        });
        assert!(serde_json::from_value::<MessageContent>(raw).is_err());
    }

    #[test]
    fn test_expiry() {
        let fresh = MessageContent::new(MessageType::Event).expires_in(Duration::from_secs(60));
        assert!(!fresh.is_expired());

        let mut stale = MessageContent::new(MessageType::Event);
        stale.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(stale.is_expired());
    }

    #[test]
    fn test_response_keeps_correlation() {
        let request = MessageContent::new(MessageType::Request)
            .with_subject("switchyard.rpc.ping")
            .with_sender("caller")
            .with_correlation_id("c-9");
        let response = request.response_to(json!("pong"));
        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.correlation_id.as_deref(), Some("c-9"));
        assert_eq!(response.recipient_id.as_deref(), Some("caller"));
        assert_eq!(response.payload["value"], "pong");
    }
}
