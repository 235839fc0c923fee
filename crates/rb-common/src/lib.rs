// Relaybox Common - Shared types for the reliable messaging layer
//
// This crate defines the outbox record model, the consumer-side envelope,
// the wire header contract, and the error type used across the workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod observer;

pub use observer::{
    DeliveryEvent, DeliveryObserver, DeliveryOutcome, LogObserver, NullObserver,
};

// ============================================================================
// Wire Contract
// ============================================================================

/// Header counting how many times a delivery has been routed back through
/// the retry queue.
pub const HEADER_REDELIVERY_COUNT: &str = "redelivery_count";

/// Header naming the application whose retry publish produced this delivery.
/// Consumers ignore retries stamped with a different application name.
pub const HEADER_RETRY_ENDPOINT: &str = "retry_endpoint";

/// Fallback header for the message type when the AMQP `type` property is
/// not set.
pub const HEADER_TYPE: &str = "type";

/// Header under which retry and dead-letter publishes record the handler
/// error messages that caused them.
pub const HEADER_ERRORS: &str = "errors";

// ============================================================================
// Outbox Records
// ============================================================================

/// Publication status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundStatus {
    PENDING,
    SENT,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundStatus::PENDING => "PENDING",
            OutboundStatus::SENT => "SENT",
        }
    }
}

impl std::str::FromStr for OutboundStatus {
    type Err = RelayboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OutboundStatus::PENDING),
            "SENT" => Ok(OutboundStatus::SENT),
            other => Err(RelayboxError::Serialization(format!(
                "Unknown outbound status: {}",
                other
            ))),
        }
    }
}

/// Optional AMQP properties carried by an outbox record.
///
/// Persistent delivery mode is not represented here: the connection layer
/// forces it on every publish regardless of what the record says.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

/// A message persisted alongside business state, waiting for the relay to
/// publish it to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Store primary key.
    pub id: String,
    /// Broker-level identity; consumers key deduplication on it.
    pub message_id: String,
    pub exchange: String,
    pub routing_key: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub headers: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub properties: DeliveryProperties,
    pub body: serde_json::Value,
    pub status: OutboundStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// Create a pending record with generated `id` and `message_id`.
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        message_type: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            message_id: Uuid::new_v4().to_string(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message_type: message_type.into(),
            headers: serde_json::Map::new(),
            properties: DeliveryProperties::default(),
            body,
            status: OutboundStatus::PENDING,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_headers(mut self, headers: serde_json::Map<String, serde_json::Value>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_properties(mut self, properties: DeliveryProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == OutboundStatus::PENDING
    }

    /// Transition the record to SENT and stamp `sent_at`.
    ///
    /// Refuses to run twice: a record that is already SENT stays untouched
    /// and the caller gets an error, so an accidental double relay cannot
    /// silently rewrite the send timestamp.
    pub fn mark_as_sent(&mut self) -> Result<()> {
        if self.status == OutboundStatus::SENT {
            return Err(RelayboxError::AlreadySent(self.message_id.clone()));
        }
        let now = Utc::now();
        self.status = OutboundStatus::SENT;
        self.sent_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

// ============================================================================
// Inbound Envelope
// ============================================================================

/// Consumer-side view of one broker delivery.
///
/// Transient: valid only for the lifetime of the delivery it was decoded
/// from, never persisted.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// AMQP `message-id` property, if the publisher set one.
    pub message_id: Option<String>,
    /// AMQP `type` property, falling back to the `type` header.
    pub message_type: Option<String>,
    /// Parsed `redelivery_count` header; absent or malformed reads as zero.
    pub redelivery_count: u32,
    /// Parsed `retry_endpoint` header.
    pub retry_endpoint: Option<String>,
    pub headers: serde_json::Map<String, serde_json::Value>,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
}

impl InboundEnvelope {
    /// True when the delivery came back through the retry queue at least once.
    pub fn is_redelivery(&self) -> bool {
        self.redelivery_count > 0
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayboxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Consume error: {0}")]
    Consume(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Message {0} is already marked as sent")]
    AlreadySent(String),
}

pub type Result<T> = std::result::Result<T, RelayboxError>;

// ============================================================================
// Tests
// ============================================================================
