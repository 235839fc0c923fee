// Connection Manager
//
// Owns the single shared connection and channel for the process. Connecting
// is bounded: after `max_reconnect_tries` failed attempts the manager lands
// in `Failed` and the error surfaces to the caller. Republishing for retry
// and dead-lettering also live here since both are plain publishes with
// composed headers.

use std::time::Duration;

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use rb_common::{
    InboundEnvelope, HEADER_ERRORS, HEADER_REDELIVERY_COUNT, HEADER_RETRY_ENDPOINT,
};
use rb_config::AmqpConfig;

use crate::envelope::json_map_to_field_table;
use crate::error::{AmqpError, Result};

/// AMQP delivery mode 2: the broker writes the message to disk.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

const RECONNECT_BASE_DELAY_MS: u64 = 500;
const RECONNECT_JITTER_MS: u64 = 250;
const REPLY_SUCCESS: u16 = 200;

// ============================================================================
// Connection State
// ============================================================================

/// Where the manager currently stands. Readable at any time via
/// [`ConnectionManager::state`]; transitions happen only inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The reconnect budget is exhausted. Terminal until `reset()`.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }
}

// ============================================================================
// Connection Manager
// ============================================================================

pub struct ConnectionManager {
    config: AmqpConfig,
    state: Mutex<ConnectionState>,
    // Serializes connect/reset; held across the whole attempt loop so
    // concurrent callers wait for one outcome instead of racing.
    connection: tokio::sync::Mutex<Option<Connection>>,
    channel: Mutex<Option<Channel>>,
}

impl ConnectionManager {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            connection: tokio::sync::Mutex::new(None),
            channel: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Establish the shared connection and confirmed channel.
    ///
    /// Reuses a live connection; if only the channel is gone, just reopens
    /// it. A full connect runs up to `max_reconnect_tries` attempts with
    /// exponential backoff and jitter, then gives up with
    /// [`AmqpError::ReconnectExhausted`].
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;

        if let Some(existing) = connection.as_ref() {
            if existing.status().connected() {
                if self.channel.lock().is_some() {
                    return Ok(());
                }
                // Connection survived a channel close; reopen the channel only.
                *self.state.lock() = ConnectionState::Connecting;
                match Self::open_channel(existing).await {
                    Ok(channel) => {
                        *self.channel.lock() = Some(channel);
                        *self.state.lock() = ConnectionState::Connected;
                        return Ok(());
                    }
                    Err(error) => {
                        debug!(error = %error, "Channel reopen on live connection failed");
                        *connection = None;
                    }
                }
            } else {
                *connection = None;
            }
        }

        *self.state.lock() = ConnectionState::Connecting;
        self.channel.lock().take();

        let max_tries = self.config.max_reconnect_tries;
        let mut last_error = "no connection attempts were made".to_string();

        for attempt in 1..=max_tries {
            match self.try_connect().await {
                Ok((new_connection, channel)) => {
                    info!(attempt, "Connected to broker");
                    *connection = Some(new_connection);
                    *self.channel.lock() = Some(channel);
                    *self.state.lock() = ConnectionState::Connected;
                    return Ok(());
                }
                Err(error) => {
                    warn!(
                        attempt,
                        max_tries,
                        error = %error,
                        "Broker connection attempt failed"
                    );
                    metrics::counter!("relaybox_connect_failures_total").increment(1);
                    last_error = error.to_string();
                    if attempt < max_tries {
                        sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        *self.state.lock() = ConnectionState::Failed;
        Err(AmqpError::ReconnectExhausted {
            attempts: max_tries,
            last_error,
        })
    }

    async fn try_connect(&self) -> Result<(Connection, Channel)> {
        let uri = self.build_uri()?;
        let connection = Connection::connect_uri(uri, ConnectionProperties::default()).await?;
        let channel = Self::open_channel(&connection).await?;
        Ok((connection, channel))
    }

    fn build_uri(&self) -> Result<AMQPUri> {
        let mut uri: AMQPUri = self.config.dsn.parse().map_err(|reason| AmqpError::InvalidDsn {
            dsn: self.config.dsn.clone(),
            reason,
        })?;
        uri.authority.userinfo.username = self.config.username.clone();
        uri.authority.userinfo.password = self.config.password.clone();
        uri.query.heartbeat = Some(self.config.heartbeat_interval);
        Ok(uri)
    }

    async fn open_channel(connection: &Connection) -> Result<Channel> {
        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        Ok(channel)
    }

    /// Hand out a clone of the current channel. Callers fetch per operation
    /// rather than caching the clone across await points.
    pub fn channel(&self) -> Result<Channel> {
        self.channel.lock().clone().ok_or(AmqpError::ChannelUnavailable)
    }

    /// Publish one message and await the broker confirm. Persistent delivery
    /// is forced; returns whether the broker acked. No internal retry.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<bool> {
        let channel = self.channel()?;
        let properties = properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        let confirmation = confirm.await?;

        Ok(matches!(
            confirmation,
            Confirmation::Ack(_) | Confirmation::NotRequested
        ))
    }

    /// Republish a failed delivery into the retry queue.
    ///
    /// The new message carries the original body and headers with
    /// `redelivery_count` incremented by exactly one, `retry_endpoint`
    /// stamped with this application's name, and the handler errors
    /// recorded. The parked copy flows back to the primary queue when its
    /// TTL lapses.
    pub async fn retry(&self, envelope: &InboundEnvelope, errors: &[String]) -> Result<()> {
        let headers = retry_headers(
            &envelope.headers,
            envelope.redelivery_count,
            &self.config.app_name,
            errors,
        );
        let properties = republish_properties(envelope, &headers);

        debug!(
            message_id = ?envelope.message_id,
            redelivery_count = envelope.redelivery_count + 1,
            "Routing message to retry queue"
        );

        let confirmed = self
            .publish(
                &self.config.direct_exchange,
                &self.config.retry_binding_key,
                &envelope.body,
                properties,
            )
            .await?;
        if !confirmed {
            return Err(AmqpError::PublishNotConfirmed {
                message_id: envelope.message_id.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Park a delivery on the dead-letter destination for operator review.
    /// `redelivery_count` is left as-is; only the final error annotation is
    /// added.
    pub async fn dead_letter(&self, envelope: &InboundEnvelope, errors: &[String]) -> Result<()> {
        let headers = dead_letter_headers(&envelope.headers, errors);
        let properties = republish_properties(envelope, &headers);

        warn!(
            message_id = ?envelope.message_id,
            redelivery_count = envelope.redelivery_count,
            "Routing message to dead-letter queue"
        );

        let confirmed = self
            .publish(
                &self.config.direct_exchange,
                &self.config.error_binding_key,
                &envelope.body,
                properties,
            )
            .await?;
        if !confirmed {
            return Err(AmqpError::PublishNotConfirmed {
                message_id: envelope.message_id.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Close and drop the channel. The connection stays cached; the next
    /// `connect()` only reopens the channel. Safe when no channel is open.
    pub async fn close_channel(&self) -> Result<()> {
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.close(REPLY_SUCCESS, "client closing channel").await?;
        }
        *self.state.lock() = ConnectionState::Disconnected;
        Ok(())
    }

    /// Drop the connection and channel entirely. Used after a dead consume
    /// session so the next `connect()` starts from scratch.
    pub async fn reset(&self) {
        let mut connection = self.connection.lock().await;
        self.channel.lock().take();
        if let Some(existing) = connection.take() {
            let _ = existing.close(REPLY_SUCCESS, "client resetting connection").await;
        }
        *self.state.lock() = ConnectionState::Disconnected;
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    let base = RECONNECT_BASE_DELAY_MS << exponent;
    let jitter = rand::thread_rng().gen_range(0..RECONNECT_JITTER_MS);
    Duration::from_millis(base + jitter)
}

// ============================================================================
// Header composition
// ============================================================================

/// Headers for a retry republish: original headers with the count bumped by
/// one, this application stamped as the retry owner, and the handler errors
/// recorded.
pub fn retry_headers(
    original: &Map<String, Value>,
    redelivery_count: u32,
    app_name: &str,
    errors: &[String],
) -> Map<String, Value> {
    let mut headers = original.clone();
    headers.insert(
        HEADER_REDELIVERY_COUNT.to_string(),
        json!(redelivery_count + 1),
    );
    headers.insert(HEADER_RETRY_ENDPOINT.to_string(), json!(app_name));
    headers.insert(HEADER_ERRORS.to_string(), json!(errors));
    headers
}

/// Headers for a dead-letter republish: original headers plus the final
/// error annotation. The redelivery count is deliberately not touched.
pub fn dead_letter_headers(
    original: &Map<String, Value>,
    errors: &[String],
) -> Map<String, Value> {
    let mut headers = original.clone();
    headers.insert(HEADER_ERRORS.to_string(), json!(errors));
    headers
}

fn republish_properties(
    envelope: &InboundEnvelope,
    headers: &Map<String, Value>,
) -> BasicProperties {
    let mut properties =
        BasicProperties::default().with_headers(json_map_to_field_table(headers));
    if let Some(message_id) = &envelope.message_id {
        properties = properties.with_message_id(message_id.as_str().into());
    }
    if let Some(message_type) = &envelope.message_type {
        properties = properties.with_kind(message_type.as_str().into());
    }
    properties
}

// ============================================================================
// Tests
// ============================================================================
