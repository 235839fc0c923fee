// Producer
//
// Publishes outbox records to the fanout exchange. Broadcast semantics: the
// routing key is always empty and every bound queue gets a copy, so the
// record's stored exchange/routing_key are not consulted here.

use std::sync::Arc;

use lapin::BasicProperties;
use tracing::{debug, warn};

use rb_common::{DeliveryObserver, OutboundMessage};
use rb_config::AmqpConfig;

use crate::connection::ConnectionManager;
use crate::envelope::json_map_to_field_table;
use crate::error::{AmqpError, Result};
use crate::topology::TopologyConfigurer;

const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Per-record result of a batch publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Published,
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// Store identity of the record.
    pub id: String,
    /// Broker identity of the record.
    pub message_id: String,
    pub result: PublishResult,
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        self.result == PublishResult::Published
    }
}

pub struct Producer {
    connection: Arc<ConnectionManager>,
    topology: TopologyConfigurer,
    config: AmqpConfig,
    observer: Arc<dyn DeliveryObserver>,
}

impl Producer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        config: AmqpConfig,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Self {
        Self {
            connection,
            topology: TopologyConfigurer::new(config.clone()),
            config,
            observer,
        }
    }

    /// Publish one record to the fanout exchange and await the confirm.
    ///
    /// Exactly one attempt: an unconfirmed or failed publish surfaces as an
    /// error and the record stays PENDING in the caller's store.
    pub async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        let payload = message.body.to_string().into_bytes();
        let properties = message_properties(message);

        let confirmed = self
            .connection
            .publish(&self.config.fanout_exchange, "", &payload, properties)
            .await?;
        self.observer
            .message_published(&message.message_id, &message.message_type, confirmed);
        if !confirmed {
            return Err(AmqpError::PublishNotConfirmed {
                message_id: message.message_id.clone(),
            });
        }
        Ok(())
    }

    /// Publish a batch in order, one confirmed publish at a time.
    ///
    /// Connect and topology failures abort the whole batch; a failed record
    /// is captured in its outcome and the rest of the batch continues. The
    /// channel is closed best-effort afterwards.
    pub async fn publish_messages(
        &self,
        messages: &[OutboundMessage],
    ) -> Result<Vec<PublishOutcome>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        self.connection.connect().await?;
        let channel = self.connection.channel()?;
        self.topology.configure(&channel).await?;

        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            let result = match self.publish(message).await {
                Ok(()) => PublishResult::Published,
                Err(error) => {
                    warn!(
                        message_id = %message.message_id,
                        message_type = %message.message_type,
                        error = %error,
                        "Failed to publish outbox message"
                    );
                    PublishResult::Failed {
                        error: error.to_string(),
                    }
                }
            };
            outcomes.push(PublishOutcome {
                id: message.id.clone(),
                message_id: message.message_id.clone(),
                result,
            });
        }

        if let Err(error) = self.connection.close_channel().await {
            debug!(error = %error, "Channel close after batch publish failed");
        }

        Ok(outcomes)
    }
}

/// Map an outbox record onto AMQP basic properties. Content type defaults
/// to JSON; delivery mode is forced persistent downstream.
fn message_properties(message: &OutboundMessage) -> BasicProperties {
    let content_type = message
        .properties
        .content_type
        .as_deref()
        .unwrap_or(DEFAULT_CONTENT_TYPE);

    let mut properties = BasicProperties::default()
        .with_message_id(message.message_id.as_str().into())
        .with_kind(message.message_type.as_str().into())
        .with_content_type(content_type.into());

    if !message.headers.is_empty() {
        properties = properties.with_headers(json_map_to_field_table(&message.headers));
    }
    if let Some(value) = &message.properties.content_encoding {
        properties = properties.with_content_encoding(value.as_str().into());
    }
    if let Some(value) = &message.properties.correlation_id {
        properties = properties.with_correlation_id(value.as_str().into());
    }
    if let Some(value) = &message.properties.reply_to {
        properties = properties.with_reply_to(value.as_str().into());
    }
    if let Some(value) = &message.properties.expiration {
        properties = properties.with_expiration(value.as_str().into());
    }
    if let Some(value) = message.properties.priority {
        properties = properties.with_priority(value);
    }
    if let Some(value) = &message.properties.app_id {
        properties = properties.with_app_id(value.as_str().into());
    }
    properties
}
