// Topology Configurer
//
// Declares the exchanges, queues and bindings the messaging layer relies on.
// Every declaration is idempotent on the broker, so this runs before each
// consume session and batch publish. Any failure here is a fatal
// misconfiguration and propagates.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{Channel, ExchangeKind};
use tracing::{debug, info};

use rb_config::AmqpConfig;

use crate::error::Result;

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";
const MESSAGE_TTL_ARG: &str = "x-message-ttl";

pub struct TopologyConfigurer {
    config: AmqpConfig,
}

impl TopologyConfigurer {
    pub fn new(config: AmqpConfig) -> Self {
        Self { config }
    }

    /// Declare the full topology on the given channel:
    ///
    /// - durable fanout exchange (broadcast publishes) and durable direct
    ///   exchange (retry and dead-letter routing);
    /// - durable primary queue, fed by the fanout exchange and by the direct
    ///   exchange under the queue's own name (the retry-expiry return path);
    /// - durable retry queue parking messages for `retry_queue_message_ttl`
    ///   milliseconds, dead-lettering back through the direct exchange to
    ///   the primary queue;
    /// - durable error queue named by the error binding key.
    pub async fn configure(&self, channel: &Channel) -> Result<()> {
        channel
            .exchange_declare(
                &self.config.fanout_exchange,
                ExchangeKind::Fanout,
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;
        channel
            .exchange_declare(
                &self.config.direct_exchange,
                ExchangeKind::Direct,
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;
        debug!(
            fanout = %self.config.fanout_exchange,
            direct = %self.config.direct_exchange,
            "Exchanges declared"
        );

        channel
            .queue_declare(
                &self.config.primary_queue,
                durable_queue(),
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &self.config.primary_queue,
                &self.config.fanout_exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &self.config.primary_queue,
                &self.config.direct_exchange,
                &self.config.primary_queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &self.config.retry_queue,
                durable_queue(),
                retry_queue_arguments(&self.config),
            )
            .await?;
        channel
            .queue_bind(
                &self.config.retry_queue,
                &self.config.direct_exchange,
                &self.config.retry_binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // The config carries no separate error-queue name; the binding key
        // doubles as the queue name.
        channel
            .queue_declare(
                &self.config.error_binding_key,
                durable_queue(),
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &self.config.error_binding_key,
                &self.config.direct_exchange,
                &self.config.error_binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            primary_queue = %self.config.primary_queue,
            retry_queue = %self.config.retry_queue,
            error_queue = %self.config.error_binding_key,
            "Broker topology configured"
        );
        Ok(())
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

/// Arguments making the retry queue a delay line: messages sit for the
/// configured TTL, then dead-letter through the direct exchange back to the
/// primary queue.
fn retry_queue_arguments(config: &AmqpConfig) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        ShortString::from(MESSAGE_TTL_ARG),
        AMQPValue::LongLongInt(i64::from(config.retry_queue_message_ttl)),
    );
    arguments.insert(
        ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
        AMQPValue::LongString(LongString::from(config.direct_exchange.as_str())),
    );
    arguments.insert(
        ShortString::from(DEAD_LETTER_ROUTING_KEY_ARG),
        AMQPValue::LongString(LongString::from(config.primary_queue.as_str())),
    );
    arguments
}
