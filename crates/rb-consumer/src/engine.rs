// Consumer Engine
//
// Drains the primary queue and settles every delivery exactly once. The
// per-delivery rules run in a fixed order: drop deliveries without an id,
// drop types nobody registered, drop retries owned by other applications,
// then dispatch. A failed dispatch is republished to the retry queue until
// the delayed-retry budget is spent, after which it is dead-lettered. The
// original delivery is acked in all cases once its outcome is settled.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions};
use lapin::types::FieldTable;
use tokio::time::sleep;
use tracing::{error, info, warn};

use rb_amqp::{envelope_from_delivery, ConnectionManager, TopologyConfigurer};
use rb_common::{DeliveryEvent, DeliveryObserver, DeliveryOutcome, InboundEnvelope};
use rb_config::AmqpConfig;

use crate::error::Result;
use crate::inbox::{InboxDispatcher, InboxRepository};
use crate::registry::MessageHandlerRegistry;

/// Pause before rebuilding a consume session whose stream died.
const SESSION_RESTART_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Role
// ============================================================================

/// Decided at construction: a disabled consumer never touches the broker,
/// which is how producer-only deployments run.
pub enum ConsumerRole {
    Disabled,
    Active {
        registry: Arc<dyn MessageHandlerRegistry>,
        inbox_repository: Arc<dyn InboxRepository>,
    },
}

struct ActiveConsumer {
    registry: Arc<dyn MessageHandlerRegistry>,
    dispatcher: InboxDispatcher,
}

// ============================================================================
// Decision rules
// ============================================================================

/// What to do with one delivery before any handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Ack immediately with the given ignore outcome.
    Ignore(DeliveryOutcome),
    /// Hand to the inbox dispatcher.
    Dispatch,
}

/// Fixed-order screening rules; the first match wins.
pub fn decide(
    envelope: &InboundEnvelope,
    signature_types: &[String],
    app_name: &str,
) -> Decision {
    if envelope.message_id.is_none() {
        return Decision::Ignore(DeliveryOutcome::IgnoredMissingId);
    }

    match &envelope.message_type {
        Some(message_type) if signature_types.iter().any(|t| t == message_type) => {}
        _ => return Decision::Ignore(DeliveryOutcome::IgnoredUnknownType),
    }

    // A redelivered message belongs to whichever application stamped it.
    if envelope.redelivery_count > 0 && envelope.retry_endpoint.as_deref() != Some(app_name) {
        return Decision::Ignore(DeliveryOutcome::IgnoredForeignRetry);
    }

    Decision::Dispatch
}

/// Where a failed dispatch goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureRoute {
    Retry,
    DeadLetter,
}

/// The delayed-retry budget counts broker round trips already taken: a
/// message that failed with `redelivery_count` at the budget has used its
/// last trip.
pub fn failure_route(redelivery_count: u32, delayed_retries: u32) -> FailureRoute {
    if redelivery_count >= delayed_retries {
        FailureRoute::DeadLetter
    } else {
        FailureRoute::Retry
    }
}

/// A per-call limit overrides the configured one; zero means unlimited
/// prefetch on the broker side.
pub fn effective_prefetch(limit: Option<u16>, configured: u16) -> u16 {
    limit.unwrap_or(configured)
}

// ============================================================================
// Engine
// ============================================================================

pub struct ConsumerEngine {
    connection: Arc<ConnectionManager>,
    topology: TopologyConfigurer,
    config: AmqpConfig,
    active: Option<ActiveConsumer>,
    observer: Arc<dyn DeliveryObserver>,
}

impl ConsumerEngine {
    pub fn new(
        connection: Arc<ConnectionManager>,
        config: AmqpConfig,
        role: ConsumerRole,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Self {
        let active = match role {
            ConsumerRole::Disabled => None,
            ConsumerRole::Active {
                registry,
                inbox_repository,
            } => Some(ActiveConsumer {
                dispatcher: InboxDispatcher::new(
                    inbox_repository,
                    registry.clone(),
                    config.immediate_retries_number,
                ),
                registry,
            }),
        };
        Self {
            connection,
            topology: TopologyConfigurer::new(config.clone()),
            config,
            active,
            observer,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    /// Consume from the primary queue until the task is dropped.
    ///
    /// Each session: bounded connect, prefetch, topology declaration, then
    /// draining the delivery stream. A dead stream resets the connection
    /// and starts a fresh session; an exhausted reconnect budget propagates
    /// and ends consumption for good.
    pub async fn consume(&self, limit: Option<u16>) -> Result<()> {
        let Some(active) = &self.active else {
            info!("Consumer role is disabled, not consuming");
            return Ok(());
        };

        let prefetch = effective_prefetch(limit, self.config.consume_message_limit);

        loop {
            self.connection.connect().await?;
            let channel = self.connection.channel()?;
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await?;
            self.topology.configure(&channel).await?;

            let mut consumer = channel
                .basic_consume(
                    &self.config.primary_queue,
                    "",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            info!(
                queue = %self.config.primary_queue,
                prefetch,
                "Consuming messages"
            );

            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        if let Err(handling_error) = self.handle_delivery(active, delivery).await
                        {
                            // The delivery stays unacked; the broker will
                            // redeliver it on the next session.
                            error!(
                                error = %handling_error,
                                "Failed to settle delivery, restarting consume session"
                            );
                            break;
                        }
                    }
                    Err(stream_error) => {
                        warn!(error = %stream_error, "Delivery stream error");
                        break;
                    }
                }
            }

            warn!("Consume session ended, re-establishing connection");
            self.connection.reset().await;
            sleep(SESSION_RESTART_DELAY).await;
        }
    }

    async fn handle_delivery(&self, active: &ActiveConsumer, delivery: Delivery) -> Result<()> {
        let envelope = envelope_from_delivery(&delivery);
        let signature_types = active.registry.signature_types();

        let outcome = match decide(&envelope, &signature_types, &self.config.app_name) {
            Decision::Ignore(outcome) => outcome,
            Decision::Dispatch => match active.dispatcher.dispatch(&envelope).await {
                Ok(()) => DeliveryOutcome::Handled,
                Err(failure) => {
                    match failure_route(
                        envelope.redelivery_count,
                        self.config.delayed_retries_number,
                    ) {
                        FailureRoute::Retry => {
                            self.connection.retry(&envelope, &failure.errors).await?;
                            DeliveryOutcome::Retried
                        }
                        FailureRoute::DeadLetter => {
                            self.connection
                                .dead_letter(&envelope, &failure.errors)
                                .await?;
                            DeliveryOutcome::DeadLettered
                        }
                    }
                }
            },
        };

        delivery.ack(BasicAckOptions::default()).await?;

        self.observer.delivery_settled(DeliveryEvent {
            message_id: envelope.message_id.clone(),
            message_type: envelope.message_type.clone(),
            redelivery_count: envelope.redelivery_count,
            outcome,
        });
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::InMemoryInboxRepository;
    use crate::registry::HandlerRegistry;
    use rb_common::NullObserver;

    fn create_test_envelope(
        message_id: Option<&str>,
        message_type: Option<&str>,
        redelivery_count: u32,
        retry_endpoint: Option<&str>,
    ) -> InboundEnvelope {
        InboundEnvelope {
            message_id: message_id.map(String::from),
            message_type: message_type.map(String::from),
            redelivery_count,
            retry_endpoint: retry_endpoint.map(String::from),
            headers: serde_json::Map::new(),
            body: Vec::new(),
            delivery_tag: 1,
        }
    }

    fn signature_types() -> Vec<String> {
        vec!["order.created".to_string(), "order.cancelled".to_string()]
    }

    #[test]
    fn missing_message_id_is_ignored_first() {
        // Even an otherwise-unprocessable delivery reports the missing id.
        let envelope = create_test_envelope(None, Some("unknown.type"), 3, Some("other-app"));
        assert_eq!(
            decide(&envelope, &signature_types(), "orders-service"),
            Decision::Ignore(DeliveryOutcome::IgnoredMissingId)
        );
    }

    #[test]
    fn unknown_or_missing_type_is_ignored() {
        let envelope = create_test_envelope(Some("m1"), Some("order.shipped"), 0, None);
        assert_eq!(
            decide(&envelope, &signature_types(), "orders-service"),
            Decision::Ignore(DeliveryOutcome::IgnoredUnknownType)
        );

        let envelope = create_test_envelope(Some("m1"), None, 0, None);
        assert_eq!(
            decide(&envelope, &signature_types(), "orders-service"),
            Decision::Ignore(DeliveryOutcome::IgnoredUnknownType)
        );
    }

    #[test]
    fn foreign_retry_is_ignored() {
        let envelope =
            create_test_envelope(Some("m1"), Some("order.created"), 1, Some("billing-service"));
        assert_eq!(
            decide(&envelope, &signature_types(), "orders-service"),
            Decision::Ignore(DeliveryOutcome::IgnoredForeignRetry)
        );

        // A redelivery with no stamp at all is foreign too.
        let envelope = create_test_envelope(Some("m1"), Some("order.created"), 1, None);
        assert_eq!(
            decide(&envelope, &signature_types(), "orders-service"),
            Decision::Ignore(DeliveryOutcome::IgnoredForeignRetry)
        );
    }

    #[test]
    fn own_retry_and_fresh_delivery_dispatch() {
        let fresh = create_test_envelope(Some("m1"), Some("order.created"), 0, None);
        assert_eq!(
            decide(&fresh, &signature_types(), "orders-service"),
            Decision::Dispatch
        );

        let own_retry =
            create_test_envelope(Some("m1"), Some("order.created"), 2, Some("orders-service"));
        assert_eq!(
            decide(&own_retry, &signature_types(), "orders-service"),
            Decision::Dispatch
        );

        // Fresh deliveries skip the ownership check entirely.
        let fresh_foreign_stamp =
            create_test_envelope(Some("m1"), Some("order.created"), 0, Some("billing-service"));
        assert_eq!(
            decide(&fresh_foreign_stamp, &signature_types(), "orders-service"),
            Decision::Dispatch
        );
    }

    #[test]
    fn failure_route_boundary() {
        assert_eq!(failure_route(0, 3), FailureRoute::Retry);
        assert_eq!(failure_route(2, 3), FailureRoute::Retry);
        assert_eq!(failure_route(3, 3), FailureRoute::DeadLetter);
        assert_eq!(failure_route(4, 3), FailureRoute::DeadLetter);
    }

    #[test]
    fn prefetch_resolution() {
        assert_eq!(effective_prefetch(Some(5), 10), 5);
        assert_eq!(effective_prefetch(None, 10), 10);
        assert_eq!(effective_prefetch(None, 0), 0);
        assert_eq!(effective_prefetch(Some(0), 10), 0);
    }

    #[tokio::test]
    async fn disabled_consumer_skips_without_connecting() {
        let config = rb_config::AmqpConfig::default();
        let connection = Arc::new(ConnectionManager::new(config.clone()));
        let engine = ConsumerEngine::new(
            connection,
            config,
            ConsumerRole::Disabled,
            Arc::new(NullObserver),
        );

        assert!(!engine.is_enabled());
        engine.consume(None).await.unwrap();
    }

    #[test]
    fn active_role_builds_dispatcher() {
        let config = rb_config::AmqpConfig::default();
        let connection = Arc::new(ConnectionManager::new(config.clone()));
        let engine = ConsumerEngine::new(
            connection,
            config,
            ConsumerRole::Active {
                registry: Arc::new(HandlerRegistry::new()),
                inbox_repository: Arc::new(InMemoryInboxRepository::new()),
            },
            Arc::new(NullObserver),
        );

        assert!(engine.is_enabled());
    }
}
