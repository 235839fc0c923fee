// Delivery observability
//
// The consumer engine and producer report outcomes through an injected
// observer rather than logging inline, so hosts can route them to any sink.

use std::fmt;

use tracing::{error, info, warn};

// ============================================================================
// Outcomes
// ============================================================================

/// Terminal outcome of one inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every handler registered for the type succeeded.
    Handled,
    /// Dropped: the delivery carried no message id.
    IgnoredMissingId,
    /// Dropped: no handler is registered for the message type.
    IgnoredUnknownType,
    /// Dropped: a retry stamped by a different application.
    IgnoredForeignRetry,
    /// Handler failure republished to the retry queue.
    Retried,
    /// Retry budget exhausted; republished to the dead-letter destination.
    DeadLettered,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Handled => "handled",
            DeliveryOutcome::IgnoredMissingId => "ignored_missing_id",
            DeliveryOutcome::IgnoredUnknownType => "ignored_unknown_type",
            DeliveryOutcome::IgnoredForeignRetry => "ignored_foreign_retry",
            DeliveryOutcome::Retried => "retried",
            DeliveryOutcome::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One settled inbound delivery.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub redelivery_count: u32,
    pub outcome: DeliveryOutcome,
}

// ============================================================================
// Observer Trait
// ============================================================================

/// Sink for delivery and publish outcomes.
pub trait DeliveryObserver: Send + Sync {
    /// Called exactly once per inbound delivery, after it has been settled.
    fn delivery_settled(&self, event: DeliveryEvent);

    /// Called once per publish attempt with the broker confirmation result.
    fn message_published(&self, message_id: &str, message_type: &str, confirmed: bool);
}

// ============================================================================
// Implementations
// ============================================================================

/// Default observer: structured tracing plus Prometheus counters.
#[derive(Debug, Default, Clone)]
pub struct LogObserver;

impl DeliveryObserver for LogObserver {
    fn delivery_settled(&self, event: DeliveryEvent) {
        metrics::counter!(
            "relaybox_deliveries_total",
            "outcome" => event.outcome.as_str()
        )
        .increment(1);

        match event.outcome {
            DeliveryOutcome::Handled => {
                info!(
                    message_id = ?event.message_id,
                    message_type = ?event.message_type,
                    redelivery_count = event.redelivery_count,
                    "Message handled"
                );
            }
            DeliveryOutcome::IgnoredMissingId
            | DeliveryOutcome::IgnoredUnknownType
            | DeliveryOutcome::IgnoredForeignRetry => {
                info!(
                    message_id = ?event.message_id,
                    message_type = ?event.message_type,
                    outcome = %event.outcome,
                    "Message ignored"
                );
            }
            DeliveryOutcome::Retried => {
                warn!(
                    message_id = ?event.message_id,
                    message_type = ?event.message_type,
                    redelivery_count = event.redelivery_count,
                    "Message scheduled for retry"
                );
            }
            DeliveryOutcome::DeadLettered => {
                error!(
                    message_id = ?event.message_id,
                    message_type = ?event.message_type,
                    redelivery_count = event.redelivery_count,
                    "Message dead-lettered"
                );
            }
        }
    }

    fn message_published(&self, message_id: &str, message_type: &str, confirmed: bool) {
        metrics::counter!(
            "relaybox_published_total",
            "confirmed" => if confirmed { "true" } else { "false" }
        )
        .increment(1);

        if confirmed {
            info!(message_id = %message_id, message_type = %message_type, "Message published");
        } else {
            warn!(
                message_id = %message_id,
                message_type = %message_type,
                "Message publish not confirmed"
            );
        }
    }
}

/// Observer that discards everything. Useful in tests and for hosts that
/// only publish.
#[derive(Debug, Default, Clone)]
pub struct NullObserver;

impl DeliveryObserver for NullObserver {
    fn delivery_settled(&self, _event: DeliveryEvent) {}

    fn message_published(&self, _message_id: &str, _message_type: &str, _confirmed: bool) {}
}
