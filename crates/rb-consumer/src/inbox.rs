// Inbox dispatch
//
// The idempotent half of the outbox/inbox pattern. Before a handler runs,
// the dispatcher consults a ledger keyed on (message id, handler name); a
// hit means the pair was already processed and the handler is skipped, so
// redeliveries and relay duplicates collapse into no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use rb_common::InboundEnvelope;

use crate::registry::{HandlerEvent, MessageHandlerRegistry};

// ============================================================================
// Ledger
// ============================================================================

/// One processed (message, handler) pair.
#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub id: String,
    pub message_id: String,
    pub handler_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInboxRecord {
    pub message_id: String,
    pub handler_name: String,
}

#[async_trait]
pub trait InboxRepository: Send + Sync {
    async fn get_inbox_message(
        &self,
        message_id: &str,
        handler_name: &str,
    ) -> anyhow::Result<Option<InboxRecord>>;

    /// Record a processed pair. Tolerant of an existing row for the same
    /// pair: the canonical record comes back either way.
    async fn save(&self, record: NewInboxRecord) -> anyhow::Result<InboxRecord>;
}

/// Ledger for tests and single-process embedding.
#[derive(Default)]
pub struct InMemoryInboxRepository {
    records: Mutex<HashMap<(String, String), InboxRecord>>,
}

impl InMemoryInboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl InboxRepository for InMemoryInboxRepository {
    async fn get_inbox_message(
        &self,
        message_id: &str,
        handler_name: &str,
    ) -> anyhow::Result<Option<InboxRecord>> {
        let key = (message_id.to_string(), handler_name.to_string());
        Ok(self.records.lock().get(&key).cloned())
    }

    async fn save(&self, record: NewInboxRecord) -> anyhow::Result<InboxRecord> {
        let mut records = self.records.lock();
        let key = (record.message_id.clone(), record.handler_name.clone());
        if let Some(existing) = records.get(&key) {
            return Ok(existing.clone());
        }
        let saved = InboxRecord {
            id: Uuid::new_v4().to_string(),
            message_id: record.message_id,
            handler_name: record.handler_name,
            created_at: Utc::now(),
        };
        records.insert(key, saved.clone());
        Ok(saved)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Handler failures from one delivery, in registry order.
#[derive(Debug, thiserror::Error)]
#[error("handler failures: {}", .errors.join("; "))]
pub struct DispatchFailure {
    pub errors: Vec<String>,
}

pub struct InboxDispatcher {
    repository: Arc<dyn InboxRepository>,
    registry: Arc<dyn MessageHandlerRegistry>,
    immediate_retries: u32,
}

impl InboxDispatcher {
    pub fn new(
        repository: Arc<dyn InboxRepository>,
        registry: Arc<dyn MessageHandlerRegistry>,
        immediate_retries: u32,
    ) -> Self {
        Self {
            repository,
            registry,
            immediate_retries,
        }
    }

    /// Run every handler registered for the envelope's type.
    ///
    /// Each handler gets `1 + immediate_retries` attempts back to back. A
    /// handler that succeeds has its ledger row written; if that write
    /// fails the handler counts as failed, so the row is written on the
    /// redelivery instead of losing the dedup guarantee. All failures are
    /// collected so the engine routes the delivery once.
    pub async fn dispatch(&self, envelope: &InboundEnvelope) -> Result<(), DispatchFailure> {
        let (Some(message_id), Some(message_type)) =
            (&envelope.message_id, &envelope.message_type)
        else {
            debug!("Envelope without id or type reached the dispatcher; nothing to do");
            return Ok(());
        };

        let mut errors: Vec<String> = Vec::new();

        for handler in self.registry.handlers_for(message_type) {
            let handler_name = handler.handler_name().to_string();

            match self
                .repository
                .get_inbox_message(message_id, &handler_name)
                .await
            {
                Ok(Some(_)) => {
                    debug!(
                        message_id = %message_id,
                        handler = %handler_name,
                        "Message already processed by handler, skipping"
                    );
                    continue;
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        message_id = %message_id,
                        handler = %handler_name,
                        error = %error,
                        "Inbox ledger lookup failed"
                    );
                    errors.push(format!("{}: inbox lookup failed: {}", handler_name, error));
                    continue;
                }
            }

            let total_attempts = 1 + self.immediate_retries;
            let mut last_error: Option<String> = None;
            for attempt in 1..=total_attempts {
                let event = HandlerEvent {
                    message_id: message_id.clone(),
                    body: envelope.body.clone(),
                };
                match handler.handle_event(event).await {
                    Ok(()) => {
                        last_error = None;
                        break;
                    }
                    Err(error) => {
                        warn!(
                            message_id = %message_id,
                            handler = %handler_name,
                            attempt,
                            total_attempts,
                            error = %error,
                            "Handler attempt failed"
                        );
                        last_error = Some(error.to_string());
                    }
                }
            }

            match last_error {
                None => {
                    let record = NewInboxRecord {
                        message_id: message_id.clone(),
                        handler_name: handler_name.clone(),
                    };
                    if let Err(error) = self.repository.save(record).await {
                        warn!(
                            message_id = %message_id,
                            handler = %handler_name,
                            error = %error,
                            "Inbox ledger write failed"
                        );
                        errors.push(format!(
                            "{}: inbox record write failed: {}",
                            handler_name, error
                        ));
                    }
                }
                Some(error) => errors.push(format!("{}: {}", handler_name, error)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DispatchFailure { errors })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandlerRegistry, MessageHandler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    fn create_test_envelope(message_id: &str, message_type: &str) -> InboundEnvelope {
        InboundEnvelope {
            message_id: Some(message_id.to_string()),
            message_type: Some(message_type.to_string()),
            redelivery_count: 0,
            retry_endpoint: None,
            headers: serde_json::Map::new(),
            body: b"{\"n\":1}".to_vec(),
            delivery_tag: 1,
        }
    }

    struct CountingHandler {
        name: &'static str,
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl CountingHandler {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail_first: 0,
            })
        }

        fn failing_first(name: &'static str, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail_first: failures,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        fn handler_name(&self) -> &str {
            self.name
        }

        async fn handle_event(&self, _event: HandlerEvent) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                anyhow::bail!("simulated failure on call {}", call + 1)
            }
            Ok(())
        }
    }

    struct BrokenSaveRepository {
        inner: InMemoryInboxRepository,
    }

    #[async_trait]
    impl InboxRepository for BrokenSaveRepository {
        async fn get_inbox_message(
            &self,
            message_id: &str,
            handler_name: &str,
        ) -> anyhow::Result<Option<InboxRecord>> {
            self.inner.get_inbox_message(message_id, handler_name).await
        }

        async fn save(&self, _record: NewInboxRecord) -> anyhow::Result<InboxRecord> {
            anyhow::bail!("ledger unavailable")
        }
    }

    fn dispatcher_with(
        repository: Arc<dyn InboxRepository>,
        handler: Arc<CountingHandler>,
        immediate_retries: u32,
    ) -> InboxDispatcher {
        let registry = HandlerRegistry::new().register("order.created", handler);
        InboxDispatcher::new(repository, Arc::new(registry), immediate_retries)
    }

    #[tokio::test]
    async fn dispatches_and_records_success() {
        let repository = Arc::new(InMemoryInboxRepository::new());
        let handler = CountingHandler::new("audit");
        let dispatcher = dispatcher_with(repository.clone(), handler.clone(), 0);

        assert_ok!(
            dispatcher
                .dispatch(&create_test_envelope("m1", "order.created"))
                .await
        );

        assert_eq!(handler.calls(), 1);
        let record = repository
            .get_inbox_message("m1", "audit")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.message_id, "m1");
        assert_eq!(record.handler_name, "audit");
    }

    #[tokio::test]
    async fn second_delivery_is_a_no_op() {
        let repository = Arc::new(InMemoryInboxRepository::new());
        let handler = CountingHandler::new("audit");
        let dispatcher = dispatcher_with(repository.clone(), handler.clone(), 0);
        let envelope = create_test_envelope("m1", "order.created");

        assert_ok!(dispatcher.dispatch(&envelope).await);
        assert_ok!(dispatcher.dispatch(&envelope).await);

        assert_eq!(handler.calls(), 1);
        assert_eq!(repository.len(), 1);
    }

    #[tokio::test]
    async fn immediate_retries_mask_transient_failures() {
        let repository = Arc::new(InMemoryInboxRepository::new());
        let handler = CountingHandler::failing_first("audit", 2);
        let dispatcher = dispatcher_with(repository.clone(), handler.clone(), 2);

        assert_ok!(
            dispatcher
                .dispatch(&create_test_envelope("m1", "order.created"))
                .await
        );

        // Two failures, then the third attempt lands.
        assert_eq!(handler.calls(), 3);
        assert_eq!(repository.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_the_last_error() {
        let repository = Arc::new(InMemoryInboxRepository::new());
        let handler = CountingHandler::failing_first("audit", 10);
        let dispatcher = dispatcher_with(repository.clone(), handler.clone(), 1);

        let failure = dispatcher
            .dispatch(&create_test_envelope("m1", "order.created"))
            .await
            .unwrap_err();

        assert_eq!(handler.calls(), 2);
        assert_eq!(failure.errors.len(), 1);
        assert!(failure.errors[0].starts_with("audit:"));
        assert!(repository.is_empty());
    }

    #[tokio::test]
    async fn one_failing_handler_does_not_block_the_other() {
        let repository = Arc::new(InMemoryInboxRepository::new());
        let good = CountingHandler::new("ship");
        let bad = CountingHandler::failing_first("audit", 10);
        let registry = HandlerRegistry::new()
            .register("order.created", good.clone())
            .register("order.created", bad.clone());
        let dispatcher =
            InboxDispatcher::new(repository.clone(), Arc::new(registry), 0);

        let failure = dispatcher
            .dispatch(&create_test_envelope("m1", "order.created"))
            .await
            .unwrap_err();

        assert_eq!(failure.errors.len(), 1);
        assert_eq!(good.calls(), 1);
        // The successful handler is on the ledger; the redelivery will skip it.
        assert!(repository
            .get_inbox_message("m1", "ship")
            .await
            .unwrap()
            .is_some());
        assert!(repository
            .get_inbox_message("m1", "audit")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ledger_write_failure_counts_as_handler_failure() {
        let repository = Arc::new(BrokenSaveRepository {
            inner: InMemoryInboxRepository::new(),
        });
        let handler = CountingHandler::new("audit");
        let dispatcher = dispatcher_with(repository, handler.clone(), 0);

        let failure = dispatcher
            .dispatch(&create_test_envelope("m1", "order.created"))
            .await
            .unwrap_err();

        assert_eq!(handler.calls(), 1);
        assert!(failure.errors[0].contains("inbox record write failed"));
    }

    #[tokio::test]
    async fn unregistered_type_dispatches_nothing() {
        let repository = Arc::new(InMemoryInboxRepository::new());
        let handler = CountingHandler::new("audit");
        let dispatcher = dispatcher_with(repository.clone(), handler.clone(), 0);

        assert_ok!(
            dispatcher
                .dispatch(&create_test_envelope("m1", "order.cancelled"))
                .await
        );

        assert_eq!(handler.calls(), 0);
        assert!(repository.is_empty());
    }
}
