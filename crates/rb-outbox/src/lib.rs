pub mod memory;
pub mod repository;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rb_amqp::{Producer, PublishOutcome, PublishResult};
use rb_common::OutboundMessage;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::repository::OutboxRepository;

pub use memory::InMemoryOutboxRepository;

/// Batch publisher behind the relay. The AMQP producer is the real
/// implementation; tests swap in mocks.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    /// Publish a batch, reporting a per-message outcome. A top-level error
    /// means nothing in the batch can be trusted as delivered.
    async fn publish_batch(&self, messages: &[OutboundMessage]) -> Result<Vec<PublishOutcome>>;
}

#[async_trait]
impl OutboxPublisher for Producer {
    async fn publish_batch(&self, messages: &[OutboundMessage]) -> Result<Vec<PublishOutcome>> {
        Ok(self.publish_messages(messages).await?)
    }
}

/// Counters for one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub fetched: usize,
    pub published: usize,
    pub publish_failures: usize,
    pub marked_sent: usize,
    pub mark_failures: usize,
}

/// Polls the outbox store and pushes pending messages to the broker.
///
/// Every path that is not a confirmed publish plus a persisted SENT
/// transition leaves the record PENDING, so the next cycle picks it up
/// again. Duplicates on the wire are possible; lost messages are not.
pub struct OutboxRelay {
    repository: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn OutboxPublisher>,
    poll_interval: Duration,
    dispatch_limit: u32,
}

impl OutboxRelay {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn OutboxPublisher>,
        poll_interval: Duration,
        dispatch_limit: u32,
    ) -> Self {
        Self {
            repository,
            publisher,
            poll_interval,
            dispatch_limit,
        }
    }

    pub async fn start(&self) {
        info!("Starting outbox relay");
        loop {
            if let Err(e) = self.dispatch_cycle().await {
                error!("Error dispatching outbox batch: {}", e);
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn dispatch_cycle(&self) -> Result<()> {
        let outcome = self.dispatch(self.dispatch_limit).await?;
        if outcome.fetched > 0 {
            info!(
                fetched = outcome.fetched,
                published = outcome.published,
                publish_failures = outcome.publish_failures,
                mark_failures = outcome.mark_failures,
                "Outbox dispatch cycle complete"
            );
        }
        Ok(())
    }

    /// Run one cycle: fetch pending records, publish them as a batch, and
    /// persist the SENT transition for each confirmed publish.
    pub async fn dispatch(&self, limit: u32) -> Result<DispatchOutcome> {
        let messages = self.repository.get_unsent_messages(limit).await?;
        if messages.is_empty() {
            debug!("No unsent outbox messages");
            return Ok(DispatchOutcome::default());
        }

        let mut outcome = DispatchOutcome {
            fetched: messages.len(),
            ..Default::default()
        };

        let send_outcomes = self.publisher.publish_batch(&messages).await?;
        let mut results: HashMap<String, PublishResult> = send_outcomes
            .into_iter()
            .map(|o| (o.id, o.result))
            .collect();

        for mut message in messages {
            match results.remove(&message.id) {
                Some(PublishResult::Published) => {
                    outcome.published += 1;
                    match message.mark_as_sent() {
                        Ok(()) => match self.repository.save(&message).await {
                            Ok(_) => outcome.marked_sent += 1,
                            Err(e) => {
                                outcome.mark_failures += 1;
                                error!(
                                    "Failed to persist sent status for [{}], it will be republished: {}",
                                    message.message_id, e
                                );
                            }
                        },
                        Err(e) => {
                            outcome.mark_failures += 1;
                            warn!(
                                "Could not transition outbox message [{}] to sent: {}",
                                message.message_id, e
                            );
                        }
                    }
                }
                Some(PublishResult::Failed { error }) => {
                    outcome.publish_failures += 1;
                    warn!(
                        "Publish failed for outbox message [{}], it stays pending: {}",
                        message.message_id, error
                    );
                }
                None => {
                    outcome.publish_failures += 1;
                    warn!(
                        "No publish outcome for outbox message [{}], it stays pending",
                        message.message_id
                    );
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    fn create_test_message(routing_key: &str) -> OutboundMessage {
        OutboundMessage::new(
            "orders",
            routing_key,
            "order.created",
            json!({"order_id": routing_key}),
        )
    }

    #[derive(Default)]
    struct MockBatchPublisher {
        fail_routing_keys: Vec<String>,
        calls: AtomicUsize,
        published: Mutex<Vec<String>>,
    }

    impl MockBatchPublisher {
        fn failing_on(keys: &[&str]) -> Self {
            Self {
                fail_routing_keys: keys.iter().map(|k| k.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl OutboxPublisher for MockBatchPublisher {
        async fn publish_batch(&self, messages: &[OutboundMessage]) -> Result<Vec<PublishOutcome>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = Vec::new();
            for message in messages {
                self.published.lock().push(message.routing_key.clone());
                let result = if self.fail_routing_keys.contains(&message.routing_key) {
                    PublishResult::Failed {
                        error: "broker nacked the publish".to_string(),
                    }
                } else {
                    PublishResult::Published
                };
                outcomes.push(PublishOutcome {
                    id: message.id.clone(),
                    message_id: message.message_id.clone(),
                    result,
                });
            }
            Ok(outcomes)
        }
    }

    struct BrokenPublisher;

    #[async_trait]
    impl OutboxPublisher for BrokenPublisher {
        async fn publish_batch(&self, _messages: &[OutboundMessage]) -> Result<Vec<PublishOutcome>> {
            anyhow::bail!("channel unavailable")
        }
    }

    struct FailingRepository;

    #[async_trait]
    impl OutboxRepository for FailingRepository {
        async fn get_unsent_messages(&self, _limit: u32) -> Result<Vec<OutboundMessage>> {
            anyhow::bail!("store offline")
        }

        async fn save(&self, _message: &OutboundMessage) -> Result<OutboundMessage> {
            anyhow::bail!("store offline")
        }
    }

    struct RejectingSaves {
        inner: InMemoryOutboxRepository,
        reject_id: String,
    }

    #[async_trait]
    impl OutboxRepository for RejectingSaves {
        async fn get_unsent_messages(&self, limit: u32) -> Result<Vec<OutboundMessage>> {
            self.inner.get_unsent_messages(limit).await
        }

        async fn save(&self, message: &OutboundMessage) -> Result<OutboundMessage> {
            if message.id == self.reject_id {
                anyhow::bail!("simulated write failure");
            }
            self.inner.save(message).await
        }
    }

    fn create_relay(
        repository: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn OutboxPublisher>,
    ) -> OutboxRelay {
        OutboxRelay::new(repository, publisher, Duration::from_millis(50), 100)
    }

    #[tokio::test]
    async fn dispatch_publishes_and_marks_sent() {
        let repository = Arc::new(InMemoryOutboxRepository::new());
        for key in ["a", "b", "c"] {
            repository.save(&create_test_message(key)).await.unwrap();
        }
        let publisher = Arc::new(MockBatchPublisher::default());
        let relay = create_relay(repository.clone(), publisher.clone());

        let outcome = assert_ok!(relay.dispatch(100).await);

        assert_eq!(
            outcome,
            DispatchOutcome {
                fetched: 3,
                published: 3,
                publish_failures: 0,
                marked_sent: 3,
                mark_failures: 0,
            }
        );
        assert!(repository.get_unsent_messages(0).await.unwrap().is_empty());
        assert_eq!(repository.len(), 3);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_publish_stays_pending_for_the_next_cycle() {
        let repository = Arc::new(InMemoryOutboxRepository::new());
        for key in ["a", "b", "c"] {
            repository.save(&create_test_message(key)).await.unwrap();
        }
        let publisher = Arc::new(MockBatchPublisher::failing_on(&["b"]));
        let relay = create_relay(repository.clone(), publisher.clone());

        let outcome = relay.dispatch(100).await.unwrap();
        assert_eq!(outcome.fetched, 3);
        assert_eq!(outcome.published, 2);
        assert_eq!(outcome.publish_failures, 1);
        assert_eq!(outcome.marked_sent, 2);

        let unsent = repository.get_unsent_messages(0).await.unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].routing_key, "b");

        // The next cycle only sees the leftover record.
        let second = relay.dispatch(100).await.unwrap();
        assert_eq!(second.fetched, 1);
        assert_eq!(second.publish_failures, 1);
        assert_eq!(
            publisher.published.lock().clone(),
            vec!["a", "b", "c", "b"]
        );
    }

    #[tokio::test]
    async fn empty_outbox_is_a_quiet_no_op() {
        let repository = Arc::new(InMemoryOutboxRepository::new());
        let publisher = Arc::new(MockBatchPublisher::default());
        let relay = create_relay(repository, publisher.clone());

        let outcome = relay.dispatch(100).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::default());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_cycle() {
        let publisher = Arc::new(MockBatchPublisher::default());
        let relay = create_relay(Arc::new(FailingRepository), publisher.clone());

        assert!(relay.dispatch(10).await.is_err());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batch_failure_leaves_every_message_pending() {
        let repository = Arc::new(InMemoryOutboxRepository::new());
        for key in ["a", "b"] {
            repository.save(&create_test_message(key)).await.unwrap();
        }
        let relay = create_relay(repository.clone(), Arc::new(BrokenPublisher));

        assert!(relay.dispatch(100).await.is_err());
        assert_eq!(repository.get_unsent_messages(0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_failure_leaves_only_that_row_pending() {
        let inner = InMemoryOutboxRepository::new();
        let kept = create_test_message("kept");
        let lost = create_test_message("lost");
        inner.save(&kept).await.unwrap();
        inner.save(&lost).await.unwrap();
        let repository = Arc::new(RejectingSaves {
            inner,
            reject_id: lost.id.clone(),
        });
        let publisher = Arc::new(MockBatchPublisher::default());
        let relay = create_relay(repository.clone(), publisher);

        let outcome = relay.dispatch(0).await.unwrap();

        assert_eq!(outcome.published, 2);
        assert_eq!(outcome.marked_sent, 1);
        assert_eq!(outcome.mark_failures, 1);

        let unsent = repository.get_unsent_messages(0).await.unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].id, lost.id);
    }

    #[tokio::test]
    async fn limit_caps_each_cycle() {
        let repository = Arc::new(InMemoryOutboxRepository::new());
        for key in ["a", "b", "c", "d", "e"] {
            repository.save(&create_test_message(key)).await.unwrap();
        }
        let publisher = Arc::new(MockBatchPublisher::default());
        let relay = create_relay(repository.clone(), publisher);

        let outcome = relay.dispatch(2).await.unwrap();

        assert_eq!(outcome.fetched, 2);
        assert_eq!(outcome.marked_sent, 2);
        assert_eq!(repository.get_unsent_messages(0).await.unwrap().len(), 3);
    }
}
