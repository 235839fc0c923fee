use anyhow::Result;
use async_trait::async_trait;
use rb_common::OutboundMessage;

/// Storage backend for the transactional outbox.
///
/// Application code writes rows in the same transaction as its own state
/// changes; the relay reads them back out through this trait. Implementations
/// must return unsent rows oldest first so delivery order tracks insertion
/// order.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Fetch messages still waiting to be published, oldest first.
    /// A limit of zero means no cap.
    async fn get_unsent_messages(&self, limit: u32) -> Result<Vec<OutboundMessage>>;

    /// Insert or update a message by its store id. The relay uses this to
    /// persist the sent transition after a confirmed publish.
    async fn save(&self, message: &OutboundMessage) -> Result<OutboundMessage>;
}
