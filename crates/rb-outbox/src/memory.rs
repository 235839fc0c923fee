use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rb_common::OutboundMessage;

use crate::repository::OutboxRepository;

/// In-memory outbox store. Useful for tests and for processes that only
/// need fire-and-forget publishing without a durable staging table.
#[derive(Default)]
pub struct InMemoryOutboxRepository {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn message(&self, id: &str) -> Option<OutboundMessage> {
        self.messages.lock().iter().find(|m| m.id == id).cloned()
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn get_unsent_messages(&self, limit: u32) -> Result<Vec<OutboundMessage>> {
        let messages = self.messages.lock();
        let mut pending: Vec<OutboundMessage> =
            messages.iter().filter(|m| m.is_pending()).cloned().collect();
        pending.sort_by_key(|m| m.created_at);
        if limit > 0 {
            pending.truncate(limit as usize);
        }
        Ok(pending)
    }

    async fn save(&self, message: &OutboundMessage) -> Result<OutboundMessage> {
        let mut messages = self.messages.lock();
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }
        Ok(message.clone())
    }
}
