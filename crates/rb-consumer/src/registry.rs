// Handler registry
//
// Hosts implement `MessageHandler` for each message type they care about
// and register the handlers against type names. The registry's signature
// types decide which deliveries this application processes at all.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

/// What a handler receives: the broker identity of the message plus the raw
/// payload bytes. Deserialization is the handler's business.
#[derive(Debug, Clone)]
pub struct HandlerEvent {
    pub message_id: String,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stable name recorded in the inbox ledger. One ledger row exists per
    /// (message id, handler name) pair, so renaming a handler re-runs it
    /// for redelivered messages.
    fn handler_name(&self) -> &str;

    async fn handle_event(&self, event: HandlerEvent) -> anyhow::Result<()>;
}

pub trait MessageHandlerRegistry: Send + Sync {
    /// Message types this application consumes. Deliveries typed outside
    /// this set are acked and dropped.
    fn signature_types(&self) -> Vec<String>;

    fn handlers_for(&self, message_type: &str) -> Vec<Arc<dyn MessageHandler>>;
}

/// Map-backed registry with builder-style registration.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.handlers
            .entry(message_type.into())
            .or_default()
            .push(handler);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl MessageHandlerRegistry for HandlerRegistry {
    fn signature_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    fn handlers_for(&self, message_type: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned().unwrap_or_default()
    }
}
