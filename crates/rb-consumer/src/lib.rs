pub mod engine;
pub mod error;
pub mod inbox;
pub mod registry;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use engine::{
    decide, effective_prefetch, failure_route, ConsumerEngine, ConsumerRole, Decision,
    FailureRoute,
};
pub use error::{ConsumerError, Result};
pub use inbox::{
    DispatchFailure, InMemoryInboxRepository, InboxDispatcher, InboxRecord, InboxRepository,
    NewInboxRecord,
};
pub use registry::{HandlerEvent, HandlerRegistry, MessageHandler, MessageHandlerRegistry};
