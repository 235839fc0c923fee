pub mod connection;
pub mod envelope;
pub mod error;
pub mod producer;
pub mod topology;

pub use connection::{dead_letter_headers, retry_headers, ConnectionManager, ConnectionState};
pub use envelope::{
    envelope_from_delivery, field_table_to_json_map, json_map_to_field_table, parse_envelope,
};
pub use error::{AmqpError, Result};
pub use producer::{Producer, PublishOutcome, PublishResult};
pub use topology::TopologyConfigurer;
