use rb_common::RelayboxError;

#[derive(Debug, thiserror::Error)]
pub enum AmqpError {
    #[error("AMQP error: {0}")]
    Lapin(#[from] lapin::Error),

    #[error("Invalid AMQP DSN {dsn}: {reason}")]
    InvalidDsn { dsn: String, reason: String },

    #[error("Connection failed after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("Broker did not confirm publish of message {message_id}")]
    PublishNotConfirmed { message_id: String },

    #[error("No open channel; connect() has not succeeded")]
    ChannelUnavailable,
}

impl From<AmqpError> for RelayboxError {
    fn from(err: AmqpError) -> Self {
        match err {
            AmqpError::PublishNotConfirmed { .. } => RelayboxError::Publish(err.to_string()),
            _ => RelayboxError::Connection(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AmqpError>;
