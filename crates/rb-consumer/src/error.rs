use rb_common::RelayboxError;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Amqp(#[from] rb_amqp::AmqpError),

    #[error("AMQP error: {0}")]
    Lapin(#[from] lapin::Error),
}

impl From<ConsumerError> for RelayboxError {
    fn from(err: ConsumerError) -> Self {
        RelayboxError::Consume(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConsumerError>;
