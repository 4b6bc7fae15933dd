//! Error types for the group consumer library

use thiserror::Error;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors raised by the consumer, its configuration and the group membership
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Configuration is missing or invalid (fatal at construction)
    #[error("Invalid consumer configuration: {0}")]
    Config(String),

    /// Only SASL PLAIN is supported on the consumer path
    #[error("Unsupported SASL mechanism: {0} (only PLAIN supported)")]
    UnsupportedSaslMechanism(String),

    /// Error reported by the Kafka client
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// The group membership has been closed; no further sessions can start
    #[error("Consumer group is closed")]
    GroupClosed,

    /// A membership session ended abnormally (transient)
    #[error("Group session error: {0}")]
    Session(String),

    /// A payload could not be decoded into the handler's event type
    #[error("Decode error: {0}")]
    Decode(String),
}

impl ConsumerError {
    /// Whether the rejoin loop must stop on this error.
    ///
    /// Only a closed group is terminal; everything else is retried by
    /// rejoining the group.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerError::GroupClosed)
    }
}

impl From<validator::ValidationErrors> for ConsumerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ConsumerError::Config(err.to_string())
    }
}
