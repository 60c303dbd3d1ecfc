//! Broker protocol errors

use super::types::DeliveryTag;

/// Errors reported by a broker connection or channel
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Access refused: {0}")]
    AccessRefused(String),

    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Message unroutable: {0}")]
    Unroutable(String),

    #[error("Publish not confirmed: {0}")]
    PublishNacked(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("Callback scheduler closed")]
    SchedulerClosed,
}

impl BrokerError {
    /// Convenience constructor for a closed connection
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Whether the error means the owning connection is gone
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::UnknownDeliveryTag(DeliveryTag(3));
        assert_eq!(err.to_string(), "Unknown delivery tag: 3");

        let err = BrokerError::closed("missed heartbeats");
        assert_eq!(err.to_string(), "Connection closed: missed heartbeats");
        assert!(err.is_connection_closed());
        assert!(!BrokerError::SchedulerClosed.is_connection_closed());
    }
}
