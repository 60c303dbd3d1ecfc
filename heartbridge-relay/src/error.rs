//! Relay errors

use heartbridge_core::broker::BrokerError;

/// Errors raised by the relay components
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Payload is not valid UTF-8: {0}")]
    Decode(#[from] std::str::Utf8Error),

    #[error("Publisher is stopped")]
    PublisherStopped,

    #[error("Component already started or stopped")]
    AlreadyStarted,

    #[error("Publisher loop panicked")]
    LoopPanicked,

    #[error("Publisher loop overran its {0:?} stop grace and was aborted")]
    StopTimedOut(std::time::Duration),

    #[error(transparent)]
    Core(#[from] heartbridge_core::Error),
}

impl RelayError {
    /// Map a scheduling failure onto the publisher's lifecycle
    pub(crate) fn from_schedule(err: BrokerError) -> Self {
        match err {
            BrokerError::SchedulerClosed => Self::PublisherStopped,
            other => Self::Broker(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
