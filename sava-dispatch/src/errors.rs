use sava_core::message::MessageHandle;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Dispatch-local race: the instance is held by another delivery attempt.
    /// Always retried inside the engine, never surfaced.
    #[error("instance {0} is not available for acquisition")]
    AlreadyAcquired(u64),

    /// Reference acquisition on a message the registry no longer counts.
    /// A lifetime bug upstream; logged as an internal-consistency fault.
    #[error("message {0} was already reclaimed")]
    StaleMessage(MessageHandle),

    /// Resolution for a delivery tag the engine does not hold (stray or
    /// duplicate acknowledgment).
    #[error("no outstanding delivery with tag {0}")]
    UnknownDelivery(u64),

    #[error("invalid state: {0}")]
    InvalidState(String),
}
