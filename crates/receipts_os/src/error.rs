#![forbid(unsafe_code)]

use receipts_engines::sealer::SealError;
use receipts_storage::store::StorageError;
use thiserror::Error;

/// Per-message failure taxonomy. None of these abort sibling messages in a batch.
#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("unparseable payload: {0}")]
    Parse(String),

    #[error("media fetch failed: {0}")]
    Fetch(String),

    #[error("sealed image failed authentication")]
    Decryption,

    #[error("receipt not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SealError> for CorrelationError {
    fn from(err: SealError) -> Self {
        match err {
            SealError::Decryption => Self::Decryption,
            other => Self::Io(std::io::Error::other(other.to_string())),
        }
    }
}

/// Failures on the way to the operator channel. The receipt stays unforwarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("forward queue is full")]
    QueueFull,

    #[error("forward worker has stopped")]
    WorkerStopped,

    #[error("operator channel answered http status {0}")]
    Status(u16),

    #[error("operator channel transport error: {0}")]
    Transport(String),

    #[error("operator channel rejected the request: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_error_01_seal_errors_map_to_taxonomy() {
        assert!(matches!(
            CorrelationError::from(SealError::Decryption),
            CorrelationError::Decryption
        ));
        assert!(matches!(
            CorrelationError::from(SealError::Encrypt),
            CorrelationError::Io(_)
        ));
    }

    #[test]
    fn at_error_02_delivery_errors_render_plainly() {
        let err = CorrelationError::from(DeliveryError::Status(429));
        assert_eq!(err.to_string(), "operator channel answered http status 429");
        assert_eq!(DeliveryError::QueueFull.to_string(), "forward queue is full");
    }
}
