use thiserror::Error;

/// Crate-wide error type. Every fallible operation in this crate (codec,
/// address parsing, pooling, discovery, bridging) resolves to one of these
/// variants.
#[derive(Debug, Error, Clone)]
pub enum DrpcError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("no reachable peer for {0}")]
    NoReachablePeer(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("data loss: {0}")]
    DataLoss(String),

    #[error("no relay reservation available")]
    NoReservation,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for DrpcError {
    fn from(e: std::io::Error) -> Self {
        DrpcError::Unavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DrpcError>;
