use hopswitch_core::{CircuitKey, CoreError};

/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage unavailable")]
    Unavailable,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Backend(err.into_string())
    }
}

impl From<prost::DecodeError> for StoreError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Circuit-map errors.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("duplicate circuit for incoming HTLC {0}")]
    DuplicateIncoming(CircuitKey),

    #[error("outgoing HTLC {0} is already bound to a circuit")]
    DuplicateOutgoing(CircuitKey),

    #[error("circuit not found: {0}")]
    NotFound(CircuitKey),

    #[error("circuit {0} already carries a different resolution")]
    ConflictingResolution(CircuitKey),

    #[error(transparent)]
    Store(#[from] StoreError),
}
