/// Core protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("unknown failure code: {0}")]
    UnknownFailureCode(u16),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
