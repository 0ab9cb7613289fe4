use thiserror::Error;

/// Errors that can occur in slotstream-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("payload slice out of range: offset {offset} + length {length} exceeds frame of {available} bytes")]
    PayloadOutOfRange {
        offset: usize,
        length: usize,
        available: usize,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("sink error: {0}")]
    Sink(String),
}

pub type Result<T> = std::result::Result<T, Error>;
