use std::time::Duration;

use thiserror::Error;

use crate::version::ServerVersion;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server version {found} is below the minimum {required} required for logical decoding slots")]
    Incompatible {
        found: ServerVersion,
        required: ServerVersion,
    },

    #[error("replication slot '{slot}' still active after waiting {waited:?}")]
    SlotStillActive { slot: String, waited: Duration },

    #[error("failed to create replication slot: {0}")]
    SlotCreationFailed(String),

    #[error("replication protocol error: {0}")]
    Protocol(String),

    #[error("server error: {severity}: {message} (code: {code})")]
    Server {
        severity: String,
        code: String,
        message: String,
    },

    #[error("failed to decode replication frame: {0}")]
    Decode(String),

    #[error("replication stream closed by server")]
    StreamClosed,

    #[error("sink rejected change: {0}")]
    Sink(String),

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used to decide how a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Server cannot host logical decoding slots.
    Incompatible,
    /// A slot did not become inactive in time.
    Timeout,
    /// An administrative statement or stream start was rejected.
    Protocol,
    /// A received frame could not be interpreted.
    Decode,
    /// The network session failed or was closed.
    Connection,
    /// The downstream sink failed.
    Sink,
}

impl PgError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PgError::Incompatible { .. } => ErrorKind::Incompatible,
            PgError::SlotStillActive { .. } => ErrorKind::Timeout,
            PgError::Postgres(_)
            | PgError::SlotCreationFailed(_)
            | PgError::Protocol(_)
            | PgError::Server { .. } => ErrorKind::Protocol,
            PgError::Decode(_) | PgError::InvalidLsn(_) => ErrorKind::Decode,
            PgError::Connection(_) | PgError::StreamClosed | PgError::Io(_) => {
                ErrorKind::Connection
            }
            PgError::Sink(_) => ErrorKind::Sink,
        }
    }

    /// Check if this error came from decoding a single frame, leaving the stream usable.
    pub fn is_decode(&self) -> bool {
        self.kind() == ErrorKind::Decode
    }
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            let msg = format!(
                "{}: {} (code: {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            );
            PgError::Postgres(msg)
        } else if e.is_closed() {
            PgError::Connection(e.to_string())
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

impl From<slotstream_core::Error> for PgError {
    fn from(e: slotstream_core::Error) -> Self {
        match e {
            slotstream_core::Error::InvalidLsn(lsn) => PgError::InvalidLsn(lsn),
            slotstream_core::Error::Sink(msg) => PgError::Sink(msg),
            other => PgError::Decode(other.to_string()),
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            PgError::SlotStillActive {
                slot: "s".into(),
                waited: Duration::from_secs(30)
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(PgError::StreamClosed.kind(), ErrorKind::Connection);
        assert_eq!(
            PgError::SlotCreationFailed("bad plugin".into()).kind(),
            ErrorKind::Protocol
        );
        assert!(PgError::Decode("short frame".into()).is_decode());
        assert!(!PgError::Protocol("x".into()).is_decode());
    }

    #[test]
    fn test_core_error_conversion() {
        let err: PgError = slotstream_core::Error::Sink("full".into()).into();
        assert_eq!(err.kind(), ErrorKind::Sink);

        let err: PgError = slotstream_core::Error::InvalidLsn("zz".into()).into();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }
}
