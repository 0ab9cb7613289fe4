//! Logical streaming over a dedicated replication-mode session.

mod connection;
mod params;
mod protocol;
mod transport;

pub use connection::{ReplicationConnection, ReplicationMode};
pub use params::ConnectionParams;
pub use protocol::{
    pg_now_micros, PrimaryKeepalive, ReplicationMessage, StandbyStatus, XLogData,
    XLOG_DATA_HEADER_LEN,
};
pub use transport::{ReplicationTransport, StartReplication};
