mod connect;
pub mod consumer;
pub mod control;
mod error;
pub mod mock;
pub mod position;
pub mod publication;
pub mod replication;
pub mod session;
pub mod slot;
pub mod version;

pub use connect::connect_control;
pub use consumer::{
    ConsumeSummary, ConsumerOptions, DecodePolicy, FeedbackPolicy, StopReason, StreamConsumer,
    WaitStrategy,
};
pub use control::{ControlSession, SlotRow};
pub use error::{ErrorKind, PgError, PgResult};
pub use position::current_position;
pub use replication::{
    ConnectionParams, ReplicationConnection, ReplicationMessage, ReplicationMode,
    ReplicationTransport, StandbyStatus, StartReplication,
};
pub use session::{Session, SessionConfig};
pub use slot::{CreatedSlot, InactiveWait, PreparedSlot, ReplicationSlot, SlotManager, SlotPolicy};
pub use version::{CompatibilityGate, ServerCapabilities, ServerVersion, WalPositionFunction};
