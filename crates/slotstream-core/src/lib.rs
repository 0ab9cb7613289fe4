pub mod error;
pub mod feedback;
pub mod lsn;
pub mod record;
pub mod sink;

pub use error::{Error, Result};
pub use feedback::FeedbackState;
pub use lsn::Lsn;
pub use record::{payload_slice, ChangeRecord, PG_EPOCH_OFFSET_SECS};
pub use sink::{ChangeSink, Durability, MemorySink};
