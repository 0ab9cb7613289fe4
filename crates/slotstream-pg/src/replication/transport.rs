use std::future::Future;

use slotstream_core::Lsn;

use super::protocol::{ReplicationMessage, StandbyStatus};
use crate::error::PgResult;
use crate::publication::quote_ident;

/// Request to start logical streaming from a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReplication {
    pub slot: String,
    pub start: Lsn,
    /// Output plugin options, passed through untouched.
    pub options: Vec<(String, String)>,
}

impl StartReplication {
    pub fn new(slot: impl Into<String>, start: Lsn) -> Self {
        Self {
            slot: slot.into(),
            start,
            options: Vec::new(),
        }
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    /// Render the `START_REPLICATION` command.
    pub fn to_command(&self) -> String {
        let mut command = format!(
            "START_REPLICATION SLOT {} LOGICAL {}",
            quote_ident(&self.slot),
            self.start
        );

        if !self.options.is_empty() {
            let options: Vec<String> = self
                .options
                .iter()
                .map(|(key, value)| format!("{} {}", quote_ident(key), quote_literal(value)))
                .collect();
            command.push_str(&format!(" ({})", options.join(", ")));
        }

        command
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// The streaming half of a replication session.
///
/// `recv` must be cancel-safe: dropping its future before it completes loses
/// no data, so it can sit in a `select!` next to timers.
pub trait ReplicationTransport: Send {
    /// Enter CopyBoth mode streaming from the given slot.
    fn start_logical(
        &mut self,
        request: &StartReplication,
    ) -> impl Future<Output = PgResult<()>> + Send;

    /// Wait for the next message. Fails with `StreamClosed` when the server ends the stream.
    fn recv(&mut self) -> impl Future<Output = PgResult<ReplicationMessage>> + Send;

    /// Return a message if one is already available, without waiting.
    fn try_recv(&mut self) -> PgResult<Option<ReplicationMessage>>;

    /// Report progress to the server.
    fn send_status(&mut self, status: StandbyStatus) -> impl Future<Output = PgResult<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_without_options() {
        let request = StartReplication::new("slot", Lsn::new(0x16_B374_D848));
        assert_eq!(
            request.to_command(),
            "START_REPLICATION SLOT \"slot\" LOGICAL 16/B374D848"
        );
    }

    #[test]
    fn test_command_with_options() {
        let request = StartReplication::new("my\"slot", Lsn::INVALID)
            .option("include-xids", "true")
            .option("filter-tables", "public.o'brien");

        assert_eq!(
            request.to_command(),
            "START_REPLICATION SLOT \"my\"\"slot\" LOGICAL 0/0 \
             (\"include-xids\" 'true', \"filter-tables\" 'public.o''brien')"
        );
    }
}
