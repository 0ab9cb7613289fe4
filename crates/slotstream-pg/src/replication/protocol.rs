//! Messages carried inside the CopyBoth stream.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-replication.html

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use slotstream_core::{ChangeRecord, Lsn, PG_EPOCH_OFFSET_SECS};

use crate::error::{PgError, PgResult};

/// Tag + wal start + wal end + send time.
pub const XLOG_DATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;

const XLOG_DATA_TAG: u8 = b'w';
const PRIMARY_KEEPALIVE_TAG: u8 = b'k';
const STANDBY_STATUS_TAG: u8 = b'r';

/// A message received from the server during streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    XLogData(XLogData),
    PrimaryKeepalive(PrimaryKeepalive),
}

/// WAL data produced by the output plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    /// Microseconds since 2000-01-01 UTC.
    pub server_time: i64,
    /// The whole CopyData payload; plugin output starts at [`XLOG_DATA_HEADER_LEN`].
    frame: Bytes,
}

impl XLogData {
    pub fn new(wal_start: Lsn, wal_end: Lsn, server_time: i64, data: &[u8]) -> Self {
        let mut frame = BytesMut::with_capacity(XLOG_DATA_HEADER_LEN + data.len());
        frame.put_u8(XLOG_DATA_TAG);
        frame.put_u64(wal_start.value());
        frame.put_u64(wal_end.value());
        frame.put_i64(server_time);
        frame.put_slice(data);

        Self {
            wal_start,
            wal_end,
            server_time,
            frame: frame.freeze(),
        }
    }

    /// The encoded CopyData payload.
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    pub fn data_len(&self) -> usize {
        self.frame.len().saturating_sub(XLOG_DATA_HEADER_LEN)
    }

    /// Turn into a change record positioned at the WAL start of this message.
    pub fn into_record(self) -> PgResult<ChangeRecord> {
        let length = self.data_len();
        Ok(ChangeRecord::from_frame(
            self.wal_start,
            self.wal_end,
            self.server_time,
            &self.frame,
            XLOG_DATA_HEADER_LEN,
            length,
        )?)
    }
}

/// Periodic server heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryKeepalive {
    pub wal_end: Lsn,
    pub server_time: i64,
    /// The server asks for a status update as soon as possible.
    pub reply_requested: bool,
}

impl PrimaryKeepalive {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_u8(PRIMARY_KEEPALIVE_TAG);
        buf.put_u64(self.wal_end.value());
        buf.put_i64(self.server_time);
        buf.put_u8(self.reply_requested as u8);
        buf.freeze()
    }
}

impl ReplicationMessage {
    /// Decode the payload of a CopyData message.
    pub fn decode(frame: Bytes) -> PgResult<Self> {
        let tag = *frame
            .first()
            .ok_or_else(|| PgError::Decode("empty CopyData message".into()))?;

        let mut cursor = Cursor::new(&frame[1..]);
        match tag {
            XLOG_DATA_TAG => {
                let wal_start = cursor.read_u64::<BigEndian>().map_err(short("XLogData"))?;
                let wal_end = cursor.read_u64::<BigEndian>().map_err(short("XLogData"))?;
                let server_time = cursor.read_i64::<BigEndian>().map_err(short("XLogData"))?;

                Ok(ReplicationMessage::XLogData(XLogData {
                    wal_start: Lsn::new(wal_start),
                    wal_end: Lsn::new(wal_end),
                    server_time,
                    frame,
                }))
            }
            PRIMARY_KEEPALIVE_TAG => {
                let wal_end = cursor.read_u64::<BigEndian>().map_err(short("keepalive"))?;
                let server_time = cursor.read_i64::<BigEndian>().map_err(short("keepalive"))?;
                let reply = cursor.read_u8().map_err(short("keepalive"))?;

                Ok(ReplicationMessage::PrimaryKeepalive(PrimaryKeepalive {
                    wal_end: Lsn::new(wal_end),
                    server_time,
                    reply_requested: reply != 0,
                }))
            }
            other => Err(PgError::Decode(format!(
                "unknown replication message tag: {:?}",
                other as char
            ))),
        }
    }
}

fn short(what: &'static str) -> impl Fn(std::io::Error) -> PgError {
    move |_| PgError::Decode(format!("truncated {} message", what))
}

/// Standby status update sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatus {
    pub written: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
    /// Microseconds since 2000-01-01 UTC.
    pub client_time: i64,
    pub reply_requested: bool,
}

impl StandbyStatus {
    /// Status stamped with the current time.
    pub fn new(written: Lsn, flushed: Lsn, applied: Lsn) -> Self {
        Self {
            written,
            flushed,
            applied,
            client_time: pg_now_micros(),
            reply_requested: false,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(STANDBY_STATUS_TAG);
        buf.put_u64(self.written.value());
        buf.put_u64(self.flushed.value());
        buf.put_u64(self.applied.value());
        buf.put_i64(self.client_time);
        buf.put_u8(self.reply_requested as u8);
        buf.freeze()
    }
}

/// Current time in microseconds since the PostgreSQL epoch.
pub fn pg_now_micros() -> i64 {
    let now = chrono::Utc::now();
    (now.timestamp() - PG_EPOCH_OFFSET_SECS) * 1_000_000 + i64::from(now.timestamp_subsec_micros())
}
