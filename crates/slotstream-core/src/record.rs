use bytes::Bytes;

use crate::error::{Error, Result};
use crate::lsn::Lsn;

/// PostgreSQL epoch (2000-01-01 00:00:00 UTC) relative to the Unix epoch, in seconds.
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// A change delivered by the output plugin.
///
/// The payload is opaque: slotstream never interprets what the plugin wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Position at which the record was received (start of the WAL data).
    pub lsn: Lsn,
    /// The server's current end of WAL when the record was sent.
    pub wal_end: Lsn,
    /// Server send time, microseconds since 2000-01-01 UTC.
    pub server_time: i64,
    /// Raw plugin output.
    pub data: Bytes,
}

impl ChangeRecord {
    pub fn new(lsn: Lsn, data: impl Into<Bytes>) -> Self {
        Self {
            lsn,
            wal_end: lsn,
            server_time: 0,
            data: data.into(),
        }
    }

    /// Build a record whose payload is `length` bytes of `frame` starting at `offset`.
    pub fn from_frame(
        lsn: Lsn,
        wal_end: Lsn,
        server_time: i64,
        frame: &Bytes,
        offset: usize,
        length: usize,
    ) -> Result<Self> {
        Ok(Self {
            lsn,
            wal_end,
            server_time,
            data: payload_slice(frame, offset, length)?,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// The payload as UTF-8 text (wal2json and test_decoding both emit text).
    pub fn as_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|e| Error::Decode(format!("payload at {} is not UTF-8: {}", self.lsn, e)))
    }

    /// Server send time rendered as an RFC 3339 timestamp.
    pub fn server_timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let unix_secs = self.server_time.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS;
        let nanos = (self.server_time.rem_euclid(1_000_000) * 1000) as u32;
        chrono::DateTime::from_timestamp(unix_secs, nanos)
    }
}

/// Cut `length` bytes starting at `offset` out of `frame` without copying.
pub fn payload_slice(frame: &Bytes, offset: usize, length: usize) -> Result<Bytes> {
    let end = offset
        .checked_add(length)
        .filter(|end| *end <= frame.len())
        .ok_or(Error::PayloadOutOfRange {
            offset,
            length,
            available: frame.len(),
        })?;

    Ok(frame.slice(offset..end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<Vec<u8>> {
        vec![
            vec![],
            vec![0],
            b"{\"change\":[]}".to_vec(),
            (0..=255u8).collect(),
            vec![0xFF; 64],
        ]
    }

    #[test]
    fn test_payload_slice_reproduces_bytes() {
        for original in sample_frames() {
            // Prefix with arbitrary header bytes so the payload sits at an offset.
            for header_len in [0usize, 1, 25] {
                let mut frame = vec![0xAB; header_len];
                frame.extend_from_slice(&original);
                let frame = Bytes::from(frame);

                let payload = payload_slice(&frame, header_len, original.len()).unwrap();
                assert_eq!(&payload[..], &original[..]);
            }

            let frame = Bytes::from(original.clone());
            for offset in 0..=original.len() {
                let length = original.len() - offset;
                let payload = payload_slice(&frame, offset, length).unwrap();
                assert_eq!(&payload[..], &original[offset..]);
            }
        }
    }

    #[test]
    fn test_payload_slice_out_of_range() {
        let frame = Bytes::from_static(b"abcdef");
        assert!(payload_slice(&frame, 7, 0).is_err());
        assert!(payload_slice(&frame, 2, 5).is_err());
        assert!(payload_slice(&frame, usize::MAX, 2).is_err());
        assert_eq!(&payload_slice(&frame, 6, 0).unwrap()[..], b"");
    }

    #[test]
    fn test_from_frame() {
        let frame = Bytes::from_static(b"headerpayload");
        let record =
            ChangeRecord::from_frame(Lsn::new(10), Lsn::new(20), 0, &frame, 6, 7).unwrap();
        assert_eq!(record.as_text().unwrap(), "payload");
        assert_eq!(record.lsn, Lsn::new(10));
        assert_eq!(record.wal_end, Lsn::new(20));
    }

    #[test]
    fn test_non_utf8_payload() {
        let record = ChangeRecord::new(Lsn::new(1), vec![0xC3, 0x28]);
        assert!(record.as_text().is_err());
    }

    #[test]
    fn test_server_timestamp() {
        let record = ChangeRecord {
            server_time: 1_500_000,
            ..ChangeRecord::new(Lsn::new(1), Bytes::new())
        };
        let ts = record.server_timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2000-01-01T00:00:01.500+00:00");
    }
}
