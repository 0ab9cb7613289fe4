//! LSN (Log Sequence Number) positions in the server's write-ahead log.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A position in the write-ahead log.
///
/// Ordered by the underlying 64-bit value. [`Lsn::INVALID`] (`0/0`) stands for
/// "no position available" and sorts before every real position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    /// The "not available" sentinel.
    pub const INVALID: Lsn = Lsn(0);

    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Parse from the "X/Y" hex format used by the server.
    pub fn parse(lsn: &str) -> Result<Self> {
        let (high, low) = lsn
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::InvalidLsn(lsn.to_string()))?;

        if high.is_empty() || low.is_empty() || high.len() > 8 || low.len() > 8 {
            return Err(Error::InvalidLsn(lsn.to_string()));
        }

        let high = u64::from_str_radix(high, 16).map_err(|_| Error::InvalidLsn(lsn.to_string()))?;
        let low = u64::from_str_radix(low, 16).map_err(|_| Error::InvalidLsn(lsn.to_string()))?;

        Ok(Lsn((high << 32) | low))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Lsn::parse(s)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Lsn::parse(&s).map_err(serde::de::Error::custom)
    }
}
