//! Server version checks and the version-dependent SQL they select.
//!
//! Versions use PostgreSQL's numeric format (`server_version_num`):
//! `MAJOR * 10000 + MINOR` from 10 onwards, `MAJOR * 10000 + MINOR * 100 + PATCH` before.

use std::fmt;

use tokio_postgres::Client;
use tracing::{debug, info};

use crate::error::{PgError, PgResult};

/// A PostgreSQL server version in `server_version_num` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion(i32);

impl ServerVersion {
    pub const V9_4: ServerVersion = ServerVersion(90400);
    pub const V9_5: ServerVersion = ServerVersion(90500);
    pub const V9_6: ServerVersion = ServerVersion(90600);
    pub const V10: ServerVersion = ServerVersion(100000);

    pub const fn from_num(num: i32) -> Self {
        ServerVersion(num)
    }

    pub const fn num(self) -> i32 {
        self.0
    }

    /// Parse a `server_version` string such as `"16.2 (Debian 16.2-1.pgdg120+2)"`,
    /// `"9.6.24"` or `"17beta1"`.
    pub fn parse(version: &str) -> Option<Self> {
        let token = version.split_whitespace().next()?;
        let mut components = token.split('.').map(leading_number);

        let major = components.next().flatten()?;
        let minor = components.next().flatten().unwrap_or(0);
        let patch = components.next().flatten().unwrap_or(0);

        let base = major.checked_mul(10000)?;
        let num = if major >= 10 {
            base.checked_add(minor)?
        } else {
            base.checked_add(minor.checked_mul(100)?)?.checked_add(patch)?
        };

        (num > 0).then_some(ServerVersion(num))
    }

    /// Read the version over an established session.
    pub async fn query(client: &Client) -> PgResult<Self> {
        let row = client.query_one("SHOW server_version_num", &[]).await?;
        let num: String = row.get(0);
        let num = num
            .trim()
            .parse::<i32>()
            .map_err(|_| PgError::Protocol(format!("unexpected server_version_num: {}", num)))?;

        Ok(ServerVersion(num))
    }
}

fn leading_number(s: &str) -> Option<i32> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 100000 {
            write!(f, "{}.{}", self.0 / 10000, self.0 % 10000)
        } else if self.0 % 100 == 0 {
            write!(f, "{}.{}", self.0 / 10000, (self.0 / 100) % 100)
        } else {
            write!(f, "{}.{}.{}", self.0 / 10000, (self.0 / 100) % 100, self.0 % 100)
        }
    }
}

/// Startup check that the server can host logical decoding slots.
#[derive(Debug, Clone, Copy)]
pub struct CompatibilityGate {
    version: ServerVersion,
    required: ServerVersion,
}

impl CompatibilityGate {
    /// 9.5 is the first release exposing `active_pid` on `pg_replication_slots`,
    /// which the slot recreation relies on.
    pub const MINIMUM: ServerVersion = ServerVersion::V9_5;

    pub fn new(version: ServerVersion) -> Self {
        Self {
            version,
            required: Self::MINIMUM,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.version >= self.required
    }

    /// Fail with [`PgError::Incompatible`] unless the server is new enough.
    pub fn ensure(&self) -> PgResult<()> {
        if self.is_compatible() {
            debug!(version = %self.version, "Server supports logical decoding slots");
            Ok(())
        } else {
            Err(PgError::Incompatible {
                found: self.version,
                required: self.required,
            })
        }
    }
}

/// Function returning the current WAL write position.
///
/// Renamed from `xlog` to `wal` in PostgreSQL 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalPositionFunction {
    CurrentWalLsn,
    CurrentXlogLocation,
}

impl WalPositionFunction {
    pub fn for_version(version: ServerVersion) -> Self {
        if version >= ServerVersion::V10 {
            WalPositionFunction::CurrentWalLsn
        } else {
            WalPositionFunction::CurrentXlogLocation
        }
    }

    pub fn sql_name(self) -> &'static str {
        match self {
            WalPositionFunction::CurrentWalLsn => "pg_current_wal_lsn()",
            WalPositionFunction::CurrentXlogLocation => "pg_current_xlog_location()",
        }
    }
}

/// Version-dependent behavior, resolved once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub version: ServerVersion,
    pub wal_position_function: WalPositionFunction,
    /// `pg_replication_slots.confirmed_flush_lsn` exists from 9.6.
    pub has_confirmed_flush_lsn: bool,
}

impl ServerCapabilities {
    pub fn resolve(version: ServerVersion) -> Self {
        let capabilities = Self {
            version,
            wal_position_function: WalPositionFunction::for_version(version),
            has_confirmed_flush_lsn: version >= ServerVersion::V9_6,
        };

        info!(
            version = %version,
            wal_function = capabilities.wal_position_function.sql_name(),
            "Resolved server capabilities"
        );

        capabilities
    }

    pub fn gate(&self) -> CompatibilityGate {
        CompatibilityGate::new(self.version)
    }
}
