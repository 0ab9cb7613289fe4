//! Connection targets for the streaming session.
//!
//! The control session hands the connection string straight to
//! `tokio_postgres`; the streaming session speaks the wire protocol itself and
//! needs the individual fields. Both read the string through
//! `tokio_postgres::Config` so they always reach the same server.

use std::str::FromStr;

use tokio_postgres::config::{Config, Host};

use crate::error::{PgError, PgResult};

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
        }
    }
}

impl ConnectionParams {
    /// Parse a `postgres://` URL or a `key=value` descriptor.
    ///
    /// Only a single TCP host is supported.
    pub fn parse(conn_str: &str) -> PgResult<Self> {
        let config = Config::from_str(conn_str.trim())
            .map_err(|e| PgError::Connection(format!("Invalid connection string: {}", e)))?;

        Self::from_config(&config)
    }

    pub fn from_config(config: &Config) -> PgResult<Self> {
        let defaults = Self::default();

        let host = match config.get_hosts() {
            [] => defaults.host.clone(),
            [Host::Tcp(host)] => host.clone(),
            [_] => {
                return Err(PgError::Connection(
                    "Unix socket hosts are not supported for replication".into(),
                ))
            }
            hosts => {
                return Err(PgError::Connection(format!(
                    "Multiple hosts are not supported for replication ({} given)",
                    hosts.len()
                )))
            }
        };

        // tokio-postgres dials `hostaddr` in preference to `host` when both are set.
        let host = match config.get_hostaddrs() {
            [] => host,
            [addr] => addr.to_string(),
            addrs => {
                return Err(PgError::Connection(format!(
                    "Multiple hosts are not supported for replication ({} given)",
                    addrs.len()
                )))
            }
        };

        let port = match config.get_ports() {
            [] => defaults.port,
            [port] => *port,
            ports => {
                return Err(PgError::Connection(format!(
                    "Multiple ports are not supported for replication ({} given)",
                    ports.len()
                )))
            }
        };

        let user = config.get_user().map(str::to_string).unwrap_or(defaults.user);

        let password = config
            .get_password()
            .map(|bytes| {
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| PgError::Connection("Password is not valid UTF-8".into()))
            })
            .transpose()?;

        // Database defaults to the user name, as libpq does.
        let database = config
            .get_dbname()
            .map(str::to_string)
            .unwrap_or_else(|| user.clone());

        Ok(Self {
            host,
            port,
            user,
            password,
            database,
        })
    }
}
