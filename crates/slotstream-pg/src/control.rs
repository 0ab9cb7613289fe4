//! Administrative statements issued over the control session.

use std::future::Future;

use tokio_postgres::Client;
use tracing::debug;

use crate::error::{PgError, PgResult};
use crate::version::WalPositionFunction;

/// A slot as reported by `pg_replication_slots`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRow {
    pub name: String,
    /// Output plugin; absent for physical slots.
    pub plugin: Option<String>,
    pub active: bool,
    /// Confirmed flush position in "X/Y" form, when known.
    pub confirmed_flush_lsn: Option<String>,
}

/// The statements slot management and position tracking need from the server.
pub trait ControlSession: Send + Sync {
    /// Whether a session currently holds the slot. False if it does not exist.
    fn slot_active(&self, slot: &str) -> impl Future<Output = PgResult<bool>> + Send;

    /// Look up a slot. `with_confirmed_flush` selects whether the server has
    /// the `confirmed_flush_lsn` column.
    fn slot_row(
        &self,
        slot: &str,
        with_confirmed_flush: bool,
    ) -> impl Future<Output = PgResult<Option<SlotRow>>> + Send;

    /// Terminate the backend holding the slot. Returns how many were signalled.
    fn terminate_slot_holder(&self, slot: &str) -> impl Future<Output = PgResult<u64>> + Send;

    /// Drop the slot if it exists. Returns how many slots were dropped.
    fn drop_slot_if_exists(&self, slot: &str) -> impl Future<Output = PgResult<u64>> + Send;

    /// Create a logical slot, returning its name and consistent point in "X/Y" form.
    fn create_logical_slot(
        &self,
        slot: &str,
        plugin: &str,
    ) -> impl Future<Output = PgResult<(String, String)>> + Send;

    /// Query the current WAL write position in "X/Y" form.
    fn current_wal_position(
        &self,
        function: WalPositionFunction,
    ) -> impl Future<Output = PgResult<Option<String>>> + Send;
}

impl ControlSession for Client {
    fn slot_active(&self, slot: &str) -> impl Future<Output = PgResult<bool>> + Send {
        async move {
            let row = self
                .query_opt(
                    "SELECT active FROM pg_replication_slots WHERE slot_name = $1",
                    &[&slot],
                )
                .await?;

            Ok(row.map(|r| r.get::<_, bool>(0)).unwrap_or(false))
        }
    }

    fn slot_row(
        &self,
        slot: &str,
        with_confirmed_flush: bool,
    ) -> impl Future<Output = PgResult<Option<SlotRow>>> + Send {
        async move {
            let query = if with_confirmed_flush {
                "SELECT slot_name::text, plugin::text, active, confirmed_flush_lsn::text \
                 FROM pg_replication_slots WHERE slot_name = $1"
            } else {
                "SELECT slot_name::text, plugin::text, active, NULL::text \
                 FROM pg_replication_slots WHERE slot_name = $1"
            };

            let row = self.query_opt(query, &[&slot]).await?;

            Ok(row.map(|r| SlotRow {
                name: r.get(0),
                plugin: r.get(1),
                active: r.get(2),
                confirmed_flush_lsn: r.get(3),
            }))
        }
    }

    fn terminate_slot_holder(&self, slot: &str) -> impl Future<Output = PgResult<u64>> + Send {
        async move {
            let terminated = self
                .execute(
                    "SELECT pg_terminate_backend(active_pid) FROM pg_replication_slots \
                     WHERE active = true AND slot_name = $1",
                    &[&slot],
                )
                .await?;

            debug!(slot = %slot, terminated, "Terminated slot holder");
            Ok(terminated)
        }
    }

    fn drop_slot_if_exists(&self, slot: &str) -> impl Future<Output = PgResult<u64>> + Send {
        async move {
            let dropped = self
                .execute(
                    "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots \
                     WHERE slot_name = $1",
                    &[&slot],
                )
                .await?;

            Ok(dropped)
        }
    }

    fn create_logical_slot(
        &self,
        slot: &str,
        plugin: &str,
    ) -> impl Future<Output = PgResult<(String, String)>> + Send {
        async move {
            // The second output column was renamed across versions, so alias both.
            let row = self
                .query_one(
                    "SELECT s.slot_name::text, s.lsn::text \
                     FROM pg_create_logical_replication_slot($1, $2) AS s(slot_name, lsn)",
                    &[&slot, &plugin],
                )
                .await
                .map_err(|e| PgError::SlotCreationFailed(PgError::from(e).to_string()))?;

            Ok((row.get(0), row.get(1)))
        }
    }

    fn current_wal_position(
        &self,
        function: WalPositionFunction,
    ) -> impl Future<Output = PgResult<Option<String>>> + Send {
        async move {
            let query = format!("SELECT {}::text", function.sql_name());
            let row = self.query_opt(&query, &[]).await?;

            Ok(row.and_then(|r| r.get::<_, Option<String>>(0)))
        }
    }
}
