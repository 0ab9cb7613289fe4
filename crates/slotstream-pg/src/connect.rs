//! Control session connection.

use tokio_postgres::{Client, NoTls};

use crate::error::{PgError, PgResult};

/// Connect the control session and drive its connection on a spawned task.
///
/// Connections are plaintext; a connection string asking for TLS is rejected
/// up front rather than silently downgraded.
pub async fn connect_control(connection_string: &str) -> PgResult<Client> {
    if requires_tls(connection_string) {
        return Err(PgError::Connection(
            "TLS is not supported; remove sslmode=require/verify-* from the connection string"
                .into(),
        ));
    }

    let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
        .await
        .map_err(|e| PgError::Connection(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "Postgres connection error");
        }
    });

    Ok(client)
}

fn requires_tls(connection_string: &str) -> bool {
    ["sslmode=require", "sslmode=verify-ca", "sslmode=verify-full"]
        .iter()
        .any(|mode| connection_string.contains(mode))
}
