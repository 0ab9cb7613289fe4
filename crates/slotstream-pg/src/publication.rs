//! Publication helpers.
//!
//! wal2json streams every table regardless of publications, so these are only
//! needed when a publication-based plugin such as pgoutput reads the slot.

use tokio_postgres::Client;
use tracing::info;

use crate::error::PgResult;

/// Quote an identifier for SQL and replication commands.
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

pub async fn publication_exists(client: &Client, publication: &str) -> PgResult<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)",
            &[&publication],
        )
        .await?;

    Ok(row.get(0))
}

/// Publish every table in the database.
pub async fn create_publication_all_tables(client: &Client, publication: &str) -> PgResult<()> {
    info!(publication = %publication, "Creating publication for all tables");
    client
        .batch_execute(&format!(
            "CREATE PUBLICATION {} FOR ALL TABLES",
            quote_ident(publication)
        ))
        .await?;

    Ok(())
}

/// Drop a publication. Missing publications are ignored.
pub async fn drop_publication(client: &Client, publication: &str) -> PgResult<()> {
    info!(publication = %publication, "Dropping publication");
    client
        .batch_execute(&format!(
            "DROP PUBLICATION IF EXISTS {}",
            quote_ident(publication)
        ))
        .await?;

    Ok(())
}

/// Drop and create an all-tables publication.
pub async fn recreate_publication(client: &Client, publication: &str) -> PgResult<()> {
    drop_publication(client, publication).await?;
    create_publication_all_tables(client, publication).await
}
