//! Connection construction for both ends of the sync.

use crate::config::{StoreConfig, WarehouseConfig};
use anyhow::{Context, Result};
use mysql_async::Pool;
use tokio_postgres::{Client, NoTls};
use tracing::info;

/// Connects to the analytics warehouse and assumes the configured role.
pub async fn connect_to_warehouse(config: &WarehouseConfig) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
        .await
        .with_context(|| format!("Failed to connect to the warehouse at {}", config.host))?;

    // Drive the connection until the client is dropped
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Warehouse connection error: {e}");
        }
    });

    client
        .execute(format!("SET ROLE {}", config.role).as_str(), &[])
        .await
        .with_context(|| format!("Failed to assume warehouse role {}", config.role))?;

    info!("Warehouse connection created successfully");
    Ok(client)
}

/// Builds the operational-store connection pool.
pub fn connect_to_store(config: &StoreConfig) -> Result<Pool> {
    let pool = Pool::from_url(config.url()).with_context(|| {
        format!(
            "Failed to create operational store pool for {}/{}",
            config.host, config.database
        )
    })?;

    info!("Operational store pool created successfully");
    Ok(pool)
}
