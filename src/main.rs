//! Command-line interface for ce-sync
//!
//! # Usage
//!
//! ```bash
//! # Sync using the test profile (.env.test)
//! ce-sync --env test
//!
//! # Sync using the production profile (.env.production)
//! ce-sync --env production
//! ```
//!
//! The selected profile file must provide the warehouse and store connection
//! parameters; see `config` for the required variable names.

use anyhow::Result;
use ce_sync::config::{Config, Environment};
use ce_sync::connect::{connect_to_store, connect_to_warehouse};
use ce_sync::store::OperationalStore;
use ce_sync::sync::run_sync;
use ce_sync::warehouse::WarehouseReader;
use clap::Parser;

#[derive(Parser)]
#[command(name = "ce-sync")]
#[command(about = "Syncs covered entity data from the analytics warehouse to the operational store")]
struct Cli {
    /// Environment profile to use
    #[arg(long, value_enum, default_value_t = Environment::Test)]
    env: Environment,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.env)?;

    let warehouse_client = connect_to_warehouse(&config.warehouse).await?;
    let pool = connect_to_store(&config.store)?;

    let warehouse = WarehouseReader::new(warehouse_client, &config.warehouse.database);
    let store = OperationalStore::new(pool.clone(), &config.store.actor_id);

    tracing::info!("Starting data transfer process in the {} environment", cli.env);
    run_sync(&warehouse, &store).await?;
    tracing::info!("Data transfer process completed successfully");

    pool.disconnect().await?;
    Ok(())
}
