//! Per-entity-type sync orchestration.
//!
//! Entity types run in dependency order: covered entities first, then the
//! parent/child links that resolve against them, then the identifier
//! preparation pass. A loader failure is logged and the run moves on to the
//! next entity type; an extractor failure propagates and terminates the run.

use crate::store::OperationalStore;
use crate::warehouse::WarehouseReader;
use anyhow::Result;
use tracing::{info, warn};

pub async fn run_sync(warehouse: &WarehouseReader, store: &OperationalStore) -> Result<()> {
    let entities = warehouse.fetch_new_covered_entities().await?;
    info!(
        "Retrieved {} new covered entities from the warehouse",
        entities.len()
    );
    match store.insert_covered_entities(entities).await {
        Some(inserted) => info!("Covered entity sync complete: {inserted} rows inserted"),
        None => warn!("No covered entities were inserted"),
    }

    let links = warehouse.fetch_new_parent_links().await?;
    info!(
        "Retrieved {} new parent links from the warehouse",
        links.len()
    );
    match store.insert_parent_links(links).await {
        Some(inserted) => info!("Parent link sync complete: {inserted} rows inserted"),
        None => warn!("No parent links were inserted"),
    }

    let identifiers = warehouse.fetch_new_entity_identifiers().await?;
    info!(
        "Retrieved {} new entity identifiers from the warehouse",
        identifiers.len()
    );
    match store.prepare_entity_identifiers(identifiers).await {
        Some(prepared) => info!("Identifier pass complete: {prepared} rows prepared"),
        None => warn!("No entity identifiers were prepared"),
    }

    Ok(())
}
