//! ce-sync library
//!
//! Point-to-point synchronization of 340B covered entity data from the
//! analytics warehouse to the operational store.
//!
//! # Design
//!
//! - [`warehouse`]: extraction. Fixed anti-join queries against the store
//!   replica retain only rows new to the destination, remapped into the
//!   store's column vocabulary
//! - [`store`]: loading. Surrogate-key assignment, reference resolution,
//!   duplicate filtering and batched insertion with per-batch commit
//! - [`sync`]: per-entity-type orchestration
//! - [`config`] / [`connect`]: environment profiles and connection setup
//!
//! The sync is idempotent at the row level: the loader re-checks the store's
//! current key set immediately before every insertion pass, so re-running
//! with overlapping input never duplicates a row.

pub mod config;
pub mod connect;
pub mod store;
pub mod sync;
pub mod types;
pub mod warehouse;

pub use config::{Config, Environment};
pub use store::OperationalStore;
pub use warehouse::WarehouseReader;
