//! Operational-store loading.
//!
//! Each load call works against a fresh snapshot of the destination state:
//! the table's column list, the current maximum surrogate key, the
//! natural-to-surrogate key map and the existing-key set are all read at the
//! start of the call and never cached across calls. Pending rows are resolved
//! and filtered against that snapshot, then inserted in fixed-size batches,
//! each batch committed in its own transaction.
//!
//! Database errors are caught at the public method boundary and reported as
//! `None`; the orchestrator logs the outcome and moves on to the next entity
//! type. Batches committed before a failure stay committed.

use crate::types::{Record, SqlValue};
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use mysql_async::{prelude::*, Conn, Params, Pool, TxOpts, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info};

/// Rows per insert transaction.
pub const BATCH_SIZE: usize = 1000;

const COVERED_ENTITY_TABLE: &str = "coveredentity";
const PARENT_LINK_TABLE: &str = "ceparentchild";
const IDENTIFIER_TABLE: &str = "coveredentityidentifier";

/// Write access to the operational store.
pub struct OperationalStore {
    pool: Pool,
    actor_id: String,
}

impl OperationalStore {
    pub fn new(pool: Pool, actor_id: impl Into<String>) -> Self {
        OperationalStore {
            pool,
            actor_id: actor_id.into(),
        }
    }

    /// Inserts new covered entities, skipping natural keys already present.
    ///
    /// Returns the number of rows inserted, or `None` on a database failure.
    pub async fn insert_covered_entities(&self, records: Vec<Record>) -> Option<usize> {
        match self.try_insert_covered_entities(records).await {
            Ok(inserted) => Some(inserted),
            Err(e) => {
                error!("Failed to insert covered entities: {e:#}");
                None
            }
        }
    }

    /// Inserts new parent/child links after resolving both endpoints.
    ///
    /// Links with an unresolvable endpoint and links whose surrogate-key pair
    /// already exists are dropped. Returns the number of rows inserted, or
    /// `None` on a database failure.
    pub async fn insert_parent_links(&self, records: Vec<Record>) -> Option<usize> {
        match self.try_insert_parent_links(records).await {
            Ok(inserted) => Some(inserted),
            Err(e) => {
                error!("Failed to insert parent links: {e:#}");
                None
            }
        }
    }

    /// Prepares identifier rows for insertion without inserting them.
    ///
    /// Identifier sync is an extension point that stops short of the insert:
    /// rows are resolved, keyed and stamped, and the prepared count is
    /// returned. Returns `None` on a database failure.
    pub async fn prepare_entity_identifiers(&self, records: Vec<Record>) -> Option<usize> {
        match self.try_prepare_entity_identifiers(records).await {
            Ok(prepared) => Some(prepared),
            Err(e) => {
                error!("Failed to prepare entity identifiers: {e:#}");
                None
            }
        }
    }

    async fn try_insert_covered_entities(&self, records: Vec<Record>) -> Result<usize> {
        let mut conn = self.pool.get_conn().await?;

        let columns = table_columns(&mut conn, COVERED_ENTITY_TABLE).await?;
        let existing = existing_natural_keys(&mut conn).await?;

        let (mut pending, duplicates) = partition_new(records, |record| {
            record
                .text("id340B")
                .is_some_and(|key| existing.contains(key))
        });
        if !duplicates.is_empty() {
            info!(
                "Skipping {} covered entities already present in the store",
                duplicates.len()
            );
        }
        if pending.is_empty() {
            info!("No new covered entities to insert");
            return Ok(0);
        }

        let max_key = max_surrogate_key(&mut conn, COVERED_ENTITY_TABLE).await?;
        assign_surrogate_keys(&mut pending, "ID", max_key, Utc::now());
        for record in &mut pending {
            record.insert("lastUpdatedBy", SqlValue::Text(self.actor_id.clone()));
        }

        insert_batches(&mut conn, COVERED_ENTITY_TABLE, &columns, &pending).await
    }

    async fn try_insert_parent_links(&self, records: Vec<Record>) -> Result<usize> {
        let mut conn = self.pool.get_conn().await?;

        let columns = table_columns(&mut conn, PARENT_LINK_TABLE).await?;
        let keys = entity_key_map(&mut conn).await?;

        let (resolved, unresolved) = resolve_parent_links(records, &keys);
        if unresolved > 0 {
            info!("Dropping {unresolved} parent links with unresolved endpoints");
        }

        let existing = existing_link_pairs(&mut conn).await?;
        let (mut pending, duplicates) = partition_new(resolved, |record| {
            match (record.int("CEKeyIDParent"), record.int("CEKeyIDChild")) {
                (Some(parent), Some(child)) => existing.contains(&(parent, child)),
                _ => false,
            }
        });
        if !duplicates.is_empty() {
            info!(
                "Skipping {} parent links already present in the store",
                duplicates.len()
            );
        }
        if pending.is_empty() {
            info!("No new parent links to insert");
            return Ok(0);
        }

        let max_key = max_surrogate_key(&mut conn, PARENT_LINK_TABLE).await?;
        assign_surrogate_keys(&mut pending, "ID", max_key, Utc::now());

        insert_batches(&mut conn, PARENT_LINK_TABLE, &columns, &pending).await
    }

    async fn try_prepare_entity_identifiers(&self, records: Vec<Record>) -> Result<usize> {
        if records.is_empty() {
            info!("No new entity identifiers to prepare");
            return Ok(0);
        }

        let mut conn = self.pool.get_conn().await?;

        let keys = entity_key_map(&mut conn).await?;
        let (mut pending, unresolved) = resolve_identifier_entities(records, &keys);
        if unresolved > 0 {
            debug!("{unresolved} identifiers reference entities not yet in the store");
        }

        let max_key = max_surrogate_key(&mut conn, IDENTIFIER_TABLE).await?;
        assign_surrogate_keys(&mut pending, "id", max_key, Utc::now());
        for record in &mut pending {
            record.insert("userCreated", SqlValue::Bool(false));
            record.insert("activeFlag", SqlValue::Bool(true));
        }

        // TODO(identifier sync): issue the insert once the store-side
        // uniqueness constraint on (coveredEntityKeyId, identifier) lands
        info!(
            "Prepared {} entity identifiers; insertion is not enabled",
            pending.len()
        );
        Ok(pending.len())
    }
}

/// Assigns `max_key + 1 ..= max_key + N` to the pending rows in input order
/// and stamps the last-updated timestamp.
fn assign_surrogate_keys(
    records: &mut [Record],
    key_column: &str,
    max_key: i64,
    now: DateTime<Utc>,
) {
    for (offset, record) in records.iter_mut().enumerate() {
        record.insert(key_column, SqlValue::Int(max_key + 1 + offset as i64));
        record.insert("lastUpdatedDate", SqlValue::Timestamp(now));
    }
}

/// Translates both link endpoints through the natural-to-surrogate key map.
///
/// Links where either side misses the map are dropped; the second element is
/// the dropped count.
fn resolve_parent_links(
    records: Vec<Record>,
    keys: &HashMap<String, i64>,
) -> (Vec<Record>, usize) {
    let mut resolved = Vec::new();
    let mut dropped = 0;
    for mut record in records {
        let parent = record
            .text("parentId340B")
            .and_then(|key| keys.get(key))
            .copied();
        let child = record
            .text("id340B")
            .and_then(|key| keys.get(key))
            .copied();
        match (parent, child) {
            (Some(parent), Some(child)) => {
                record.insert("CEKeyIDParent", SqlValue::Int(parent));
                record.insert("CEKeyIDChild", SqlValue::Int(child));
                resolved.push(record);
            }
            _ => dropped += 1,
        }
    }
    (resolved, dropped)
}

/// Resolves the owning entity of each identifier row.
///
/// Unresolved rows keep a null `coveredEntityKeyId`; they are counted but not
/// dropped, since identifier rows never reach the insert.
fn resolve_identifier_entities(
    records: Vec<Record>,
    keys: &HashMap<String, i64>,
) -> (Vec<Record>, usize) {
    let mut unresolved = 0;
    let records = records
        .into_iter()
        .map(|mut record| {
            let entity_key = record
                .text("id340B")
                .and_then(|key| keys.get(key))
                .copied();
            match entity_key {
                Some(key) => record.insert("coveredEntityKeyId", SqlValue::Int(key)),
                None => {
                    record.insert("coveredEntityKeyId", SqlValue::Null);
                    unresolved += 1;
                }
            }
            record
        })
        .collect();
    (records, unresolved)
}

/// Splits pending rows into (new, duplicate) per the given predicate.
fn partition_new<F>(records: Vec<Record>, is_duplicate: F) -> (Vec<Record>, Vec<Record>)
where
    F: Fn(&Record) -> bool,
{
    records.into_iter().partition(|record| !is_duplicate(record))
}

/// Destination columns actually written: the discovered table columns the
/// records carry values for, in table order.
fn insert_columns(table_columns: &[String], records: &[Record]) -> Vec<String> {
    let Some(first) = records.first() else {
        return Vec::new();
    };
    table_columns
        .iter()
        .filter(|column| first.get(column).is_some())
        .cloned()
        .collect()
}

/// Builds the batched INSERT statement with named placeholders.
fn insert_statement(table: &str, columns: &[String]) -> String {
    let placeholders: Vec<String> = columns.iter().map(|column| format!(":{column}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn named_params(record: &Record, columns: &[String]) -> Params {
    let pairs: Vec<(String, Value)> = columns
        .iter()
        .map(|column| {
            let value = record.get(column).unwrap_or(&SqlValue::Null);
            (column.clone(), mysql_value(value))
        })
        .collect();
    Params::from(pairs)
}

fn mysql_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::NULL,
        SqlValue::Bool(b) => Value::from(*b),
        SqlValue::Int(i) => Value::from(*i),
        SqlValue::Text(s) => Value::from(s.as_str()),
        SqlValue::Timestamp(ts) => {
            let naive = ts.naive_utc();
            Value::Date(
                naive.year() as u16,
                naive.month() as u8,
                naive.day() as u8,
                naive.hour() as u8,
                naive.minute() as u8,
                naive.second() as u8,
                ts.timestamp_subsec_micros(),
            )
        }
    }
}

/// Column list of a destination table, discovered at runtime.
async fn table_columns(conn: &mut Conn, table: &str) -> Result<Vec<String>> {
    let query = "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION";
    let columns: Vec<String> = conn.exec(query, (table,)).await?;
    if columns.is_empty() {
        anyhow::bail!("Table '{table}' not found in the operational store");
    }
    Ok(columns)
}

/// Current maximum surrogate key of a table, 0 when empty.
async fn max_surrogate_key(conn: &mut Conn, table: &str) -> Result<i64> {
    let max: Option<Option<i64>> = conn.query_first(format!("SELECT MAX(ID) FROM {table}")).await?;
    Ok(max.flatten().unwrap_or(0))
}

/// Snapshot of the store's natural-to-surrogate key map.
async fn entity_key_map(conn: &mut Conn) -> Result<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> = conn
        .query(format!("SELECT id340B, ID FROM {COVERED_ENTITY_TABLE}"))
        .await?;
    Ok(rows.into_iter().collect())
}

/// Snapshot of the natural keys already present in the store.
async fn existing_natural_keys(conn: &mut Conn) -> Result<HashSet<String>> {
    let keys: Vec<String> = conn
        .query(format!("SELECT id340B FROM {COVERED_ENTITY_TABLE}"))
        .await?;
    Ok(keys.into_iter().collect())
}

/// Snapshot of the surrogate-key pairs already linked in the store.
async fn existing_link_pairs(conn: &mut Conn) -> Result<HashSet<(i64, i64)>> {
    let pairs: Vec<(i64, i64)> = conn
        .query(format!(
            "SELECT CEKeyIDParent, CEKeyIDChild FROM {PARENT_LINK_TABLE}"
        ))
        .await?;
    Ok(pairs.into_iter().collect())
}

/// Inserts the pending rows in batches, each committed in its own
/// transaction. A failing batch aborts the call; earlier batches stay
/// committed and later batches are never attempted.
async fn insert_batches(
    conn: &mut Conn,
    table: &str,
    table_columns: &[String],
    records: &[Record],
) -> Result<usize> {
    let columns = insert_columns(table_columns, records);
    let statement = insert_statement(table, &columns);
    debug!("Insert statement for {table}: {statement}");

    let mut inserted = 0;
    for batch in records.chunks(BATCH_SIZE) {
        let params: Vec<Params> = batch
            .iter()
            .map(|record| named_params(record, &columns))
            .collect();

        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        tx.exec_batch(statement.as_str(), params)
            .await
            .with_context(|| format!("Insert into {table} failed after {inserted} rows"))?;
        tx.commit().await?;

        inserted += batch.len();
        debug!("Committed batch of {} rows into {table}", batch.len());
    }

    info!("Successfully inserted {inserted} rows into {table}");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id340b: &str) -> Record {
        let mut record = Record::new();
        record.insert("id340B", SqlValue::Text(id340b.to_string()));
        record
    }

    fn link(parent: &str, child: &str) -> Record {
        let mut record = Record::new();
        record.insert("parentId340B", SqlValue::Text(parent.to_string()));
        record.insert("id340B", SqlValue::Text(child.to_string()));
        record
    }

    #[test]
    fn test_assign_surrogate_keys_from_empty_table() {
        let mut records = vec![entity("A"), entity("B"), entity("C")];
        let now = Utc::now();
        assign_surrogate_keys(&mut records, "ID", 0, now);

        let keys: Vec<i64> = records.iter().filter_map(|r| r.int("ID")).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        for record in &records {
            assert_eq!(record.get("lastUpdatedDate"), Some(&SqlValue::Timestamp(now)));
        }
    }

    #[test]
    fn test_assign_surrogate_keys_continues_from_max() {
        let mut records = vec![entity("A"), entity("B")];
        assign_surrogate_keys(&mut records, "ID", 41, Utc::now());

        let keys: Vec<i64> = records.iter().filter_map(|r| r.int("ID")).collect();
        assert_eq!(keys, vec![42, 43]);
    }

    #[test]
    fn test_resolve_parent_links_drops_unresolved() {
        let keys = HashMap::from([("A".to_string(), 1), ("B".to_string(), 2)]);
        let records = vec![link("A", "B"), link("A", "unknown"), link("unknown", "B")];

        let (resolved, dropped) = resolve_parent_links(records, &keys);
        assert_eq!(resolved.len(), 1);
        assert_eq!(dropped, 2);
        assert_eq!(resolved[0].int("CEKeyIDParent"), Some(1));
        assert_eq!(resolved[0].int("CEKeyIDChild"), Some(2));
    }

    #[test]
    fn test_resolve_identifier_entities_keeps_unresolved() {
        let keys = HashMap::from([("A".to_string(), 1)]);
        let records = vec![entity("A"), entity("unknown")];

        let (resolved, unresolved) = resolve_identifier_entities(records, &keys);
        assert_eq!(resolved.len(), 2);
        assert_eq!(unresolved, 1);
        assert_eq!(resolved[0].int("coveredEntityKeyId"), Some(1));
        assert_eq!(resolved[1].get("coveredEntityKeyId"), Some(&SqlValue::Null));
    }

    #[test]
    fn test_partition_new_suppresses_duplicates() {
        let existing: HashSet<String> = HashSet::from(["K".to_string()]);
        let records = vec![entity("K"), entity("L")];

        let (new_records, duplicates) = partition_new(records, |record| {
            record
                .text("id340B")
                .is_some_and(|key| existing.contains(key))
        });
        assert_eq!(new_records.len(), 1);
        assert_eq!(new_records[0].text("id340B"), Some("L"));
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].text("id340B"), Some("K"));
    }

    #[test]
    fn test_insert_columns_intersects_in_table_order() {
        let table: Vec<String> = ["ID", "id340B", "city", "rowVersion"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut record = entity("A");
        record.insert("ID", SqlValue::Int(1));
        record.insert("city", SqlValue::Text("Springfield".to_string()));
        record.insert("parentId340B", SqlValue::Text("B".to_string()));

        let columns = insert_columns(&table, &[record]);
        assert_eq!(columns, vec!["ID", "id340B", "city"]);
    }

    #[test]
    fn test_insert_statement_uses_named_placeholders() {
        let columns: Vec<String> = ["ID", "id340B"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            insert_statement("coveredentity", &columns),
            "INSERT INTO coveredentity (ID, id340B) VALUES (:ID, :id340B)"
        );
    }

    #[test]
    fn test_mysql_value_conversions() {
        assert_eq!(mysql_value(&SqlValue::Null), Value::NULL);
        assert_eq!(mysql_value(&SqlValue::Int(7)), Value::from(7i64));
        assert_eq!(
            mysql_value(&SqlValue::Text("x".to_string())),
            Value::from("x")
        );

        let ts = DateTime::parse_from_rfc3339("2024-06-01T12:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            mysql_value(&SqlValue::Timestamp(ts)),
            Value::Date(2024, 6, 1, 12, 30, 45, 0)
        );
    }

    // Empty destination, three new entities, then a link between two of them
    // and a link referencing an unknown entity.
    #[test]
    fn test_first_run_key_assignment_and_link_resolution() {
        let mut entities = vec![entity("A"), entity("B"), entity("C")];
        assign_surrogate_keys(&mut entities, "ID", 0, Utc::now());

        let keys: HashMap<String, i64> = entities
            .iter()
            .map(|r| (r.text("id340B").unwrap().to_string(), r.int("ID").unwrap()))
            .collect();

        let (resolved, dropped) = resolve_parent_links(vec![link("A", "B")], &keys);
        assert_eq!(resolved[0].int("CEKeyIDParent"), Some(1));
        assert_eq!(resolved[0].int("CEKeyIDChild"), Some(2));
        assert_eq!(dropped, 0);

        let (resolved, dropped) = resolve_parent_links(vec![link("A", "unknown")], &keys);
        assert!(resolved.is_empty());
        assert_eq!(dropped, 1);
    }
}
