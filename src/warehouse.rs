//! Warehouse-side extraction.
//!
//! Each fetch runs a fixed query against the analytics warehouse that
//! anti-joins the curated mart against the store replica maintained under the
//! `mirror` schema, so only rows not yet present downstream come back. Column
//! names are lowercased, renamed per a fixed mapping table and restricted to
//! the mapped set, leaving every record in the store's column vocabulary.
//!
//! Extraction errors are not caught here; a failed query is fatal for the
//! entity type being synced.

use crate::types::{Record, SqlValue};
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio_postgres::{Client, Row};
use tracing::debug;

/// Column mapping for covered entities, applied after lowercasing.
const COVERED_ENTITY_COLUMNS: &[(&str, &str)] = &[
    ("ce_340b_id", "id340B"),
    ("covered_entity_name", "entityName"),
    ("covered_entity_type", "entityType"),
    ("entity_subdivision_name", "entitySubDivisionName"),
    ("address_street_1", "address1"),
    ("address_street_2", "address2"),
    ("address_city", "city"),
    ("address_state", "st"),
    ("address_zip", "zip"),
    ("medicare_provider_number", "medicareProviderNumber"),
];

/// Column mapping for parent/child links.
const PARENT_LINK_COLUMNS: &[(&str, &str)] = &[
    ("ce_340b_id", "id340B"),
    ("parent_ce_340b_id", "parentId340B"),
];

/// Column mapping for secondary entity identifiers.
const IDENTIFIER_COLUMNS: &[(&str, &str)] = &[
    ("identifier_field_name", "identifierType"),
    ("crosswalked_identifier_field_value", "identifier"),
    ("ce_340b_id", "id340B"),
];

/// Read-only access to the analytics warehouse.
///
/// Queries are fixed, parameterized only by the database-name prefix supplied
/// at construction.
pub struct WarehouseReader {
    client: Client,
    database: String,
}

impl WarehouseReader {
    pub fn new(client: Client, database: impl Into<String>) -> Self {
        WarehouseReader {
            client,
            database: database.into(),
        }
    }

    /// Covered entities present in the mart but absent from the store.
    pub async fn fetch_new_covered_entities(&self) -> Result<Vec<Record>> {
        let query = format!(
            "SELECT mart.* \
             FROM {db}.silver.mart_covered_entities mart \
             LEFT JOIN {db}.mirror.coveredentity dst \
                 ON dst.id = mart.covered_entity_key_id \
             WHERE dst.id IS NULL",
            db = self.database
        );
        self.fetch(&query, COVERED_ENTITY_COLUMNS).await
    }

    /// Parent/child links whose child is not yet linked in the store.
    pub async fn fetch_new_parent_links(&self) -> Result<Vec<Record>> {
        let query = format!(
            "SELECT mart.ce_340b_id, mart.parent_ce_340b_id \
             FROM {db}.silver.mart_covered_entities mart \
             LEFT JOIN {db}.mirror.ceparentchild dst \
                 ON dst.cekeyidchild = mart.covered_entity_key_id \
             WHERE dst.id IS NULL \
             AND mart.source = 'hrsa'",
            db = self.database
        );
        self.fetch(&query, PARENT_LINK_COLUMNS).await
    }

    /// Secondary identifiers not yet attached to their entity in the store.
    ///
    /// Medicaid numbers are carried on the entity row itself and excluded
    /// from the crosswalk.
    pub async fn fetch_new_entity_identifiers(&self) -> Result<Vec<Record>> {
        let query = format!(
            "SELECT xwalk.* \
             FROM {db}.silver.mart_covered_entities_identifier_crosswalk xwalk \
             INNER JOIN {db}.silver.mart_covered_entities mart \
                 ON mart.ce_340b_id = xwalk.ce_340b_id \
             LEFT JOIN {db}.mirror.coveredentityidentifier dst \
                 ON dst.coveredentitykeyid = mart.covered_entity_key_id \
                 AND dst.identifier = xwalk.crosswalked_identifier_field_value \
             WHERE dst.coveredentitykeyid IS NULL \
             AND xwalk.identifier_field_name != 'medicaid_number'",
            db = self.database
        );
        self.fetch(&query, IDENTIFIER_COLUMNS).await
    }

    async fn fetch(&self, query: &str, mapping: &[(&'static str, &'static str)]) -> Result<Vec<Record>> {
        debug!("Warehouse query: {query}");
        let rows = self.client.query(query, &[]).await?;
        rows.iter().map(|row| remap_row(row, mapping)).collect()
    }
}

/// Renames a raw warehouse column into the store vocabulary, or drops it.
fn dest_column(source: &str, mapping: &[(&'static str, &'static str)]) -> Option<&'static str> {
    let source = source.to_lowercase();
    mapping
        .iter()
        .find(|(from, _)| *from == source)
        .map(|(_, to)| *to)
}

/// Restricts a row to the mapped columns, renamed into store vocabulary.
fn remap_row(row: &Row, mapping: &[(&'static str, &'static str)]) -> Result<Record> {
    let mut record = Record::new();
    for (index, column) in row.columns().iter().enumerate() {
        if let Some(renamed) = dest_column(column.name(), mapping) {
            record.insert(renamed, convert_value(row, index)?);
        }
    }
    Ok(record)
}

/// Converts one warehouse column value into a [`SqlValue`].
fn convert_value(row: &Row, index: usize) -> Result<SqlValue> {
    use tokio_postgres::types::Type;

    let column = &row.columns()[index];
    match *column.type_() {
        Type::BOOL => match row.try_get::<_, Option<bool>>(index)? {
            Some(b) => Ok(SqlValue::Bool(b)),
            None => Ok(SqlValue::Null),
        },
        Type::INT2 => match row.try_get::<_, Option<i16>>(index)? {
            Some(i) => Ok(SqlValue::Int(i as i64)),
            None => Ok(SqlValue::Null),
        },
        Type::INT4 => match row.try_get::<_, Option<i32>>(index)? {
            Some(i) => Ok(SqlValue::Int(i as i64)),
            None => Ok(SqlValue::Null),
        },
        Type::INT8 => match row.try_get::<_, Option<i64>>(index)? {
            Some(i) => Ok(SqlValue::Int(i)),
            None => Ok(SqlValue::Null),
        },
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            match row.try_get::<_, Option<String>>(index)? {
                Some(s) => Ok(SqlValue::Text(s)),
                None => Ok(SqlValue::Null),
            }
        }
        Type::TIMESTAMP => match row.try_get::<_, Option<NaiveDateTime>>(index)? {
            Some(ts) => Ok(SqlValue::Timestamp(DateTime::<Utc>::from_naive_utc_and_offset(
                ts, Utc,
            ))),
            None => Ok(SqlValue::Null),
        },
        Type::TIMESTAMPTZ => match row.try_get::<_, Option<DateTime<Utc>>>(index)? {
            Some(ts) => Ok(SqlValue::Timestamp(ts)),
            None => Ok(SqlValue::Null),
        },
        ref other => {
            // Unknown types come back as text when the driver allows it
            if let Ok(s) = row.try_get::<_, String>(index) {
                Ok(SqlValue::Text(s))
            } else {
                Err(anyhow::anyhow!(
                    "Unsupported warehouse type {other:?} in column '{}'",
                    column.name()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dest_column_lowercases_before_renaming() {
        assert_eq!(
            dest_column("CE_340B_ID", COVERED_ENTITY_COLUMNS),
            Some("id340B")
        );
        assert_eq!(
            dest_column("Address_State", COVERED_ENTITY_COLUMNS),
            Some("st")
        );
    }

    #[test]
    fn test_unmapped_columns_are_dropped() {
        assert_eq!(dest_column("covered_entity_key_id", COVERED_ENTITY_COLUMNS), None);
        assert_eq!(dest_column("source", PARENT_LINK_COLUMNS), None);
    }

    #[test]
    fn test_covered_entity_mapping_targets() {
        let targets: Vec<&str> = COVERED_ENTITY_COLUMNS.iter().map(|(_, to)| *to).collect();
        assert_eq!(
            targets,
            vec![
                "id340B",
                "entityName",
                "entityType",
                "entitySubDivisionName",
                "address1",
                "address2",
                "city",
                "st",
                "zip",
                "medicareProviderNumber",
            ]
        );
    }

    #[test]
    fn test_identifier_mapping_targets() {
        assert_eq!(
            dest_column("identifier_field_name", IDENTIFIER_COLUMNS),
            Some("identifierType")
        );
        assert_eq!(
            dest_column("CROSSWALKED_IDENTIFIER_FIELD_VALUE", IDENTIFIER_COLUMNS),
            Some("identifier")
        );
    }
}
