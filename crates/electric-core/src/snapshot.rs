//! Initial snapshots and the database catalog
//!
//! A consumer takes its shape's initial snapshot through a
//! [`SnapshotExecutor`] and resolves table schemas through a [`Catalog`].
//! The PostgreSQL crate provides the real implementations; [`MemorySource`]
//! serves both from process memory.

use crate::error::{Error, Result};
use crate::ident::{quote_identifier, quote_relation};
use crate::key::key_for_row;
use crate::log_item::{ChangeItem, LogItem};
use crate::offset::LogOffset;
use crate::pg_snapshot::PgSnapshot;
use crate::schema::TableSchema;
use crate::shape::Shape;
use crate::value::{row_to_wire, Row};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

/// Session settings applied before the snapshot query so that text output
/// matches what logical replication delivers
pub const SNAPSHOT_SESSION_SETTINGS: &[&str] = &[
    "SET bytea_output = 'hex'",
    "SET DateStyle = 'ISO, DMY'",
    "SET TimeZone = 'UTC'",
    "SET extra_float_digits = 1",
    "SET IntervalStyle = 'iso_8601'",
];

/// Query capturing the visibility snapshot and WAL position of the
/// snapshot transaction
pub const SNAPSHOT_INFO_QUERY: &str =
    "SELECT pg_current_snapshot()::text, pg_current_wal_lsn()::text";

/// Rows of a shape as of one visibility snapshot
#[derive(Debug, Clone)]
pub struct SnapshotResult {
    /// Projected rows in primary key order
    pub rows: Vec<Row>,
    pub pg_snapshot: PgSnapshot,
    /// WAL position at snapshot time
    pub lsn: u64,
}

/// Runs the initial snapshot query of a shape
#[async_trait]
pub trait SnapshotExecutor: Send + Sync {
    async fn execute(&self, shape: &Shape) -> Result<SnapshotResult>;
}

/// Table metadata and publication membership
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolve the typed schema of `schema.table`
    async fn load_table_schema(&self, schema: &str, table: &str) -> Result<TableSchema>;

    /// Make sure changes of `schema.table` are replicated
    async fn add_to_publication(&self, schema: &str, table: &str) -> Result<()>;
}

/// `SELECT` for a shape's snapshot.
///
/// Every column is cast to text so snapshot rows decode exactly like
/// replicated tuples.
pub fn snapshot_query(shape: &Shape) -> String {
    let columns = shape.output_columns();
    let select = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| {
                let quoted = quote_identifier(c);
                format!("{quoted}::text AS {quoted}")
            })
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut sql = format!(
        "SELECT {select} FROM {}",
        quote_relation(shape.schema(), shape.table())
    );
    if let Some(where_sql) = shape.where_sql() {
        sql.push_str(" WHERE ");
        sql.push_str(where_sql);
    }
    let pk = shape.primary_key();
    if !pk.is_empty() {
        let order: Vec<String> = pk.iter().map(|c| quote_identifier(c)).collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    sql
}

/// Key of a row as it appears in the shape log; computed from the projected
/// row so snapshot and replication agree for tables without a primary key
pub fn shape_key(shape: &Shape, projected: &Row) -> String {
    key_for_row(
        shape.schema(),
        shape.table(),
        &shape.primary_key(),
        projected,
    )
}

/// Convert snapshot rows into insert items at `0_0`, `0_1`, ...
pub fn snapshot_items(shape: &Shape, rows: &[Row]) -> Vec<LogItem> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let projected = shape.project(row);
            ChangeItem::insert(
                LogOffset::new(0, i as u64),
                shape_key(shape, &projected),
                row_to_wire(&projected),
            )
            .with_relation(shape.schema(), shape.table())
            .into()
        })
        .collect()
}

/// Snapshot source and catalog backed by in-process tables.
///
/// Rows are returned in insertion order.
pub struct MemorySource {
    tables: RwLock<HashMap<(String, String), (TableSchema, Vec<Row>)>>,
    pg_snapshot: RwLock<PgSnapshot>,
    published: RwLock<BTreeSet<(String, String)>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            pg_snapshot: RwLock::new(PgSnapshot::new(1, 1, Vec::new())),
            published: RwLock::new(BTreeSet::new()),
        }
    }

    /// Register a table with its current rows
    pub fn add_table(&self, schema: TableSchema, rows: Vec<Row>) {
        let key = (schema.schema.clone(), schema.name.clone());
        self.tables.write().insert(key, (schema, rows));
    }

    pub fn set_pg_snapshot(&self, snapshot: PgSnapshot) {
        *self.pg_snapshot.write() = snapshot;
    }

    /// Tables added to the publication so far
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.read().iter().cloned().collect()
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotExecutor for MemorySource {
    async fn execute(&self, shape: &Shape) -> Result<SnapshotResult> {
        let rows = {
            let tables = self.tables.read();
            let (_, rows) = tables
                .get(&(shape.schema().to_string(), shape.table().to_string()))
                .ok_or_else(|| Error::Snapshot(format!("table {} does not exist", shape.table_ref())))?;
            rows.clone()
        };

        let mut selected = Vec::new();
        for row in rows {
            if shape.matches(&row)? {
                selected.push(shape.project(&row));
            }
        }
        let pg_snapshot = self.pg_snapshot.read().clone();
        Ok(SnapshotResult {
            rows: selected,
            lsn: pg_snapshot.xmin,
            pg_snapshot,
        })
    }
}

#[async_trait]
impl Catalog for MemorySource {
    async fn load_table_schema(&self, schema: &str, table: &str) -> Result<TableSchema> {
        self.tables
            .read()
            .get(&(schema.to_string(), table.to_string()))
            .map(|(ts, _)| ts.clone())
            .ok_or_else(|| {
                Error::InvalidShape(format!(
                    "table {} does not exist",
                    quote_relation(schema, table)
                ))
            })
    }

    async fn add_to_publication(&self, schema: &str, table: &str) -> Result<()> {
        self.published
            .write()
            .insert((schema.to_string(), table.to_string()));
        Ok(())
    }
}
