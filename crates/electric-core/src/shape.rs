//! Shape definitions
//!
//! A [`Shape`] is an immutable `(schema, table, where, columns, replica)`
//! subscription. Its [`Shape::hash`] is the deduplication key used by the
//! shape cache.

use crate::error::{Error, Result};
use crate::handle::short_hash;
use crate::ident::{self, DEFAULT_SCHEMA};
use crate::predicate::Predicate;
use crate::schema::TableSchema;
use crate::value::Row;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How much of a row update and delete items carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaMode {
    /// Updates carry PK plus changed columns, deletes carry PK only
    #[default]
    Default,
    /// Updates and deletes carry the full projected row
    Full,
}

impl ReplicaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaMode::Default => "default",
            ReplicaMode::Full => "full",
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, ReplicaMode::Full)
    }
}

impl FromStr for ReplicaMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "default" => Ok(ReplicaMode::Default),
            "full" => Ok(ReplicaMode::Full),
            other => Err(Error::InvalidReplica(other.to_string())),
        }
    }
}

impl fmt::Display for ReplicaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request parameters defining a shape, before parsing
#[derive(Debug, Clone, Default)]
pub struct ShapeParams<'a> {
    pub table: &'a str,
    pub where_clause: Option<&'a str>,
    pub columns: Option<&'a str>,
    pub replica: Option<&'a str>,
}

/// A subscription to a subset of one table
#[derive(Debug, Clone)]
pub struct Shape {
    schema: String,
    table: String,
    predicate: Option<Predicate>,
    columns: Vec<String>,
    replica: ReplicaMode,
    table_schema: Option<TableSchema>,
}

impl Shape {
    /// Shape over every row and column of `schema.table`
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        let schema = schema.into();
        Self {
            schema: if schema.is_empty() {
                DEFAULT_SCHEMA.to_string()
            } else {
                schema
            },
            table: table.into(),
            predicate: None,
            columns: Vec::new(),
            replica: ReplicaMode::Default,
            table_schema: None,
        }
    }

    /// Build a shape from raw request parameters
    pub fn from_params(params: &ShapeParams<'_>) -> Result<Self> {
        let (schema, table) = ident::parse_table(params.table)?;
        let mut shape = Shape::new(schema, table);

        if let Some(sql) = params.where_clause.filter(|w| !w.trim().is_empty()) {
            shape = shape.with_predicate(Predicate::parse(sql)?);
        }
        if let Some(cols) = params.columns {
            shape = shape.with_columns(ident::parse_columns(cols)?);
        }
        if let Some(replica) = params.replica {
            shape = shape.with_replica(replica.parse()?);
        }
        Ok(shape)
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Select columns; stored sorted and deduplicated
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        let set: BTreeSet<String> = columns.into_iter().collect();
        self.columns = set.into_iter().collect();
        self
    }

    pub fn with_replica(mut self, replica: ReplicaMode) -> Self {
        self.replica = replica;
        self
    }

    /// Attach the resolved table schema, checking that every selected and
    /// every WHERE-referenced column exists
    pub fn with_table_schema(mut self, table_schema: TableSchema) -> Result<Self> {
        let available = table_schema.column_names();
        let mut unknown: BTreeSet<String> = self
            .columns
            .iter()
            .filter(|c| !available.contains(c))
            .cloned()
            .collect();
        if let Some(predicate) = &self.predicate {
            unknown.extend(
                predicate
                    .columns()
                    .iter()
                    .filter(|c| !available.contains(c))
                    .cloned(),
            );
        }
        if !unknown.is_empty() {
            return Err(Error::UnknownColumns(unknown.into_iter().collect()));
        }

        self.table_schema = Some(table_schema);
        Ok(self)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    /// Normalised WHERE SQL, if any
    pub fn where_sql(&self) -> Option<&str> {
        self.predicate.as_ref().map(Predicate::sql)
    }

    /// Requested columns; empty means all
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn replica(&self) -> ReplicaMode {
        self.replica
    }

    pub fn table_schema(&self) -> Option<&TableSchema> {
        self.table_schema.as_ref()
    }

    /// Whether the shape is over `schema.table`
    pub fn is_relation(&self, schema: &str, table: &str) -> bool {
        self.schema == schema && self.table == table
    }

    /// Quoted `"schema"."table"`
    pub fn table_ref(&self) -> String {
        ident::quote_relation(&self.schema, &self.table)
    }

    /// Deduplication hash over the normalised definition
    pub fn hash(&self) -> String {
        let definition = [
            self.schema.as_str(),
            self.table.as_str(),
            &self.columns.join(","),
            self.where_sql().unwrap_or_default(),
            self.replica.as_str(),
        ]
        .join("\0");
        short_hash(definition.as_bytes())
    }

    /// Primary key column names in key order, empty without a schema
    pub fn primary_key(&self) -> Vec<String> {
        self.table_schema
            .as_ref()
            .map(TableSchema::primary_key_names)
            .unwrap_or_default()
    }

    /// Columns whose values appear in log items: the selection plus the
    /// primary key, or every column when nothing is selected
    pub fn output_columns(&self) -> Vec<String> {
        let Some(ts) = &self.table_schema else {
            return self.columns.clone();
        };
        if self.columns.is_empty() {
            return ts.column_names();
        }
        let pk = ts.primary_key_names();
        let mut out: Vec<String> = pk
            .iter()
            .filter(|c| !self.columns.contains(c))
            .cloned()
            .collect();
        out.extend(self.columns.iter().cloned());
        out
    }

    /// Whether `name` is part of the output projection
    pub fn includes_column(&self, name: &str) -> bool {
        if self.columns.is_empty() || self.columns.iter().any(|c| c == name) {
            return true;
        }
        self.table_schema
            .as_ref()
            .and_then(|ts| ts.column(name))
            .is_some_and(|c| c.is_primary_key())
    }

    /// Restrict a row to the output projection
    pub fn project(&self, row: &Row) -> Row {
        row.iter()
            .filter(|(k, _)| self.includes_column(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Evaluate the WHERE clause; shapes without one match every row
    pub fn matches(&self, row: &Row) -> Result<bool> {
        match &self.predicate {
            Some(p) => p.matches(row),
            None => Ok(true),
        }
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema
            && self.table == other.table
            && self.columns == other.columns
            && self.where_sql() == other.where_sql()
            && self.replica == other.replica
    }
}

impl Eq for Shape {}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)?;
        if !self.columns.is_empty() {
            write!(f, " [{}]", self.columns.join(", "))?;
        }
        if let Some(sql) = self.where_sql() {
            write!(f, " WHERE {sql}")?;
        }
        if self.replica.is_full() {
            f.write_str(" (replica=full)")?;
        }
        Ok(())
    }
}
