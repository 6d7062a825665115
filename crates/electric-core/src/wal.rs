//! Logical replication change model
//!
//! The PostgreSQL crate decodes pgoutput into [`WalMessage`]s; the
//! [`Collector`](crate::collector::Collector) groups them into
//! [`Transaction`]s of [`Change`]s with assigned log offsets.

use crate::offset::LogOffset;
use crate::value::{Row, Value};
use std::sync::Arc;

/// Column of a replicated relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    pub name: String,
    /// PostgreSQL type name (`int4`, `text`, ...)
    pub type_name: String,
    pub type_mod: i32,
    /// Part of the replica identity key
    pub is_key: bool,
}

impl RelationColumn {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            type_mod: -1,
            is_key: false,
        }
    }

    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }
}

/// Relation metadata announced ahead of its data messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<RelationColumn>,
}

impl Relation {
    pub fn new(
        id: u32,
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<RelationColumn>,
    ) -> Self {
        Self {
            id,
            schema: schema.into(),
            table: table.into(),
            columns,
        }
    }

    /// Replica identity columns in relation order
    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_key)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&RelationColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Decode a tuple of optional text values in column order
    pub fn decode_row<'a>(&self, values: impl IntoIterator<Item = Option<&'a str>>) -> Row {
        self.columns
            .iter()
            .zip(values)
            .map(|(col, v)| {
                let value = match v {
                    Some(text) => Value::decode_text(&col.type_name, text),
                    None => Value::Null,
                };
                (col.name.clone(), value)
            })
            .collect()
    }
}

/// A decoded replication message
#[derive(Debug, Clone, PartialEq)]
pub enum WalMessage {
    Begin {
        xid: u64,
        /// LSN of the transaction's commit record
        final_lsn: u64,
    },
    Commit {
        commit_lsn: u64,
        end_lsn: u64,
    },
    Relation(Relation),
    Insert {
        relation_id: u32,
        new: Row,
    },
    Update {
        relation_id: u32,
        /// Old row or old key; absent when neither changed identity
        old: Option<Row>,
        new: Row,
    },
    Delete {
        relation_id: u32,
        old: Row,
    },
    Truncate {
        relation_ids: Vec<u32>,
    },
}

/// Kind of a row change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row change within a transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub offset: LogOffset,
    pub schema: String,
    pub table: String,
    pub new: Option<Row>,
    pub old: Option<Row>,
}

impl Change {
    pub fn insert(offset: LogOffset, schema: &str, table: &str, new: Row) -> Self {
        Self {
            kind: ChangeKind::Insert,
            offset,
            schema: schema.to_string(),
            table: table.to_string(),
            new: Some(new),
            old: None,
        }
    }

    pub fn update(offset: LogOffset, schema: &str, table: &str, old: Option<Row>, new: Row) -> Self {
        Self {
            kind: ChangeKind::Update,
            offset,
            schema: schema.to_string(),
            table: table.to_string(),
            new: Some(new),
            old,
        }
    }

    pub fn delete(offset: LogOffset, schema: &str, table: &str, old: Row) -> Self {
        Self {
            kind: ChangeKind::Delete,
            offset,
            schema: schema.to_string(),
            table: table.to_string(),
            new: None,
            old: Some(old),
        }
    }

    pub fn is_relation(&self, schema: &str, table: &str) -> bool {
        self.schema == schema && self.table == table
    }
}

/// A committed transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub xid: u64,
    /// Commit LSN; the `tx` part of every offset in the transaction
    pub lsn: u64,
    pub changes: Vec<Change>,
}

impl Transaction {
    /// Changes touching `schema.table`
    pub fn changes_for<'a>(
        &'a self,
        schema: &'a str,
        table: &'a str,
    ) -> impl Iterator<Item = &'a Change> + 'a {
        self.changes
            .iter()
            .filter(move |c| c.is_relation(schema, table))
    }
}

/// Events delivered to a shape consumer
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Transaction(Arc<Transaction>),
    Relation(Arc<Relation>),
    Truncate,
}
