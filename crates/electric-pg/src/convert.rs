//! pgoutput to shape-engine conversion
//!
//! Tracks relation and type metadata announced on the stream and turns
//! decoded pgoutput messages into [`WalMessage`]s with typed rows.

use crate::error::{PgError, PgResult};
use crate::protocol::message::{
    OldTuple, RelationBody, ReplicationMessage, Tuple, TupleData,
};
use crate::types;
use electric_core::{Relation, RelationColumn, Row, Value, WalMessage};
use std::collections::HashMap;
use tracing::debug;

/// Stateful converter for one replication session
#[derive(Debug, Default)]
pub struct WalConverter {
    relations: HashMap<u32, Relation>,
    /// Names of non built-in types announced by `Type` messages
    types: HashMap<u32, String>,
}

impl WalConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: u32) -> Option<&Relation> {
        self.relations.get(&id)
    }

    /// Convert one message; `Ok(None)` for messages the shape engine does
    /// not consume
    pub fn convert(&mut self, msg: ReplicationMessage) -> PgResult<Option<WalMessage>> {
        let converted = match msg {
            ReplicationMessage::Begin(begin) => WalMessage::Begin {
                xid: u64::from(begin.xid),
                final_lsn: begin.final_lsn,
            },
            ReplicationMessage::Commit(commit) => WalMessage::Commit {
                commit_lsn: commit.commit_lsn,
                end_lsn: commit.end_lsn,
            },
            ReplicationMessage::Relation(body) => {
                let relation = self.relation_from(body);
                self.relations.insert(relation.id, relation.clone());
                WalMessage::Relation(relation)
            }
            ReplicationMessage::Type(body) => {
                debug!(oid = body.id, name = %body.name, "Custom type announced");
                self.types.insert(body.id, body.name);
                return Ok(None);
            }
            ReplicationMessage::Insert(insert) => {
                let relation = self.lookup(insert.relation_id)?;
                WalMessage::Insert {
                    relation_id: insert.relation_id,
                    new: decode_tuple(relation, &insert.tuple, None)?,
                }
            }
            ReplicationMessage::Update(update) => {
                let relation = self.lookup(update.relation_id)?;
                let old_full = match &update.old {
                    Some(OldTuple::Full(tuple)) => Some(decode_tuple(relation, tuple, None)?),
                    _ => None,
                };
                let new = decode_tuple(relation, &update.new_tuple, old_full.as_ref())?;
                let old = match update.old {
                    Some(OldTuple::Full(_)) => old_full,
                    // only the identity changed: the rest of the old row
                    // equals the new row
                    Some(OldTuple::Key(tuple)) => {
                        let mut old = new.clone();
                        old.extend(decode_key(relation, &tuple)?);
                        Some(old)
                    }
                    None => None,
                };
                WalMessage::Update {
                    relation_id: update.relation_id,
                    old,
                    new,
                }
            }
            ReplicationMessage::Delete(delete) => {
                let relation = self.lookup(delete.relation_id)?;
                let old = match &delete.old {
                    OldTuple::Full(tuple) => decode_tuple(relation, tuple, None)?,
                    OldTuple::Key(tuple) => decode_key(relation, tuple)?,
                };
                WalMessage::Delete {
                    relation_id: delete.relation_id,
                    old,
                }
            }
            ReplicationMessage::Truncate(truncate) => WalMessage::Truncate {
                relation_ids: truncate.relation_ids,
            },
            ReplicationMessage::Origin(_) | ReplicationMessage::Message(_) => return Ok(None),
        };
        Ok(Some(converted))
    }

    fn lookup(&self, id: u32) -> PgResult<&Relation> {
        self.relations
            .get(&id)
            .ok_or_else(|| PgError::Protocol(format!("change for unannounced relation {id}")))
    }

    fn relation_from(&self, body: RelationBody) -> Relation {
        let columns = body
            .columns
            .into_iter()
            .map(|col| {
                let type_name = types::type_name(col.type_id)
                    .map(str::to_string)
                    .or_else(|| self.types.get(&col.type_id).cloned())
                    .unwrap_or_else(|| "text".to_string());
                let is_key = col.is_key();
                let mut column = RelationColumn::new(col.name, type_name);
                column.type_mod = col.type_mod;
                column.is_key = is_key;
                column
            })
            .collect();
        Relation::new(body.id, body.namespace, body.name, columns)
    }
}

/// Decode a full tuple. Unchanged TOAST values are taken from `old` when
/// available and left out of the row otherwise.
fn decode_tuple(relation: &Relation, tuple: &Tuple, old: Option<&Row>) -> PgResult<Row> {
    check_width(relation, tuple)?;
    let mut row = Row::new();
    for (column, data) in relation.columns.iter().zip(&tuple.0) {
        let value = match data {
            TupleData::Null => Value::Null,
            TupleData::Text(bytes) => Value::decode_text(&column.type_name, &text(bytes)?),
            TupleData::Toast => match old.and_then(|o| o.get(&column.name)) {
                Some(previous) => previous.clone(),
                None => continue,
            },
        };
        row.insert(column.name.clone(), value);
    }
    Ok(row)
}

/// Decode only the replica identity columns of a key tuple
fn decode_key(relation: &Relation, tuple: &Tuple) -> PgResult<Row> {
    check_width(relation, tuple)?;
    let mut row = Row::new();
    for (column, data) in relation.columns.iter().zip(&tuple.0) {
        if !column.is_key {
            continue;
        }
        let value = match data {
            TupleData::Text(bytes) => Value::decode_text(&column.type_name, &text(bytes)?),
            TupleData::Null | TupleData::Toast => Value::Null,
        };
        row.insert(column.name.clone(), value);
    }
    Ok(row)
}

fn check_width(relation: &Relation, tuple: &Tuple) -> PgResult<()> {
    if tuple.len() != relation.columns.len() {
        return Err(PgError::Protocol(format!(
            "tuple has {} columns, relation {}.{} has {}",
            tuple.len(),
            relation.schema,
            relation.table,
            relation.columns.len()
        )));
    }
    Ok(())
}

fn text(bytes: &[u8]) -> PgResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| PgError::Protocol(format!("column value is not UTF-8: {e}")))
}
