//! Record keys
//!
//! Every change item is addressed by a key of the form
//! `"schema"."table"/"pk1"/"pk2"`. In the relation part `.` is written `..`
//! and `/` is written `//`; in primary-key values `/` is written `//` and `"`
//! is written `""`. A NULL key component is the bare token `_`.

use crate::error::{Error, Result};
use crate::value::Row;

fn escape_relation(s: &str) -> String {
    s.replace('.', "..").replace('/', "//")
}

fn escape_pk(s: &str) -> String {
    s.replace('/', "//").replace('"', "\"\"")
}

/// Build a key from primary-key values in key order; `None` is NULL
pub fn build_key(schema: &str, table: &str, pk_values: &[Option<&str>]) -> String {
    let mut key = format!(
        "\"{}\".\"{}\"",
        escape_relation(schema),
        escape_relation(table)
    );
    for value in pk_values {
        key.push('/');
        match value {
            Some(v) => {
                key.push('"');
                key.push_str(&escape_pk(v));
                key.push('"');
            }
            None => key.push('_'),
        }
    }
    key
}

/// Build the key of `row` from its primary key columns.
///
/// Tables without a primary key are keyed by every column of the row in
/// column-name order.
pub fn key_for_row(schema: &str, table: &str, pk: &[String], row: &Row) -> String {
    let rendered: Vec<Option<String>> = if pk.is_empty() {
        row.values().map(|v| v.to_wire()).collect()
    } else {
        pk.iter()
            .map(|col| row.get(col).and_then(|v| v.to_wire()))
            .collect()
    };
    let values: Vec<Option<&str>> = rendered.iter().map(|v| v.as_deref()).collect();
    build_key(schema, table, &values)
}

/// Components of a decoded key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParts {
    pub schema: String,
    pub table: String,
    pub pk_values: Vec<Option<String>>,
}

/// Decode a key built by [`build_key`]
pub fn parse_key(key: &str) -> Result<KeyParts> {
    let invalid = || Error::Serialization(format!("malformed record key: {key}"));

    let segments = split_segments(key);
    let (relation, pks) = segments.split_first().ok_or_else(invalid)?;

    let inner = relation
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .ok_or_else(invalid)?;
    let sep = find_relation_separator(inner).ok_or_else(invalid)?;
    let schema = unescape_relation(&inner[..sep]);
    let table = unescape_relation(&inner[sep + 3..]);

    let pk_values = pks
        .iter()
        .map(|segment| {
            if *segment == "_" {
                return Ok(None);
            }
            segment
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .map(|s| Some(s.replace("\"\"", "\"").replace("//", "/")))
                .ok_or_else(invalid)
        })
        .collect::<Result<_>>()?;

    Ok(KeyParts {
        schema,
        table,
        pk_values,
    })
}

/// Split on single `/`; a doubled `//` stays inside its segment
fn split_segments(key: &str) -> Vec<&str> {
    let bytes = key.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'/' {
            if bytes.get(i + 1) == Some(&b'/') {
                i += 2;
                continue;
            }
            segments.push(&key[start..i]);
            start = i + 1;
        }
        i += 1;
    }
    segments.push(&key[start..]);
    segments
}

/// Position of the `"."` between schema and table, skipping escaped `..`
fn find_relation_separator(inner: &str) -> Option<usize> {
    let bytes = inner.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'.' {
            if bytes.get(i + 1) == Some(&b'.') {
                i += 2;
                continue;
            }
            if i > 0 && bytes[i - 1] == b'"' && bytes.get(i + 1) == Some(&b'"') {
                return Some(i - 1);
            }
        }
        i += 1;
    }
    None
}

fn unescape_relation(s: &str) -> String {
    s.replace("..", ".").replace("//", "/")
}
