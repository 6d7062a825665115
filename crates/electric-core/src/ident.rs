//! PostgreSQL identifier handling for request parameters
//!
//! The `columns` parameter is a comma-separated identifier list and `table`
//! is an optionally schema-qualified name. Quoted identifiers keep their
//! case and unescape `""`; unquoted identifiers are ASCII-lowercased.

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Longest identifier PostgreSQL accepts
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Schema used when a table name is not qualified
pub const DEFAULT_SCHEMA: &str = "public";

static UNQUOTED_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{L}_][\p{L}\p{M}_0-9$]*$").unwrap());

fn empty_identifier() -> Error {
    Error::InvalidColumns("invalid zero-length delimited identifier".to_string())
}

/// Parse the `columns` request parameter
pub fn parse_columns(input: &str) -> Result<Vec<String>> {
    if input.is_empty() {
        return Err(empty_identifier());
    }
    split_outside_quotes(input, ',')
        .into_iter()
        .map(parse_identifier)
        .collect()
}

/// Parse the `table` request parameter into `(schema, table)`
pub fn parse_table(input: &str) -> Result<(String, String)> {
    let invalid = || Error::InvalidShape(format!("invalid table name: {input}"));
    if input.is_empty() {
        return Err(Error::InvalidShape("table parameter is required".to_string()));
    }

    let parts = split_outside_quotes(input, '.');
    let (schema, table) = match parts.as_slice() {
        [table] => (DEFAULT_SCHEMA.to_string(), parse_identifier(table)?),
        [schema, table] => (parse_identifier(schema)?, parse_identifier(table)?),
        _ => return Err(invalid()),
    };
    if table.is_empty() {
        return Err(invalid());
    }
    Ok((schema, table))
}

/// Parse a single identifier, quoted or not
pub fn parse_identifier(ident: &str) -> Result<String> {
    if ident.is_empty() {
        return Err(empty_identifier());
    }

    let parsed = if ident.len() >= 2 && ident.starts_with('"') && ident.ends_with('"') {
        let inner = &ident[1..ident.len() - 1];
        if inner.is_empty() {
            return Err(empty_identifier());
        }
        if has_unescaped_quote(inner) {
            return Err(Error::InvalidColumns(format!(
                "invalid identifier with unescaped quote: {inner}"
            )));
        }
        inner.replace("\"\"", "\"")
    } else {
        if !UNQUOTED_IDENTIFIER.is_match(ident) {
            return Err(Error::InvalidColumns(format!(
                "invalid unquoted identifier contains special characters: {ident}"
            )));
        }
        ident.to_ascii_lowercase()
    };

    if parsed.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::InvalidColumns(format!(
            "identifier is too long (max length is {MAX_IDENTIFIER_LENGTH})"
        )));
    }
    Ok(parsed)
}

/// Quote an identifier for use in SQL
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a schema-qualified relation for use in SQL
pub fn quote_relation(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

/// Check requested columns against the available ones and force the
/// primary key in. PK columns come first, then the requested columns in
/// request order without duplicates.
pub fn validate_columns(
    requested: &[String],
    available: &[String],
    primary_key: &[String],
) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(available.to_vec());
    }

    let unknown: BTreeSet<&String> = requested
        .iter()
        .filter(|c| !available.contains(c))
        .collect();
    if !unknown.is_empty() {
        return Err(Error::UnknownColumns(
            unknown.into_iter().cloned().collect(),
        ));
    }

    let mut result: Vec<String> = primary_key
        .iter()
        .filter(|pk| !requested.contains(pk))
        .cloned()
        .collect();
    for col in requested {
        if !result.contains(col) {
            result.push(col.clone());
        }
    }
    Ok(result)
}

fn split_outside_quotes(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, ch) in s.char_indices() {
        if ch == '"' {
            in_quotes = !in_quotes;
        } else if ch == sep && !in_quotes {
            parts.push(&s[start..i]);
            start = i + ch.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn has_unescaped_quote(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            if bytes.get(i + 1) == Some(&b'"') {
                i += 2;
                continue;
            }
            return true;
        }
        i += 1;
    }
    false
}
