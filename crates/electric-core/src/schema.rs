//! Typed table schemas and the `electric-schema` header

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A column of a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// PostgreSQL type name, e.g. `int4`, `varchar`, `timestamptz`
    #[serde(rename = "type")]
    pub type_name: String,
    /// 0-based position within the primary key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_index: Option<u32>,
    #[serde(default)]
    pub not_null: bool,
    /// Array dimensions, 0 for scalars
    #[serde(default)]
    pub dims: u32,
    #[serde(default)]
    pub max_length: u32,
    #[serde(default)]
    pub length: u32,
    #[serde(default)]
    pub precision: u32,
    #[serde(default)]
    pub scale: u32,
    /// Interval field restriction, e.g. `DAY TO SECOND`
    #[serde(default)]
    pub fields: String,
    /// Raw modifier for types without a dedicated decoding
    #[serde(default)]
    pub type_mod: i32,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn with_pk_index(mut self, index: u32) -> Self {
        self.pk_index = Some(index);
        self.not_null = true;
        self
    }

    pub fn with_not_null(mut self, not_null: bool) -> Self {
        self.not_null = not_null;
        self
    }

    pub fn with_dims(mut self, dims: u32) -> Self {
        self.dims = dims;
        self
    }

    /// Decode a raw `atttypmod` into the typed fields for this column's type
    pub fn with_type_mod(mut self, typmod: i32) -> Self {
        if typmod < 0 {
            return self;
        }
        match self.type_name.as_str() {
            "varchar" => self.max_length = (typmod - 4).max(0) as u32,
            "bpchar" => self.length = (typmod - 4).max(0) as u32,
            "bit" | "varbit" => self.length = typmod as u32,
            "numeric" => {
                let m = typmod - 4;
                self.precision = ((m >> 16) & 0xffff) as u32;
                self.scale = (m & 0xffff) as u32;
            }
            "time" | "timetz" | "timestamp" | "timestamptz" => self.precision = typmod as u32,
            "interval" => {
                let precision = typmod & 0xffff;
                if precision != 0xffff {
                    self.precision = precision as u32;
                }
                if let Some(fields) = interval_fields((typmod >> 16) & 0x7fff) {
                    self.fields = fields.to_string();
                }
            }
            _ => self.type_mod = typmod,
        }
        self
    }

    pub fn is_primary_key(&self) -> bool {
        self.pk_index.is_some()
    }
}

fn interval_fields(range: i32) -> Option<&'static str> {
    const MONTH: i32 = 1 << 1;
    const YEAR: i32 = 1 << 2;
    const DAY: i32 = 1 << 3;
    const HOUR: i32 = 1 << 10;
    const MINUTE: i32 = 1 << 11;
    const SECOND: i32 = 1 << 12;

    let fields = match range {
        r if r == YEAR => "YEAR",
        r if r == MONTH => "MONTH",
        r if r == DAY => "DAY",
        r if r == HOUR => "HOUR",
        r if r == MINUTE => "MINUTE",
        r if r == SECOND => "SECOND",
        r if r == YEAR | MONTH => "YEAR TO MONTH",
        r if r == DAY | HOUR => "DAY TO HOUR",
        r if r == DAY | HOUR | MINUTE => "DAY TO MINUTE",
        r if r == DAY | HOUR | MINUTE | SECOND => "DAY TO SECOND",
        r if r == HOUR | MINUTE => "HOUR TO MINUTE",
        r if r == HOUR | MINUTE | SECOND => "HOUR TO SECOND",
        r if r == MINUTE | SECOND => "MINUTE TO SECOND",
        _ => return None,
    };
    Some(fields)
}

/// Schema of one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, columns: Vec<Column>) -> Self {
        let schema = schema.into();
        Self {
            schema: if schema.is_empty() {
                "public".to_string()
            } else {
                schema
            },
            name: name.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Primary key columns in key order
    pub fn primary_key_columns(&self) -> Vec<&Column> {
        let mut pk: Vec<&Column> = self.columns.iter().filter(|c| c.is_primary_key()).collect();
        pk.sort_by_key(|c| c.pk_index);
        pk
    }

    pub fn primary_key_names(&self) -> Vec<String> {
        self.primary_key_columns()
            .into_iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// JSON value of the `electric-schema` header
    pub fn header(&self) -> String {
        let entries: BTreeMap<&str, HeaderEntry<'_>> = self
            .columns
            .iter()
            .map(|c| (c.name.as_str(), HeaderEntry::from(c)))
            .collect();
        serde_json::to_string(&entries).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Serialize)]
struct HeaderEntry<'a> {
    #[serde(rename = "type")]
    type_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pk_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    not_null: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dims: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scale: Option<u32>,
    #[serde(skip_serializing_if = "is_blank")]
    fields: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    type_mod: Option<i32>,
}

fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

impl<'a> From<&'a Column> for HeaderEntry<'a> {
    fn from(c: &'a Column) -> Self {
        let positive = |v: u32| (v > 0).then_some(v);
        Self {
            type_name: &c.type_name,
            pk_index: c.pk_index,
            not_null: c.not_null.then_some(true),
            dims: positive(c.dims),
            max_length: positive(c.max_length),
            length: positive(c.length),
            precision: positive(c.precision),
            scale: (c.type_name == "numeric" && c.precision > 0).then_some(c.scale),
            fields: &c.fields,
            type_mod: (c.type_mod > 0).then_some(c.type_mod),
        }
    }
}
