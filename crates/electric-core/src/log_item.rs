//! Log items and their wire encoding
//!
//! A shape log holds change items (insert, update, delete) and the HTTP
//! layer may interleave control messages (`up-to-date`, `must-refetch`).
//! Both serialize to the JSON objects clients consume; a response body is a
//! JSON array of them.

use crate::error::Result;
use crate::offset::LogOffset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Column name to text value; NULL columns are absent
pub type ValueMap = BTreeMap<String, String>;

/// Kind of a change item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Headers of a change item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeHeaders {
    pub operation: Operation,
    /// `[schema, table]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<[String; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txids: Option<Vec<u64>>,
    /// Transaction part of the offset, as a string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_position: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub last: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_change_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_change_to: Option<String>,
}

impl ChangeHeaders {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            relation: None,
            txids: None,
            lsn: None,
            op_position: None,
            last: false,
            key_change_from: None,
            key_change_to: None,
        }
    }
}

/// A data operation in a shape log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeItem {
    pub offset: LogOffset,
    pub key: String,
    pub value: ValueMap,
    pub headers: ChangeHeaders,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<ValueMap>,
}

impl ChangeItem {
    pub fn new(operation: Operation, offset: LogOffset, key: String, value: ValueMap) -> Self {
        Self {
            offset,
            key,
            value,
            headers: ChangeHeaders::new(operation),
            old_value: None,
        }
    }

    pub fn insert(offset: LogOffset, key: String, value: ValueMap) -> Self {
        Self::new(Operation::Insert, offset, key, value)
    }

    /// Update item; `old_value` is kept only when it is non-empty
    pub fn update(
        offset: LogOffset,
        key: String,
        value: ValueMap,
        old_value: Option<ValueMap>,
    ) -> Self {
        let mut item = Self::new(Operation::Update, offset, key, value);
        item.old_value = old_value.filter(|old| !old.is_empty());
        item
    }

    pub fn delete(offset: LogOffset, key: String, value: ValueMap) -> Self {
        Self::new(Operation::Delete, offset, key, value)
    }

    /// Primary key change: a delete of the old key at `offset` followed by
    /// an insert of the new key at `offset.increment()`
    pub fn pk_change(
        offset: LogOffset,
        old_key: String,
        new_key: String,
        old_value: ValueMap,
        new_value: ValueMap,
    ) -> [ChangeItem; 2] {
        let mut delete = Self::delete(offset, old_key.clone(), old_value);
        delete.headers.key_change_to = Some(new_key.clone());

        let mut insert = Self::insert(offset.increment(), new_key, new_value);
        insert.headers.key_change_from = Some(old_key);

        [delete, insert]
    }

    pub fn operation(&self) -> Operation {
        self.headers.operation
    }

    pub fn with_relation(mut self, schema: &str, table: &str) -> Self {
        self.headers.relation = Some([schema.to_string(), table.to_string()]);
        self
    }

    /// Stamp transaction headers: `txids`, `lsn` and `op_position` derived
    /// from the item's offset
    pub fn with_txid(mut self, xid: u64) -> Self {
        self.headers.txids = Some(vec![xid]);
        self.headers.lsn = Some(self.offset.tx().unwrap_or_default().to_string());
        self.headers.op_position = Some(self.offset.op().unwrap_or_default());
        self
    }

    pub fn with_last(mut self, last: bool) -> Self {
        self.headers.last = last;
        self
    }
}

/// Control message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Control {
    UpToDate,
    MustRefetch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlHeaders {
    pub control: Control,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_last_seen_lsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape_handle: Option<String>,
}

/// A control message; carries headers only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlItem {
    pub headers: ControlHeaders,
}

/// Entry of a shape log or response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogItem {
    Change(ChangeItem),
    Control(ControlItem),
}

impl LogItem {
    pub fn up_to_date() -> Self {
        Self::control(Control::UpToDate, None, None)
    }

    pub fn up_to_date_at(global_last_seen_lsn: u64) -> Self {
        Self::control(
            Control::UpToDate,
            Some(global_last_seen_lsn.to_string()),
            None,
        )
    }

    pub fn must_refetch() -> Self {
        Self::control(Control::MustRefetch, None, None)
    }

    pub fn must_refetch_with_handle(handle: impl Into<String>) -> Self {
        Self::control(Control::MustRefetch, None, Some(handle.into()))
    }

    fn control(control: Control, lsn: Option<String>, handle: Option<String>) -> Self {
        LogItem::Control(ControlItem {
            headers: ControlHeaders {
                control,
                global_last_seen_lsn: lsn,
                shape_handle: handle,
            },
        })
    }

    /// Offset of a change item; control messages have none
    pub fn offset(&self) -> Option<LogOffset> {
        match self {
            LogItem::Change(c) => Some(c.offset),
            LogItem::Control(_) => None,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, LogItem::Control(_))
    }

    pub fn as_change(&self) -> Option<&ChangeItem> {
        match self {
            LogItem::Change(c) => Some(c),
            LogItem::Control(_) => None,
        }
    }

    /// Encode as a single JSON object
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Size of the JSON encoding in bytes
    pub fn encoded_len(&self) -> usize {
        self.to_json().map(|b| b.len()).unwrap_or_default()
    }
}

impl From<ChangeItem> for LogItem {
    fn from(item: ChangeItem) -> Self {
        LogItem::Change(item)
    }
}

/// Encode items as a JSON array
pub fn encode_items(items: &[LogItem]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(items)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value(pairs: &[(&str, &str)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_insert_wire_format() {
        let item: LogItem = ChangeItem::insert(
            LogOffset::new(1234, 0),
            r#""public"."users"/"42""#.into(),
            value(&[("id", "42"), ("name", "Alice")]),
        )
        .with_relation("public", "users")
        .with_txid(900)
        .with_last(true)
        .into();

        let json: serde_json::Value = serde_json::from_slice(&item.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({
                "offset": "1234_0",
                "key": "\"public\".\"users\"/\"42\"",
                "value": {"id": "42", "name": "Alice"},
                "headers": {
                    "operation": "insert",
                    "relation": ["public", "users"],
                    "txids": [900],
                    "lsn": "1234",
                    "op_position": 0,
                    "last": true
                }
            })
        );
    }

    #[test]
    fn test_update_old_value_only_when_present() {
        let off = LogOffset::new(5, 2);
        let with_old = ChangeItem::update(off, "k".into(), value(&[("id", "1")]), Some(value(&[("name", "a")])));
        assert!(with_old.old_value.is_some());

        let empty_old = ChangeItem::update(off, "k".into(), value(&[("id", "1")]), Some(ValueMap::new()));
        let json = serde_json::to_value(&empty_old).unwrap();
        assert!(json.get("old_value").is_none());
        assert!(json["headers"].get("last").is_none());
    }

    #[test]
    fn test_pk_change() {
        let [delete, insert] = ChangeItem::pk_change(
            LogOffset::new(10, 4),
            "old".into(),
            "new".into(),
            value(&[("id", "1")]),
            value(&[("id", "100")]),
        );
        assert_eq!(delete.operation(), Operation::Delete);
        assert_eq!(delete.offset, LogOffset::new(10, 4));
        assert_eq!(delete.headers.key_change_to.as_deref(), Some("new"));
        assert_eq!(insert.operation(), Operation::Insert);
        assert_eq!(insert.offset, LogOffset::new(10, 5));
        assert_eq!(insert.headers.key_change_from.as_deref(), Some("old"));

        let insert = insert.with_txid(77);
        assert_eq!(insert.headers.op_position, Some(5));
        assert_eq!(insert.headers.lsn.as_deref(), Some("10"));
    }

    #[test]
    fn test_control_messages() {
        let json = serde_json::to_value(LogItem::up_to_date()).unwrap();
        assert_eq!(json, json!({"headers": {"control": "up-to-date"}}));

        let json = serde_json::to_value(LogItem::up_to_date_at(42)).unwrap();
        assert_eq!(json["headers"]["global_last_seen_lsn"], "42");

        let json = serde_json::to_value(LogItem::must_refetch_with_handle("h-1")).unwrap();
        assert_eq!(
            json,
            json!({"headers": {"control": "must-refetch", "shape_handle": "h-1"}})
        );
        assert!(LogItem::must_refetch().offset().is_none());
    }

    #[test]
    fn test_encode_items() {
        assert_eq!(encode_items(&[]).unwrap(), b"[]");

        let items = vec![
            ChangeItem::delete(LogOffset::new(1, 0), "k".into(), value(&[("id", "1")])).into(),
            LogItem::up_to_date(),
        ];
        let decoded: Vec<LogItem> = serde_json::from_slice(&encode_items(&items).unwrap()).unwrap();
        assert_eq!(decoded, items);
    }
}
