//! Log offsets
//!
//! A [`LogOffset`] is a position in a shape log. Offsets are totally ordered:
//! [`LogOffset::BeforeAll`] sorts before every real position, and real
//! positions compare lexicographically on `(tx, op)`.
//!
//! The wire form is `"{tx}_{op}"`, with `BeforeAll` written as `"-1"`.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Position in a shape log.
///
/// Variant order matters: the derived `Ord` places `BeforeAll` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogOffset {
    /// Sorts before every other offset; requests the full snapshot
    #[default]
    BeforeAll,
    /// A real position: transaction offset and operation offset within it
    At { tx: u64, op: u64 },
}

impl LogOffset {
    /// First offset of a shape log, `0_0`
    pub const FIRST: LogOffset = LogOffset::At { tx: 0, op: 0 };

    pub fn new(tx: u64, op: u64) -> Self {
        LogOffset::At { tx, op }
    }

    /// Parse the wire form
    pub fn parse(s: &str) -> Result<Self> {
        if s == "-1" {
            return Ok(LogOffset::BeforeAll);
        }

        let invalid = || Error::InvalidOffset(format!("{s:?} must be -1 or tx_op"));
        let (tx, op) = s.split_once('_').ok_or_else(invalid)?;
        if !is_digits(tx) || !is_digits(op) {
            return Err(invalid());
        }

        let tx = tx.parse::<u64>().map_err(|_| invalid())?;
        let op = op.parse::<u64>().map_err(|_| invalid())?;
        Ok(LogOffset::At { tx, op })
    }

    pub fn is_before_all(&self) -> bool {
        matches!(self, LogOffset::BeforeAll)
    }

    /// Strictly greater than `other`
    pub fn after(&self, other: &LogOffset) -> bool {
        self > other
    }

    /// Next position within the same transaction.
    ///
    /// `BeforeAll` increments to `0_0`.
    pub fn increment(&self) -> LogOffset {
        match *self {
            LogOffset::BeforeAll => LogOffset::FIRST,
            LogOffset::At { tx, op } => LogOffset::At {
                tx,
                op: op.saturating_add(1),
            },
        }
    }

    /// Transaction component, `None` for `BeforeAll`
    pub fn tx(&self) -> Option<u64> {
        match self {
            LogOffset::BeforeAll => None,
            LogOffset::At { tx, .. } => Some(*tx),
        }
    }

    /// Operation component, `None` for `BeforeAll`
    pub fn op(&self) -> Option<u64> {
        match self {
            LogOffset::BeforeAll => None,
            LogOffset::At { op, .. } => Some(*op),
        }
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogOffset::BeforeAll => f.write_str("-1"),
            LogOffset::At { tx, op } => write!(f, "{tx}_{op}"),
        }
    }
}

impl FromStr for LogOffset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LogOffset::parse(s)
    }
}

impl Serialize for LogOffset {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LogOffset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        LogOffset::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!(LogOffset::parse("-1").unwrap(), LogOffset::BeforeAll);
        assert_eq!(LogOffset::parse("12_3").unwrap(), LogOffset::new(12, 3));
        assert_eq!(LogOffset::new(12, 3).to_string(), "12_3");
        assert_eq!(LogOffset::BeforeAll.to_string(), "-1");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "1", "_1", "1_", "a_b", "-2", "1_-1", "1__2", " 1_2", "1_2_3"] {
            assert!(
                matches!(LogOffset::parse(bad), Err(Error::InvalidOffset(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_ordering() {
        let before = LogOffset::BeforeAll;
        let a = LogOffset::new(0, 0);
        let b = LogOffset::new(0, 5);
        let c = LogOffset::new(1, 0);

        assert!(before < a);
        assert!(a < b);
        assert!(b < c);
        assert!(c.after(&b));
        assert!(!a.after(&a));
    }

    #[test]
    fn test_increment() {
        assert_eq!(LogOffset::BeforeAll.increment(), LogOffset::new(0, 0));
        assert_eq!(LogOffset::new(7, 1).increment(), LogOffset::new(7, 2));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&LogOffset::new(4, 2)).unwrap();
        assert_eq!(json, "\"4_2\"");
        let back: LogOffset = serde_json::from_str("\"-1\"").unwrap();
        assert!(back.is_before_all());
    }
}
