//! Shape handles
//!
//! A handle names one materialisation of a shape: `{hash}-{micros}`, where
//! `hash` is the 16-hex-character shape hash and `micros` the creation time
//! in Unix microseconds.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Length of a shape hash in hex characters
pub const HASH_LENGTH: usize = 16;

/// Handle parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("invalid handle format")]
    InvalidHandleFormat,

    #[error("hash must be exactly 16 hex characters")]
    InvalidHashLength,

    #[error("hash must contain only hex characters")]
    InvalidHashChars,

    #[error("timestamp must be a positive integer")]
    InvalidTimestamp,
}

/// Identifier of one shape materialisation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    hash: String,
    timestamp: i64,
}

impl Handle {
    pub fn with_timestamp(hash: impl Into<String>, timestamp: i64) -> Self {
        Self {
            hash: hash.into(),
            timestamp,
        }
    }

    /// Parse `{hash}-{timestamp}`.
    ///
    /// Hex digits are accepted in either case; the hash is kept as given so
    /// that the handle renders back to the same string.
    pub fn parse(s: &str) -> Result<Self, HandleError> {
        let (hash, timestamp) = s.rsplit_once('-').ok_or(HandleError::InvalidHandleFormat)?;

        if hash.len() != HASH_LENGTH {
            return Err(HandleError::InvalidHashLength);
        }
        if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HandleError::InvalidHashChars);
        }

        let timestamp: i64 = timestamp
            .parse()
            .map_err(|_| HandleError::InvalidTimestamp)?;
        if timestamp <= 0 {
            return Err(HandleError::InvalidTimestamp);
        }

        Ok(Self {
            hash: hash.to_string(),
            timestamp,
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Whether both handles refer to the same shape definition
    pub fn same_shape(&self, other: &Handle) -> bool {
        self.hash.eq_ignore_ascii_case(&other.hash)
    }
}

/// First [`HASH_LENGTH`] hex characters of SHA-256 over `definition`
pub fn short_hash(definition: &[u8]) -> String {
    let digest = Sha256::digest(definition);
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LENGTH);
    hex
}

/// Source of handle timestamps.
///
/// Timestamps are the current time in microseconds, bumped past the last one
/// issued so that two handles created within the same microsecond differ.
#[derive(Debug, Default)]
pub struct HandleClock {
    last: AtomicI64,
}

impl HandleClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// New handle for `hash` stamped with the next timestamp
    pub fn next_handle(&self, hash: impl Into<String>) -> Handle {
        Handle::with_timestamp(hash, self.next_timestamp())
    }

    fn next_timestamp(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(1)
            .max(1);

        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = if now > last { now } else { last + 1 };
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash, self.timestamp)
    }
}

impl FromStr for Handle {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Handle::parse(s)
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Handle::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let h = HandleClock::new().next_handle("0123456789abcdef");
        assert_eq!(Handle::parse(&h.to_string()).unwrap(), h);

        let upper = Handle::parse("0123456789ABCDEF-42").unwrap();
        assert_eq!(upper.to_string(), "0123456789ABCDEF-42");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Handle::parse(""), Err(HandleError::InvalidHandleFormat));
        assert_eq!(
            Handle::parse("0123456789abcdef"),
            Err(HandleError::InvalidHandleFormat)
        );
        assert_eq!(Handle::parse("abc-1"), Err(HandleError::InvalidHashLength));
        assert_eq!(
            Handle::parse("0123456789abcdeg-1"),
            Err(HandleError::InvalidHashChars)
        );
        assert_eq!(
            Handle::parse("0123456789abcdef-0"),
            Err(HandleError::InvalidTimestamp)
        );
        assert_eq!(
            Handle::parse("0123456789abcdef-x"),
            Err(HandleError::InvalidTimestamp)
        );
    }

    #[test]
    fn test_same_shape() {
        let a = Handle::with_timestamp("0123456789abcdef", 1);
        let b = Handle::with_timestamp("0123456789ABCDEF", 2);
        let c = Handle::with_timestamp("fedcba9876543210", 1);
        assert!(a.same_shape(&b));
        assert!(!a.same_shape(&c));
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_handles_are_distinct() {
        let clock = HandleClock::new();
        let a = clock.next_handle("0123456789abcdef");
        let b = clock.next_handle("0123456789abcdef");
        assert!(b.timestamp() > a.timestamp());
        assert!(a.timestamp() > 0);
    }

    #[test]
    fn test_short_hash() {
        let h = short_hash(b"public\0users");
        assert_eq!(h.len(), HASH_LENGTH);
        assert_eq!(h, short_hash(b"public\0users"));
        assert_ne!(h, short_hash(b"public\0orders"));
    }
}
