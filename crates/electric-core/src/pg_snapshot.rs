//! Transaction visibility snapshots
//!
//! The initial snapshot of a shape runs inside a REPEATABLE READ transaction
//! whose `pg_current_snapshot()` is captured next to the rows. Replication
//! transactions that were already visible to that snapshot must not be
//! applied a second time; [`PgSnapshot`] decides which ones.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `xmin:xmax:xip_list` plus the filtering switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgSnapshot {
    pub xmin: u64,
    pub xmax: u64,
    pub xip_list: Vec<u64>,
    /// Cleared once a transaction after the snapshot has been seen; from
    /// then on nothing is filtered
    pub filter_txns: bool,
}

impl PgSnapshot {
    pub fn new(xmin: u64, xmax: u64, xip_list: Vec<u64>) -> Self {
        Self {
            xmin,
            xmax,
            xip_list,
            filter_txns: true,
        }
    }

    /// Parse `xmin:xmax[:xip1,xip2,...]`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = |why: &str| Error::Snapshot(format!("invalid pg_snapshot {s:?}: {why}"));
        if s.is_empty() {
            return Err(invalid("empty"));
        }

        let parts: Vec<&str> = s.split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(invalid("expected xmin:xmax[:xip_list]"));
        }
        let xmin: u64 = parts[0].parse().map_err(|_| invalid("bad xmin"))?;
        let xmax: u64 = parts[1].parse().map_err(|_| invalid("bad xmax"))?;
        if xmin > xmax {
            return Err(invalid("xmin > xmax"));
        }

        let mut xip_list = Vec::new();
        if let Some(list) = parts.get(2) {
            for xip in list.split(',').map(str::trim).filter(|x| !x.is_empty()) {
                xip_list.push(xip.parse().map_err(|_| invalid("bad xip"))?);
            }
        }
        Ok(Self::new(xmin, xmax, xip_list))
    }

    /// Whether `xid`'s effects are already part of the snapshot
    pub fn contains(&self, xid: u64) -> bool {
        xid < self.xmax && !self.xip_list.contains(&xid)
    }

    /// Whether `xid` definitely committed after the snapshot
    pub fn after_snapshot(&self, xid: u64) -> bool {
        xid >= self.xmax || self.xip_list.contains(&xid)
    }

    /// Whether a replication transaction must be dropped as a duplicate
    pub fn should_skip(&self, xid: u64) -> bool {
        self.filter_txns && self.contains(xid)
    }

    /// Observe a committed transaction; returns `true` when this turned
    /// filtering off
    pub fn observe_commit(&mut self, xid: u64) -> bool {
        if self.filter_txns && self.after_snapshot(xid) {
            self.filter_txns = false;
            return true;
        }
        false
    }
}

impl fmt::Display for PgSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.xmin, self.xmax)?;
        for (i, xip) in self.xip_list.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{xip}")?;
        }
        Ok(())
    }
}

impl FromStr for PgSnapshot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PgSnapshot::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let snap = PgSnapshot::parse("100:105:102,103").unwrap();
        assert_eq!((snap.xmin, snap.xmax), (100, 105));
        assert_eq!(snap.xip_list, vec![102, 103]);
        assert!(snap.filter_txns);
        assert_eq!(snap.to_string(), "100:105:102,103");

        assert!(PgSnapshot::parse("100:105:").unwrap().xip_list.is_empty());
        assert_eq!(PgSnapshot::parse("100:105").unwrap().to_string(), "100:105:");

        for bad in ["", "1", "a:2", "1:b", "5:4", "1:2:x", "1:2:3:4"] {
            assert!(PgSnapshot::parse(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_visibility() {
        let snap = PgSnapshot::parse("100:105:102,103").unwrap();
        assert!(snap.contains(99));
        assert!(snap.contains(101));
        assert!(!snap.contains(102));
        assert!(!snap.contains(105));

        assert!(snap.after_snapshot(103));
        assert!(snap.after_snapshot(200));
        assert!(!snap.after_snapshot(104));
    }

    #[test]
    fn test_filtering_turns_off_permanently() {
        let mut snap = PgSnapshot::parse("100:105:102").unwrap();
        assert!(snap.should_skip(101));
        assert!(!snap.observe_commit(101));
        assert!(snap.filter_txns);

        assert!(snap.observe_commit(102));
        assert!(!snap.filter_txns);
        assert!(!snap.should_skip(101));
        assert!(!snap.observe_commit(300));
    }
}
