//! Chunk boundaries for shape logs
//!
//! A chunk is addressed by the offset just before its first item and
//! covers `(start, end]`. The first log chunk starts at `0_0`; every later
//! chunk starts at the previous chunk's end. A chunk is closed by the item
//! that makes its encoded size reach the threshold.

use crate::offset::LogOffset;

/// Default chunk size threshold in bytes (10 MiB)
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 10 * 1024 * 1024;

/// A closed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBoundary {
    pub start: LogOffset,
    pub end: LogOffset,
}

/// Running byte counter for one shape log
#[derive(Debug, Clone)]
pub struct Chunker {
    threshold: u64,
    start: LogOffset,
    size: u64,
}

impl Chunker {
    /// `threshold` of 0 selects [`DEFAULT_CHUNK_THRESHOLD`]
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: if threshold == 0 {
                DEFAULT_CHUNK_THRESHOLD
            } else {
                threshold
            },
            start: LogOffset::FIRST,
            size: 0,
        }
    }

    /// Account for an appended item; returns the chunk it closed, if any
    pub fn add(&mut self, offset: LogOffset, size: u64) -> Option<ChunkBoundary> {
        self.size += size;
        if self.size < self.threshold {
            return None;
        }
        let closed = ChunkBoundary {
            start: self.start,
            end: offset,
        };
        self.start = offset;
        self.size = 0;
        Some(closed)
    }

    /// Start of the chunk currently being filled
    pub fn current_start(&self) -> LogOffset {
        self.start
    }

    pub fn current_size(&self) -> u64 {
        self.size
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn reset(&mut self) {
        self.start = LogOffset::FIRST;
        self.size = 0;
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_THRESHOLD)
    }
}
