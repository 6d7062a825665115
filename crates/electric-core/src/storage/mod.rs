//! Shape log storage
//!
//! Each shape owns a typed schema, its snapshot items (the initial segment),
//! an append-only log, a chunk-boundary map and the visibility snapshot used
//! to splice the replication stream onto the initial snapshot.
//!
//! Backends:
//!
//! - **Memory**: everything in process memory
//! - **File**: one directory per shape with JSON-lines item files

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::log_item::LogItem;
use crate::offset::LogOffset;
use crate::pg_snapshot::PgSnapshot;
use crate::schema::TableSchema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Storage backend for shape logs.
///
/// Mutations of one shape are serialised by the backend; reads never
/// observe a partially applied append.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Whether any state is recorded for the shape
    async fn shape_exists(&self, handle: &Handle) -> bool;

    /// Handles of all stored shapes
    async fn list_shapes(&self) -> Vec<Handle>;

    /// Establish the shape's initial segment; resets log and chunk bounds
    async fn set_snapshot(
        &self,
        handle: &Handle,
        schema: TableSchema,
        items: Vec<LogItem>,
        snapshot_xmin: u64,
    ) -> Result<()>;

    /// Snapshot items and the snapshot xmin
    async fn get_snapshot(&self, handle: &Handle) -> Result<(Vec<LogItem>, u64)>;

    async fn snapshot_exists(&self, handle: &Handle) -> bool;

    /// Append items in order. Offsets must strictly increase and exceed the
    /// current latest offset; the whole batch is rejected otherwise.
    async fn append_to_log(&self, handle: &Handle, items: Vec<LogItem>) -> Result<()>;

    /// Snapshot plus log for `BeforeAll`, else log items after `offset`
    async fn get_log_since(&self, handle: &Handle, offset: LogOffset) -> Result<Vec<LogItem>>;

    /// Items in `(chunk_start, chunk_end]` and the next chunk start if the
    /// chunk is closed
    async fn get_log_chunk(
        &self,
        handle: &Handle,
        chunk_start: LogOffset,
    ) -> Result<(Vec<LogItem>, Option<LogOffset>)>;

    async fn get_chunk_end(&self, handle: &Handle, chunk_start: LogOffset) -> Result<Option<LogOffset>>;

    async fn set_chunk_end(
        &self,
        handle: &Handle,
        chunk_start: LogOffset,
        chunk_end: LogOffset,
    ) -> Result<()>;

    /// Last appended log offset, `0_0` for an empty log
    async fn get_latest_offset(&self, handle: &Handle) -> Result<LogOffset>;

    async fn get_schema(&self, handle: &Handle) -> Result<TableSchema>;

    async fn get_pg_snapshot(&self, handle: &Handle) -> Result<Option<PgSnapshot>>;

    /// Record the visibility snapshot; creates the shape entry if needed
    async fn set_pg_snapshot(&self, handle: &Handle, snapshot: PgSnapshot) -> Result<()>;

    /// Remove all state of the shape
    async fn delete_shape(&self, handle: &Handle) -> Result<()>;
}

/// Type alias for a shared storage backend
pub type Storage = Arc<dyn StorageBackend>;

/// Backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    File { dir: PathBuf },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File {
            dir: PathBuf::from("./electric_data"),
        }
    }
}

/// Create a storage backend from configuration
pub async fn create_storage(config: &StorageConfig) -> Result<Storage> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageConfig::File { dir } => Ok(Arc::new(FileStorage::open(dir.clone()).await?)),
    }
}

/// Check that `items` may follow `latest` in a shape log
pub(crate) fn validate_append(latest: Option<LogOffset>, items: &[LogItem]) -> Result<()> {
    let mut prev = latest;
    for item in items {
        let offset = item
            .offset()
            .ok_or_else(|| Error::Storage("control messages cannot be stored".to_string()))?;
        if let Some(p) = prev {
            if offset <= p {
                return Err(Error::OffsetOrder {
                    offset: offset.to_string(),
                    latest: p.to_string(),
                });
            }
        }
        prev = Some(offset);
    }
    Ok(())
}

/// Index range of the log entries belonging to a chunk.
///
/// `offsets` must be sorted. Returns the half-open index range of entries in
/// `(start, end]`, or everything after `start` when `end` is `None`.
pub(crate) fn chunk_range(
    offsets: impl Fn(usize) -> LogOffset,
    len: usize,
    start: LogOffset,
    end: Option<LogOffset>,
) -> std::ops::Range<usize> {
    let lo = partition_point(&offsets, len, |o| o <= start);
    let hi = match end {
        Some(end) => partition_point(&offsets, len, |o| o <= end),
        None => len,
    };
    lo..hi.max(lo)
}

fn partition_point(
    offsets: &impl Fn(usize) -> LogOffset,
    len: usize,
    pred: impl Fn(LogOffset) -> bool,
) -> usize {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(offsets(mid)) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}
