//! File storage backend
//!
//! Layout, one directory per shape:
//!
//! ```text
//! <root>/<handle>/meta.json       schema, pg_snapshot, xmin, chunk map
//! <root>/<handle>/snapshot.jsonl  initial segment, one item per line
//! <root>/<handle>/log.jsonl       appended items, one per line
//! ```
//!
//! `meta.json` and `snapshot.jsonl` are replaced atomically (temp file,
//! fsync, rename, fsync of the directory). Appends are written in one call
//! and fsynced before they become visible; a failed append truncates the log
//! back to its previous length. Item bodies are read back from disk; only
//! the offset index lives in memory.
//!
//! Consumers cannot resume a replication position across restarts, so
//! shape directories left by a previous process are purged on open.

use super::{chunk_range, validate_append, StorageBackend};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::log_item::LogItem;
use crate::offset::LogOffset;
use crate::pg_snapshot::PgSnapshot;
use crate::schema::TableSchema;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const SNAPSHOT_FILE: &str = "snapshot.jsonl";
const LOG_FILE: &str = "log.jsonl";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ShapeMeta {
    schema: Option<TableSchema>,
    snapshot_done: bool,
    snapshot_xmin: u64,
    pg_snapshot: Option<PgSnapshot>,
    chunk_ends: BTreeMap<LogOffset, LogOffset>,
}

/// Position of one log line
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: LogOffset,
    pos: u64,
    len: u64,
}

struct FileShape {
    dir: PathBuf,
    meta: ShapeMeta,
    index: Vec<IndexEntry>,
    log_len: u64,
    deleted: bool,
}

impl FileShape {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            meta: ShapeMeta::default(),
            index: Vec::new(),
            log_len: 0,
            deleted: false,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn persist_meta(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(&self.meta)?;
        write_atomic(&self.path(META_FILE), &json)
    }

    fn latest(&self) -> LogOffset {
        self.index
            .last()
            .map(|e| e.offset)
            .unwrap_or(LogOffset::FIRST)
    }

    fn read_snapshot(&self) -> Result<Vec<LogItem>> {
        let bytes = fs::read(self.path(SNAPSHOT_FILE))?;
        parse_lines(&bytes)
    }

    /// Read log entries `range` from disk
    fn read_log(&self, range: std::ops::Range<usize>) -> Result<Vec<LogItem>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let first = self.index[range.start];
        let last = self.index[range.end - 1];
        let span = last.pos + last.len - first.pos;

        let mut file = File::open(self.path(LOG_FILE))?;
        file.seek(SeekFrom::Start(first.pos))?;
        let mut buf = vec![0u8; span as usize];
        file.read_exact(&mut buf)?;
        parse_lines(&buf)
    }
}

fn parse_lines(bytes: &[u8]) -> Result<Vec<LogItem>> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).map_err(Error::from))
        .collect()
}

fn encode_lines(items: &[LogItem]) -> Result<(Vec<u8>, Vec<(LogOffset, u64, u64)>)> {
    let mut buf = Vec::new();
    let mut spans = Vec::with_capacity(items.len());
    for item in items {
        let start = buf.len() as u64;
        serde_json::to_writer(&mut buf, item)?;
        buf.push(b'\n');
        if let Some(offset) = item.offset() {
            spans.push((offset, start, buf.len() as u64 - start));
        }
    }
    Ok((buf, spans))
}

/// Replace `path` atomically with `bytes`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    // fsync temp file before rename
    {
        let f = File::open(&tmp)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Storage(format!("storage task failed: {e}")))?
}

/// File-backed storage backend
pub struct FileStorage {
    root: PathBuf,
    shapes: DashMap<Handle, Arc<RwLock<FileShape>>>,
    /// Handles are never reused, so a deleted one stays deleted
    deleted: DashSet<Handle>,
}

impl FileStorage {
    /// Open the storage root, creating it if needed and purging shape
    /// directories left by a previous run
    pub async fn open(root: PathBuf) -> Result<Self> {
        let dir = root.clone();
        let purged = blocking(move || {
            fs::create_dir_all(&dir)?;
            let mut purged = 0usize;
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(entry.path())?;
                    purged += 1;
                }
            }
            Ok(purged)
        })
        .await?;

        if purged > 0 {
            info!(
                "Purged {} shape directories from previous run in {}",
                purged,
                root.display()
            );
        }
        Ok(Self {
            root,
            shapes: DashMap::new(),
            deleted: DashSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shape(&self, handle: &Handle) -> Result<Arc<RwLock<FileShape>>> {
        self.shapes
            .get(handle)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::ShapeNotFound(handle.to_string()))
    }

    /// Existing or new shape; fails for a deleted handle
    fn entry(&self, handle: &Handle) -> Result<Arc<RwLock<FileShape>>> {
        match self.shapes.entry(handle.clone()) {
            Entry::Occupied(e) => Ok(Arc::clone(e.get())),
            Entry::Vacant(_) if self.deleted.contains(handle) => {
                Err(Error::ShapeNotFound(handle.to_string()))
            }
            Entry::Vacant(e) => {
                let dir = self.root.join(handle.to_string());
                let shape = Arc::new(RwLock::new(FileShape::new(dir)));
                Ok(Arc::clone(e.insert(shape).value()))
            }
        }
    }

    /// Run `f` on a blocking thread under the shape's read lock
    async fn read<T, F>(&self, handle: &Handle, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileShape) -> Result<T> + Send + 'static,
    {
        let shape = self.shape(handle)?;
        let name = handle.to_string();
        blocking(move || {
            let data = shape.read();
            if data.deleted {
                return Err(Error::ShapeNotFound(name));
            }
            f(&data)
        })
        .await
    }

    async fn write<T, F>(&self, shape: Arc<RwLock<FileShape>>, handle: &Handle, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FileShape) -> Result<T> + Send + 'static,
    {
        let name = handle.to_string();
        blocking(move || {
            let mut data = shape.write();
            if data.deleted {
                return Err(Error::ShapeNotFound(name));
            }
            f(&mut data)
        })
        .await
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn shape_exists(&self, handle: &Handle) -> bool {
        self.shapes.contains_key(handle)
    }

    async fn list_shapes(&self) -> Vec<Handle> {
        self.shapes.iter().map(|e| e.key().clone()).collect()
    }

    async fn set_snapshot(
        &self,
        handle: &Handle,
        schema: TableSchema,
        items: Vec<LogItem>,
        snapshot_xmin: u64,
    ) -> Result<()> {
        let shape = self.entry(handle)?;
        let count = items.len();
        self.write(shape, handle, move |data| {
            fs::create_dir_all(&data.dir)?;
            let (bytes, _) = encode_lines(&items)?;
            write_atomic(&data.path(SNAPSHOT_FILE), &bytes)?;
            File::create(data.path(LOG_FILE))?.sync_all()?;

            data.meta.schema = Some(schema);
            data.meta.snapshot_done = true;
            data.meta.snapshot_xmin = snapshot_xmin;
            data.meta.chunk_ends.clear();
            data.persist_meta()?;

            data.index.clear();
            data.log_len = 0;
            Ok(())
        })
        .await?;
        debug!("Stored snapshot of {} items for {}", count, handle);
        Ok(())
    }

    async fn get_snapshot(&self, handle: &Handle) -> Result<(Vec<LogItem>, u64)> {
        let name = handle.to_string();
        self.read(handle, move |data| {
            if !data.meta.snapshot_done {
                return Err(Error::SnapshotNotFound(name));
            }
            Ok((data.read_snapshot()?, data.meta.snapshot_xmin))
        })
        .await
    }

    async fn snapshot_exists(&self, handle: &Handle) -> bool {
        self.read(handle, |data| Ok(data.meta.snapshot_done))
            .await
            .unwrap_or(false)
    }

    async fn append_to_log(&self, handle: &Handle, items: Vec<LogItem>) -> Result<()> {
        let shape = self.shape(handle)?;
        let name = handle.to_string();
        self.write(shape, handle, move |data| {
            if !data.meta.snapshot_done {
                return Err(Error::SnapshotNotFound(name));
            }
            validate_append(data.index.last().map(|e| e.offset), &items)?;
            if items.is_empty() {
                return Ok(());
            }

            let (bytes, spans) = encode_lines(&items)?;
            let path = data.path(LOG_FILE);
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            let written = file.write_all(&bytes).and_then(|_| file.sync_data());
            if let Err(e) = written {
                warn!("Append to {} failed, truncating: {}", path.display(), e);
                if let Err(e) = file.set_len(data.log_len) {
                    warn!("Failed to truncate {}: {}", path.display(), e);
                }
                return Err(e.into());
            }

            let base = data.log_len;
            data.index
                .extend(spans.into_iter().map(|(offset, pos, len)| IndexEntry {
                    offset,
                    pos: base + pos,
                    len,
                }));
            data.log_len += bytes.len() as u64;
            Ok(())
        })
        .await
    }

    async fn get_log_since(&self, handle: &Handle, offset: LogOffset) -> Result<Vec<LogItem>> {
        self.read(handle, move |data| {
            if offset.is_before_all() {
                let mut items = if data.meta.snapshot_done {
                    data.read_snapshot()?
                } else {
                    Vec::new()
                };
                items.extend(data.read_log(0..data.index.len())?);
                return Ok(items);
            }
            let range = chunk_range(|i| data.index[i].offset, data.index.len(), offset, None);
            data.read_log(range)
        })
        .await
    }

    async fn get_log_chunk(
        &self,
        handle: &Handle,
        chunk_start: LogOffset,
    ) -> Result<(Vec<LogItem>, Option<LogOffset>)> {
        self.read(handle, move |data| {
            if chunk_start.is_before_all() {
                let items = if data.meta.snapshot_done {
                    data.read_snapshot()?
                } else {
                    Vec::new()
                };
                let next = (!data.index.is_empty()).then_some(LogOffset::FIRST);
                return Ok((items, next));
            }
            let end = data.meta.chunk_ends.get(&chunk_start).copied();
            let range = chunk_range(|i| data.index[i].offset, data.index.len(), chunk_start, end);
            let items = data.read_log(range)?;
            let next = end.filter(|_| !items.is_empty());
            Ok((items, next))
        })
        .await
    }

    async fn get_chunk_end(&self, handle: &Handle, chunk_start: LogOffset) -> Result<Option<LogOffset>> {
        self.read(handle, move |data| {
            Ok(data.meta.chunk_ends.get(&chunk_start).copied())
        })
        .await
    }

    async fn set_chunk_end(
        &self,
        handle: &Handle,
        chunk_start: LogOffset,
        chunk_end: LogOffset,
    ) -> Result<()> {
        let shape = self.shape(handle)?;
        self.write(shape, handle, move |data| {
            data.meta.chunk_ends.insert(chunk_start, chunk_end);
            data.persist_meta()
        })
        .await
    }

    async fn get_latest_offset(&self, handle: &Handle) -> Result<LogOffset> {
        self.read(handle, |data| Ok(data.latest())).await
    }

    async fn get_schema(&self, handle: &Handle) -> Result<TableSchema> {
        let name = handle.to_string();
        self.read(handle, move |data| {
            data.meta
                .schema
                .clone()
                .ok_or(Error::SnapshotNotFound(name))
        })
        .await
    }

    async fn get_pg_snapshot(&self, handle: &Handle) -> Result<Option<PgSnapshot>> {
        self.read(handle, |data| Ok(data.meta.pg_snapshot.clone()))
            .await
    }

    async fn set_pg_snapshot(&self, handle: &Handle, snapshot: PgSnapshot) -> Result<()> {
        let shape = self.entry(handle)?;
        self.write(shape, handle, move |data| {
            data.meta.pg_snapshot = Some(snapshot);
            data.persist_meta()
        })
        .await
    }

    async fn delete_shape(&self, handle: &Handle) -> Result<()> {
        self.deleted.insert(handle.clone());
        let (_, shape) = self
            .shapes
            .remove(handle)
            .ok_or_else(|| Error::ShapeNotFound(handle.to_string()))?;
        blocking(move || {
            let mut data = shape.write();
            data.deleted = true;
            data.index.clear();
            match fs::remove_dir_all(&data.dir) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}
