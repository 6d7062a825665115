//! In-memory storage backend

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
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
struct ShapeData {
    schema: Option<TableSchema>,
    /// `None` until the snapshot is stored
    snapshot: Option<Vec<LogItem>>,
    snapshot_xmin: u64,
    log: Vec<LogItem>,
    chunk_ends: BTreeMap<LogOffset, LogOffset>,
    pg_snapshot: Option<PgSnapshot>,
    deleted: bool,
}

impl ShapeData {
    fn latest(&self) -> LogOffset {
        self.log
            .last()
            .and_then(LogItem::offset)
            .unwrap_or(LogOffset::FIRST)
    }

    fn offset_at(&self, i: usize) -> LogOffset {
        self.log[i].offset().unwrap_or(LogOffset::BeforeAll)
    }
}

/// In-memory storage backend
pub struct MemoryStorage {
    shapes: DashMap<Handle, Arc<RwLock<ShapeData>>>,
    /// Handles are never reused, so a deleted one stays deleted
    deleted: DashSet<Handle>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            shapes: DashMap::new(),
            deleted: DashSet::new(),
        }
    }

    fn shape(&self, handle: &Handle) -> Result<Arc<RwLock<ShapeData>>> {
        self.shapes
            .get(handle)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::ShapeNotFound(handle.to_string()))
    }

    /// Run `f` under the shape's read lock
    fn read<T>(&self, handle: &Handle, f: impl FnOnce(&ShapeData) -> Result<T>) -> Result<T> {
        let shape = self.shape(handle)?;
        let data = shape.read();
        if data.deleted {
            return Err(Error::ShapeNotFound(handle.to_string()));
        }
        f(&data)
    }

    fn write<T>(&self, handle: &Handle, f: impl FnOnce(&mut ShapeData) -> Result<T>) -> Result<T> {
        let shape = self.shape(handle)?;
        let mut data = shape.write();
        if data.deleted {
            return Err(Error::ShapeNotFound(handle.to_string()));
        }
        f(&mut data)
    }

    /// Existing or new shape; fails for a deleted handle
    fn entry(&self, handle: &Handle) -> Result<Arc<RwLock<ShapeData>>> {
        match self.shapes.entry(handle.clone()) {
            Entry::Occupied(e) => Ok(Arc::clone(e.get())),
            Entry::Vacant(_) if self.deleted.contains(handle) => {
                Err(Error::ShapeNotFound(handle.to_string()))
            }
            Entry::Vacant(e) => Ok(Arc::clone(e.insert(Arc::default()).value())),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
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
        let mut data = shape.write();
        if data.deleted {
            return Err(Error::ShapeNotFound(handle.to_string()));
        }
        data.schema = Some(schema);
        data.snapshot = Some(items);
        data.snapshot_xmin = snapshot_xmin;
        data.log.clear();
        data.chunk_ends.clear();
        Ok(())
    }

    async fn get_snapshot(&self, handle: &Handle) -> Result<(Vec<LogItem>, u64)> {
        self.read(handle, |data| match &data.snapshot {
            Some(items) => Ok((items.clone(), data.snapshot_xmin)),
            None => Err(Error::SnapshotNotFound(handle.to_string())),
        })
    }

    async fn snapshot_exists(&self, handle: &Handle) -> bool {
        self.read(handle, |data| Ok(data.snapshot.is_some()))
            .unwrap_or(false)
    }

    async fn append_to_log(&self, handle: &Handle, items: Vec<LogItem>) -> Result<()> {
        self.write(handle, |data| {
            if data.snapshot.is_none() {
                return Err(Error::SnapshotNotFound(handle.to_string()));
            }
            validate_append(data.log.last().and_then(LogItem::offset), &items)?;
            data.log.extend(items);
            Ok(())
        })
    }

    async fn get_log_since(&self, handle: &Handle, offset: LogOffset) -> Result<Vec<LogItem>> {
        self.read(handle, |data| {
            if offset.is_before_all() {
                let mut out = data.snapshot.clone().unwrap_or_default();
                out.extend(data.log.iter().cloned());
                return Ok(out);
            }
            let range = chunk_range(|i| data.offset_at(i), data.log.len(), offset, None);
            Ok(data.log[range].to_vec())
        })
    }

    async fn get_log_chunk(
        &self,
        handle: &Handle,
        chunk_start: LogOffset,
    ) -> Result<(Vec<LogItem>, Option<LogOffset>)> {
        self.read(handle, |data| {
            if chunk_start.is_before_all() {
                let items = data.snapshot.clone().unwrap_or_default();
                let next = (!data.log.is_empty()).then_some(LogOffset::FIRST);
                return Ok((items, next));
            }
            let end = data.chunk_ends.get(&chunk_start).copied();
            let range = chunk_range(|i| data.offset_at(i), data.log.len(), chunk_start, end);
            let items = data.log[range].to_vec();
            let next = end.filter(|_| !items.is_empty());
            Ok((items, next))
        })
    }

    async fn get_chunk_end(&self, handle: &Handle, chunk_start: LogOffset) -> Result<Option<LogOffset>> {
        self.read(handle, |data| Ok(data.chunk_ends.get(&chunk_start).copied()))
    }

    async fn set_chunk_end(
        &self,
        handle: &Handle,
        chunk_start: LogOffset,
        chunk_end: LogOffset,
    ) -> Result<()> {
        self.write(handle, |data| {
            data.chunk_ends.insert(chunk_start, chunk_end);
            Ok(())
        })
    }

    async fn get_latest_offset(&self, handle: &Handle) -> Result<LogOffset> {
        self.read(handle, |data| Ok(data.latest()))
    }

    async fn get_schema(&self, handle: &Handle) -> Result<TableSchema> {
        self.read(handle, |data| {
            data.schema
                .clone()
                .ok_or_else(|| Error::SnapshotNotFound(handle.to_string()))
        })
    }

    async fn get_pg_snapshot(&self, handle: &Handle) -> Result<Option<PgSnapshot>> {
        self.read(handle, |data| Ok(data.pg_snapshot.clone()))
    }

    async fn set_pg_snapshot(&self, handle: &Handle, snapshot: PgSnapshot) -> Result<()> {
        let shape = self.entry(handle)?;
        let mut data = shape.write();
        if data.deleted {
            return Err(Error::ShapeNotFound(handle.to_string()));
        }
        data.pg_snapshot = Some(snapshot);
        Ok(())
    }

    async fn delete_shape(&self, handle: &Handle) -> Result<()> {
        self.deleted.insert(handle.clone());
        let (_, shape) = self
            .shapes
            .remove(handle)
            .ok_or_else(|| Error::ShapeNotFound(handle.to_string()))?;
        let mut data = shape.write();
        data.deleted = true;
        data.log.clear();
        data.snapshot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{exercise_contract, handle, item, schema};

    #[tokio::test]
    async fn test_memory_contract() {
        exercise_contract(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_snapshot_is_defensive_copy() {
        let storage = MemoryStorage::new();
        let h = handle(9);
        storage
            .set_snapshot(&h, schema(), vec![item(0, 0)], 1)
            .await
            .unwrap();
        let (mut items, _) = storage.get_snapshot(&h).await.unwrap();
        items.clear();
        assert_eq!(storage.get_snapshot(&h).await.unwrap().0.len(), 1);
    }
}
