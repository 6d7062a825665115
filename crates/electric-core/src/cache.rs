//! Shape cache and registry
//!
//! The cache owns the set of live shapes. Each shape definition (by hash)
//! is materialised at most once: lookups and insertions happen under one
//! registry lock, which is never held across I/O.
//!
//! Every entry carries a [`Notify`] that fires on state changes and offset
//! updates; long-poll readers park on it.

use crate::collector::{Dispatcher, DEFAULT_CONSUMER_BUFFER};
use crate::chunker::DEFAULT_CHUNK_THRESHOLD;
use crate::consumer::{Consumer, ConsumerDeps};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleClock};
use crate::offset::LogOffset;
use crate::shape::Shape;
use crate::schema::TableSchema;
use crate::snapshot::{Catalog, SnapshotExecutor};
use crate::storage::Storage;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeState {
    Initializing,
    Snapshotting,
    Active,
    Deleted,
}

impl ShapeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeState::Initializing => "initializing",
            ShapeState::Snapshotting => "snapshotting",
            ShapeState::Active => "active",
            ShapeState::Deleted => "deleted",
        }
    }

    /// Allowed transitions: initializing -> snapshotting -> active, and
    /// anything except deleted -> deleted
    pub fn can_transition_to(&self, next: ShapeState) -> bool {
        matches!(
            (self, next),
            (ShapeState::Initializing, ShapeState::Snapshotting)
                | (ShapeState::Snapshotting, ShapeState::Active)
                | (
                    ShapeState::Initializing | ShapeState::Snapshotting | ShapeState::Active,
                    ShapeState::Deleted
                )
        )
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, ShapeState::Deleted)
    }
}

impl fmt::Display for ShapeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Chunk size threshold in bytes
    pub chunk_threshold: u64,
    /// Maximum simultaneous shapes, 0 for unlimited
    pub max_shapes: usize,
    /// Per-consumer queue capacity in transactions
    pub consumer_buffer: usize,
    /// Bound on the initial snapshot query
    pub snapshot_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            max_shapes: 0,
            consumer_buffer: DEFAULT_CONSUMER_BUFFER,
            snapshot_timeout: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn with_chunk_threshold(mut self, bytes: u64) -> Self {
        self.chunk_threshold = bytes;
        self
    }

    pub fn with_max_shapes(mut self, max: usize) -> Self {
        self.max_shapes = max;
        self
    }

    pub fn with_consumer_buffer(mut self, capacity: usize) -> Self {
        self.consumer_buffer = capacity;
        self
    }

    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct EntryStatus {
    state: ShapeState,
    latest: LogOffset,
    error: Option<String>,
}

/// A registered shape
pub struct ShapeEntry {
    handle: Handle,
    shape: Arc<Shape>,
    status: Mutex<EntryStatus>,
    notify: Notify,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ShapeEntry {
    fn new(handle: Handle, shape: Arc<Shape>) -> Self {
        Self {
            handle,
            shape,
            status: Mutex::new(EntryStatus {
                state: ShapeState::Initializing,
                latest: LogOffset::FIRST,
                error: None,
            }),
            notify: Notify::new(),
            consumer: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn shape(&self) -> &Arc<Shape> {
        &self.shape
    }

    pub fn state(&self) -> ShapeState {
        self.status.lock().state
    }

    pub fn latest_offset(&self) -> LogOffset {
        self.status.lock().latest
    }

    /// Failure reason of a stopped shape
    pub fn error(&self) -> Option<String> {
        self.status.lock().error.clone()
    }

    /// Fires on the next state change or offset update
    pub fn changed(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    pub fn info(&self) -> ShapeInfo {
        let status = self.status.lock();
        ShapeInfo {
            handle: self.handle.clone(),
            shape: Arc::clone(&self.shape),
            state: status.state,
            latest_offset: status.latest,
            error: status.error.clone(),
        }
    }

    fn transition(&self, next: ShapeState) -> Result<()> {
        let mut status = self.status.lock();
        if !status.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                handle: self.handle.to_string(),
                from: status.state.to_string(),
                to: next.to_string(),
            });
        }
        status.state = next;
        drop(status);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Mark deleted; returns false if it already was
    fn mark_deleted(&self, error: Option<String>) -> bool {
        let mut status = self.status.lock();
        if status.state == ShapeState::Deleted {
            return false;
        }
        status.state = ShapeState::Deleted;
        status.error = error;
        drop(status);
        self.notify.notify_waiters();
        true
    }

    fn abort_consumer(&self) {
        if let Some(task) = self.consumer.lock().take() {
            task.abort();
        }
    }
}

/// Point-in-time view of a shape
#[derive(Debug, Clone)]
pub struct ShapeInfo {
    pub handle: Handle,
    pub shape: Arc<Shape>,
    pub state: ShapeState,
    pub latest_offset: LogOffset,
    pub error: Option<String>,
}

#[derive(Default)]
struct Registry {
    by_handle: HashMap<Handle, Arc<ShapeEntry>>,
    /// Live shapes only
    by_hash: HashMap<String, Handle>,
}

impl Registry {
    fn live_count(&self) -> usize {
        self.by_hash.len()
    }
}

struct Inner {
    config: CacheConfig,
    registry: Mutex<Registry>,
    storage: Storage,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<dyn SnapshotExecutor>,
    catalog: Arc<dyn Catalog>,
    schemas: DashMap<(String, String), TableSchema>,
    clock: HandleClock,
}

/// Registry of live shapes
#[derive(Clone)]
pub struct ShapeCache {
    inner: Arc<Inner>,
}

impl ShapeCache {
    pub fn new(
        config: CacheConfig,
        storage: Storage,
        executor: Arc<dyn SnapshotExecutor>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(config.consumer_buffer));
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry::default()),
                storage,
                dispatcher,
                executor,
                catalog,
                schemas: DashMap::new(),
                clock: HandleClock::new(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Routing table the replication collector dispatches through
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.inner.dispatcher)
    }

    /// Return the live handle for `shape`'s definition, creating and
    /// starting a new materialisation when there is none.
    ///
    /// Returns `(handle, created)`.
    pub async fn get_or_create(&self, shape: Shape) -> Result<(Handle, bool)> {
        let hash = shape.hash();
        if let Some(handle) = self.get_by_hash(&hash) {
            return Ok((handle, false));
        }

        let shape = Arc::new(self.resolve_schema(shape).await?);

        let (entry, events) = {
            let mut registry = self.inner.registry.lock();
            if let Some(handle) = registry.by_hash.get(&hash) {
                return Ok((handle.clone(), false));
            }
            let max = self.inner.config.max_shapes;
            if max > 0 && registry.live_count() >= max {
                return Err(Error::TooManyShapes(max));
            }

            let handle = self.inner.clock.next_handle(hash.clone());
            let entry = Arc::new(ShapeEntry::new(handle.clone(), Arc::clone(&shape)));
            let events = self
                .inner
                .dispatcher
                .register(&handle, shape.schema(), shape.table());
            registry.by_hash.insert(hash, handle.clone());
            registry.by_handle.insert(handle, Arc::clone(&entry));
            (entry, events)
        };

        let consumer = Consumer::new(
            entry.handle.clone(),
            shape,
            ConsumerDeps {
                storage: Arc::clone(&self.inner.storage),
                executor: Arc::clone(&self.inner.executor),
                catalog: Arc::clone(&self.inner.catalog),
                cache: self.clone(),
            },
            events,
            self.inner.config.chunk_threshold,
            self.inner.config.snapshot_timeout,
        );
        *entry.consumer.lock() = Some(tokio::spawn(consumer.run()));

        info!(handle = %entry.handle, "Created shape for {}", entry.shape.table_ref());
        Ok((entry.handle.clone(), true))
    }

    /// Attach the table schema, loading it through the catalog on first use
    async fn resolve_schema(&self, shape: Shape) -> Result<Shape> {
        if shape.table_schema().is_some() {
            return Ok(shape);
        }
        let key = (shape.schema().to_string(), shape.table().to_string());
        let cached = self.inner.schemas.get(&key).map(|s| s.clone());
        let schema = match cached {
            Some(schema) => schema,
            None => {
                let schema = self
                    .inner
                    .catalog
                    .load_table_schema(&key.0, &key.1)
                    .await?;
                self.inner.schemas.insert(key, schema.clone());
                schema
            }
        };
        shape.with_table_schema(schema)
    }

    /// Drop a cached table schema after the table changed
    pub fn forget_table_schema(&self, schema: &str, table: &str) {
        self.inner
            .schemas
            .remove(&(schema.to_string(), table.to_string()));
    }

    /// Registered entry, including tombstones of failed shapes
    pub fn entry(&self, handle: &Handle) -> Option<Arc<ShapeEntry>> {
        self.inner.registry.lock().by_handle.get(handle).cloned()
    }

    pub fn get(&self, handle: &Handle) -> Option<ShapeInfo> {
        self.entry(handle).map(|e| e.info())
    }

    /// Live handles
    pub fn list(&self) -> Vec<Handle> {
        let registry = self.inner.registry.lock();
        let mut handles: Vec<Handle> = registry.by_hash.values().cloned().collect();
        handles.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        handles
    }

    pub fn has_shape(&self, handle: &Handle) -> bool {
        self.entry(handle).is_some_and(|e| e.state().is_live())
    }

    pub fn get_shape(&self, handle: &Handle) -> Option<Arc<Shape>> {
        self.entry(handle)
            .filter(|e| e.state().is_live())
            .map(|e| Arc::clone(&e.shape))
    }

    pub fn get_by_hash(&self, hash: &str) -> Option<Handle> {
        self.inner.registry.lock().by_hash.get(hash).cloned()
    }

    /// Number of live shapes
    pub fn count(&self) -> usize {
        self.inner.registry.lock().live_count()
    }

    pub fn set_state(&self, handle: &Handle, state: ShapeState) -> Result<()> {
        self.entry(handle)
            .ok_or_else(|| Error::ShapeNotFound(handle.to_string()))?
            .transition(state)
    }

    /// `snapshotting -> active`; wakes waiters
    pub fn mark_snapshot_complete(&self, handle: &Handle) -> Result<()> {
        self.set_state(handle, ShapeState::Active)
    }

    /// Publish a new latest offset; never moves backwards
    pub fn update_offset(&self, handle: &Handle, offset: LogOffset) {
        let Some(entry) = self.entry(handle) else {
            return;
        };
        {
            let mut status = entry.status.lock();
            if offset <= status.latest {
                return;
            }
            status.latest = offset;
        }
        entry.notify.notify_waiters();
    }

    /// Wait until the shape is active, bounded by `timeout`
    pub async fn wait_until_active(&self, handle: &Handle, timeout: Duration) -> Result<()> {
        let entry = self
            .entry(handle)
            .ok_or_else(|| Error::ShapeGone(handle.to_string()))?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = entry.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match entry.state() {
                ShapeState::Active => return Ok(()),
                ShapeState::Deleted => return Err(gone_error(&entry)),
                ShapeState::Initializing | ShapeState::Snapshotting => {}
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Snapshot(format!(
                        "shape {} not ready after {}ms",
                        handle,
                        timeout.as_millis()
                    )));
                }
            }
        }
    }

    /// Remove a shape and all of its stored state
    pub async fn remove(&self, handle: &Handle) -> Result<()> {
        let entry = {
            let mut registry = self.inner.registry.lock();
            let entry = registry
                .by_handle
                .remove(handle)
                .ok_or_else(|| Error::ShapeNotFound(handle.to_string()))?;
            if registry.by_hash.get(handle.hash()) == Some(handle) {
                registry.by_hash.remove(handle.hash());
            }
            entry
        };

        entry.mark_deleted(None);
        self.teardown(&entry).await;
        info!(handle = %handle, "Removed shape");
        Ok(())
    }

    /// Remove every live shape over `schema.table`; returns the removed
    /// handles
    pub async fn remove_by_table(&self, schema: &str, table: &str) -> Vec<Handle> {
        let handles: Vec<Handle> = {
            let registry = self.inner.registry.lock();
            registry
                .by_handle
                .values()
                .filter(|e| e.state().is_live() && e.shape.is_relation(schema, table))
                .map(|e| e.handle.clone())
                .collect()
        };
        let mut removed = Vec::new();
        for handle in handles {
            if self.remove(&handle).await.is_ok() {
                removed.push(handle);
            }
        }
        removed
    }

    /// Stop a shape after a failure. The entry stays behind as a tombstone
    /// carrying the error until [`cleanup`](Self::cleanup).
    pub async fn fail(&self, handle: &Handle, error: String) {
        let entry = {
            let mut registry = self.inner.registry.lock();
            if registry.by_hash.get(handle.hash()) == Some(handle) {
                registry.by_hash.remove(handle.hash());
            }
            registry.by_handle.get(handle).cloned()
        };
        let Some(entry) = entry else {
            return;
        };
        if entry.mark_deleted(Some(error.clone())) {
            warn!(handle = %handle, "Shape stopped: {}", error);
            self.teardown(&entry).await;
        }
    }

    /// Stop shapes whose consumers fell behind the replication stream
    pub async fn drop_lagging(&self, handles: Vec<Handle>) {
        for handle in handles {
            self.fail(&handle, "consumer fell behind replication".to_string())
                .await;
        }
    }

    /// Runs inside the consumer task when the consumer fails itself, so the
    /// task is aborted last. Storage refuses writes to a deleted handle,
    /// which keeps a consumer racing this call from recreating it.
    async fn teardown(&self, entry: &ShapeEntry) {
        self.inner.dispatcher.unregister(&entry.handle);
        match self.inner.storage.delete_shape(&entry.handle).await {
            Ok(()) | Err(Error::ShapeNotFound(_)) => {}
            Err(e) => warn!(handle = %entry.handle, "Failed to delete shape storage: {}", e),
        }
        entry.abort_consumer();
    }

    /// Purge tombstones of failed shapes; returns how many were dropped
    pub fn cleanup(&self) -> usize {
        let mut registry = self.inner.registry.lock();
        let before = registry.by_handle.len();
        registry.by_handle.retain(|_, e| e.state().is_live());
        let purged = before - registry.by_handle.len();
        if purged > 0 {
            debug!(purged, "Purged stopped shapes");
        }
        purged
    }

    /// Abort every consumer
    pub fn shutdown(&self) {
        let entries: Vec<Arc<ShapeEntry>> = self
            .inner
            .registry
            .lock()
            .by_handle
            .values()
            .cloned()
            .collect();
        for entry in entries {
            entry.abort_consumer();
        }
        info!("Shape cache shut down");
    }
}

/// `ShapeGone` error for a deleted entry
pub(crate) fn gone_error(entry: &ShapeEntry) -> Error {
    match entry.error() {
        Some(e) => Error::ShapeGone(format!("{}: {}", entry.handle, e)),
        None => Error::ShapeGone(entry.handle.to_string()),
    }
}
