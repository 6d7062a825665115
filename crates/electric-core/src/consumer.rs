//! Per-shape consumer
//!
//! A [`Consumer`] owns the mutation path of one shape: it takes the initial
//! snapshot, then turns replicated transactions into log items through the
//! shape's [`ChangeFilter`] and appends them to storage.
//!
//! Transactions already contained in the snapshot are recognised through the
//! snapshot's [`PgSnapshot`] and dropped. Filtering stops for good at the
//! first transaction that committed after the snapshot.

use crate::cache::{ShapeCache, ShapeState};
use crate::chunker::Chunker;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::log_item::{ChangeItem, LogItem, ValueMap};
use crate::pg_snapshot::PgSnapshot;
use crate::shape::Shape;
use crate::snapshot::{shape_key, snapshot_items, Catalog, SnapshotExecutor};
use crate::storage::Storage;
use crate::value::{row_to_wire, Row};
use crate::wal::{Change, ChangeKind, ConsumerEvent, Relation, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const APPEND_ATTEMPTS: u32 = 3;
const APPEND_BACKOFF: Duration = Duration::from_millis(100);

/// Turns row changes into log items for one shape
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    shape: Arc<Shape>,
    pk: Vec<String>,
}

impl ChangeFilter {
    pub fn new(shape: Arc<Shape>) -> Self {
        let pk = shape.primary_key();
        Self { shape, pk }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Log items for one change. An update may yield an insert or a delete
    /// when the row moves into or out of the shape, and a delete + insert
    /// pair when its primary key changes.
    pub fn filter_change(&self, change: &Change, xid: u64) -> Result<Vec<ChangeItem>> {
        if !self.shape.is_relation(&change.schema, &change.table) {
            return Ok(Vec::new());
        }
        let items = match change.kind {
            ChangeKind::Insert => match &change.new {
                Some(new) => self.filter_insert(change, new)?,
                None => Vec::new(),
            },
            ChangeKind::Update => match &change.new {
                Some(new) => self.filter_update(change, change.old.as_ref(), new)?,
                None => Vec::new(),
            },
            ChangeKind::Delete => match &change.old {
                Some(old) => self.filter_delete(change, old)?,
                None => Vec::new(),
            },
        };
        Ok(items
            .into_iter()
            .map(|item| {
                item.with_relation(&change.schema, &change.table)
                    .with_txid(xid)
            })
            .collect())
    }

    /// Log items for the shape's changes in `tx`; the final item carries
    /// `last`
    pub fn filter_transaction(&self, tx: &Transaction) -> Result<Vec<LogItem>> {
        let mut items = Vec::new();
        for change in tx.changes_for(self.shape.schema(), self.shape.table()) {
            items.extend(self.filter_change(change, tx.xid)?);
        }
        if let Some(last) = items.pop() {
            items.push(last.with_last(true));
        }
        Ok(items.into_iter().map(LogItem::from).collect())
    }

    fn filter_insert(&self, change: &Change, new: &Row) -> Result<Vec<ChangeItem>> {
        if !self.shape.matches(new)? {
            return Ok(Vec::new());
        }
        let projected = self.shape.project(new);
        Ok(vec![ChangeItem::insert(
            change.offset,
            shape_key(&self.shape, &projected),
            row_to_wire(&projected),
        )])
    }

    fn filter_update(&self, change: &Change, old: Option<&Row>, new: &Row) -> Result<Vec<ChangeItem>> {
        // without an old tuple the row keeps its identity
        let old_row = old.unwrap_or(new);
        let old_matches = self.shape.matches(old_row)?;
        let new_matches = self.shape.matches(new)?;
        if !old_matches && !new_matches {
            return Ok(Vec::new());
        }

        let old_projected = self.shape.project(old_row);
        let new_projected = self.shape.project(new);
        let old_key = shape_key(&self.shape, &old_projected);
        let new_key = shape_key(&self.shape, &new_projected);
        // without an old tuple every column counts as changed
        let old_value = match old {
            Some(_) => row_to_wire(&old_projected),
            None => ValueMap::new(),
        };
        let new_value = row_to_wire(&new_projected);
        let offset = change.offset;

        let items = match (old_matches, new_matches) {
            (true, true) if old.is_some() && old_key != new_key => {
                let [delete, insert] = ChangeItem::pk_change(
                    offset,
                    old_key,
                    new_key,
                    self.delete_value(old_value),
                    new_value,
                );
                vec![delete, insert]
            }
            (true, true) => {
                let old_changed = self
                    .shape
                    .replica()
                    .is_full()
                    .then(|| changed_old_values(&old_value, &new_value));
                let value = self.update_value(&old_value, new_value);
                vec![ChangeItem::update(offset, new_key, value, old_changed)]
            }
            (false, true) => vec![ChangeItem::insert(offset, new_key, new_value)],
            (true, false) => vec![ChangeItem::delete(
                offset,
                old_key,
                self.delete_value(old_value),
            )],
            (false, false) => Vec::new(),
        };
        Ok(items)
    }

    fn filter_delete(&self, change: &Change, old: &Row) -> Result<Vec<ChangeItem>> {
        if !self.shape.matches(old)? {
            return Ok(Vec::new());
        }
        let projected = self.shape.project(old);
        Ok(vec![ChangeItem::delete(
            change.offset,
            shape_key(&self.shape, &projected),
            self.delete_value(row_to_wire(&projected)),
        )])
    }

    /// Full replica: the whole prior row. Default: the primary key only,
    /// or the whole row for tables without one.
    fn delete_value(&self, old: ValueMap) -> ValueMap {
        if self.shape.replica().is_full() || self.pk.is_empty() {
            return old;
        }
        old.into_iter()
            .filter(|(k, _)| self.pk.contains(k))
            .collect()
    }

    /// Full replica: the whole new row. Default: primary key plus changed
    /// columns.
    fn update_value(&self, old: &ValueMap, new: ValueMap) -> ValueMap {
        if self.shape.replica().is_full() {
            return new;
        }
        new.into_iter()
            .filter(|(k, v)| self.pk.contains(k) || old.get(k) != Some(v))
            .collect()
    }
}

/// Prior values of the columns that changed
fn changed_old_values(old: &ValueMap, new: &ValueMap) -> ValueMap {
    new.iter()
        .filter_map(|(k, v)| match old.get(k) {
            Some(prev) if prev != v => Some((k.clone(), prev.clone())),
            _ => None,
        })
        .collect()
}

/// Collaborators of a consumer
#[derive(Clone)]
pub struct ConsumerDeps {
    pub storage: Storage,
    pub executor: Arc<dyn SnapshotExecutor>,
    pub catalog: Arc<dyn Catalog>,
    pub cache: ShapeCache,
}

/// Drives one shape from snapshot to live replication
pub struct Consumer {
    handle: Handle,
    shape: Arc<Shape>,
    deps: ConsumerDeps,
    events: mpsc::Receiver<ConsumerEvent>,
    filter: ChangeFilter,
    chunker: Chunker,
    pg_snapshot: Option<PgSnapshot>,
    snapshot_timeout: Duration,
    /// Commit LSN of the last applied transaction
    applied_lsn: u64,
}

/// What to do after an event
enum Flow {
    Continue,
    Invalidate(String),
}

impl Consumer {
    pub fn new(
        handle: Handle,
        shape: Arc<Shape>,
        deps: ConsumerDeps,
        events: mpsc::Receiver<ConsumerEvent>,
        chunk_threshold: u64,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            filter: ChangeFilter::new(Arc::clone(&shape)),
            handle,
            shape,
            deps,
            events,
            chunker: Chunker::new(chunk_threshold),
            pg_snapshot: None,
            snapshot_timeout,
            applied_lsn: 0,
        }
    }

    /// Run until the shape is removed or fails
    pub async fn run(mut self) {
        if let Err(e) = self.start().await {
            error!(handle = %self.handle, "Snapshot failed: {}", e);
            self.deps.cache.fail(&self.handle, e.to_string()).await;
            return;
        }

        while let Some(event) = self.events.recv().await {
            match self.handle_event(event).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Invalidate(reason)) => {
                    info!(handle = %self.handle, "Shape invalidated: {}", reason);
                    if let Err(e) = self.deps.cache.remove(&self.handle).await {
                        debug!(handle = %self.handle, "Remove after invalidation: {}", e);
                    }
                    return;
                }
                Err(e) => {
                    error!(handle = %self.handle, "Consumer failed: {}", e);
                    self.deps.cache.fail(&self.handle, e.to_string()).await;
                    return;
                }
            }
        }
        debug!(handle = %self.handle, "Consumer event stream closed");
    }

    async fn start(&mut self) -> Result<()> {
        let storage = &self.deps.storage;
        self.deps
            .catalog
            .add_to_publication(self.shape.schema(), self.shape.table())
            .await?;
        self.deps
            .cache
            .set_state(&self.handle, ShapeState::Snapshotting)?;

        let result = tokio::time::timeout(
            self.snapshot_timeout,
            self.deps.executor.execute(&self.shape),
        )
        .await
        .map_err(|_| {
            Error::Snapshot(format!(
                "timed out after {}ms",
                self.snapshot_timeout.as_millis()
            ))
        })??;

        storage
            .set_pg_snapshot(&self.handle, result.pg_snapshot.clone())
            .await?;
        let items = snapshot_items(&self.shape, &result.rows);
        let count = items.len();
        let schema = self.shape.table_schema().cloned().unwrap_or_default();
        storage
            .set_snapshot(&self.handle, schema, items, result.pg_snapshot.xmin)
            .await?;
        self.pg_snapshot = Some(result.pg_snapshot);

        self.deps.cache.mark_snapshot_complete(&self.handle)?;
        info!(
            handle = %self.handle,
            rows = count,
            lsn = result.lsn,
            "Snapshot complete for {}",
            self.shape.table_ref()
        );
        Ok(())
    }

    async fn handle_event(&mut self, event: ConsumerEvent) -> Result<Flow> {
        match event {
            ConsumerEvent::Transaction(tx) => {
                self.apply_transaction(&tx).await?;
                Ok(Flow::Continue)
            }
            ConsumerEvent::Relation(relation) => Ok(self.check_relation(&relation)),
            ConsumerEvent::Truncate => Ok(Flow::Invalidate(format!(
                "{} was truncated",
                self.shape.table_ref()
            ))),
        }
    }

    /// A relation that lost any projected or key column invalidates the
    /// shape
    fn check_relation(&self, relation: &Relation) -> Flow {
        let mut required = self.shape.output_columns();
        required.extend(self.shape.primary_key());
        if let Some(predicate) = self.shape.predicate() {
            required.extend(predicate.columns().iter().cloned());
        }
        let missing: Vec<String> = required
            .into_iter()
            .filter(|c| relation.column(c).is_none())
            .collect();
        if missing.is_empty() {
            return Flow::Continue;
        }
        self.deps
            .cache
            .forget_table_schema(&relation.schema, &relation.table);
        Flow::Invalidate(format!(
            "relation {} no longer has column(s) {}",
            self.shape.table_ref(),
            missing.join(", ")
        ))
    }

    async fn apply_transaction(&mut self, tx: &Transaction) -> Result<()> {
        if tx.lsn <= self.applied_lsn {
            debug!(handle = %self.handle, xid = tx.xid, "Transaction already applied");
            return Ok(());
        }
        if let Some(snapshot) = self.pg_snapshot.as_mut() {
            if snapshot.should_skip(tx.xid) {
                debug!(handle = %self.handle, xid = tx.xid, "Transaction visible in snapshot, skipped");
                return Ok(());
            }
            if snapshot.observe_commit(tx.xid) {
                let snapshot = snapshot.clone();
                self.deps
                    .storage
                    .set_pg_snapshot(&self.handle, snapshot)
                    .await?;
                debug!(handle = %self.handle, xid = tx.xid, "Snapshot filtering disabled");
            }
        }

        let items = self.filter.filter_transaction(tx)?;
        self.applied_lsn = tx.lsn;
        let Some(latest) = items.last().and_then(LogItem::offset) else {
            return Ok(());
        };

        let boundaries: Vec<_> = items
            .iter()
            .filter_map(|item| {
                let offset = item.offset()?;
                self.chunker.add(offset, item.encoded_len() as u64)
            })
            .collect();

        let count = items.len();
        self.append(items).await?;
        for boundary in boundaries {
            self.deps
                .storage
                .set_chunk_end(&self.handle, boundary.start, boundary.end)
                .await?;
        }
        self.deps.cache.update_offset(&self.handle, latest);
        debug!(handle = %self.handle, xid = tx.xid, items = count, offset = %latest, "Appended transaction");
        Ok(())
    }

    /// Append with bounded retries; appends are all-or-nothing so a failed
    /// attempt can be repeated as is
    async fn append(&self, items: Vec<LogItem>) -> Result<()> {
        let mut backoff = APPEND_BACKOFF;
        let mut attempt = 1;
        loop {
            match self
                .deps
                .storage
                .append_to_log(&self.handle, items.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e @ (Error::OffsetOrder { .. } | Error::ShapeNotFound(_))) => return Err(e),
                Err(e) if attempt >= APPEND_ATTEMPTS => return Err(e),
                Err(e) => {
                    warn!(
                        handle = %self.handle,
                        attempt,
                        "Append failed, retrying in {:?}: {}",
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }
}
