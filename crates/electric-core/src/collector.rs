//! Replication fan-out
//!
//! The [`Collector`] turns the serial replication message stream into
//! committed [`Transaction`]s and hands them to the [`Dispatcher`], which
//! forwards each one to the consumers of the tables it touches.
//!
//! Every consumer has a bounded queue. A consumer whose queue is full (or
//! closed) is unsubscribed on the spot and its handle is returned to the
//! caller, which removes the shape; the replication stream itself is never
//! blocked by a slow shape.

use crate::handle::Handle;
use crate::offset::LogOffset;
use crate::wal::{Change, ConsumerEvent, Relation, Transaction, WalMessage};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Default consumer queue capacity in transactions
pub const DEFAULT_CONSUMER_BUFFER: usize = 1024;

type TableKey = (String, String);

struct Subscriber {
    handle: Handle,
    tx: mpsc::Sender<ConsumerEvent>,
}

/// Routes events to the consumers subscribed to a table
pub struct Dispatcher {
    tables: DashMap<TableKey, Vec<Subscriber>>,
    capacity: usize,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            tables: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe `handle` to `schema.table`
    pub fn register(&self, handle: &Handle, schema: &str, table: &str) -> mpsc::Receiver<ConsumerEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.tables
            .entry((schema.to_string(), table.to_string()))
            .or_default()
            .push(Subscriber {
                handle: handle.clone(),
                tx,
            });
        rx
    }

    pub fn unregister(&self, handle: &Handle) {
        self.tables
            .iter_mut()
            .for_each(|mut subs| subs.retain(|s| &s.handle != handle));
        self.tables.retain(|_, subs| !subs.is_empty());
    }

    pub fn has_subscribers(&self, schema: &str, table: &str) -> bool {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .is_some_and(|subs| !subs.is_empty())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tables.iter().map(|subs| subs.len()).sum()
    }

    /// Deliver `event` to every subscriber of `schema.table`; returns the
    /// handles that could not keep up and were unsubscribed
    pub fn dispatch(&self, schema: &str, table: &str, event: &ConsumerEvent) -> Vec<Handle> {
        let Some(mut subs) = self
            .tables
            .get_mut(&(schema.to_string(), table.to_string()))
        else {
            return Vec::new();
        };

        let mut failed = Vec::new();
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(handle = %sub.handle, "Consumer queue full, dropping shape");
                failed.push(sub.handle.clone());
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(handle = %sub.handle, "Consumer gone, unsubscribing");
                failed.push(sub.handle.clone());
                false
            }
        });
        failed
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CONSUMER_BUFFER)
    }
}

struct PendingTransaction {
    xid: u64,
    lsn: u64,
    next_op: u64,
    changes: Vec<Change>,
    truncated: Vec<TableKey>,
}

impl PendingTransaction {
    /// Reserve `slots` op positions and return the first
    fn reserve(&mut self, slots: u64) -> LogOffset {
        let offset = LogOffset::new(self.lsn, self.next_op);
        self.next_op += slots;
        offset
    }
}

/// Assembles transactions from the replication stream
pub struct Collector {
    dispatcher: Arc<Dispatcher>,
    relations: HashMap<u32, Arc<Relation>>,
    current: Option<PendingTransaction>,
    confirmed_lsn: u64,
}

impl Collector {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            relations: HashMap::new(),
            current: None,
            confirmed_lsn: 0,
        }
    }

    /// End LSN of the last commit handed to consumers
    pub fn confirmed_lsn(&self) -> u64 {
        self.confirmed_lsn
    }

    /// A `Begin` has been seen without its `Commit`
    pub fn in_transaction(&self) -> bool {
        self.current.is_some()
    }

    /// Acknowledge WAL up to `lsn` when nothing is pending; used for
    /// keepalives on an idle stream
    pub fn advance_idle(&mut self, lsn: u64) {
        if self.current.is_none() {
            self.confirmed_lsn = self.confirmed_lsn.max(lsn);
        }
    }

    pub fn relation(&self, id: u32) -> Option<&Arc<Relation>> {
        self.relations.get(&id)
    }

    /// Process one message; returns handles of shapes that must be removed
    pub fn process(&mut self, msg: WalMessage) -> Vec<Handle> {
        match msg {
            WalMessage::Begin { xid, final_lsn } => {
                if let Some(prev) = self.current.take() {
                    warn!(xid = prev.xid, "Transaction without commit discarded");
                }
                self.current = Some(PendingTransaction {
                    xid,
                    lsn: final_lsn,
                    next_op: 0,
                    changes: Vec::new(),
                    truncated: Vec::new(),
                });
                Vec::new()
            }
            WalMessage::Commit { end_lsn, .. } => self.commit(end_lsn),
            WalMessage::Relation(relation) => {
                let relation = Arc::new(relation);
                self.relations.insert(relation.id, Arc::clone(&relation));
                self.dispatcher.dispatch(
                    &relation.schema,
                    &relation.table,
                    &ConsumerEvent::Relation(relation.clone()),
                )
            }
            WalMessage::Insert { relation_id, new } => {
                self.push(relation_id, 1, |off, rel| {
                    Change::insert(off, &rel.schema, &rel.table, new)
                });
                Vec::new()
            }
            WalMessage::Update {
                relation_id,
                old,
                new,
            } => {
                // a key change expands to delete + insert
                self.push(relation_id, 2, |off, rel| {
                    Change::update(off, &rel.schema, &rel.table, old, new)
                });
                Vec::new()
            }
            WalMessage::Delete { relation_id, old } => {
                self.push(relation_id, 1, |off, rel| {
                    Change::delete(off, &rel.schema, &rel.table, old)
                });
                Vec::new()
            }
            WalMessage::Truncate { relation_ids } => {
                let tables: Vec<TableKey> = relation_ids
                    .iter()
                    .filter_map(|id| self.relations.get(id))
                    .map(|rel| (rel.schema.clone(), rel.table.clone()))
                    .collect();
                match &mut self.current {
                    Some(tx) => {
                        tx.truncated.extend(tables);
                        Vec::new()
                    }
                    None => self.dispatch_truncates(&tables),
                }
            }
        }
    }

    fn push(
        &mut self,
        relation_id: u32,
        slots: u64,
        build: impl FnOnce(LogOffset, &Relation) -> Change,
    ) {
        let Some(relation) = self.relations.get(&relation_id) else {
            debug!(relation_id, "Change for unknown relation dropped");
            return;
        };
        let Some(tx) = self.current.as_mut() else {
            warn!(relation_id, "Change outside of a transaction dropped");
            return;
        };
        let offset = tx.reserve(slots);
        tx.changes.push(build(offset, relation));
    }

    fn commit(&mut self, end_lsn: u64) -> Vec<Handle> {
        let Some(pending) = self.current.take() else {
            warn!(end_lsn, "Commit without begin ignored");
            return Vec::new();
        };
        self.confirmed_lsn = self.confirmed_lsn.max(end_lsn);

        let tables: BTreeSet<TableKey> = pending
            .changes
            .iter()
            .map(|c| (c.schema.clone(), c.table.clone()))
            .collect();
        let truncated = pending.truncated;
        let mut failed = Vec::new();

        if !tables.is_empty() {
            let event = ConsumerEvent::Transaction(Arc::new(Transaction {
                xid: pending.xid,
                lsn: pending.lsn,
                changes: pending.changes,
            }));
            for (schema, table) in &tables {
                failed.extend(self.dispatcher.dispatch(schema, table, &event));
            }
            debug!(
                xid = pending.xid,
                lsn = pending.lsn,
                tables = tables.len(),
                "Transaction dispatched"
            );
        }
        failed.extend(self.dispatch_truncates(&truncated));
        failed
    }

    fn dispatch_truncates(&self, tables: &[TableKey]) -> Vec<Handle> {
        tables
            .iter()
            .flat_map(|(schema, table)| {
                self.dispatcher
                    .dispatch(schema, table, &ConsumerEvent::Truncate)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Row, Value};
    use crate::wal::{ChangeKind, RelationColumn};

    fn users() -> Relation {
        Relation::new(
            16384,
            "public",
            "users",
            vec![
                RelationColumn::new("id", "int4").key(),
                RelationColumn::new("name", "text"),
            ],
        )
    }

    fn row(id: i64) -> Row {
        Row::from([("id".to_string(), Value::Int(id))])
    }

    fn handle(n: i64) -> Handle {
        Handle::with_timestamp("0123456789abcdef", n)
    }

    #[test]
    fn test_idle_acknowledgement() {
        let mut collector = Collector::new(Arc::new(Dispatcher::new(8)));
        collector.advance_idle(500);
        assert_eq!(collector.confirmed_lsn(), 500);

        collector.process(WalMessage::Begin {
            xid: 1,
            final_lsn: 600,
        });
        assert!(collector.in_transaction());
        collector.advance_idle(700);
        assert_eq!(collector.confirmed_lsn(), 500);

        collector.process(WalMessage::Commit {
            commit_lsn: 600,
            end_lsn: 610,
        });
        assert!(!collector.in_transaction());
        assert_eq!(collector.confirmed_lsn(), 610);
        collector.advance_idle(100);
        assert_eq!(collector.confirmed_lsn(), 610);
    }

    #[tokio::test]
    async fn test_transaction_offsets() {
        let dispatcher = Arc::new(Dispatcher::new(8));
        let mut rx = dispatcher.register(&handle(1), "public", "users");
        let mut collector = Collector::new(dispatcher);

        collector.process(WalMessage::Relation(users()));
        assert!(matches!(rx.recv().await, Some(ConsumerEvent::Relation(_))));

        collector.process(WalMessage::Begin {
            xid: 42,
            final_lsn: 1000,
        });
        collector.process(WalMessage::Insert {
            relation_id: 16384,
            new: row(1),
        });
        collector.process(WalMessage::Update {
            relation_id: 16384,
            old: Some(row(1)),
            new: row(2),
        });
        collector.process(WalMessage::Delete {
            relation_id: 16384,
            old: row(2),
        });
        let failed = collector.process(WalMessage::Commit {
            commit_lsn: 1000,
            end_lsn: 1010,
        });
        assert!(failed.is_empty());
        assert_eq!(collector.confirmed_lsn(), 1010);

        let Some(ConsumerEvent::Transaction(tx)) = rx.recv().await else {
            panic!("expected transaction");
        };
        assert_eq!(tx.xid, 42);
        let offsets: Vec<_> = tx.changes.iter().map(|c| c.offset).collect();
        assert_eq!(
            offsets,
            vec![
                LogOffset::new(1000, 0),
                LogOffset::new(1000, 1),
                LogOffset::new(1000, 3)
            ]
        );
        assert_eq!(tx.changes[1].kind, ChangeKind::Update);
    }

    #[tokio::test]
    async fn test_unknown_relation_dropped() {
        let dispatcher = Arc::new(Dispatcher::new(8));
        let mut rx = dispatcher.register(&handle(1), "public", "users");
        let mut collector = Collector::new(dispatcher);

        collector.process(WalMessage::Begin { xid: 1, final_lsn: 5 });
        collector.process(WalMessage::Insert {
            relation_id: 99,
            new: row(1),
        });
        collector.process(WalMessage::Commit {
            commit_lsn: 5,
            end_lsn: 6,
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_subscriber() {
        let dispatcher = Arc::new(Dispatcher::new(1));
        let mut rx = dispatcher.register(&handle(1), "public", "users");
        let mut collector = Collector::new(Arc::clone(&dispatcher));
        assert!(collector.process(WalMessage::Relation(users())).is_empty());
        assert!(matches!(rx.try_recv(), Ok(ConsumerEvent::Relation(_))));

        for xid in 1..=2 {
            collector.process(WalMessage::Begin {
                xid,
                final_lsn: xid * 10,
            });
            collector.process(WalMessage::Insert {
                relation_id: 16384,
                new: row(xid as i64),
            });
            let failed = collector.process(WalMessage::Commit {
                commit_lsn: xid * 10,
                end_lsn: xid * 10 + 1,
            });
            if xid == 1 {
                assert!(failed.is_empty());
            } else {
                assert_eq!(failed, vec![handle(1)]);
            }
        }
        assert!(!dispatcher.has_subscribers("public", "users"));
    }

    #[tokio::test]
    async fn test_truncate_dispatched_after_commit() {
        let dispatcher = Arc::new(Dispatcher::new(8));
        let mut rx = dispatcher.register(&handle(1), "public", "users");
        let mut collector = Collector::new(dispatcher);
        collector.process(WalMessage::Relation(users()));
        let _ = rx.recv().await;

        collector.process(WalMessage::Begin { xid: 3, final_lsn: 30 });
        collector.process(WalMessage::Truncate {
            relation_ids: vec![16384],
        });
        assert!(rx.try_recv().is_err());
        collector.process(WalMessage::Commit {
            commit_lsn: 30,
            end_lsn: 31,
        });
        assert!(matches!(rx.recv().await, Some(ConsumerEvent::Truncate)));
    }

    #[test]
    fn test_unregister() {
        let dispatcher = Dispatcher::default();
        let _a = dispatcher.register(&handle(1), "public", "users");
        let _b = dispatcher.register(&handle(2), "public", "users");
        assert_eq!(dispatcher.subscriber_count(), 2);
        dispatcher.unregister(&handle(1));
        assert_eq!(dispatcher.subscriber_count(), 1);
        dispatcher.unregister(&handle(2));
        assert!(!dispatcher.has_subscribers("public", "users"));
    }
}
