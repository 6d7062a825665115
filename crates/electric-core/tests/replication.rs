//! Replication integration tests
//!
//! Drive the collector with decoded replication messages and check what the
//! shape consumers append, using in-memory storage and an in-memory snapshot
//! source (no database required).

use electric_core::{
    CacheConfig, Collector, Column, Handle, LogItem, LogOffset, MemorySource, MemoryStorage,
    Operation, PgSnapshot, Predicate, Relation, RelationColumn, Row, Shape, ShapeCache,
    ShapeState, TableSchema, Value, WalMessage,
};
use std::sync::Arc;
use std::time::Duration;

const USERS: u32 = 16384;

fn users_schema() -> TableSchema {
    TableSchema::new(
        "public",
        "users",
        vec![
            Column::new("id", "int4").with_pk_index(0),
            Column::new("name", "text"),
            Column::new("email", "text"),
            Column::new("age", "int4"),
            Column::new("active", "bool"),
        ],
    )
}

fn users_relation() -> Relation {
    Relation::new(
        USERS,
        "public",
        "users",
        vec![
            RelationColumn::new("id", "int4").key(),
            RelationColumn::new("name", "text"),
            RelationColumn::new("email", "text"),
            RelationColumn::new("age", "int4"),
            RelationColumn::new("active", "bool"),
        ],
    )
}

fn user(id: i64, name: &str, active: bool) -> Row {
    Row::from([
        ("id".to_string(), Value::Int(id)),
        ("name".to_string(), Value::from(name)),
        ("email".to_string(), Value::from(format!("{name}@example.com"))),
        ("age".to_string(), Value::Int(30)),
        ("active".to_string(), Value::Bool(active)),
    ])
}

struct Harness {
    cache: ShapeCache,
    collector: Collector,
}

impl Harness {
    fn new(snapshot: &str, rows: Vec<Row>) -> Self {
        let source = Arc::new(MemorySource::new());
        source.add_table(users_schema(), rows);
        source.set_pg_snapshot(PgSnapshot::parse(snapshot).unwrap());
        let cache = ShapeCache::new(
            CacheConfig::default(),
            Arc::new(MemoryStorage::new()),
            source.clone(),
            source,
        );
        let mut collector = Collector::new(cache.dispatcher());
        collector.process(WalMessage::Relation(users_relation()));
        Self { cache, collector }
    }

    async fn shape(&self, shape: Shape) -> Handle {
        let (handle, _) = self.cache.get_or_create(shape).await.unwrap();
        self.cache
            .wait_until_active(&handle, Duration::from_secs(5))
            .await
            .unwrap();
        handle
    }

    async fn commit(&mut self, xid: u64, lsn: u64, changes: Vec<WalMessage>) {
        self.collector.process(WalMessage::Begin {
            xid,
            final_lsn: lsn,
        });
        for change in changes {
            self.collector.process(change);
        }
        let dropped = self.collector.process(WalMessage::Commit {
            commit_lsn: lsn,
            end_lsn: lsn + 1,
        });
        assert!(dropped.is_empty());
    }

    /// Wait until the shape's published offset reaches `offset`
    async fn wait_for(&self, handle: &Handle, offset: LogOffset) {
        let entry = self.cache.entry(handle).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let changed = entry.changed();
                tokio::pin!(changed);
                changed.as_mut().enable();
                if entry.latest_offset() >= offset {
                    return;
                }
                changed.await;
            }
        })
        .await
        .expect("offset not reached");
    }

    async fn log(&self, handle: &Handle) -> Vec<LogItem> {
        self.cache
            .storage()
            .get_log_since(handle, LogOffset::FIRST)
            .await
            .unwrap()
    }
}

fn insert(row: Row) -> WalMessage {
    WalMessage::Insert {
        relation_id: USERS,
        new: row,
    }
}

#[tokio::test]
async fn test_snapshot_and_replication_splice() {
    let mut h = Harness::new("100:105:102", vec![user(1, "a", true)]);
    let handle = h.shape(Shape::new("public", "users")).await;

    // visible in the snapshot: already part of the initial rows
    h.commit(101, 1000, vec![insert(user(2, "b", true))]).await;
    // in progress at snapshot time: applied, and turns filtering off
    h.commit(102, 1100, vec![insert(user(3, "c", true))]).await;
    // below xmax, but filtering is off for good
    h.commit(103, 1200, vec![insert(user(4, "d", true))]).await;

    h.wait_for(&handle, LogOffset::new(1200, 0)).await;
    let log = h.log(&handle).await;
    let offsets: Vec<_> = log.iter().filter_map(LogItem::offset).collect();
    assert_eq!(offsets, vec![LogOffset::new(1100, 0), LogOffset::new(1200, 0)]);

    let stored = h.cache.storage().get_pg_snapshot(&handle).await.unwrap().unwrap();
    assert!(!stored.filter_txns);

    let (snapshot, xmin) = h.cache.storage().get_snapshot(&handle).await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(xmin, 100);
}

#[tokio::test]
async fn test_primary_key_change() {
    let mut h = Harness::new("1:1:", vec![user(1, "a", true)]);
    let shape = Shape::new("public", "users").with_predicate(Predicate::parse("active = true").unwrap());
    let handle = h.shape(shape).await;

    h.commit(
        5,
        2000,
        vec![WalMessage::Update {
            relation_id: USERS,
            old: Some(user(1, "a", true)),
            new: user(100, "a", true),
        }],
    )
    .await;

    h.wait_for(&handle, LogOffset::new(2000, 1)).await;
    let log = h.log(&handle).await;
    assert_eq!(log.len(), 2);

    let delete = log[0].as_change().unwrap();
    let insert = log[1].as_change().unwrap();
    assert_eq!(delete.operation(), Operation::Delete);
    assert_eq!(delete.offset, LogOffset::new(2000, 0));
    assert_eq!(
        delete.headers.key_change_to.as_deref(),
        Some(r#""public"."users"/"100""#)
    );
    assert_eq!(insert.operation(), Operation::Insert);
    assert_eq!(insert.offset, LogOffset::new(2000, 1));
    assert_eq!(
        insert.headers.key_change_from.as_deref(),
        Some(r#""public"."users"/"1""#)
    );
    assert_eq!(delete.headers.txids, Some(vec![5]));
    assert_eq!(delete.headers.txids, insert.headers.txids);
    assert!(insert.headers.last);
}

#[tokio::test]
async fn test_column_filtering_with_where() {
    let mut h = Harness::new("1:1:", Vec::new());
    let shape = Shape::new("public", "users")
        .with_columns(vec!["name".into(), "email".into()])
        .with_predicate(Predicate::parse("active = true").unwrap());
    let handle = h.shape(shape).await;

    h.commit(
        7,
        3000,
        vec![insert(user(1, "A", true)), insert(user(2, "B", false))],
    )
    .await;

    h.wait_for(&handle, LogOffset::new(3000, 0)).await;
    let log = h.log(&handle).await;
    assert_eq!(log.len(), 1);
    let item = log[0].as_change().unwrap();
    let keys: Vec<&str> = item.value.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["email", "id", "name"]);
}

#[tokio::test]
async fn test_truncate_removes_shape() {
    let mut h = Harness::new("1:1:", vec![user(1, "a", true)]);
    let handle = h.shape(Shape::new("public", "users")).await;
    let entry = h.cache.entry(&handle).unwrap();

    h.commit(
        9,
        4000,
        vec![WalMessage::Truncate {
            relation_ids: vec![USERS],
        }],
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while entry.state() != ShapeState::Deleted {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!h.cache.has_shape(&handle));
    assert!(!h.cache.storage().shape_exists(&handle).await);
}

#[tokio::test]
async fn test_dropped_column_invalidates_shape() {
    let mut h = Harness::new("1:1:", Vec::new());
    let shape = Shape::new("public", "users").with_columns(vec!["email".into()]);
    let handle = h.shape(shape).await;
    let entry = h.cache.entry(&handle).unwrap();

    let mut relation = users_relation();
    relation.columns.retain(|c| c.name != "email");
    h.collector.process(WalMessage::Relation(relation));

    tokio::time::timeout(Duration::from_secs(5), async {
        while entry.state() != ShapeState::Deleted {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!h.cache.has_shape(&handle));
}
