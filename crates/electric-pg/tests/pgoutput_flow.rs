//! pgoutput to shape log
//!
//! Builds raw `CopyData` payloads the way the server sends them, runs them
//! through the frame decoder, the pgoutput decoder and the converter, and
//! checks what a shape consumer appends. No database required.

use bytes::{BufMut, Bytes, BytesMut};
use electric_core::{
    CacheConfig, Collector, Column, Handle, LogItem, LogOffset, MemorySource, MemoryStorage,
    Operation, PgSnapshot, Shape, ShapeCache, TableSchema,
};
use electric_pg::protocol::{PgOutputDecoder, ReplicationFrame};
use electric_pg::WalConverter;
use std::sync::Arc;
use std::time::Duration;

const USERS: u32 = 16384;

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[Option<&str>]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            Some(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            None => buf.put_u8(b'n'),
        }
    }
}

/// Wrap a pgoutput message in an XLogData frame
fn xlog(lsn: u64, message: BytesMut) -> Bytes {
    let mut frame = BytesMut::new();
    frame.put_u8(b'w');
    frame.put_u64(lsn);
    frame.put_u64(lsn);
    frame.put_i64(0);
    frame.put_slice(&message);
    frame.freeze()
}

fn relation() -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(USERS);
    put_string(&mut buf, "public");
    put_string(&mut buf, "users");
    buf.put_u8(b'f');
    buf.put_u16(3);
    for (flags, name, oid) in [(1u8, "id", 23u32), (0, "name", 25), (0, "active", 16)] {
        buf.put_u8(flags);
        put_string(&mut buf, name);
        buf.put_u32(oid);
        buf.put_i32(-1);
    }
    buf
}

fn begin(final_lsn: u64, xid: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(b'B');
    buf.put_u64(final_lsn);
    buf.put_i64(0);
    buf.put_u32(xid);
    buf
}

fn commit(lsn: u64) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(b'C');
    buf.put_u8(0);
    buf.put_u64(lsn);
    buf.put_u64(lsn + 8);
    buf.put_i64(0);
    buf
}

fn insert(values: &[Option<&str>]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(b'I');
    buf.put_u32(USERS);
    buf.put_u8(b'N');
    put_tuple(&mut buf, values);
    buf
}

fn update(old: &[Option<&str>], new: &[Option<&str>]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(b'U');
    buf.put_u32(USERS);
    buf.put_u8(b'O');
    put_tuple(&mut buf, old);
    buf.put_u8(b'N');
    put_tuple(&mut buf, new);
    buf
}

fn truncate() -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(b'T');
    buf.put_u32(1);
    buf.put_u8(0);
    buf.put_u32(USERS);
    buf
}

struct Stream {
    cache: ShapeCache,
    converter: WalConverter,
    collector: Collector,
}

impl Stream {
    fn new() -> Self {
        let source = Arc::new(MemorySource::new());
        source.add_table(
            TableSchema::new(
                "public",
                "users",
                vec![
                    Column::new("id", "int4").with_pk_index(0),
                    Column::new("name", "text"),
                    Column::new("active", "bool"),
                ],
            ),
            Vec::new(),
        );
        source.set_pg_snapshot(PgSnapshot::parse("10:10:").unwrap());
        let cache = ShapeCache::new(
            CacheConfig::default(),
            Arc::new(MemoryStorage::new()),
            source.clone(),
            source,
        );
        let collector = Collector::new(cache.dispatcher());
        Self {
            cache,
            converter: WalConverter::new(),
            collector,
        }
    }

    fn feed(&mut self, frame: Bytes) {
        let ReplicationFrame::XLogData { mut data, .. } =
            PgOutputDecoder::decode_frame(frame).unwrap()
        else {
            panic!("expected XLogData");
        };
        let message = PgOutputDecoder::decode(&mut data).unwrap();
        if let Some(wal) = self.converter.convert(message).unwrap() {
            assert!(self.collector.process(wal).is_empty());
        }
    }

    async fn shape(&self, shape: Shape) -> Handle {
        let (handle, _) = self.cache.get_or_create(shape).await.unwrap();
        self.cache
            .wait_until_active(&handle, Duration::from_secs(5))
            .await
            .unwrap();
        handle
    }

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

#[tokio::test]
async fn test_insert_and_update_reach_shape_log() {
    let mut stream = Stream::new();
    let handle = stream.shape(Shape::new("public", "users")).await;

    stream.feed(xlog(0x100, relation()));
    stream.feed(xlog(0x100, begin(0x200, 20)));
    stream.feed(xlog(0x100, insert(&[Some("1"), Some("ada"), Some("t")])));
    stream.feed(xlog(0x200, commit(0x200)));

    stream.feed(xlog(0x300, begin(0x300, 21)));
    stream.feed(xlog(
        0x300,
        update(
            &[Some("1"), Some("ada"), Some("t")],
            &[Some("1"), Some("ada lovelace"), Some("t")],
        ),
    ));
    stream.feed(xlog(0x300, commit(0x300)));

    stream.wait_for(&handle, LogOffset::new(0x300, 0)).await;
    let log = stream.log(&handle).await;
    assert_eq!(log.len(), 2);

    let first = log[0].as_change().unwrap();
    assert_eq!(first.operation(), Operation::Insert);
    assert_eq!(first.offset, LogOffset::new(0x200, 0));
    assert_eq!(first.key, r#""public"."users"/"1""#);
    assert_eq!(first.value["name"], "ada");

    let second = log[1].as_change().unwrap();
    assert_eq!(second.operation(), Operation::Update);
    assert_eq!(second.value["name"], "ada lovelace");
    assert_eq!(stream.collector.confirmed_lsn(), 0x308);
}

#[tokio::test]
async fn test_null_column_and_where_clause() {
    let mut stream = Stream::new();
    let shape = Shape::new("public", "users")
        .with_predicate(electric_core::Predicate::parse("active = true").unwrap());
    let handle = stream.shape(shape).await;

    stream.feed(xlog(0x100, relation()));
    stream.feed(xlog(0x100, begin(0x200, 20)));
    stream.feed(xlog(0x100, insert(&[Some("1"), None, Some("f")])));
    stream.feed(xlog(0x100, insert(&[Some("2"), None, Some("t")])));
    stream.feed(xlog(0x200, commit(0x200)));

    stream.wait_for(&handle, LogOffset::new(0x200, 0)).await;
    let log = stream.log(&handle).await;
    assert_eq!(log.len(), 1);
    let change = log[0].as_change().unwrap();
    assert_eq!(change.key, r#""public"."users"/"2""#);
    assert!(!change.value.contains_key("name"));
}

#[tokio::test]
async fn test_truncate_removes_shape() {
    let mut stream = Stream::new();
    let handle = stream.shape(Shape::new("public", "users")).await;

    stream.feed(xlog(0x100, relation()));
    stream.feed(xlog(0x100, begin(0x200, 20)));
    stream.feed(xlog(0x100, truncate()));
    stream.feed(xlog(0x200, commit(0x200)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while stream.cache.has_shape(&handle) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("shape not removed");
}

#[test]
fn test_keepalive_frame() {
    let mut frame = BytesMut::new();
    frame.put_u8(b'k');
    frame.put_u64(0x500);
    frame.put_i64(0);
    frame.put_u8(1);

    let frame = PgOutputDecoder::decode_frame(frame.freeze()).unwrap();
    assert_eq!(
        frame,
        ReplicationFrame::PrimaryKeepAlive {
            wal_end: 0x500,
            timestamp: 0,
            reply_requested: true,
        }
    );
}
