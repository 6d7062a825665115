//! Shape reads and long polling
//!
//! The [`Reader`] resolves a request to a shape handle (creating the shape
//! on first use), reads the log from the requested offset and, for live
//! requests that are caught up, parks until the shape's offset moves or the
//! long-poll timeout expires. [`ReadResponse`] carries everything the HTTP
//! layer needs to render headers and body.

use crate::cache::{gone_error, ShapeCache, ShapeState};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::log_item::{encode_items, LogItem};
use crate::offset::LogOffset;
use crate::shape::Shape;
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const HEADER_HANDLE: &str = "electric-handle";
pub const HEADER_OFFSET: &str = "electric-offset";
pub const HEADER_SCHEMA: &str = "electric-schema";
pub const HEADER_UP_TO_DATE: &str = "electric-up-to-date";
pub const HEADER_CURSOR: &str = "electric-cursor";

/// Headers a shape-gone response must not carry
pub const ELECTRIC_HEADERS: &[&str] = &[
    HEADER_HANDLE,
    HEADER_OFFSET,
    HEADER_SCHEMA,
    HEADER_UP_TO_DATE,
    HEADER_CURSOR,
];

/// Reader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub long_poll_timeout: Duration,
    /// `max-age` in seconds for responses carrying items
    pub max_age: u64,
    /// `stale-while-revalidate` in seconds for non-initial responses
    pub stale_age: u64,
    /// Bound on waiting for a new shape's snapshot
    pub snapshot_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout: Duration::from_secs(20),
            max_age: 604_800,
            stale_age: 300,
            snapshot_timeout: Duration::from_secs(60),
        }
    }
}

impl ReaderConfig {
    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    pub fn with_max_age(mut self, secs: u64) -> Self {
        self.max_age = secs;
        self
    }

    pub fn with_stale_age(mut self, secs: u64) -> Self {
        self.stale_age = secs;
        self
    }

    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }
}

/// A parsed shape read
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub handle: Option<Handle>,
    pub shape: Option<Shape>,
    pub offset: LogOffset,
    pub live: bool,
    /// Echoed by clients; only used for logging
    pub cursor: Option<String>,
}

impl ReadRequest {
    pub fn new(shape: Shape) -> Self {
        Self {
            handle: None,
            shape: Some(shape),
            offset: LogOffset::BeforeAll,
            live: false,
            cursor: None,
        }
    }

    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_offset(mut self, offset: LogOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }
}

/// Result of a shape read
#[derive(Debug, Clone)]
pub struct ReadResponse {
    pub handle: Handle,
    /// Offset to resume from
    pub offset: LogOffset,
    pub items: Vec<LogItem>,
    /// `electric-schema` value on initial reads
    pub schema: Option<String>,
    pub up_to_date: bool,
    pub cursor: Option<String>,
    pub etag: String,
    pub cache_control: String,
}

impl ReadResponse {
    /// Response headers in emission order
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_HANDLE, self.handle.to_string()),
            (HEADER_OFFSET, self.offset.to_string()),
        ];
        if let Some(schema) = &self.schema {
            headers.push((HEADER_SCHEMA, schema.clone()));
        }
        if self.up_to_date {
            headers.push((HEADER_UP_TO_DATE, "true".to_string()));
        }
        if let Some(cursor) = &self.cursor {
            headers.push((HEADER_CURSOR, cursor.clone()));
        }
        headers.push(("etag", self.etag.clone()));
        headers.push(("cache-control", self.cache_control.clone()));
        headers
    }

    /// JSON array body
    pub fn body(&self) -> Result<Vec<u8>> {
        encode_items(&self.items)
    }
}

/// Serves shape reads from the cache and storage
#[derive(Clone)]
pub struct Reader {
    cache: ShapeCache,
    config: ReaderConfig,
}

impl Reader {
    pub fn new(cache: ShapeCache, config: ReaderConfig) -> Self {
        Self { cache, config }
    }

    pub fn cache(&self) -> &ShapeCache {
        &self.cache
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    fn storage(&self) -> &Storage {
        self.cache.storage()
    }

    pub async fn read(&self, request: ReadRequest) -> Result<ReadResponse> {
        let handle = self.resolve(&request).await?;
        self.cache
            .wait_until_active(&handle, self.config.snapshot_timeout)
            .await?;

        let offset = request.offset;
        let (mut items, mut latest) = self.read_log(&handle, offset).await?;

        if items.is_empty() && request.live {
            debug!(handle = %handle, offset = %offset, cursor = ?request.cursor, "Long polling");
            (items, latest) = self.long_poll(&handle, offset).await?;
        }

        let current = self.storage().get_latest_offset(&handle).await.map_err(|e| gone(&handle, e))?;
        let up_to_date = current <= latest;

        let schema = if offset.is_before_all() {
            self.storage()
                .get_schema(&handle)
                .await
                .ok()
                .map(|s| s.header())
        } else {
            None
        };

        let cursor = (request.live && up_to_date).then(|| cursor_for(&handle, latest));
        let etag = etag_for(&handle, latest, items.len());
        let cache_control = self.cache_control(offset, &items, up_to_date);

        Ok(ReadResponse {
            handle,
            offset: latest,
            items,
            schema,
            up_to_date,
            cursor,
            etag,
            cache_control,
        })
    }

    /// Handle to read from; a handle that is unknown, deleted or of another
    /// shape definition is gone
    async fn resolve(&self, request: &ReadRequest) -> Result<Handle> {
        match (&request.handle, &request.shape) {
            (Some(handle), shape) => {
                let entry = self
                    .cache
                    .entry(handle)
                    .ok_or_else(|| Error::ShapeGone(handle.to_string()))?;
                if entry.state() == ShapeState::Deleted {
                    return Err(gone_error(&entry));
                }
                if let Some(shape) = shape {
                    if shape.hash() != handle.hash() {
                        return Err(Error::ShapeGone(format!(
                            "{handle} does not match the requested shape"
                        )));
                    }
                }
                Ok(handle.clone())
            }
            (None, Some(shape)) => {
                let (handle, _) = self.cache.get_or_create(shape.clone()).await?;
                Ok(handle)
            }
            (None, None) => Err(Error::InvalidShape("table is required".to_string())),
        }
    }

    /// Items after `offset` and the offset to resume from.
    ///
    /// The resume offset is the last log item returned, or the latest offset
    /// observed before reading when no log item was returned, so a response
    /// never skips an item appended concurrently.
    async fn read_log(&self, handle: &Handle, offset: LogOffset) -> Result<(Vec<LogItem>, LogOffset)> {
        let storage = self.storage();
        let before = storage
            .get_latest_offset(handle)
            .await
            .map_err(|e| gone(handle, e))?;
        let items = storage
            .get_log_since(handle, offset)
            .await
            .map_err(|e| gone(handle, e))?;

        let last_logged = items
            .last()
            .and_then(LogItem::offset)
            .filter(|o| o.tx().is_some_and(|tx| tx > 0));
        let latest = match last_logged {
            Some(last) => last.max(before),
            None => before,
        };
        Ok((items, latest))
    }

    async fn long_poll(&self, handle: &Handle, offset: LogOffset) -> Result<(Vec<LogItem>, LogOffset)> {
        let entry = self
            .cache
            .entry(handle)
            .ok_or_else(|| Error::ShapeGone(handle.to_string()))?;
        let deadline = tokio::time::Instant::now() + self.config.long_poll_timeout;

        loop {
            let changed = entry.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if entry.state() == ShapeState::Deleted {
                return Err(gone_error(&entry));
            }
            if entry.latest_offset() > offset || offset.is_before_all() {
                let (items, latest) = self.read_log(handle, offset).await?;
                if !items.is_empty() {
                    return Ok((items, latest));
                }
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(handle = %handle, "Long poll timed out");
                    return self.read_log(handle, offset).await;
                }
            }
        }
    }

    fn cache_control(&self, offset: LogOffset, items: &[LogItem], up_to_date: bool) -> String {
        if up_to_date && items.is_empty() {
            "no-store".to_string()
        } else if !items.is_empty() && offset.is_before_all() {
            format!("public, max-age={}", self.config.max_age)
        } else if !items.is_empty() {
            format!(
                "public, max-age={}, stale-while-revalidate={}",
                self.config.max_age, self.config.stale_age
            )
        } else {
            "public, max-age=5".to_string()
        }
    }
}

/// Storage lookups of a removed shape fail with `ShapeNotFound`
fn gone(handle: &Handle, err: Error) -> Error {
    match err {
        Error::ShapeNotFound(_) | Error::SnapshotNotFound(_) => Error::ShapeGone(handle.to_string()),
        other => other,
    }
}

fn short_digest(input: &str) -> String {
    hex::encode(&Sha256::digest(input.as_bytes())[..8])
}

/// Opaque cursor over handle, offset and the current time
pub fn cursor_for(handle: &Handle, latest: LogOffset) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    short_digest(&format!("{handle}:{latest}:{nanos}"))
}

/// Quoted entity tag, stable for equal handle, offset and item count
pub fn etag_for(handle: &Handle, latest: LogOffset, count: usize) -> String {
    format!("\"{}\"", short_digest(&format!("{handle}:{latest}:{count}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::log_item::ChangeItem;
    use crate::schema::{Column, TableSchema};
    use crate::snapshot::MemorySource;
    use crate::storage::MemoryStorage;
    use crate::value::{Row, Value};
    use std::sync::Arc;

    fn reader(long_poll: Duration) -> Reader {
        let source = Arc::new(MemorySource::new());
        source.add_table(
            TableSchema::new(
                "public",
                "users",
                vec![
                    Column::new("id", "int4").with_pk_index(0),
                    Column::new("name", "text"),
                ],
            ),
            (1..=2)
                .map(|id| {
                    Row::from([
                        ("id".to_string(), Value::Int(id)),
                        ("name".to_string(), Value::from(format!("user{id}"))),
                    ])
                })
                .collect(),
        );
        let cache = ShapeCache::new(
            CacheConfig::default(),
            Arc::new(MemoryStorage::new()),
            source.clone(),
            source,
        );
        Reader::new(
            cache,
            ReaderConfig::default().with_long_poll_timeout(long_poll),
        )
    }

    fn users() -> Shape {
        Shape::new("public", "users")
    }

    fn log_item(tx: u64) -> LogItem {
        ChangeItem::insert(
            LogOffset::new(tx, 0),
            format!("\"public\".\"users\"/\"{tx}\""),
            Default::default(),
        )
        .into()
    }

    #[tokio::test]
    async fn test_initial_read() {
        let reader = reader(Duration::from_millis(50));
        let resp = reader.read(ReadRequest::new(users())).await.unwrap();
        assert_eq!(resp.items.len(), 2);
        assert_eq!(resp.offset, LogOffset::FIRST);
        assert!(resp.schema.is_some());
        assert!(resp.up_to_date);
        assert!(resp.cursor.is_none());
        assert_eq!(resp.cache_control, "public, max-age=604800");
        assert!(resp.etag.starts_with('"'));

        let names: Vec<&str> = resp.headers().iter().map(|(k, _)| *k).collect();
        assert!(names.contains(&HEADER_SCHEMA));
    }

    #[tokio::test]
    async fn test_read_from_offset() {
        let reader = reader(Duration::from_millis(50));
        let handle = reader.read(ReadRequest::new(users())).await.unwrap().handle;
        reader
            .cache()
            .storage()
            .append_to_log(&handle, vec![log_item(10)])
            .await
            .unwrap();

        let resp = reader
            .read(
                ReadRequest::new(users())
                    .with_handle(handle)
                    .with_offset(LogOffset::FIRST),
            )
            .await
            .unwrap();
        assert_eq!(resp.items.len(), 1);
        assert_eq!(resp.offset, LogOffset::new(10, 0));
        assert!(resp.schema.is_none());
        assert_eq!(
            resp.cache_control,
            "public, max-age=604800, stale-while-revalidate=300"
        );
    }

    #[tokio::test]
    async fn test_offset_without_handle_resolves_shape() {
        let reader = reader(Duration::from_millis(50));

        // a new shape is created and read from the offset
        let resp = reader
            .read(ReadRequest::new(users()).with_offset(LogOffset::FIRST))
            .await
            .unwrap();
        assert!(resp.items.is_empty());
        assert!(resp.schema.is_none());
        let handle = resp.handle;

        reader
            .cache()
            .storage()
            .append_to_log(&handle, vec![log_item(10)])
            .await
            .unwrap();

        let resp = reader
            .read(ReadRequest::new(users()).with_offset(LogOffset::FIRST))
            .await
            .unwrap();
        assert_eq!(resp.handle, handle);
        assert_eq!(resp.items.len(), 1);
        assert_eq!(resp.offset, LogOffset::new(10, 0));
    }

    #[tokio::test]
    async fn test_long_poll_timeout() {
        let reader = reader(Duration::from_millis(100));
        let handle = reader.read(ReadRequest::new(users())).await.unwrap().handle;

        let started = std::time::Instant::now();
        let resp = reader
            .read(
                ReadRequest::new(users())
                    .with_handle(handle)
                    .with_offset(LogOffset::FIRST)
                    .with_live(true),
            )
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(resp.items.is_empty());
        assert!(resp.up_to_date);
        assert!(resp.cursor.is_some());
        assert_eq!(resp.cache_control, "no-store");
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_append() {
        let reader = reader(Duration::from_secs(10));
        let handle = reader.read(ReadRequest::new(users())).await.unwrap().handle;

        let writer = reader.clone();
        let h = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer
                .cache()
                .storage()
                .append_to_log(&h, vec![log_item(7)])
                .await
                .unwrap();
            writer.cache().update_offset(&h, LogOffset::new(7, 0));
        });

        let resp = reader
            .read(
                ReadRequest::new(users())
                    .with_handle(handle)
                    .with_offset(LogOffset::FIRST)
                    .with_live(true),
            )
            .await
            .unwrap();
        assert_eq!(resp.items.len(), 1);
        assert_eq!(resp.offset, LogOffset::new(7, 0));
    }

    #[tokio::test]
    async fn test_long_poll_released_on_remove() {
        let reader = reader(Duration::from_secs(10));
        let handle = reader.read(ReadRequest::new(users())).await.unwrap().handle;

        let cache = reader.cache().clone();
        let h = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cache.remove(&h).await.unwrap();
        });

        let err = reader
            .read(
                ReadRequest::new(users())
                    .with_handle(handle)
                    .with_offset(LogOffset::FIRST)
                    .with_live(true),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShapeGone(_)));
    }

    #[tokio::test]
    async fn test_unknown_or_mismatched_handle_is_gone() {
        let reader = reader(Duration::from_millis(50));
        let unknown = Handle::parse("0123456789abcdef-1").unwrap();
        let err = reader
            .read(ReadRequest::new(users()).with_handle(unknown))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 409);

        let handle = reader.read(ReadRequest::new(users())).await.unwrap().handle;
        let other = Shape::new("public", "users").with_columns(vec!["name".into()]);
        let err = reader
            .read(ReadRequest::new(other).with_handle(handle))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShapeGone(_)));
    }

    #[test]
    fn test_etag_is_stable() {
        let h = Handle::with_timestamp("0123456789abcdef", 1);
        let a = etag_for(&h, LogOffset::new(1, 0), 3);
        assert_eq!(a, etag_for(&h, LogOffset::new(1, 0), 3));
        assert_ne!(a, etag_for(&h, LogOffset::new(1, 0), 4));
        assert_eq!(cursor_for(&h, LogOffset::FIRST).len(), 16);
    }
}
