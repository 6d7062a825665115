//! # Electric Shape Engine
//!
//! Partial replication of PostgreSQL tables to HTTP clients. A client
//! subscribes to a *shape* (a table, an optional WHERE clause, an optional
//! column selection and a replica mode) and receives an initial snapshot
//! followed by an ordered, resumable log of changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Reader (long poll, caching headers, shape-gone detection)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ShapeCache (dedup by hash, state machine, notifications)   │
//! │  └── Consumer per shape                                     │
//! │      ├── initial snapshot (SnapshotExecutor, PgSnapshot)    │
//! │      └── ChangeFilter (Predicate, projection, replica mode) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Collector / Dispatcher (transactions -> consumer queues)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Storage                                                    │
//! │  ├── Memory                                                 │
//! │  └── File (per-shape directory, JSON lines)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! This crate performs no PostgreSQL I/O. The database side (snapshot
//! queries, catalog, logical replication) plugs in through
//! [`SnapshotExecutor`], [`Catalog`] and [`WalMessage`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use electric_core::{CacheConfig, MemorySource, MemoryStorage, ReadRequest, Reader,
//!     ReaderConfig, Shape, ShapeCache};
//! use std::sync::Arc;
//!
//! let source = Arc::new(MemorySource::new());
//! let cache = ShapeCache::new(
//!     CacheConfig::default(),
//!     Arc::new(MemoryStorage::new()),
//!     source.clone(),
//!     source,
//! );
//! let reader = Reader::new(cache, ReaderConfig::default());
//! let response = reader.read(ReadRequest::new(Shape::new("public", "users"))).await?;
//! ```

pub mod cache;
pub mod chunker;
pub mod collector;
pub mod consumer;
pub mod error;
pub mod handle;
pub mod ident;
pub mod key;
pub mod log_item;
pub mod offset;
pub mod pg_snapshot;
pub mod predicate;
pub mod reader;
pub mod schema;
pub mod shape;
pub mod snapshot;
pub mod storage;
pub mod value;
pub mod wal;

// Re-exports for convenience
pub use cache::{CacheConfig, ShapeCache, ShapeEntry, ShapeInfo, ShapeState};
pub use chunker::{ChunkBoundary, Chunker, DEFAULT_CHUNK_THRESHOLD};
pub use collector::{Collector, Dispatcher, DEFAULT_CONSUMER_BUFFER};
pub use consumer::{ChangeFilter, Consumer};
pub use error::{Error, ErrorCategory, Result};
pub use handle::{Handle, HandleClock, HandleError};
pub use key::{build_key, parse_key, KeyParts};
pub use log_item::{ChangeItem, Control, LogItem, Operation, ValueMap};
pub use offset::LogOffset;
pub use pg_snapshot::PgSnapshot;
pub use predicate::Predicate;
pub use reader::{ReadRequest, ReadResponse, Reader, ReaderConfig};
pub use schema::{Column, TableSchema};
pub use shape::{ReplicaMode, Shape, ShapeParams};
pub use snapshot::{Catalog, MemorySource, SnapshotExecutor, SnapshotResult};
pub use storage::{create_storage, FileStorage, MemoryStorage, Storage, StorageBackend, StorageConfig};
pub use value::{Row, Value};
pub use wal::{Change, ChangeKind, ConsumerEvent, Relation, RelationColumn, Transaction, WalMessage};
