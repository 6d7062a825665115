//! # electricd
//!
//! HTTP sync service for PostgreSQL shapes.
//!
//! ## Components
//!
//! - [`config`]: environment configuration and validation
//! - [`server`]: axum router, request ids, CORS, panic recovery
//! - [`auth`]: shared-secret check for the shape API
//! - [`error`]: `{error, message}` rendering of handler failures
//!
//! ## Example
//!
//! ```rust,ignore
//! use electric_core::{CacheConfig, MemorySource, MemoryStorage, Reader, ReaderConfig, ShapeCache};
//! use electricd::ShapeServer;
//! use std::sync::Arc;
//!
//! let source = Arc::new(MemorySource::new());
//! let cache = ShapeCache::new(
//!     CacheConfig::default(),
//!     Arc::new(MemoryStorage::new()),
//!     source.clone(),
//!     source,
//! );
//! let app = ShapeServer::new(Reader::new(cache, ReaderConfig::default())).router();
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod server;

pub use auth::SecretAuth;
pub use config::{Config, ConfigError, StorageKind};
pub use error::{ApiError, ApiResult};
pub use server::{ShapeServer, ShapeQuery, SERVER_VERSION};
