//! PostgreSQL logical replication wire protocol
//!
//! - [`client`]: replication connection, authentication, streaming
//! - [`decoder`]: pgoutput and `CopyData` frame decoding
//! - [`message`]: decoded message types
//! - [`scram`]: SCRAM-SHA-256 authentication

pub mod client;
pub mod decoder;
pub mod message;
pub mod scram;

pub use client::{ReplicationClient, ReplicationStream};
pub use decoder::{DecodeError, PgOutputDecoder};
pub use message::*;
pub use scram::{ScramError, ScramSha256};
