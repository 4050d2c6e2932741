//! PostgreSQL wire protocol client.
//!
//! Architecture:
//! - `buffer`: Message framing, outgoing and incoming
//! - `protocol`: Frontend message encoding and backend message parsing
//! - `scram`: SCRAM-SHA-256 authentication exchange
//! - `types` / `decode` / `registry`: Value model and OID-keyed decoders
//! - `connection`: Transport, TLS negotiation and typed message sends
//! - `statement`: Named prepared statements known to a connection
//! - `query`: One query's lifecycle over the extended or simple protocol
//! - `client`: Authentication and the per-connection query queue
//! - `pool`: Bounded pool of clients

pub mod buffer;
pub mod protocol;
pub mod scram;
pub mod types;
pub mod decode;
pub mod registry;
pub mod config;
pub mod connection;
pub mod statement;
pub mod query;
pub mod client;
pub mod pool;
pub mod error;

#[cfg(test)]
mod tests;

pub use client::{Client, ClientEvent};
pub use config::{Password, PasswordFile, PgConfig, PgPassFile, SslMode};
pub use connection::{BoxStream, CancelToken, Connection, Connector, TcpConnector};
pub use error::{DbError, PgError, PgResult};
pub use pool::{Pool, PoolConfig, PoolEvent, PooledClient};
pub use protocol::{FieldDescription, Format, TransactionStatus};
pub use query::{Query, QueryResult, Row, RowMode};
pub use registry::{TypeOverrides, TypeRegistry};
pub use types::{Oid, PgValue};
