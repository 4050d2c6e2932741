//! Error types for the PostgreSQL client.

use std::collections::HashMap;
use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

use super::scram::ScramError;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug, Error)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// SCRAM exchange failed.
    #[error("SASL: {0}")]
    Scram(#[from] ScramError),

    /// Server returned an error.
    #[error("{0}")]
    Db(Box<DbError>),

    /// Type conversion error.
    #[error("Type error: {0}")]
    Type(String),

    /// Invalid connection or pool configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS negotiation failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A statement name was reused with different text on the same connection.
    #[error("Prepared statements must be unique - '{name}' was used for a different statement")]
    PreparedStatementConflict { name: String },

    /// The query was rejected before it reached the server.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The connection went away while queries were queued or running.
    #[error("Connection terminated{}", .0.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    ConnectionTerminated(Option<String>),

    /// Connection is closed or in invalid state.
    #[error("Client was closed and is not queryable")]
    ConnectionClosed,

    /// Query did not complete within the configured query timeout.
    #[error("Query read timeout")]
    QueryTimeout,

    /// Connection could not be established (or acquired) in time.
    #[error("timeout exceeded when trying to connect")]
    ConnectTimeout,

    /// Pool misuse.
    #[error("Pool error: {0}")]
    Pool(String),

    /// The pool was ended.
    #[error("Cannot use a pool after calling end on the pool")]
    PoolEnded,
}

impl PgError {
    /// SQLSTATE code for errors reported by the server.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Db(e) => Some(&e.code),
            _ => None,
        }
    }

    /// The backend error, if this is one.
    pub fn as_db_error(&self) -> Option<&DbError> {
        match self {
            PgError::Db(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Io(_)
                | PgError::Protocol(_)
                | PgError::ConnectionTerminated(_)
                | PgError::ConnectionClosed
        )
    }

    /// Rebuild an error for fan-out to several waiters.
    ///
    /// `io::Error` is not `Clone`, so I/O errors collapse to their message.
    pub(crate) fn duplicate(&self) -> PgError {
        match self {
            PgError::Io(e) => PgError::Io(io::Error::new(e.kind(), e.to_string())),
            PgError::Protocol(m) => PgError::Protocol(m.clone()),
            PgError::Auth(m) => PgError::Auth(m.clone()),
            PgError::Scram(e) => PgError::Scram(e.clone()),
            PgError::Db(e) => PgError::Db(e.clone()),
            PgError::Type(m) => PgError::Type(m.clone()),
            PgError::Config(m) => PgError::Config(m.clone()),
            PgError::Tls(m) => PgError::Tls(m.clone()),
            PgError::PreparedStatementConflict { name } => {
                PgError::PreparedStatementConflict { name: name.clone() }
            }
            PgError::InvalidQuery(m) => PgError::InvalidQuery(m.clone()),
            PgError::ConnectionTerminated(c) => PgError::ConnectionTerminated(c.clone()),
            PgError::ConnectionClosed => PgError::ConnectionClosed,
            PgError::QueryTimeout => PgError::QueryTimeout,
            PgError::ConnectTimeout => PgError::ConnectTimeout,
            PgError::Pool(m) => PgError::Pool(m.clone()),
            PgError::PoolEnded => PgError::PoolEnded,
        }
    }
}

impl From<DbError> for PgError {
    fn from(e: DbError) -> Self {
        PgError::Db(Box::new(e))
    }
}

/// Diagnostic fields of an ErrorResponse or NoticeResponse.
///
/// Reference: https://www.postgresql.org/docs/current/protocol-error-fields.html
///
/// Serializes to a JSON object with absent fields omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DbError {
    pub severity: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_position: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#where: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routine: Option<String>,
}

impl DbError {
    /// Build from the raw `{code byte -> value}` field map.
    pub fn from_fields(mut fields: HashMap<u8, String>) -> Self {
        // Non-localized severity ('V') wins over the localized one when present.
        let severity = fields
            .remove(&b'V')
            .or_else(|| fields.remove(&b'S'))
            .unwrap_or_default();

        Self {
            severity,
            code: fields.remove(&b'C').unwrap_or_default(),
            message: fields.remove(&b'M').unwrap_or_default(),
            detail: fields.remove(&b'D'),
            hint: fields.remove(&b'H'),
            position: fields.remove(&b'P'),
            internal_position: fields.remove(&b'p'),
            internal_query: fields.remove(&b'q'),
            r#where: fields.remove(&b'W'),
            schema: fields.remove(&b's'),
            table: fields.remove(&b't'),
            column: fields.remove(&b'c'),
            data_type: fields.remove(&b'd'),
            constraint: fields.remove(&b'n'),
            file: fields.remove(&b'F'),
            line: fields.remove(&b'L'),
            routine: fields.remove(&b'R'),
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for DbError {}
