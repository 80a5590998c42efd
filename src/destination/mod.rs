// ABOUTME: Destination abstraction for idempotent batch writes
// ABOUTME: Classifies write failures as transient (retry) or permanent (dead-letter)

pub mod postgres;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tosh_capture::QueueEntry;

pub use postgres::PostgresDestination;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// Expected to succeed later without changing the record
    Transient,
    /// The record itself must change before it can be written
    Permanent,
}

impl fmt::Display for WriteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteErrorKind::Transient => write!(f, "transient"),
            WriteErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} write failure: {message}")]
pub struct WriteError {
    pub kind: WriteErrorKind,
    pub message: String,
}

impl WriteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: WriteErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: WriteErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == WriteErrorKind::Permanent
    }

    /// Classify an error chain, looking for a PostgreSQL error inside it.
    /// Anything else (I/O, TLS, timeouts) is transient.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let kind = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<tokio_postgres::Error>())
            .map(classify_pg_error)
            .unwrap_or(WriteErrorKind::Transient);
        Self {
            kind,
            message: format!("{err:#}"),
        }
    }
}

/// Store receiving change records.
///
/// A write of `entries` must be atomic and keyed by
/// `(source_name, source_record_id)` so that redelivery is a no-op.
#[async_trait]
pub trait Destination: Send + Sync {
    /// One-time setup before the first write (schema, tables).
    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn write_batch(&self, source_name: &str, entries: &[QueueEntry])
        -> Result<(), WriteError>;
}

/// Map a PostgreSQL error to a retry decision by SQLSTATE.
///
/// Errors without a SQLSTATE come from the client side (closed connection,
/// I/O, timeout) and are transient.
pub fn classify_pg_error(err: &tokio_postgres::Error) -> WriteErrorKind {
    match err.code() {
        Some(state) => classify_sqlstate(state.code()),
        None => WriteErrorKind::Transient,
    }
}

pub fn classify_sqlstate(code: &str) -> WriteErrorKind {
    match code {
        "55P03" | "55006" => return WriteErrorKind::Transient,
        _ => {}
    }
    match code.get(..2) {
        // data exception, integrity constraint violation, WITH CHECK OPTION
        Some("22") | Some("23") | Some("44") => WriteErrorKind::Permanent,
        // connection, rollback (serialization/deadlock), resources,
        // operator intervention, system errors and anything unknown
        _ => WriteErrorKind::Transient,
    }
}
