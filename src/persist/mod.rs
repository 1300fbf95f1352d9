//! Ledger sink abstraction.

/// SQLite-backed ledger sink.
pub mod sqlite;

use thiserror::Error;

use crate::{
    core::store::{StoreError, StoreSnapshotV1},
    op::StoredOp,
    types::OpSeq,
};

/// Failures raised while writing or reading the ledger.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite driver failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Payload (de)serialization failure.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Replay rejected by the store.
    #[error("replay: {0}")]
    Store(#[from] StoreError),
    /// Any other failure.
    #[error("{0}")]
    Message(String),
}

/// Result alias for persistence calls.
pub type PersistResult<T> = Result<T, PersistError>;

/// Destination for committed ops. Implementations run on a blocking worker.
pub trait OpSink: Send {
    /// Appends ops in sequence order and returns the highest durable sequence.
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq>;

    /// Forces buffered writes down.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }

    /// Stores a snapshot that covers everything up to `last_seq`.
    fn write_snapshot(&mut self, _snapshot: &StoreSnapshotV1, _last_seq: OpSeq) -> PersistResult<()> {
        Ok(())
    }

    /// Drops journal rows up to and including `seq`.
    fn compact_through(&mut self, _seq: OpSeq) -> PersistResult<usize> {
        Ok(0)
    }
}
