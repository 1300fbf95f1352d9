//! Mutation operation model and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    entry::{Entry, EntryDraft},
    types::{EntryId, Identity, OpSeq, Timestamp},
};

/// Version number for serialized [`StoredOpEnvelope`] payloads.
pub const OP_FORMAT_VERSION: u16 = 1;

/// Immutable operation appended to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Create a fully materialized entry.
    Create {
        /// Created record, including its allocated id.
        entry: Entry,
    },
    /// Replace all mutable fields of an entry.
    Update {
        /// Entry id to mutate.
        id: EntryId,
        /// New field values.
        fields: EntryDraft,
        /// Field values before the update.
        prev: EntryDraft,
    },
    /// Remove an entry with its access list and index slot.
    Delete {
        /// Entry id to remove.
        id: EntryId,
    },
    /// Add an identity to an entry's access list.
    Grant {
        /// Target entry.
        id: EntryId,
        /// Identity granted read access.
        identity: Identity,
    },
    /// Remove an identity from an entry's access list.
    Revoke {
        /// Target entry.
        id: EntryId,
        /// Identity whose access is removed.
        identity: Identity,
    },
}

impl Op {
    /// Entry touched by this op.
    pub fn entry_id(&self) -> EntryId {
        match self {
            Op::Create { entry } => entry.id,
            Op::Update { id, .. }
            | Op::Delete { id }
            | Op::Grant { id, .. }
            | Op::Revoke { id, .. } => *id,
        }
    }

    /// Stable numeric tag used as the journal `kind` column.
    pub fn kind(&self) -> i64 {
        match self {
            Op::Create { .. } => 1,
            Op::Update { .. } => 2,
            Op::Delete { .. } => 3,
            Op::Grant { .. } => 4,
            Op::Revoke { .. } => 5,
        }
    }
}

/// Ledger row metadata plus operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOp {
    /// Monotonic operation sequence.
    pub seq: OpSeq,
    /// Commit time in milliseconds.
    pub ts_ms: Timestamp,
    /// Authenticated identity that issued the op.
    pub caller: Identity,
    /// Operation body.
    pub op: Op,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOpEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped operation.
    pub stored: StoredOp,
}

impl StoredOpEnvelope {
    /// Constructs an envelope using [`OP_FORMAT_VERSION`].
    pub fn new(stored: StoredOp) -> Self {
        Self {
            format_version: OP_FORMAT_VERSION,
            stored,
        }
    }
}
