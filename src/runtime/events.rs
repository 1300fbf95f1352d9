//! Runtime event stream payloads.

use crate::{
    op::Op,
    types::{EntryId, Identity, OpSeq},
};

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiaryEvent {
    /// A new entry was created.
    Created {
        /// Created entry id.
        id: EntryId,
        /// Owner of the entry.
        creator: Identity,
    },
    /// An entry's mutable fields were replaced.
    Updated {
        /// Updated entry id.
        id: EntryId,
    },
    /// An entry was deleted.
    Deleted {
        /// Deleted entry id.
        id: EntryId,
    },
    /// An identity gained explicit read access.
    AccessGranted {
        /// Target entry.
        id: EntryId,
        /// Grantee.
        identity: Identity,
    },
    /// An identity lost explicit read access.
    AccessRevoked {
        /// Target entry.
        id: EntryId,
        /// Former grantee.
        identity: Identity,
    },
    /// Persistence has reached at least this op sequence.
    DurableUpTo {
        /// Highest sequence known durable.
        op_seq: OpSeq,
    },
}

impl DiaryEvent {
    /// Event announcing a committed op.
    pub fn from_op(op: &Op) -> Self {
        match op {
            Op::Create { entry } => Self::Created {
                id: entry.id,
                creator: entry.creator.clone(),
            },
            Op::Update { id, .. } => Self::Updated { id: *id },
            Op::Delete { id } => Self::Deleted { id: *id },
            Op::Grant { id, identity } => Self::AccessGranted {
                id: *id,
                identity: identity.clone(),
            },
            Op::Revoke { id, identity } => Self::AccessRevoked {
                id: *id,
                identity: identity.clone(),
            },
        }
    }
}
