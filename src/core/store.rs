use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    entry::{Entry, EntryDraft},
    op::{Op, StoredOp},
    types::{EntryId, Identity, MicroDegrees, OpSeq, Timestamp},
};

use super::{
    access::{self, is_creator},
    indices::{AccessIndex, AccessList, MAX_ENTRIES_PER_USER, MAX_GRANTS_PER_ENTRY, UserEntries, UserIndex},
};

/// Failures surfaced by [`EntryStore`] operations. None of them leave a partial write behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Caller attempted a creator-only mutation on someone else's entry.
    #[error("{caller} is not the creator of entry {id}")]
    NotAuthorized {
        /// Target entry.
        id: EntryId,
        /// Rejected caller.
        caller: Identity,
    },
    /// Referenced entry has no record.
    #[error("entry {0} not found")]
    EntryNotFound(EntryId),
    /// Coordinate pair outside the valid range.
    #[error("coordinates out of range: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinates {
        /// Rejected latitude.
        latitude: MicroDegrees,
        /// Rejected longitude.
        longitude: MicroDegrees,
    },
    /// Caller lacks read permission on an existing entry.
    #[error("{caller} may not read entry {id}")]
    UnauthorizedAccess {
        /// Target entry.
        id: EntryId,
        /// Rejected caller.
        caller: Identity,
    },
    /// Text field longer than its bound.
    #[error("{field} is {actual} characters, limit is {max}")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Allowed length.
        max: usize,
        /// Supplied length.
        actual: usize,
    },
    /// A bounded index would overflow.
    #[error("{what} is full (capacity {capacity})")]
    CapacityExceeded {
        /// Which index overflowed.
        what: &'static str,
        /// Index bound.
        capacity: usize,
    },
    /// Replayed create collided with a live entry.
    #[error("entry {0} already exists")]
    AlreadyExists(EntryId),
    /// Snapshot or replay produced collections that disagree with each other.
    #[error("inconsistent store state: {0}")]
    Inconsistent(String),
}

/// Serializable image of every collection plus the allocators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshotV1 {
    /// Next identifier `create` will hand out.
    pub next_entry_id: EntryId,
    /// Next ledger sequence.
    pub next_op_seq: OpSeq,
    /// Live entries ordered by id.
    pub entries: Vec<Entry>,
    /// Per-owner id lists, sorted by owner.
    pub user_entries: Vec<(Identity, Vec<EntryId>)>,
    /// Per-entry grant lists, sorted by entry id.
    pub entry_access: Vec<(EntryId, Vec<Identity>)>,
}

/// A creator-side mutation, in the shape the runtime queues it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// See [`EntryStore::create`].
    Create {
        /// New entry fields.
        draft: EntryDraft,
        /// Substrate clock reading used as `created_at`.
        now: Timestamp,
    },
    /// See [`EntryStore::update`].
    Update {
        /// Target entry.
        id: EntryId,
        /// Replacement fields.
        fields: EntryDraft,
    },
    /// See [`EntryStore::delete`].
    Delete {
        /// Target entry.
        id: EntryId,
    },
    /// See [`EntryStore::grant`].
    Grant {
        /// Target entry.
        id: EntryId,
        /// Grantee.
        identity: Identity,
    },
    /// See [`EntryStore::revoke`].
    Revoke {
        /// Target entry.
        id: EntryId,
        /// Former grantee.
        identity: Identity,
    },
}

/// Authoritative entry store with its owner and access indexes.
///
/// Every public mutation validates first and commits second, so a returned
/// error means no collection changed.
#[derive(Debug, Default)]
pub struct EntryStore {
    entries: HashMap<EntryId, Entry>,
    user_entries: UserIndex,
    entry_access: AccessIndex,
    pending_ops: Vec<StoredOp>,
    next_op_seq: OpSeq,
    next_entry_id: EntryId,
}

impl EntryStore {
    /// Empty store; the first entry gets id 1.
    pub fn new() -> Self {
        Self {
            next_op_seq: 1,
            next_entry_id: 1,
            ..Self::default()
        }
    }

    /// Rebuilds a store and checks that its collections agree.
    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> Result<Self, StoreError> {
        let mut store = Self {
            next_entry_id: snapshot.next_entry_id,
            next_op_seq: snapshot.next_op_seq,
            ..Self::default()
        };

        for entry in snapshot.entries {
            let id = entry.id;
            if store.entries.insert(id, entry).is_some() {
                return Err(StoreError::AlreadyExists(id));
            }
        }

        for (owner, ids) in snapshot.user_entries {
            let list = UserEntries::from_vec(ids).map_err(|_| {
                StoreError::Inconsistent(format!("user index for {owner} exceeds {MAX_ENTRIES_PER_USER}"))
            })?;
            if store.user_entries.contains_key(&owner) {
                return Err(StoreError::Inconsistent(format!("user index for {owner} appears twice")));
            }
            store.user_entries.insert(owner, list);
        }

        for (id, grants) in snapshot.entry_access {
            let list = AccessList::from_vec(grants).map_err(|_| {
                StoreError::Inconsistent(format!("access list for {id} exceeds {MAX_GRANTS_PER_ENTRY}"))
            })?;
            if store.entry_access.insert(id, list).is_some() {
                return Err(StoreError::Inconsistent(format!("access list for {id} appears twice")));
            }
        }

        store.verify_consistency()?;
        Ok(store)
    }

    /// Captures all collections in a deterministic order.
    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        let mut entries: Vec<Entry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.id);

        let mut user_entries: Vec<(Identity, Vec<EntryId>)> = self
            .user_entries
            .iter()
            .map(|(owner, list)| (owner.clone(), list.as_slice().to_vec()))
            .collect();
        user_entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entry_access: Vec<(EntryId, Vec<Identity>)> = self
            .entry_access
            .iter()
            .map(|(id, list)| (*id, list.as_slice().to_vec()))
            .collect();
        entry_access.sort_by_key(|(id, _)| *id);

        StoreSnapshotV1 {
            next_entry_id: self.next_entry_id,
            next_op_seq: self.next_op_seq,
            entries,
            user_entries,
            entry_access,
        }
    }

    /// Creates an entry owned by `caller` and returns its new id.
    pub fn create(
        &mut self,
        caller: &Identity,
        draft: EntryDraft,
        now: Timestamp,
    ) -> Result<(EntryId, StoredOp), StoreError> {
        self.check_create(caller, &draft)?;

        let id = self.next_entry_id;
        let entry = draft.into_entry(id, caller.clone(), now);
        let seq = self.next_op_seq;
        let stored = self.apply_create_with_seq(entry, caller.clone(), seq)?;
        debug!(entry_id = id, caller = %caller, seq, "entry created");
        self.pending_ops.push(stored.clone());
        Ok((id, stored))
    }

    /// Returns the entry if `caller` may read it.
    pub fn get_entry(&self, id: EntryId, caller: &Identity) -> Result<&Entry, StoreError> {
        let entry = self.entries.get(&id).ok_or(StoreError::EntryNotFound(id))?;
        if !self.has_access(id, caller) {
            warn!(entry_id = id, caller = %caller, "read denied");
            return Err(StoreError::UnauthorizedAccess {
                id,
                caller: caller.clone(),
            });
        }
        Ok(entry)
    }

    /// Replaces every mutable field of an entry owned by `caller`.
    pub fn update(
        &mut self,
        caller: &Identity,
        id: EntryId,
        fields: EntryDraft,
    ) -> Result<StoredOp, StoreError> {
        self.check_update(caller, id, &fields)?;

        let seq = self.next_op_seq;
        let stored = self.apply_update_with_seq(id, fields, caller.clone(), seq)?;
        debug!(entry_id = id, caller = %caller, seq, "entry updated");
        self.pending_ops.push(stored.clone());
        Ok(stored)
    }

    /// Removes an entry owned by `caller` together with its index slots.
    pub fn delete(&mut self, caller: &Identity, id: EntryId) -> Result<StoredOp, StoreError> {
        self.owned_entry(id, caller)?;

        let seq = self.next_op_seq;
        let stored = self.apply_delete_with_seq(id, caller.clone(), seq)?;
        debug!(entry_id = id, caller = %caller, seq, "entry deleted");
        self.pending_ops.push(stored.clone());
        Ok(stored)
    }

    /// Grants `identity` read access. Returns `None` when it was already granted.
    pub fn grant(
        &mut self,
        caller: &Identity,
        id: EntryId,
        identity: Identity,
    ) -> Result<Option<StoredOp>, StoreError> {
        if !self.check_grant(caller, id, &identity)? {
            return Ok(None);
        }

        let seq = self.next_op_seq;
        let stored = self.apply_grant_with_seq(id, identity, caller.clone(), seq)?;
        debug!(entry_id = id, caller = %caller, seq, "access granted");
        self.pending_ops.push(stored.clone());
        Ok(Some(stored))
    }

    /// Revokes `identity`'s read access. Returns `None` when it had none.
    pub fn revoke(
        &mut self,
        caller: &Identity,
        id: EntryId,
        identity: Identity,
    ) -> Result<Option<StoredOp>, StoreError> {
        if !self.check_revoke(caller, id, &identity)? {
            return Ok(None);
        }

        let seq = self.next_op_seq;
        let stored = self.apply_revoke_with_seq(id, identity, caller.clone(), seq)?;
        debug!(entry_id = id, caller = %caller, seq, "access revoked");
        self.pending_ops.push(stored.clone());
        Ok(Some(stored))
    }

    /// Runs every check `mutation` would run without writing anything.
    ///
    /// `Ok(true)` means applying it will journal an op, `Ok(false)` means it
    /// will succeed as a no-op.
    pub fn preflight(&self, caller: &Identity, mutation: &Mutation) -> Result<bool, StoreError> {
        match mutation {
            Mutation::Create { draft, .. } => self.check_create(caller, draft).map(|()| true),
            Mutation::Update { id, fields } => self.check_update(caller, *id, fields).map(|()| true),
            Mutation::Delete { id } => self.owned_entry(*id, caller).map(|_| true),
            Mutation::Grant { id, identity } => self.check_grant(caller, *id, identity),
            Mutation::Revoke { id, identity } => self.check_revoke(caller, *id, identity),
        }
    }

    /// Applies `mutation` through the matching operation.
    ///
    /// Returns the journaled op, or `None` for an idempotent no-op.
    pub fn apply(&mut self, caller: &Identity, mutation: Mutation) -> Result<Option<StoredOp>, StoreError> {
        match mutation {
            Mutation::Create { draft, now } => self.create(caller, draft, now).map(|(_, op)| Some(op)),
            Mutation::Update { id, fields } => self.update(caller, id, fields).map(Some),
            Mutation::Delete { id } => self.delete(caller, id).map(Some),
            Mutation::Grant { id, identity } => self.grant(caller, id, identity),
            Mutation::Revoke { id, identity } => self.revoke(caller, id, identity),
        }
    }

    /// Never fails; false for unknown entries.
    pub fn check_access(&self, id: EntryId, identity: &Identity) -> bool {
        self.has_access(id, identity)
    }

    /// The single read-permission predicate for this store.
    pub fn has_access(&self, id: EntryId, identity: &Identity) -> bool {
        access::has_access(self.entries.get(&id), self.entry_access.get(&id), identity)
    }

    /// Ids created by `identity`, in creation order. Unfiltered by access.
    pub fn list_by_user(&self, identity: &Identity) -> &[EntryId] {
        self.user_entries
            .get(identity)
            .map(UserEntries::as_slice)
            .unwrap_or(&[])
    }

    /// Explicit grants for an entry, if an access list record exists.
    pub fn access_list(&self, id: EntryId) -> Option<&[Identity]> {
        self.entry_access.get(&id).map(AccessList::as_slice)
    }

    /// Substrate-level lookup that bypasses read checks.
    pub fn peek(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id the next successful create will receive.
    pub fn next_entry_id(&self) -> EntryId {
        self.next_entry_id
    }

    /// Takes ops committed since the last drain.
    pub fn drain_pending_ops(&mut self) -> Vec<StoredOp> {
        std::mem::take(&mut self.pending_ops)
    }

    /// Sequence of the last committed op, 0 if none.
    pub fn latest_op_seq(&self) -> OpSeq {
        self.next_op_seq.saturating_sub(1)
    }

    /// Re-applies a journaled op. Authorization was checked at commit time.
    pub fn apply_replayed_op(&mut self, stored: StoredOp) -> Result<(), StoreError> {
        let StoredOp { seq, caller, op, .. } = stored;
        match op {
            Op::Create { entry } => {
                self.apply_create_with_seq(entry, caller, seq)?;
            }
            Op::Update { id, fields, .. } => {
                self.apply_update_with_seq(id, fields, caller, seq)?;
            }
            Op::Delete { id } => {
                self.apply_delete_with_seq(id, caller, seq)?;
            }
            Op::Grant { id, identity } => {
                self.apply_grant_with_seq(id, identity, caller, seq)?;
            }
            Op::Revoke { id, identity } => {
                self.apply_revoke_with_seq(id, identity, caller, seq)?;
            }
        }
        Ok(())
    }

    /// Checks that the primary records and both indexes describe the same state.
    pub fn verify_consistency(&self) -> Result<(), StoreError> {
        if self.next_entry_id == 0 || self.next_op_seq == 0 {
            return Err(StoreError::Inconsistent("allocators must start at 1".to_string()));
        }

        for (id, entry) in &self.entries {
            if entry.id != *id {
                return Err(StoreError::Inconsistent(format!("entry keyed {id} carries id {}", entry.id)));
            }
            if entry.id >= self.next_entry_id {
                return Err(StoreError::Inconsistent(format!(
                    "entry {id} not below next id {}",
                    self.next_entry_id
                )));
            }
            if let Err(err) = entry.draft().validate() {
                return Err(StoreError::Inconsistent(format!("entry {id} out of bounds: {err}")));
            }
            let occurrences = self
                .list_by_user(&entry.creator)
                .iter()
                .filter(|x| **x == entry.id)
                .count();
            if occurrences != 1 {
                return Err(StoreError::Inconsistent(format!(
                    "entry {id} listed {occurrences} times for {}",
                    entry.creator
                )));
            }
        }

        let mut indexed = 0usize;
        for (owner, list) in &self.user_entries {
            for id in list.as_slice() {
                match self.entries.get(id) {
                    Some(entry) if entry.creator == *owner => indexed += 1,
                    Some(_) => {
                        return Err(StoreError::Inconsistent(format!("entry {id} indexed under non-creator {owner}")));
                    }
                    None => {
                        return Err(StoreError::Inconsistent(format!("{owner} indexes missing entry {id}")));
                    }
                }
            }
        }
        if indexed != self.entries.len() {
            return Err(StoreError::Inconsistent(format!(
                "{indexed} indexed ids for {} entries",
                self.entries.len()
            )));
        }

        for (id, list) in &self.entry_access {
            if !self.entries.contains_key(id) {
                return Err(StoreError::Inconsistent(format!("access list for missing entry {id}")));
            }
            let unique: HashSet<&Identity> = list.as_slice().iter().collect();
            if unique.len() != list.len() {
                return Err(StoreError::Inconsistent(format!("duplicate grant on entry {id}")));
            }
        }

        Ok(())
    }

    fn owned_entry(&self, id: EntryId, caller: &Identity) -> Result<&Entry, StoreError> {
        let entry = self.entries.get(&id).ok_or(StoreError::EntryNotFound(id))?;
        if !is_creator(entry, caller) {
            warn!(entry_id = id, caller = %caller, "mutation by non-creator rejected");
            return Err(StoreError::NotAuthorized {
                id,
                caller: caller.clone(),
            });
        }
        Ok(entry)
    }

    fn check_create(&self, caller: &Identity, draft: &EntryDraft) -> Result<(), StoreError> {
        draft.validate()?;
        self.ensure_user_capacity(caller)
    }

    fn check_update(&self, caller: &Identity, id: EntryId, fields: &EntryDraft) -> Result<(), StoreError> {
        self.owned_entry(id, caller)?;
        fields.validate()
    }

    fn check_grant(&self, caller: &Identity, id: EntryId, identity: &Identity) -> Result<bool, StoreError> {
        self.owned_entry(id, caller)?;
        match self.entry_access.get(&id) {
            Some(list) if list.contains(identity) => Ok(false),
            Some(list) if list.is_full() => Err(access_list_full()),
            _ => Ok(true),
        }
    }

    fn check_revoke(&self, caller: &Identity, id: EntryId, identity: &Identity) -> Result<bool, StoreError> {
        self.owned_entry(id, caller)?;
        Ok(self
            .entry_access
            .get(&id)
            .is_some_and(|list| list.contains(identity)))
    }

    fn ensure_user_capacity(&self, owner: &Identity) -> Result<(), StoreError> {
        if self.user_entries.get(owner).is_some_and(UserEntries::is_full) {
            return Err(StoreError::CapacityExceeded {
                what: "user entry index",
                capacity: MAX_ENTRIES_PER_USER,
            });
        }
        Ok(())
    }

    fn apply_create_with_seq(
        &mut self,
        entry: Entry,
        caller: Identity,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        if self.entries.contains_key(&entry.id) {
            return Err(StoreError::AlreadyExists(entry.id));
        }
        self.ensure_user_capacity(&entry.creator)?;

        let id = entry.id;
        self.user_entries
            .entry(entry.creator.clone())
            .or_default()
            .push(id)
            .map_err(|_| StoreError::CapacityExceeded {
                what: "user entry index",
                capacity: MAX_ENTRIES_PER_USER,
            })?;
        self.next_entry_id = self.next_entry_id.max(id.saturating_add(1));
        if !entry.is_public {
            self.entry_access.entry(id).or_default();
        }
        self.entries.insert(id, entry.clone());

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            caller,
            op: Op::Create { entry },
        })
    }

    fn apply_update_with_seq(
        &mut self,
        id: EntryId,
        fields: EntryDraft,
        caller: Identity,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        let entry = self.entries.get_mut(&id).ok_or(StoreError::EntryNotFound(id))?;
        let prev = entry.draft();
        entry.apply_draft(fields.clone());

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            caller,
            op: Op::Update { id, fields, prev },
        })
    }

    fn apply_delete_with_seq(
        &mut self,
        id: EntryId,
        caller: Identity,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        let entry = self.entries.remove(&id).ok_or(StoreError::EntryNotFound(id))?;
        self.entry_access.remove(&id);
        if let Some(list) = self.user_entries.get_mut(&entry.creator) {
            list.remove(&id);
        }

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            caller,
            op: Op::Delete { id },
        })
    }

    fn apply_grant_with_seq(
        &mut self,
        id: EntryId,
        identity: Identity,
        caller: Identity,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        if !self.entries.contains_key(&id) {
            return Err(StoreError::EntryNotFound(id));
        }
        self.entry_access
            .entry(id)
            .or_default()
            .push_unique(identity.clone())
            .map_err(|_| access_list_full())?;

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            caller,
            op: Op::Grant { id, identity },
        })
    }

    fn apply_revoke_with_seq(
        &mut self,
        id: EntryId,
        identity: Identity,
        caller: Identity,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        if !self.entries.contains_key(&id) {
            return Err(StoreError::EntryNotFound(id));
        }
        if let Some(list) = self.entry_access.get_mut(&id) {
            list.remove(&identity);
        }

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            caller,
            op: Op::Revoke { id, identity },
        })
    }

    fn bump_next_seq_from(&mut self, seq: OpSeq) {
        self.next_op_seq = self.next_op_seq.max(seq.saturating_add(1));
    }
}

fn access_list_full() -> StoreError {
    StoreError::CapacityExceeded {
        what: "entry access list",
        capacity: MAX_GRANTS_PER_ENTRY,
    }
}

/// Wall-clock milliseconds since the Unix epoch, 0 if the clock is before it.
pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
