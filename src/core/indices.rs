use hashbrown::HashMap;

use crate::types::{EntryId, Identity};

/// Most entries a single identity may hold in its index.
pub const MAX_ENTRIES_PER_USER: usize = 100;
/// Most identities an entry's access list may hold.
pub const MAX_GRANTS_PER_ENTRY: usize = 50;

/// Insertion-ordered list with a fixed upper bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedList<T, const CAP: usize> {
    items: Vec<T>,
}

/// Returned when a push would exceed the list bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

impl<T, const CAP: usize> Default for BoundedList<T, CAP> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: PartialEq, const CAP: usize> BoundedList<T, CAP> {
    /// Upper bound on the number of items.
    pub const CAPACITY: usize = CAP;

    /// Builds a list from existing items, rejecting oversized input.
    pub fn from_vec(items: Vec<T>) -> Result<Self, Full> {
        if items.len() > CAP {
            return Err(Full);
        }
        Ok(Self { items })
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no items are stored.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when another push would fail.
    pub fn is_full(&self) -> bool {
        self.items.len() >= CAP
    }

    /// True when `value` is present.
    pub fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }

    /// Items in insertion order.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Appends `value` at the end.
    pub fn push(&mut self, value: T) -> Result<(), Full> {
        if self.is_full() {
            return Err(Full);
        }
        self.items.push(value);
        Ok(())
    }

    /// Appends `value` unless already present. Returns whether it was added.
    pub fn push_unique(&mut self, value: T) -> Result<bool, Full> {
        if self.contains(&value) {
            return Ok(false);
        }
        self.push(value)?;
        Ok(true)
    }

    /// Removes the first occurrence of `value`, keeping the order of the rest.
    pub fn remove(&mut self, value: &T) -> bool {
        match self.items.iter().position(|x| x == value) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Entry ids owned by one identity, in creation order.
pub type UserEntries = BoundedList<EntryId, MAX_ENTRIES_PER_USER>;
/// Identities granted explicit read access to one entry, in grant order.
pub type AccessList = BoundedList<Identity, MAX_GRANTS_PER_ENTRY>;

/// Owner identity to owned entry ids.
pub type UserIndex = HashMap<Identity, UserEntries>;
/// Entry id to explicit grants.
pub type AccessIndex = HashMap<EntryId, AccessList>;
