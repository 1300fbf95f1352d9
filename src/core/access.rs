use crate::{entry::Entry, types::Identity};

use super::indices::AccessList;

/// Read-permission predicate consulted by every read check.
///
/// A missing entry grants nothing. A missing access list counts as empty.
pub fn has_access(entry: Option<&Entry>, grants: Option<&AccessList>, identity: &Identity) -> bool {
    let Some(entry) = entry else {
        return false;
    };

    entry.creator == *identity
        || entry.is_public
        || grants.is_some_and(|list| list.contains(identity))
}

/// True iff `identity` may mutate `entry`.
pub fn is_creator(entry: &Entry, identity: &Identity) -> bool {
    entry.creator == *identity
}
