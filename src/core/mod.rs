//! In-memory authoritative store, access predicate, and index helpers.

/// Read-permission and ownership predicates.
pub mod access;
/// Bounded owner and access index types.
pub mod indices;
/// Authoritative entry store.
pub mod store;
