//! Geotagged audio-diary entry store with per-entry ownership, discretionary
//! read grants, and an append-only SQLite ledger.
//!
//! # Examples
//!
//! In-memory usage with [`core::store::EntryStore`]:
//! ```
//! use geodiary::{core::store::EntryStore, entry::EntryDraft, types::Identity};
//!
//! let alice = Identity::from("alice");
//! let bob = Identity::from("bob");
//!
//! let mut store = EntryStore::new();
//! let (id, _op) = store.create(&alice, EntryDraft {
//!     title: "Harbor at dawn".to_string(),
//!     description: "Gulls and foghorns".to_string(),
//!     audio_url: "ipfs://bafy-harbor".to_string(),
//!     latitude: 40_689_247,
//!     longitude: -74_044_502,
//!     is_public: false,
//! }, 1_700_000_000_000).expect("create");
//! assert_eq!(id, 1);
//! assert!(!store.check_access(id, &bob));
//!
//! store.grant(&alice, id, bob.clone()).expect("grant");
//! assert_eq!(store.get_entry(id, &bob).expect("read").title, "Harbor at dawn");
//! ```
//!
//! Runtime usage with SQLite sink:
//! ```no_run
//! use geodiary::{
//!     core::store::EntryStore,
//!     entry::EntryDraft,
//!     persist::sqlite::SqliteOpSink,
//!     runtime::handle::{spawn_diary, RuntimeConfig},
//!     types::Identity,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteOpSink::open("diary.db").expect("open sqlite");
//! let store = sink.load_store().expect("load");
//! let handle = spawn_diary(store, Some(Box::new(sink)), RuntimeConfig::default());
//! let alice = handle.session(Identity::from("alice"));
//! let _id = alice.create_entry(EntryDraft {
//!     title: "Harbor at dawn".to_string(),
//!     description: String::new(),
//!     audio_url: "ipfs://bafy-harbor".to_string(),
//!     latitude: 40_689_247,
//!     longitude: -74_044_502,
//!     is_public: true,
//! }).await.expect("create");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Core in-memory store, access predicate, and index helpers.
pub mod core;
/// Entry records, drafts, and field validation.
pub mod entry;
/// Mutation op model and persistence wrapper types.
pub mod op;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Single-writer runtime handle, sessions, and events.
pub mod runtime;
/// Shared primitive types.
pub mod types;
