use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tempfile::TempDir;

use geodiary::{
    core::store::{EntryStore, StoreError},
    entry::EntryDraft,
    op::StoredOp,
    persist::{OpSink, PersistError, PersistResult, sqlite::SqliteOpSink},
    runtime::{
        events::DiaryEvent,
        handle::{RuntimeConfig, RuntimeError, spawn_diary},
    },
    types::{Identity, OpSeq},
};

fn draft(title: &str, is_public: bool) -> EntryDraft {
    EntryDraft {
        title: title.to_string(),
        description: String::new(),
        audio_url: format!("ipfs://{title}"),
        latitude: 40_689_247,
        longitude: -74_044_502,
        is_public,
    }
}

struct SlowSink {
    seen: Arc<Mutex<Vec<OpSeq>>>,
    delay: Duration,
}

impl OpSink for SlowSink {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq> {
        std::thread::sleep(self.delay);
        let mut seen = self.seen.lock().expect("lock");
        for op in ops {
            seen.push(op.seq);
        }
        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }
}

/// Rejects the first `failures_left` appends, then records like `SlowSink`.
struct FlakySink {
    seen: Arc<Mutex<Vec<OpSeq>>>,
    failures_left: usize,
}

impl OpSink for FlakySink {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(PersistError::Message("disk unavailable".to_string()));
        }
        let mut seen = self.seen.lock().expect("lock");
        for op in ops {
            seen.push(op.seq);
        }
        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }
}

fn manual_flush_config() -> RuntimeConfig {
    RuntimeConfig {
        flush_on_create: false,
        batch_max_ops: 64,
        batch_max_latency_ms: 10_000,
        persist_queue_bound: 16,
        snapshot_every_ops: 0,
        compact_after_snapshot: false,
    }
}

#[tokio::test]
async fn sessions_enforce_ownership_and_read_access() {
    let handle = spawn_diary(EntryStore::new(), None, RuntimeConfig::default());
    let creator = handle.session(Identity::from("creator"));
    let stranger = handle.session(Identity::from("stranger"));

    let id = creator.create_entry(draft("liberty", false)).await.expect("create");
    assert_eq!(id, 1);

    let denied = stranger.get_entry(id).await;
    assert!(matches!(
        denied,
        Err(RuntimeError::Store(StoreError::UnauthorizedAccess { .. }))
    ));
    let denied = stranger.delete_entry(id).await;
    assert!(matches!(
        denied,
        Err(RuntimeError::Store(StoreError::NotAuthorized { .. }))
    ));

    creator
        .grant_access(id, stranger.caller().clone())
        .await
        .expect("grant");
    let entry = stranger.get_entry(id).await.expect("read");
    assert_eq!(entry.title, "liberty");
    assert!(handle.check_access(id, Identity::from("stranger")).await.expect("check"));

    creator.delete_entry(id).await.expect("delete");
    assert!(matches!(
        stranger.get_entry(id).await,
        Err(RuntimeError::Store(StoreError::EntryNotFound(1)))
    ));
    assert!(
        handle
            .get_user_entries(Identity::from("creator"))
            .await
            .expect("list")
            .is_empty()
    );

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn events_follow_commit_order() {
    let handle = spawn_diary(EntryStore::new(), None, RuntimeConfig::default());
    let mut sub = handle.subscribe();
    let owner = handle.session(Identity::from("owner"));
    let guest = Identity::from("guest");

    let id = owner.create_entry(draft("a", false)).await.expect("create");
    owner.update_entry(id, draft("b", true)).await.expect("update");
    owner.grant_access(id, guest.clone()).await.expect("grant");
    owner.grant_access(id, guest.clone()).await.expect("grant again");
    owner.revoke_access(id, guest.clone()).await.expect("revoke");

    let mut seen = Vec::new();
    for _ in 0..16 {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event")
            .expect("recv");
        if !matches!(evt, DiaryEvent::DurableUpTo { .. }) {
            seen.push(evt);
        }
        if seen.len() == 4 {
            break;
        }
    }

    assert_eq!(
        seen,
        vec![
            DiaryEvent::Created {
                id,
                creator: Identity::from("owner"),
            },
            DiaryEvent::Updated { id },
            DiaryEvent::AccessGranted {
                id,
                identity: guest.clone(),
            },
            DiaryEvent::AccessRevoked { id, identity: guest },
        ]
    );

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn runtime_journals_to_sqlite_and_reloads() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("runtime.db");

    let sink = SqliteOpSink::open(&db_path).expect("open");
    let handle = spawn_diary(EntryStore::new(), Some(Box::new(sink)), RuntimeConfig::default());
    let owner = handle.session(Identity::from("owner"));

    let a = owner.create_entry(draft("a", false)).await.expect("create a");
    let b = owner.create_entry(draft("b", true)).await.expect("create b");
    owner.grant_access(a, Identity::from("guest")).await.expect("grant");
    owner.delete_entry(b).await.expect("delete");
    assert_eq!(handle.flush().await.expect("flush"), 4);
    handle.checkpoint().await.expect("checkpoint");
    handle.shutdown().await.expect("shutdown");

    let reopened = SqliteOpSink::open(&db_path).expect("reopen");
    let store = reopened.load_store().expect("load");
    assert_eq!(store.list_by_user(&Identity::from("owner")), &[a]);
    assert!(store.check_access(a, &Identity::from("guest")));
    assert_eq!(store.next_entry_id(), 3);
}

#[tokio::test]
async fn durable_event_advances_and_slow_sink_surfaces_queue_pressure() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(250),
    };

    let cfg = RuntimeConfig {
        flush_on_create: true,
        batch_max_ops: 16,
        batch_max_latency_ms: 500,
        persist_queue_bound: 1,
        snapshot_every_ops: 0,
        compact_after_snapshot: false,
    };

    let handle = spawn_diary(EntryStore::new(), Some(Box::new(sink)), cfg);
    let mut sub = handle.subscribe();
    let owner = handle.session(Identity::from("owner"));

    let id = owner.create_entry(draft("first", true)).await.expect("create");
    assert_eq!(id, 1);

    let mut durable_seen = false;
    for _ in 0..5 {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("recv timeout")
            .expect("recv");
        if matches!(evt, DiaryEvent::DurableUpTo { .. }) {
            durable_seen = true;
            break;
        }
    }
    assert!(durable_seen, "expected DurableUpTo event");

    let mut queue_error_seen = false;
    let mut accepted = 1usize;
    for i in 0..12u64 {
        match owner.create_entry(draft(&format!("k{i}"), true)).await {
            Ok(_) => accepted += 1,
            Err(RuntimeError::Persist(_)) => {
                queue_error_seen = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(queue_error_seen, "expected persistence queue pressure to surface as error");

    let listed = handle
        .get_user_entries(Identity::from("owner"))
        .await
        .expect("list");
    assert_eq!(listed.len(), accepted);

    handle.shutdown().await.expect("shutdown");
    assert!(!seen.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn failed_append_keeps_batch_for_next_flush() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = FlakySink {
        seen: Arc::clone(&seen),
        failures_left: 1,
    };
    let handle = spawn_diary(EntryStore::new(), Some(Box::new(sink)), manual_flush_config());
    let owner = handle.session(Identity::from("owner"));

    owner.create_entry(draft("a", true)).await.expect("create a");
    owner.create_entry(draft("b", false)).await.expect("create b");

    assert!(matches!(handle.flush().await, Err(RuntimeError::Persist(_))));
    assert!(seen.lock().expect("lock").is_empty());

    assert_eq!(handle.flush().await.expect("retry flush"), 2);
    assert_eq!(*seen.lock().expect("lock"), vec![1, 2]);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn checkpoint_reports_append_failure() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = FlakySink {
        seen: Arc::clone(&seen),
        failures_left: 1,
    };
    let handle = spawn_diary(EntryStore::new(), Some(Box::new(sink)), manual_flush_config());
    let owner = handle.session(Identity::from("owner"));

    owner.create_entry(draft("a", true)).await.expect("create");

    assert!(matches!(handle.checkpoint().await, Err(RuntimeError::Persist(_))));
    handle.checkpoint().await.expect("retry checkpoint");
    assert_eq!(*seen.lock().expect("lock"), vec![1]);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn failed_shutdown_keeps_runtime_alive_for_retry() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = FlakySink {
        seen: Arc::clone(&seen),
        failures_left: 1,
    };
    let handle = spawn_diary(EntryStore::new(), Some(Box::new(sink)), manual_flush_config());
    let owner = handle.session(Identity::from("owner"));

    let id = owner.create_entry(draft("a", true)).await.expect("create");

    assert!(matches!(handle.shutdown().await, Err(RuntimeError::Persist(_))));
    assert_eq!(owner.get_entry(id).await.expect("still serving").title, "a");

    handle.shutdown().await.expect("retry shutdown");
    assert_eq!(*seen.lock().expect("lock"), vec![1]);
    assert!(matches!(handle.flush().await, Err(RuntimeError::ChannelClosed)));
}

#[tokio::test]
async fn rejected_and_redundant_calls_bypass_full_queue() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(400),
    };
    let cfg = RuntimeConfig {
        flush_on_create: true,
        batch_max_ops: 16,
        batch_max_latency_ms: 500,
        persist_queue_bound: 1,
        snapshot_every_ops: 0,
        compact_after_snapshot: false,
    };
    let handle = spawn_diary(EntryStore::new(), Some(Box::new(sink)), cfg);
    let owner = handle.session(Identity::from("owner"));
    let stranger = handle.session(Identity::from("stranger"));
    let guest = Identity::from("guest");

    let id = owner.create_entry(draft("shared", false)).await.expect("create");
    owner.grant_access(id, guest.clone()).await.expect("grant");
    handle.flush().await.expect("flush");

    let mut queue_full = false;
    for i in 0..8u64 {
        match owner.create_entry(draft(&format!("fill{i}"), true)).await {
            Ok(_) => {}
            Err(RuntimeError::Persist(_)) => {
                queue_full = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(queue_full, "expected the persistence queue to fill");

    owner
        .grant_access(id, guest.clone())
        .await
        .expect("redundant grant is a no-op");
    owner
        .revoke_access(id, Identity::from("nobody"))
        .await
        .expect("revoking an absent grant is a no-op");
    assert!(matches!(
        stranger.delete_entry(id).await,
        Err(RuntimeError::Store(StoreError::NotAuthorized { .. }))
    ));
    assert!(matches!(
        owner.delete_entry(999).await,
        Err(RuntimeError::Store(StoreError::EntryNotFound(999)))
    ));
    assert!(handle.check_access(id, guest).await.expect("check"));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn op_event_precedes_its_durable_mark() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(1),
    };
    let handle = spawn_diary(EntryStore::new(), Some(Box::new(sink)), RuntimeConfig::default());
    let mut sub = handle.subscribe();
    let owner = handle.session(Identity::from("owner"));

    let id = owner.create_entry(draft("a", true)).await.expect("create");

    let first = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("event")
        .expect("recv");
    assert_eq!(
        first,
        DiaryEvent::Created {
            id,
            creator: Identity::from("owner"),
        }
    );
    let second = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("event")
        .expect("recv");
    assert_eq!(second, DiaryEvent::DurableUpTo { op_seq: 1 });

    handle.shutdown().await.expect("shutdown");
}
