use std::sync::Arc;

use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    core::store::{EntryStore, Mutation, StoreError, StoreSnapshotV1, now_ms},
    entry::{Entry, EntryDraft},
    op::{Op, StoredOp},
    persist::{OpSink, PersistError},
    types::{EntryId, Identity, OpSeq},
};

use super::events::DiaryEvent;

/// Failures returned by [`DiaryHandle`] and [`Session`] calls.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The store rejected the operation; nothing changed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The ledger could not accept or write the operation.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The runtime task has stopped.
    #[error("runtime channel closed")]
    ChannelClosed,
}

/// Tuning knobs for the runtime and its persistence worker.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Flush the batch as soon as a create is queued.
    pub flush_on_create: bool,
    /// Flush once this many ops are buffered.
    pub batch_max_ops: usize,
    /// Flush a non-empty buffer after this long.
    pub batch_max_latency_ms: u64,
    /// Bound of the queue between the writer and the persistence worker.
    pub persist_queue_bound: usize,
    /// Take a snapshot after this many committed ops (0 disables).
    pub snapshot_every_ops: usize,
    /// Drop journal rows covered by a fresh snapshot.
    pub compact_after_snapshot: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_on_create: true,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            snapshot_every_ops: 2000,
            compact_after_snapshot: false,
        }
    }
}

/// Cloneable handle to the single-writer runtime.
#[derive(Clone)]
pub struct DiaryHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<DiaryEvent>,
}

/// Operations issued on behalf of one authenticated identity.
#[derive(Clone)]
pub struct Session {
    handle: DiaryHandle,
    caller: Identity,
}

enum Command {
    Create {
        caller: Identity,
        draft: EntryDraft,
        resp: oneshot::Sender<Result<EntryId, RuntimeError>>,
    },
    Mutate {
        caller: Identity,
        mutation: Mutation,
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Get {
        caller: Identity,
        id: EntryId,
        resp: oneshot::Sender<Result<Entry, RuntimeError>>,
    },
    ListByUser {
        identity: Identity,
        resp: oneshot::Sender<Vec<EntryId>>,
    },
    CheckAccess {
        id: EntryId,
        identity: Identity,
        resp: oneshot::Sender<bool>,
    },
    Flush {
        resp: oneshot::Sender<Result<OpSeq, RuntimeError>>,
    },
    Checkpoint {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistMsg {
    Op(StoredOp),
    Flush {
        resp: oneshot::Sender<Result<OpSeq, PersistError>>,
    },
    Checkpoint {
        snapshot: StoreSnapshotV1,
        last_seq: OpSeq,
        compact: bool,
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
}

/// Starts the writer task that owns `store` and returns a handle to it.
///
/// Commands are processed one at a time to completion, so no operation ever
/// observes another half-applied.
pub fn spawn_diary(
    store: EntryStore,
    sink: Option<Box<dyn OpSink>>,
    config: RuntimeConfig,
) -> DiaryHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel::<DiaryEvent>(1024);

    let (persist_tx_opt, mut durable_rx) = if let Some(sink) = sink {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound);
        let (durable_tx, durable_rx) = mpsc::unbounded_channel::<Result<OpSeq, PersistError>>();
        spawn_persistence_worker(sink, persist_rx, durable_tx, config.clone());
        (Some(persist_tx), Some(durable_rx))
    } else {
        (None, None)
    };

    let events_tx_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut store = store;
        let mut ops_since_snapshot = 0usize;

        loop {
            if let Some(rx) = durable_rx.as_mut() {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break; };
                        let done = handle_command(
                            cmd,
                            &mut store,
                            &events_tx_loop,
                            persist_tx_opt.as_ref(),
                            &config,
                            &mut ops_since_snapshot,
                        ).await;
                        if done {
                            break;
                        }
                    }
                    durable = rx.recv() => {
                        match durable {
                            Some(Ok(op_seq)) => {
                                let _ = events_tx_loop.send(DiaryEvent::DurableUpTo { op_seq });
                            }
                            Some(Err(err)) => warn!(error = %err, "ledger append failed"),
                            None => {}
                        }
                    }
                }
            } else {
                let Some(cmd) = cmd_rx.recv().await else { break; };
                let done = handle_command(
                    cmd,
                    &mut store,
                    &events_tx_loop,
                    persist_tx_opt.as_ref(),
                    &config,
                    &mut ops_since_snapshot,
                )
                .await;
                if done {
                    break;
                }
            }
        }
        debug!("diary runtime stopped");
    });

    DiaryHandle { cmd_tx, events_tx }
}

impl DiaryHandle {
    /// Subscribes to committed-op and durability events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiaryEvent> {
        self.events_tx.subscribe()
    }

    /// Binds `caller` as the authenticated identity for subsequent calls.
    pub fn session(&self, caller: Identity) -> Session {
        Session {
            handle: self.clone(),
            caller,
        }
    }

    /// Ids created by `identity`, in creation order.
    pub async fn get_user_entries(&self, identity: Identity) -> Result<Vec<EntryId>, RuntimeError> {
        self.request(|resp| Command::ListByUser { identity, resp }).await
    }

    /// Whether `identity` may read entry `id`. False for unknown entries.
    pub async fn check_access(&self, id: EntryId, identity: Identity) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::CheckAccess { id, identity, resp }).await
    }

    /// Waits until every committed op is durable and returns the durable sequence.
    pub async fn flush(&self) -> Result<OpSeq, RuntimeError> {
        self.request(|resp| Command::Flush { resp }).await?
    }

    /// Writes a snapshot of the current state to the sink.
    pub async fn checkpoint(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Checkpoint { resp }).await?
    }

    /// Flushes pending ops and stops the runtime.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Shutdown { resp }).await?
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }
}

impl Session {
    /// Authenticated identity of this session.
    pub fn caller(&self) -> &Identity {
        &self.caller
    }

    /// Creates an entry owned by the session identity.
    pub async fn create_entry(&self, draft: EntryDraft) -> Result<EntryId, RuntimeError> {
        let caller = self.caller.clone();
        self.handle
            .request(|resp| Command::Create { caller, draft, resp })
            .await?
    }

    /// Replaces all mutable fields of an owned entry.
    pub async fn update_entry(&self, id: EntryId, draft: EntryDraft) -> Result<(), RuntimeError> {
        self.mutate(Mutation::Update { id, fields: draft }).await
    }

    /// Deletes an owned entry.
    pub async fn delete_entry(&self, id: EntryId) -> Result<(), RuntimeError> {
        self.mutate(Mutation::Delete { id }).await
    }

    /// Grants `identity` read access to an owned entry.
    pub async fn grant_access(&self, id: EntryId, identity: Identity) -> Result<(), RuntimeError> {
        self.mutate(Mutation::Grant { id, identity }).await
    }

    /// Revokes `identity`'s read access to an owned entry.
    pub async fn revoke_access(&self, id: EntryId, identity: Identity) -> Result<(), RuntimeError> {
        self.mutate(Mutation::Revoke { id, identity }).await
    }

    /// Reads an entry the session identity may see.
    pub async fn get_entry(&self, id: EntryId) -> Result<Entry, RuntimeError> {
        let caller = self.caller.clone();
        self.handle
            .request(|resp| Command::Get { caller, id, resp })
            .await?
    }

    /// Ids created by `identity`, in creation order.
    pub async fn get_user_entries(&self, identity: Identity) -> Result<Vec<EntryId>, RuntimeError> {
        self.handle.get_user_entries(identity).await
    }

    /// Whether `identity` may read entry `id`.
    pub async fn check_access(&self, id: EntryId, identity: Identity) -> Result<bool, RuntimeError> {
        self.handle.check_access(id, identity).await
    }

    async fn mutate(&self, mutation: Mutation) -> Result<(), RuntimeError> {
        let caller = self.caller.clone();
        self.handle
            .request(|resp| Command::Mutate { caller, mutation, resp })
            .await?
    }
}

async fn handle_command(
    cmd: Command,
    store: &mut EntryStore,
    events_tx: &broadcast::Sender<DiaryEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    config: &RuntimeConfig,
    ops_since_snapshot: &mut usize,
) -> bool {
    match cmd {
        Command::Create { caller, draft, resp } => {
            let id = store.next_entry_id();
            let mutation = Mutation::Create { draft, now: now_ms() };
            let res = commit(store, persist_tx, events_tx, ops_since_snapshot, &caller, mutation)
                .map(|()| id);
            let _ = resp.send(res);
        }
        Command::Mutate { caller, mutation, resp } => {
            let res = commit(store, persist_tx, events_tx, ops_since_snapshot, &caller, mutation);
            let _ = resp.send(res);
        }
        Command::Get { caller, id, resp } => {
            let res = store
                .get_entry(id, &caller)
                .cloned()
                .map_err(RuntimeError::from);
            let _ = resp.send(res);
        }
        Command::ListByUser { identity, resp } => {
            let _ = resp.send(store.list_by_user(&identity).to_vec());
        }
        Command::CheckAccess { id, identity, resp } => {
            let _ = resp.send(store.check_access(id, &identity));
        }
        Command::Flush { resp } => {
            let out = if let Some(tx) = persist_tx {
                let (flush_tx, flush_rx) = oneshot::channel();
                if tx.send(PersistMsg::Flush { resp: flush_tx }).await.is_err() {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    flush_rx
                        .await
                        .map_err(|_| RuntimeError::ChannelClosed)
                        .and_then(|r| r.map_err(RuntimeError::from))
                }
            } else {
                Ok(store.latest_op_seq())
            };
            let _ = resp.send(out);
        }
        Command::Checkpoint { resp } => {
            let out = if let Some(tx) = persist_tx {
                let res = request_checkpoint(store, tx, config).await;
                if res.is_ok() {
                    *ops_since_snapshot = 0;
                }
                res
            } else {
                Ok(())
            };
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let out = if let Some(tx) = persist_tx {
                let (done_tx, done_rx) = oneshot::channel();
                if tx.send(PersistMsg::Shutdown { resp: done_tx }).await.is_err() {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    done_rx
                        .await
                        .map_err(|_| RuntimeError::ChannelClosed)
                        .and_then(|r| r.map_err(RuntimeError::from))
                }
            } else {
                Ok(())
            };
            // A failed final flush keeps both tasks running so shutdown can be retried.
            let stopped = out.is_ok();
            let _ = resp.send(out);
            return stopped;
        }
    }

    maybe_auto_checkpoint(store, persist_tx, config, ops_since_snapshot).await;
    false
}

/// Runs one store mutation and forwards its op to the ledger.
///
/// The store's checks run first, so rejected and idempotent calls never
/// touch the persistence queue. A queue slot is reserved before the store
/// is written; a full queue rejects the call with no state change.
fn commit(
    store: &mut EntryStore,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    events_tx: &broadcast::Sender<DiaryEvent>,
    ops_since_snapshot: &mut usize,
    caller: &Identity,
    mutation: Mutation,
) -> Result<(), RuntimeError> {
    if !store.preflight(caller, &mutation)? {
        return Ok(());
    }

    let permit = match persist_tx {
        Some(tx) => Some(tx.try_reserve().map_err(|err| {
            warn!(error = %err, "persist queue rejected op");
            RuntimeError::Persist(PersistError::Message(format!("persist queue error: {err}")))
        })?),
        None => None,
    };

    let Some(stored) = store.apply(caller, mutation)? else {
        return Ok(());
    };
    store.drain_pending_ops();
    *ops_since_snapshot += 1;

    let _ = events_tx.send(DiaryEvent::from_op(&stored.op));
    match permit {
        Some(permit) => permit.send(PersistMsg::Op(stored)),
        None => {
            let _ = events_tx.send(DiaryEvent::DurableUpTo { op_seq: stored.seq });
        }
    }
    Ok(())
}

async fn request_checkpoint(
    store: &EntryStore,
    tx: &mpsc::Sender<PersistMsg>,
    config: &RuntimeConfig,
) -> Result<(), RuntimeError> {
    let (cp_tx, cp_rx) = oneshot::channel();
    tx.send(PersistMsg::Checkpoint {
        snapshot: store.export_snapshot(),
        last_seq: store.latest_op_seq(),
        compact: config.compact_after_snapshot,
        resp: cp_tx,
    })
    .await
    .map_err(|_| RuntimeError::ChannelClosed)?;
    cp_rx
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?
        .map_err(RuntimeError::from)
}

async fn maybe_auto_checkpoint(
    store: &EntryStore,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    config: &RuntimeConfig,
    ops_since_snapshot: &mut usize,
) {
    if config.snapshot_every_ops == 0 || *ops_since_snapshot < config.snapshot_every_ops {
        return;
    }

    let Some(tx) = persist_tx else {
        return;
    };

    match request_checkpoint(store, tx, config).await {
        Ok(()) => *ops_since_snapshot = 0,
        Err(err) => warn!(error = %err, "automatic checkpoint failed"),
    }
}

fn spawn_persistence_worker(
    sink: Box<dyn OpSink>,
    rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    config: RuntimeConfig,
) {
    let worker = PersistWorker {
        sink: Arc::new(Mutex::new(sink)),
        buf: Vec::new(),
        last_durable: 0,
        durable_tx,
        config,
    };
    tokio::spawn(worker.run(rx));
}

/// Owns the sink and the batch of ops not yet known durable.
///
/// Ops leave `buf` only after the sink accepted them; a failed append puts
/// them back so the next flush retries them in order.
struct PersistWorker {
    sink: Arc<Mutex<Box<dyn OpSink>>>,
    buf: Vec<StoredOp>,
    last_durable: OpSeq,
    durable_tx: mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    config: RuntimeConfig,
}

impl PersistWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<PersistMsg>) {
        let mut deadline = self.next_deadline();

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = self.flush(true).await;
                        break;
                    };

                    match msg {
                        PersistMsg::Op(stored) => {
                            let is_create = matches!(stored.op, Op::Create { .. });
                            self.buf.push(stored);
                            if self.buf.len() >= self.config.batch_max_ops
                                || (self.config.flush_on_create && is_create)
                            {
                                let _ = self.flush(true).await;
                                deadline = self.next_deadline();
                            }
                        }
                        PersistMsg::Flush { resp } => {
                            let result = self.flush(true).await.map(|()| self.last_durable);
                            let _ = resp.send(result);
                            deadline = self.next_deadline();
                        }
                        PersistMsg::Checkpoint { snapshot, last_seq, compact, resp } => {
                            let result = match self.flush(true).await {
                                Ok(()) => self.checkpoint(snapshot, last_seq, compact).await,
                                Err(err) => Err(err),
                            };
                            let _ = resp.send(result);
                            deadline = self.next_deadline();
                        }
                        PersistMsg::Shutdown { resp } => {
                            let result = self.flush(true).await;
                            let stop = result.is_ok();
                            let _ = resp.send(result);
                            if stop {
                                break;
                            }
                            deadline = self.next_deadline();
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !self.buf.is_empty() => {
                    let _ = self.flush(false).await;
                    deadline = self.next_deadline();
                }
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.batch_max_latency_ms)
    }

    async fn flush(&mut self, call_flush: bool) -> Result<(), PersistError> {
        let sink = Arc::clone(&self.sink);

        if self.buf.is_empty() {
            if call_flush {
                tokio::task::spawn_blocking(move || sink.blocking_lock().flush())
                    .await
                    .map_err(|e| PersistError::Message(format!("join error: {e}")))??;
            }
            return Ok(());
        }

        let ops = std::mem::take(&mut self.buf);
        let joined = tokio::task::spawn_blocking(move || {
            let mut sink = sink.blocking_lock();
            let result = sink.append_ops(&ops).and_then(|seq| {
                if call_flush {
                    sink.flush()?;
                }
                Ok(seq)
            });
            (ops, result)
        })
        .await;

        let (ops, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                let err = PersistError::Message(format!("join error: {e}"));
                warn!(error = %err, "ledger append lost its batch");
                let _ = self.durable_tx.send(Err(PersistError::Message(err.to_string())));
                return Err(err);
            }
        };

        match result {
            Ok(seq) => {
                self.last_durable = self.last_durable.max(seq);
                let _ = self.durable_tx.send(Ok(self.last_durable));
                Ok(())
            }
            Err(err) => {
                let retained = ops.len();
                let mut restored = ops;
                restored.append(&mut self.buf);
                self.buf = restored;
                warn!(error = %err, retained, "ledger append failed; batch kept for retry");
                let _ = self
                    .durable_tx
                    .send(Err(PersistError::Message(format!("append failed: {err}"))));
                Err(err)
            }
        }
    }

    async fn checkpoint(
        &self,
        snapshot: StoreSnapshotV1,
        last_seq: OpSeq,
        compact: bool,
    ) -> Result<(), PersistError> {
        let sink = Arc::clone(&self.sink);
        let result = tokio::task::spawn_blocking(move || {
            let mut sink = sink.blocking_lock();
            sink.write_snapshot(&snapshot, last_seq)?;
            if compact {
                sink.compact_through(last_seq)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| PersistError::Message(format!("join error: {e}")))?;

        if result.is_ok() {
            info!(last_seq, compact, "checkpoint complete");
        }
        result
    }
}
