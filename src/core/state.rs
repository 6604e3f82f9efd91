//! The synchronization core as one state machine: input events from the
//! application and the connection go in, connection calls and listener
//! events come out. No IO happens here.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::{debug, warn};

use super::filter::QueryFilter;
use super::node::Node;
use super::path::{Name, Path};
use super::sparse::SparseSnapshotTree;
use super::sync::{ServerOp, SyncTree};
use super::transaction::{
    composite_output, Transaction, TransactionError, TransactionResult, TxStatus, TxTree,
    UpdateFn,
};
use super::view::{DataEvent, EventKind, ListenerId};
use super::{CompleterId, ServerError, Tag};

/// Tunables of the core.
#[derive(Debug, Clone)]
pub struct Config {
    /// How many sends a transaction may attempt before failing.
    pub transaction_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transaction_retries: 25,
        }
    }
}

/// Input event to the core.
#[derive(derive_more::Debug)]
pub enum InEvent {
    /// Register a listener on a view.
    Listen {
        /// View path.
        path: Path,
        /// View filter.
        filter: QueryFilter,
        /// Event kind the listener wants.
        kind: EventKind,
        /// The listener's identity.
        listener: ListenerId,
    },
    /// Remove a listener from a view.
    Unlisten {
        /// View path.
        path: Path,
        /// View filter.
        filter: QueryFilter,
        /// The listener to drop.
        listener: ListenerId,
    },
    /// Optimistically overwrite a subtree.
    Set {
        /// Target path.
        path: Path,
        /// Wire JSON, server-value sentinels still raw.
        data: Value,
        /// Completed when the server acknowledges.
        completer: CompleterId,
    },
    /// Optimistically overwrite several children atomically.
    Update {
        /// Target path.
        path: Path,
        /// Wire JSON object mapping child keys to values.
        data: Value,
        /// Completed when the server acknowledges.
        completer: CompleterId,
    },
    /// Start an optimistic compare-and-set transaction.
    Transaction {
        /// Target path.
        path: Path,
        /// The update function.
        #[debug(skip)]
        update: UpdateFn,
        /// Whether intermediate states render locally.
        apply_locally: bool,
        /// Completed with the transaction outcome.
        completer: CompleterId,
    },
    /// Register, amend or cancel an on-disconnect write.
    OnDisconnect {
        /// The requested operation.
        op: DisconnectOp,
        /// Completed when the server registered it.
        completer: CompleterId,
    },
    /// Read the unfiltered local version at a path.
    LocalRead {
        /// Target path.
        path: Path,
        /// Completed immediately with the value.
        completer: CompleterId,
    },
    /// Authoritative overwrite pushed by the server.
    ServerSet {
        /// Target path.
        path: Path,
        /// Tag correlating a filtered listen, if any.
        tag: Option<Tag>,
        /// Wire JSON.
        data: Value,
    },
    /// Authoritative merge pushed by the server.
    ServerMerge {
        /// Target path.
        path: Path,
        /// Tag correlating a filtered listen, if any.
        tag: Option<Tag>,
        /// Wire JSON object.
        data: Value,
    },
    /// The server revoked a listen.
    ListenRevoked {
        /// Listen path.
        path: Path,
        /// The wire query of the revoked listen, absent for unfiltered.
        query: Option<Value>,
    },
    /// A put or merge call resolved.
    PutResponse {
        /// What the call was for.
        ctx: PutCtx,
        /// The server's verdict.
        result: Result<(), ServerError>,
    },
    /// An on-disconnect call resolved.
    OnDisconnectResponse {
        /// The registered operation.
        op: DisconnectOp,
        /// Routed to the caller.
        completer: CompleterId,
        /// The server's verdict.
        result: Result<(), ServerError>,
    },
    /// The connection came up.
    Connected,
    /// The connection dropped; on-disconnect writes replay locally.
    Disconnected,
    /// The repo is closing; fail everything pending.
    Shutdown,
}

/// The on-disconnect operations.
#[derive(Debug, Clone)]
pub enum DisconnectOp {
    /// Write a value at the path when the connection drops.
    Put {
        /// Target path.
        path: Path,
        /// Wire JSON, sentinels kept raw for replay-time resolution.
        data: Value,
    },
    /// Write several children when the connection drops.
    Merge {
        /// Target path.
        path: Path,
        /// Wire JSON object.
        data: Value,
    },
    /// Cancel previously registered writes at or below the path.
    Cancel {
        /// Target path.
        path: Path,
    },
}

/// Correlates a put response with its originator.
#[derive(Debug, Clone)]
pub enum PutCtx {
    /// A plain optimistic write.
    Write {
        /// The pending write to acknowledge.
        write_id: u64,
        /// The caller's completion.
        completer: CompleterId,
    },
    /// A transaction subtree put.
    Transaction {
        /// The subtree root the put was sent for.
        path: Path,
    },
}

/// A completion payload routed back to a caller.
#[derive(Debug)]
pub enum Completion {
    /// Outcome of a set, update, or on-disconnect registration.
    Ack(Result<(), ServerError>),
    /// Outcome of a transaction.
    Transaction(Result<TransactionResult, TransactionError>),
    /// A local read result.
    Local(Node),
}

/// Output event from the core; the runtime performs the IO.
#[derive(Debug)]
pub enum OutEvent {
    /// Establish a server listen.
    Listen {
        /// Listen path.
        path: Path,
        /// Wire query for filtered listens.
        query: Option<Value>,
        /// Correlation tag for filtered listens.
        tag: Option<Tag>,
    },
    /// Tear down a server listen.
    Unlisten {
        /// Listen path.
        path: Path,
        /// Wire query for filtered listens.
        query: Option<Value>,
        /// Correlation tag for filtered listens.
        tag: Option<Tag>,
    },
    /// Send a (possibly conditional) put.
    Put {
        /// Target path.
        path: Path,
        /// Wire JSON payload.
        data: Value,
        /// Compare-and-set precondition.
        hash: Option<String>,
        /// Echoed back in [`InEvent::PutResponse`].
        ctx: PutCtx,
    },
    /// Send a merge.
    Merge {
        /// Target path.
        path: Path,
        /// Wire JSON object payload.
        data: Value,
        /// Echoed back in [`InEvent::PutResponse`].
        ctx: PutCtx,
    },
    /// Register an on-disconnect operation with the server.
    OnDisconnect {
        /// The operation to register.
        op: DisconnectOp,
        /// Routed through the response event.
        completer: CompleterId,
    },
    /// Deliver an event to one listener.
    Emit {
        /// The recipient.
        listener: ListenerId,
        /// The event.
        event: DataEvent,
    },
    /// These listeners' views are gone; drop their delivery channels.
    DropListeners {
        /// The orphaned listeners.
        listeners: Vec<ListenerId>,
    },
    /// Resolve a caller's completion handle.
    Complete {
        /// Which handle.
        completer: CompleterId,
        /// With what.
        result: Completion,
    },
}

#[derive(Debug, Default)]
struct TagMap {
    by_tag: HashMap<Tag, (Path, String)>,
    by_view: HashMap<(Path, String), Tag>,
}

impl TagMap {
    fn insert(&mut self, tag: Tag, path: Path, query_id: String) {
        self.by_tag.insert(tag, (path.clone(), query_id.clone()));
        self.by_view.insert((path, query_id), tag);
    }

    fn remove_view(&mut self, path: &Path, query_id: &str) -> Option<Tag> {
        let tag = self
            .by_view
            .remove(&(path.clone(), query_id.to_string()))?;
        self.by_tag.remove(&tag);
        Some(tag)
    }

    fn lookup(&self, tag: Tag) -> Option<&(Path, String)> {
        self.by_tag.get(&tag)
    }
}

/// The synchronization core.
#[derive(Debug)]
pub struct Core {
    config: Config,
    sync: SyncTree,
    transactions: TxTree,
    on_disconnect: SparseSnapshotTree,
    tags: TagMap,
    next_write_id: u64,
    next_order: u64,
    next_tag: u32,
    out: Vec<OutEvent>,
}

impl Core {
    /// Creates an empty core.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sync: SyncTree::default(),
            transactions: TxTree::default(),
            on_disconnect: SparseSnapshotTree::default(),
            tags: TagMap::default(),
            next_write_id: 0,
            next_order: 0,
            next_tag: 0,
            out: Vec::new(),
        }
    }

    /// Handles one input event against the given server-synchronized time in
    /// milliseconds, returning the resulting output events in order.
    pub fn handle(&mut self, event: InEvent, now_ms: i64) -> Vec<OutEvent> {
        debug!("handle {event:?}");
        match event {
            InEvent::Listen {
                path,
                filter,
                kind,
                listener,
            } => self.listen(path, filter, kind, listener),
            InEvent::Unlisten {
                path,
                filter,
                listener,
            } => self.unlisten(path, filter, listener),
            InEvent::Set {
                path,
                data,
                completer,
            } => self.set(path, data, completer, now_ms),
            InEvent::Update {
                path,
                data,
                completer,
            } => self.update(path, data, completer, now_ms),
            InEvent::Transaction {
                path,
                update,
                apply_locally,
                completer,
            } => self.transaction(path, update, apply_locally, completer, now_ms),
            InEvent::OnDisconnect { op, completer } => {
                self.out.push(OutEvent::OnDisconnect { op, completer });
            }
            InEvent::LocalRead { path, completer } => {
                let node = self.sync.latest_value(&path, &[]);
                self.out.push(OutEvent::Complete {
                    completer,
                    result: Completion::Local(node),
                });
            }
            InEvent::ServerSet { path, tag, data } => {
                let op = ServerOp::Overwrite(Node::from_json(&data));
                self.server_op(path, tag, op);
            }
            InEvent::ServerMerge { path, tag, data } => {
                let children = json_children(&data);
                self.server_op(path, tag, ServerOp::Merge(children));
            }
            InEvent::ListenRevoked { path, query } => self.listen_revoked(path, query),
            InEvent::PutResponse { ctx, result } => self.put_response(ctx, result, now_ms),
            InEvent::OnDisconnectResponse {
                op,
                completer,
                result,
            } => self.on_disconnect_response(op, completer, result),
            InEvent::Connected => self.send_ready_transactions(),
            InEvent::Disconnected => self.disconnected(now_ms),
            InEvent::Shutdown => self.shutdown(),
        }
        std::mem::take(&mut self.out)
    }

    fn listen(&mut self, path: Path, filter: QueryFilter, kind: EventKind, listener: ListenerId) {
        let registered = self.sync.add_listener(&path, filter.clone(), kind, listener);
        self.emit(registered.initial);
        if registered.was_first {
            if filter.is_default() {
                self.out.push(OutEvent::Listen {
                    path,
                    query: None,
                    tag: None,
                });
            } else {
                self.next_tag += 1;
                let tag = Tag(self.next_tag);
                self.tags.insert(tag, path.clone(), filter.query_id());
                self.out.push(OutEvent::Listen {
                    path,
                    query: Some(filter.to_wire()),
                    tag: Some(tag),
                });
            }
        }
    }

    fn unlisten(&mut self, path: Path, filter: QueryFilter, listener: ListenerId) {
        let query_id = filter.query_id();
        let dropped = self.sync.remove_listener(&path, &query_id, listener);
        if dropped.view_dropped {
            let tag = self.tags.remove_view(&path, &query_id);
            let query = (!filter.is_default()).then(|| filter.to_wire());
            self.out.push(OutEvent::Unlisten { path, query, tag });
        }
    }

    fn set(&mut self, path: Path, data: Value, completer: CompleterId, now_ms: i64) {
        let node = Node::from_json(&data).resolve_deferred(now_ms);
        let write_id = self.next_write_id;
        self.next_write_id += 1;
        let events = self.sync.apply_user_overwrite(&path, node, write_id, true);
        self.emit(events);
        self.out.push(OutEvent::Put {
            path: path.clone(),
            data,
            hash: None,
            ctx: PutCtx::Write {
                write_id,
                completer,
            },
        });
        self.abort_transactions(&path, TransactionError::Overridden);
        self.send_ready_transactions();
    }

    fn update(&mut self, path: Path, data: Value, completer: CompleterId, now_ms: i64) {
        let children: BTreeMap<Name, Node> = match &data {
            Value::Object(map) => map
                .iter()
                .filter(|(key, _)| !key.starts_with('.'))
                .map(|(key, value)| {
                    (
                        Name::new(key.as_str()),
                        Node::from_json(value).resolve_deferred(now_ms),
                    )
                })
                .collect(),
            _ => BTreeMap::new(),
        };
        if children.is_empty() {
            // Nothing to change; acknowledge right away.
            self.out.push(OutEvent::Complete {
                completer,
                result: Completion::Ack(Ok(())),
            });
            return;
        }
        let write_id = self.next_write_id;
        self.next_write_id += 1;
        let names: Vec<Name> = children.keys().cloned().collect();
        let events = self.sync.apply_user_merge(&path, children, write_id, true);
        self.emit(events);
        self.out.push(OutEvent::Merge {
            path: path.clone(),
            data,
            ctx: PutCtx::Write {
                write_id,
                completer,
            },
        });
        for name in names {
            self.abort_transactions(&path.child(name), TransactionError::Overridden);
        }
        self.send_ready_transactions();
    }

    fn transaction(
        &mut self,
        path: Path,
        update: UpdateFn,
        apply_locally: bool,
        completer: CompleterId,
        now_ms: i64,
    ) {
        if self.sync.add_silent(&path) {
            self.out.push(OutEvent::Listen {
                path: path.clone(),
                query: None,
                tag: None,
            });
        }
        let order = self.next_order;
        self.next_order += 1;
        let tx = Transaction {
            order,
            path: path.clone(),
            update,
            apply_locally,
            status: TxStatus::Pending,
            retry_count: 0,
            current_input: Node::Empty,
            current_output_raw: Node::Empty,
            current_output_resolved: Node::Empty,
            current_write_id: None,
            abort_reason: None,
            completer,
        };
        self.transactions.node_make_mut(&path).queue.push(tx);

        let sync = &mut self.sync;
        let out = &mut self.out;
        let next_write_id = &mut self.next_write_id;
        let mut finished = false;
        if let Some(tx) = self
            .transactions
            .node_make_mut(&path)
            .queue
            .last_mut()
            .filter(|t| t.order == order)
        {
            finished = !run_transaction(tx, sync, next_write_id, now_ms, out);
        }
        if finished {
            self.release_silent(&path);
            self.transactions.prune();
        }
        self.send_ready_transactions();
    }

    fn server_op(&mut self, path: Path, tag: Option<Tag>, op: ServerOp) {
        let events = match tag {
            Some(tag) => match self.tags.lookup(tag) {
                Some((view_path, query_id)) => {
                    let view_path = view_path.clone();
                    let query_id = query_id.clone();
                    self.sync.apply_server_tagged(&view_path, &query_id, &op)
                }
                None => {
                    warn!(?tag, %path, "server operation for unknown tag, dropping");
                    Vec::new()
                }
            },
            None => self.sync.apply_server(&path, &op),
        };
        self.emit(events);
    }

    fn listen_revoked(&mut self, path: Path, query: Option<Value>) {
        let query_id = match query {
            None => QueryFilter::default().query_id(),
            Some(wire) => match QueryFilter::from_wire(&wire) {
                Ok(filter) => filter.query_id(),
                Err(err) => {
                    warn!(%path, %err, "revoke for unparseable query, dropping");
                    return;
                }
            },
        };
        let (cancels, dropped) = self.sync.listen_revoked(&path, &query_id);
        self.emit(cancels);
        self.tags.remove_view(&path, &query_id);
        if dropped.view_dropped {
            self.out.push(OutEvent::DropListeners {
                listeners: dropped.listeners,
            });
        }
    }

    fn put_response(&mut self, ctx: PutCtx, result: Result<(), ServerError>, now_ms: i64) {
        match ctx {
            PutCtx::Write {
                write_id,
                completer,
            } => {
                let events = self.sync.ack_write(write_id);
                self.emit(events);
                self.out.push(OutEvent::Complete {
                    completer,
                    result: Completion::Ack(result),
                });
            }
            PutCtx::Transaction { path } => match result {
                Ok(()) => self.transactions_committed(&path),
                Err(err) if err.is_datastale() => self.transactions_stale(&path, now_ms),
                Err(err) => self.transactions_failed(&path, err),
            },
        }
    }

    fn transactions_committed(&mut self, path: &Path) {
        let mut settled = Vec::new();
        for tx in self.transactions.collect_subtree_mut(path) {
            if matches!(tx.status, TxStatus::Sent | TxStatus::SentNeedsAbort) {
                tx.status = TxStatus::Completed;
                settled.push((
                    tx.current_write_id.take(),
                    tx.completer,
                    tx.current_output_resolved.clone(),
                    tx.path.clone(),
                ));
            }
        }
        for (write_id, completer, snapshot, tx_path) in settled {
            if let Some(write_id) = write_id {
                let events = self.sync.ack_write(write_id);
                self.emit(events);
            }
            self.out.push(OutEvent::Complete {
                completer,
                result: Completion::Transaction(Ok(TransactionResult {
                    committed: true,
                    snapshot,
                })),
            });
            self.release_silent(&tx_path);
        }
        self.transactions.prune();
        self.send_ready_transactions();
    }

    fn transactions_stale(&mut self, path: &Path, now_ms: i64) {
        let mut acked = Vec::new();
        for tx in self.transactions.collect_subtree_mut(path) {
            match tx.status {
                TxStatus::Sent => {
                    tx.status = TxStatus::Pending;
                    acked.extend(tx.current_write_id.take());
                }
                TxStatus::SentNeedsAbort => {
                    acked.extend(tx.current_write_id.take());
                }
                _ => {}
            }
        }
        for write_id in acked {
            let events = self.sync.ack_write(write_id);
            self.emit(events);
        }
        self.rerun_queue(path, now_ms);
    }

    fn transactions_failed(&mut self, path: &Path, err: ServerError) {
        let mut settled = Vec::new();
        for tx in self.transactions.collect_subtree_mut(path) {
            let reason = match tx.status {
                TxStatus::Sent => TransactionError::Server(err.clone()),
                TxStatus::SentNeedsAbort => tx
                    .abort_reason
                    .clone()
                    .unwrap_or(TransactionError::Overridden),
                _ => continue,
            };
            tx.status = TxStatus::Completed;
            settled.push((tx.current_write_id.take(), tx.completer, reason, tx.path.clone()));
        }
        for (write_id, completer, reason, tx_path) in settled {
            if let Some(write_id) = write_id {
                let events = self.sync.ack_write(write_id);
                self.emit(events);
            }
            self.out.push(OutEvent::Complete {
                completer,
                result: Completion::Transaction(Err(reason)),
            });
            self.release_silent(&tx_path);
        }
        self.transactions.prune();
        self.send_ready_transactions();
    }

    /// Replays every pending transaction in the subtree, in order, against
    /// refreshed input. Completed transactions are skipped; in-flight aborts
    /// finalize here.
    fn rerun_queue(&mut self, path: &Path, now_ms: i64) {
        let max_retries = self.config.transaction_retries;
        let sync = &mut self.sync;
        let out = &mut self.out;
        let next_write_id = &mut self.next_write_id;
        let mut finished = Vec::new();
        for tx in self.transactions.collect_subtree_mut(path) {
            match tx.status {
                TxStatus::SentNeedsAbort => {
                    tx.status = TxStatus::Completed;
                    let reason = tx
                        .abort_reason
                        .clone()
                        .unwrap_or(TransactionError::Overridden);
                    out.push(OutEvent::Complete {
                        completer: tx.completer,
                        result: Completion::Transaction(Err(reason)),
                    });
                    finished.push(tx.path.clone());
                }
                TxStatus::Pending => {
                    if tx.retry_count >= max_retries {
                        tx.status = TxStatus::Completed;
                        out.push(OutEvent::Complete {
                            completer: tx.completer,
                            result: Completion::Transaction(Err(TransactionError::MaxRetries)),
                        });
                        finished.push(tx.path.clone());
                    } else if !run_transaction(tx, sync, next_write_id, now_ms, out) {
                        finished.push(tx.path.clone());
                    }
                }
                _ => {}
            }
        }
        for tx_path in finished {
            self.release_silent(&tx_path);
        }
        self.transactions.prune();
        self.send_ready_transactions();
    }

    /// Fails transactions overlapping `path`: running ones immediately,
    /// in-flight ones once their put resolves.
    fn abort_transactions(&mut self, path: &Path, reason: TransactionError) {
        let mut settled = Vec::new();
        for tx in self.transactions.collect_overlapping_mut(path) {
            match tx.status {
                // Pending only exists while a rerun is in progress, but an
                // abort then means the same thing as for a run transaction:
                // fail it now, before it goes on the wire.
                TxStatus::Run | TxStatus::Pending => {
                    tx.status = TxStatus::Completed;
                    settled.push((tx.current_write_id.take(), tx.completer, tx.path.clone()));
                }
                TxStatus::Sent => {
                    tx.status = TxStatus::SentNeedsAbort;
                    tx.abort_reason = Some(reason.clone());
                }
                TxStatus::SentNeedsAbort | TxStatus::Completed => {}
            }
        }
        for (write_id, completer, tx_path) in settled {
            if let Some(write_id) = write_id {
                let events = self.sync.ack_write(write_id);
                self.emit(events);
            }
            self.out.push(OutEvent::Complete {
                completer,
                result: Completion::Transaction(Err(reason.clone())),
            });
            self.release_silent(&tx_path);
        }
        self.transactions.prune();
    }

    /// Walks the transaction tree and sends every ready subtree as one
    /// conditional put guarded by the hash of its input snapshot.
    fn send_ready_transactions(&mut self) {
        for path in self.transactions.ready_paths() {
            let sync = &self.sync;
            let txns = self.transactions.collect_subtree_mut(&path);
            let exclude: Vec<u64> = txns.iter().filter_map(|t| t.current_write_id).collect();
            let base = sync.latest_value(&path, &exclude);
            let data = composite_output(&txns, base.clone(), &path);
            for tx in txns {
                tx.status = TxStatus::Sent;
                tx.retry_count += 1;
            }
            let hash = base.hash();
            self.transactions.node_make_mut(&path).input = base;
            self.out.push(OutEvent::Put {
                path: path.clone(),
                data: data.to_json(),
                hash: Some(hash),
                ctx: PutCtx::Transaction { path },
            });
        }
    }

    fn on_disconnect_response(
        &mut self,
        op: DisconnectOp,
        completer: CompleterId,
        result: Result<(), ServerError>,
    ) {
        if let Err(err) = result {
            self.out.push(OutEvent::Complete {
                completer,
                result: Completion::Ack(Err(err)),
            });
            return;
        }
        match op {
            DisconnectOp::Put { path, data } => {
                self.on_disconnect.remember(&path, Node::from_json(&data));
            }
            DisconnectOp::Merge { path, data } => {
                for (name, child) in json_children(&data) {
                    self.on_disconnect
                        .remember(&path.child(name), child);
                }
            }
            DisconnectOp::Cancel { path } => {
                self.on_disconnect.forget(&path);
            }
        }
        self.out.push(OutEvent::Complete {
            completer,
            result: Completion::Ack(Ok(())),
        });
    }

    /// Materializes the on-disconnect tree locally, simulating the server's
    /// disconnect handlers, and aborts transactions under the written paths.
    fn disconnected(&mut self, now_ms: i64) {
        let mut stored = Vec::new();
        self.on_disconnect.for_each(&Path::root(), &mut |path, node| {
            stored.push((path.clone(), node.clone()));
        });
        self.on_disconnect.clear();
        for (path, node) in stored {
            let resolved = node.resolve_deferred(now_ms);
            let events = self.sync.apply_server(&path, &ServerOp::Overwrite(resolved));
            self.emit(events);
            self.abort_transactions(&path, TransactionError::Overridden);
        }
    }

    fn shutdown(&mut self) {
        let mut settled = Vec::new();
        for tx in self.transactions.collect_subtree_mut(&Path::root()) {
            if tx.status != TxStatus::Completed {
                tx.status = TxStatus::Completed;
                settled.push((tx.current_write_id.take(), tx.completer));
            }
        }
        for (write_id, completer) in settled {
            if let Some(write_id) = write_id {
                let events = self.sync.ack_write(write_id);
                self.emit(events);
            }
            self.out.push(OutEvent::Complete {
                completer,
                result: Completion::Transaction(Err(TransactionError::Closed)),
            });
        }
        self.transactions.prune();
    }

    fn release_silent(&mut self, path: &Path) {
        let dropped = self.sync.remove_silent(path);
        if dropped.view_dropped {
            self.out.push(OutEvent::Unlisten {
                path: path.clone(),
                query: None,
                tag: None,
            });
        }
    }

    fn emit(&mut self, events: Vec<(ListenerId, DataEvent)>) {
        for (listener, event) in events {
            self.out.push(OutEvent::Emit { listener, event });
        }
    }
}

/// Runs one transaction attempt: read the latest local value, call the
/// update function, and stage the optimistic write. Returns false when the
/// update declined and the transaction completed uncommitted.
fn run_transaction(
    tx: &mut Transaction,
    sync: &mut SyncTree,
    next_write_id: &mut u64,
    now_ms: i64,
    out: &mut Vec<OutEvent>,
) -> bool {
    let exclude: Vec<u64> = tx.current_write_id.into_iter().collect();
    let input = sync.latest_value(&tx.path, &exclude);
    tx.current_input = input.clone();
    let Some(next) = (tx.update)(input.clone()) else {
        tx.status = TxStatus::Completed;
        out.push(OutEvent::Complete {
            completer: tx.completer,
            result: Completion::Transaction(Ok(TransactionResult {
                committed: false,
                snapshot: input,
            })),
        });
        return false;
    };
    // The input's priority carries over unless the update set its own.
    let next = if next.priority().is_none() && input.priority().is_some() {
        next.with_priority(input.priority().cloned())
    } else {
        next
    };
    tx.current_output_raw = next.clone();
    tx.current_output_resolved = next.resolve_deferred(now_ms);
    tx.status = TxStatus::Run;
    let write_id = *next_write_id;
    *next_write_id += 1;
    tx.current_write_id = Some(write_id);
    let events = sync.apply_user_overwrite(
        &tx.path,
        tx.current_output_resolved.clone(),
        write_id,
        tx.apply_locally,
    );
    for (listener, event) in events {
        out.push(OutEvent::Emit { listener, event });
    }
    true
}

fn json_children(data: &Value) -> BTreeMap<Name, Node> {
    match data {
        Value::Object(map) => map
            .iter()
            .filter(|(key, _)| !key.starts_with('.'))
            .map(|(key, value)| (Name::new(key.as_str()), Node::from_json(value)))
            .collect(),
        _ => BTreeMap::new(),
    }
}
