//! The repo: a tokio actor wiring the synchronization core to a server
//! connection, and the clone-able handle applications talk to.
//!
//! The actor owns the [`Core`] exclusively. Application calls and decoded
//! server messages become core input events; the core's output events turn
//! into connection calls (run as tasks feeding their outcome back into the
//! actor), listener deliveries, and completions.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use futures_lite::Stream;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, trace, warn};

use anyhow::bail;

use crate::core::state::{Completion, DisconnectOp, InEvent, OutEvent};
use crate::core::{
    CompleterId, Config, Core, DataEvent, EventKind, FilterError, ListenerId, Name, Node, Path,
    PathError, PushIdGenerator, QueryFilter, ServerError, Tag, TransactionError,
    TransactionResult, UpdateFn,
};

/// Channel capacity for the ToActor message queue (single)
const TO_ACTOR_CAP: usize = 64;
/// Channel capacity for the feedback queue carrying request outcomes (single)
const FEEDBACK_CAP: usize = 1024;
/// Channel capacity for each subscription's event queue (one per listener)
const SUBSCRIPTION_CAP: usize = 256;

/// The duplex server connection the repo drives.
///
/// Implementations own wire framing, reconnection and transport retries; the
/// repo only sees final outcomes. Incoming pushes and connectivity changes
/// arrive on the [`ConnectionEvent`] channel handed to [`Repo::spawn`].
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Authenticates with the server, returning auth data.
    async fn auth(&self, token: &str) -> Result<Value, ServerError>;

    /// Drops authentication.
    async fn unauth(&self) -> Result<(), ServerError>;

    /// Writes `data` at `path`. With `hash` the write is conditional on the
    /// server's current value hashing to it.
    async fn put(&self, path: &Path, data: Value, hash: Option<String>)
        -> Result<(), ServerError>;

    /// Overwrites the children named in `data` at `path`.
    async fn merge(&self, path: &Path, data: Value) -> Result<(), ServerError>;

    /// Establishes a listen, returning server warnings about the query.
    async fn listen(
        &self,
        path: &Path,
        query: Option<Value>,
        tag: Option<Tag>,
    ) -> Result<Vec<String>, ServerError>;

    /// Tears down a listen.
    async fn unlisten(
        &self,
        path: &Path,
        query: Option<Value>,
        tag: Option<Tag>,
    ) -> Result<(), ServerError>;

    /// Registers a value to be written when this client disconnects.
    async fn on_disconnect_put(&self, path: &Path, data: Value) -> Result<(), ServerError>;

    /// Registers children to be written when this client disconnects.
    async fn on_disconnect_merge(&self, path: &Path, data: Value) -> Result<(), ServerError>;

    /// Cancels registered disconnect writes at or below `path`.
    async fn on_disconnect_cancel(&self, path: &Path) -> Result<(), ServerError>;

    /// Server-synchronized wall clock, milliseconds since the epoch.
    fn server_time(&self) -> i64;
}

/// Connectivity changes and pushes delivered by the connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection came up.
    Connected,
    /// The connection dropped.
    Disconnected,
    /// The server pushed a message.
    Message(ServerMessage),
}

/// A decoded message from the server. Paths are in wire form.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Authoritative overwrite.
    Set {
        /// Wire path.
        path: String,
        /// Correlation tag of the originating filtered listen.
        tag: Option<Tag>,
        /// Wire JSON.
        data: Value,
    },
    /// Authoritative merge.
    Merge {
        /// Wire path.
        path: String,
        /// Correlation tag of the originating filtered listen.
        tag: Option<Tag>,
        /// Wire JSON object.
        data: Value,
    },
    /// The server revoked this client's authentication.
    AuthRevoked,
    /// The server revoked a listen.
    ListenRevoked {
        /// Wire path.
        path: String,
        /// The wire query of the revoked listen.
        query: Option<Value>,
    },
    /// A security rule debug message to surface in logs.
    SecurityDebug {
        /// The server's message.
        message: String,
    },
}

/// Errors surfaced by [`Repo`] operations.
#[derive(Debug, Error)]
pub enum RepoError {
    /// The repo actor is gone.
    #[error("repo closed")]
    Closed,
    /// The server rejected the operation.
    #[error(transparent)]
    Server(#[from] ServerError),
    /// The transaction failed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// A path failed to parse.
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    /// A query filter was inconsistent.
    #[error(transparent)]
    InvalidFilter(#[from] FilterError),
}

/// Input messages for the repo [`Actor`].
#[derive(derive_more::Debug)]
enum ToActor {
    Set {
        path: Path,
        data: Value,
        #[debug(skip)]
        reply: oneshot::Sender<Result<(), RepoError>>,
    },
    Update {
        path: Path,
        data: Value,
        #[debug(skip)]
        reply: oneshot::Sender<Result<(), RepoError>>,
    },
    Push {
        path: Path,
        data: Value,
        #[debug(skip)]
        reply: oneshot::Sender<Result<Name, RepoError>>,
    },
    Subscribe {
        path: Path,
        filter: QueryFilter,
        kind: EventKind,
        #[debug(skip)]
        reply: oneshot::Sender<(ListenerId, mpsc::Receiver<DataEvent>)>,
    },
    Unsubscribe {
        path: Path,
        filter: QueryFilter,
        listener: ListenerId,
    },
    Transaction {
        path: Path,
        #[debug(skip)]
        update: UpdateFn,
        apply_locally: bool,
        #[debug(skip)]
        reply: oneshot::Sender<Result<TransactionResult, RepoError>>,
    },
    OnDisconnect {
        op: DisconnectOp,
        #[debug(skip)]
        reply: oneshot::Sender<Result<(), RepoError>>,
    },
    GetLocal {
        path: Path,
        #[debug(skip)]
        reply: oneshot::Sender<Node>,
    },
    Auth {
        token: String,
        #[debug(skip)]
        reply: oneshot::Sender<Result<Value, RepoError>>,
    },
    Unauth {
        #[debug(skip)]
        reply: oneshot::Sender<Result<(), RepoError>>,
    },
    Shutdown,
}

/// Outcomes flowing back into the actor from request tasks.
enum Feedback {
    Core(InEvent),
    AuthChanged(Option<Value>),
}

/// Pending completion handles, resolved by core `Complete` events.
enum Completer {
    Ack(oneshot::Sender<Result<(), RepoError>>),
    Push {
        name: Name,
        reply: oneshot::Sender<Result<Name, RepoError>>,
    },
    Transaction(oneshot::Sender<Result<TransactionResult, RepoError>>),
    Local(oneshot::Sender<Node>),
}

/// A live view on a remote database, backed by a spawned actor.
///
/// Cheap to clone; the actor stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct Repo {
    to_actor_tx: mpsc::Sender<ToActor>,
    connected_rx: watch::Receiver<bool>,
    auth_rx: watch::Receiver<Option<Value>>,
    _actor_handle: Arc<JoinHandle<()>>,
}

impl Repo {
    /// Spawns the repo actor over a connection and its event stream.
    pub fn spawn<C: Connection>(
        conn: C,
        conn_events: mpsc::Receiver<ConnectionEvent>,
        config: Config,
    ) -> Self {
        let (to_actor_tx, to_actor_rx) = mpsc::channel(TO_ACTOR_CAP);
        let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_CAP);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (auth_tx, auth_rx) = watch::channel(None);
        let actor = Actor {
            conn: Arc::new(conn),
            core: Core::new(config),
            to_actor_rx,
            conn_events_rx: conn_events,
            conn_events_closed: false,
            feedback_tx,
            feedback_rx,
            completers: Default::default(),
            next_completer: 0,
            subscribers: Default::default(),
            next_listener: 0,
            push_ids: PushIdGenerator::new(StdRng::from_entropy()),
            connected_tx,
            auth_tx,
            tasks: JoinSet::new(),
        };
        let actor_handle = tokio::spawn(async move {
            if let Err(err) = actor.run().await {
                warn!("repo actor closed with error: {err:?}");
            }
        });
        Self {
            to_actor_tx,
            connected_rx,
            auth_rx,
            _actor_handle: Arc::new(actor_handle),
        }
    }

    /// Overwrites the subtree at `path`, resolving when the server accepts.
    pub async fn set(&self, path: &str, data: Value) -> Result<(), RepoError> {
        let path = Path::parse(path)?;
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::Set {
            path,
            data,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| RepoError::Closed)?
    }

    /// Overwrites the subtree at `path` with an explicit priority.
    pub async fn set_with_priority(
        &self,
        path: &str,
        data: Value,
        priority: Value,
    ) -> Result<(), RepoError> {
        let payload = serde_json::json!({ ".value": data, ".priority": priority });
        self.set(path, payload).await
    }

    /// Atomically overwrites the children of `path` named in `data`.
    pub async fn update(&self, path: &str, data: Value) -> Result<(), RepoError> {
        let path = Path::parse(path)?;
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::Update {
            path,
            data,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| RepoError::Closed)?
    }

    /// Writes `data` under a fresh chronologically ordered child key of
    /// `path` and returns that key.
    pub async fn push(&self, path: &str, data: Value) -> Result<Name, RepoError> {
        let path = Path::parse(path)?;
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::Push {
            path,
            data,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| RepoError::Closed)?
    }

    /// Subscribes to `kind` events on the `filter` view at `path`.
    ///
    /// Initial events for a view that already has state arrive on the
    /// returned stream, never inline.
    pub async fn subscribe(
        &self,
        path: &str,
        filter: QueryFilter,
        kind: EventKind,
    ) -> Result<Subscription, RepoError> {
        let path = Path::parse(path)?;
        filter.validate()?;
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::Subscribe {
            path: path.clone(),
            filter: filter.clone(),
            kind,
            reply: tx,
        })
        .await?;
        let (listener, events) = rx.await.map_err(|_| RepoError::Closed)?;
        Ok(Subscription {
            listener,
            path,
            filter,
            events,
            to_actor_tx: self.to_actor_tx.clone(),
        })
    }

    /// Runs `update` as a compare-and-set transaction at `path`.
    ///
    /// The function is called with the latest local value and may be called
    /// again after conflicts; returning `None` aborts with an uncommitted
    /// result. With `apply_locally`, intermediate states render in local
    /// views while the transaction is in flight.
    pub async fn run_transaction(
        &self,
        path: &str,
        update: impl FnMut(Node) -> Option<Node> + Send + 'static,
        apply_locally: bool,
    ) -> Result<TransactionResult, RepoError> {
        let path = Path::parse(path)?;
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::Transaction {
            path,
            update: Box::new(update),
            apply_locally,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| RepoError::Closed)?
    }

    /// Registers `data` to be written at `path` when this client disconnects.
    pub async fn on_disconnect_set(&self, path: &str, data: Value) -> Result<(), RepoError> {
        let path = Path::parse(path)?;
        self.on_disconnect(DisconnectOp::Put { path, data }).await
    }

    /// Registers a merge to run at `path` when this client disconnects.
    pub async fn on_disconnect_update(&self, path: &str, data: Value) -> Result<(), RepoError> {
        let path = Path::parse(path)?;
        self.on_disconnect(DisconnectOp::Merge { path, data }).await
    }

    /// Cancels registered disconnect writes at or below `path`.
    pub async fn on_disconnect_cancel(&self, path: &str) -> Result<(), RepoError> {
        let path = Path::parse(path)?;
        self.on_disconnect(DisconnectOp::Cancel { path }).await
    }

    async fn on_disconnect(&self, op: DisconnectOp) -> Result<(), RepoError> {
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::OnDisconnect { op, reply: tx }).await?;
        rx.await.map_err(|_| RepoError::Closed)?
    }

    /// Reads the current unfiltered local version at `path`.
    pub async fn get_local(&self, path: &str) -> Result<Node, RepoError> {
        let path = Path::parse(path)?;
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::GetLocal { path, reply: tx }).await?;
        rx.await.map_err(|_| RepoError::Closed)
    }

    /// Authenticates the connection; auth data is also published on
    /// [`Repo::auth_state`].
    pub async fn auth(&self, token: &str) -> Result<Value, RepoError> {
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::Auth {
            token: token.to_string(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| RepoError::Closed)?
    }

    /// Drops authentication.
    pub async fn unauth(&self) -> Result<(), RepoError> {
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::Unauth { reply: tx }).await?;
        rx.await.map_err(|_| RepoError::Closed)?
    }

    /// Watches connectivity as reported by the connection.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Watches auth data; `None` after an `unauth` or a server-side revoke.
    pub fn auth_state(&self) -> watch::Receiver<Option<Value>> {
        self.auth_rx.clone()
    }

    /// Shuts the actor down, failing everything still pending.
    pub async fn shutdown(&self) -> Result<(), RepoError> {
        self.send(ToActor::Shutdown).await
    }

    async fn send(&self, msg: ToActor) -> Result<(), RepoError> {
        self.to_actor_tx
            .send(msg)
            .await
            .map_err(|_| RepoError::Closed)
    }
}

/// A stream of [`DataEvent`]s for one listener.
///
/// Dropping the subscription detaches the listener; [`Subscription::stop`]
/// does the same but waits until the actor processed it.
#[derive(derive_more::Debug)]
pub struct Subscription {
    listener: ListenerId,
    path: Path,
    filter: QueryFilter,
    #[debug(skip)]
    events: mpsc::Receiver<DataEvent>,
    #[debug(skip)]
    to_actor_tx: mpsc::Sender<ToActor>,
}

impl Subscription {
    /// The listener's identity.
    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    /// Receives the next event; `None` once the view is gone.
    pub async fn recv(&mut self) -> Option<DataEvent> {
        self.events.recv().await
    }

    /// Detaches the listener and waits for the actor to take note.
    pub async fn stop(mut self) -> Result<(), RepoError> {
        self.events.close();
        self.to_actor_tx
            .send(ToActor::Unsubscribe {
                path: self.path.clone(),
                filter: self.filter.clone(),
                listener: self.listener,
            })
            .await
            .map_err(|_| RepoError::Closed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Best effort; a full queue is fine, the actor also reaps listeners
        // whose channels are gone when it next delivers to them.
        self.to_actor_tx
            .try_send(ToActor::Unsubscribe {
                path: self.path.clone(),
                filter: self.filter.clone(),
                listener: self.listener,
            })
            .ok();
    }
}

impl Stream for Subscription {
    type Item = DataEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// Actor mediating between the core state machine and the connection.
struct Actor<C> {
    conn: Arc<C>,
    core: Core,
    /// Input messages to the actor
    to_actor_rx: mpsc::Receiver<ToActor>,
    /// Connectivity and pushes from the connection
    conn_events_rx: mpsc::Receiver<ConnectionEvent>,
    conn_events_closed: bool,
    /// Sender for request outcomes (cloned into request tasks)
    feedback_tx: mpsc::Sender<Feedback>,
    /// Request outcomes flowing back into the core
    feedback_rx: mpsc::Receiver<Feedback>,
    /// Pending completion handles by id
    completers: HashMap<CompleterId, Completer>,
    next_completer: u64,
    /// Delivery channels for active listeners
    subscribers: HashMap<ListenerId, (mpsc::Sender<DataEvent>, Path, QueryFilter)>,
    next_listener: u64,
    push_ids: PushIdGenerator<StdRng>,
    connected_tx: watch::Sender<bool>,
    auth_tx: watch::Sender<Option<Value>>,
    /// Connection request tasks in flight
    tasks: JoinSet<()>,
}

impl<C: Connection> Actor<C> {
    async fn run(mut self) -> anyhow::Result<()> {
        let result = self.run_loop().await;
        self.close();
        result
    }

    async fn run_loop(&mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                biased;
                msg = self.to_actor_rx.recv() => {
                    match msg {
                        Some(ToActor::Shutdown) => break,
                        Some(msg) => self.handle_to_actor(msg),
                        None => {
                            debug!("all repo handles dropped, stopping actor");
                            break;
                        }
                    }
                }
                event = self.conn_events_rx.recv(), if !self.conn_events_closed => {
                    match event {
                        Some(event) => self.handle_conn_event(event),
                        None => {
                            debug!("connection event stream ended");
                            self.conn_events_closed = true;
                            self.dispatch(InEvent::Disconnected);
                        }
                    }
                }
                feedback = self.feedback_rx.recv() => {
                    match feedback {
                        Some(Feedback::Core(event)) => self.dispatch(event),
                        Some(Feedback::AuthChanged(auth)) => {
                            self.auth_tx.send_replace(auth);
                        }
                        None => bail!("feedback channel closed while the actor holds a sender"),
                    }
                }
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(err) = res {
                        if !err.is_cancelled() {
                            error!("request task panicked: {err:?}");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_to_actor(&mut self, msg: ToActor) {
        trace!("handle to_actor {msg:?}");
        match msg {
            ToActor::Set { path, data, reply } => {
                let completer = self.completer(Completer::Ack(reply));
                self.dispatch(InEvent::Set {
                    path,
                    data,
                    completer,
                });
            }
            ToActor::Update { path, data, reply } => {
                let completer = self.completer(Completer::Ack(reply));
                self.dispatch(InEvent::Update {
                    path,
                    data,
                    completer,
                });
            }
            ToActor::Push { path, data, reply } => {
                let name = Name::new(self.push_ids.next_id(self.conn.server_time()));
                let completer = self.completer(Completer::Push {
                    name: name.clone(),
                    reply,
                });
                self.dispatch(InEvent::Set {
                    path: path.child(name),
                    data,
                    completer,
                });
            }
            ToActor::Subscribe {
                path,
                filter,
                kind,
                reply,
            } => {
                self.next_listener += 1;
                let listener = ListenerId(self.next_listener);
                let (events_tx, events_rx) = mpsc::channel(SUBSCRIPTION_CAP);
                self.subscribers
                    .insert(listener, (events_tx, path.clone(), filter.clone()));
                if reply.send((listener, events_rx)).is_err() {
                    self.subscribers.remove(&listener);
                    return;
                }
                self.dispatch(InEvent::Listen {
                    path,
                    filter,
                    kind,
                    listener,
                });
            }
            ToActor::Unsubscribe {
                path,
                filter,
                listener,
            } => {
                self.subscribers.remove(&listener);
                self.dispatch(InEvent::Unlisten {
                    path,
                    filter,
                    listener,
                });
            }
            ToActor::Transaction {
                path,
                update,
                apply_locally,
                reply,
            } => {
                let completer = self.completer(Completer::Transaction(reply));
                self.dispatch(InEvent::Transaction {
                    path,
                    update,
                    apply_locally,
                    completer,
                });
            }
            ToActor::OnDisconnect { op, reply } => {
                let completer = self.completer(Completer::Ack(reply));
                self.dispatch(InEvent::OnDisconnect { op, completer });
            }
            ToActor::GetLocal { path, reply } => {
                let completer = self.completer(Completer::Local(reply));
                self.dispatch(InEvent::LocalRead { path, completer });
            }
            ToActor::Auth { token, reply } => {
                let conn = self.conn.clone();
                let feedback = self.feedback_tx.clone();
                self.tasks.spawn(async move {
                    let result = conn.auth(&token).await;
                    if let Ok(data) = &result {
                        feedback
                            .send(Feedback::AuthChanged(Some(data.clone())))
                            .await
                            .ok();
                    }
                    reply.send(result.map_err(RepoError::from)).ok();
                });
            }
            ToActor::Unauth { reply } => {
                let conn = self.conn.clone();
                let feedback = self.feedback_tx.clone();
                self.tasks.spawn(async move {
                    let result = conn.unauth().await;
                    if result.is_ok() {
                        feedback.send(Feedback::AuthChanged(None)).await.ok();
                    }
                    reply.send(result.map_err(RepoError::from)).ok();
                });
            }
            ToActor::Shutdown => unreachable!("handled in the select loop"),
        }
    }

    fn handle_conn_event(&mut self, event: ConnectionEvent) {
        trace!("handle conn_event {event:?}");
        match event {
            ConnectionEvent::Connected => {
                self.connected_tx.send_replace(true);
                self.dispatch(InEvent::Connected);
            }
            ConnectionEvent::Disconnected => {
                self.connected_tx.send_replace(false);
                self.dispatch(InEvent::Disconnected);
            }
            ConnectionEvent::Message(message) => self.handle_server_message(message),
        }
    }

    fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Set { path, tag, data } => match Path::parse(&path) {
                Ok(path) => self.dispatch(InEvent::ServerSet { path, tag, data }),
                Err(err) => warn!(%path, %err, "dropping server set with invalid path"),
            },
            ServerMessage::Merge { path, tag, data } => match Path::parse(&path) {
                Ok(path) => self.dispatch(InEvent::ServerMerge { path, tag, data }),
                Err(err) => warn!(%path, %err, "dropping server merge with invalid path"),
            },
            ServerMessage::ListenRevoked { path, query } => match Path::parse(&path) {
                Ok(path) => self.dispatch(InEvent::ListenRevoked { path, query }),
                Err(err) => warn!(%path, %err, "dropping revoke with invalid path"),
            },
            ServerMessage::AuthRevoked => {
                self.auth_tx.send_replace(None);
            }
            ServerMessage::SecurityDebug { message } => {
                warn!("server security debug: {message}");
            }
        }
    }

    fn completer(&mut self, completer: Completer) -> CompleterId {
        self.next_completer += 1;
        let id = CompleterId(self.next_completer);
        self.completers.insert(id, completer);
        id
    }

    /// Feeds one event into the core and performs the resulting IO.
    fn dispatch(&mut self, event: InEvent) {
        let now = self.conn.server_time();
        let mut queue: VecDeque<OutEvent> = self.core.handle(event, now).into();
        while let Some(out) = queue.pop_front() {
            trace!("handle out_event {out:?}");
            match out {
                OutEvent::Listen { path, query, tag } => {
                    let conn = self.conn.clone();
                    let feedback = self.feedback_tx.clone();
                    self.tasks.spawn(async move {
                        match conn.listen(&path, query.clone(), tag).await {
                            Ok(warnings) => {
                                for warning in warnings {
                                    warn!(%path, "listen warning: {warning}");
                                }
                            }
                            Err(err) => {
                                warn!(%path, %err, "listen rejected");
                                feedback
                                    .send(Feedback::Core(InEvent::ListenRevoked { path, query }))
                                    .await
                                    .ok();
                            }
                        }
                    });
                }
                OutEvent::Unlisten { path, query, tag } => {
                    let conn = self.conn.clone();
                    self.tasks.spawn(async move {
                        if let Err(err) = conn.unlisten(&path, query, tag).await {
                            debug!(%path, %err, "unlisten failed");
                        }
                    });
                }
                OutEvent::Put {
                    path,
                    data,
                    hash,
                    ctx,
                } => {
                    let conn = self.conn.clone();
                    let feedback = self.feedback_tx.clone();
                    self.tasks.spawn(async move {
                        let result = conn.put(&path, data, hash).await;
                        feedback
                            .send(Feedback::Core(InEvent::PutResponse { ctx, result }))
                            .await
                            .ok();
                    });
                }
                OutEvent::Merge { path, data, ctx } => {
                    let conn = self.conn.clone();
                    let feedback = self.feedback_tx.clone();
                    self.tasks.spawn(async move {
                        let result = conn.merge(&path, data).await;
                        feedback
                            .send(Feedback::Core(InEvent::PutResponse { ctx, result }))
                            .await
                            .ok();
                    });
                }
                OutEvent::OnDisconnect { op, completer } => {
                    let conn = self.conn.clone();
                    let feedback = self.feedback_tx.clone();
                    self.tasks.spawn(async move {
                        let result = match &op {
                            DisconnectOp::Put { path, data } => {
                                conn.on_disconnect_put(path, data.clone()).await
                            }
                            DisconnectOp::Merge { path, data } => {
                                conn.on_disconnect_merge(path, data.clone()).await
                            }
                            DisconnectOp::Cancel { path } => {
                                conn.on_disconnect_cancel(path).await
                            }
                        };
                        feedback
                            .send(Feedback::Core(InEvent::OnDisconnectResponse {
                                op,
                                completer,
                                result,
                            }))
                            .await
                            .ok();
                    });
                }
                OutEvent::Emit { listener, event } => {
                    let Some((sender, _, _)) = self.subscribers.get(&listener) else {
                        trace!(%listener, "event for unknown listener dropped");
                        continue;
                    };
                    match sender.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(%listener, "subscriber lagging, dropping event");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            let (_, path, filter) =
                                self.subscribers.remove(&listener).expect("present");
                            let more = self.core.handle(
                                InEvent::Unlisten {
                                    path,
                                    filter,
                                    listener,
                                },
                                now,
                            );
                            queue.extend(more);
                        }
                    }
                }
                OutEvent::DropListeners { listeners } => {
                    for listener in listeners {
                        self.subscribers.remove(&listener);
                    }
                }
                OutEvent::Complete { completer, result } => self.complete(completer, result),
            }
        }
    }

    fn complete(&mut self, id: CompleterId, result: Completion) {
        let Some(completer) = self.completers.remove(&id) else {
            error!(?id, "completion for unknown handle");
            return;
        };
        match (completer, result) {
            (Completer::Ack(reply), Completion::Ack(result)) => {
                reply.send(result.map_err(RepoError::from)).ok();
            }
            (Completer::Push { name, reply }, Completion::Ack(result)) => {
                reply
                    .send(result.map(|()| name).map_err(RepoError::from))
                    .ok();
            }
            (Completer::Transaction(reply), Completion::Transaction(result)) => {
                reply.send(result.map_err(RepoError::from)).ok();
            }
            (Completer::Local(reply), Completion::Local(node)) => {
                reply.send(node).ok();
            }
            _ => error!(?id, "completion kind mismatch"),
        }
    }

    /// Fails everything pending and drops all subscribers.
    fn close(&mut self) {
        self.dispatch(InEvent::Shutdown);
        for (_, completer) in self.completers.drain() {
            match completer {
                Completer::Ack(reply) => {
                    reply.send(Err(RepoError::Closed)).ok();
                }
                Completer::Push { reply, .. } => {
                    reply.send(Err(RepoError::Closed)).ok();
                }
                Completer::Transaction(reply) => {
                    reply.send(Err(RepoError::Closed)).ok();
                }
                Completer::Local(_) => {}
            }
        }
        self.subscribers.clear();
        self.tasks.abort_all();
    }
}
