//! End-to-end scenarios driving the core state machine synchronously.

use serde_json::{json, Value};
use tracing_subscriber::{prelude::*, EnvFilter};

use super::state::{Completion, Config, Core, InEvent, OutEvent, PutCtx};
use super::transaction::TransactionError;
use super::view::{DataEvent, EventKind, ListenerId};
use super::{CompleterId, Node, Path, QueryFilter, ServerError};

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

fn path(s: &str) -> Path {
    Path::parse(s).unwrap()
}

fn emits(events: &[OutEvent]) -> Vec<(ListenerId, DataEvent)> {
    events
        .iter()
        .filter_map(|e| match e {
            OutEvent::Emit { listener, event } => Some((*listener, event.clone())),
            _ => None,
        })
        .collect()
}

fn completions(events: &[OutEvent]) -> Vec<(CompleterId, &Completion)> {
    events
        .iter()
        .filter_map(|e| match e {
            OutEvent::Complete { completer, result } => Some((*completer, result)),
            _ => None,
        })
        .collect()
}

/// Extracts the single put out of a batch of events.
fn single_put(events: &[OutEvent]) -> (Path, Value, Option<String>, PutCtx) {
    let mut puts = events.iter().filter_map(|e| match e {
        OutEvent::Put {
            path,
            data,
            hash,
            ctx,
        } => Some((path.clone(), data.clone(), hash.clone(), ctx.clone())),
        _ => None,
    });
    let put = puts.next().expect("expected a put");
    assert!(puts.next().is_none(), "expected exactly one put");
    put
}

fn value_listener(core: &mut Core, path_str: &str, id: u64) -> ListenerId {
    let listener = ListenerId(id);
    core.handle(
        InEvent::Listen {
            path: path(path_str),
            filter: QueryFilter::default(),
            kind: EventKind::Value,
            listener,
        },
        0,
    );
    listener
}

#[test]
fn listen_local_set_and_failed_ack() {
    setup_logging();
    let mut core = Core::new(Config::default());
    let listener = value_listener(&mut core, "/a", 1);

    let out = core.handle(
        InEvent::ServerSet {
            path: path("/a"),
            tag: None,
            data: json!({"x": 1}),
        },
        0,
    );
    let events = emits(&out);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.node, Node::from_json(&json!({"x": 1})));

    let out = core.handle(
        InEvent::Set {
            path: path("/a/x"),
            data: json!(2),
            completer: CompleterId(10),
        },
        0,
    );
    let events = emits(&out);
    assert_eq!(events[0].1.node, Node::from_json(&json!({"x": 2})));
    let (put_path, data, hash, ctx) = single_put(&out);
    assert_eq!(put_path, path("/a/x"));
    assert_eq!(data, json!(2));
    assert!(hash.is_none());

    // The server rejects the write: the local version reverts and the
    // caller's completion carries the error.
    let out = core.handle(
        InEvent::PutResponse {
            ctx,
            result: Err(ServerError::new("permission_denied")),
        },
        0,
    );
    let events = emits(&out);
    assert_eq!(events[0].0, listener);
    assert_eq!(events[0].1.node, Node::from_json(&json!({"x": 1})));
    let done = completions(&out);
    assert_eq!(done.len(), 1);
    assert!(matches!(
        done[0],
        (CompleterId(10), Completion::Ack(Err(err))) if err.code == "permission_denied"
    ));
}

#[test]
fn server_merge_emits_child_events() {
    setup_logging();
    let mut core = Core::new(Config::default());
    let changed = ListenerId(1);
    let added = ListenerId(2);
    for (listener, kind) in [(changed, EventKind::ChildChanged), (added, EventKind::ChildAdded)] {
        core.handle(
            InEvent::Listen {
                path: path("/r"),
                filter: QueryFilter::default(),
                kind,
                listener,
            },
            0,
        );
    }
    core.handle(
        InEvent::ServerSet {
            path: path("/r"),
            tag: None,
            data: json!({"a": 1, "b": 2}),
        },
        0,
    );
    let out = core.handle(
        InEvent::ServerMerge {
            path: path("/r"),
            tag: None,
            data: json!({"b": 3, "c": 4}),
        },
        0,
    );
    let events = emits(&out);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, added);
    assert_eq!(events[0].1.child, Some("c".into()));
    assert_eq!(events[1].0, changed);
    assert_eq!(events[1].1.child, Some("b".into()));
}

#[test]
fn transaction_conflict_rerun_and_commit() {
    setup_logging();
    let mut core = Core::new(Config::default());
    value_listener(&mut core, "/n", 1);
    core.handle(
        InEvent::ServerSet {
            path: path("/n"),
            tag: None,
            data: json!(5),
        },
        0,
    );

    let increment = |node: Node| {
        let current = node.leaf_value().and_then(|v| v.as_i64()).unwrap_or(0);
        Some(Node::leaf(current + 1))
    };
    let out = core.handle(
        InEvent::Transaction {
            path: path("/n"),
            update: Box::new(increment),
            apply_locally: true,
            completer: CompleterId(7),
        },
        0,
    );
    let (_, data, hash, ctx) = single_put(&out);
    assert_eq!(data, json!(6));
    assert_eq!(hash, Some(Node::leaf(5).hash()));

    // Someone else won the race: the server pushes 7, then reports the put
    // stale. The rerun feeds 7 and sends again with the fresh hash.
    core.handle(
        InEvent::ServerSet {
            path: path("/n"),
            tag: None,
            data: json!(7),
        },
        0,
    );
    let out = core.handle(
        InEvent::PutResponse {
            ctx,
            result: Err(ServerError::new("datastale")),
        },
        0,
    );
    let (_, data, hash, ctx) = single_put(&out);
    assert_eq!(data, json!(8));
    assert_eq!(hash, Some(Node::leaf(7).hash()));

    let out = core.handle(InEvent::PutResponse { ctx, result: Ok(()) }, 0);
    let done = completions(&out);
    assert_eq!(done.len(), 1);
    match done[0] {
        (CompleterId(7), Completion::Transaction(Ok(result))) => {
            assert!(result.committed);
            assert_eq!(result.snapshot, Node::leaf(8));
        }
        other => panic!("unexpected completion {other:?}"),
    }
}

#[test]
fn transaction_decline_completes_uncommitted() {
    setup_logging();
    let mut core = Core::new(Config::default());
    let out = core.handle(
        InEvent::Transaction {
            path: path("/t"),
            update: Box::new(|_| None),
            apply_locally: true,
            completer: CompleterId(1),
        },
        0,
    );
    // The silent listen goes up and straight back down; no put goes out.
    assert!(matches!(out[0], OutEvent::Listen { .. }));
    assert!(out.iter().any(|e| matches!(e, OutEvent::Unlisten { .. })));
    assert!(!out.iter().any(|e| matches!(e, OutEvent::Put { .. })));
    match completions(&out)[0] {
        (_, Completion::Transaction(Ok(result))) => {
            assert!(!result.committed);
            assert_eq!(result.snapshot, Node::Empty);
        }
        other => panic!("unexpected completion {other:?}"),
    }
}

#[test]
fn transaction_retry_budget_is_25_sends() {
    setup_logging();
    let mut core = Core::new(Config::default());
    let out = core.handle(
        InEvent::Transaction {
            path: path("/r"),
            update: Box::new(|_| Some(Node::leaf(1))),
            apply_locally: true,
            completer: CompleterId(1),
        },
        0,
    );
    let mut sends = 1;
    let (_, _, _, mut ctx) = single_put(&out);
    loop {
        let out = core.handle(
            InEvent::PutResponse {
                ctx,
                result: Err(ServerError::new("datastale")),
            },
            0,
        );
        if let Some((_, result)) = completions(&out).first() {
            assert!(matches!(
                result,
                Completion::Transaction(Err(TransactionError::MaxRetries))
            ));
            break;
        }
        let (_, _, _, next_ctx) = single_put(&out);
        ctx = next_ctx;
        sends += 1;
        assert!(sends <= 25, "transaction kept sending past the budget");
    }
    assert_eq!(sends, 25);
}

#[test]
fn overlapping_set_aborts_transactions() {
    setup_logging();
    let mut core = Core::new(Config::default());
    // First transaction goes on the wire; the second queues behind it.
    let out = core.handle(
        InEvent::Transaction {
            path: path("/p"),
            update: Box::new(|_| Some(Node::leaf(1))),
            apply_locally: true,
            completer: CompleterId(1),
        },
        0,
    );
    let (_, _, _, ctx) = single_put(&out);
    let out = core.handle(
        InEvent::Transaction {
            path: path("/p"),
            update: Box::new(|_| Some(Node::leaf(2))),
            apply_locally: true,
            completer: CompleterId(2),
        },
        0,
    );
    assert!(!out.iter().any(|e| matches!(e, OutEvent::Put { .. })));

    // An explicit set at the path kills the queued one immediately.
    let out = core.handle(
        InEvent::Set {
            path: path("/p"),
            data: json!(9),
            completer: CompleterId(3),
        },
        0,
    );
    let aborted: Vec<_> = completions(&out)
        .into_iter()
        .filter(|(id, _)| *id == CompleterId(2))
        .collect();
    assert!(matches!(
        aborted[0].1,
        Completion::Transaction(Err(TransactionError::Overridden))
    ));

    // The in-flight one finalizes the same way once its response lands.
    let out = core.handle(
        InEvent::PutResponse {
            ctx,
            result: Err(ServerError::new("datastale")),
        },
        0,
    );
    let done = completions(&out);
    assert!(matches!(
        done[0],
        (CompleterId(1), Completion::Transaction(Err(TransactionError::Overridden)))
    ));
}

#[test]
fn on_disconnect_replays_locally() {
    setup_logging();
    let mut core = Core::new(Config::default());
    let listener = value_listener(&mut core, "/a", 1);

    for (op_path, data, completer) in [
        ("/a", json!({"x": 1}), CompleterId(10)),
        ("/a/y", json!(2), CompleterId(11)),
    ] {
        let out = core.handle(
            InEvent::OnDisconnect {
                op: super::state::DisconnectOp::Put {
                    path: path(op_path),
                    data: data.clone(),
                },
                completer,
            },
            0,
        );
        let OutEvent::OnDisconnect { op, completer } = &out[0] else {
            panic!("expected on-disconnect call");
        };
        let out = core.handle(
            InEvent::OnDisconnectResponse {
                op: op.clone(),
                completer: *completer,
                result: Ok(()),
            },
            0,
        );
        assert!(matches!(
            completions(&out)[0],
            (_, Completion::Ack(Ok(())))
        ));
    }

    let out = core.handle(InEvent::Disconnected, 0);
    let events = emits(&out);
    assert_eq!(events.last().unwrap().0, listener);
    let out = core.handle(
        InEvent::LocalRead {
            path: path("/a"),
            completer: CompleterId(20),
        },
        0,
    );
    match completions(&out)[0] {
        (_, Completion::Local(node)) => {
            assert_eq!(*node, Node::from_json(&json!({"x": 1, "y": 2})));
        }
        other => panic!("unexpected completion {other:?}"),
    }

    // The sparse tree was cleared: a second drop replays nothing.
    let out = core.handle(InEvent::Disconnected, 0);
    assert!(emits(&out).is_empty());
}

#[test]
fn filtered_listens_are_tagged_and_revokes_clear_the_tag() {
    setup_logging();
    let mut core = Core::new(Config::default());
    let filter = QueryFilter {
        limit: Some(2),
        ..Default::default()
    };
    let listener = ListenerId(1);
    let cancel_listener = ListenerId(2);
    let out = core.handle(
        InEvent::Listen {
            path: path("/q"),
            filter: filter.clone(),
            kind: EventKind::Value,
            listener,
        },
        0,
    );
    let tag = match &out[0] {
        OutEvent::Listen {
            query: Some(_),
            tag: Some(tag),
            ..
        } => *tag,
        other => panic!("expected tagged listen, got {other:?}"),
    };
    core.handle(
        InEvent::Listen {
            path: path("/q"),
            filter: filter.clone(),
            kind: EventKind::Cancel,
            listener: cancel_listener,
        },
        0,
    );

    let out = core.handle(
        InEvent::ServerSet {
            path: path("/q"),
            tag: Some(tag),
            data: json!({"a": 1}),
        },
        0,
    );
    let events = emits(&out);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, listener);

    let out = core.handle(
        InEvent::ListenRevoked {
            path: path("/q"),
            query: Some(filter.to_wire()),
        },
        0,
    );
    let events = emits(&out);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, cancel_listener);
    assert_eq!(events[0].1.kind, EventKind::Cancel);
    assert!(out
        .iter()
        .any(|e| matches!(e, OutEvent::DropListeners { listeners } if listeners.len() == 2)));

    // Both directions of the tag table are gone: a late push with the old
    // tag is dropped on the floor.
    let out = core.handle(
        InEvent::ServerSet {
            path: path("/q"),
            tag: Some(tag),
            data: json!({"b": 2}),
        },
        0,
    );
    assert!(emits(&out).is_empty());
}

#[test]
fn unlisten_tears_down_the_listen_once_empty() {
    setup_logging();
    let mut core = Core::new(Config::default());
    let a = value_listener(&mut core, "/u", 1);
    let b = value_listener(&mut core, "/u", 2);

    let out = core.handle(
        InEvent::Unlisten {
            path: path("/u"),
            filter: QueryFilter::default(),
            listener: a,
        },
        0,
    );
    assert!(out.is_empty());
    let out = core.handle(
        InEvent::Unlisten {
            path: path("/u"),
            filter: QueryFilter::default(),
            listener: b,
        },
        0,
    );
    assert!(matches!(
        out[0],
        OutEvent::Unlisten {
            query: None,
            tag: None,
            ..
        }
    ));
}

#[test]
fn shutdown_fails_pending_transactions() {
    setup_logging();
    let mut core = Core::new(Config::default());
    core.handle(
        InEvent::Transaction {
            path: path("/s"),
            update: Box::new(|_| Some(Node::leaf(1))),
            apply_locally: true,
            completer: CompleterId(1),
        },
        0,
    );
    let out = core.handle(InEvent::Shutdown, 0);
    assert!(matches!(
        completions(&out)[0],
        (CompleterId(1), Completion::Transaction(Err(TransactionError::Closed)))
    ));
}

#[test]
fn sentinel_writes_resolve_against_server_time() {
    setup_logging();
    let mut core = Core::new(Config::default());
    value_listener(&mut core, "/ts", 1);
    let out = core.handle(
        InEvent::Set {
            path: path("/ts"),
            data: json!({".sv": "timestamp"}),
            completer: CompleterId(1),
        },
        42_000,
    );
    let events = emits(&out);
    assert_eq!(events[0].1.node, Node::leaf(42_000));
    // The wire payload keeps the raw sentinel for the server to resolve.
    let (_, data, _, _) = single_put(&out);
    assert_eq!(data, json!({".sv": "timestamp"}));
}
