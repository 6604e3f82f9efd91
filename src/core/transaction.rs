//! Optimistic compare-and-set transactions, stored in a tree of per-path
//! queues.
//!
//! This module holds the data model and tree bookkeeping; the lifecycle
//! (run, send, rerun, abort) is driven by the core state machine, which also
//! owns the sync tree the transactions read from.

use std::collections::HashMap;

use thiserror::Error;

use super::node::Node;
use super::path::{Name, Path};
use super::CompleterId;
use super::ServerError;

/// User callback computing the next value from the current one. Returning
/// `None` aborts the attempt and completes the transaction uncommitted.
pub type UpdateFn = Box<dyn FnMut(Node) -> Option<Node> + Send>;

/// Terminal failure of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// An overlapping explicit write invalidated the transaction.
    #[error("transaction overridden by a concurrent write")]
    Overridden,
    /// The retry budget was exhausted without a successful commit.
    #[error("transaction exceeded the retry limit")]
    MaxRetries,
    /// The server rejected the put with a non-retriable error.
    #[error(transparent)]
    Server(#[from] ServerError),
    /// The connection or repo was closed before completion.
    #[error("connection closed")]
    Closed,
}

/// The outcome delivered to a transaction's caller on success.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    /// False when the update function declined by returning `None`.
    pub committed: bool,
    /// The node value the transaction settled on.
    pub snapshot: Node,
}

/// Lifecycle state of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Waiting to be (re)run.
    Pending,
    /// Ran locally, not yet on the wire.
    Run,
    /// Included in an in-flight conditional put.
    Sent,
    /// In flight but aborted meanwhile; finalized on response.
    SentNeedsAbort,
    /// Finished; removed from the queue right after.
    Completed,
}

/// One optimistic compare-and-set attempt at a path.
#[derive(derive_more::Debug)]
pub struct Transaction {
    /// Process-wide creation order; later orders dominate at overlapping
    /// paths.
    pub order: u64,
    /// Absolute target path.
    pub path: Path,
    /// The user's update function.
    #[debug(skip)]
    pub update: UpdateFn,
    /// Whether local views render this transaction's effect before commit.
    pub apply_locally: bool,
    /// Lifecycle state.
    pub status: TxStatus,
    /// Number of sends so far.
    pub retry_count: u32,
    /// The value fed to the last run.
    pub current_input: Node,
    /// The last run's output with server-value sentinels unresolved; this is
    /// what goes on the wire so the server resolves them.
    pub current_output_raw: Node,
    /// The last run's output with sentinels resolved locally.
    pub current_output_resolved: Node,
    /// The pending write backing the local effect of the last run.
    pub current_write_id: Option<u64>,
    /// Failure to report when an in-flight abort finalizes.
    pub abort_reason: Option<TransactionError>,
    /// Routes the outcome back to the caller.
    pub completer: CompleterId,
}

/// A tree node holding the ordered transaction queue at one path.
#[derive(Debug, Default)]
pub struct TxNode {
    /// Transactions created at exactly this path, in creation order.
    pub queue: Vec<Transaction>,
    /// Subtrees by child name.
    pub children: HashMap<Name, TxNode>,
    /// Snapshot the last send was based on; the compare-and-set hash source.
    pub input: Node,
}

impl TxNode {
    fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.children.is_empty()
    }

    /// True when the subtree holds at least one transaction.
    pub fn has_transactions(&self) -> bool {
        !self.queue.is_empty() || self.children.values().any(|c| c.has_transactions())
    }

    /// True when every transaction in the subtree has run and none is on the
    /// wire; such a subtree can be sent as one conditional put.
    pub fn is_ready(&self) -> bool {
        self.queue.iter().all(|t| t.status == TxStatus::Run)
            && self.children.values().all(|c| c.is_ready())
    }
}

/// The tree of transaction queues.
#[derive(Debug, Default)]
pub struct TxTree {
    root: TxNode,
}

impl TxTree {
    /// The node at `path`, created on demand.
    pub fn node_make_mut(&mut self, path: &Path) -> &mut TxNode {
        let mut node = &mut self.root;
        for name in path.iter() {
            node = node.children.entry(name.clone()).or_default();
        }
        node
    }

    /// The node at `path`, if present.
    pub fn node_get_mut(&mut self, path: &Path) -> Option<&mut TxNode> {
        let mut node = &mut self.root;
        for name in path.iter() {
            node = node.children.get_mut(name)?;
        }
        Some(node)
    }

    /// True when any transaction exists in the whole tree.
    pub fn has_transactions(&self) -> bool {
        self.root.has_transactions()
    }

    /// Collects mutable references to every transaction in the subtree at
    /// `path`, sorted by order.
    pub fn collect_subtree_mut(&mut self, path: &Path) -> Vec<&mut Transaction> {
        let mut out = Vec::new();
        if let Some(node) = self.node_get_mut(path) {
            collect_mut(node, &mut out);
        }
        out.sort_by_key(|t| t.order);
        out
    }

    /// Collects every transaction whose path overlaps `path`: those queued at
    /// ancestors of `path` plus the whole subtree below it, sorted by order.
    pub fn collect_overlapping_mut(&mut self, path: &Path) -> Vec<&mut Transaction> {
        let mut out = Vec::new();
        let mut node = &mut self.root;
        for name in path.iter() {
            out.extend(node.queue.iter_mut());
            match node.children.get_mut(name) {
                Some(child) => node = child,
                None => {
                    out.sort_by_key(|t| t.order);
                    return out;
                }
            }
        }
        collect_mut(node, &mut out);
        out.sort_by_key(|t| t.order);
        out
    }

    /// Paths of the maximal ready subtrees, root first. Each is one
    /// conditional put.
    pub fn ready_paths(&self) -> Vec<Path> {
        let mut out = Vec::new();
        ready_paths_inner(&self.root, Path::root(), &mut out);
        out
    }

    /// Drops completed transactions and empty nodes.
    pub fn prune(&mut self) {
        prune_inner(&mut self.root);
    }
}

fn collect_mut<'a>(node: &'a mut TxNode, out: &mut Vec<&'a mut Transaction>) {
    out.extend(node.queue.iter_mut());
    for child in node.children.values_mut() {
        collect_mut(child, out);
    }
}

fn ready_paths_inner(node: &TxNode, path: Path, out: &mut Vec<Path>) {
    if !node.queue.is_empty() {
        // A queued node is the send point for its whole subtree. While any
        // part of that subtree is on the wire, the subtree stays blocked.
        if node.is_ready() {
            out.push(path);
        }
        return;
    }
    for (name, child) in &node.children {
        ready_paths_inner(child, path.child(name.clone()), out);
    }
}

fn prune_inner(node: &mut TxNode) {
    node.queue.retain(|t| t.status != TxStatus::Completed);
    node.children.retain(|_, child| {
        prune_inner(child);
        !child.is_empty()
    });
}

/// Builds the composite value a ready subtree puts to the server: the base
/// snapshot with every queued raw output overlaid in order, so that later
/// transactions dominate earlier ones at overlapping paths.
pub fn composite_output(transactions: &[&mut Transaction], base: Node, path: &Path) -> Node {
    let mut out = base;
    for tx in transactions {
        let rel = tx
            .path
            .strip_prefix(path)
            .expect("transaction outside its subtree");
        out.set(&rel, tx.current_output_raw.clone());
    }
    out
}
