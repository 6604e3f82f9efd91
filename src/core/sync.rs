//! The sync tree: per-path bundles of filtered views, merged from confirmed
//! server state and the log of outstanding optimistic writes.
//!
//! The tree is represented by child maps only; a node's path is carried as a
//! parameter through recursive walks, never stored.

use std::collections::{BTreeMap, HashMap};

use super::filter::QueryFilter;
use super::node::Node;
use super::path::{Name, Path};
use super::view::{DataEvent, EventKind, ListenerId, View};

/// A pending optimistic user write.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    /// Globally monotonic id; layering order.
    pub write_id: u64,
    /// Target path.
    pub path: Path,
    /// Overwrite or merge payload.
    pub kind: WriteKind,
    /// False for writes that must not affect local versions.
    pub visible: bool,
}

/// The payload of a pending write.
#[derive(Debug, Clone)]
pub enum WriteKind {
    /// Replace the subtree at the write path.
    Overwrite(Node),
    /// Overwrite the named children below the write path, atomically.
    Merge(BTreeMap<Name, Node>),
}

/// The ordered log of pending writes.
#[derive(Debug, Default)]
pub struct WriteLog {
    writes: Vec<WriteRecord>,
}

impl WriteLog {
    /// Appends a write. Ids must be handed out in increasing order.
    pub fn push(&mut self, record: WriteRecord) {
        debug_assert!(self
            .writes
            .last()
            .map(|w| w.write_id < record.write_id)
            .unwrap_or(true));
        self.writes.push(record);
    }

    /// Removes and returns the write with the given id.
    pub fn remove(&mut self, write_id: u64) -> Option<WriteRecord> {
        let idx = self.writes.iter().position(|w| w.write_id == write_id)?;
        Some(self.writes.remove(idx))
    }

    /// Looks up a pending write.
    pub fn get(&self, write_id: u64) -> Option<&WriteRecord> {
        self.writes.iter().find(|w| w.write_id == write_id)
    }

    /// Layers every visible pending write over `base`, which holds the data
    /// at `path`, in strict write-id order. Writes in `exclude` are skipped.
    pub fn layer(&self, mut acc: Node, path: &Path, exclude: &[u64]) -> Node {
        for write in &self.writes {
            if !write.visible || exclude.contains(&write.write_id) {
                continue;
            }
            match &write.kind {
                WriteKind::Overwrite(node) => {
                    if let Some(rel) = write.path.strip_prefix(path) {
                        acc.set(&rel, node.clone());
                    } else if let Some(rel) = path.strip_prefix(&write.path) {
                        acc = node.get(&rel).clone();
                    }
                }
                WriteKind::Merge(children) => {
                    if let Some(rel) = write.path.strip_prefix(path) {
                        for (name, child) in children {
                            acc.set(&rel.child(name.clone()), child.clone());
                        }
                    } else if let Some(rel) = path.strip_prefix(&write.path) {
                        // rel is non-empty here: the equal-path case took the
                        // branch above.
                        let name = rel.front().expect("non-empty").clone();
                        if let Some(child) = children.get(&name) {
                            acc = child.get(&rel.tail()).clone();
                        }
                    }
                }
            }
        }
        acc
    }
}

/// A server-originated change.
#[derive(Debug, Clone)]
pub enum ServerOp {
    /// Authoritative replacement of a subtree.
    Overwrite(Node),
    /// Authoritative per-child overwrites at one path.
    Merge(BTreeMap<Name, Node>),
}

impl ServerOp {
    /// Applies this operation onto `target` at the relative path `rel`.
    fn apply_at(&self, target: &mut Node, rel: &Path) {
        match self {
            ServerOp::Overwrite(node) => target.set(rel, node.clone()),
            ServerOp::Merge(children) => {
                for (name, child) in children {
                    target.set(&rel.child(name.clone()), child.clone());
                }
            }
        }
    }

    /// The slice of this operation visible from a view *below* the operation
    /// path, at relative path `rel` (non-empty). `None` means untouched.
    fn slice(&self, rel: &Path) -> Option<Node> {
        match self {
            ServerOp::Overwrite(node) => Some(node.get(rel).clone()),
            ServerOp::Merge(children) => {
                let name = rel.front().expect("non-empty");
                children.get(name).map(|child| child.get(&rel.tail()).clone())
            }
        }
    }
}

/// The result of registering a listener.
#[derive(Debug)]
pub struct Registered {
    /// True when the view had no listeners before: a listen must be sent.
    pub was_first: bool,
    /// Events synthesized from existing view state, addressed to the new
    /// listener.
    pub initial: Vec<(ListenerId, DataEvent)>,
}

/// The result of dropping a listener or a whole view.
#[derive(Debug, Default)]
pub struct Dropped {
    /// True when this removed the view entirely: the listen must be torn down.
    pub view_dropped: bool,
    /// Listeners that went away with the view.
    pub listeners: Vec<ListenerId>,
}

/// Map from query id to view at one path.
#[derive(Debug, Default)]
pub struct SyncPoint {
    views: HashMap<String, View>,
}

impl SyncPoint {
    fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

#[derive(Debug, Default)]
struct SyncNode {
    point: Option<SyncPoint>,
    children: HashMap<Name, SyncNode>,
}

impl SyncNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.point.as_ref().map(|p| p.is_empty()).unwrap_or(true)
    }
}

/// The tree of sync points plus the pending-write log.
#[derive(Debug, Default)]
pub struct SyncTree {
    root: SyncNode,
    writes: WriteLog,
}

impl SyncTree {
    /// Registers a listener for `kind` events on the `filter` view at `path`.
    pub fn add_listener(
        &mut self,
        path: &Path,
        filter: QueryFilter,
        kind: EventKind,
        id: ListenerId,
    ) -> Registered {
        let view = self.view_mut(path, filter);
        let was_first = view.add_listener(id, kind);
        let initial = view
            .initial_events(kind, path)
            .into_iter()
            .map(|event| (id, event))
            .collect();
        Registered { was_first, initial }
    }

    /// Adds a silent keep-alive reference on the unfiltered view at `path`.
    /// Returns true when this activated the view.
    pub fn add_silent(&mut self, path: &Path) -> bool {
        self.view_mut(path, QueryFilter::default()).add_silent()
    }

    /// Removes one listener from the identified view.
    pub fn remove_listener(&mut self, path: &Path, query_id: &str, id: ListenerId) -> Dropped {
        let Some(point) = self.point_mut(path) else {
            return Dropped::default();
        };
        let Some(view) = point.views.get_mut(query_id) else {
            return Dropped::default();
        };
        view.remove_listener(id);
        self.drop_if_inactive(path, query_id)
    }

    /// Releases a silent reference on the unfiltered view at `path`.
    pub fn remove_silent(&mut self, path: &Path) -> Dropped {
        let query_id = QueryFilter::default().query_id();
        let Some(view) = self
            .point_mut(path)
            .and_then(|p| p.views.get_mut(&query_id))
        else {
            return Dropped::default();
        };
        view.remove_silent();
        self.drop_if_inactive(path, &query_id)
    }

    fn drop_if_inactive(&mut self, path: &Path, query_id: &str) -> Dropped {
        let Some(point) = self.point_mut(path) else {
            return Dropped::default();
        };
        let Some(view) = point.views.get(query_id) else {
            return Dropped::default();
        };
        if view.is_active() {
            return Dropped::default();
        }
        let view = point.views.remove(query_id).expect("present");
        self.prune(path);
        Dropped {
            view_dropped: true,
            listeners: view.listener_ids(),
        }
    }

    /// Applies an untagged server operation at `path` to every view whose
    /// subtree intersects it, and returns the routed events.
    pub fn apply_server(&mut self, path: &Path, op: &ServerOp) -> Vec<(ListenerId, DataEvent)> {
        let writes = &self.writes;
        let mut out = Vec::new();
        visit_intersecting(&mut self.root, Path::root(), path, &mut |node_path, point| {
            for view in point.views.values_mut() {
                let mut server = view.server().clone();
                if let Some(rel) = path.strip_prefix(node_path) {
                    op.apply_at(&mut server, &rel);
                } else if let Some(rel) = node_path.strip_prefix(path) {
                    match op.slice(&rel) {
                        Some(slice) => server = slice,
                        None => continue,
                    }
                } else {
                    continue;
                }
                view.set_server(server);
                out.extend(recompute(view, writes, node_path));
            }
        });
        out
    }

    /// Applies a server operation to the single tagged view at `path`.
    pub fn apply_server_tagged(
        &mut self,
        path: &Path,
        query_id: &str,
        op: &ServerOp,
    ) -> Vec<(ListenerId, DataEvent)> {
        let Self { root, writes } = self;
        let mut node = &mut *root;
        for name in path.iter() {
            match node.children.get_mut(name) {
                Some(child) => node = child,
                None => return Vec::new(),
            }
        }
        let Some(view) = node
            .point
            .as_mut()
            .and_then(|p| p.views.get_mut(query_id))
        else {
            return Vec::new();
        };
        let mut server = view.server().clone();
        op.apply_at(&mut server, &Path::root());
        view.set_server(server);
        recompute(view, writes, path)
    }

    /// Records a pending user overwrite and re-renders affected views.
    pub fn apply_user_overwrite(
        &mut self,
        path: &Path,
        node: Node,
        write_id: u64,
        visible: bool,
    ) -> Vec<(ListenerId, DataEvent)> {
        self.writes.push(WriteRecord {
            write_id,
            path: path.clone(),
            kind: WriteKind::Overwrite(node),
            visible,
        });
        self.recompute_intersecting(path)
    }

    /// Records a pending user merge (atomic under one write id) and
    /// re-renders affected views.
    pub fn apply_user_merge(
        &mut self,
        path: &Path,
        children: BTreeMap<Name, Node>,
        write_id: u64,
        visible: bool,
    ) -> Vec<(ListenerId, DataEvent)> {
        self.writes.push(WriteRecord {
            write_id,
            path: path.clone(),
            kind: WriteKind::Merge(children),
            visible,
        });
        self.recompute_intersecting(path)
    }

    /// Drops a pending write after the server acknowledged it. On success the
    /// effect is absorbed by the following server echo; on failure the local
    /// versions revert. Either way views re-render without the write.
    pub fn ack_write(&mut self, write_id: u64) -> Vec<(ListenerId, DataEvent)> {
        match self.writes.remove(write_id) {
            Some(record) => self.recompute_intersecting(&record.path),
            None => Vec::new(),
        }
    }

    /// Tears down the identified view after a server-side revoke, emitting
    /// cancel events to its cancel listeners.
    pub fn listen_revoked(
        &mut self,
        path: &Path,
        query_id: &str,
    ) -> (Vec<(ListenerId, DataEvent)>, Dropped) {
        let Some(view) = self
            .node_get_mut(path)
            .and_then(|n| n.point.as_mut())
            .and_then(|p| p.views.get_mut(query_id))
        else {
            return (Vec::new(), Dropped::default());
        };
        let cancels = view.cancel_events(path);
        let listeners = view.listener_ids();
        self.point_mut(path)
            .expect("present")
            .views
            .remove(query_id);
        self.prune(path);
        (
            cancels,
            Dropped {
                view_dropped: true,
                listeners,
            },
        )
    }

    /// The unfiltered local version at `path`, with writes in `exclude`
    /// left out. Empty when no unfiltered view exists there.
    pub fn latest_value(&self, path: &Path, exclude: &[u64]) -> Node {
        let query_id = QueryFilter::default().query_id();
        match self
            .node_get(path)
            .and_then(|n| n.point.as_ref())
            .and_then(|p| p.views.get(&query_id))
        {
            Some(view) => self.writes.layer(view.server().clone(), path, exclude),
            None => Node::Empty,
        }
    }

    /// Direct access to the pending-write log.
    pub fn writes(&self) -> &WriteLog {
        &self.writes
    }

    fn recompute_intersecting(&mut self, path: &Path) -> Vec<(ListenerId, DataEvent)> {
        let writes = &self.writes;
        let mut out = Vec::new();
        visit_intersecting(&mut self.root, Path::root(), path, &mut |node_path, point| {
            for view in point.views.values_mut() {
                out.extend(recompute(view, writes, node_path));
            }
        });
        out
    }

    fn view_mut(&mut self, path: &Path, filter: QueryFilter) -> &mut View {
        let query_id = filter.query_id();
        let node = node_make_mut(&mut self.root, path.as_slice());
        let point = node.point.get_or_insert_with(SyncPoint::default);
        point
            .views
            .entry(query_id)
            .or_insert_with(|| View::new(filter))
    }

    fn point_mut(&mut self, path: &Path) -> Option<&mut SyncPoint> {
        self.node_get_mut(path).and_then(|n| n.point.as_mut())
    }

    fn node_get(&self, path: &Path) -> Option<&SyncNode> {
        let mut node = &self.root;
        for name in path.iter() {
            node = node.children.get(name)?;
        }
        Some(node)
    }

    fn node_get_mut(&mut self, path: &Path) -> Option<&mut SyncNode> {
        let mut node = &mut self.root;
        for name in path.iter() {
            node = node.children.get_mut(name)?;
        }
        Some(node)
    }

    fn prune(&mut self, path: &Path) {
        prune_inner(&mut self.root, path.as_slice());
    }
}

fn node_make_mut<'a>(node: &'a mut SyncNode, segments: &[Name]) -> &'a mut SyncNode {
    match segments.split_first() {
        None => node,
        Some((name, rest)) => {
            let child = node.children.entry(name.clone()).or_default();
            node_make_mut(child, rest)
        }
    }
}

fn prune_inner(node: &mut SyncNode, segments: &[Name]) {
    if let Some((name, rest)) = segments.split_first() {
        if let Some(child) = node.children.get_mut(name) {
            prune_inner(child, rest);
            if child.is_empty() {
                node.children.remove(name);
            }
        }
    }
    if let Some(point) = &node.point {
        if point.is_empty() {
            node.point = None;
        }
    }
}

fn recompute(view: &mut View, writes: &WriteLog, path: &Path) -> Vec<(ListenerId, DataEvent)> {
    let layered = writes.layer(view.server().clone(), path, &[]);
    let events = view.apply(layered, path);
    view.fan_out(&events)
}

/// Walks every node whose path intersects `target`, visiting sync points.
fn visit_intersecting(
    node: &mut SyncNode,
    node_path: Path,
    target: &Path,
    visit: &mut impl FnMut(&Path, &mut SyncPoint),
) {
    if let Some(point) = &mut node.point {
        visit(&node_path, point);
    }
    for (name, child) in node.children.iter_mut() {
        let child_path = node_path.child(name.clone());
        if child_path.intersects(target) {
            visit_intersecting(child, child_path, target, visit);
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn node(json: serde_json::Value) -> Node {
        Node::from_json(&json)
    }

    fn overwrite(json: serde_json::Value) -> ServerOp {
        ServerOp::Overwrite(node(json))
    }

    #[test]
    fn listen_then_local_set_then_failed_ack() {
        let mut tree = SyncTree::default();
        let id = ListenerId(1);
        let reg = tree.add_listener(&path("/a"), QueryFilter::default(), EventKind::Value, id);
        assert!(reg.was_first);
        assert!(reg.initial.is_empty());

        let events = tree.apply_server(&path("/a"), &overwrite(json!({"x": 1})));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.node, node(json!({"x": 1})));

        let events = tree.apply_user_overwrite(&path("/a/x"), Node::leaf(2), 0, true);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.node, node(json!({"x": 2})));

        let events = tree.ack_write(0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.node, node(json!({"x": 1})));
    }

    #[test]
    fn writes_layer_in_id_order() {
        let mut tree = SyncTree::default();
        tree.add_listener(&path("/a"), QueryFilter::default(), EventKind::Value, ListenerId(1));
        tree.apply_server(&path("/a"), &overwrite(json!({"x": 1})));
        tree.apply_user_overwrite(&path("/a/x"), Node::leaf(2), 0, true);
        tree.apply_user_overwrite(&path("/a"), node(json!({"x": 3})), 1, true);
        assert_eq!(tree.latest_value(&path("/a"), &[]), node(json!({"x": 3})));
        // Dropping the later write resurfaces the earlier one.
        tree.ack_write(1);
        assert_eq!(tree.latest_value(&path("/a"), &[]), node(json!({"x": 2})));
    }

    #[test]
    fn invisible_writes_do_not_render() {
        let mut tree = SyncTree::default();
        tree.add_listener(&path("/a"), QueryFilter::default(), EventKind::Value, ListenerId(1));
        tree.apply_server(&path("/a"), &overwrite(json!({"x": 1})));
        let events = tree.apply_user_overwrite(&path("/a/x"), Node::leaf(9), 0, false);
        assert!(events.is_empty());
        assert_eq!(tree.latest_value(&path("/a"), &[]), node(json!({"x": 1})));
    }

    #[test]
    fn server_merge_reaches_ancestor_views() {
        let mut tree = SyncTree::default();
        tree.add_listener(&path("/r"), QueryFilter::default(), EventKind::Value, ListenerId(1));
        tree.apply_server(&path("/r"), &overwrite(json!({"a": 1, "b": 2})));
        let op = ServerOp::Merge(
            [("b".into(), Node::leaf(3)), ("c".into(), Node::leaf(4))]
                .into_iter()
                .collect(),
        );
        let events = tree.apply_server(&path("/r"), &op);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.node, node(json!({"a": 1, "b": 3, "c": 4})));
    }

    #[test]
    fn server_overwrite_refreshes_descendant_views() {
        let mut tree = SyncTree::default();
        tree.add_listener(&path("/a/b"), QueryFilter::default(), EventKind::Value, ListenerId(1));
        let events = tree.apply_server(&path("/a"), &overwrite(json!({"b": {"y": 5}})));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.node, node(json!({"y": 5})));
        // A merge above that does not mention this subtree leaves it alone.
        let op = ServerOp::Merge([("z".into(), Node::leaf(1))].into_iter().collect());
        assert!(tree.apply_server(&path("/a"), &op).is_empty());
    }

    #[test]
    fn tagged_ops_touch_only_their_view() {
        let mut tree = SyncTree::default();
        let filter = QueryFilter {
            limit: Some(1),
            ..Default::default()
        };
        let query_id = filter.query_id();
        tree.add_listener(&path("/q"), filter, EventKind::Value, ListenerId(1));
        tree.add_listener(&path("/q"), QueryFilter::default(), EventKind::Value, ListenerId(2));

        let events = tree.apply_server_tagged(&path("/q"), &query_id, &overwrite(json!({"a": 1})));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, ListenerId(1));
    }

    #[test]
    fn revoke_cancels_and_drops_view() {
        let mut tree = SyncTree::default();
        let p = path("/c");
        tree.add_listener(&p, QueryFilter::default(), EventKind::Value, ListenerId(1));
        tree.add_listener(&p, QueryFilter::default(), EventKind::Cancel, ListenerId(2));
        let (cancels, dropped) = tree.listen_revoked(&p, "default");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].0, ListenerId(2));
        assert!(dropped.view_dropped);
        assert_eq!(dropped.listeners, vec![ListenerId(1), ListenerId(2)]);
        assert_eq!(tree.latest_value(&p, &[]), Node::Empty);
    }

    #[test]
    fn silent_refs_keep_views_alive() {
        let mut tree = SyncTree::default();
        let p = path("/t");
        assert!(tree.add_silent(&p));
        assert!(!tree.add_silent(&p));
        tree.apply_server(&p, &overwrite(json!(5)));
        assert_eq!(tree.latest_value(&p, &[]), Node::leaf(5));
        assert!(!tree.remove_silent(&p).view_dropped);
        assert!(tree.remove_silent(&p).view_dropped);
        assert_eq!(tree.latest_value(&p, &[]), Node::Empty);
    }

    #[test]
    fn latest_value_excludes_requested_writes() {
        let mut tree = SyncTree::default();
        let p = path("/n");
        tree.add_silent(&p);
        tree.apply_server(&p, &overwrite(json!(5)));
        tree.apply_user_overwrite(&p, Node::leaf(6), 0, true);
        assert_eq!(tree.latest_value(&p, &[]), Node::leaf(6));
        assert_eq!(tree.latest_value(&p, &[0]), Node::leaf(5));
    }
}
