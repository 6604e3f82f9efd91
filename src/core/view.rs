//! A view is the rendering of one query filter at one path: the last
//! confirmed server window, the derived local version with pending writes
//! layered in, and the listeners receiving change events.

use std::fmt;

use super::filter::QueryFilter;
use super::node::Node;
use super::path::{Name, Path};

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// The kinds of events a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The rendered snapshot changed.
    Value,
    /// A child entered the window.
    ChildAdded,
    /// A child's data changed.
    ChildChanged,
    /// A child's sort position changed.
    ChildMoved,
    /// A child left the window.
    ChildRemoved,
    /// The listen was revoked by the server.
    Cancel,
}

/// A change delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent {
    /// What happened.
    pub kind: EventKind,
    /// The path of the view that produced the event.
    pub path: Path,
    /// The affected child for child events.
    pub child: Option<Name>,
    /// The name of the preceding sibling in the new order, for child events.
    pub prev_child: Option<Name>,
    /// The relevant snapshot: the rendered view for value events, the child
    /// data for child events (the removed data for removals).
    pub node: Node,
}

impl DataEvent {
    fn value(path: &Path, node: Node) -> Self {
        Self {
            kind: EventKind::Value,
            path: path.clone(),
            child: None,
            prev_child: None,
            node,
        }
    }

    fn child(
        kind: EventKind,
        path: &Path,
        name: &Name,
        prev: Option<Name>,
        node: Node,
    ) -> Self {
        Self {
            kind,
            path: path.clone(),
            child: Some(name.clone()),
            prev_child: prev,
            node,
        }
    }
}

/// One filter × path rendering with its listener set.
#[derive(Debug)]
pub struct View {
    filter: QueryFilter,
    query_id: String,
    server: Node,
    local: Node,
    has_data: bool,
    listeners: Vec<(ListenerId, EventKind)>,
    /// References that keep the view (and its listen) alive without
    /// receiving events; used by the transaction engine.
    silent: usize,
}

impl View {
    /// Creates an empty view for `filter`.
    pub fn new(filter: QueryFilter) -> Self {
        let query_id = filter.query_id();
        Self {
            filter,
            query_id,
            server: Node::Empty,
            local: Node::Empty,
            has_data: false,
            listeners: Vec::new(),
            silent: 0,
        }
    }

    /// The filter this view renders.
    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    /// The stable id of the filter.
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Last confirmed server state for this window.
    pub fn server(&self) -> &Node {
        &self.server
    }

    /// Replaces the confirmed server state. Call [`View::apply`] afterwards.
    pub fn set_server(&mut self, server: Node) {
        self.server = server;
    }

    /// The current local version.
    pub fn local(&self) -> &Node {
        &self.local
    }

    /// True while anything keeps this view alive.
    pub fn is_active(&self) -> bool {
        !self.listeners.is_empty() || self.silent > 0
    }

    /// Registers a listener. Returns true when the view was inactive before,
    /// meaning a server listen must be established.
    pub fn add_listener(&mut self, id: ListenerId, kind: EventKind) -> bool {
        let was_inactive = !self.is_active();
        self.listeners.push((id, kind));
        was_inactive
    }

    /// Drops a listener; true if it was registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Adds a silent keep-alive reference; same return as `add_listener`.
    pub fn add_silent(&mut self) -> bool {
        let was_inactive = !self.is_active();
        self.silent += 1;
        was_inactive
    }

    /// Drops a silent reference.
    pub fn remove_silent(&mut self) {
        self.silent = self.silent.saturating_sub(1);
    }

    /// All registered listener ids, in registration order.
    pub fn listener_ids(&self) -> Vec<ListenerId> {
        self.listeners.iter().map(|(id, _)| *id).collect()
    }

    /// Events synthesized for a listener that joins a view which already has
    /// state: the current snapshot for value listeners, one added event per
    /// in-window child for child-added listeners.
    pub fn initial_events(&self, kind: EventKind, path: &Path) -> Vec<DataEvent> {
        if !self.has_data {
            return Vec::new();
        }
        match kind {
            EventKind::Value => vec![DataEvent::value(path, self.local.clone())],
            EventKind::ChildAdded => {
                let mut events = Vec::new();
                let mut prev: Option<Name> = None;
                for (name, child) in self.filter.ordered_children(&self.local) {
                    events.push(DataEvent::child(
                        EventKind::ChildAdded,
                        path,
                        name,
                        prev.clone(),
                        child.clone(),
                    ));
                    prev = Some(name.clone());
                }
                events
            }
            _ => Vec::new(),
        }
    }

    /// Cancellation events for the cancel-kind listeners of this view.
    pub fn cancel_events(&self, path: &Path) -> Vec<(ListenerId, DataEvent)> {
        self.listeners
            .iter()
            .filter(|(_, kind)| *kind == EventKind::Cancel)
            .map(|(id, _)| {
                (
                    *id,
                    DataEvent {
                        kind: EventKind::Cancel,
                        path: path.clone(),
                        child: None,
                        prev_child: None,
                        node: Node::Empty,
                    },
                )
            })
            .collect()
    }

    /// Recomputes the local version from the layered full node and returns
    /// the change events, in apply order.
    pub fn apply(&mut self, layered: Node, path: &Path) -> Vec<DataEvent> {
        let new_local = self.filter.apply(&layered);
        let first = !self.has_data;
        self.has_data = true;
        let events = diff(&self.local, &new_local, &self.filter, path, first);
        self.local = new_local;
        events
    }

    /// Routes broadcast events to the listeners registered for their kind.
    pub fn fan_out(&self, events: &[DataEvent]) -> Vec<(ListenerId, DataEvent)> {
        let mut out = Vec::new();
        for event in events {
            for (id, kind) in &self.listeners {
                if *kind == event.kind {
                    out.push((*id, event.clone()));
                }
            }
        }
        out
    }
}

/// Diffs two renderings under a filter. Emission order: removals, moves,
/// additions, changes, value.
fn diff(
    old: &Node,
    new: &Node,
    filter: &QueryFilter,
    path: &Path,
    first: bool,
) -> Vec<DataEvent> {
    let old_entries = filter.ordered_children(old);
    let new_entries = filter.ordered_children(new);
    let old_names: Vec<&Name> = old_entries.iter().map(|(n, _)| *n).collect();
    let new_names: Vec<&Name> = new_entries.iter().map(|(n, _)| *n).collect();

    let prev_of = |name: &Name| -> Option<Name> {
        let idx = new_names.iter().position(|n| *n == name)?;
        idx.checked_sub(1).map(|i| new_names[i].clone())
    };

    let mut events = Vec::new();

    for (name, node) in &old_entries {
        if !new_names.contains(name) {
            events.push(DataEvent::child(
                EventKind::ChildRemoved,
                path,
                name,
                None,
                (*node).clone(),
            ));
        }
    }

    // A survivor moved when its rank among the surviving children changed.
    let old_common: Vec<&Name> = old_names
        .iter()
        .filter(|n| new_names.contains(*n))
        .copied()
        .collect();
    let new_common: Vec<&Name> = new_names
        .iter()
        .filter(|n| old_names.contains(*n))
        .copied()
        .collect();
    for (new_idx, name) in new_common.iter().enumerate() {
        let old_idx = old_common.iter().position(|n| n == name);
        if old_idx != Some(new_idx) {
            events.push(DataEvent::child(
                EventKind::ChildMoved,
                path,
                name,
                prev_of(name),
                new.child(name).clone(),
            ));
        }
    }

    for (name, node) in &new_entries {
        if !old_names.contains(name) {
            events.push(DataEvent::child(
                EventKind::ChildAdded,
                path,
                name,
                prev_of(name),
                (*node).clone(),
            ));
        }
    }

    for (name, node) in &new_entries {
        if old_names.contains(name) && old.child(name) != *node {
            events.push(DataEvent::child(
                EventKind::ChildChanged,
                path,
                name,
                prev_of(name),
                (*node).clone(),
            ));
        }
    }

    if first || old != new {
        events.push(DataEvent::value(path, new.clone()));
    }

    events
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::super::filter::OrderBy;
    use super::*;

    fn node(json: serde_json::Value) -> Node {
        Node::from_json(&json)
    }

    fn kinds(events: &[DataEvent]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn first_apply_emits_value() {
        let mut view = View::new(QueryFilter::default());
        let events = view.apply(node(json!({"x": 1})), &Path::root());
        assert_eq!(
            kinds(&events),
            vec![EventKind::ChildAdded, EventKind::Value]
        );
    }

    #[test]
    fn merge_emits_changed_added_value() {
        let mut view = View::new(QueryFilter::default());
        view.apply(node(json!({"a": 1, "b": 2})), &Path::root());
        let events = view.apply(node(json!({"a": 1, "b": 3, "c": 4})), &Path::root());
        assert_eq!(
            kinds(&events),
            vec![EventKind::ChildAdded, EventKind::ChildChanged, EventKind::Value]
        );
        assert_eq!(events[0].child, Some("c".into()));
        assert_eq!(events[1].child, Some("b".into()));
    }

    #[test]
    fn reorder_emits_moved() {
        let filter = QueryFilter {
            order_by: OrderBy::Value,
            ..Default::default()
        };
        let mut view = View::new(filter);
        view.apply(node(json!({"a": 1, "b": 2})), &Path::root());
        // a jumps past b in value order.
        let events = view.apply(node(json!({"a": 3, "b": 2})), &Path::root());
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::ChildMoved,
                EventKind::ChildMoved,
                EventKind::ChildChanged,
                EventKind::Value
            ]
        );
    }

    #[test]
    fn removal_without_reorder_is_not_a_move() {
        let mut view = View::new(QueryFilter::default());
        view.apply(node(json!({"a": 1, "b": 2, "c": 3})), &Path::root());
        let events = view.apply(node(json!({"a": 1, "c": 3})), &Path::root());
        assert_eq!(
            kinds(&events),
            vec![EventKind::ChildRemoved, EventKind::Value]
        );
        assert_eq!(events[0].child, Some("b".into()));
        assert_eq!(events[0].node, Node::leaf(2));
    }

    #[test]
    fn unchanged_apply_is_silent() {
        let mut view = View::new(QueryFilter::default());
        view.apply(node(json!({"a": 1})), &Path::root());
        let events = view.apply(node(json!({"a": 1})), &Path::root());
        assert!(events.is_empty());
    }

    #[test]
    fn initial_events_need_state() {
        let path = Path::root();
        let mut view = View::new(QueryFilter::default());
        assert!(view.initial_events(EventKind::Value, &path).is_empty());
        view.apply(node(json!({"a": 1, "b": 2})), &path);
        assert_eq!(view.initial_events(EventKind::Value, &path).len(), 1);
        let added = view.initial_events(EventKind::ChildAdded, &path);
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].prev_child, None);
        assert_eq!(added[1].prev_child, Some("a".into()));
    }

    #[test]
    fn fan_out_matches_kinds() {
        let mut view = View::new(QueryFilter::default());
        assert!(view.add_listener(ListenerId(1), EventKind::Value));
        assert!(!view.add_listener(ListenerId(2), EventKind::ChildAdded));
        let events = view.apply(node(json!({"a": 1})), &Path::root());
        let routed = view.fan_out(&events);
        assert_eq!(routed.len(), 2);
        assert_eq!(routed[0].0, ListenerId(2));
        assert_eq!(routed[1].0, ListenerId(1));
        assert!(view.remove_listener(ListenerId(1)));
        assert!(view.is_active());
        assert!(view.remove_listener(ListenerId(2)));
        assert!(!view.is_active());
    }
}
