//! Tree-structured data: the value type synchronized with the server.
//!
//! A [`Node`] is either empty, a leaf scalar, or a branch with ordered
//! children. Leaf and children are mutually exclusive; writing a non-empty
//! child below a leaf replaces the leaf with a branch. An empty node is the
//! same as an absent one, and branches prune themselves so that an empty
//! branch never exists.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::path::{Name, Path};

/// Key of the server-value sentinel in wire JSON.
const SERVER_VALUE_KEY: &str = ".sv";

static EMPTY: Node = Node::Empty;
static NO_CHILDREN: BTreeMap<Name, Node> = BTreeMap::new();

/// A JSON-like tree value with optional per-node priority.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Node {
    /// Absent data.
    #[default]
    Empty,
    /// A scalar with an optional priority.
    Leaf {
        /// The scalar payload. A JSON object here is a deferred server-value
        /// sentinel, kept raw until [`Node::resolve_deferred`] runs.
        value: Value,
        /// Sort priority; `None` means unset.
        priority: Option<Value>,
    },
    /// An inner node with at least one child.
    Branch {
        /// Children in [`Name`] order. Never contains empty nodes.
        children: BTreeMap<Name, Node>,
        /// Sort priority; `None` means unset.
        priority: Option<Value>,
    },
}

impl Node {
    /// A leaf without priority.
    pub fn leaf(value: impl Into<Value>) -> Self {
        Node::Leaf {
            value: value.into(),
            priority: None,
        }
    }

    /// True for [`Node::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Empty)
    }

    /// The scalar payload of a leaf.
    pub fn leaf_value(&self) -> Option<&Value> {
        match self {
            Node::Leaf { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The priority attached to this node, if any.
    pub fn priority(&self) -> Option<&Value> {
        match self {
            Node::Empty => None,
            Node::Leaf { priority, .. } | Node::Branch { priority, .. } => priority.as_ref(),
        }
    }

    /// Returns this node with the given priority. A no-op on empty nodes.
    pub fn with_priority(mut self, new: Option<Value>) -> Self {
        match &mut self {
            Node::Empty => {}
            Node::Leaf { priority, .. } | Node::Branch { priority, .. } => *priority = new,
        }
        self
    }

    /// The immediate child under `name`, or the empty node.
    pub fn child(&self, name: &Name) -> &Node {
        match self {
            Node::Branch { children, .. } => children.get(name).unwrap_or(&EMPTY),
            _ => &EMPTY,
        }
    }

    /// The node at `path` below this one, or the empty node.
    pub fn get(&self, path: &Path) -> &Node {
        let mut node = self;
        for name in path.iter() {
            node = node.child(name);
        }
        node
    }

    /// The children map; empty for leaves and empty nodes.
    pub fn children(&self) -> &BTreeMap<Name, Node> {
        match self {
            Node::Branch { children, .. } => children,
            _ => &NO_CHILDREN,
        }
    }

    /// Number of immediate children.
    pub fn num_children(&self) -> usize {
        self.children().len()
    }

    /// Replaces the subtree at `path` with `node`, creating and pruning
    /// branches as needed.
    pub fn set(&mut self, path: &Path, node: Node) {
        self.set_inner(path.as_slice(), node);
    }

    fn set_inner(&mut self, segments: &[Name], node: Node) {
        let Some((name, rest)) = segments.split_first() else {
            *self = node;
            return;
        };
        if node.is_empty() && !matches!(self, Node::Branch { .. }) {
            // Deleting below a leaf or empty node changes nothing.
            return;
        }
        if !matches!(self, Node::Branch { .. }) {
            // A child write below a leaf clears the leaf value.
            let priority = self.priority().cloned();
            *self = Node::Branch {
                children: BTreeMap::new(),
                priority,
            };
        }
        let Node::Branch { children, .. } = self else {
            unreachable!()
        };
        let child = children.entry(name.clone()).or_default();
        child.set_inner(rest, node);
        if child.is_empty() {
            children.remove(name);
        }
        if children.is_empty() {
            *self = Node::Empty;
        }
    }

    /// Overwrites the named immediate children, leaving the rest untouched.
    pub fn merge(&mut self, updates: &BTreeMap<Name, Node>) {
        for (name, node) in updates {
            self.set(&Path::from_segments([name.clone()]), node.clone());
        }
    }

    /// Builds a node from wire JSON.
    ///
    /// `null` maps to empty, arrays become branches with integer keys, and the
    /// reserved `.value` / `.priority` keys carry leaf payloads and priorities.
    /// Server-value sentinels (`{".sv": ...}`) are kept as raw leaves.
    pub fn from_json(json: &Value) -> Self {
        match json {
            Value::Null => Node::Empty,
            Value::Bool(_) | Value::Number(_) | Value::String(_) => Node::Leaf {
                value: json.clone(),
                priority: None,
            },
            Value::Array(items) => {
                let mut children = BTreeMap::new();
                for (i, item) in items.iter().enumerate() {
                    let child = Node::from_json(item);
                    if !child.is_empty() {
                        children.insert(Name::new(i.to_string()), child);
                    }
                }
                if children.is_empty() {
                    Node::Empty
                } else {
                    Node::Branch {
                        children,
                        priority: None,
                    }
                }
            }
            Value::Object(map) => Self::from_json_object(map),
        }
    }

    fn from_json_object(map: &Map<String, Value>) -> Self {
        if map.contains_key(SERVER_VALUE_KEY) {
            return Node::Leaf {
                value: Value::Object(map.clone()),
                priority: None,
            };
        }
        let priority = map.get(".priority").filter(|p| !p.is_null()).cloned();
        if let Some(value) = map.get(".value") {
            return if value.is_null() {
                Node::Empty
            } else {
                Node::Leaf {
                    value: value.clone(),
                    priority,
                }
            };
        }
        let mut children = BTreeMap::new();
        for (key, value) in map {
            if key.starts_with('.') {
                continue;
            }
            let child = Node::from_json(value);
            if !child.is_empty() {
                children.insert(Name::new(key.as_str()), child);
            }
        }
        if children.is_empty() {
            Node::Empty
        } else {
            Node::Branch { children, priority }
        }
    }

    /// Renders this node as wire JSON, inverse of [`Node::from_json`].
    pub fn to_json(&self) -> Value {
        match self {
            Node::Empty => Value::Null,
            Node::Leaf { value, priority } => match priority {
                None => value.clone(),
                Some(priority) => {
                    let mut map = Map::new();
                    map.insert(".value".to_string(), value.clone());
                    map.insert(".priority".to_string(), priority.clone());
                    Value::Object(map)
                }
            },
            Node::Branch { children, priority } => {
                let mut map = Map::new();
                if let Some(priority) = priority {
                    map.insert(".priority".to_string(), priority.clone());
                }
                for (name, child) in children {
                    map.insert(name.as_str().to_string(), child.to_json());
                }
                Value::Object(map)
            }
        }
    }

    /// Resolves deferred server-value sentinels against the given server time
    /// in milliseconds.
    pub fn resolve_deferred(&self, now_ms: i64) -> Node {
        match self {
            Node::Empty => Node::Empty,
            Node::Leaf { value, priority } => Node::Leaf {
                value: resolve_value(value, now_ms),
                priority: priority.as_ref().map(|p| resolve_value(p, now_ms)),
            },
            Node::Branch { children, priority } => Node::Branch {
                children: children
                    .iter()
                    .map(|(name, child)| (name.clone(), child.resolve_deferred(now_ms)))
                    .collect(),
                priority: priority.as_ref().map(|p| resolve_value(p, now_ms)),
            },
        }
    }

    /// Canonical content hash used as the compare-and-set precondition.
    ///
    /// The empty node hashes to the empty string.
    pub fn hash(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let canonical = self.to_json().to_string();
        let digest = blake3::hash(canonical.as_bytes());
        data_encoding::BASE64.encode(digest.as_bytes())
    }
}

/// True when `value` is a server-value sentinel object.
pub fn is_server_value(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.contains_key(SERVER_VALUE_KEY))
}

fn resolve_value(value: &Value, now_ms: i64) -> Value {
    match value {
        Value::Object(map) => match map.get(SERVER_VALUE_KEY).and_then(|v| v.as_str()) {
            Some("timestamp") => Value::from(now_ms),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Total order over leaf scalars: booleans before numbers before strings,
/// anything else (raw sentinel objects) last.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(0.0);
            let b = b.as_f64().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => rank(a).cmp(&rank(b)),
    }
}
