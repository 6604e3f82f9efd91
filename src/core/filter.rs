//! Ordered, bounded projections of a node's children.
//!
//! A [`QueryFilter`] defines a total order over `(name, node)` child entries
//! via its `order_by` projection, an optional window of that order via
//! start/end bounds, and an optional size limit anchored at either end.

use std::cmp::Ordering;

use serde_json::{Map, Value};
use thiserror::Error;

use super::node::{compare_values, Node};
use super::path::Name;

/// Query id of the unfiltered view.
pub const DEFAULT_QUERY_ID: &str = "default";

/// An invalid query description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// The wire form was not a JSON object.
    #[error("wire query must be an object")]
    NotAnObject,
    /// An unknown or malformed field value.
    #[error("invalid wire query field {0:?}")]
    InvalidField(&'static str),
    /// Key-ordered queries bound by name only; a value bound is meaningless.
    #[error("key-ordered queries cannot carry value bounds")]
    KeyBoundWithValue,
    /// A limit of zero would render the view permanently empty.
    #[error("limit must be greater than zero")]
    ZeroLimit,
}

/// The child projection a query sorts by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderBy {
    /// Sort by each child's priority (the default order).
    Priority,
    /// Sort by child key alone.
    Key,
    /// Sort by the child's own value.
    Value,
    /// Sort by a named grandchild of each child.
    Child(Name),
}

/// One endpoint of a query window.
///
/// A bound compares against entries by projected value first, name second.
/// An absent name means the bound is inclusive of every name at the boundary
/// value (the minimal name for start bounds, the maximal for end bounds).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryBound {
    /// Boundary in the projected-value dimension. `None` sorts first.
    pub value: Option<Value>,
    /// Boundary in the name dimension.
    pub name: Option<Name>,
}

/// A filtered, windowed ordering of a node's children.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    /// The projection entries are ordered by.
    pub order_by: OrderBy,
    /// Lower window endpoint.
    pub start_at: Option<QueryBound>,
    /// Upper window endpoint.
    pub end_at: Option<QueryBound>,
    /// Maximum number of entries retained.
    pub limit: Option<usize>,
    /// Anchor the limit at the end of the order instead of the start.
    pub reverse: bool,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            order_by: OrderBy::Priority,
            start_at: None,
            end_at: None,
            limit: None,
            reverse: false,
        }
    }
}

/// What a projection yields for one entry, in sort position.
enum Projected<'a> {
    Nil,
    Scalar(&'a Value),
    Branch,
}

impl QueryFilter {
    /// Checks internal consistency; called when queries enter the system.
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.limit == Some(0) {
            return Err(FilterError::ZeroLimit);
        }
        if self.order_by == OrderBy::Key {
            let value_bound = |b: &Option<QueryBound>| {
                b.as_ref().map(|b| b.value.is_some()).unwrap_or(false)
            };
            if value_bound(&self.start_at) || value_bound(&self.end_at) {
                return Err(FilterError::KeyBoundWithValue);
            }
        }
        Ok(())
    }

    /// True for the unfiltered default query.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Stable identifier for this query at one path.
    pub fn query_id(&self) -> String {
        if self.is_default() {
            DEFAULT_QUERY_ID.to_string()
        } else {
            // serde_json maps are sorted by key, so this is canonical.
            self.to_wire().to_string()
        }
    }

    fn project<'a>(&self, node: &'a Node) -> Projected<'a> {
        let target = match &self.order_by {
            OrderBy::Key => return Projected::Nil,
            OrderBy::Priority => {
                return match node.priority() {
                    None => Projected::Nil,
                    Some(p) => Projected::Scalar(p),
                }
            }
            OrderBy::Value => node,
            OrderBy::Child(name) => node.child(name),
        };
        match target {
            Node::Empty => Projected::Nil,
            Node::Leaf { value, .. } => Projected::Scalar(value),
            Node::Branch { .. } => Projected::Branch,
        }
    }

    fn cmp_projected(a: &Projected<'_>, b: &Projected<'_>) -> Ordering {
        use Projected::*;
        match (a, b) {
            (Nil, Nil) | (Branch, Branch) => Ordering::Equal,
            (Nil, _) => Ordering::Less,
            (_, Nil) => Ordering::Greater,
            (Scalar(a), Scalar(b)) => compare_values(a, b),
            (Scalar(_), Branch) => Ordering::Less,
            (Branch, Scalar(_)) => Ordering::Greater,
        }
    }

    /// Total order over child entries: projected value first, name second.
    pub fn compare(&self, a: (&Name, &Node), b: (&Name, &Node)) -> Ordering {
        Self::cmp_projected(&self.project(a.1), &self.project(b.1)).then_with(|| a.0.cmp(b.0))
    }

    /// Compares an entry against a window bound. `start` selects which side
    /// an absent bound name closes on.
    fn cmp_to_bound(&self, entry: (&Name, &Node), bound: &QueryBound, start: bool) -> Ordering {
        if self.order_by != OrderBy::Key {
            let bound_proj = match &bound.value {
                None => Projected::Nil,
                Some(v) => Projected::Scalar(v),
            };
            let by_value = Self::cmp_projected(&self.project(entry.1), &bound_proj);
            if by_value != Ordering::Equal {
                return by_value;
            }
        }
        match &bound.name {
            Some(name) => entry.0.cmp(name),
            // Unnamed start bounds sit before every name, end bounds after.
            None if start => Ordering::Greater,
            None => Ordering::Less,
        }
    }

    /// True when the entry lies within the window bounds.
    pub fn is_valid(&self, entry: (&Name, &Node)) -> bool {
        if let Some(start) = &self.start_at {
            if self.cmp_to_bound(entry, start, true) == Ordering::Less {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if self.cmp_to_bound(entry, end, false) == Ordering::Greater {
                return false;
            }
        }
        true
    }

    /// The node's in-window children, sorted by this filter's order.
    pub fn ordered_children<'a>(&self, node: &'a Node) -> Vec<(&'a Name, &'a Node)> {
        let mut entries: Vec<_> = node
            .children()
            .iter()
            .filter(|(name, child)| self.is_valid((name, child)))
            .collect();
        entries.sort_by(|a, b| self.compare(*a, *b));
        entries
    }

    /// Renders the window this filter selects out of `node`.
    ///
    /// Leaves and empty nodes pass through unchanged; branches keep only the
    /// valid children, trimmed to `limit` from the anchored end.
    pub fn apply(&self, node: &Node) -> Node {
        if self.is_default() {
            return node.clone();
        }
        if !matches!(node, Node::Branch { .. }) {
            return node.clone();
        }
        let mut entries = self.ordered_children(node);
        if let Some(limit) = self.limit {
            if entries.len() > limit {
                if self.reverse {
                    entries.drain(..entries.len() - limit);
                } else {
                    entries.truncate(limit);
                }
            }
        }
        if entries.is_empty() {
            return Node::Empty;
        }
        Node::Branch {
            children: entries
                .into_iter()
                .map(|(name, child)| (name.clone(), child.clone()))
                .collect(),
            priority: node.priority().cloned(),
        }
    }

    /// Encodes this filter as a wire query object.
    pub fn to_wire(&self) -> Value {
        let mut map = Map::new();
        let order_by = match &self.order_by {
            OrderBy::Priority => ".priority".to_string(),
            OrderBy::Key => ".key".to_string(),
            OrderBy::Value => ".value".to_string(),
            OrderBy::Child(name) => name.as_str().to_string(),
        };
        if self.order_by != OrderBy::Priority {
            map.insert("orderBy".to_string(), Value::String(order_by));
        }
        if let Some(start) = &self.start_at {
            if let Some(value) = &start.value {
                map.insert("startAt".to_string(), value.clone());
            }
            if let Some(name) = &start.name {
                map.insert("startName".to_string(), Value::String(name.as_str().into()));
            }
        }
        if let Some(end) = &self.end_at {
            if let Some(value) = &end.value {
                map.insert("endAt".to_string(), value.clone());
            }
            if let Some(name) = &end.name {
                map.insert("endName".to_string(), Value::String(name.as_str().into()));
            }
        }
        if let Some(limit) = self.limit {
            map.insert("limit".to_string(), Value::from(limit));
            let anchor = if self.reverse { "right" } else { "left" };
            map.insert("viewFrom".to_string(), Value::String(anchor.into()));
        }
        Value::Object(map)
    }

    /// Decodes a wire query object.
    pub fn from_wire(wire: &Value) -> Result<Self, FilterError> {
        let map = wire.as_object().ok_or(FilterError::NotAnObject)?;
        let order_by = match map.get("orderBy") {
            None => OrderBy::Priority,
            Some(Value::String(s)) => match s.as_str() {
                ".priority" => OrderBy::Priority,
                ".key" => OrderBy::Key,
                ".value" => OrderBy::Value,
                child => OrderBy::Child(Name::new(child)),
            },
            Some(_) => return Err(FilterError::InvalidField("orderBy")),
        };
        let bound = |value_key: &'static str, name_key: &'static str| -> Result<Option<QueryBound>, FilterError> {
            let value = map.get(value_key).cloned();
            let name = match map.get(name_key) {
                None => None,
                Some(Value::String(s)) => Some(Name::new(s.as_str())),
                Some(_) => return Err(FilterError::InvalidField("bound name")),
            };
            if value.is_none() && name.is_none() {
                return Ok(None);
            }
            Ok(Some(QueryBound { value, name }))
        };
        let limit = match map.get("limit") {
            None => None,
            Some(v) => Some(
                v.as_u64()
                    .map(|l| l as usize)
                    .ok_or(FilterError::InvalidField("limit"))?,
            ),
        };
        let reverse = match map.get("viewFrom") {
            None => false,
            Some(Value::String(s)) if s == "left" => false,
            Some(Value::String(s)) if s == "right" => true,
            Some(_) => return Err(FilterError::InvalidField("viewFrom")),
        };
        let filter = Self {
            order_by,
            start_at: bound("startAt", "startName")?,
            end_at: bound("endAt", "endName")?,
            limit,
            reverse,
        };
        filter.validate()?;
        Ok(filter)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn children(json: Value) -> Node {
        Node::from_json(&json)
    }

    fn value_order(limit: Option<usize>, reverse: bool) -> QueryFilter {
        QueryFilter {
            order_by: OrderBy::Value,
            limit,
            reverse,
            ..Default::default()
        }
    }

    fn names(node: &Node) -> Vec<&str> {
        node.children().keys().map(|n| n.as_str()).collect()
    }

    #[test]
    fn value_window_keeps_first_two() {
        let node = children(json!({"a": 3, "b": 1, "c": 2, "d": 4}));
        let window = value_order(Some(2), false).apply(&node);
        let mut kept = names(&window);
        kept.sort();
        assert_eq!(kept, vec!["b", "c"]);
    }

    #[test]
    fn reverse_window_keeps_last_two() {
        let node = children(json!({"a": 3, "b": 1, "c": 2, "d": 4}));
        let window = value_order(Some(2), true).apply(&node);
        let mut kept = names(&window);
        kept.sort();
        assert_eq!(kept, vec!["c", "d"]);
    }

    #[test]
    fn compare_is_antisymmetric_and_nil_first() {
        let node = children(json!({"a": 1, "b": true, "c": "s", "d": {"x": 1}}));
        let filter = value_order(None, false);
        let entries: Vec<_> = node.children().iter().collect();
        for a in &entries {
            for b in &entries {
                let ab = filter.compare((a.0, a.1), (b.0, b.1));
                let ba = filter.compare((b.0, b.1), (a.0, a.1));
                assert_eq!(ab, ba.reverse());
            }
        }
        let ordered = filter.ordered_children(&node);
        let keys: Vec<_> = ordered.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(keys, vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn key_order_bounds_by_name() {
        let node = children(json!({"a": 1, "b": 2, "c": 3}));
        let filter = QueryFilter {
            order_by: OrderBy::Key,
            start_at: Some(QueryBound {
                value: None,
                name: Some("b".into()),
            }),
            ..Default::default()
        };
        let applied = filter.apply(&node);
        let mut kept = names(&applied);
        kept.sort();
        assert_eq!(kept, vec!["b", "c"]);
    }

    #[test]
    fn key_order_rejects_value_bounds() {
        let filter = QueryFilter {
            order_by: OrderBy::Key,
            start_at: Some(QueryBound {
                value: Some(json!(1)),
                name: None,
            }),
            ..Default::default()
        };
        assert_eq!(filter.validate(), Err(FilterError::KeyBoundWithValue));
    }

    #[test]
    fn child_order_with_bounds() {
        let node = children(json!({
            "p": {"age": 30},
            "q": {"age": 20},
            "r": {"age": 40},
            "s": {"name": "no age"},
        }));
        let filter = QueryFilter {
            order_by: OrderBy::Child("age".into()),
            start_at: Some(QueryBound {
                value: Some(json!(25)),
                name: None,
            }),
            ..Default::default()
        };
        let ordered = filter.ordered_children(&node);
        let keys: Vec<_> = ordered.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(keys, vec!["p", "r"]);
    }

    #[test]
    fn wire_round_trip() {
        let filter = QueryFilter {
            order_by: OrderBy::Child("age".into()),
            start_at: Some(QueryBound {
                value: Some(json!(25)),
                name: Some("p".into()),
            }),
            end_at: Some(QueryBound {
                value: Some(json!(65)),
                name: None,
            }),
            limit: Some(10),
            reverse: true,
        };
        let wire = filter.to_wire();
        assert_eq!(QueryFilter::from_wire(&wire).unwrap(), filter);
        assert_eq!(
            QueryFilter::from_wire(&json!({})).unwrap(),
            QueryFilter::default()
        );
    }

    #[test]
    fn default_query_id() {
        assert_eq!(QueryFilter::default().query_id(), DEFAULT_QUERY_ID);
        assert_ne!(value_order(Some(1), false).query_id(), DEFAULT_QUERY_ID);
    }
}
