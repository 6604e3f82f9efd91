//! Child keys and slash-separated paths into the data tree.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Characters that may not appear in a path segment.
const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']', '/'];

/// An error produced when parsing a wire path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// A segment contained a character that is not allowed in keys.
    #[error("invalid character {0:?} in path segment {1:?}")]
    InvalidCharacter(char, String),
    /// A percent escape was truncated or not valid hex.
    #[error("invalid percent escape in path segment {0:?}")]
    InvalidEscape(String),
    /// A decoded segment was not valid UTF-8.
    #[error("path segment is not valid UTF-8")]
    InvalidUtf8,
}

/// The key of one child within a node.
///
/// Names have a total order in which keys that parse as integers sort before
/// all other keys, ordered by their numeric value. Non-integer keys are ordered
/// lexicographically. This is the order children are stored and iterated in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name(String);

impl Name {
    /// Creates a name from anything string-like.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The integer value of this key, if it is integer-like.
    fn as_int(&self) -> Option<i64> {
        let s = &self.0;
        let digits = s.strip_prefix('-').unwrap_or(s);
        if digits.is_empty() || digits.len() > 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse().ok()
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.as_int(), other.as_int()) {
            // Equal integers from distinct spellings ("1" vs "01") fall back to
            // the string order to keep the order total.
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A location in the data tree: a finite sequence of [`Name`]s.
///
/// The empty path is the root. The wire form is slash-separated with each
/// segment percent-decoded on input; empty segments are skipped, so `""`,
/// `"/"` and `"//"` all denote the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<Name>,
}

impl Path {
    /// The root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a wire path, percent-decoding each segment.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let mut segments = Vec::new();
        for part in raw.split('/') {
            if part.is_empty() {
                continue;
            }
            let decoded = percent_decode(part)?;
            if let Some(c) = decoded.chars().find(|c| FORBIDDEN.contains(c)) {
                return Err(PathError::InvalidCharacter(c, decoded));
            }
            segments.push(Name::new(decoded));
        }
        Ok(Self { segments })
    }

    /// Builds a path directly from segments, without wire decoding.
    pub fn from_segments(segments: impl IntoIterator<Item = Name>) -> Self {
        Self {
            segments: segments.into_iter().collect(),
        }
    }

    /// True for the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True when there are no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The first segment, if any.
    pub fn front(&self) -> Option<&Name> {
        self.segments.first()
    }

    /// The final segment, if any.
    pub fn back(&self) -> Option<&Name> {
        self.segments.last()
    }

    /// Everything after the first segment.
    pub fn tail(&self) -> Path {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    /// This path extended by one child key.
    pub fn child(&self, name: impl Into<Name>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        Self { segments }
    }

    /// The parent path, or `None` at the root.
    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Iterates the segments front to back.
    pub fn iter(&self) -> impl Iterator<Item = &Name> {
        self.segments.iter()
    }

    pub(crate) fn as_slice(&self) -> &[Name] {
        &self.segments
    }

    /// True when `self` is `prefix` or a descendant of it.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// The remainder of `self` below `prefix`, or `None` if `self` is outside
    /// that subtree. Stripping a path from itself yields the root.
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(Self {
            segments: self.segments[prefix.segments.len()..].to_vec(),
        })
    }

    /// True when the two paths are equal or one contains the other.
    pub fn intersects(&self, other: &Path) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<N: Into<Name>> FromIterator<N> for Path {
    fn from_iter<T: IntoIterator<Item = N>>(iter: T) -> Self {
        Self {
            segments: iter.into_iter().map(Into::into).collect(),
        }
    }
}

fn percent_decode(segment: &str) -> Result<String, PathError> {
    if !segment.contains('%') {
        return Ok(segment.to_string());
    }
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| PathError::InvalidEscape(segment.to_string()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| PathError::InvalidUtf8)
}
