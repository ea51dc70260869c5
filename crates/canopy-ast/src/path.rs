//! Typed state paths
//!
//! A `StatePath` is always rooted in one of the five state namespaces, so a
//! malformed reference is caught when a binding is registered rather than the
//! first time it is evaluated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Top-level namespaces of the state tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Components,
    Queries,
    Globals,
    Page,
    Variables,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::Components,
        Namespace::Queries,
        Namespace::Globals,
        Namespace::Page,
        Namespace::Variables,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Components => "components",
            Namespace::Queries => "queries",
            Namespace::Globals => "globals",
            Namespace::Page => "page",
            Namespace::Variables => "variables",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Namespace::ALL.into_iter().find(|ns| ns.as_str() == name)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step below a namespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty state path")]
    Empty,

    #[error("unknown namespace '{0}' (expected components, queries, globals, page or variables)")]
    UnknownNamespace(String),

    #[error("malformed state path '{path}' at offset {offset}: {reason}")]
    Malformed {
        path: String,
        offset: usize,
        reason: &'static str,
    },
}

/// A namespace-qualified address into the state tree,
/// e.g. `queries.getUsers.data` or `components.table1.rows[0]`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatePath {
    namespace: Namespace,
    segments: Vec<PathSegment>,
}

impl StatePath {
    /// The root of a namespace
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            segments: Vec::new(),
        }
    }

    pub fn from_segments(namespace: Namespace, segments: Vec<PathSegment>) -> Self {
        Self { namespace, segments }
    }

    /// Builder: append a segment
    pub fn join(mut self, segment: impl Into<PathSegment>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Copy of this path with one more segment
    pub fn child(&self, segment: impl Into<PathSegment>) -> Self {
        self.clone().join(segment)
    }

    pub fn parent(&self) -> Option<StatePath> {
        if self.segments.is_empty() {
            return None;
        }
        let mut parent = self.clone();
        parent.segments.pop();
        Some(parent)
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// First key below the namespace (`getUsers` in `queries.getUsers.data`)
    pub fn owner(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Key(key)) => Some(key),
            _ => None,
        }
    }

    pub fn is_prefix_of(&self, other: &StatePath) -> bool {
        self.namespace == other.namespace
            && self.segments.len() <= other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// True when a write to one path can change the value read at the other
    pub fn overlaps(&self, other: &StatePath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Parse the dotted/bracketed text form
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PathError::Empty);
        }

        let chars: Vec<char> = text.chars().collect();
        let mut pos = 0;
        let malformed = |offset: usize, reason: &'static str| PathError::Malformed {
            path: text.to_string(),
            offset,
            reason,
        };

        let head = read_key(&chars, &mut pos);
        if head.is_empty() {
            return Err(malformed(0, "expected a namespace"));
        }
        let namespace =
            Namespace::from_name(&head).ok_or_else(|| PathError::UnknownNamespace(head.clone()))?;

        let mut segments = Vec::new();
        while pos < chars.len() {
            match chars[pos] {
                '.' => {
                    pos += 1;
                    let key = read_key(&chars, &mut pos);
                    if key.is_empty() {
                        return Err(malformed(pos, "expected a key after '.'"));
                    }
                    segments.push(PathSegment::Key(key));
                }
                '[' => {
                    pos += 1;
                    match chars.get(pos) {
                        Some(&quote) if quote == '"' || quote == '\'' => {
                            pos += 1;
                            let start = pos;
                            while pos < chars.len() && chars[pos] != quote {
                                pos += 1;
                            }
                            if pos >= chars.len() {
                                return Err(malformed(start, "unterminated quoted key"));
                            }
                            segments.push(PathSegment::Key(chars[start..pos].iter().collect()));
                            pos += 1;
                        }
                        Some(c) if c.is_ascii_digit() => {
                            let start = pos;
                            while pos < chars.len() && chars[pos].is_ascii_digit() {
                                pos += 1;
                            }
                            let digits: String = chars[start..pos].iter().collect();
                            let index = digits
                                .parse::<usize>()
                                .map_err(|_| malformed(start, "index out of range"))?;
                            segments.push(PathSegment::Index(index));
                        }
                        _ => return Err(malformed(pos, "expected an index or a quoted key")),
                    }
                    if chars.get(pos) != Some(&']') {
                        return Err(malformed(pos, "expected ']'"));
                    }
                    pos += 1;
                }
                _ => return Err(malformed(pos, "unexpected character")),
            }
        }

        Ok(Self { namespace, segments })
    }
}

fn read_key(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() && is_key_char(chars[*pos]) {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

fn is_key_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn is_plain_key(key: &str) -> bool {
    !key.is_empty()
        && key.chars().all(is_key_char)
        && !key.starts_with(|c: char| c.is_ascii_digit())
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace.as_str())?;
        for segment in &self.segments {
            match segment {
                PathSegment::Key(key) if is_plain_key(key) => write!(f, ".{}", key)?,
                PathSegment::Key(key) if key.contains('"') => write!(f, "['{}']", key)?,
                PathSegment::Key(key) => write!(f, "[\"{}\"]", key)?,
                PathSegment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl FromStr for StatePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatePath::parse(s)
    }
}

impl TryFrom<String> for StatePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StatePath::parse(&value)
    }
}

impl From<StatePath> for String {
    fn from(path: StatePath) -> Self {
        path.to_string()
    }
}
