//! State Store - the live state tree
//!
//! One JSON object with a key per namespace. Every write is addressed by a
//! `StatePath`, bumps the version and is queued as a change for the session
//! to propagate once the write (or batch) is complete.

use crate::RuntimeError;
use canopy_ast::{Namespace, PathSegment, StatePath};
use serde_json::{Map, Value};

/// How many slots past its end an index write may grow an array
pub const MAX_INDEX_GROWTH: usize = 1024;

/// One write inside a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Set { path: StatePath, value: Value },
    Unset { path: StatePath },
}

impl Mutation {
    pub fn set(path: StatePath, value: Value) -> Self {
        Mutation::Set { path, value }
    }

    pub fn unset(path: StatePath) -> Self {
        Mutation::Unset { path }
    }

    pub fn path(&self) -> &StatePath {
        match self {
            Mutation::Set { path, .. } | Mutation::Unset { path } => path,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: Value,
    version: u64,
    changes: Vec<StatePath>,
}

impl StateStore {
    /// Create a store with every namespace present and empty
    pub fn new() -> Self {
        let root = Namespace::ALL
            .iter()
            .map(|ns| (ns.as_str().to_string(), Value::Object(Map::new())))
            .collect::<Map<_, _>>();
        Self {
            root: Value::Object(root),
            version: 0,
            changes: Vec::new(),
        }
    }

    /// Value at `path`; `None` when unset (undefined)
    pub fn get(&self, path: &StatePath) -> Option<&Value> {
        let mut current = self.root.get(path.namespace().as_str())?;
        for segment in path.segments() {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
                (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
                (PathSegment::Index(index), Value::Object(map)) => map.get(&index.to_string())?,
                (PathSegment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Last-writer-wins write. Missing or non-container intermediates are
    /// replaced by objects (or arrays, for index segments). Refused writes
    /// leave the store untouched.
    pub fn set(&mut self, path: &StatePath, value: Value) -> Result<(), RuntimeError> {
        self.check(path, &value)?;
        self.write(path, value);
        self.changes.push(path.clone());
        Ok(())
    }

    /// Write without queueing a change. Used for values the session derives
    /// itself while propagating, whose readers it has already scheduled.
    pub(crate) fn publish(&mut self, path: &StatePath, value: Value) {
        self.write(path, value);
    }

    /// Queue writes the engine builds itself on keyed paths it owns
    pub(crate) fn apply(&mut self, mutations: impl IntoIterator<Item = Mutation>) {
        for mutation in mutations {
            match mutation {
                Mutation::Set { path, value } => {
                    self.write(&path, value);
                    self.changes.push(path);
                }
                Mutation::Unset { path } => self.unset(&path),
            }
        }
    }

    /// Remove the value at `path`. Unsetting a namespace root empties it.
    pub fn unset(&mut self, path: &StatePath) {
        let Some((last, parents)) = path.segments().split_last() else {
            self.root[path.namespace().as_str()] = Value::Object(Map::new());
            self.bump(path);
            return;
        };
        let parent = StatePath::from_segments(path.namespace(), parents.to_vec());
        let removed = match (self.get_mut(&parent), last) {
            (Some(Value::Object(map)), PathSegment::Key(key)) => map.remove(key).is_some(),
            (Some(Value::Object(map)), PathSegment::Index(index)) => map.remove(&index.to_string()).is_some(),
            (Some(Value::Array(items)), PathSegment::Index(index)) if *index < items.len() => {
                items[*index] = Value::Null;
                true
            }
            _ => false,
        };
        if removed {
            self.bump(path);
        }
    }

    /// Apply several writes; readers see all of them or none. A refused
    /// write rolls back the ones before it.
    pub fn batch(&mut self, mutations: impl IntoIterator<Item = Mutation>) -> Result<(), RuntimeError> {
        let mutations: Vec<Mutation> = mutations.into_iter().collect();
        let backup = mutations
            .iter()
            .any(may_be_refused)
            .then(|| (self.root.clone(), self.version, self.changes.len()));
        for mutation in mutations {
            let applied = match mutation {
                Mutation::Set { path, value } => self.set(&path, value),
                Mutation::Unset { path } => {
                    self.unset(&path);
                    Ok(())
                }
            };
            if let Err(error) = applied {
                if let Some((root, version, queued)) = backup {
                    self.root = root;
                    self.version = version;
                    self.changes.truncate(queued);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Drain the paths written since the last call
    pub fn take_changes(&mut self) -> Vec<StatePath> {
        std::mem::take(&mut self.changes)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Monotonic write counter
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whole tree, for evaluation
    pub fn snapshot(&self) -> &Value {
        &self.root
    }

    fn bump(&mut self, path: &StatePath) {
        self.version += 1;
        self.changes.push(path.clone());
    }

    /// Refuse writes that would turn a namespace into a non-object or grow
    /// an array past `MAX_INDEX_GROWTH` slots beyond its length
    fn check(&self, path: &StatePath, value: &Value) -> Result<(), RuntimeError> {
        let refuse = |reason| {
            Err(RuntimeError::InvalidWrite {
                path: path.to_string(),
                reason,
            })
        };
        if path.segments().is_empty() && !value.is_object() {
            return refuse("a namespace holds an object");
        }
        let mut current = self.root.get(path.namespace().as_str());
        for segment in path.segments() {
            current = match (segment, current) {
                (PathSegment::Key(key), Some(Value::Object(map))) => map.get(key),
                (PathSegment::Index(index), Some(Value::Object(map))) => map.get(&index.to_string()),
                (PathSegment::Index(index), existing) => {
                    let items: &[Value] = match existing {
                        Some(Value::Array(items)) => items.as_slice(),
                        _ => &[],
                    };
                    if *index > items.len().saturating_add(MAX_INDEX_GROWTH) {
                        return refuse("index is too far past the end of the array");
                    }
                    items.get(*index)
                }
                (PathSegment::Key(_), _) => None,
            };
        }
        Ok(())
    }

    fn write(&mut self, path: &StatePath, value: Value) {
        if path.segments().is_empty() && !value.is_object() {
            return;
        }
        let mut current = &mut self.root[path.namespace().as_str()];
        for segment in path.segments() {
            current = match segment {
                PathSegment::Key(key) => {
                    if !current.is_object() {
                        *current = Value::Object(Map::new());
                    }
                    let Value::Object(map) = current else {
                        return;
                    };
                    map.entry(key.clone()).or_insert(Value::Null)
                }
                PathSegment::Index(index) => {
                    if !current.is_array() && !current.is_object() {
                        *current = Value::Array(Vec::new());
                    }
                    match current {
                        Value::Array(items) => {
                            if items.len() <= *index {
                                let Some(len) = index.checked_add(1) else {
                                    return;
                                };
                                items.resize(len, Value::Null);
                            }
                            &mut items[*index]
                        }
                        Value::Object(map) => map.entry(index.to_string()).or_insert(Value::Null),
                        _ => return,
                    }
                }
            };
        }
        *current = value;
        self.version += 1;
    }

    fn get_mut(&mut self, path: &StatePath) -> Option<&mut Value> {
        let mut current = self.root.get_mut(path.namespace().as_str())?;
        for segment in path.segments() {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key)?,
                (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index)?,
                (PathSegment::Index(index), Value::Object(map)) => map.get_mut(&index.to_string())?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Only root writes and index segments can be refused
fn may_be_refused(mutation: &Mutation) -> bool {
    match mutation {
        Mutation::Set { path, .. } => {
            path.segments().is_empty() || path.segments().iter().any(|s| matches!(s, PathSegment::Index(_)))
        }
        Mutation::Unset { .. } => false,
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
