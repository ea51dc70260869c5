//! Name resolution for root identifiers

use serde_json::{Map, Value};

/// Resolves the root identifier of a binding (`queries`, `globals`, a local...)
pub trait Scope {
    /// Value bound to `name`, or `None` when the name is not bound
    fn lookup(&self, name: &str) -> Option<&Value>;
}

/// A state snapshot: an object keyed by namespace
impl Scope for Value {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(name))
    }
}

impl Scope for Map<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// Extra names layered over a parent scope. Locals shadow the parent.
pub struct Locals<'a> {
    parent: &'a dyn Scope,
    bindings: Vec<(&'a str, &'a Value)>,
}

impl<'a> Locals<'a> {
    pub fn new(parent: &'a dyn Scope) -> Self {
        Self {
            parent,
            bindings: Vec::new(),
        }
    }

    pub fn with(mut self, name: &'a str, value: &'a Value) -> Self {
        self.bindings.push((name, value));
        self
    }
}

impl Scope for Locals<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.bindings
            .iter()
            .rev()
            .find(|(bound, _)| *bound == name)
            .map(|(_, value)| *value)
            .or_else(|| self.parent.lookup(name))
    }
}
