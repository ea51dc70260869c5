//! Canopy AST - shared syntax types
//!
//! Holds the pieces every later stage agrees on:
//! - `Span`: byte offsets into a template's source text
//! - `Expr`: the restricted binding language inside `{{ }}`
//! - `Template`: literal text interleaved with parsed bindings
//! - `StatePath`: a typed, namespace-qualified address into the state tree

mod expr;
mod path;
mod template;

pub use expr::*;
pub use path::*;
pub use template::*;

use serde::{Deserialize, Serialize};

/// Byte range into a source string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both `self` and `other`
    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }

    /// Shift the span right by `offset` bytes
    pub fn offset(self, offset: usize) -> Span {
        Span::new(self.start + offset, self.end + offset)
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_range(self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}
