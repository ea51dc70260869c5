//! Templates: literal text with embedded `{{ }}` bindings

use crate::{Expr, Span};

/// One piece of a template
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text copied verbatim
    Text(String),

    /// A parsed `{{ code }}` binding; `span` covers the braces
    Binding { code: String, expr: Expr, span: Span },
}

/// A parsed template. Spans inside are offsets into `source`.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub source: String,
    pub segments: Vec<Segment>,
}

impl Template {
    /// True when the template contains no bindings at all
    pub fn is_static(&self) -> bool {
        self.bindings().next().is_none()
    }

    /// The binding expression when the whole template (ignoring surrounding
    /// whitespace) is exactly one binding. Such templates yield native values.
    pub fn single_binding(&self) -> Option<&Expr> {
        let mut found = None;
        for segment in &self.segments {
            match segment {
                Segment::Text(text) if text.trim().is_empty() => {}
                Segment::Text(_) => return None,
                Segment::Binding { expr, .. } => {
                    if found.is_some() {
                        return None;
                    }
                    found = Some(expr);
                }
            }
        }
        found
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Expr> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Binding { expr, .. } => Some(expr),
            Segment::Text(_) => None,
        })
    }
}
