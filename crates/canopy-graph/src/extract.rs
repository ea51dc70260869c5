//! Static path extraction
//!
//! Walks a binding's AST without evaluating it and records every state path
//! it can read. A chain of member accesses and literal indexes extends the
//! path; a computed index truncates it to the prefix before the index, since
//! any element below that prefix may be read.

use crate::TrackError;
use canopy_ast::{Expr, ExprKind, Literal, Namespace, PathSegment, StatePath, Template};
use canopy_eval::is_builtin_root;
use canopy_parser::parse_template;
use std::collections::BTreeSet;

/// State paths read by template text
pub fn extract_paths(text: &str) -> Result<BTreeSet<StatePath>, TrackError> {
    extract_with_locals(text, &[])
}

/// Like `extract_paths`, treating `locals` (e.g. `data` in a transform) as
/// bound names that are not state
pub fn extract_with_locals(text: &str, locals: &[&str]) -> Result<BTreeSet<StatePath>, TrackError> {
    let template = parse_template(text)?;
    template_paths(&template, locals)
}

pub fn template_paths(template: &Template, locals: &[&str]) -> Result<BTreeSet<StatePath>, TrackError> {
    let mut tracker = Tracker {
        locals,
        paths: BTreeSet::new(),
    };
    for expr in template.bindings() {
        tracker.visit(expr)?;
    }
    Ok(tracker.paths)
}

/// What an expression denotes, as far as static analysis can tell
enum Reference {
    /// A state path that enclosing member accesses may still extend
    Path(StatePath),
    /// Not a state reference (literal, local, builtin, call result...)
    Opaque,
}

struct Tracker<'a> {
    locals: &'a [&'a str],
    paths: BTreeSet<StatePath>,
}

impl Tracker<'_> {
    fn visit(&mut self, expr: &Expr) -> Result<(), TrackError> {
        if let Reference::Path(path) = self.reference(expr)? {
            self.paths.insert(path);
        }
        Ok(())
    }

    fn reference(&mut self, expr: &Expr) -> Result<Reference, TrackError> {
        match &expr.kind {
            ExprKind::Ident(name) => self.root(name, expr),
            ExprKind::Member { object, property, .. } => Ok(match self.reference(object)? {
                Reference::Path(path) => Reference::Path(path.join(property.as_str())),
                Reference::Opaque => Reference::Opaque,
            }),
            ExprKind::Index { object, index, .. } => {
                let base = self.reference(object)?;
                let segment = literal_segment(index);
                if segment.is_none() {
                    self.visit(index)?;
                }
                Ok(match (base, segment) {
                    (Reference::Path(path), Some(segment)) => Reference::Path(path.join(segment)),
                    (Reference::Path(path), None) => {
                        self.paths.insert(path);
                        Reference::Opaque
                    }
                    (Reference::Opaque, _) => Reference::Opaque,
                })
            }
            ExprKind::Call { callee, args } => {
                match &callee.kind {
                    // The method name is not part of the path: `x.trim()` reads `x`
                    ExprKind::Member { object, .. } => self.visit(object)?,
                    _ => self.visit(callee)?,
                }
                for arg in args {
                    self.visit(arg)?;
                }
                Ok(Reference::Opaque)
            }
            ExprKind::Literal(_) => Ok(Reference::Opaque),
            ExprKind::Array(items) => {
                for item in items {
                    self.visit(item)?;
                }
                Ok(Reference::Opaque)
            }
            ExprKind::Object(fields) => {
                for (_, value) in fields {
                    self.visit(value)?;
                }
                Ok(Reference::Opaque)
            }
            ExprKind::Unary { operand, .. } => {
                self.visit(operand)?;
                Ok(Reference::Opaque)
            }
            ExprKind::Binary { left, right, .. } => {
                self.visit(left)?;
                self.visit(right)?;
                Ok(Reference::Opaque)
            }
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.visit(test)?;
                self.visit(consequent)?;
                self.visit(alternate)?;
                Ok(Reference::Opaque)
            }
        }
    }

    fn root(&self, name: &str, expr: &Expr) -> Result<Reference, TrackError> {
        if self.locals.contains(&name) {
            return Ok(Reference::Opaque);
        }
        if let Some(namespace) = Namespace::from_name(name) {
            return Ok(Reference::Path(StatePath::new(namespace)));
        }
        if is_builtin_root(name) {
            return Ok(Reference::Opaque);
        }
        Err(TrackError::UnknownRoot {
            name: name.to_string(),
            span: expr.span,
        })
    }
}

fn literal_segment(index: &Expr) -> Option<PathSegment> {
    match &index.kind {
        ExprKind::Literal(Literal::String(key)) => Some(PathSegment::Key(key.clone())),
        ExprKind::Literal(Literal::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => {
            Some(PathSegment::Index(*n as usize))
        }
        _ => None,
    }
}
