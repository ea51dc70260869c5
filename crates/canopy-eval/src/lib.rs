//! Canopy Eval - sandboxed interpreter for bindings
//!
//! Evaluation is a pure function of (template, scope): nothing here can write
//! to state or trigger other evaluations. Only the restricted grammar and the
//! allow-listed builtins in `builtins` are reachable.

mod builtins;
mod error;
mod interp;
mod scope;
mod value;

pub use builtins::{is_builtin_root, BUILTIN_ROOTS};
pub use error::*;
pub use scope::*;
pub use value::*;

use canopy_ast::{Segment, Template};
use canopy_parser::parse_template;
use interp::Interpreter;
use serde_json::Value;
use tracing::trace;

/// Parse and evaluate template text against a scope
pub fn evaluate(text: &str, scope: &dyn Scope) -> Result<Value, EvalError> {
    let template = parse_template(text).map_err(|err| EvalError::new(text, err.into()))?;
    evaluate_template(&template, scope)
}

/// Evaluate an already-parsed template.
///
/// A template that is exactly one binding yields the binding's native value;
/// anything else concatenates literal text with stringified binding results.
/// `undefined` becomes `null` at this boundary.
pub fn evaluate_template(template: &Template, scope: &dyn Scope) -> Result<Value, EvalError> {
    let interpreter = Interpreter::new(scope);
    let fail = |kind| EvalError::new(template.source.as_str(), kind);

    if let Some(expr) = template.single_binding() {
        let value = interpreter.eval_owned(expr).map_err(fail)?;
        trace!(template = %template.source, "evaluated single binding");
        return Ok(value.unwrap_or(Value::Null));
    }

    let mut out = String::new();
    for segment in &template.segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Binding { expr, .. } => {
                let value = interpreter.eval_owned(expr).map_err(fail)?;
                out.push_str(&to_display_string(value.as_ref()));
            }
        }
    }
    trace!(template = %template.source, "evaluated template");
    Ok(Value::String(out))
}
