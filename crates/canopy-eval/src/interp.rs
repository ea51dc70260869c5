//! Tree-walking interpreter for binding expressions

use crate::builtins::{self, CallError};
use crate::value::{
    is_nullish, is_truthy, loose_equals, number_value, strict_equals, to_display_string, to_number,
    type_name,
};
use crate::{EvalErrorKind, Scope};
use canopy_ast::{BinaryOp, Expr, ExprKind, Literal, Span, UnaryOp};
use serde_json::{Map, Value};
use std::borrow::Cow;

/// `None` is `undefined`
type Slot<'s> = Option<Cow<'s, Value>>;

/// Outcome of a member/index/call chain
enum Access<'s> {
    Value(Slot<'s>),
    /// An optional link (`?.`) hit null/undefined; the rest of the chain is skipped
    ShortCircuit,
}

pub(crate) struct Interpreter<'s> {
    scope: &'s dyn Scope,
}

impl<'s> Interpreter<'s> {
    pub(crate) fn new(scope: &'s dyn Scope) -> Self {
        Self { scope }
    }

    /// Evaluate to an owned value; `None` is `undefined`
    pub(crate) fn eval_owned(&self, expr: &Expr) -> Result<Option<Value>, EvalErrorKind> {
        Ok(self.eval(expr)?.map(Cow::into_owned))
    }

    fn eval(&self, expr: &Expr) -> Result<Slot<'s>, EvalErrorKind> {
        match self.eval_access(expr)? {
            Access::Value(slot) => Ok(slot),
            Access::ShortCircuit => Ok(None),
        }
    }

    fn eval_access(&self, expr: &Expr) -> Result<Access<'s>, EvalErrorKind> {
        let slot = match &expr.kind {
            ExprKind::Literal(literal) => literal_value(literal, expr.span)?,
            ExprKind::Ident(name) => self.lookup(name, expr.span)?,
            ExprKind::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_owned(item)?.unwrap_or(Value::Null));
                }
                Some(Cow::Owned(Value::Array(values)))
            }
            ExprKind::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    // Undefined members are dropped, as JSON serialization would
                    if let Some(value) = self.eval_owned(value)? {
                        map.insert(key.clone(), value);
                    }
                }
                Some(Cow::Owned(Value::Object(map)))
            }
            ExprKind::Member {
                object,
                property,
                optional,
            } => {
                if let Some(constant) = self.builtin_constant(object, property) {
                    return Ok(Access::Value(Some(Cow::Owned(constant))));
                }
                let target = match self.eval_access(object)? {
                    Access::ShortCircuit => return Ok(Access::ShortCircuit),
                    Access::Value(target) => target,
                };
                match target {
                    Some(target) if !target.is_null() => get_property(target, property),
                    _ if *optional => return Ok(Access::ShortCircuit),
                    missing => {
                        return Err(EvalErrorKind::UndefinedReference {
                            property: property.clone(),
                            target: type_name(missing.as_deref()),
                            span: expr.span,
                        })
                    }
                }
            }
            ExprKind::Index {
                object,
                index,
                optional,
            } => {
                let target = match self.eval_access(object)? {
                    Access::ShortCircuit => return Ok(Access::ShortCircuit),
                    Access::Value(target) => target,
                };
                let key = self.eval(index)?;
                match target {
                    Some(target) if !target.is_null() => get_indexed(target, key.as_deref()),
                    _ if *optional => return Ok(Access::ShortCircuit),
                    missing => {
                        return Err(EvalErrorKind::UndefinedReference {
                            property: to_display_string(key.as_deref()),
                            target: type_name(missing.as_deref()),
                            span: expr.span,
                        })
                    }
                }
            }
            ExprKind::Call { callee, args } => return self.eval_call(callee, args, expr.span),
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                Some(Cow::Owned(self.unary(*op, value.as_deref(), expr.span)?))
            }
            ExprKind::Binary { op, left, right } => self.binary(*op, left, right, expr.span)?,
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                let test = self.eval(test)?;
                if is_truthy(test.as_deref()) {
                    self.eval(consequent)?
                } else {
                    self.eval(alternate)?
                }
            }
        };
        Ok(Access::Value(slot))
    }

    fn lookup(&self, name: &str, span: Span) -> Result<Slot<'s>, EvalErrorKind> {
        match self.scope.lookup(name) {
            Some(value) => Ok(Some(Cow::Borrowed(value))),
            None => Err(EvalErrorKind::UnknownIdentifier {
                name: name.to_string(),
                span,
            }),
        }
    }

    /// A root identifier that is a builtin group and not shadowed by the scope
    fn builtin_root<'e>(&self, expr: &'e Expr) -> Option<&'e str> {
        match &expr.kind {
            ExprKind::Ident(name)
                if builtins::is_builtin_root(name) && self.scope.lookup(name).is_none() =>
            {
                Some(name)
            }
            _ => None,
        }
    }

    fn builtin_constant(&self, object: &Expr, property: &str) -> Option<Value> {
        self.builtin_root(object)
            .and_then(|root| builtins::constant(root, property))
    }

    fn eval_call(&self, callee: &Expr, args: &[Expr], span: Span) -> Result<Access<'s>, EvalErrorKind> {
        // Builtin group called directly: `String(x)`
        if let Some(root) = self.builtin_root(callee) {
            let values = self.eval_args(args)?;
            return self.finish_call(root, builtins::call_function(root, "", &values), span);
        }

        let ExprKind::Member {
            object,
            property,
            optional,
        } = &callee.kind
        else {
            return Err(EvalErrorKind::UnknownFunction {
                name: callee_name(callee),
                span: callee.span,
            });
        };

        // Builtin group function: `Math.max(a, b)`
        if let Some(root) = self.builtin_root(object) {
            let values = self.eval_args(args)?;
            let name = format!("{}.{}", root, property);
            return self.finish_call(&name, builtins::call_function(root, property, &values), span);
        }

        // Method on a value: `x.toUpperCase()`
        let target = match self.eval_access(object)? {
            Access::ShortCircuit => return Ok(Access::ShortCircuit),
            Access::Value(target) => target,
        };
        if is_nullish(target.as_deref()) {
            if *optional {
                return Ok(Access::ShortCircuit);
            }
            return Err(EvalErrorKind::UndefinedReference {
                property: property.clone(),
                target: type_name(target.as_deref()),
                span: callee.span,
            });
        }
        let values = self.eval_args(args)?;
        let result = builtins::call_method(target.as_deref(), property, &values);
        self.finish_call(property, result, span)
    }

    fn eval_args(&self, args: &[Expr]) -> Result<Vec<Option<Value>>, EvalErrorKind> {
        args.iter().map(|arg| self.eval_owned(arg)).collect()
    }

    fn finish_call(
        &self,
        name: &str,
        result: Result<Option<Value>, CallError>,
        span: Span,
    ) -> Result<Access<'s>, EvalErrorKind> {
        match result {
            Ok(value) => Ok(Access::Value(value.map(Cow::Owned))),
            Err(CallError::Unknown) => Err(EvalErrorKind::UnknownFunction {
                name: name.to_string(),
                span,
            }),
            Err(CallError::BadArguments(message)) => Err(EvalErrorKind::BadArguments {
                function: name.to_string(),
                message,
                span,
            }),
            Err(CallError::NonFinite) => Err(EvalErrorKind::NonFinite { span }),
        }
    }

    fn unary(&self, op: UnaryOp, value: Option<&Value>, span: Span) -> Result<Value, EvalErrorKind> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!is_truthy(value))),
            UnaryOp::Neg => {
                let n = to_number(value).ok_or_else(|| EvalErrorKind::InvalidOperands {
                    operator: op.symbol(),
                    details: format!("cannot negate {}", type_name(value)),
                    span,
                })?;
                number_value(-n).ok_or(EvalErrorKind::NonFinite { span })
            }
        }
    }

    fn binary(&self, op: BinaryOp, left: &Expr, right: &Expr, span: Span) -> Result<Slot<'s>, EvalErrorKind> {
        let lhs = self.eval(left)?;
        let short_circuits = match op {
            BinaryOp::And => !is_truthy(lhs.as_deref()),
            BinaryOp::Or => is_truthy(lhs.as_deref()),
            BinaryOp::Nullish => !is_nullish(lhs.as_deref()),
            _ => false,
        };
        if short_circuits {
            return Ok(lhs);
        }

        let rhs = self.eval(right)?;
        let (a, b) = (lhs.as_deref(), rhs.as_deref());
        let value = match op {
            BinaryOp::Eq => Value::Bool(loose_equals(a, b)),
            BinaryOp::Ne => Value::Bool(!loose_equals(a, b)),
            BinaryOp::StrictEq => Value::Bool(strict_equals(a, b)),
            BinaryOp::StrictNe => Value::Bool(!strict_equals(a, b)),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, a, b, span)?,
            BinaryOp::Add => add(a, b, span)?,
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, a, b, span)?,
            // Left side didn't decide the result
            BinaryOp::And | BinaryOp::Or | BinaryOp::Nullish => return Ok(rhs),
        };
        Ok(Some(Cow::Owned(value)))
    }
}

fn literal_value(literal: &Literal, span: Span) -> Result<Slot<'static>, EvalErrorKind> {
    let value = match literal {
        Literal::Number(n) => number_value(*n).ok_or(EvalErrorKind::NonFinite { span })?,
        Literal::String(s) => Value::String(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
        Literal::Undefined => return Ok(None),
    };
    Ok(Some(Cow::Owned(value)))
}

fn get_property<'v>(target: Cow<'v, Value>, key: &str) -> Slot<'v> {
    if key == "length" {
        match target.as_ref() {
            Value::Array(items) => return Some(Cow::Owned(Value::from(items.len() as u64))),
            Value::String(s) => return Some(Cow::Owned(Value::from(s.chars().count() as u64))),
            _ => {}
        }
    }
    match target {
        Cow::Borrowed(value) => match value {
            Value::Object(map) => map.get(key).map(Cow::Borrowed),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)).map(Cow::Borrowed),
            _ => None,
        },
        Cow::Owned(value) => match value {
            Value::Object(mut map) => map.remove(key).map(Cow::Owned),
            Value::Array(mut items) => match key.parse::<usize>() {
                Ok(i) if i < items.len() => Some(Cow::Owned(items.swap_remove(i))),
                _ => None,
            },
            _ => None,
        },
    }
}

fn get_indexed<'v>(target: Cow<'v, Value>, key: Option<&Value>) -> Slot<'v> {
    match key {
        Some(Value::Number(n)) => {
            let Some(f) = n.as_f64() else {
                return None;
            };
            if f < 0.0 || f.fract() != 0.0 {
                return None;
            }
            if let Value::String(s) = target.as_ref() {
                return s
                    .chars()
                    .nth(f as usize)
                    .map(|c| Cow::Owned(Value::String(c.to_string())));
            }
            get_property(target, &(f as u64).to_string())
        }
        Some(Value::String(key)) => get_property(target, key),
        other => get_property(target, &to_display_string(other)),
    }
}

fn compare(op: BinaryOp, a: Option<&Value>, b: Option<&Value>, span: Span) -> Result<Value, EvalErrorKind> {
    let ordering = match (a, b) {
        (Some(Value::String(x)), Some(Value::String(y))) => Some(x.cmp(y)),
        (Some(Value::Array(_) | Value::Object(_)), _) | (_, Some(Value::Array(_) | Value::Object(_))) => {
            return Err(EvalErrorKind::InvalidOperands {
                operator: op.symbol(),
                details: format!("cannot compare {} with {}", type_name(a), type_name(b)),
                span,
            })
        }
        _ => match (to_number(a), to_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            // Comparisons involving NaN are false
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    };
    Ok(Value::Bool(result))
}

fn add(a: Option<&Value>, b: Option<&Value>, span: Span) -> Result<Value, EvalErrorKind> {
    if matches!(a, Some(Value::String(_))) || matches!(b, Some(Value::String(_))) {
        return Ok(Value::String(format!("{}{}", to_display_string(a), to_display_string(b))));
    }
    arithmetic(BinaryOp::Add, a, b, span)
}

fn arithmetic(op: BinaryOp, a: Option<&Value>, b: Option<&Value>, span: Span) -> Result<Value, EvalErrorKind> {
    let operands = match (a, b) {
        (Some(Value::Array(_) | Value::Object(_)), _) | (_, Some(Value::Array(_) | Value::Object(_))) => None,
        _ => to_number(a).zip(to_number(b)),
    };
    let Some((x, y)) = operands else {
        return Err(EvalErrorKind::InvalidOperands {
            operator: op.symbol(),
            details: format!("{} and {}", type_name(a), type_name(b)),
            span,
        });
    };
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div | BinaryOp::Rem if y == 0.0 => return Err(EvalErrorKind::DivisionByZero { span }),
        BinaryOp::Div => x / y,
        _ => x % y,
    };
    number_value(result).ok_or(EvalErrorKind::NonFinite { span })
}

/// Dotted text of a callee for error messages
fn callee_name(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Ident(name) => name.clone(),
        ExprKind::Member { object, property, .. } => format!("{}.{}", callee_name(object), property),
        _ => "<expression>".to_string(),
    }
}
