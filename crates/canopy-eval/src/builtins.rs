//! Allow-listed functions and methods
//!
//! Nothing outside these tables can be called from a binding.

use crate::value::{is_truthy, number_value, strict_equals, to_display_string, to_number, type_name};
use serde_json::{Map, Value};

/// Root identifiers that name builtin function groups
pub const BUILTIN_ROOTS: &[&str] = &["Math", "JSON", "String", "Number", "Boolean", "Array", "Object"];

pub fn is_builtin_root(name: &str) -> bool {
    BUILTIN_ROOTS.contains(&name)
}

pub(crate) enum CallError {
    /// Not on the allow-list
    Unknown,
    /// On the allow-list but called with unusable arguments
    BadArguments(String),
    /// Produced NaN or an infinity
    NonFinite,
}

type CallResult = Result<Option<Value>, CallError>;

fn bad(message: impl Into<String>) -> CallError {
    CallError::BadArguments(message.into())
}

fn arg(args: &[Option<Value>], index: usize) -> Option<&Value> {
    args.get(index).and_then(|a| a.as_ref())
}

fn number_arg(args: &[Option<Value>], index: usize) -> Result<f64, CallError> {
    to_number(arg(args, index)).ok_or_else(|| {
        bad(format!(
            "argument {} must be a number, got {}",
            index + 1,
            type_name(arg(args, index))
        ))
    })
}

fn string_arg(args: &[Option<Value>], index: usize) -> Result<String, CallError> {
    match arg(args, index) {
        Some(Value::String(s)) => Ok(s.clone()),
        other => Err(bad(format!(
            "argument {} must be a string, got {}",
            index + 1,
            type_name(other)
        ))),
    }
}

fn finite(f: f64) -> CallResult {
    number_value(f).map(Some).ok_or(CallError::NonFinite)
}

/// Constants reachable as `Root.NAME` without a call
pub(crate) fn constant(root: &str, name: &str) -> Option<Value> {
    match (root, name) {
        ("Math", "PI") => number_value(std::f64::consts::PI),
        ("Math", "E") => number_value(std::f64::consts::E),
        _ => None,
    }
}

/// `Root.name(args)` or, with an empty `name`, `Root(args)`
pub(crate) fn call_function(root: &str, name: &str, args: &[Option<Value>]) -> CallResult {
    match (root, name) {
        ("Math", "max") | ("Math", "min") => {
            let mut acc = if name == "max" { f64::NEG_INFINITY } else { f64::INFINITY };
            for index in 0..args.len() {
                let n = number_arg(args, index)?;
                acc = if name == "max" { acc.max(n) } else { acc.min(n) };
            }
            finite(acc)
        }
        ("Math", "abs") => finite(number_arg(args, 0)?.abs()),
        // JS rounds halves toward positive infinity
        ("Math", "round") => finite((number_arg(args, 0)? + 0.5).floor()),
        ("Math", "floor") => finite(number_arg(args, 0)?.floor()),
        ("Math", "ceil") => finite(number_arg(args, 0)?.ceil()),
        ("Math", "sqrt") => finite(number_arg(args, 0)?.sqrt()),
        ("Math", "pow") => finite(number_arg(args, 0)?.powf(number_arg(args, 1)?)),

        ("JSON", "stringify") => {
            let Some(value) = arg(args, 0) else {
                return Ok(None);
            };
            let indent = to_number(arg(args, 2)).unwrap_or(0.0);
            let text = if indent > 0.0 {
                serde_json::to_string_pretty(value)
            } else {
                serde_json::to_string(value)
            }
            .map_err(|e| bad(e.to_string()))?;
            Ok(Some(Value::String(text)))
        }
        ("JSON", "parse") => {
            let text = string_arg(args, 0)?;
            serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| bad(format!("invalid JSON: {}", e)))
        }

        ("String", "") => Ok(Some(Value::String(match args.first() {
            Some(value) => to_display_string(value.as_ref()),
            None => String::new(),
        }))),
        ("Number", "") => {
            if args.is_empty() {
                return Ok(Some(Value::from(0)));
            }
            let n = to_number(arg(args, 0)).ok_or_else(|| bad("value is not numeric"))?;
            finite(n)
        }
        ("Boolean", "") => Ok(Some(Value::Bool(is_truthy(arg(args, 0))))),

        ("Array", "isArray") => Ok(Some(Value::Bool(matches!(arg(args, 0), Some(Value::Array(_)))))),

        ("Object", "keys") => object_arg(args).map(|map| {
            Some(Value::Array(map.keys().cloned().map(Value::String).collect()))
        }),
        ("Object", "values") => object_arg(args).map(|map| Some(Value::Array(map.values().cloned().collect()))),
        ("Object", "entries") => object_arg(args).map(|map| {
            Some(Value::Array(
                map.iter()
                    .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                    .collect(),
            ))
        }),

        _ => Err(CallError::Unknown),
    }
}

fn object_arg(args: &[Option<Value>]) -> Result<&Map<String, Value>, CallError> {
    match arg(args, 0) {
        Some(Value::Object(map)) => Ok(map),
        other => Err(bad(format!("argument 1 must be an object, got {}", type_name(other)))),
    }
}

/// `target.method(args)`
pub(crate) fn call_method(target: Option<&Value>, method: &str, args: &[Option<Value>]) -> CallResult {
    match target {
        Some(Value::String(s)) => string_method(s, method, args),
        Some(Value::Array(items)) => array_method(items, method, args),
        Some(Value::Number(n)) => number_method(n.as_f64().unwrap_or(0.0), method, args),
        Some(value) if method == "toString" => Ok(Some(Value::String(to_display_string(Some(value))))),
        _ => Err(CallError::Unknown),
    }
}

fn string_method(s: &str, method: &str, args: &[Option<Value>]) -> CallResult {
    let result = match method {
        "toUpperCase" => Value::String(s.to_uppercase()),
        "toLowerCase" => Value::String(s.to_lowercase()),
        "trim" => Value::String(s.trim().to_string()),
        "toString" => Value::String(s.to_string()),
        "includes" => Value::Bool(s.contains(string_arg(args, 0)?.as_str())),
        "startsWith" => Value::Bool(s.starts_with(string_arg(args, 0)?.as_str())),
        "endsWith" => Value::Bool(s.ends_with(string_arg(args, 0)?.as_str())),
        "indexOf" => {
            let needle = string_arg(args, 0)?;
            match s.find(needle.as_str()) {
                Some(byte) => Value::from(s[..byte].chars().count() as i64),
                None => Value::from(-1),
            }
        }
        "split" => {
            let sep = string_arg(args, 0)?;
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                s.split(sep.as_str()).map(|p| Value::String(p.to_string())).collect()
            };
            Value::Array(parts)
        }
        "replace" => {
            let from = string_arg(args, 0)?;
            let to = string_arg(args, 1)?;
            Value::String(s.replacen(from.as_str(), &to, 1))
        }
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = slice_bounds(chars.len(), args)?;
            Value::String(chars[start..end].iter().collect())
        }
        _ => return Err(CallError::Unknown),
    };
    Ok(Some(result))
}

fn array_method(items: &[Value], method: &str, args: &[Option<Value>]) -> CallResult {
    let result = match method {
        "includes" => Value::Bool(items.iter().any(|item| strict_equals(Some(item), arg(args, 0)))),
        "indexOf" => match items.iter().position(|item| strict_equals(Some(item), arg(args, 0))) {
            Some(index) => Value::from(index as i64),
            None => Value::from(-1),
        },
        "join" | "toString" => {
            let sep = match arg(args, 0) {
                Some(Value::String(sep)) if method == "join" => sep.clone(),
                _ => ",".to_string(),
            };
            let parts: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::Null => String::new(),
                    other => to_display_string(Some(other)),
                })
                .collect();
            Value::String(parts.join(&sep))
        }
        "slice" => {
            let (start, end) = slice_bounds(items.len(), args)?;
            Value::Array(items[start..end].to_vec())
        }
        "at" => {
            let index = number_arg(args, 0)? as i64;
            let resolved = if index < 0 { items.len() as i64 + index } else { index };
            return Ok(usize::try_from(resolved).ok().and_then(|i| items.get(i)).cloned());
        }
        "concat" => {
            let mut joined = items.to_vec();
            for extra in args.iter().flatten() {
                match extra {
                    Value::Array(more) => joined.extend(more.iter().cloned()),
                    other => joined.push(other.clone()),
                }
            }
            Value::Array(joined)
        }
        "reverse" => Value::Array(items.iter().rev().cloned().collect()),
        _ => return Err(CallError::Unknown),
    };
    Ok(Some(result))
}

fn number_method(n: f64, method: &str, args: &[Option<Value>]) -> CallResult {
    match method {
        "toFixed" => {
            let digits = if args.is_empty() { 0.0 } else { number_arg(args, 0)? };
            if !(0.0..=20.0).contains(&digits) {
                return Err(bad("digits must be between 0 and 20"));
            }
            Ok(Some(Value::String(format!("{:.*}", digits as usize, n))))
        }
        "toString" => Ok(Some(Value::String(to_display_string(number_value(n).as_ref())))),
        _ => Err(CallError::Unknown),
    }
}

/// JS-style `slice(start, end)` bounds with negative offsets from the end
fn slice_bounds(len: usize, args: &[Option<Value>]) -> Result<(usize, usize), CallError> {
    let resolve = |raw: f64| -> usize {
        let raw = raw.trunc() as i64;
        let len = len as i64;
        let index = if raw < 0 { (len + raw).max(0) } else { raw.min(len) };
        index as usize
    };
    let start = if arg(args, 0).is_some() { resolve(number_arg(args, 0)?) } else { 0 };
    let end = if arg(args, 1).is_some() { resolve(number_arg(args, 1)?) } else { len };
    Ok((start, end.max(start)))
}
