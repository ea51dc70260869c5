use canopy_ast::PathError;
use canopy_eval::EvalError;
use canopy_graph::CycleError;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors returned by session entry points
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// Structural edit attempted on a released version
    #[error("version is released; '{operation}' is not allowed")]
    VersionLocked { operation: &'static str },

    #[error("unknown query '{0}'")]
    UnknownQuery(String),

    #[error("unknown page '{0}'")]
    UnknownPage(String),

    #[error("unknown component '{0}'")]
    UnknownComponent(String),

    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },

    #[error("page handle '{0}' is already in use")]
    DuplicateHandle(String),

    #[error("cannot delete page '{page}': {reason}")]
    PageDeletion { page: String, reason: &'static str },

    #[error("invalid page order: {0}")]
    InvalidPageOrder(String),

    #[error(transparent)]
    Path(#[from] PathError),

    /// Write the store refuses; nothing in the batch was applied
    #[error("cannot write '{path}': {reason}")]
    InvalidWrite { path: String, reason: &'static str },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Why a query run ended in error. Stored at `queries.<id>.error` and
/// delivered to every caller of the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// Network/connection failure; retried per the query's retry policy
    #[error("transport failure after {attempts} attempt(s): {message}")]
    Transport { message: String, attempts: u32 },

    /// The data source rejected the request; never retried
    #[error("data source rejected the request: {message}")]
    Logic { message: String, code: Option<String> },

    #[error("options failed to resolve: {0}")]
    Options(EvalError),

    #[error("transform failed: {0}")]
    Transform(EvalError),

    #[error("query is blocked: {0}")]
    Blocked(CycleError),

    #[error("unknown query '{0}'")]
    Unknown(String),
}

impl QueryError {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Transport { .. } => "transport",
            QueryError::Logic { .. } => "logic",
            QueryError::Options(_) => "options",
            QueryError::Transform(_) => "transform",
            QueryError::Blocked(_) => "blocked",
            QueryError::Unknown(_) => "unknown",
        }
    }

    /// Shape written into the state tree
    pub fn to_state_value(&self) -> Value {
        let mut value = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let QueryError::Logic { code: Some(code), .. } = self {
            value["code"] = Value::String(code.clone());
        }
        value
    }
}

/// An event action failed; its chain stops here
#[derive(Debug, Clone, PartialEq, Error)]
#[error("action #{index} ({action}) of '{event}' failed: {kind}")]
pub struct DispatchError {
    pub event: String,
    pub index: usize,
    pub action: &'static str,
    #[source]
    pub kind: DispatchErrorKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchErrorKind {
    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("run of '{0}' was discarded")]
    Discarded(String),

    #[error("host rejected the action: {0}")]
    Host(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logic_error_state_carries_code() {
        let error = QueryError::Logic {
            message: "not found".into(),
            code: Some("404".into()),
        };
        let state = error.to_state_value();
        assert_eq!(state["kind"], "logic");
        assert_eq!(state["code"], "404");
        assert!(state["message"].as_str().unwrap().contains("not found"));
    }

    #[test]
    fn test_dispatch_error_message() {
        let error = DispatchError {
            event: "onClick".into(),
            index: 1,
            action: "run-query",
            kind: DispatchErrorKind::Query(QueryError::Unknown("q9".into())),
        };
        assert_eq!(
            error.to_string(),
            "action #1 (run-query) of 'onClick' failed: unknown query 'q9'"
        );
    }
}
