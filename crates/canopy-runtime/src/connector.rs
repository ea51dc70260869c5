//! Data source connector - the only place the engine suspends

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A query with its options resolved against state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query_id: String,
    pub data_source: String,
    pub options: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    /// Connection-level failure; may succeed on retry
    #[error("{0}")]
    Transport(String),

    /// The data source understood and rejected the request
    #[error("{message}")]
    Logic { message: String, code: Option<String> },
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::Transport(_))
    }
}

/// Executes resolved queries against a data source
#[async_trait]
pub trait DataSourceConnector: Send + Sync {
    async fn execute(&self, request: &QueryRequest) -> Result<Value, ConnectorError>;
}

/// Serves canned responses keyed by query id.
///
/// Fixture format, per query: `{"data": ...}`, `{"error": "msg", "code": "404"}`
/// for a logic failure, or `{"transport": "msg"}` for a transport failure.
#[derive(Debug, Clone, Default)]
pub struct FixtureConnector {
    fixtures: Map<String, Value>,
}

impl FixtureConnector {
    pub fn new(fixtures: Map<String, Value>) -> Self {
        Self { fixtures }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self::new)
    }
}

#[async_trait]
impl DataSourceConnector for FixtureConnector {
    async fn execute(&self, request: &QueryRequest) -> Result<Value, ConnectorError> {
        let Some(fixture) = self.fixtures.get(&request.query_id) else {
            return Err(ConnectorError::Logic {
                message: format!("no fixture for query '{}'", request.query_id),
                code: None,
            });
        };
        if let Some(message) = fixture.get("transport") {
            return Err(ConnectorError::Transport(text_of(message)));
        }
        if let Some(message) = fixture.get("error").filter(|e| !e.is_null()) {
            return Err(ConnectorError::Logic {
                message: text_of(message),
                code: fixture.get("code").map(text_of),
            });
        }
        Ok(fixture.get("data").cloned().unwrap_or(Value::Null))
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
