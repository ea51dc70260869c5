//! Debug Log - bounded record of errors and diagnostics for the debugger UI

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What produced an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum LogSource {
    Query(String),
    Component(String),
    Page(String),
    Engine,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Query(id) => write!(f, "query:{}", id),
            LogSource::Component(id) => write!(f, "component:{}", id),
            LogSource::Page(id) => write!(f, "page:{}", id),
            LogSource::Engine => f.write_str("engine"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugLogEntry {
    /// Insertion sequence number, unique per log
    pub seq: u64,
    pub timestamp: SystemTime,
    pub severity: Severity,
    pub source: LogSource,
    pub page_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl DebugLogEntry {
    pub fn new(severity: Severity, source: LogSource, message: impl Into<String>) -> Self {
        Self {
            seq: 0,
            timestamp: SystemTime::now(),
            severity,
            source,
            page_id: None,
            message: message.into(),
            detail: None,
        }
    }

    pub fn error(source: LogSource, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, source, message)
    }

    pub fn warning(source: LogSource, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, source, message)
    }

    pub fn on_page(mut self, page_id: Option<String>) -> Self {
        self.page_id = page_id;
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Which entries `list` returns. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogFilter {
    pub page_id: Option<String>,
    /// Minimum severity
    pub severity: Option<Severity>,
    pub source: Option<LogSource>,
    pub limit: Option<usize>,
}

impl LogFilter {
    fn matches(&self, entry: &DebugLogEntry) -> bool {
        self.page_id.as_ref().map_or(true, |page| entry.page_id.as_ref() == Some(page))
            && self.severity.map_or(true, |min| entry.severity >= min)
            && self.source.as_ref().map_or(true, |source| entry.source == *source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    All,
    Page(String),
}

/// Ring buffer of entries; the oldest is evicted once `capacity` is reached
#[derive(Debug, Clone)]
pub struct DebugLog {
    entries: VecDeque<DebugLogEntry>,
    capacity: usize,
    next_seq: u64,
}

impl DebugLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 1,
        }
    }

    /// Append an entry. Never fails; a zero-capacity log only traces.
    pub fn record(&mut self, mut entry: DebugLogEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;

        match entry.severity {
            Severity::Error => error!(source = %entry.source, page = ?entry.page_id, "{}", entry.message),
            Severity::Warning => warn!(source = %entry.source, page = ?entry.page_id, "{}", entry.message),
            Severity::Info => info!(source = %entry.source, page = ?entry.page_id, "{}", entry.message),
        }

        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn clear(&mut self, scope: &ClearScope) {
        match scope {
            ClearScope::All => self.entries.clear(),
            ClearScope::Page(page) => self.entries.retain(|e| e.page_id.as_ref() != Some(page)),
        }
    }

    /// Matching entries, newest first
    pub fn list(&self, filter: &LogFilter) -> Vec<DebugLogEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Shrinking drops the oldest entries
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new(50)
    }
}
