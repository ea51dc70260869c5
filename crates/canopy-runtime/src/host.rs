//! Action host - UI effects the engine asks the embedder to perform

use crate::AlertKind;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// Receives alerts, external navigation and component-specific actions.
/// Calls are made from inside an action chain and should not block.
pub trait ActionHost: Send + Sync {
    fn show_alert(&self, kind: AlertKind, message: &str);

    fn navigate(&self, url: &str, new_tab: bool);

    /// `Err` fails the action and halts its chain
    fn control_component(&self, component: &str, method: &str, params: &[Value]) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "kebab-case")]
pub enum HostCall {
    Alert { kind: AlertKind, message: String },
    Navigate { url: String, new_tab: bool },
    ControlComponent { component: String, method: String, params: Vec<Value> },
}

/// Host that only records what it was asked to do. Components listed via
/// `reject_component` fail every control call.
#[derive(Debug, Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<HostCall>>,
    rejected: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_component(&self, component: impl Into<String>) {
        self.rejected.lock().push(component.into());
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                HostCall::Alert { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ActionHost for RecordingHost {
    fn show_alert(&self, kind: AlertKind, message: &str) {
        self.calls.lock().push(HostCall::Alert {
            kind,
            message: message.to_string(),
        });
    }

    fn navigate(&self, url: &str, new_tab: bool) {
        self.calls.lock().push(HostCall::Navigate {
            url: url.to_string(),
            new_tab,
        });
    }

    fn control_component(&self, component: &str, method: &str, params: &[Value]) -> Result<(), String> {
        if self.rejected.lock().iter().any(|c| c == component) {
            return Err(format!("component '{}' cannot {}", component, method));
        }
        self.calls.lock().push(HostCall::ControlComponent {
            component: component.to_string(),
            method: method.to_string(),
            params: params.to_vec(),
        });
        Ok(())
    }
}
