//! App definition - the read-only document a session is opened from
//!
//! Loaded once at session start; later edits arrive as explicit
//! update/remove calls on the session.

use crate::RetryPolicy;
use canopy_graph::{Binding, DependentId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppDefinition {
    pub pages: Vec<Page>,
    /// Defaults to the first page
    pub home_page_id: Option<String>,
    pub components: Vec<ComponentDefinition>,
    pub queries: Vec<QueryDefinition>,
    /// Initial contents of the `globals` namespace
    pub globals: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub name: String,
    pub handle: String,
    #[serde(default)]
    pub hidden: bool,
    /// Actions attached to the page's `onPageLoad` event
    #[serde(default)]
    pub events: Vec<EventAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinition {
    pub id: String,
    #[serde(default)]
    pub component_type: String,
    #[serde(default)]
    pub page_id: Option<String>,
    /// Property name -> template
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub events: Vec<EventAction>,
}

impl ComponentDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            component_type: String::new(),
            page_id: None,
            properties: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.properties.insert(name.into(), template.into());
        self
    }

    pub fn on_page(mut self, page_id: impl Into<String>) -> Self {
        self.page_id = Some(page_id.into());
        self
    }

    pub fn with_event(mut self, action: EventAction) -> Self {
        self.events.push(action);
        self
    }

    pub(crate) fn bindings(&self) -> impl Iterator<Item = Binding> + '_ {
        self.properties
            .iter()
            .map(|(property, template)| Binding::new(DependentId::component(&self.id, property), template))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    /// Runs only when asked to (a call or a run-query action)
    #[default]
    Manual,
    /// Runs whenever its page loads
    OnPageLoad,
    /// Runs from event actions
    OnEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinition {
    pub id: String,
    pub data_source: String,
    /// Any string leaf is a template resolved before each run
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub trigger: Trigger,
    /// Re-run whenever a state path the options read changes
    #[serde(default)]
    pub auto_run: bool,
    /// Falls back to the engine's policy when absent
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Template evaluated with `data` bound to the raw payload
    #[serde(default)]
    pub transform: Option<String>,
    /// Owning page; `None` means app-wide
    #[serde(default)]
    pub page_id: Option<String>,
    /// Actions for `onDataQuerySuccess` / `onDataQueryFailure`
    #[serde(default)]
    pub events: Vec<EventAction>,
}

impl QueryDefinition {
    pub fn new(id: impl Into<String>, data_source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data_source: data_source.into(),
            options: Value::Object(Map::new()),
            trigger: Trigger::Manual,
            auto_run: false,
            retry: None,
            transform: None,
            page_id: None,
            events: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn auto_run(mut self) -> Self {
        self.auto_run = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    pub fn on_page(mut self, page_id: impl Into<String>) -> Self {
        self.page_id = Some(page_id.into());
        self
    }

    pub fn with_event(mut self, action: EventAction) -> Self {
        self.events.push(action);
        self
    }

    /// One binding per templated option, plus the transform
    pub(crate) fn bindings(&self) -> Vec<Binding> {
        let dependent = DependentId::query(&self.id);
        let mut templates = Vec::new();
        collect_templates(&self.options, &mut templates);
        let mut bindings: Vec<Binding> = templates
            .into_iter()
            .map(|template| Binding::new(dependent.clone(), template))
            .collect();
        if let Some(transform) = &self.transform {
            bindings.push(Binding::new(dependent, transform.as_str()).with_local("data"));
        }
        bindings
    }
}

fn collect_templates(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if s.contains("{{") => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_templates(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_templates(item, out)),
        _ => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// One step of an event's action chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAction {
    /// Event name this action is attached to (`onClick`, `onDataQuerySuccess`...)
    pub event: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Template; a falsy result skips this action
    #[serde(default)]
    pub guard: Option<String>,
    /// Start the action and move on without awaiting it
    #[serde(default)]
    pub fire_and_forget: bool,
}

impl EventAction {
    pub fn new(event: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            event: event.into(),
            kind,
            guard: None,
            fire_and_forget: false,
        }
    }

    pub fn when(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn detached(mut self) -> Self {
        self.fire_and_forget = true;
        self
    }
}

/// Action parameters are templates unless noted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ActionKind {
    RunQuery {
        query: String,
    },
    SetVariable {
        key: String,
        value: String,
    },
    UnsetVariable {
        key: String,
    },
    SetPageVariable {
        key: String,
        value: String,
    },
    ShowAlert {
        #[serde(default)]
        alert: AlertKind,
        message: String,
    },
    /// External URL
    Navigate {
        url: String,
        #[serde(default)]
        new_tab: bool,
    },
    /// Page id or handle
    SwitchPage {
        page: String,
    },
    /// Component-specific action forwarded to the host
    ControlComponent {
        component: String,
        method: String,
        #[serde(default)]
        params: Vec<String>,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::RunQuery { .. } => "run-query",
            ActionKind::SetVariable { .. } => "set-variable",
            ActionKind::UnsetVariable { .. } => "unset-variable",
            ActionKind::SetPageVariable { .. } => "set-page-variable",
            ActionKind::ShowAlert { .. } => "show-alert",
            ActionKind::Navigate { .. } => "navigate",
            ActionKind::SwitchPage { .. } => "switch-page",
            ActionKind::ControlComponent { .. } => "control-component",
        }
    }
}
