//! Event dispatch - ordered action chains
//!
//! An event's actions run one after another. A failing action stops the
//! chain and is logged; a detached action is started and left to finish on
//! its own, its failure logged without affecting the rest of the chain.

use crate::session::{EventSource, Session};
use crate::{
    ActionKind, DispatchError, DispatchErrorKind, EventAction, LogSource, Mutation, RunOutcome, RuntimeError,
};
use canopy_ast::{Namespace, StatePath};
use canopy_eval::{is_truthy, to_display_string};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, instrument};

pub(crate) type ChainFuture = Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send>>;

impl Session {
    /// Raise `event` on `source`, running its attached actions in order.
    /// `context` is visible to action templates as `event`.
    #[instrument(skip(self, context))]
    pub async fn dispatch(&self, source: EventSource, event: &str, context: Value) -> Result<(), DispatchError> {
        let actions = {
            let engine = self.inner.engine.lock();
            let attached = match &source {
                EventSource::Component(id) => engine
                    .components
                    .get(id)
                    .map(|c| c.events.clone())
                    .ok_or_else(|| RuntimeError::UnknownComponent(id.clone())),
                EventSource::Query(id) => engine
                    .queries
                    .get(id)
                    .map(|q| q.events.clone())
                    .ok_or_else(|| RuntimeError::UnknownQuery(id.clone())),
                EventSource::Page(id) => engine
                    .pages
                    .get(id)
                    .map(|p| p.events.clone())
                    .ok_or_else(|| RuntimeError::UnknownPage(id.clone())),
            };
            attached.map_err(|err| DispatchError {
                event: event.to_string(),
                index: 0,
                action: "dispatch",
                kind: err.into(),
            })?
        };
        let actions: Vec<EventAction> = actions.into_iter().filter(|a| a.event == event).collect();
        self.run_actions(source, event.to_string(), actions, context).await
    }

    /// Boxed so chains can nest (a switch-page action runs the target's
    /// page-load chain)
    pub(crate) fn run_actions(
        &self,
        source: EventSource,
        event: String,
        actions: Vec<EventAction>,
        context: Value,
    ) -> ChainFuture {
        let session = self.clone();
        Box::pin(async move {
            let log_source = LogSource::from(&source);
            for (index, action) in actions.into_iter().enumerate() {
                if let Some(guard) = &action.guard {
                    match session.evaluate_with_event(guard, &context) {
                        Ok(value) if !is_truthy(Some(&value)) => {
                            debug!(%event, index, action = action.kind.name(), "guard is falsy, skipped");
                            continue;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            let err = DispatchError {
                                event: event.clone(),
                                index,
                                action: action.kind.name(),
                                kind: err.into(),
                            };
                            session.log_failure(log_source.clone(), err.to_string());
                            return Err(err);
                        }
                    }
                }

                if action.fire_and_forget {
                    let detached = session.clone();
                    let (event, context, log_source) = (event.clone(), context.clone(), log_source.clone());
                    session.spawn(async move {
                        if let Err(err) = detached.perform(&event, index, &action, &context).await {
                            detached.log_failure(log_source, err.to_string());
                        }
                    });
                    continue;
                }

                if let Err(err) = session.perform(&event, index, &action, &context).await {
                    session.log_failure(log_source.clone(), err.to_string());
                    return Err(err);
                }
            }
            Ok(())
        })
    }

    async fn perform(&self, event: &str, index: usize, action: &EventAction, context: &Value) -> Result<(), DispatchError> {
        let fail = |kind: DispatchErrorKind| DispatchError {
            event: event.to_string(),
            index,
            action: action.kind.name(),
            kind,
        };
        let text = |template: &str| {
            self.evaluate_with_event(template, context)
                .map(|value| to_display_string(Some(&value)))
                .map_err(|err| fail(err.into()))
        };
        debug!(event, index, action = action.kind.name(), "performing action");

        match &action.kind {
            ActionKind::RunQuery { query } => match self.run_query(query).await {
                RunOutcome::Success { .. } => Ok(()),
                RunOutcome::Failed { error, .. } => Err(fail(error.into())),
                RunOutcome::Discarded { .. } => Err(fail(DispatchErrorKind::Discarded(query.clone()))),
            },
            ActionKind::SetVariable { key, value } => {
                let value = self
                    .evaluate_with_event(value, context)
                    .map_err(|err| fail(err.into()))?;
                self.set_path(&StatePath::new(Namespace::Variables).join(key.as_str()), value)
                    .map_err(|err| fail(err.into()))
            }
            ActionKind::UnsetVariable { key } => {
                self.batch([Mutation::unset(StatePath::new(Namespace::Variables).join(key.as_str()))])
                    .map_err(|err| fail(err.into()))
            }
            ActionKind::SetPageVariable { key, value } => {
                let value = self
                    .evaluate_with_event(value, context)
                    .map_err(|err| fail(err.into()))?;
                let path = StatePath::new(Namespace::Page).join("variables").join(key.as_str());
                self.set_path(&path, value).map_err(|err| fail(err.into()))
            }
            ActionKind::ShowAlert { alert, message } => {
                let message = text(message)?;
                self.inner.host.show_alert(*alert, &message);
                Ok(())
            }
            ActionKind::Navigate { url, new_tab } => {
                let url = text(url)?;
                self.inner.host.navigate(&url, *new_tab);
                Ok(())
            }
            ActionKind::SwitchPage { page } => {
                let page = text(page)?;
                self.switch_page(&page).await.map_err(|err| fail(err.into()))
            }
            ActionKind::ControlComponent {
                component,
                method,
                params,
            } => {
                let params = params
                    .iter()
                    .map(|param| self.evaluate_with_event(param, context))
                    .collect::<Result<Vec<Value>, _>>()
                    .map_err(|err| fail(err.into()))?;
                self.inner
                    .host
                    .control_component(component, method, &params)
                    .map_err(|message| fail(DispatchErrorKind::Host(message)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl DataSourceConnector for Echo {
        async fn execute(&self, request: &QueryRequest) -> Result<Value, ConnectorError> {
            if request.query_id == "broken" {
                return Err(ConnectorError::Logic {
                    message: "bad request".into(),
                    code: Some("400".into()),
                });
            }
            Ok(request.options.clone())
        }
    }

    fn session(definition: AppDefinition) -> (Session, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::new());
        let session = Session::builder(definition, Arc::new(Echo))
            .host(host.clone())
            .build()
            .unwrap();
        (session, host)
    }

    fn button(events: Vec<EventAction>) -> ComponentDefinition {
        events
            .into_iter()
            .fold(ComponentDefinition::new("button1"), |c, e| c.with_event(e))
    }

    fn on_click(kind: ActionKind) -> EventAction {
        EventAction::new("onClick", kind)
    }

    fn alert(message: &str) -> ActionKind {
        ActionKind::ShowAlert {
            alert: AlertKind::Info,
            message: message.into(),
        }
    }

    // === Ordering ===

    #[tokio::test]
    async fn test_actions_run_in_order() {
        let definition = AppDefinition {
            components: vec![button(vec![
                on_click(ActionKind::SetVariable {
                    key: "count".into(),
                    value: "{{ 41 + 1 }}".into(),
                }),
                on_click(alert("count is {{ variables.count }}")),
            ])],
            ..AppDefinition::default()
        };
        let (session, host) = session(definition);

        session
            .dispatch(EventSource::Component("button1".into()), "onClick", json!({}))
            .await
            .unwrap();
        assert_eq!(host.alerts(), vec!["count is 42".to_string()]);
        assert_eq!(session.get("variables.count").unwrap(), Some(json!(42)));
    }

    #[tokio::test]
    async fn test_event_context_is_visible() {
        let definition = AppDefinition {
            components: vec![button(vec![on_click(alert("row {{ event.row.id }}"))])],
            ..AppDefinition::default()
        };
        let (session, host) = session(definition);
        session
            .dispatch(EventSource::Component("button1".into()), "onClick", json!({"row": {"id": 7}}))
            .await
            .unwrap();
        assert_eq!(host.alerts(), vec!["row 7".to_string()]);
    }

    // === Guards ===

    #[tokio::test]
    async fn test_falsy_guard_skips_action() {
        let definition = AppDefinition {
            components: vec![button(vec![
                on_click(alert("skipped")).when("{{ globals.enabled }}"),
                on_click(alert("shown")),
            ])],
            globals: json!({"enabled": false}).as_object().cloned().unwrap(),
            ..AppDefinition::default()
        };
        let (session, host) = session(definition);
        session
            .dispatch(EventSource::Component("button1".into()), "onClick", json!({}))
            .await
            .unwrap();
        assert_eq!(host.alerts(), vec!["shown".to_string()]);
    }

    // === Failures ===

    #[tokio::test]
    async fn test_failure_halts_chain_and_is_logged() {
        let definition = AppDefinition {
            components: vec![button(vec![
                on_click(ActionKind::RunQuery { query: "broken".into() }),
                on_click(alert("never")),
            ])],
            queries: vec![QueryDefinition::new("broken", "rest")],
            ..AppDefinition::default()
        };
        let (session, host) = session(definition);

        let err = session
            .dispatch(EventSource::Component("button1".into()), "onClick", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.index, 0);
        assert_eq!(err.action, "run-query");
        assert!(matches!(err.kind, DispatchErrorKind::Query(QueryError::Logic { .. })));
        assert!(host.alerts().is_empty());

        let logged = session.debug_log(&LogFilter {
            source: Some(LogSource::Component("button1".into())),
            ..LogFilter::default()
        });
        assert_eq!(logged.len(), 1);
    }

    #[tokio::test]
    async fn test_detached_failure_does_not_halt_chain() {
        let definition = AppDefinition {
            components: vec![button(vec![
                on_click(ActionKind::RunQuery { query: "broken".into() }).detached(),
                on_click(alert("still runs")),
            ])],
            queries: vec![QueryDefinition::new("broken", "rest")],
            ..AppDefinition::default()
        };
        let (session, host) = session(definition);

        session
            .dispatch(EventSource::Component("button1".into()), "onClick", json!({}))
            .await
            .unwrap();
        session.settle().await;
        assert_eq!(host.alerts(), vec!["still runs".to_string()]);
        assert_eq!(session.query_status("broken"), Some(QueryStatus::Error));
    }

    #[tokio::test]
    async fn test_host_rejection_fails_action() {
        let definition = AppDefinition {
            components: vec![button(vec![on_click(ActionKind::ControlComponent {
                component: "modal1".into(),
                method: "open".into(),
                params: vec!["{{ 1 + 1 }}".into()],
            })])],
            ..AppDefinition::default()
        };
        let (session, host) = session(definition);
        host.reject_component("modal1");

        let err = session
            .dispatch(EventSource::Component("button1".into()), "onClick", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, DispatchErrorKind::Host(_)));
    }

    #[tokio::test]
    async fn test_unknown_source_is_an_error() {
        let (session, _) = session(AppDefinition::default());
        let err = session
            .dispatch(EventSource::Component("ghost".into()), "onClick", json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            DispatchErrorKind::Runtime(RuntimeError::UnknownComponent("ghost".into()))
        );
    }

    // === Query events ===

    #[tokio::test]
    async fn test_query_success_event_runs_chain() {
        let definition = AppDefinition {
            queries: vec![QueryDefinition::new("getUsers", "rest")
                .with_options(json!({"rows": [1, 2]}))
                .with_event(EventAction::new(
                    "onDataQuerySuccess",
                    alert("loaded {{ event.data.rows.length }}"),
                ))],
            ..AppDefinition::default()
        };
        let (session, host) = session(definition);
        assert!(session.run_query("getUsers").await.is_success());
        session.settle().await;
        assert_eq!(host.alerts(), vec!["loaded 2".to_string()]);
    }

    #[tokio::test]
    async fn test_switch_page_action() {
        let definition = AppDefinition {
            pages: vec![
                Page {
                    id: "p1".into(),
                    name: "Home".into(),
                    handle: "home".into(),
                    hidden: false,
                    events: Vec::new(),
                },
                Page {
                    id: "p2".into(),
                    name: "Users".into(),
                    handle: "users".into(),
                    hidden: false,
                    events: vec![EventAction::new("onPageLoad", alert("welcome to {{ page.name }}"))],
                },
            ],
            components: vec![button(vec![on_click(ActionKind::SwitchPage { page: "users".into() })])],
            ..AppDefinition::default()
        };
        let (session, host) = session(definition);
        session.start().await.unwrap();
        session
            .dispatch(EventSource::Component("button1".into()), "onClick", json!({}))
            .await
            .unwrap();
        assert_eq!(session.current_page().as_deref(), Some("p2"));
        assert_eq!(host.alerts(), vec!["welcome to Users".to_string()]);
    }
}
