//! Session - one open application
//!
//! Owns the state store, dependency graph, query coordinator, page graph and
//! debug log behind a single lock. Every entry point takes the lock, applies
//! its writes, propagates them to dependents and releases the lock before
//! awaiting anything; connector calls are the only suspension points.

use crate::definition::{AppDefinition, ComponentDefinition, QueryDefinition, Trigger};
use crate::query::{Admission, Coordinator, QueryRun, QueryStats, QueryStatus, RunOutcome, Waiter};
use crate::{
    ClearScope, ConnectorError, DataSourceConnector, DebugLog, DebugLogEntry, EngineConfig, LogFilter,
    LogSource, Mutation, PageEdit, PageGraph, QueryError, QueryRequest, RecordingHost, RetryPolicy, RuntimeError,
    Severity, StateStore,
};
use crate::host::ActionHost;
use canopy_ast::{Namespace, StatePath};
use canopy_eval::{evaluate, EvalError, Locals, Scope};
use canopy_graph::{Binding, CycleError, DependencyGraph, DependentId, GraphDiagnostic, TrackError};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Why a component property has no current value
#[derive(Debug, Clone, PartialEq)]
pub enum BindingFault {
    Eval(EvalError),
    Blocked(CycleError),
    Untracked(TrackError),
}

/// Where an event was raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSource {
    Component(String),
    Query(String),
    Page(String),
}

impl From<&EventSource> for LogSource {
    fn from(source: &EventSource) -> Self {
        match source {
            EventSource::Component(id) => LogSource::Component(id.clone()),
            EventSource::Query(id) => LogSource::Query(id.clone()),
            EventSource::Page(id) => LogSource::Page(id.clone()),
        }
    }
}

fn log_source(dependent: &DependentId) -> LogSource {
    match dependent {
        DependentId::Query(id) => LogSource::Query(id.clone()),
        DependentId::ComponentProperty { component, .. } => LogSource::Component(component.clone()),
    }
}

fn query_path(query_id: &str) -> StatePath {
    StatePath::new(Namespace::Queries).join(query_id)
}

/// Everything the session lock guards
pub(crate) struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) store: StateStore,
    graph: DependencyGraph,
    pub(crate) components: BTreeMap<String, ComponentDefinition>,
    pub(crate) queries: BTreeMap<String, QueryDefinition>,
    pub(crate) pages: PageGraph,
    pub(crate) current_page: Option<String>,
    coordinator: Coordinator,
    pub(crate) debug_log: DebugLog,
    faults: BTreeMap<DependentId, BindingFault>,
}

impl Engine {
    fn open(definition: AppDefinition, config: EngineConfig) -> Result<Self, RuntimeError> {
        let pages = PageGraph::new(definition.pages, definition.home_page_id)?;

        let mut components = BTreeMap::new();
        for component in definition.components {
            if let Some(page_id) = &component.page_id {
                if pages.get(page_id).is_none() {
                    return Err(RuntimeError::UnknownPage(page_id.clone()));
                }
            }
            let id = component.id.clone();
            if components.insert(id.clone(), component).is_some() {
                return Err(RuntimeError::DuplicateId { kind: "component", id });
            }
        }

        let mut queries = BTreeMap::new();
        for query in definition.queries {
            if let Some(page_id) = &query.page_id {
                if pages.get(page_id).is_none() {
                    return Err(RuntimeError::UnknownPage(page_id.clone()));
                }
            }
            let id = query.id.clone();
            if queries.insert(id.clone(), query).is_some() {
                return Err(RuntimeError::DuplicateId { kind: "query", id });
            }
        }

        let mut engine = Engine {
            debug_log: DebugLog::new(config.debug_log_capacity),
            config,
            store: StateStore::new(),
            graph: DependencyGraph::default(),
            components,
            queries,
            pages,
            current_page: None,
            coordinator: Coordinator::new(),
            faults: BTreeMap::new(),
        };

        for (key, value) in definition.globals {
            engine
                .store
                .publish(&StatePath::new(Namespace::Globals).join(key), value);
        }
        engine
            .store
            .publish(&StatePath::new(Namespace::Page).join("variables"), json!({}));
        let query_ids: Vec<String> = engine.queries.keys().cloned().collect();
        for id in &query_ids {
            engine.init_query_state(id);
        }
        let component_ids: Vec<String> = engine.components.keys().cloned().collect();
        for id in &component_ids {
            engine.store.publish(&StatePath::new(Namespace::Components).join(id.as_str()), json!({}));
        }

        engine.rebuild_graph();
        Ok(engine)
    }

    fn init_query_state(&mut self, query_id: &str) {
        self.coordinator.register(query_id);
        self.store.publish(
            &query_path(query_id),
            json!({ "isLoading": false, "data": null, "rawData": null, "error": null }),
        );
    }

    fn gate(&self, operation: &'static str) -> Result<(), RuntimeError> {
        if self.config.released {
            warn!(operation, "structural edit rejected on released version");
            return Err(RuntimeError::VersionLocked { operation });
        }
        Ok(())
    }

    fn page_for(&self, query_id: &str) -> Option<String> {
        self.queries
            .get(query_id)
            .and_then(|q| q.page_id.clone())
            .or_else(|| self.current_page.clone())
    }

    /// Rebuild the dependency graph from every binding and re-evaluate all
    /// component properties
    fn rebuild_graph(&mut self) {
        let mut bindings: Vec<Binding> = Vec::new();
        for component in self.components.values() {
            bindings.extend(component.bindings());
        }
        for query in self.queries.values() {
            bindings.extend(query.bindings());
        }
        self.graph = DependencyGraph::rebuild(&bindings);
        self.faults.clear();

        let diagnostics = self.graph.diagnostics().to_vec();
        for diagnostic in diagnostics {
            match diagnostic {
                GraphDiagnostic::Untracked { dependent, error, .. } => {
                    self.debug_log.record(
                        DebugLogEntry::warning(log_source(&dependent), format!("{}: {}", dependent, error))
                            .on_page(self.current_page.clone()),
                    );
                    if !dependent.is_query() {
                        self.faults.insert(dependent, BindingFault::Untracked(error));
                    }
                }
                GraphDiagnostic::Cycle(cycle) => {
                    let members: Vec<String> = cycle.members.iter().map(|m| m.to_string()).collect();
                    self.debug_log.record(
                        DebugLogEntry::error(LogSource::Engine, cycle.to_string())
                            .on_page(self.current_page.clone())
                            .with_detail(json!({ "members": members })),
                    );
                    for member in &cycle.members {
                        if !member.is_query() {
                            self.faults.insert(member.clone(), BindingFault::Blocked(cycle.clone()));
                        }
                    }
                }
            }
        }

        let order: Vec<DependentId> = self.graph.evaluation_order();
        for dependent in &order {
            self.evaluate_binding(dependent);
        }
    }

    /// Evaluate a component property and publish it. A failure leaves the
    /// previous value in place and records a fault; siblings are unaffected.
    fn evaluate_binding(&mut self, dependent: &DependentId) {
        let DependentId::ComponentProperty { component, property } = dependent else {
            return;
        };
        if matches!(self.faults.get(dependent), Some(BindingFault::Untracked(_))) {
            return;
        }
        let Some(template) = self
            .components
            .get(component)
            .and_then(|c| c.properties.get(property))
        else {
            return;
        };
        match evaluate(template, self.store.snapshot()) {
            Ok(value) => {
                self.faults.remove(dependent);
                self.store.publish(&dependent.output(), value);
            }
            Err(error) => {
                let message = format!("{}: {}", dependent, error);
                let repeated = matches!(self.faults.get(dependent), Some(BindingFault::Eval(prev)) if *prev == error);
                if !repeated {
                    self.debug_log.record(
                        DebugLogEntry::warning(LogSource::Component(component.clone()), message)
                            .on_page(self.current_page.clone()),
                    );
                }
                self.faults.insert(dependent.clone(), BindingFault::Eval(error));
            }
        }
    }

    /// Drain queued changes: re-evaluate affected bindings in dependency
    /// order and collect the auto-run queries they reach, each once
    fn propagate(&mut self) -> Vec<String> {
        let mut to_run: Vec<String> = Vec::new();
        loop {
            let changes = self.store.take_changes();
            if changes.is_empty() {
                break;
            }
            let affected = self.graph.affected_by(&changes);
            debug!(changes = changes.len(), affected = affected.len(), "propagating");
            for dependent in affected {
                match &dependent {
                    DependentId::ComponentProperty { .. } => self.evaluate_binding(&dependent),
                    DependentId::Query(id) => {
                        let runs = self
                            .queries
                            .get(id)
                            .is_some_and(|q| q.auto_run && self.is_active(q));
                        if runs && !to_run.contains(id) {
                            to_run.push(id.clone());
                        }
                    }
                }
            }
        }
        to_run
    }

    fn is_active(&self, query: &QueryDefinition) -> bool {
        match &query.page_id {
            None => true,
            Some(page) => self.current_page.as_ref() == Some(page),
        }
    }

    /// Resolve a query's templated options against current state
    fn resolve_request(&self, query_id: &str) -> Result<QueryRequest, QueryError> {
        let query = self
            .queries
            .get(query_id)
            .ok_or_else(|| QueryError::Unknown(query_id.to_string()))?;
        let dependent = DependentId::query(query_id);
        if let Some(cycle) = self.graph.cycle_of(&dependent) {
            return Err(QueryError::Blocked(cycle.clone()));
        }
        let options = resolve_value(&query.options, self.store.snapshot()).map_err(QueryError::Options)?;
        Ok(QueryRequest {
            query_id: query_id.to_string(),
            data_source: query.data_source.clone(),
            options,
        })
    }

    /// Write a failed run into state and the debug log. A run still in
    /// flight keeps `isLoading` set.
    fn record_failure(&mut self, query_id: &str, error: &QueryError) {
        let base = query_path(query_id);
        if self.store.get(&base).is_some() {
            let mut writes = vec![Mutation::set(base.child("error"), error.to_state_value())];
            if !self.coordinator.is_in_flight(query_id) {
                writes.push(Mutation::set(base.child("isLoading"), Value::Bool(false)));
            }
            self.store.apply(writes);
        }
        self.debug_log.record(
            DebugLogEntry::error(LogSource::Query(query_id.to_string()), error.to_string())
                .on_page(self.page_for(query_id))
                .with_detail(error.to_state_value()),
        );
    }

    /// Turn a connector response into state writes. Stale `.data` stays
    /// visible when the run fails.
    fn apply_response(
        &mut self,
        query_id: &str,
        run_id: u64,
        response: Result<Value, ConnectorError>,
        attempts: u32,
    ) -> RunOutcome {
        let transform = self.queries.get(query_id).and_then(|q| q.transform.clone());
        let result = match response {
            Ok(raw) => {
                let data = match &transform {
                    Some(transform) => {
                        let scope = Locals::new(self.store.snapshot()).with("data", &raw);
                        evaluate(transform, &scope).map_err(QueryError::Transform)
                    }
                    None => Ok(raw.clone()),
                };
                data.map(|data| (data, raw))
            }
            Err(ConnectorError::Transport(message)) => Err(QueryError::Transport { message, attempts }),
            Err(ConnectorError::Logic { message, code }) => Err(QueryError::Logic { message, code }),
        };

        match result {
            Ok((data, raw)) => {
                let base = query_path(query_id);
                self.store.apply([
                    Mutation::set(base.child("data"), data.clone()),
                    Mutation::set(base.child("rawData"), raw),
                    Mutation::set(base.child("error"), Value::Null),
                    Mutation::set(base.child("isLoading"), Value::Bool(false)),
                ]);
                info!(query = query_id, run_id, "query succeeded");
                RunOutcome::Success { run_id, data }
            }
            Err(error) => {
                self.record_failure(query_id, &error);
                RunOutcome::Failed {
                    run_id: Some(run_id),
                    error,
                }
            }
        }
    }

    /// Invalidate runs of every query owned by `page_id`
    fn teardown_page(&mut self, page_id: &str) {
        let owned: Vec<String> = self
            .queries
            .values()
            .filter(|q| q.page_id.as_deref() == Some(page_id))
            .map(|q| q.id.clone())
            .collect();
        for id in owned {
            if self.coordinator.invalidate(&id) {
                debug!(query = %id, page = page_id, "in-flight run will be discarded");
                self
                    .store
                    .apply([Mutation::set(query_path(&id).join("isLoading"), Value::Bool(false))]);
            }
        }
    }
}

/// Evaluate every templated string inside an options value
fn resolve_value(value: &Value, scope: &dyn Scope) -> Result<Value, EvalError> {
    Ok(match value {
        Value::String(text) if text.contains("{{") => evaluate(text, scope)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, scope))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, scope)?);
            }
            Value::Object(resolved)
        }
        other => other.clone(),
    })
}

pub(crate) struct Inner {
    pub(crate) engine: Mutex<Engine>,
    connector: Arc<dyn DataSourceConnector>,
    pub(crate) host: Arc<dyn ActionHost>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to an open application. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<Inner>,
}

pub struct SessionBuilder {
    definition: AppDefinition,
    connector: Arc<dyn DataSourceConnector>,
    config: EngineConfig,
    host: Option<Arc<dyn ActionHost>>,
}

impl SessionBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: Arc<dyn ActionHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Validate the definition, seed state and evaluate every binding
    pub fn build(self) -> Result<Session, RuntimeError> {
        let engine = Engine::open(self.definition, self.config)?;
        info!(
            components = engine.components.len(),
            queries = engine.queries.len(),
            pages = engine.pages.pages().len(),
            "session opened"
        );
        Ok(Session {
            inner: Arc::new(Inner {
                engine: Mutex::new(engine),
                connector: self.connector,
                host: self
                    .host
                    .unwrap_or_else(|| Arc::new(RecordingHost::new()) as Arc<dyn ActionHost>),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl Session {
    pub fn builder(definition: AppDefinition, connector: Arc<dyn DataSourceConnector>) -> SessionBuilder {
        SessionBuilder {
            definition,
            connector,
            config: EngineConfig::default(),
            host: None,
        }
    }

    // === Tasks ===

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Wait until every run, rerun and detached action chain has finished
    pub async fn settle(&self) {
        loop {
            let pending = std::mem::take(&mut *self.inner.tasks.lock());
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                if let Err(err) = handle.await {
                    warn!(error = %err, "background task failed");
                }
            }
        }
    }

    // === State ===

    /// Value at `path`; `None` when unset
    pub fn get(&self, path: &str) -> Result<Option<Value>, RuntimeError> {
        let path = StatePath::parse(path)?;
        Ok(self.get_path(&path))
    }

    pub fn get_path(&self, path: &StatePath) -> Option<Value> {
        self.inner.engine.lock().store.get(path).cloned()
    }

    /// Write one value and notify its dependents
    pub fn set(&self, path: &str, value: Value) -> Result<(), RuntimeError> {
        let path = StatePath::parse(path)?;
        self.set_path(&path, value)
    }

    pub fn set_path(&self, path: &StatePath, value: Value) -> Result<(), RuntimeError> {
        self.batch([Mutation::set(path.clone(), value)])
    }

    /// Apply all writes, then notify dependents once. A refused write
    /// rejects the whole batch.
    #[instrument(skip_all)]
    pub fn batch(&self, mutations: impl IntoIterator<Item = Mutation>) -> Result<(), RuntimeError> {
        let mut engine = self.inner.engine.lock();
        if let Err(error) = engine.store.batch(mutations) {
            warn!(%error, "write refused");
            return Err(error);
        }
        self.flush(&mut engine);
        Ok(())
    }

    /// Evaluate a template against the current state
    pub fn evaluate(&self, template: &str) -> Result<Value, EvalError> {
        let engine = self.inner.engine.lock();
        evaluate(template, engine.store.snapshot())
    }

    pub(crate) fn evaluate_with_event(&self, template: &str, event: &Value) -> Result<Value, EvalError> {
        let engine = self.inner.engine.lock();
        let scope = Locals::new(engine.store.snapshot()).with("event", event);
        evaluate(template, &scope)
    }

    /// Copy of the whole state tree
    pub fn snapshot(&self) -> Value {
        self.inner.engine.lock().store.snapshot().clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.engine.lock().store.version()
    }

    pub fn binding_fault(&self, component: &str, property: &str) -> Option<BindingFault> {
        let engine = self.inner.engine.lock();
        engine
            .faults
            .get(&DependentId::component(component, property))
            .cloned()
    }

    pub fn blocked(&self) -> Vec<DependentId> {
        self.inner.engine.lock().graph.blocked().iter().cloned().collect()
    }

    pub fn graph_diagnostics(&self) -> Vec<GraphDiagnostic> {
        self.inner.engine.lock().graph.diagnostics().to_vec()
    }

    /// Propagate pending changes and start the queries they reach
    pub(crate) fn flush(&self, engine: &mut Engine) {
        loop {
            let to_run = engine.propagate();
            if to_run.is_empty() {
                break;
            }
            for query_id in to_run {
                debug!(query = %query_id, "dependency changed");
                self.start_locked(engine, &query_id, Vec::new());
            }
        }
    }

    // === Queries ===

    /// Run a query and wait for its outcome. Never fails; every outcome is
    /// a value.
    #[instrument(skip(self))]
    pub async fn run_query(&self, query_id: &str) -> RunOutcome {
        let (tx, rx) = oneshot::channel();
        {
            let mut engine = self.inner.engine.lock();
            if !engine.queries.contains_key(query_id) {
                return RunOutcome::Failed {
                    run_id: None,
                    error: QueryError::Unknown(query_id.to_string()),
                };
            }
            self.start_locked(&mut engine, query_id, vec![tx]);
            self.flush(&mut engine);
        }
        rx.await.unwrap_or(RunOutcome::Discarded { run_id: None })
    }

    /// Resolve options and hand the request to the coordinator; spawns the
    /// connector call when a new run starts
    pub(crate) fn start_locked(&self, engine: &mut Engine, query_id: &str, waiters: Vec<Waiter>) {
        let request = match engine.resolve_request(query_id) {
            Ok(request) => request,
            Err(error) => {
                warn!(query = query_id, %error, "query failed before start");
                engine.coordinator.fail_early(query_id);
                engine.record_failure(query_id, &error);
                let outcome = RunOutcome::Failed { run_id: None, error };
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
                self.dispatch_completion(engine, query_id, &outcome);
                return;
            }
        };

        match engine.coordinator.admit(query_id, request, waiters) {
            Admission::Start { run_id, request } => {
                engine
                    .store
                    .apply([Mutation::set(query_path(query_id).join("isLoading"), Value::Bool(true))]);
                let retry = engine
                    .queries
                    .get(query_id)
                    .and_then(|q| q.retry)
                    .unwrap_or(engine.config.retry);
                debug!(query = query_id, run_id, "run started");
                let session = self.clone();
                let query_id = query_id.to_string();
                self.spawn(async move {
                    session.execute(query_id, run_id, request, retry).await;
                });
            }
            Admission::Joined => debug!(query = query_id, "joined in-flight run"),
            Admission::Queued => debug!(query = query_id, "rerun queued behind in-flight run"),
        }
    }

    async fn execute(&self, query_id: String, run_id: u64, request: QueryRequest, retry: RetryPolicy) {
        let mut attempts = 0;
        let response = loop {
            attempts += 1;
            self.inner.engine.lock().coordinator.note_attempt(&query_id, run_id);
            match self.inner.connector.execute(&request).await {
                Err(err) if err.is_retryable() && attempts <= retry.max_retries => {
                    let delay = retry.delay(attempts - 1);
                    warn!(query = %query_id, run_id, attempts, error = %err, ?delay, "transport failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                response => break response,
            }
        };
        self.complete(&query_id, run_id, response, attempts);
    }

    fn complete(&self, query_id: &str, run_id: u64, response: Result<Value, ConnectorError>, attempts: u32) {
        let mut engine = self.inner.engine.lock();
        let Some(finished) = engine.coordinator.finish(query_id, run_id) else {
            debug!(query = query_id, run_id, "result for a removed query dropped");
            return;
        };

        let outcome = if finished.stale {
            debug!(query = query_id, run_id, "discarding result of invalidated run");
            RunOutcome::Discarded { run_id: Some(run_id) }
        } else {
            let outcome = engine.apply_response(query_id, run_id, response, attempts);
            engine.coordinator.settle(query_id, finished.run, &outcome);
            outcome
        };

        for waiter in finished.waiters {
            let _ = waiter.send(outcome.clone());
        }
        if let Some(queued) = finished.queued {
            self.start_locked(&mut engine, query_id, queued);
        }
        self.flush(&mut engine);
        self.dispatch_completion(&mut engine, query_id, &outcome);
    }

    /// Fire `onDataQuerySuccess` / `onDataQueryFailure` for a finished run
    fn dispatch_completion(&self, engine: &mut Engine, query_id: &str, outcome: &RunOutcome) {
        let (event, context) = match outcome {
            RunOutcome::Success { data, .. } => ("onDataQuerySuccess", json!({ "data": data })),
            RunOutcome::Failed { error, .. } => ("onDataQueryFailure", json!({ "error": error.to_state_value() })),
            RunOutcome::Discarded { .. } => return,
        };
        let actions: Vec<_> = engine
            .queries
            .get(query_id)
            .map(|q| q.events.iter().filter(|a| a.event == event).cloned().collect())
            .unwrap_or_default();
        if actions.is_empty() {
            return;
        }
        let session = self.clone();
        let source = EventSource::Query(query_id.to_string());
        self.spawn(async move {
            let _ = session.run_actions(source, event.to_string(), actions, context).await;
        });
    }

    pub fn query_status(&self, query_id: &str) -> Option<QueryStatus> {
        self.inner.engine.lock().coordinator.status(query_id)
    }

    pub fn query_stats(&self, query_id: &str) -> Option<QueryStats> {
        self.inner.engine.lock().coordinator.stats(query_id)
    }

    /// Recent status changes, oldest first
    pub fn query_transitions(&self, query_id: &str) -> Vec<QueryStatus> {
        self.inner.engine.lock().coordinator.transitions(query_id)
    }

    pub fn last_run(&self, query_id: &str) -> Option<QueryRun> {
        self.inner.engine.lock().coordinator.last_run(query_id).cloned()
    }

    // === Pages ===

    pub fn current_page(&self) -> Option<String> {
        self.inner.engine.lock().current_page.clone()
    }

    pub fn pages(&self) -> PageGraph {
        self.inner.engine.lock().pages.clone()
    }

    /// Open the home page
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let home = self.inner.engine.lock().pages.home_page_id().to_string();
        self.switch_page(&home).await
    }

    /// Navigate to a page by id or handle. Allowed on released versions.
    ///
    /// In-flight runs owned by the old page are discarded on arrival, page
    /// variables reset, the target's on-page-load queries run, then its
    /// `onPageLoad` actions.
    #[instrument(skip(self))]
    pub async fn switch_page(&self, page: &str) -> Result<(), RuntimeError> {
        let (page_id, actions, receivers) = {
            let mut engine = self.inner.engine.lock();
            let target = engine
                .pages
                .resolve(page)
                .cloned()
                .ok_or_else(|| RuntimeError::UnknownPage(page.to_string()))?;

            if let Some(old) = engine.current_page.take() {
                engine.teardown_page(&old);
            }
            engine.current_page = Some(target.id.clone());
            let page_root = StatePath::new(Namespace::Page);
            engine.store.apply([
                Mutation::set(page_root.child("id"), Value::String(target.id.clone())),
                Mutation::set(page_root.child("handle"), Value::String(target.handle.clone())),
                Mutation::set(page_root.child("name"), Value::String(target.name.clone())),
                Mutation::set(page_root.child("variables"), json!({})),
            ]);

            let on_load: Vec<String> = engine
                .queries
                .values()
                .filter(|q| q.trigger == Trigger::OnPageLoad && engine.is_active(q))
                .map(|q| q.id.clone())
                .collect();
            let mut receivers = Vec::with_capacity(on_load.len());
            for query_id in &on_load {
                let (tx, rx) = oneshot::channel();
                self.start_locked(&mut engine, query_id, vec![tx]);
                receivers.push(rx);
            }
            self.flush(&mut engine);
            info!(page = %target.id, queries = on_load.len(), "page loaded");

            let actions: Vec<_> = target
                .events
                .iter()
                .filter(|a| a.event == "onPageLoad")
                .cloned()
                .collect();
            (target.id, actions, receivers)
        };

        for rx in receivers {
            let _ = rx.await;
        }
        if !actions.is_empty() {
            let context = json!({ "pageId": page_id });
            let _ = self
                .run_actions(EventSource::Page(page_id), "onPageLoad".to_string(), actions, context)
                .await;
        }
        Ok(())
    }

    /// Apply a structural page edit. Rejected with `VersionLocked` on a
    /// released version; a rejected edit changes nothing.
    pub fn apply_page_edit(&self, edit: PageEdit) -> Result<String, RuntimeError> {
        let mut engine = self.inner.engine.lock();
        engine.gate(edit.name())?;
        let deleted = match &edit {
            PageEdit::DeletePage { page_id } => Some(page_id.clone()),
            _ => None,
        };
        let name = edit.name();
        let touched = engine.pages.apply(edit)?;
        info!(edit = name, page = %touched, "page graph edited");

        if let Some(page_id) = deleted {
            engine.teardown_page(&page_id);
            let queries: Vec<String> = engine
                .queries
                .values()
                .filter(|q| q.page_id.as_deref() == Some(page_id.as_str()))
                .map(|q| q.id.clone())
                .collect();
            for id in queries {
                engine.queries.remove(&id);
                engine.coordinator.remove(&id);
                engine.store.unset(&query_path(&id));
            }
            let components: Vec<String> = engine
                .components
                .values()
                .filter(|c| c.page_id.as_deref() == Some(page_id.as_str()))
                .map(|c| c.id.clone())
                .collect();
            for id in components {
                engine.components.remove(&id);
                engine
                    .store
                    .unset(&StatePath::new(Namespace::Components).join(id.as_str()));
            }
            if engine.current_page.as_deref() == Some(page_id.as_str()) {
                engine.current_page = None;
            }
            engine.debug_log.clear(&ClearScope::Page(page_id));
            engine.rebuild_graph();
            self.flush(&mut engine);
        }
        Ok(touched)
    }

    // === Definition edits ===

    /// Add or replace a query. Any in-flight run of the old definition is
    /// discarded on arrival.
    pub fn update_query(&self, query: QueryDefinition) -> Result<(), RuntimeError> {
        let mut engine = self.inner.engine.lock();
        engine.gate("update query")?;
        if let Some(page_id) = &query.page_id {
            if engine.pages.get(page_id).is_none() {
                return Err(RuntimeError::UnknownPage(page_id.clone()));
            }
        }
        let id = query.id.clone();
        let existed = engine.queries.insert(id.clone(), query).is_some();
        if existed {
            if engine.coordinator.invalidate(&id) {
                engine
                    .store
                    .apply([Mutation::set(query_path(&id).join("isLoading"), Value::Bool(false))]);
            }
        } else {
            engine.init_query_state(&id);
        }
        info!(query = %id, existed, "query definition changed");
        engine.rebuild_graph();
        self.flush(&mut engine);
        Ok(())
    }

    pub fn remove_query(&self, query_id: &str) -> Result<(), RuntimeError> {
        let mut engine = self.inner.engine.lock();
        engine.gate("remove query")?;
        if engine.queries.remove(query_id).is_none() {
            return Err(RuntimeError::UnknownQuery(query_id.to_string()));
        }
        engine.coordinator.remove(query_id);
        engine.store.unset(&query_path(query_id));
        engine.rebuild_graph();
        self.flush(&mut engine);
        Ok(())
    }

    pub fn update_component(&self, component: ComponentDefinition) -> Result<(), RuntimeError> {
        let mut engine = self.inner.engine.lock();
        engine.gate("update component")?;
        if let Some(page_id) = &component.page_id {
            if engine.pages.get(page_id).is_none() {
                return Err(RuntimeError::UnknownPage(page_id.clone()));
            }
        }
        let root = StatePath::new(Namespace::Components).join(component.id.as_str());
        if engine.store.get(&root).is_none() {
            engine.store.publish(&root, json!({}));
        }
        let outputs: Vec<StatePath> = component
            .properties
            .keys()
            .map(|property| root.child(property.as_str()))
            .collect();
        engine.components.insert(component.id.clone(), component);
        engine.rebuild_graph();
        // Re-announce outputs so queries reading them react
        for path in outputs {
            if let Some(value) = engine.store.get(&path).cloned() {
                engine.store.apply([Mutation::set(path, value)]);
            }
        }
        self.flush(&mut engine);
        Ok(())
    }

    pub fn remove_component(&self, component_id: &str) -> Result<(), RuntimeError> {
        let mut engine = self.inner.engine.lock();
        engine.gate("remove component")?;
        if engine.components.remove(component_id).is_none() {
            return Err(RuntimeError::UnknownComponent(component_id.to_string()));
        }
        engine
            .store
            .unset(&StatePath::new(Namespace::Components).join(component_id));
        engine.rebuild_graph();
        self.flush(&mut engine);
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.inner.engine.lock().config.released
    }

    /// Set by the persistence layer when the version is released or reopened
    pub fn set_released(&self, released: bool) {
        self.inner.engine.lock().config.released = released;
    }

    /// Invalidate every in-flight run; results arriving later are discarded
    pub fn close(&self) {
        let mut engine = self.inner.engine.lock();
        let ids: Vec<String> = engine.queries.keys().cloned().collect();
        for id in ids {
            engine.coordinator.invalidate(&id);
        }
        engine.current_page = None;
        info!("session closed");
    }

    // === Debug log ===

    pub fn record(&self, entry: DebugLogEntry) {
        self.inner.engine.lock().debug_log.record(entry);
    }

    /// Entries matching `filter`, newest first
    pub fn debug_log(&self, filter: &LogFilter) -> Vec<DebugLogEntry> {
        self.inner.engine.lock().debug_log.list(filter)
    }

    pub fn clear_debug_log(&self, scope: &ClearScope) {
        self.inner.engine.lock().debug_log.clear(scope);
    }

    pub(crate) fn log_failure(&self, source: LogSource, message: String) {
        let mut engine = self.inner.engine.lock();
        let page = engine.current_page.clone();
        engine
            .debug_log
            .record(DebugLogEntry::new(Severity::Error, source, message).on_page(page));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectorError, Page, QueryStatus};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Echoes resolved options back after a delay; can be told to fail
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<QueryRequest>>,
        transport_failures: Mutex<u32>,
        reject: Mutex<bool>,
    }

    impl Scripted {
        fn calls(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl DataSourceConnector for Scripted {
        async fn execute(&self, request: &QueryRequest) -> Result<Value, ConnectorError> {
            self.calls.lock().push(request.clone());
            tokio::time::sleep(Duration::from_millis(100)).await;
            {
                let mut failures = self.transport_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(ConnectorError::Transport("connection reset".into()));
                }
            }
            if *self.reject.lock() {
                return Err(ConnectorError::Logic {
                    message: "permission denied".into(),
                    code: Some("403".into()),
                });
            }
            Ok(request.options.clone())
        }
    }

    fn page(id: &str) -> Page {
        Page {
            id: id.into(),
            name: id.to_uppercase(),
            handle: id.into(),
            hidden: false,
            events: Vec::new(),
        }
    }

    fn globals(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn open(definition: AppDefinition) -> (Session, Arc<Scripted>) {
        let connector = Arc::new(Scripted::default());
        let session = Session::builder(definition, connector.clone()).build().unwrap();
        (session, connector)
    }

    fn users_query() -> QueryDefinition {
        QueryDefinition::new("getUsers", "rest").with_options(json!({ "filter": "{{ globals.filter }}" }))
    }

    // === Opening ===

    #[test]
    fn test_open_seeds_state() {
        let definition = AppDefinition {
            components: vec![ComponentDefinition::new("title").with_property("text", "Hello {{ globals.name }}")],
            queries: vec![users_query()],
            globals: globals(json!({ "name": "Ada", "filter": "active" })),
            ..AppDefinition::default()
        };
        let (session, _) = open(definition);
        assert_eq!(session.get("components.title.text").unwrap(), Some(json!("Hello Ada")));
        assert_eq!(
            session.get("queries.getUsers").unwrap(),
            Some(json!({ "isLoading": false, "data": null, "rawData": null, "error": null }))
        );
        assert_eq!(session.get("page.variables").unwrap(), Some(json!({})));
        assert_eq!(session.query_status("getUsers"), Some(QueryStatus::Idle));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let definition = AppDefinition {
            queries: vec![users_query(), users_query()],
            ..AppDefinition::default()
        };
        let err = Session::builder(definition, Arc::new(Scripted::default()))
            .build()
            .err();
        assert_eq!(
            err,
            Some(RuntimeError::DuplicateId {
                kind: "query",
                id: "getUsers".into()
            })
        );
    }

    // === Propagation ===

    #[test]
    fn test_set_propagates_through_component_chain() {
        let definition = AppDefinition {
            components: vec![
                ComponentDefinition::new("upper").with_property("text", "{{ components.input.value }}!"),
                ComponentDefinition::new("input").with_property("value", "{{ variables.name }}"),
            ],
            ..AppDefinition::default()
        };
        let (session, _) = open(definition);
        session.set("variables.name", json!("grace")).unwrap();
        assert_eq!(session.get("components.upper.text").unwrap(), Some(json!("grace!")));
    }

    #[test]
    fn test_refused_write_changes_nothing() {
        let definition = AppDefinition {
            components: vec![ComponentDefinition::new("count").with_property("value", "{{ variables.list.length }}")],
            ..AppDefinition::default()
        };
        let (session, _) = open(definition);
        session.set("variables.list", json!([1, 2])).unwrap();
        let version = session.version();

        let huge = session.set("variables.list[18446744073709551615]", json!(1));
        assert!(matches!(huge, Err(RuntimeError::InvalidWrite { .. })));
        let scalar = session.set("globals", json!(5));
        assert!(matches!(scalar, Err(RuntimeError::InvalidWrite { .. })));
        let batch = session.batch([
            Mutation::set(StatePath::parse("variables.list").unwrap(), json!([])),
            Mutation::set(StatePath::parse("variables.list[4000000000]").unwrap(), json!(1)),
        ]);
        assert!(batch.is_err());

        assert_eq!(session.version(), version);
        assert_eq!(session.get("variables.list").unwrap(), Some(json!([1, 2])));
        assert_eq!(session.get("components.count.value").unwrap(), Some(json!(2)));
        assert_eq!(session.get("globals").unwrap(), Some(json!({})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_triggers_query_once() {
        let definition = AppDefinition {
            queries: vec![QueryDefinition::new("search", "rest")
                .with_options(json!({ "q": "{{ globals.a }} {{ globals.b }}" }))
                .auto_run()],
            ..AppDefinition::default()
        };
        let (session, connector) = open(definition);
        session.batch([
            Mutation::set(StatePath::parse("globals.a").unwrap(), json!("x")),
            Mutation::set(StatePath::parse("globals.b").unwrap(), json!("y")),
        ])
        .unwrap();
        assert_eq!(session.get("queries.search.isLoading").unwrap(), Some(json!(true)));
        session.settle().await;

        assert_eq!(connector.calls(), 1);
        assert_eq!(session.get("queries.search.data").unwrap(), Some(json!({ "q": "x y" })));
        assert_eq!(session.get("queries.search.isLoading").unwrap(), Some(json!(false)));
    }

    #[test]
    fn test_binding_error_is_isolated() {
        let definition = AppDefinition {
            components: vec![
                ComponentDefinition::new("broken").with_property("text", "{{ globals.user.name.first }}"),
                ComponentDefinition::new("fine").with_property("text", "{{ globals.title }}"),
            ],
            globals: globals(json!({ "title": "Users" })),
            ..AppDefinition::default()
        };
        let (session, _) = open(definition);
        assert_eq!(session.get("components.fine.text").unwrap(), Some(json!("Users")));
        assert!(matches!(session.binding_fault("broken", "text"), Some(BindingFault::Eval(_))));
        assert_eq!(session.get("components.broken.text").unwrap(), None);

        let warnings = session.debug_log(&LogFilter {
            source: Some(LogSource::Component("broken".into())),
            ..LogFilter::default()
        });
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, Severity::Warning);

        session.set("globals.user", json!({ "name": { "first": "Ada" } })).unwrap();
        assert_eq!(session.get("components.broken.text").unwrap(), Some(json!("Ada")));
        assert!(session.binding_fault("broken", "text").is_none());
    }

    // === Cycles ===

    #[tokio::test]
    async fn test_cycle_blocks_members() {
        let definition = AppDefinition {
            queries: vec![
                QueryDefinition::new("a", "rest").with_options(json!({ "x": "{{ queries.b.data }}" })),
                QueryDefinition::new("b", "rest").with_options(json!({ "x": "{{ queries.a.data }}" })),
            ],
            ..AppDefinition::default()
        };
        let (session, connector) = open(definition);
        assert_eq!(session.blocked().len(), 2);

        let outcome = session.run_query("a").await;
        assert!(matches!(outcome.error(), Some(QueryError::Blocked(_))));
        assert_eq!(connector.calls(), 0);
        assert_eq!(session.get("queries.a.error.kind").unwrap(), Some(json!("blocked")));

        let errors = session.debug_log(&LogFilter {
            source: Some(LogSource::Engine),
            ..LogFilter::default()
        });
        assert!(errors[0].message.starts_with("dependency cycle"));
    }

    // === Queries ===

    #[tokio::test(start_paused = true)]
    async fn test_run_lifecycle() {
        let definition = AppDefinition {
            queries: vec![users_query().with_transform("{{ data.filter }}")],
            globals: globals(json!({ "filter": "active" })),
            ..AppDefinition::default()
        };
        let (session, _) = open(definition);
        let outcome = session.run_query("getUsers").await;
        assert_eq!(outcome.data(), Some(&json!("active")));
        assert_eq!(
            session.query_transitions("getUsers"),
            vec![QueryStatus::Pending, QueryStatus::Running, QueryStatus::Success]
        );
        assert_eq!(session.get("queries.getUsers.rawData").unwrap(), Some(json!({ "filter": "active" })));
        let run = session.last_run("getUsers").unwrap();
        assert_eq!(run.attempts, 1);
        assert_eq!(run.request.options, json!({ "filter": "active" }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_requests_coalesce() {
        let (session, connector) = open(AppDefinition {
            queries: vec![users_query()],
            ..AppDefinition::default()
        });
        let (first, second) = tokio::join!(session.run_query("getUsers"), session.run_query("getUsers"));
        assert_eq!(first, second);
        assert_eq!(connector.calls(), 1);
        assert_eq!(session.query_stats("getUsers").map(|s| s.coalesced), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_request_queues_one_rerun() {
        let (session, connector) = open(AppDefinition {
            queries: vec![users_query()],
            globals: globals(json!({ "filter": "a" })),
            ..AppDefinition::default()
        });
        let (first, second) = tokio::join!(session.run_query("getUsers"), async {
            session.set("globals.filter", json!("b")).unwrap();
            session.run_query("getUsers").await
        });
        assert_eq!(first.data(), Some(&json!({ "filter": "a" })));
        assert_eq!(second.data(), Some(&json!({ "filter": "b" })));
        assert_eq!(connector.calls(), 2);
        assert_eq!(session.get("queries.getUsers.data.filter").unwrap(), Some(json!("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_are_retried() {
        let (session, connector) = open(AppDefinition {
            queries: vec![users_query().with_retry(RetryPolicy {
                max_retries: 2,
                delay_ms: 10,
                ..RetryPolicy::default()
            })],
            ..AppDefinition::default()
        });
        *connector.transport_failures.lock() = 2;
        assert!(session.run_query("getUsers").await.is_success());
        assert_eq!(connector.calls(), 3);
        assert_eq!(session.last_run("getUsers").map(|r| r.attempts), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logic_failures_are_not_retried() {
        let (session, connector) = open(AppDefinition {
            queries: vec![users_query().with_retry(RetryPolicy {
                max_retries: 3,
                delay_ms: 10,
                ..RetryPolicy::default()
            })],
            ..AppDefinition::default()
        });
        *connector.reject.lock() = true;

        let outcome = session.run_query("getUsers").await;

        assert!(matches!(outcome.error(), Some(QueryError::Logic { .. })));
        assert_eq!(connector.calls(), 1);
        assert_eq!(session.last_run("getUsers").map(|r| r.attempts), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_option_failure_keeps_in_flight_run_loading() {
        let (session, connector) = open(AppDefinition {
            queries: vec![QueryDefinition::new("getUsers", "rest")
                .with_options(json!({ "name": "{{ globals.user.name }}" }))],
            globals: globals(json!({ "user": { "name": "ada" } })),
            ..AppDefinition::default()
        });

        let (first, (second, loading)) = tokio::join!(session.run_query("getUsers"), async {
            session.set("globals.user", Value::Null).unwrap();
            let outcome = session.run_query("getUsers").await;
            (outcome, session.get("queries.getUsers.isLoading").unwrap())
        });

        assert!(matches!(second.error(), Some(QueryError::Options(_))));
        assert_eq!(loading, Some(json!(true)));
        assert_eq!(first.data(), Some(&json!({ "name": "ada" })));
        assert_eq!(connector.calls(), 1);
        assert_eq!(session.get("queries.getUsers.isLoading").unwrap(), Some(json!(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_stale_data() {
        let (session, connector) = open(AppDefinition {
            queries: vec![users_query()],
            globals: globals(json!({ "filter": "a" })),
            ..AppDefinition::default()
        });
        session.run_query("getUsers").await;
        *connector.reject.lock() = true;
        let outcome = session.run_query("getUsers").await;

        assert!(matches!(outcome.error(), Some(QueryError::Logic { .. })));
        assert_eq!(session.get("queries.getUsers.data").unwrap(), Some(json!({ "filter": "a" })));
        assert_eq!(session.get("queries.getUsers.error.code").unwrap(), Some(json!("403")));
        assert_eq!(session.query_status("getUsers"), Some(QueryStatus::Error));
    }

    #[tokio::test]
    async fn test_unknown_query() {
        let (session, _) = open(AppDefinition::default());
        let outcome = session.run_query("nope").await;
        assert_eq!(outcome.error(), Some(&QueryError::Unknown("nope".into())));
    }

    // === Pages ===

    #[tokio::test(start_paused = true)]
    async fn test_page_switch_discards_in_flight_run() {
        let definition = AppDefinition {
            pages: vec![page("p1"), page("p2")],
            queries: vec![users_query().auto_run().on_page("p1")],
            ..AppDefinition::default()
        };
        let (session, connector) = open(definition);
        session.start().await.unwrap();
        session.set("globals.filter", json!("x")).unwrap();
        assert_eq!(connector.calls(), 0);
        assert_eq!(session.query_status("getUsers"), Some(QueryStatus::Running));

        session.switch_page("p2").await.unwrap();
        session.settle().await;

        assert_eq!(session.get("queries.getUsers.data").unwrap(), Some(Value::Null));
        assert_eq!(session.get("queries.getUsers.isLoading").unwrap(), Some(json!(false)));
        assert_eq!(session.query_stats("getUsers").map(|s| s.discarded), Some(1));
        assert_eq!(session.get("page.handle").unwrap(), Some(json!("p2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_load_queries_run_on_switch() {
        let definition = AppDefinition {
            pages: vec![page("p1"), page("p2")],
            queries: vec![users_query().with_trigger(Trigger::OnPageLoad).on_page("p2")],
            ..AppDefinition::default()
        };
        let (session, connector) = open(definition);
        session.start().await.unwrap();
        assert_eq!(connector.calls(), 0);
        session.set("page.variables.x", json!(1)).unwrap();

        session.switch_page("p2").await.unwrap();
        assert_eq!(connector.calls(), 1);
        assert_eq!(session.query_status("getUsers"), Some(QueryStatus::Success));
        assert_eq!(session.get("page.variables").unwrap(), Some(json!({})));
    }

    #[tokio::test]
    async fn test_released_version_rejects_structural_edits() {
        let definition = AppDefinition {
            pages: vec![page("p1"), page("p2")],
            ..AppDefinition::default()
        };
        let (session, _) = open(definition);
        session.set_released(true);
        let before = session.pages();

        let err = session
            .apply_page_edit(PageEdit::DeletePage { page_id: "p2".into() })
            .unwrap_err();
        assert_eq!(err, RuntimeError::VersionLocked { operation: "delete page" });
        assert_eq!(session.pages(), before);
        assert!(session.update_query(users_query()).is_err());

        session.switch_page("p2").await.unwrap();
        assert_eq!(session.current_page().as_deref(), Some("p2"));
    }

    #[test]
    fn test_delete_page_removes_its_queries() {
        let definition = AppDefinition {
            pages: vec![page("p1"), page("p2")],
            queries: vec![users_query().on_page("p2")],
            components: vec![ComponentDefinition::new("t").on_page("p2").with_property("v", "1")],
            ..AppDefinition::default()
        };
        let (session, _) = open(definition);
        session
            .apply_page_edit(PageEdit::DeletePage { page_id: "p2".into() })
            .unwrap();
        assert_eq!(session.get("queries.getUsers").unwrap(), None);
        assert_eq!(session.get("components.t").unwrap(), None);
        assert_eq!(session.query_status("getUsers"), None);
    }

    // === Definition edits ===

    #[test]
    fn test_update_component_reevaluates() {
        let (session, _) = open(AppDefinition {
            globals: globals(json!({ "n": 2 })),
            ..AppDefinition::default()
        });
        session
            .update_component(ComponentDefinition::new("label").with_property("text", "{{ globals.n * 3 }}"))
            .unwrap();
        assert_eq!(session.get("components.label.text").unwrap(), Some(json!(6)));

        session.remove_component("label").unwrap();
        assert_eq!(session.get("components.label").unwrap(), None);
        assert_eq!(
            session.remove_component("label"),
            Err(RuntimeError::UnknownComponent("label".into()))
        );
    }

    // === Debug log ===

    #[test]
    fn test_debug_log_keeps_most_recent() {
        let (session, _) = open(AppDefinition::default());
        for n in 0..60 {
            session.record(DebugLogEntry::error(LogSource::Engine, format!("entry {}", n)));
        }
        let entries = session.debug_log(&LogFilter::default());
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0].message, "entry 59");
        assert_eq!(entries[49].message, "entry 10");

        session.clear_debug_log(&ClearScope::All);
        assert!(session.debug_log(&LogFilter::default()).is_empty());
    }
}
