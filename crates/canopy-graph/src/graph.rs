//! Dependency graph over bound expressions

use crate::cycle::strongly_connected;
use crate::extract::extract_with_locals;
use crate::{CycleError, GraphDiagnostic};
use canopy_ast::{Namespace, StatePath};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::{debug, warn};

/// Something that reads state through bindings
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentId {
    /// A query's templated options (and transform)
    Query(String),
    /// One templated property of a component
    ComponentProperty { component: String, property: String },
}

impl DependentId {
    pub fn query(id: impl Into<String>) -> Self {
        DependentId::Query(id.into())
    }

    pub fn component(component: impl Into<String>, property: impl Into<String>) -> Self {
        DependentId::ComponentProperty {
            component: component.into(),
            property: property.into(),
        }
    }

    /// Where this dependent's results land in the state tree
    pub fn output(&self) -> StatePath {
        match self {
            DependentId::Query(id) => StatePath::new(Namespace::Queries).join(id.as_str()),
            DependentId::ComponentProperty { component, property } => StatePath::new(Namespace::Components)
                .join(component.as_str())
                .join(property.as_str()),
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, DependentId::Query(_))
    }
}

impl fmt::Display for DependentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.output())
    }
}

/// `source` is read by `dependent`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source: StatePath,
    pub dependent: DependentId,
}

/// One template registered for a dependent. A query registers one binding per
/// templated option, plus its transform with `data` as a local.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub dependent: DependentId,
    pub source: String,
    pub locals: Vec<String>,
}

impl Binding {
    pub fn new(dependent: DependentId, source: impl Into<String>) -> Self {
        Self {
            dependent,
            source: source.into(),
            locals: Vec::new(),
        }
    }

    pub fn with_local(mut self, name: impl Into<String>) -> Self {
        self.locals.push(name.into());
        self
    }
}

/// Dependency graph rebuilt whenever definitions change
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    reads: BTreeMap<DependentId, BTreeSet<StatePath>>,
    edges: Vec<DependencyEdge>,
    /// X -> dependents reading X's output
    downstream: BTreeMap<DependentId, Vec<DependentId>>,
    /// Topological rank; upstream dependents rank lower
    rank: BTreeMap<DependentId, usize>,
    blocked: BTreeSet<DependentId>,
    diagnostics: Vec<GraphDiagnostic>,
}

impl DependencyGraph {
    /// Build the graph from every bound expression in the app.
    ///
    /// Bindings that fail to parse or reference unknown roots are recorded
    /// as diagnostics; cycles block their members.
    pub fn rebuild<'b>(bindings: impl IntoIterator<Item = &'b Binding>) -> Self {
        let mut graph = DependencyGraph::default();

        for binding in bindings {
            let locals: Vec<&str> = binding.locals.iter().map(String::as_str).collect();
            let reads = graph.reads.entry(binding.dependent.clone()).or_default();
            match extract_with_locals(&binding.source, &locals) {
                Ok(paths) => reads.extend(paths),
                Err(error) => {
                    warn!(dependent = %binding.dependent, %error, "binding reads cannot be tracked");
                    graph.diagnostics.push(GraphDiagnostic::Untracked {
                        dependent: binding.dependent.clone(),
                        source_text: binding.source.clone(),
                        error,
                    });
                }
            }
        }

        for (dependent, paths) in &graph.reads {
            for source in paths {
                graph.edges.push(DependencyEdge {
                    source: source.clone(),
                    dependent: dependent.clone(),
                });
            }
        }

        graph.link();
        debug!(
            dependents = graph.reads.len(),
            edges = graph.edges.len(),
            blocked = graph.blocked.len(),
            "dependency graph rebuilt"
        );
        graph
    }

    /// Connect dependents whose reads overlap another dependent's output,
    /// then rank them and block cycles
    fn link(&mut self) {
        let nodes: Vec<DependentId> = self.reads.keys().cloned().collect();
        let index: BTreeMap<&DependentId, usize> = nodes.iter().enumerate().map(|(i, d)| (d, i)).collect();

        let mut adjacency = vec![Vec::new(); nodes.len()];
        for upstream in &nodes {
            let output = upstream.output();
            let readers: Vec<DependentId> = self.dependents_of(&output).into_iter().collect();
            adjacency[index[upstream]] = readers.iter().map(|reader| index[reader]).collect();
            self.downstream.insert(upstream.clone(), readers);
        }

        let components = strongly_connected(&adjacency);
        let count = components.len();
        for (position, component) in components.into_iter().enumerate() {
            let self_loop = component.len() == 1 && adjacency[component[0]].contains(&component[0]);
            for &member in &component {
                self.rank.insert(nodes[member].clone(), count - 1 - position);
            }
            if component.len() > 1 || self_loop {
                let cycle = CycleError {
                    members: component.iter().map(|&member| nodes[member].clone()).collect(),
                };
                warn!(%cycle, "blocking dependents in a cycle");
                self.blocked.extend(cycle.members.iter().cloned());
                self.diagnostics.push(GraphDiagnostic::Cycle(cycle));
            }
        }
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn dependents(&self) -> impl Iterator<Item = &DependentId> {
        self.reads.keys()
    }

    /// Paths a dependent reads
    pub fn reads(&self, dependent: &DependentId) -> Option<&BTreeSet<StatePath>> {
        self.reads.get(dependent)
    }

    /// Dependents with a read that overlaps `path`, blocked ones included
    pub fn dependents_of(&self, path: &StatePath) -> BTreeSet<DependentId> {
        self.reads
            .iter()
            .filter(|(_, reads)| reads.iter().any(|read| read.overlaps(path)))
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }

    /// Every unblocked dependent a change to `changed` reaches, upstream first.
    ///
    /// Component properties propagate: their published output feeds further
    /// readers. Queries do not, since their output only changes once a run
    /// completes.
    pub fn affected_by<'p>(&self, changed: impl IntoIterator<Item = &'p StatePath>) -> Vec<DependentId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<DependentId> = VecDeque::new();
        for path in changed {
            queue.extend(self.dependents_of(path));
        }

        while let Some(dependent) = queue.pop_front() {
            if self.blocked.contains(&dependent) || !seen.insert(dependent.clone()) {
                continue;
            }
            if dependent.is_query() {
                continue;
            }
            if let Some(readers) = self.downstream.get(&dependent) {
                queue.extend(readers.iter().cloned());
            }
        }

        let mut affected: Vec<DependentId> = seen.into_iter().collect();
        affected.sort_by_key(|dependent| self.rank.get(dependent).copied().unwrap_or(usize::MAX));
        affected
    }

    /// Every unblocked dependent, upstream first. Used for the initial pass
    /// after a rebuild.
    pub fn evaluation_order(&self) -> Vec<DependentId> {
        let mut order: Vec<DependentId> = self
            .reads
            .keys()
            .filter(|dependent| !self.blocked.contains(*dependent))
            .cloned()
            .collect();
        order.sort_by_key(|dependent| self.rank.get(dependent).copied().unwrap_or(usize::MAX));
        order
    }

    pub fn is_blocked(&self, dependent: &DependentId) -> bool {
        self.blocked.contains(dependent)
    }

    pub fn blocked(&self) -> &BTreeSet<DependentId> {
        &self.blocked
    }

    pub fn cycles(&self) -> impl Iterator<Item = &CycleError> {
        self.diagnostics.iter().filter_map(|diagnostic| match diagnostic {
            GraphDiagnostic::Cycle(cycle) => Some(cycle),
            GraphDiagnostic::Untracked { .. } => None,
        })
    }

    /// The cycle a blocked dependent belongs to
    pub fn cycle_of(&self, dependent: &DependentId) -> Option<&CycleError> {
        self.cycles().find(|cycle| cycle.contains(dependent))
    }

    pub fn diagnostics(&self) -> &[GraphDiagnostic] {
        &self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> StatePath {
        match StatePath::parse(text) {
            Ok(path) => path,
            Err(err) => panic!("{}", err),
        }
    }

    fn query(id: &str, source: &str) -> Binding {
        Binding::new(DependentId::query(id), source)
    }

    fn prop(component: &str, property: &str, source: &str) -> Binding {
        Binding::new(DependentId::component(component, property), source)
    }

    // === Edges and lookup ===

    #[test]
    fn test_edges_per_read_path() {
        let bindings = vec![
            query("getUsers", "{{ globals.filter }}"),
            query("getUsers", "{{ page.variables.limit }}"),
            prop("table1", "data", "{{ queries.getUsers.data }}"),
        ];
        let graph = DependencyGraph::rebuild(&bindings);
        assert_eq!(graph.edges().len(), 3);
        assert_eq!(graph.dependents().count(), 2);
        assert!(graph.diagnostics().is_empty());
    }

    #[test]
    fn test_prefix_match_in_both_directions() {
        let bindings = vec![prop("table1", "data", "{{ queries.q1.data }}")];
        let graph = DependencyGraph::rebuild(&bindings);
        let expected = BTreeSet::from([DependentId::component("table1", "data")]);

        assert_eq!(graph.dependents_of(&path("queries.q1.data.items[0]")), expected);
        assert_eq!(graph.dependents_of(&path("queries.q1")), expected);
        assert!(graph.dependents_of(&path("queries.q1.error")).is_empty());
        assert!(graph.dependents_of(&path("queries.q2.data")).is_empty());
    }

    // === Propagation ===

    #[test]
    fn test_affected_follows_component_chain_in_order() {
        let bindings = vec![
            prop("text2", "value", "{{ components.text1.value }}!"),
            prop("text1", "value", "{{ globals.name }}"),
            query("search", "{{ components.text2.value }}"),
        ];
        let graph = DependencyGraph::rebuild(&bindings);
        let affected = graph.affected_by([&path("globals.name")]);
        assert_eq!(
            affected,
            vec![
                DependentId::component("text1", "value"),
                DependentId::component("text2", "value"),
                DependentId::query("search"),
            ]
        );
    }

    #[test]
    fn test_evaluation_order_skips_blocked() {
        let bindings = vec![
            prop("b", "value", "{{ components.a.value }}"),
            prop("a", "value", "{{ globals.x }}"),
            prop("c", "value", "static"),
            query("loop", "{{ queries.loop.data }}"),
        ];
        let graph = DependencyGraph::rebuild(&bindings);
        let order = graph.evaluation_order();
        assert_eq!(order.len(), 3);
        let a = order.iter().position(|d| *d == DependentId::component("a", "value"));
        let b = order.iter().position(|d| *d == DependentId::component("b", "value"));
        assert!(a < b);
        assert!(!order.contains(&DependentId::query("loop")));
    }

    #[test]
    fn test_queries_do_not_propagate() {
        let bindings = vec![
            query("q1", "{{ globals.a }}"),
            prop("table1", "data", "{{ queries.q1.data }}"),
        ];
        let graph = DependencyGraph::rebuild(&bindings);
        assert_eq!(graph.affected_by([&path("globals.a")]), vec![DependentId::query("q1")]);
    }

    #[test]
    fn test_affected_is_deduplicated() {
        let bindings = vec![query("q1", "{{ globals.a }} {{ globals.b }}")];
        let graph = DependencyGraph::rebuild(&bindings);
        let changed = [path("globals.a"), path("globals.b")];
        assert_eq!(graph.affected_by(&changed), vec![DependentId::query("q1")]);
    }

    // === Cycles ===

    #[test]
    fn test_two_query_cycle_blocks_both() {
        let bindings = vec![
            query("a", "{{ queries.b.data }}"),
            query("b", "{{ queries.a.data }}"),
            query("c", "{{ queries.a.data }}"),
        ];
        let graph = DependencyGraph::rebuild(&bindings);
        assert!(graph.is_blocked(&DependentId::query("a")));
        assert!(graph.is_blocked(&DependentId::query("b")));
        assert!(!graph.is_blocked(&DependentId::query("c")));
        assert_eq!(graph.cycles().count(), 1);

        let cycle = graph.cycle_of(&DependentId::query("a"));
        assert!(cycle.map(|c| c.contains(&DependentId::query("b"))).unwrap_or(false));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let bindings = vec![query("a", "{{ queries.a.data.nextPage }}")];
        let graph = DependencyGraph::rebuild(&bindings);
        assert!(graph.is_blocked(&DependentId::query("a")));
    }

    #[test]
    fn test_component_cycle_blocked_and_not_propagated() {
        let bindings = vec![
            prop("x", "value", "{{ components.y.value }}"),
            prop("y", "value", "{{ components.x.value }} {{ globals.seed }}"),
        ];
        let graph = DependencyGraph::rebuild(&bindings);
        assert_eq!(graph.blocked().len(), 2);
        assert!(graph.affected_by([&path("globals.seed")]).is_empty());
    }

    #[test]
    fn test_cycle_message_names_members() {
        let bindings = vec![query("a", "{{ queries.b }}"), query("b", "{{ queries.a }}")];
        let graph = DependencyGraph::rebuild(&bindings);
        let message = graph.cycles().next().map(|c| c.to_string()).unwrap_or_default();
        assert!(message.starts_with("dependency cycle: "));
        assert!(message.contains("queries.a"));
        assert!(message.contains("queries.b"));
    }

    // === Diagnostics ===

    #[test]
    fn test_untracked_binding_is_reported_not_fatal() {
        let bindings = vec![
            query("bad", "{{ window.fetch }}"),
            query("good", "{{ globals.a }}"),
        ];
        let graph = DependencyGraph::rebuild(&bindings);
        assert_eq!(graph.diagnostics().len(), 1);
        assert!(matches!(
            &graph.diagnostics()[0],
            GraphDiagnostic::Untracked { dependent, .. } if *dependent == DependentId::query("bad")
        ));
        assert_eq!(graph.affected_by([&path("globals.a")]), vec![DependentId::query("good")]);
    }

    #[test]
    fn test_transform_local_is_not_state() {
        let bindings = vec![query("q", "{{ data.rows }}").with_local("data")];
        let graph = DependencyGraph::rebuild(&bindings);
        assert!(graph.diagnostics().is_empty());
        assert!(graph.edges().is_empty());
    }
}
