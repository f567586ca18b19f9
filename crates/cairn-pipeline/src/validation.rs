//! Graph validation: lint rules and diagnostics.
//!
//! Provides the built-in rules that check structural correctness of a
//! [`GraphModel`] against a [`FunctionRegistry`]. Call [`validate`] for
//! advisory diagnostics or [`validate_or_raise`] to fail with a
//! [`CairnError::Graph`] when any `Error`-severity issue is found.

use std::collections::{BTreeMap, HashSet, VecDeque};

use cairn_types::CairnError;

use crate::graph::{GraphModel, NodeKind};
use crate::registry::FunctionRegistry;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &GraphModel, registry: &FunctionRegistry) -> Vec<Diagnostic>;
}

impl Diagnostic {
    fn error(rule: &dyn LintRule, message: String) -> Self {
        Self {
            rule: rule.name().into(),
            severity: Severity::Error,
            message,
            node_id: None,
            edge_id: None,
        }
    }

    fn warning(rule: &dyn LintRule, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, message)
        }
    }

    fn on_node(mut self, id: &str) -> Self {
        self.node_id = Some(id.to_string());
        self
    }

    fn on_edge(mut self, id: &str) -> Self {
        self.edge_id = Some(id.to_string());
        self
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct UniqueIdsRule;
impl LintRule for UniqueIdsRule {
    fn name(&self) -> &str { "unique_node_ids" }
    fn apply(&self, graph: &GraphModel, _registry: &FunctionRegistry) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut diags: Vec<_> = graph
            .nodes
            .iter()
            .filter(|n| !seen.insert(n.id.as_str()))
            .map(|n| Diagnostic::error(self, format!("Node id '{}' is used more than once", n.id)).on_node(&n.id))
            .collect();
        let mut seen_edges = HashSet::new();
        diags.extend(
            graph
                .edges
                .iter()
                .filter(|e| !seen_edges.insert(e.id.as_str()))
                .map(|e| Diagnostic::error(self, format!("Edge id '{}' is used more than once", e.id)).on_edge(&e.id)),
        );
        diags
    }
}

struct KnownNodeTypeRule;
impl LintRule for KnownNodeTypeRule {
    fn name(&self) -> &str { "known_node_type" }
    fn apply(&self, graph: &GraphModel, _registry: &FunctionRegistry) -> Vec<Diagnostic> {
        graph
            .nodes
            .iter()
            .filter(|n| n.kind().is_err())
            .map(|n| {
                Diagnostic::error(self, format!("Node '{}' has unrecognized type '{}'", n.id, n.node_type))
                    .on_node(&n.id)
            })
            .collect()
    }
}

struct EdgeEndpointsExistRule;
impl LintRule for EdgeEndpointsExistRule {
    fn name(&self) -> &str { "edge_endpoints_exist" }
    fn apply(&self, graph: &GraphModel, _registry: &FunctionRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for e in &graph.edges {
            for (end, id) in [("source", &e.source), ("target", &e.target)] {
                if graph.node(id).is_none() {
                    diags.push(
                        Diagnostic::error(
                            self,
                            format!("Edge '{}' references non-existent {end} node '{id}'", e.id),
                        )
                        .on_edge(&e.id),
                    );
                }
            }
        }
        diags
    }
}

struct SourceCardinalityRule;
impl LintRule for SourceCardinalityRule {
    fn name(&self) -> &str { "source_cardinality" }
    fn apply(&self, graph: &GraphModel, _registry: &FunctionRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in &graph.nodes {
            let Ok(NodeKind::Source(format)) = node.kind() else {
                continue;
            };
            if let Some(e) = graph.incoming_edges(&node.id).next() {
                diags.push(
                    Diagnostic::error(
                        self,
                        format!("Source node '{}' has an incoming edge '{}'", node.id, e.id),
                    )
                    .on_node(&node.id),
                );
            }
            let count = node.data.path.as_ref().map(|p| p.len()).unwrap_or(0);
            let ok = if format.accepts_many_paths() { count >= 1 } else { count == 1 };
            if !ok {
                diags.push(
                    Diagnostic::error(
                        self,
                        format!(
                            "Source node '{}' ({format}) has {count} input paths; expected {}",
                            node.id,
                            if format.accepts_many_paths() { "at least one" } else { "exactly one" }
                        ),
                    )
                    .on_node(&node.id),
                );
            }
        }
        diags
    }
}

/// The function name of a transform node, if it names exactly one.
fn function_name(node: &crate::graph::Node) -> Option<&str> {
    match node.data.path {
        Some(crate::graph::PathSpec::One(ref name)) => Some(name.as_str()),
        _ => None,
    }
}

struct FunctionRegisteredRule;
impl LintRule for FunctionRegisteredRule {
    fn name(&self) -> &str { "function_registered" }
    fn apply(&self, graph: &GraphModel, registry: &FunctionRegistry) -> Vec<Diagnostic> {
        graph
            .nodes
            .iter()
            .filter(|n| matches!(n.kind(), Ok(NodeKind::Transform)))
            .filter_map(|n| match function_name(n) {
                Some(name) if registry.has(name) => None,
                Some(name) => Some(
                    Diagnostic::error(self, format!("Node '{}' uses unregistered function '{name}'", n.id))
                        .on_node(&n.id),
                ),
                None => Some(
                    Diagnostic::error(self, format!("Node '{}' does not name exactly one function", n.id))
                        .on_node(&n.id),
                ),
            })
            .collect()
    }
}

struct TargetArgumentDeclaredRule;
impl LintRule for TargetArgumentDeclaredRule {
    fn name(&self) -> &str { "target_argument_declared" }
    fn apply(&self, graph: &GraphModel, registry: &FunctionRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for e in &graph.edges {
            let Some(target) = graph.node(&e.target) else { continue };
            let Some(function) = function_name(target).and_then(|name| registry.get(name)) else {
                continue;
            };
            match e.argument_name() {
                None => diags.push(
                    Diagnostic::error(self, format!("Edge '{}' has no target handle", e.id)).on_edge(&e.id),
                ),
                Some(arg) if !function.args().iter().any(|a| a.name == arg) => diags.push(
                    Diagnostic::error(
                        self,
                        format!(
                            "Edge '{}' feeds argument '{arg}' which '{}' does not declare",
                            e.id,
                            function.name()
                        ),
                    )
                    .on_edge(&e.id),
                ),
                Some(_) => {}
            }
        }
        diags
    }
}

struct AcyclicRule;
impl LintRule for AcyclicRule {
    fn name(&self) -> &str { "acyclic" }
    fn apply(&self, graph: &GraphModel, _registry: &FunctionRegistry) -> Vec<Diagnostic> {
        let successors = graph.successors();
        let mut in_degree: BTreeMap<&str, usize> = successors.keys().map(|k| (*k, 0)).collect();
        for targets in successors.values() {
            for &t in targets {
                *in_degree.entry(t).or_default() += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &t in successors.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(d) = in_degree.get_mut(t) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(t);
                    }
                }
            }
        }

        if visited == in_degree.len() {
            return vec![];
        }
        let cyclic: Vec<_> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        vec![Diagnostic::error(
            self,
            format!("Graph contains a cycle through: {}", cyclic.join(", ")),
        )]
    }
}

struct RequiredArgumentsConnectedRule;
impl LintRule for RequiredArgumentsConnectedRule {
    fn name(&self) -> &str { "required_arguments_connected" }
    fn apply(&self, graph: &GraphModel, registry: &FunctionRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in &graph.nodes {
            let Some(function) = function_name(node).and_then(|name| registry.get(name)) else {
                continue;
            };
            let connected: HashSet<&str> = graph
                .incoming_edges(&node.id)
                .filter_map(|e| e.argument_name())
                .collect();
            for arg in function.args().iter().filter(|a| !a.optional) {
                if !connected.contains(arg.name.as_str()) {
                    diags.push(
                        Diagnostic::warning(
                            self,
                            format!("Required argument '{}' of node '{}' is not connected", arg.name, node.id),
                        )
                        .on_node(&node.id),
                    );
                }
            }
        }
        diags
    }
}

struct IsolatedNodeRule;
impl LintRule for IsolatedNodeRule {
    fn name(&self) -> &str { "isolated_node" }
    fn apply(&self, graph: &GraphModel, _registry: &FunctionRegistry) -> Vec<Diagnostic> {
        graph
            .nodes
            .iter()
            .filter(|n| graph.is_leaf(&n.id) && graph.incoming_edges(&n.id).next().is_none())
            .map(|n| Diagnostic::warning(self, format!("Node '{}' has no edges", n.id)).on_node(&n.id))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &GraphModel, registry: &FunctionRegistry) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(UniqueIdsRule),
        Box::new(KnownNodeTypeRule),
        Box::new(EdgeEndpointsExistRule),
        Box::new(SourceCardinalityRule),
        Box::new(FunctionRegisteredRule),
        Box::new(TargetArgumentDeclaredRule),
        Box::new(AcyclicRule),
        Box::new(RequiredArgumentsConnectedRule),
        Box::new(IsolatedNodeRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph, registry));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(
    graph: &GraphModel,
    registry: &FunctionRegistry,
) -> cairn_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph, registry);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(CairnError::Graph(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
