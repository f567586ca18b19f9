//! Graph-to-rule compilation.
//!
//! Turns a validated [`GraphModel`] into a [`RuleDag`]: one [`Rule`] per node
//! with every input, output and rename resolved up front. Compilation has no
//! side effects; persisting the result is the separate [`RuleDag::write`] step.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cairn_types::{CairnError, Result};

use crate::artifact::write_atomic;
use crate::filter::DataFilter;
use crate::graph::{Edge, GraphModel, Node, NodeKind, SourceFormat};
use crate::layout::RunLayout;
use crate::registry::FunctionRegistry;
use crate::validation::validate_or_raise;

// ---------------------------------------------------------------------------
// Rule types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    Source {
        format: SourceFormat,
        paths: Vec<PathBuf>,
        hints: BTreeMap<String, String>,
    },
    Transform {
        function: String,
    },
}

/// One upstream artifact a rule consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleInput {
    pub node_id: String,
    pub path: PathBuf,
    /// Renames applied at this edge, keyed by argument name on this rule
    /// and naming the produced key on the upstream artifact. One produced
    /// key may feed several arguments.
    pub return_arg: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub node_id: String,
    pub label: String,
    pub kind: RuleKind,
    pub inputs: Vec<RuleInput>,
    pub output: PathBuf,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_filter: Option<DataFilter>,
}

impl Rule {
    pub fn is_source(&self) -> bool {
        matches!(self.kind, RuleKind::Source { .. })
    }

    /// The enabled filter on this rule, if any.
    pub fn active_filter(&self) -> Option<&DataFilter> {
        self.data_filter.as_ref().filter(|f| f.is_enabled())
    }

    /// Ids of the rules this one reads from.
    pub fn upstream_ids(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|i| i.node_id.as_str())
    }
}

/// The compiled, serialisable form of a whole graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDag {
    pub workspace_id: String,
    pub run_id: String,
    pub rules: BTreeMap<String, Rule>,
    pub terminal_outputs: BTreeSet<PathBuf>,
}

impl RuleDag {
    pub fn rule(&self, node_id: &str) -> Option<&Rule> {
        self.rules.get(node_id)
    }

    pub fn rule_by_output(&self, output: &Path) -> Option<&Rule> {
        self.rules.values().find(|r| r.output == output)
    }

    pub fn is_terminal(&self, rule: &Rule) -> bool {
        self.terminal_outputs.contains(&rule.output)
    }

    /// Ids of the rules that consume `node_id`'s artifact.
    pub fn dependents(&self, node_id: &str) -> Vec<&str> {
        self.rules
            .values()
            .filter(|r| r.upstream_ids().any(|u| u == node_id))
            .map(|r| r.node_id.as_str())
            .collect()
    }

    /// All rule ids, upstream before downstream; ties broken by id.
    pub fn topological_order(&self) -> Vec<&str> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .rules
            .iter()
            .map(|(id, r)| {
                let upstream: BTreeSet<&str> = r.upstream_ids().collect();
                (id.as_str(), upstream.len())
            })
            .collect();

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.rules.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for dep in self.dependents(id) {
                if let Some(d) = in_degree.get_mut(dep) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(dep);
                    }
                }
            }
        }
        order
    }

    /// Pretty JSON; identical graphs produce identical bytes.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_json()?.as_bytes()).await?;
        tracing::debug!(path = %path.display(), rules = self.rules.len(), "Rule DAG written");
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile `graph` into rules whose artifacts live under `layout`.
///
/// Fails with [`CairnError::Graph`] if the graph does not pass validation.
pub fn compile(graph: &GraphModel, registry: &FunctionRegistry, layout: &RunLayout) -> Result<RuleDag> {
    for d in validate_or_raise(graph, registry)? {
        tracing::warn!(rule = %d.rule, "{}", d.message);
    }

    let mut rules = BTreeMap::new();
    let mut terminal_outputs = BTreeSet::new();

    for node in &graph.nodes {
        let rule = match node.kind()? {
            NodeKind::Source(format) => source_rule(node, format, layout),
            NodeKind::Transform => transform_rule(node, graph, layout)?,
        };
        if !rule.is_source() && graph.is_leaf(&node.id) {
            terminal_outputs.insert(rule.output.clone());
        }
        rules.insert(node.id.clone(), rule);
    }

    tracing::debug!(
        run = %layout.run_id(),
        rules = rules.len(),
        terminals = terminal_outputs.len(),
        "Graph compiled"
    );

    Ok(RuleDag {
        workspace_id: layout.workspace_id().to_string(),
        run_id: layout.run_id().to_string(),
        rules,
        terminal_outputs,
    })
}

fn base_rule(node: &Node, kind: RuleKind, layout: &RunLayout) -> Rule {
    Rule {
        node_id: node.id.clone(),
        label: node.label().to_string(),
        kind,
        inputs: Vec::new(),
        output: layout.output_path(&node.id),
        params: Value::Object(node.data.param.clone()),
        data_filter: node.data.data_filter_param.clone(),
    }
}

fn source_rule(node: &Node, format: SourceFormat, layout: &RunLayout) -> Rule {
    let paths = node
        .data
        .path
        .as_ref()
        .map(|p| p.to_vec().into_iter().map(PathBuf::from).collect())
        .unwrap_or_default();
    let kind = RuleKind::Source {
        format,
        paths,
        hints: node.format_hints(),
    };
    base_rule(node, kind, layout)
}

fn transform_rule(node: &Node, graph: &GraphModel, layout: &RunLayout) -> Result<Rule> {
    let function = match node.data.path {
        Some(crate::graph::PathSpec::One(ref name)) => name.clone(),
        _ => {
            return Err(CairnError::Graph(format!(
                "node '{}' does not name exactly one function",
                node.id
            )))
        }
    };
    let mut rule = base_rule(node, RuleKind::Transform { function }, layout);

    // One input per upstream node, in edge order; parallel edges from the
    // same upstream extend its rename map.
    for edge in graph.incoming_edges(&node.id) {
        let (produced, argument) = edge_keys(edge, graph)?;
        match rule.inputs.iter_mut().find(|i| i.node_id == edge.source) {
            Some(input) => {
                input.return_arg.insert(argument, produced);
            }
            None => rule.inputs.push(RuleInput {
                node_id: edge.source.clone(),
                path: layout.output_path(&edge.source),
                return_arg: BTreeMap::from([(argument, produced)]),
            }),
        }
    }
    Ok(rule)
}

/// `(produced key, argument name)` for one edge.
fn edge_keys(edge: &Edge, graph: &GraphModel) -> Result<(String, String)> {
    let argument = edge
        .argument_name()
        .ok_or_else(|| CairnError::Graph(format!("edge '{}' has no target handle", edge.id)))?
        .to_string();
    let produced = match edge.produced_key() {
        Some(key) => key.to_string(),
        None => match graph.node(&edge.source).map(Node::kind) {
            Some(Ok(NodeKind::Source(format))) => format.output_key().to_string(),
            _ => argument.clone(),
        },
    };
    Ok((produced, argument))
}
