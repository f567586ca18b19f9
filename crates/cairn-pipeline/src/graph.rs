//! The user-authored node/edge graph.
//!
//! This is pure data as submitted by the editor. Node kinds are parsed into
//! the closed [`NodeKind`] enumeration so that every kind the compiler sees is
//! bound to a handler at compile time.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use cairn_types::CairnError;

use crate::filter::DataFilter;

/// A complete graph submission: nodes plus the edges connecting them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphModel {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub data: NodeData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeData {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub param: serde_json::Map<String, serde_json::Value>,
    /// Raw input locator(s) for sources; the registered function name for transforms.
    #[serde(default)]
    pub path: Option<PathSpec>,
    #[serde(default, rename = "hdf5Path")]
    pub hdf5_path: Option<String>,
    #[serde(default)]
    pub mat_path: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub data_filter_param: Option<DataFilter>,
}

/// One locator or many.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    One(String),
    Many(Vec<String>),
}

impl PathSpec {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            PathSpec::One(p) => vec![p.clone()],
            PathSpec::Many(ps) => ps.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PathSpec::One(_) => 1,
            PathSpec::Many(ps) => ps.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub source_handle: Option<String>,
    pub target: String,
    #[serde(default)]
    pub target_handle: Option<String>,
}

impl Edge {
    /// The key produced by the source node on this edge.
    pub fn produced_key(&self) -> Option<&str> {
        self.source_handle.as_deref().map(handle_name)
    }

    /// The argument name the target node expects on this edge.
    pub fn argument_name(&self) -> Option<&str> {
        self.target_handle.as_deref().map(handle_name)
    }
}

/// Extract the name segment of a `"<node>--<name>--<type>"` handle.
///
/// A handle without `--` separators is used verbatim.
pub fn handle_name(handle: &str) -> &str {
    let mut parts = handle.split("--");
    match (parts.next(), parts.next()) {
        (Some(_), Some(name)) => name,
        _ => handle,
    }
}

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// Supported raw data formats for source nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Image,
    Csv,
    Hdf5,
    Fluo,
    Behavior,
    Matlab,
    Microscope,
}

impl SourceFormat {
    /// The artifact key a source of this format produces.
    pub fn output_key(self) -> &'static str {
        match self {
            SourceFormat::Image => "image",
            SourceFormat::Csv => "csv",
            SourceFormat::Hdf5 => "hdf5",
            SourceFormat::Fluo => "fluo",
            SourceFormat::Behavior => "behavior",
            SourceFormat::Matlab => "matlab",
            SourceFormat::Microscope => "microscope",
        }
    }

    /// Only image stacks may be split over several files.
    pub fn accepts_many_paths(self) -> bool {
        matches!(self, SourceFormat::Image)
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.output_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Source(SourceFormat),
    Transform,
}

impl NodeKind {
    pub fn is_source(self) -> bool {
        matches!(self, NodeKind::Source(_))
    }
}

impl FromStr for NodeKind {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "ImageFileNode" => NodeKind::Source(SourceFormat::Image),
            "CsvFileNode" => NodeKind::Source(SourceFormat::Csv),
            "HDF5FileNode" => NodeKind::Source(SourceFormat::Hdf5),
            "FluoFileNode" => NodeKind::Source(SourceFormat::Fluo),
            "BehaviorFileNode" => NodeKind::Source(SourceFormat::Behavior),
            "MatlabFileNode" => NodeKind::Source(SourceFormat::Matlab),
            "MicroscopeFileNode" => NodeKind::Source(SourceFormat::Microscope),
            "AlgorithmNode" => NodeKind::Transform,
            other => {
                return Err(CairnError::Graph(format!("unrecognized node type '{other}'")))
            }
        };
        Ok(kind)
    }
}

impl Node {
    pub fn kind(&self) -> Result<NodeKind, CairnError> {
        self.node_type.parse().map_err(|_| {
            CairnError::Graph(format!(
                "node '{}' has unrecognized type '{}'",
                self.id, self.node_type
            ))
        })
    }

    pub fn label(&self) -> &str {
        if self.data.label.is_empty() {
            &self.id
        } else {
            &self.data.label
        }
    }

    /// Format hints forwarded to the source reader.
    pub fn format_hints(&self) -> BTreeMap<String, String> {
        let mut hints = BTreeMap::new();
        if let Some(ref p) = self.data.hdf5_path {
            hints.insert("hdf5Path".to_string(), p.clone());
        }
        if let Some(ref p) = self.data.mat_path {
            hints.insert("matPath".to_string(), p.clone());
        }
        if let Some(ref t) = self.data.file_type {
            hints.insert("fileType".to_string(), t.clone());
        }
        hints
    }
}

// ---------------------------------------------------------------------------
// GraphModel queries
// ---------------------------------------------------------------------------

impl GraphModel {
    pub fn from_json(json: &str) -> cairn_types::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges targeting `node_id`, in submission order.
    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// A node with no outgoing edge.
    pub fn is_leaf(&self, node_id: &str) -> bool {
        self.outgoing_edges(node_id).next().is_none()
    }

    /// Forward adjacency (node id -> ids of the nodes it feeds), deduplicated.
    pub fn successors(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut adj: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for node in &self.nodes {
            adj.entry(node.id.as_str()).or_default();
        }
        for edge in &self.edges {
            let targets = adj.entry(edge.source.as_str()).or_default();
            if !targets.contains(&edge.target.as_str()) {
                targets.push(edge.target.as_str());
            }
        }
        adj
    }
}
