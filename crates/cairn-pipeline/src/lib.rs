//! Pipeline compiler and execution engine for imaging analysis graphs.
//!
//! This crate turns a user-authored node/edge graph into a rule DAG, runs each
//! rule once per invalidation epoch against a durable artifact cache, merges
//! per-node metadata into a run-wide aggregate, replays reversible data
//! filters, and tracks run/step status for polling clients.

pub mod artifact;
pub mod compiler;
pub mod config;
pub mod events;
pub mod executor;
pub mod filter;
pub mod functions;
pub mod graph;
pub mod invalidate;
pub mod layout;
pub mod lock;
pub mod metadata;
pub mod registry;
pub mod runner;
pub mod sources;
pub mod status;
pub mod storage;
pub mod validation;
pub mod workflow;

pub use artifact::{Artifact, ArtifactShape, FailureTrace, ValueArtifact};
pub use compiler::{compile, Rule, RuleDag, RuleInput, RuleKind};
pub use config::RuntimeConfig;
pub use events::{EventEmitter, RunEvent};
pub use executor::{CancelHandle, ExecutionReport, LocalExecutor};
pub use filter::{DataFilter, IndexRange};
pub use functions::{ScaleFunction, SumFunction};
pub use graph::{Edge, GraphModel, Node, NodeData, NodeKind, PathSpec, SourceFormat};
pub use invalidate::{invalidate, purge, stale_filters, InvalidationPlan};
pub use layout::RunLayout;
pub use metadata::{deep_merge, AggregateWriter};
pub use registry::{
    default_registry, AnalysisFunction, ArgSpec, FunctionCall, FunctionInputs, FunctionOutput,
    FunctionRegistry, Input, SourceReader,
};
pub use runner::{NodeOutcome, Runner};
pub use status::{NodeStatus, RunStatus, StatusTracker};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
pub use workflow::{RunHandle, RunManager, SubmitRequest, SubmittedRun};
