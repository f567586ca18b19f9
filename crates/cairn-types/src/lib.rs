//! Shared types and errors for the Cairn pipeline engine.
//!
//! This crate provides the foundational types used across the other Cairn crates:
//! - `CairnError`: unified error taxonomy
//! - `NodeState` / `RunState`: the status state machines polled by clients

use serde::{Deserialize, Serialize};

/// Unified error type for all Cairn subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CairnError {
    // === Compile-time errors ===
    #[error("Invalid graph: {0}")]
    Graph(String),

    // === Node-local errors ===
    #[error("Precondition failed on node '{node}': {message}")]
    Precondition { node: String, message: String },

    #[error("Analysis function '{function}' failed on node '{node}': {message}")]
    AnalysisFunction {
        function: String,
        node: String,
        message: String,
    },

    #[error("Node '{node}' cannot run: upstream node '{upstream}' produced an error artifact")]
    UpstreamFailed { node: String, upstream: String },

    #[error("Timed out after {timeout_ms}ms waiting for lock on {path}")]
    AggregationLockTimeout { path: String, timeout_ms: u64 },

    // === Run management ===
    #[error("Run '{run_id}' not found in workspace '{workspace_id}'")]
    RunNotFound {
        workspace_id: String,
        run_id: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CairnError {
    /// Stable snake_case tag for the error class, recorded in failure traces.
    pub fn kind(&self) -> &'static str {
        match self {
            CairnError::Graph(_) => "graph_error",
            CairnError::Precondition { .. } | CairnError::UpstreamFailed { .. } => {
                "precondition_error"
            }
            CairnError::AnalysisFunction { .. } => "analysis_function_error",
            CairnError::AggregationLockTimeout { .. } => "aggregation_lock_timeout",
            CairnError::Io(_) | CairnError::Json(_) => "io_error",
            CairnError::RunNotFound { .. } => "run_not_found",
            CairnError::Config(_) => "config_error",
            CairnError::Other(_) => "other",
        }
    }

    /// Returns `true` if the error only affects the node that raised it.
    ///
    /// Node-local failures are converted into error-shaped artifacts by the
    /// runner; everything else is reported to the caller directly.
    pub fn is_node_local(&self) -> bool {
        !matches!(
            self,
            CairnError::Graph(_) | CairnError::RunNotFound { .. } | CairnError::Config(_)
        )
    }
}

/// A convenience alias for `Result<T, CairnError>`.
pub type Result<T> = std::result::Result<T, CairnError>;

// ---------------------------------------------------------------------------
// NodeState: per-node status
// ---------------------------------------------------------------------------

/// Per-node lifecycle: `pending -> running -> {success, error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Success,
    Error,
}

impl NodeState {
    /// `true` once the node has reached `success` or `error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Success | NodeState::Error)
    }
}

// ---------------------------------------------------------------------------
// RunState: whole-run status
// ---------------------------------------------------------------------------

/// Whole-run lifecycle: `running -> {success, error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Success,
    Error,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Running)
    }
}
