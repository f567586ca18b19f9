//! Run/step status record and its tracker.
//!
//! The record lives in `status.json` next to the run's artifacts. Every
//! mutation re-reads the file under `status.json.lock`, applies one change and
//! writes it back, so concurrent node runners never clobber each other.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_types::{NodeState, Result, RunState};

use crate::artifact::write_atomic;
use crate::compiler::RuleDag;
use crate::layout::lock_path;
use crate::lock::FileLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: String,
    pub name: String,
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<PathBuf>,
}

impl NodeStatus {
    pub fn pending(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state: NodeState::Pending,
            message: None,
            started_at: None,
            finished_at: None,
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub workspace_id: String,
    pub run_id: String,
    pub name: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: BTreeMap<String, NodeStatus>,
}

impl RunStatus {
    /// `running` while any node is unfinished, else `error` if any failed.
    pub fn derive_state(&self) -> RunState {
        let states = || self.nodes.values().map(|n| n.state);
        if states().any(|s| !s.is_terminal()) {
            RunState::Running
        } else if states().any(|s| s == NodeState::Error) {
            RunState::Error
        } else {
            RunState::Success
        }
    }

    /// Copy of the record restricted to `subset` (all nodes if `None`).
    ///
    /// Unknown ids are skipped.
    pub fn query<S: AsRef<str>>(&self, subset: Option<&[S]>) -> RunStatus {
        let mut out = self.clone();
        if let Some(ids) = subset {
            let wanted: BTreeSet<&str> = ids.iter().map(AsRef::as_ref).collect();
            out.nodes.retain(|id, _| wanted.contains(id.as_str()));
        }
        out
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|n| n.state == state).count()
    }
}

// ---------------------------------------------------------------------------
// StatusTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StatusTracker {
    path: PathBuf,
    lock_timeout: Duration,
}

impl StatusTracker {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current record, or `None` if the run has none.
    pub async fn load(&self) -> Result<Option<RunStatus>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the record for a fresh run, or refresh it for a re-run.
    ///
    /// Nodes in `reset` and nodes missing from the existing record start out
    /// `pending`; other nodes keep their previous entry. Nodes no longer in
    /// `dag` are dropped.
    pub async fn init(&self, dag: &RuleDag, name: &str, reset: &BTreeSet<String>) -> Result<RunStatus> {
        let _lock = FileLock::acquire(&lock_path(&self.path), self.lock_timeout).await?;
        let previous = self.load().await?;

        let mut nodes = BTreeMap::new();
        for (id, rule) in &dag.rules {
            let kept = previous
                .as_ref()
                .and_then(|p| p.nodes.get(id))
                .filter(|_| !reset.contains(id))
                .cloned();
            let entry = kept.unwrap_or_else(|| NodeStatus::pending(id.as_str(), rule.label.as_str()));
            nodes.insert(id.clone(), entry);
        }

        let name = if name.is_empty() {
            previous.map(|p| p.name).unwrap_or_else(|| dag.run_id.clone())
        } else {
            name.to_string()
        };
        let status = RunStatus {
            workspace_id: dag.workspace_id.clone(),
            run_id: dag.run_id.clone(),
            name,
            state: RunState::Running,
            started_at: Utc::now(),
            finished_at: None,
            nodes,
        };
        self.store(&status).await?;
        tracing::debug!(run = %status.run_id, nodes = status.nodes.len(), "Status record initialised");
        Ok(status)
    }

    /// Read-modify-write under the status lock.
    pub async fn update(&self, f: impl FnOnce(&mut RunStatus)) -> Result<RunStatus> {
        let _lock = FileLock::acquire(&lock_path(&self.path), self.lock_timeout).await?;
        let mut status = self.load().await?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no status record at {}", self.path.display()),
            )
        })?;
        f(&mut status);
        self.store(&status).await?;
        Ok(status)
    }

    async fn update_node(&self, node_id: &str, f: impl FnOnce(&mut NodeStatus)) -> Result<RunStatus> {
        let node_id = node_id.to_string();
        self.update(move |status| {
            let entry = status
                .nodes
                .entry(node_id.clone())
                .or_insert_with(|| NodeStatus::pending(node_id.as_str(), node_id.as_str()));
            f(entry);
        })
        .await
    }

    pub async fn mark_running(&self, node_id: &str) -> Result<()> {
        self.update_node(node_id, |n| {
            n.state = NodeState::Running;
            n.message = None;
            n.started_at = Some(Utc::now());
            n.finished_at = None;
            n.outputs.clear();
        })
        .await?;
        Ok(())
    }

    pub async fn mark_success(&self, node_id: &str, outputs: Vec<PathBuf>) -> Result<()> {
        self.update_node(node_id, |n| {
            n.state = NodeState::Success;
            n.message = None;
            n.finished_at = Some(Utc::now());
            n.outputs = outputs;
        })
        .await?;
        Ok(())
    }

    /// Success without execution; earlier timestamps are kept when present.
    pub async fn mark_cached(&self, node_id: &str, outputs: Vec<PathBuf>) -> Result<()> {
        self.update_node(node_id, |n| {
            let now = Utc::now();
            n.state = NodeState::Success;
            n.message = None;
            n.started_at.get_or_insert(now);
            n.finished_at.get_or_insert(now);
            n.outputs = outputs;
        })
        .await?;
        Ok(())
    }

    pub async fn mark_error(&self, node_id: &str, message: String) -> Result<()> {
        self.update_node(node_id, |n| {
            let now = Utc::now();
            n.state = NodeState::Error;
            n.message = Some(message);
            n.started_at.get_or_insert(now);
            n.finished_at = Some(now);
        })
        .await?;
        Ok(())
    }

    pub async fn rename(&self, name: &str) -> Result<RunStatus> {
        let name = name.to_string();
        self.update(move |s| s.name = name).await
    }

    /// Settle the run state once the executor has stopped.
    ///
    /// Nodes still `pending` or `running` at this point will never finish,
    /// so the run ends in `error`.
    pub async fn finalize(&self) -> Result<RunState> {
        let status = self
            .update(|s| {
                s.state = match s.derive_state() {
                    RunState::Running => RunState::Error,
                    settled => settled,
                };
                s.finished_at = Some(Utc::now());
            })
            .await?;
        Ok(status.state)
    }

    async fn store(&self, status: &RunStatus) -> Result<()> {
        write_atomic(&self.path, serde_json::to_string_pretty(status)?.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::graph::GraphModel;
    use crate::layout::RunLayout;
    use crate::registry::default_registry;

    fn dag(root: &Path) -> RuleDag {
        let graph = GraphModel::from_json(
            r#"{"nodes": [
                    {"id": "a", "type": "CsvFileNode", "data": {"label": "a.csv", "path": "a.csv"}},
                    {"id": "s", "type": "AlgorithmNode", "data": {"label": "sum", "path": "basic/sum"}}
                ],
                "edges": [{"id": "e", "source": "a", "sourceHandle": "a--csv--T", "target": "s", "targetHandle": "s--x--T"}]}"#,
        )
        .unwrap();
        compile(&graph, &default_registry(), &RunLayout::new(root, "ws", "run")).unwrap()
    }

    fn tracker(root: &Path) -> StatusTracker {
        StatusTracker::new(root.join("ws/run/status.json"), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn init_starts_everything_pending() {
        let dir = tempfile::tempdir().unwrap();
        let status = tracker(dir.path())
            .init(&dag(dir.path()), "first", &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.name, "first");
        assert_eq!(status.count(NodeState::Pending), 2);
        assert_eq!(status.nodes["s"].name, "sum");
        assert!(status.nodes["a"].started_at.is_none());
        assert_eq!(status.derive_state(), RunState::Running);
    }

    #[tokio::test]
    async fn lifecycle_transitions_persist() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());
        t.init(&dag(dir.path()), "", &BTreeSet::new()).await.unwrap();

        t.mark_running("a").await.unwrap();
        let mid = t.load().await.unwrap().unwrap();
        assert_eq!(mid.nodes["a"].state, NodeState::Running);
        assert!(mid.nodes["a"].started_at.is_some());
        assert_eq!(mid.name, "run");

        t.mark_success("a", vec![PathBuf::from("a/output.json")]).await.unwrap();
        t.mark_running("s").await.unwrap();
        t.mark_error("s", "boom".into()).await.unwrap();

        assert_eq!(t.finalize().await.unwrap(), RunState::Error);
        let done = t.load().await.unwrap().unwrap();
        assert_eq!(done.nodes["a"].outputs, vec![PathBuf::from("a/output.json")]);
        assert_eq!(done.nodes["s"].message.as_deref(), Some("boom"));
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn pending_nodes_at_finalize_mean_error() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());
        t.init(&dag(dir.path()), "", &BTreeSet::new()).await.unwrap();
        t.mark_cached("a", vec![]).await.unwrap();
        assert_eq!(t.finalize().await.unwrap(), RunState::Error);
    }

    #[tokio::test]
    async fn refresh_keeps_untouched_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());
        let d = dag(dir.path());
        t.init(&d, "keep me", &BTreeSet::new()).await.unwrap();
        t.mark_success("a", vec![]).await.unwrap();
        t.mark_success("s", vec![]).await.unwrap();
        assert_eq!(t.finalize().await.unwrap(), RunState::Success);

        let refreshed = t.init(&d, "", &BTreeSet::from(["s".to_string()])).await.unwrap();
        assert_eq!(refreshed.name, "keep me");
        assert_eq!(refreshed.nodes["a"].state, NodeState::Success);
        assert_eq!(refreshed.nodes["s"].state, NodeState::Pending);
    }

    #[tokio::test]
    async fn query_filters_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());
        let status = t.init(&dag(dir.path()), "", &BTreeSet::new()).await.unwrap();

        let only_s = status.query(Some(&["s", "ghost"][..]));
        assert_eq!(only_s.nodes.keys().collect::<Vec<_>>(), vec!["s"]);
        assert_eq!(status.query::<&str>(None).nodes.len(), 2);
    }

    #[tokio::test]
    async fn rename_touches_only_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());
        let before = t.init(&dag(dir.path()), "old", &BTreeSet::new()).await.unwrap();
        let after = t.rename("new").await.unwrap();
        assert_eq!(after.name, "new");
        assert_eq!(after.nodes, before.nodes);
        assert_eq!(after.run_id, before.run_id);
    }
}
