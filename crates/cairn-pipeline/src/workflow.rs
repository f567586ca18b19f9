//! Run management: submission, polling, cancellation and run-level file
//! operations.
//!
//! [`RunManager`] is the entry point the CLI (or any other front end) drives.
//! Submission compiles synchronously, so graph errors reach the caller before
//! any node runs; execution then proceeds on a background task.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use cairn_types::{CairnError, Result};

use crate::artifact::{Artifact, ArtifactShape, FailureTrace};
use crate::compiler::{compile, RuleDag};
use crate::config::RuntimeConfig;
use crate::events::{EventEmitter, RunEvent};
use crate::executor::{CancelHandle, ExecutionReport, LocalExecutor};
use crate::graph::GraphModel;
use crate::invalidate::{invalidate, purge, stale_filters, InvalidationPlan};
use crate::layout::RunLayout;
use crate::registry::FunctionRegistry;
use crate::runner::Runner;
use crate::status::{RunStatus, StatusTracker};
use crate::storage;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub workspace_id: String,
    /// Re-run an existing run (its cache is reused) or start a new one.
    pub run_id: Option<String>,
    pub name: String,
    pub graph: GraphModel,
    /// Node ids to recompute along with everything downstream of them.
    pub force: Vec<String>,
}

/// A run whose execution is in progress on a background task.
pub struct SubmittedRun {
    pub run_id: String,
    /// Every node whose cache was dropped for this submission.
    pub invalidated: BTreeSet<String>,
    pub handle: RunHandle,
}

pub struct RunHandle {
    join: JoinHandle<Result<ExecutionReport>>,
    cancel: CancelHandle,
}

impl RunHandle {
    /// Wait for the executor to finish.
    pub async fn wait(self) -> Result<ExecutionReport> {
        self.join
            .await
            .map_err(|e| CairnError::Other(format!("run task failed: {e}")))?
    }

    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }
}

type RunKey = (String, String);

pub struct RunManager {
    config: RuntimeConfig,
    registry: Arc<FunctionRegistry>,
    events: EventEmitter,
    active: Arc<Mutex<HashMap<RunKey, CancelHandle>>>,
}

// ---------------------------------------------------------------------------
// RunManager
// ---------------------------------------------------------------------------

impl RunManager {
    pub fn new(config: RuntimeConfig, registry: FunctionRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            events: EventEmitter::default(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn layout(&self, workspace_id: &str, run_id: &str) -> Result<RunLayout> {
        check_id("workspace id", workspace_id)?;
        check_id("run id", run_id)?;
        Ok(RunLayout::new(&self.config.root_dir, workspace_id, run_id))
    }

    fn tracker(&self, layout: &RunLayout) -> StatusTracker {
        StatusTracker::new(layout.status_path(), self.config.lock_timeout())
    }

    /// Compile a graph without running it.
    pub fn compile(&self, workspace_id: &str, run_id: &str, graph: &GraphModel) -> Result<RuleDag> {
        compile(graph, &self.registry, &self.layout(workspace_id, run_id)?)
    }

    /// Compile, invalidate, and start executing a graph.
    ///
    /// The run key is reserved before anything touches disk, so two
    /// submissions of the same run never overlap. The reservation is
    /// released if submission fails.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmittedRun> {
        let run_id = request.run_id.clone().unwrap_or_else(new_run_id);
        let layout = self.layout(&request.workspace_id, &run_id)?;
        let key = (request.workspace_id.clone(), run_id.clone());
        let cancel = CancelHandle::new();
        match self.active.lock().await.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(CairnError::Other(format!("run '{run_id}' is already executing")));
            }
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }

        match self.start(request, layout, key.clone(), cancel).await {
            Ok(run) => Ok(run),
            Err(err) => {
                self.active.lock().await.remove(&key);
                Err(err)
            }
        }
    }

    async fn start(
        &self,
        request: SubmitRequest,
        layout: RunLayout,
        key: RunKey,
        cancel: CancelHandle,
    ) -> Result<SubmittedRun> {
        let run_id = layout.run_id().to_string();
        let dag = compile(&request.graph, &self.registry, &layout)?;
        dag.write(&layout.rule_dag_path()).await?;

        let forced = invalidate(&dag, &request.force);
        let stale = stale_filters(&dag).await?;
        if !stale.is_empty() {
            tracing::info!(run = %run_id, nodes = ?stale, "Data filter changed");
        }
        let plan = InvalidationPlan::new(&dag, &forced, &stale);
        purge(&dag, &plan).await?;
        let invalidated = plan.nodes();

        let mut reset = invalidated.clone();
        for rule in dag.rules.values() {
            if Artifact::inspect(&rule.output).await != ArtifactShape::Values {
                reset.insert(rule.node_id.clone());
            }
        }
        let runner = Runner::new(Arc::clone(&self.registry), &layout, self.config.lock_timeout())
            .with_events(self.events.clone())
            .with_recompute(plan.recompute);
        runner.tracker().init(&dag, &request.name, &reset).await?;

        tracing::info!(
            workspace = %request.workspace_id,
            run = %run_id,
            nodes = dag.rules.len(),
            invalidated = invalidated.len(),
            "Run submitted"
        );
        self.events.emit(RunEvent::RunSubmitted {
            workspace_id: request.workspace_id.clone(),
            run_id: run_id.clone(),
            node_count: dag.rules.len(),
            invalidated: invalidated.iter().cloned().collect(),
        });

        let executor = LocalExecutor::new(Arc::new(runner), self.config.max_parallel).with_cancel(cancel.clone());
        let active = Arc::clone(&self.active);
        let dag = Arc::new(dag);
        let join = tokio::spawn(async move {
            let report = executor.execute(dag).await;
            active.lock().await.remove(&key);
            report
        });

        Ok(SubmittedRun {
            run_id,
            invalidated,
            handle: RunHandle { join, cancel },
        })
    }

    /// The status record, optionally restricted to some node ids.
    pub async fn status(&self, workspace_id: &str, run_id: &str, nodes: Option<&[String]>) -> Result<RunStatus> {
        let layout = self.layout(workspace_id, run_id)?;
        let status = self
            .tracker(&layout)
            .load()
            .await?
            .ok_or_else(|| not_found(workspace_id, run_id))?;
        Ok(status.query(nodes))
    }

    /// Ask an executing run to stop scheduling. Returns whether the signal
    /// was accepted.
    pub async fn cancel(&self, workspace_id: &str, run_id: &str) -> bool {
        let key = (workspace_id.to_string(), run_id.to_string());
        let accepted = match self.active.lock().await.get(&key) {
            Some(handle) => handle.cancel(),
            None => false,
        };
        tracing::info!(run = %run_id, accepted, "Cancel requested");
        accepted
    }

    pub async fn rename(&self, workspace_id: &str, run_id: &str, name: &str) -> Result<RunStatus> {
        let layout = self.layout(workspace_id, run_id)?;
        let tracker = self.tracker(&layout);
        if tracker.load().await?.is_none() {
            return Err(not_found(workspace_id, run_id));
        }
        tracker.rename(name).await
    }

    /// Duplicate a run under a fresh run id; returns the new id.
    pub async fn copy(&self, workspace_id: &str, run_id: &str, name: Option<&str>) -> Result<String> {
        let source = self.layout(workspace_id, run_id)?;
        if !tokio::fs::try_exists(source.run_dir()).await? {
            return Err(not_found(workspace_id, run_id));
        }
        let new_id = new_run_id();
        let target = source.with_run(new_id.as_str());
        storage::copy_run(&source.run_dir(), &target.run_dir(), run_id, &new_id).await?;
        if let Some(name) = name {
            self.tracker(&target).rename(name).await?;
        }
        tracing::info!(from = %run_id, to = %new_id, "Run copied");
        Ok(new_id)
    }

    /// Remove a finished run's directory, including its status record.
    pub async fn delete(&self, workspace_id: &str, run_id: &str) -> Result<()> {
        let layout = self.layout(workspace_id, run_id)?;
        let key = (workspace_id.to_string(), run_id.to_string());
        if self.active.lock().await.contains_key(&key) {
            return Err(CairnError::Other(format!(
                "run '{run_id}' is still executing; cancel it first"
            )));
        }
        if !tokio::fs::try_exists(layout.run_dir()).await? {
            return Err(not_found(workspace_id, run_id));
        }
        storage::delete_run(&layout.run_dir()).await?;
        tracing::info!(run = %run_id, "Run deleted");
        Ok(())
    }

    /// The captured failure of `node_id`, if its artifact is error-shaped.
    pub async fn trace(&self, workspace_id: &str, run_id: &str, node_id: &str) -> Result<Option<FailureTrace>> {
        let layout = self.layout(workspace_id, run_id)?;
        check_id("node id", node_id)?;
        if !tokio::fs::try_exists(layout.run_dir()).await? {
            return Err(not_found(workspace_id, run_id));
        }
        let path = layout.output_path(node_id);
        match Artifact::inspect(&path).await {
            ArtifactShape::Error => match Artifact::read(&path).await? {
                Artifact::Error(trace) => Ok(Some(trace)),
                Artifact::Values(_) => Ok(None),
            },
            _ => Ok(None),
        }
    }
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn not_found(workspace_id: &str, run_id: &str) -> CairnError {
    CairnError::RunNotFound {
        workspace_id: workspace_id.to_string(),
        run_id: run_id.to_string(),
    }
}

/// Ids become directory names; reject anything that could escape the root.
fn check_id(what: &str, id: &str) -> Result<()> {
    let bad = id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']);
    if bad {
        return Err(CairnError::Other(format!("invalid {what} '{id}'")));
    }
    Ok(())
}
