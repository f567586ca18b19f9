//! In-process DAG executor.
//!
//! Schedules rules in topological order, running independent branches
//! concurrently up to a fixed limit. A rule becomes ready once every rule it
//! reads from has finished, whether that upstream succeeded or left an
//! error-shaped artifact.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;

use cairn_types::{Result, RunState};

use crate::artifact::{Artifact, ArtifactShape};
use crate::compiler::RuleDag;
use crate::events::RunEvent;
use crate::runner::{NodeOutcome, Runner};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Best-effort stop signal shared between a run and its controllers.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns `false` if one was already requested.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Summary of one executor pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub executed: Vec<String>,
    pub cached: Vec<String>,
    pub failed: Vec<String>,
    /// Nodes never scheduled because the run was cancelled.
    pub not_run: Vec<String>,
    pub state: RunState,
    pub cancelled: bool,
}

enum Finished {
    Cached,
    Executed,
    Failed,
}

pub struct LocalExecutor {
    runner: Arc<Runner>,
    max_parallel: usize,
    cancel: CancelHandle,
}

// ---------------------------------------------------------------------------
// LocalExecutor
// ---------------------------------------------------------------------------

impl LocalExecutor {
    pub fn new(runner: Arc<Runner>, max_parallel: usize) -> Self {
        Self {
            runner,
            max_parallel: max_parallel.max(1),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run every rule of `dag` once and settle the run state.
    pub async fn execute(&self, dag: Arc<RuleDag>) -> Result<ExecutionReport> {
        let started = Instant::now();
        let run_id = self.runner.run_id().to_string();

        let mut waiting: BTreeMap<String, usize> = dag
            .rules
            .iter()
            .map(|(id, r)| (id.clone(), r.upstream_ids().collect::<BTreeSet<_>>().len()))
            .collect();
        let mut ready: VecDeque<String> = waiting
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| id.clone())
            .collect();
        waiting.retain(|_, n| *n > 0);

        let mut executed = Vec::new();
        let mut cached = Vec::new();
        let mut failed = Vec::new();
        let mut running = JoinSet::new();

        loop {
            while !self.cancel.is_cancelled() && running.len() < self.max_parallel {
                let Some(id) = ready.pop_front() else { break };
                let runner = Arc::clone(&self.runner);
                let dag = Arc::clone(&dag);
                running.spawn(async move {
                    let result = run_one(&runner, &dag, &id).await;
                    (id, result)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // The task's node stays unfinished and its dependents never become ready.
                    tracing::error!(run = %run_id, "Node task aborted: {e}");
                    continue;
                }
            };
            match result {
                Ok(Finished::Cached) => cached.push(id.clone()),
                Ok(Finished::Executed) => executed.push(id.clone()),
                Ok(Finished::Failed) => failed.push(id.clone()),
                Err(e) => {
                    tracing::error!(node = %id, "Node could not record its outcome: {e}");
                    failed.push(id.clone());
                }
            }

            for dependent in dag.dependents(&id) {
                if let Some(n) = waiting.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        waiting.remove(dependent);
                        ready.push_back(dependent.to_string());
                    }
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        let mut not_run: Vec<String> = ready.into_iter().chain(waiting.into_keys()).collect();
        not_run.sort();
        if cancelled {
            tracing::warn!(run = %run_id, not_run = not_run.len(), "Run cancelled");
            self.runner.events().emit(RunEvent::RunCancelled {
                run_id: run_id.clone(),
            });
        }

        let state = self.runner.tracker().finalize().await?;
        let report = ExecutionReport {
            executed,
            cached,
            failed,
            not_run,
            state,
            cancelled,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            run = %run_id,
            executed = report.executed.len(),
            cached = report.cached.len(),
            failed = report.failed.len(),
            ?state,
            "Run finished"
        );
        self.runner.events().emit(RunEvent::RunFinished {
            run_id,
            state,
            duration_ms,
        });
        Ok(report)
    }
}

/// Cache check, then execution of a single rule.
async fn run_one(runner: &Runner, dag: &RuleDag, node_id: &str) -> Result<Finished> {
    let Some(rule) = dag.rule(node_id) else {
        return Ok(Finished::Failed);
    };
    if Artifact::inspect(&rule.output).await == ArtifactShape::Values {
        runner.tracker().mark_cached(node_id, vec![rule.output.clone()]).await?;
        tracing::debug!(node = %node_id, "Cache hit");
        runner.events().emit(RunEvent::NodeCached {
            run_id: runner.run_id().to_string(),
            node_id: node_id.to_string(),
        });
        return Ok(Finished::Cached);
    }
    let finished = match runner.run(rule, &dag.terminal_outputs).await? {
        NodeOutcome::Succeeded => Finished::Executed,
        NodeOutcome::Failed(_) => Finished::Failed,
    };
    Ok(finished)
}
