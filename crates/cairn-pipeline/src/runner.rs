//! Per-rule execution contract.
//!
//! A [`Runner`] executes one compiled [`Rule`] at a time: load upstream
//! artifacts, rename their keys to argument names, dispatch to the data
//! filter replay or the analysis function, persist the artifact and metadata,
//! and fold terminal results into the aggregate document. Any node-local
//! failure is written as an error-shaped artifact instead of being raised.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use cairn_types::{CairnError, Result};

use crate::artifact::{self, Artifact, FailureTrace, ValueArtifact};
use crate::compiler::{Rule, RuleKind};
use crate::events::{EventEmitter, RunEvent};
use crate::filter::DataFilter;
use crate::layout::{backup_path, RunLayout, NODE_METADATA_FILE};
use crate::metadata::{merge_all, with_fragment, with_input, write_node_metadata, AggregateWriter};
use crate::registry::{FunctionCall, FunctionInputs, FunctionRegistry, Input};
use crate::status::StatusTracker;

/// How a rule execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Succeeded,
    Failed(FailureTrace),
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Succeeded)
    }
}

/// Upstream values renamed to argument names, plus their merged metadata.
struct Loaded {
    inputs: FunctionInputs,
    metadata: Value,
}

/// What a dispatch produced, ready to persist.
struct Produced {
    values: std::collections::BTreeMap<String, Value>,
    /// Full metadata document carried by the artifact.
    document: Value,
    /// This node's own fragment for its per-function metadata file.
    fragment: Value,
}

pub struct Runner {
    registry: Arc<FunctionRegistry>,
    tracker: StatusTracker,
    aggregate: AggregateWriter,
    events: EventEmitter,
    run_id: String,
    /// Nodes whose cache was dropped by invalidation this submission.
    recompute: BTreeSet<String>,
}

impl Runner {
    pub fn new(registry: Arc<FunctionRegistry>, layout: &RunLayout, lock_timeout: Duration) -> Self {
        Self {
            registry,
            tracker: StatusTracker::new(layout.status_path(), lock_timeout),
            aggregate: AggregateWriter::new(layout.aggregate_path(), lock_timeout),
            events: EventEmitter::default(),
            run_id: layout.run_id().to_string(),
            recompute: BTreeSet::new(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Nodes to compute from their inputs even when a data filter is
    /// enabled; their fresh result becomes the pre-filter backup.
    pub fn with_recompute(mut self, recompute: BTreeSet<String>) -> Self {
        self.recompute = recompute;
        self
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute `rule` once.
    ///
    /// Node-local failures come back as [`NodeOutcome::Failed`]; an `Err` is
    /// returned only when the failure itself could not be recorded.
    pub async fn run(&self, rule: &Rule, terminal_outputs: &BTreeSet<PathBuf>) -> Result<NodeOutcome> {
        let started = Instant::now();
        match self.execute(rule, terminal_outputs).await {
            Ok(()) => {
                self.tracker
                    .mark_success(&rule.node_id, vec![rule.output.clone()])
                    .await?;
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(node = %rule.node_id, duration_ms, "Node succeeded");
                self.events.emit(RunEvent::NodeSucceeded {
                    run_id: self.run_id.clone(),
                    node_id: rule.node_id.clone(),
                    duration_ms,
                });
                Ok(NodeOutcome::Succeeded)
            }
            Err(err) if err.is_node_local() => self.fail(rule, err).await,
            Err(err) => {
                tracing::error!(node = %rule.node_id, kind = err.kind(), "Node aborted: {err}");
                Err(err)
            }
        }
    }

    async fn execute(&self, rule: &Rule, terminal_outputs: &BTreeSet<PathBuf>) -> Result<()> {
        let loaded = self.load(rule).await?;

        self.tracker.mark_running(&rule.node_id).await?;
        self.events.emit(RunEvent::NodeStarted {
            run_id: self.run_id.clone(),
            node_id: rule.node_id.clone(),
        });
        tracing::info!(node = %rule.node_id, label = %rule.label, "Node started");

        let produced = self.dispatch(rule, loaded).await?;

        Artifact::Values(ValueArtifact {
            values: produced.values,
            metadata: produced.document.clone(),
        })
        .write(&rule.output)
        .await?;
        write_node_metadata(&node_dir(rule).join(NODE_METADATA_FILE), &rule.node_id, &produced.fragment)
            .await?;

        if terminal_outputs.contains(&rule.output) {
            self.aggregate.merge(&produced.document).await?;
            tracing::debug!(node = %rule.node_id, "Terminal metadata aggregated");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Load and rename
    // -----------------------------------------------------------------------

    async fn load(&self, rule: &Rule) -> Result<Loaded> {
        let mut present = FunctionInputs::new();
        let mut documents = Vec::with_capacity(rule.inputs.len());

        for input in &rule.inputs {
            let upstream = match Artifact::read(&input.path).await? {
                Artifact::Values(a) => a,
                Artifact::Error(_) => {
                    return Err(CairnError::UpstreamFailed {
                        node: rule.node_id.clone(),
                        upstream: input.node_id.clone(),
                    })
                }
            };
            for (argument, produced) in &input.return_arg {
                match upstream.values.get(produced) {
                    Some(v) => present.insert(argument.as_str(), Input::Present(v.clone())),
                    None => tracing::debug!(
                        node = %rule.node_id,
                        upstream = %input.node_id,
                        key = %produced,
                        "Upstream artifact lacks key"
                    ),
                }
            }
            documents.push(upstream.metadata);
        }

        let inputs = match rule.kind {
            RuleKind::Transform { ref function } => {
                let mut declared = FunctionInputs::new();
                for arg in self.registry.function(function)?.args() {
                    let input = present.input(&arg.name).clone();
                    if input == Input::Absent && !arg.optional {
                        return Err(CairnError::Precondition {
                            node: rule.node_id.clone(),
                            message: format!("required argument '{}' has no value", arg.name),
                        });
                    }
                    declared.insert(arg.name, input);
                }
                declared
            }
            RuleKind::Source { .. } => FunctionInputs::new(),
        };

        Ok(Loaded {
            inputs,
            metadata: merge_all(documents.iter()),
        })
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch(&self, rule: &Rule, loaded: Loaded) -> Result<Produced> {
        let has_backup = artifact::has_backup(&rule.output).await?;
        match (rule.active_filter(), has_backup) {
            (Some(filter), true) => self.replay_filter(rule, filter).await,
            (Some(filter), false) if self.recompute.contains(&rule.node_id) => {
                let fresh = self.invoke(rule, loaded).await?;
                Artifact::Values(ValueArtifact {
                    values: fresh.values,
                    metadata: fresh.document,
                })
                .write(&backup_path(&rule.output))
                .await?;
                tracing::debug!(node = %rule.node_id, "Recomputed pre-filter backup");
                self.replay_filter(rule, filter).await
            }
            (Some(_), false) => Err(CairnError::Precondition {
                node: rule.node_id.clone(),
                message: "data filter requested but no pre-filter backup exists".into(),
            }),
            (None, true) => {
                tracing::warn!(node = %rule.node_id, "Dropping stale pre-filter backup");
                artifact::remove_backup(&rule.output).await?;
                self.invoke(rule, loaded).await
            }
            (None, false) => self.invoke(rule, loaded).await,
        }
    }

    async fn replay_filter(&self, rule: &Rule, filter: &DataFilter) -> Result<Produced> {
        let backup = match Artifact::read(&backup_path(&rule.output)).await? {
            Artifact::Values(a) => a,
            Artifact::Error(_) => {
                return Err(CairnError::Precondition {
                    node: rule.node_id.clone(),
                    message: "pre-filter backup holds an error artifact".into(),
                })
            }
        };
        tracing::debug!(node = %rule.node_id, "Replaying data filter against backup");

        let document = with_fragment(
            &backup.metadata,
            &rule.node_id,
            &json!({ "data_filter": filter }),
        );
        let fragment = document.get(&rule.node_id).cloned().unwrap_or(Value::Null);
        Ok(Produced {
            values: filter.apply(&backup.values),
            document,
            fragment,
        })
    }

    async fn invoke(&self, rule: &Rule, loaded: Loaded) -> Result<Produced> {
        match rule.kind {
            RuleKind::Source {
                format,
                ref paths,
                ref hints,
            } => {
                let value = self
                    .registry
                    .reader(format)
                    .read(format, paths, hints, &rule.params)
                    .await?;
                let entry = json!({ "format": format, "paths": paths, "hints": hints });
                let mut values = std::collections::BTreeMap::new();
                values.insert(format.output_key().to_string(), value);
                Ok(Produced {
                    values,
                    document: with_input(&loaded.metadata, &rule.node_id, &entry),
                    fragment: entry,
                })
            }
            RuleKind::Transform { ref function } => {
                let function = Arc::clone(self.registry.function(function)?);
                let name = function.name().to_string();
                let call = FunctionCall {
                    node_id: rule.node_id.clone(),
                    inputs: loaded.inputs,
                    params: rule.params.clone(),
                    output_dir: node_dir(rule),
                };

                // Spawned so a panicking function fails only this node.
                let output = tokio::spawn(async move { function.invoke(call).await })
                    .await
                    .map_err(|e| CairnError::AnalysisFunction {
                        function: name.clone(),
                        node: rule.node_id.clone(),
                        message: panic_message(e),
                    })?
                    .map_err(|e| match e {
                        e @ CairnError::AnalysisFunction { .. } => e,
                        other => CairnError::AnalysisFunction {
                            function: name.clone(),
                            node: rule.node_id.clone(),
                            message: other.to_string(),
                        },
                    })?;

                let fragment = output.metadata.unwrap_or_else(|| Value::Object(Map::new()));
                Ok(Produced {
                    values: output.values,
                    document: with_fragment(&loaded.metadata, &rule.node_id, &fragment),
                    fragment,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Failure capture
    // -----------------------------------------------------------------------

    async fn fail(&self, rule: &Rule, err: CairnError) -> Result<NodeOutcome> {
        let trace = FailureTrace::from_error(&rule.node_id, &err);
        tracing::error!(node = %rule.node_id, kind = err.kind(), "Node failed: {err}");

        if let Err(write_err) = Artifact::Error(trace.clone()).write(&rule.output).await {
            tracing::error!(node = %rule.node_id, "Could not write error artifact: {write_err}");
        }
        self.tracker.mark_error(&rule.node_id, trace.render()).await?;
        self.events.emit(RunEvent::NodeFailed {
            run_id: self.run_id.clone(),
            node_id: rule.node_id.clone(),
            error: trace.message.clone(),
        });
        Ok(NodeOutcome::Failed(trace))
    }
}

fn node_dir(rule: &Rule) -> PathBuf {
    rule.output.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
