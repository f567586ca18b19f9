//! End-to-end tests for the cairn pipeline engine.
//!
//! Each test drives the full path: submit graph -> compile -> invalidate ->
//! execute -> inspect artifacts and status.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use cairn_pipeline::{
    Artifact, ArtifactShape, AnalysisFunction, ArgSpec, FunctionCall, FunctionOutput, FunctionRegistry,
    GraphModel, RunManager, RuntimeConfig, ScaleFunction, SubmitRequest, SumFunction, default_registry,
};
use cairn_types::{CairnError, NodeState, Result, RunState};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Wraps a function and counts its invocations.
struct Counting<F> {
    inner: F,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl<F: AnalysisFunction> AnalysisFunction for Counting<F> {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn args(&self) -> Vec<ArgSpec> {
        self.inner.args()
    }
    async fn invoke(&self, call: FunctionCall) -> Result<FunctionOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.invoke(call).await
    }
}

/// Always fails.
struct Failing;

#[async_trait]
impl AnalysisFunction for Failing {
    fn name(&self) -> &str {
        "test/fail"
    }
    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("x")]
    }
    async fn invoke(&self, call: FunctionCall) -> Result<FunctionOutput> {
        Err(CairnError::AnalysisFunction {
            function: "test/fail".into(),
            node: call.node_id,
            message: "ROI detection diverged".into(),
        })
    }
}

/// Signals when entered, then blocks until released; passes `x` through.
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl AnalysisFunction for Gate {
    fn name(&self) -> &str {
        "test/gate"
    }
    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("x")]
    }
    async fn invoke(&self, call: FunctionCall) -> Result<FunctionOutput> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(FunctionOutput::new().with_value("x", call.inputs.get("x").cloned().unwrap_or_default()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Bench {
    dir: tempfile::TempDir,
    sum_calls: Arc<AtomicUsize>,
    scale_calls: Arc<AtomicUsize>,
}

impl Bench {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "1,2\n3,4\n").unwrap();
        std::fs::write(dir.path().join("b.csv"), "10\n").unwrap();
        Self {
            dir,
            sum_calls: Arc::new(AtomicUsize::new(0)),
            scale_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn csv(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("runs")
    }

    fn registry(&self) -> FunctionRegistry {
        let mut reg = default_registry();
        reg.register(Counting {
            inner: SumFunction,
            calls: Arc::clone(&self.sum_calls),
        });
        reg.register(Counting {
            inner: ScaleFunction,
            calls: Arc::clone(&self.scale_calls),
        });
        reg.register(Failing);
        reg
    }

    fn manager_with(&self, registry: FunctionRegistry, max_parallel: usize) -> RunManager {
        let config = RuntimeConfig {
            root_dir: self.root(),
            lock_timeout_secs: 5,
            max_parallel,
        };
        RunManager::new(config, registry)
    }

    fn manager(&self) -> RunManager {
        self.manager_with(self.registry(), 4)
    }

    fn sums(&self) -> usize {
        self.sum_calls.load(Ordering::SeqCst)
    }

    fn scales(&self) -> usize {
        self.scale_calls.load(Ordering::SeqCst)
    }
}

fn source(id: &str, path: &str) -> Value {
    json!({"id": id, "type": "CsvFileNode", "data": {"label": id, "path": path}})
}

fn transform(id: &str, function: &str, param: Value) -> Value {
    json!({"id": id, "type": "AlgorithmNode", "data": {"label": id, "path": function, "param": param}})
}

fn edge(from: &str, key: &str, to: &str, arg: &str) -> Value {
    json!({
        "id": format!("{from}-{to}-{arg}"),
        "source": from,
        "sourceHandle": format!("{from}--{key}--T"),
        "target": to,
        "targetHandle": format!("{to}--{arg}--T"),
    })
}

fn graph(nodes: Vec<Value>, edges: Vec<Value>) -> GraphModel {
    serde_json::from_value(json!({"nodes": nodes, "edges": edges})).unwrap()
}

/// Two CSV sources feeding `basic/sum`.
fn sum_graph(b: &Bench) -> GraphModel {
    graph(
        vec![
            source("a", &b.csv("a.csv")),
            source("b", &b.csv("b.csv")),
            transform("s", "basic/sum", json!({})),
        ],
        vec![edge("a", "csv", "s", "x"), edge("b", "csv", "s", "y")],
    )
}

fn request(graph: GraphModel, run_id: &str, force: &[&str]) -> SubmitRequest {
    SubmitRequest {
        workspace_id: "lab".into(),
        run_id: Some(run_id.into()),
        name: "session".into(),
        graph,
        force: force.iter().map(|s| s.to_string()).collect(),
    }
}

async fn values(path: &Path) -> cairn_pipeline::ValueArtifact {
    match Artifact::read(path).await.unwrap() {
        Artifact::Values(v) => v,
        other => panic!("expected values at {}, got {other:?}", path.display()),
    }
}

// ---------------------------------------------------------------------------
// Two sources -> sum: cache, force-transform, force-source
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_sources_into_sum_with_cache_and_force() {
    let b = Bench::new();
    let m = b.manager();
    let output = m.layout("lab", "r1").unwrap().output_path("s");

    let run = m.submit(request(sum_graph(&b), "r1", &[])).await.unwrap();
    let report = run.handle.wait().await.unwrap();
    assert_eq!(report.state, RunState::Success);
    assert_eq!(b.sums(), 1);
    assert_eq!(values(&output).await.values["sum"], json!(20.0));

    // identical resubmission: nothing recomputed
    let run = m.submit(request(sum_graph(&b), "r1", &[])).await.unwrap();
    assert!(run.invalidated.is_empty());
    let report = run.handle.wait().await.unwrap();
    assert_eq!(b.sums(), 1);
    assert!(report.executed.is_empty());
    assert_eq!(report.cached.len(), 3);

    // forcing the transform recomputes it even with unchanged inputs
    let run = m.submit(request(sum_graph(&b), "r1", &["s"])).await.unwrap();
    let report = run.handle.wait().await.unwrap();
    assert_eq!(b.sums(), 2);
    assert_eq!(report.executed, vec!["s"]);

    // forcing a source invalidates the transform too
    let run = m.submit(request(sum_graph(&b), "r1", &["a"])).await.unwrap();
    assert_eq!(run.invalidated.iter().collect::<Vec<_>>(), vec!["a", "s"]);
    let mut report = run.handle.wait().await.unwrap();
    report.executed.sort();
    assert_eq!(report.executed, vec!["a", "s"]);
    assert_eq!(report.cached, vec!["b"]);
    assert_eq!(b.sums(), 3);
    assert_eq!(values(&output).await.values["sum"], json!(20.0));
}

#[tokio::test]
async fn one_output_key_can_feed_two_arguments() {
    let b = Bench::new();
    let m = b.manager();
    let g = graph(
        vec![source("a", &b.csv("a.csv")), transform("s", "basic/sum", json!({}))],
        vec![edge("a", "csv", "s", "x"), edge("a", "csv", "s", "y")],
    );

    let report = m.submit(request(g, "r1", &[])).await.unwrap().handle.wait().await.unwrap();
    assert_eq!(report.state, RunState::Success);
    let out = values(&m.layout("lab", "r1").unwrap().output_path("s")).await;
    assert_eq!(out.values["sum"], json!(20.0));
}

#[tokio::test]
async fn unknown_force_ids_are_ignored() {
    let b = Bench::new();
    let m = b.manager();
    m.submit(request(sum_graph(&b), "r1", &[])).await.unwrap().handle.wait().await.unwrap();

    let run = m.submit(request(sum_graph(&b), "r1", &["ghost"])).await.unwrap();
    assert!(run.invalidated.is_empty());
    run.handle.wait().await.unwrap();
    assert_eq!(b.sums(), 1);
}

// ---------------------------------------------------------------------------
// Invalidation closure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forcing_the_head_of_a_chain_spares_unrelated_nodes() {
    let b = Bench::new();
    let m = b.manager();
    let chain = || {
        graph(
            vec![
                source("a", &b.csv("a.csv")),
                transform("p", "basic/scale", json!({"factor": 2})),
                transform("q", "basic/scale", json!({"factor": 3})),
                source("d", &b.csv("b.csv")),
                transform("e", "basic/scale", json!({})),
            ],
            vec![
                edge("a", "csv", "p", "x"),
                edge("p", "scaled", "q", "x"),
                edge("d", "csv", "e", "x"),
            ],
        )
    };

    m.submit(request(chain(), "r1", &[])).await.unwrap().handle.wait().await.unwrap();
    assert_eq!(b.scales(), 3);

    let run = m.submit(request(chain(), "r1", &["a"])).await.unwrap();
    assert_eq!(run.invalidated.iter().collect::<Vec<_>>(), vec!["a", "p", "q"]);
    let report = run.handle.wait().await.unwrap();
    assert!(report.cached.contains(&"d".to_string()));
    assert!(report.cached.contains(&"e".to_string()));
    assert_eq!(b.scales(), 5);

    let q = values(&m.layout("lab", "r1").unwrap().output_path("q")).await;
    assert_eq!(q.values["scaled"], json!([[6.0, 12.0], [18.0, 24.0]]));
}

// ---------------------------------------------------------------------------
// Error containment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_node_is_contained() {
    let b = Bench::new();
    let m = b.manager();
    let g = graph(
        vec![
            source("a", &b.csv("a.csv")),
            transform("bad", "test/fail", json!({})),
            transform("after", "basic/scale", json!({})),
            source("d", &b.csv("b.csv")),
            transform("ok", "basic/scale", json!({"factor": 5})),
        ],
        vec![
            edge("a", "csv", "bad", "x"),
            edge("bad", "out", "after", "x"),
            edge("d", "csv", "ok", "x"),
        ],
    );

    let run = m.submit(request(g, "r1", &[])).await.unwrap();
    let report = run.handle.wait().await.unwrap();
    assert_eq!(report.state, RunState::Error);

    let status = m.status("lab", "r1", None).await.unwrap();
    assert_eq!(status.state, RunState::Error);
    assert_eq!(status.nodes["bad"].state, NodeState::Error);
    assert!(status.nodes["bad"].message.as_deref().unwrap().contains("diverged"));
    assert_eq!(status.nodes["after"].state, NodeState::Error);
    assert_eq!(status.nodes["ok"].state, NodeState::Success);

    let trace = m.trace("lab", "r1", "bad").await.unwrap().unwrap();
    assert_eq!(trace.kind, "analysis_function_error");
    let downstream = m.trace("lab", "r1", "after").await.unwrap().unwrap();
    assert_eq!(downstream.kind, "precondition_error");
    assert!(m.trace("lab", "r1", "ok").await.unwrap().is_none());

    // the error artifact is not a cache hit: a resubmission retries the node
    let layout = m.layout("lab", "r1").unwrap();
    assert_eq!(Artifact::inspect(&layout.output_path("bad")).await, ArtifactShape::Error);
    let g2 = graph(
        vec![source("a", &b.csv("a.csv")), transform("bad", "test/fail", json!({}))],
        vec![edge("a", "csv", "bad", "x")],
    );
    let report = m.submit(request(g2, "r1", &[])).await.unwrap().handle.wait().await.unwrap();
    assert_eq!(report.failed, vec!["bad"]);
}

// ---------------------------------------------------------------------------
// Reversible data filter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn data_filter_is_reversible() {
    let b = Bench::new();
    let m = b.manager();
    let with_filter = |filter: Option<Value>| {
        let mut t = transform("t", "basic/scale", json!({"factor": 2}));
        if let Some(f) = filter {
            t["data"]["dataFilterParam"] = f;
        }
        graph(vec![source("a", &b.csv("a.csv")), t], vec![edge("a", "csv", "t", "x")])
    };
    let out = m.layout("lab", "r1").unwrap().output_path("t");
    let bak = PathBuf::from(format!("{}.bak", out.display()));

    m.submit(request(with_filter(None), "r1", &[])).await.unwrap().handle.wait().await.unwrap();
    let original = std::fs::read(&out).unwrap();
    assert_eq!(b.scales(), 1);

    // enable: replayed against the backup, function not invoked
    let filter = json!({"roi": [{"start": 0, "end": 1}]});
    let run = m.submit(request(with_filter(Some(filter.clone())), "r1", &[])).await.unwrap();
    assert_eq!(run.invalidated.iter().collect::<Vec<_>>(), vec!["t"]);
    let report = run.handle.wait().await.unwrap();
    assert_eq!(report.state, RunState::Success);
    assert_eq!(b.scales(), 1);
    assert_eq!(std::fs::read(&bak).unwrap(), original);
    let filtered = values(&out).await;
    assert_eq!(filtered.values["scaled"], json!([[2.0, 4.0], [null, null]]));
    assert_eq!(filtered.values["filtered_stats"]["scaled"][0]["count"], json!(2));

    // same filter again: cache hit
    let run = m.submit(request(with_filter(Some(filter)), "r1", &[])).await.unwrap();
    assert!(run.invalidated.is_empty());
    run.handle.wait().await.unwrap();

    // disable: the backup is restored bit-for-bit without recomputing
    let run = m.submit(request(with_filter(None), "r1", &[])).await.unwrap();
    assert_eq!(run.invalidated.iter().collect::<Vec<_>>(), vec!["t"]);
    let report = run.handle.wait().await.unwrap();
    assert_eq!(report.cached, vec!["a", "t"]);
    assert_eq!(b.scales(), 1);
    assert_eq!(std::fs::read(&out).unwrap(), original);
    assert!(!bak.exists());
}

#[tokio::test]
async fn forcing_upstream_of_a_filtered_node_filters_fresh_data() {
    let b = Bench::new();
    let m = b.manager();
    let with_filter = |filter: Option<Value>| {
        let mut t = transform("t", "basic/scale", json!({"factor": 1}));
        if let Some(f) = filter {
            t["data"]["dataFilterParam"] = f;
        }
        graph(vec![source("a", &b.csv("a.csv")), t], vec![edge("a", "csv", "t", "x")])
    };
    let filter = json!({"roi": [{"start": 0, "end": 1}]});
    let out = m.layout("lab", "r1").unwrap().output_path("t");
    let bak = PathBuf::from(format!("{}.bak", out.display()));

    m.submit(request(with_filter(None), "r1", &[])).await.unwrap().handle.wait().await.unwrap();
    m.submit(request(with_filter(Some(filter.clone())), "r1", &[]))
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();
    assert_eq!(values(&bak).await.values["scaled"], json!([[1.0, 2.0], [3.0, 4.0]]));

    std::fs::write(b.dir.path().join("a.csv"), "100,200\n300,400\n").unwrap();
    let run = m.submit(request(with_filter(Some(filter)), "r1", &["a"])).await.unwrap();
    assert_eq!(run.invalidated.iter().collect::<Vec<_>>(), vec!["a", "t"]);
    let report = run.handle.wait().await.unwrap();
    assert_eq!(report.state, RunState::Success);
    assert_eq!(b.scales(), 2);

    let filtered = values(&out).await;
    assert_eq!(filtered.values["scaled"], json!([[100.0, 200.0], [null, null]]));
    assert_eq!(values(&bak).await.values["scaled"], json!([[100.0, 200.0], [300.0, 400.0]]));
}

// ---------------------------------------------------------------------------
// Determinism and aggregation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rule_dag_is_byte_identical_across_compiles() {
    let b = Bench::new();
    let m = b.manager();
    let first = m.compile("lab", "r1", &sum_graph(&b)).unwrap().to_json().unwrap();
    let second = m.compile("lab", "r1", &sum_graph(&b)).unwrap().to_json().unwrap();
    assert_eq!(first, second);

    m.submit(request(sum_graph(&b), "r1", &[])).await.unwrap().handle.wait().await.unwrap();
    let written = std::fs::read_to_string(m.layout("lab", "r1").unwrap().rule_dag_path()).unwrap();
    assert_eq!(written, first);
}

#[tokio::test]
async fn terminals_fold_into_one_aggregate() {
    let b = Bench::new();
    let m = b.manager();
    let g = graph(
        vec![
            source("a", &b.csv("a.csv")),
            source("b", &b.csv("b.csv")),
            transform("s", "basic/sum", json!({})),
            transform("k", "basic/scale", json!({"factor": 3})),
        ],
        vec![
            edge("a", "csv", "s", "x"),
            edge("b", "csv", "s", "y"),
            edge("b", "csv", "k", "x"),
        ],
    );
    m.submit(request(g, "r1", &[])).await.unwrap().handle.wait().await.unwrap();

    let path = m.layout("lab", "r1").unwrap().aggregate_path();
    let aggregate: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(aggregate["input"]["a"]["format"], "csv");
    assert_eq!(aggregate["input"]["b"]["format"], "csv");
    assert_eq!(aggregate["s"]["count"], json!(5));
    assert_eq!(aggregate["k"]["factor"], json!(3.0));
}

// ---------------------------------------------------------------------------
// Run management
// ---------------------------------------------------------------------------

#[tokio::test]
async fn copied_run_references_only_its_own_id() {
    let b = Bench::new();
    let m = b.manager();
    m.submit(request(sum_graph(&b), "orig-run", &[])).await.unwrap().handle.wait().await.unwrap();

    let copy = m.copy("lab", "orig-run", None).await.unwrap();
    let copy_dir = m.layout("lab", &copy).unwrap().run_dir();
    let mut stack = vec![copy_dir];
    let mut seen = 0;
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let text = std::fs::read_to_string(&path).unwrap();
                assert!(!text.contains("orig-run"), "{} still names the old run", path.display());
                seen += 1;
            }
        }
    }
    assert!(seen >= 6);

    let dag = cairn_pipeline::RuleDag::load(&m.layout("lab", &copy).unwrap().rule_dag_path())
        .await
        .unwrap();
    assert_eq!(dag.run_id, copy);
    assert_eq!(dag.rules["s"].output, m.layout("lab", &copy).unwrap().output_path("s"));
}

#[tokio::test]
async fn status_query_and_cancel() {
    let b = Bench::new();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut registry = b.registry();
    registry.register(Gate {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    });
    let m = b.manager_with(registry, 1);

    let g = graph(
        vec![
            source("a", &b.csv("a.csv")),
            transform("g", "test/gate", json!({})),
            transform("s", "basic/scale", json!({})),
        ],
        vec![edge("a", "csv", "g", "x"), edge("g", "x", "s", "x")],
    );
    let run = m.submit(request(g, "r1", &[])).await.unwrap();

    entered.notified().await;
    let mid = m.status("lab", "r1", Some(&["g".to_string(), "s".to_string()][..])).await.unwrap();
    assert_eq!(mid.state, RunState::Running);
    assert_eq!(mid.nodes.len(), 2);
    assert_eq!(mid.nodes["g"].state, NodeState::Running);
    assert_eq!(mid.nodes["s"].state, NodeState::Pending);
    assert!(mid.nodes["s"].started_at.is_none());

    assert!(m.cancel("lab", "r1").await);
    release.notify_one();
    let report = run.handle.wait().await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.executed, vec!["a", "g"]);
    assert_eq!(report.not_run, vec!["s"]);
    assert_eq!(report.state, RunState::Error);
    assert_eq!(b.scales(), 0);

    let done = m.status("lab", "r1", None).await.unwrap();
    assert_eq!(done.nodes["g"].state, NodeState::Success);
    assert_eq!(done.nodes["s"].state, NodeState::Pending);
    assert!(!m.cancel("lab", "r1").await);
}
