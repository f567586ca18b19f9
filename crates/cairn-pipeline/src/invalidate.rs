//! Force-run invalidation and cache purging.

use std::collections::{BTreeSet, VecDeque};

use cairn_types::Result;

use crate::artifact::{self, Artifact, ArtifactShape};
use crate::compiler::{Rule, RuleDag};
use crate::filter::DataFilter;

/// Forced ids plus everything that transitively consumes their output.
///
/// Ids that name no rule are ignored with a warning.
pub fn invalidate<S: AsRef<str>>(dag: &RuleDag, forced: &[S]) -> BTreeSet<String> {
    let mut closure = BTreeSet::new();
    let mut queue = VecDeque::new();

    for id in forced {
        let id = id.as_ref();
        if dag.rule(id).is_none() {
            tracing::warn!(node = %id, "Ignoring force-run of unknown node");
            continue;
        }
        queue.push_back(id.to_string());
    }

    while let Some(id) = queue.pop_front() {
        if !closure.insert(id.clone()) {
            continue;
        }
        queue.extend(dag.dependents(&id).into_iter().map(String::from));
    }
    closure
}

/// Rules whose cached artifact does not reflect their current filter setting.
///
/// A rule with an enabled filter is stale when it has no backup yet or the
/// filter recorded in its artifact differs. A rule without one is stale when
/// a backup from an earlier filter is still lying around.
pub async fn stale_filters(dag: &RuleDag) -> Result<BTreeSet<String>> {
    let mut stale = BTreeSet::new();
    for rule in dag.rules.values() {
        if Artifact::inspect(&rule.output).await != ArtifactShape::Values {
            continue;
        }
        let has_backup = artifact::has_backup(&rule.output).await?;
        let fresh = match rule.active_filter() {
            Some(filter) => has_backup && recorded_filter(rule).await?.as_ref() == Some(filter),
            None => !has_backup,
        };
        if !fresh {
            stale.insert(rule.node_id.clone());
        }
    }
    Ok(stale)
}

async fn recorded_filter(rule: &Rule) -> Result<Option<DataFilter>> {
    let Artifact::Values(a) = Artifact::read(&rule.output).await? else {
        return Ok(None);
    };
    let recorded: Option<DataFilter> = a
        .metadata
        .get(&rule.node_id)
        .and_then(|fragment| fragment.get("data_filter"))
        .cloned()
        .map(serde_json::from_value)
        .transpose()?;
    Ok(recorded)
}

/// What a submission does to each node's cache.
///
/// `recompute` holds the forced closure plus everything downstream of a
/// node whose filter setting changed; those nodes lose both their artifact
/// and their backup. `refilter` holds nodes whose own filter changed while
/// every upstream stayed cached, so their backup is still the right
/// unfiltered result and can be replayed or restored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub recompute: BTreeSet<String>,
    pub refilter: BTreeSet<String>,
}

impl InvalidationPlan {
    pub fn new(dag: &RuleDag, forced: &BTreeSet<String>, stale: &BTreeSet<String>) -> Self {
        let downstream: Vec<&str> = stale.iter().flat_map(|id| dag.dependents(id)).collect();
        let mut recompute = forced.clone();
        recompute.extend(invalidate(dag, &downstream[..]));
        let refilter = stale.difference(&recompute).cloned().collect();
        Self { recompute, refilter }
    }

    /// Every node whose cached artifact is dropped.
    pub fn nodes(&self) -> BTreeSet<String> {
        self.recompute.union(&self.refilter).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.recompute.is_empty() && self.refilter.is_empty()
    }
}

/// Apply `plan` to the artifacts on disk so the next execution misses the
/// cache for every planned node.
///
/// Recomputed nodes lose their artifact and backup. A refiltered node with
/// an enabled filter moves its artifact to the backup (or drops it when a
/// backup already exists); one whose filter was disabled gets its backup
/// renamed back over the artifact. Purging an uncached node is a no-op.
pub async fn purge(dag: &RuleDag, plan: &InvalidationPlan) -> Result<()> {
    for id in &plan.recompute {
        let Some(rule) = dag.rule(id) else { continue };
        let removed = artifact::remove_if_exists(&rule.output).await?;
        let dropped_backup = artifact::remove_backup(&rule.output).await?;
        tracing::debug!(node = %id, removed, dropped_backup, "Purged artifact");
    }
    for id in &plan.refilter {
        let Some(rule) = dag.rule(id) else { continue };
        if rule.active_filter().is_some() {
            let backed_up = artifact::move_to_backup(&rule.output).await?;
            tracing::debug!(node = %id, backed_up, "Purged filtered artifact");
        } else {
            let restored = artifact::restore_backup(&rule.output).await?;
            tracing::info!(node = %id, restored, "Data filter disabled");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ValueArtifact;
    use crate::compiler::compile;
    use crate::filter::IndexRange;
    use crate::graph::GraphModel;
    use crate::layout::{backup_path, RunLayout};
    use crate::registry::default_registry;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;

    // a -> b -> c, d alone
    const CHAIN: &str = r#"{
        "nodes": [
            {"id": "a", "type": "CsvFileNode", "data": {"path": "a.csv"}},
            {"id": "b", "type": "AlgorithmNode", "data": {"path": "basic/scale"}},
            {"id": "c", "type": "AlgorithmNode", "data": {"path": "basic/scale"}},
            {"id": "d", "type": "CsvFileNode", "data": {"path": "d.csv"}}
        ],
        "edges": [
            {"id": "e1", "source": "a", "sourceHandle": "a--csv--CsvData", "target": "b", "targetHandle": "b--x--CsvData"},
            {"id": "e2", "source": "b", "sourceHandle": "b--scaled--T", "target": "c", "targetHandle": "c--x--T"}
        ]
    }"#;

    fn dag(root: &Path) -> RuleDag {
        let graph = GraphModel::from_json(CHAIN).unwrap();
        compile(&graph, &default_registry(), &RunLayout::new(root, "ws", "run")).unwrap()
    }

    async fn write_values(path: &Path) {
        Artifact::Values(ValueArtifact {
            values: BTreeMap::from([("k".to_string(), json!([[1, 2]]))]),
            metadata: json!({}),
        })
        .write(path)
        .await
        .unwrap();
    }

    #[test]
    fn closure_follows_edges_forward() {
        let dag = dag(Path::new("/r"));
        let set = invalidate(&dag, &["a"]);
        assert_eq!(set, BTreeSet::from(["a".into(), "b".into(), "c".into()]));
        assert!(!set.contains("d"));

        assert_eq!(invalidate(&dag, &["b"]), BTreeSet::from(["b".into(), "c".into()]));
        assert!(invalidate(&dag, &["ghost"]).is_empty());
        assert!(invalidate::<&str>(&dag, &[]).is_empty());
    }

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn roi() -> DataFilter {
        DataFilter {
            roi: vec![IndexRange { start: 0, end: 1 }],
            ..Default::default()
        }
    }

    #[test]
    fn plan_splits_forced_closure_from_refiltered_nodes() {
        let dag = dag(Path::new("/r"));

        // b's own filter changed: b is replayed, c downstream recomputes
        let plan = InvalidationPlan::new(&dag, &BTreeSet::new(), &ids(&["b"]));
        assert_eq!(plan.recompute, ids(&["c"]));
        assert_eq!(plan.refilter, ids(&["b"]));
        assert_eq!(plan.nodes(), ids(&["b", "c"]));

        // forcing upstream of b overrides the replay
        let plan = InvalidationPlan::new(&dag, &invalidate(&dag, &["a"]), &ids(&["b"]));
        assert_eq!(plan.recompute, ids(&["a", "b", "c"]));
        assert!(plan.refilter.is_empty());

        assert!(InvalidationPlan::new(&dag, &BTreeSet::new(), &BTreeSet::new()).is_empty());
    }

    #[tokio::test]
    async fn purge_removes_artifacts_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dag = dag(dir.path());
        for id in ["a", "b", "c", "d"] {
            write_values(&dag.rules[id].output).await;
        }

        let plan = InvalidationPlan::new(&dag, &invalidate(&dag, &["b"]), &BTreeSet::new());
        purge(&dag, &plan).await.unwrap();
        assert!(dag.rules["a"].output.exists());
        assert!(!dag.rules["b"].output.exists());
        assert!(!dag.rules["c"].output.exists());
        assert!(dag.rules["d"].output.exists());

        purge(&dag, &plan).await.unwrap();
    }

    #[tokio::test]
    async fn purge_backs_up_refiltered_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = dag(dir.path());
        dag.rules.get_mut("b").unwrap().data_filter = Some(roi());
        let out = dag.rules["b"].output.clone();
        write_values(&out).await;

        let stale = stale_filters(&dag).await.unwrap();
        assert_eq!(stale, ids(&["b"]));
        purge(&dag, &InvalidationPlan::new(&dag, &BTreeSet::new(), &stale)).await.unwrap();
        assert!(!out.exists());
        assert!(backup_path(&out).exists());
    }

    #[tokio::test]
    async fn forced_upstream_drops_backup_of_filtered_rule() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = dag(dir.path());
        dag.rules.get_mut("b").unwrap().data_filter = Some(roi());
        let out = dag.rules["b"].output.clone();
        write_values(&out).await;
        write_values(&backup_path(&out)).await;

        let plan = InvalidationPlan::new(&dag, &invalidate(&dag, &["a"]), &BTreeSet::new());
        purge(&dag, &plan).await.unwrap();
        assert!(!out.exists());
        assert!(!backup_path(&out).exists());
    }

    #[tokio::test]
    async fn disabled_filter_restores_backup() {
        let dir = tempfile::tempdir().unwrap();
        let dag = dag(dir.path());
        let out = dag.rules["c"].output.clone();
        write_values(&backup_path(&out)).await;
        let original = std::fs::read(backup_path(&out)).unwrap();
        Artifact::Values(ValueArtifact {
            values: BTreeMap::from([("k".to_string(), json!([[1, null]]))]),
            metadata: json!({"c": {"data_filter": roi()}}),
        })
        .write(&out)
        .await
        .unwrap();

        let stale = stale_filters(&dag).await.unwrap();
        assert_eq!(stale, ids(&["c"]));
        purge(&dag, &InvalidationPlan::new(&dag, &BTreeSet::new(), &stale)).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), original);
        assert!(!backup_path(&out).exists());
    }

    #[tokio::test]
    async fn disabled_filter_under_a_forced_node_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let dag = dag(dir.path());
        let out = dag.rules["c"].output.clone();
        write_values(&out).await;
        write_values(&backup_path(&out)).await;

        let stale = stale_filters(&dag).await.unwrap();
        let plan = InvalidationPlan::new(&dag, &invalidate(&dag, &["b"]), &stale);
        assert_eq!(plan.recompute, ids(&["b", "c"]));
        purge(&dag, &plan).await.unwrap();
        assert!(!out.exists());
        assert!(!backup_path(&out).exists());
    }
}
