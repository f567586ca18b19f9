//! Deterministic on-disk layout of a run.
//!
//! Every path here is a pure function of `(root, workspace id, run id, node id)`;
//! recomputing a node's output path always yields the same value, which is
//! what makes the artifact cache work.

use std::path::{Path, PathBuf};

pub const RULE_DAG_FILE: &str = "rules.json";
pub const STATUS_FILE: &str = "status.json";
pub const AGGREGATE_FILE: &str = "aggregate.json";
pub const OUTPUT_FILE: &str = "output.json";
pub const NODE_METADATA_FILE: &str = "metadata.json";
pub const BACKUP_SUFFIX: &str = ".bak";
pub const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
    workspace_id: String,
    run_id: String,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>, workspace_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            workspace_id: workspace_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Same workspace and root, different run.
    pub fn with_run(&self, run_id: impl Into<String>) -> Self {
        Self::new(self.root.clone(), self.workspace_id.clone(), run_id)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(&self.workspace_id).join(&self.run_id)
    }

    pub fn node_dir(&self, node_id: &str) -> PathBuf {
        self.run_dir().join(node_id)
    }

    pub fn output_path(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join(OUTPUT_FILE)
    }

    pub fn node_metadata_path(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join(NODE_METADATA_FILE)
    }

    pub fn rule_dag_path(&self) -> PathBuf {
        self.run_dir().join(RULE_DAG_FILE)
    }

    pub fn status_path(&self) -> PathBuf {
        self.run_dir().join(STATUS_FILE)
    }

    pub fn aggregate_path(&self) -> PathBuf {
        self.run_dir().join(AGGREGATE_FILE)
    }
}

/// `<path>.bak`
pub fn backup_path(artifact: &Path) -> PathBuf {
    sibling_with_suffix(artifact, BACKUP_SUFFIX)
}

/// `<path>.lock`
pub fn lock_path(file: &Path) -> PathBuf {
    sibling_with_suffix(file, LOCK_SUFFIX)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
