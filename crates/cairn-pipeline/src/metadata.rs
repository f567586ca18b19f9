//! Metadata fragments and the run-wide aggregate document.
//!
//! Every node writes its private fragment under its own node id; the shared
//! `"input"` section is extended node-to-node along edges but never retracted.
//! All merges are value-returning: no document is mutated in place across
//! node boundaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};

use cairn_types::Result;

use crate::artifact::write_atomic;
use crate::layout::lock_path;
use crate::lock::FileLock;

/// Name of the section inherited and extended along edges.
pub const INPUT_SECTION: &str = "input";

/// Recursively merge `overlay` onto `base`.
///
/// Nested objects merge key by key; any other value in `overlay` replaces
/// the one in `base`. `Null` overlays are ignored so an absent fragment
/// never erases data.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (_, Value::Null) => base.clone(),
        (Value::Object(b), Value::Object(o)) => {
            let mut merged = b.clone();
            for (key, value) in o {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}

/// Merge documents left to right; later documents win on collisions.
pub fn merge_all<'a>(docs: impl IntoIterator<Item = &'a Value>) -> Value {
    docs.into_iter()
        .fold(Value::Object(Map::new()), |acc, doc| deep_merge(&acc, doc))
}

/// Return `doc` with `fragment` stored under `node_id`.
pub fn with_fragment(doc: &Value, node_id: &str, fragment: &Value) -> Value {
    let mut scoped = Map::new();
    scoped.insert(node_id.to_string(), fragment.clone());
    deep_merge(doc, &Value::Object(scoped))
}

/// Return `doc` with `entry` added to the shared input section under `node_id`.
pub fn with_input(doc: &Value, node_id: &str, entry: &Value) -> Value {
    let mut inner = Map::new();
    inner.insert(node_id.to_string(), entry.clone());
    let mut outer = Map::new();
    outer.insert(INPUT_SECTION.to_string(), Value::Object(inner));
    deep_merge(doc, &Value::Object(outer))
}

/// Write the node-scoped per-function metadata file `{node_id: fragment}`.
pub async fn write_node_metadata(path: &Path, node_id: &str, fragment: &Value) -> Result<()> {
    let doc = with_fragment(&Value::Object(Map::new()), node_id, fragment);
    write_atomic(path, serde_json::to_string_pretty(&doc)?.as_bytes()).await
}

// ---------------------------------------------------------------------------
// Aggregate document
// ---------------------------------------------------------------------------

/// Serialized read-merge-write access to a run's aggregate document.
#[derive(Debug, Clone)]
pub struct AggregateWriter {
    path: PathBuf,
    timeout: Duration,
}

impl AggregateWriter {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document, or an empty object if none was written yet.
    pub async fn load(&self) -> Result<Value> {
        load_document(&self.path).await
    }

    /// Merge `doc` into the aggregate under the cross-process lock.
    pub async fn merge(&self, doc: &Value) -> Result<Value> {
        let _lock = FileLock::acquire(&lock_path(&self.path), self.timeout).await?;
        let current = load_document(&self.path).await?;
        let merged = deep_merge(&current, doc);
        write_atomic(&self.path, serde_json::to_string_pretty(&merged)?.as_bytes()).await?;
        tracing::debug!(path = %self.path.display(), "Aggregate metadata merged");
        Ok(merged)
    }
}

async fn load_document(path: &Path) -> Result<Value> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
        Err(e) => Err(e.into()),
    }
}
