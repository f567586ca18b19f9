//! Whole-run directory operations: copy with run-id rewriting, and delete.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use cairn_types::{CairnError, Result};

use crate::artifact::write_atomic;
use crate::layout::LOCK_SUFFIX;

/// Replace references to `old` with `new` in `value`.
///
/// A string (or object key) is rewritten when it equals `old` or contains it
/// as a whole `/`-separated path component; substrings are left alone.
pub fn rewrite_run_id(value: &Value, old: &str, new: &str) -> Value {
    match value {
        Value::String(s) => Value::String(rewrite_str(s, old, new)),
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite_run_id(v, old, new)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (rewrite_str(k, old, new), rewrite_run_id(v, old, new)))
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

fn rewrite_str(s: &str, old: &str, new: &str) -> String {
    if s == old {
        return new.to_string();
    }
    if !s.contains('/') {
        return s.to_string();
    }
    s.split('/')
        .map(|part| if part == old { new } else { part })
        .collect::<Vec<_>>()
        .join("/")
}

/// Copy the run directory `src` to `dst`, rewriting run-id references
/// inside every JSON file. Lock files are not copied.
///
/// Returns the number of JSON files rewritten.
pub async fn copy_run(src: &Path, dst: &Path, old_id: &str, new_id: &str) -> Result<usize> {
    if tokio::fs::try_exists(dst).await? {
        return Err(CairnError::Other(format!("{} already exists", dst.display())));
    }

    let mut rewritten = 0;
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from_dir, to_dir)) = pending.pop() {
        tokio::fs::create_dir_all(&to_dir).await?;
        let mut entries = tokio::fs::read_dir(&from_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let from = entry.path();
            let to = to_dir.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((from, to));
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(LOCK_SUFFIX) || name.contains(".tmp-") {
                continue;
            }

            let bytes = tokio::fs::read(&from).await?;
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(doc) => {
                    let doc = rewrite_run_id(&doc, old_id, new_id);
                    write_atomic(&to, serde_json::to_string_pretty(&doc)?.as_bytes()).await?;
                    rewritten += 1;
                }
                Err(_) => {
                    tokio::fs::write(&to, &bytes).await?;
                }
            }
        }
    }
    tracing::debug!(from = %src.display(), to = %dst.display(), rewritten, "Run copied");
    Ok(rewritten)
}

/// Remove a run directory and everything in it.
pub async fn delete_run(dir: &Path) -> Result<()> {
    tokio::fs::remove_dir_all(dir).await?;
    tracing::debug!(dir = %dir.display(), "Run deleted");
    Ok(())
}
